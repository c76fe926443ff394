//! Time lanes: the per-subject timelines a shot is authored in.
//!
//! A shot is divided into named steps with duration expressions; every lane spans
//! the same step partition. Lanes hold *blocks* - a value plus an integer span in
//! steps. Digital lanes carry booleans or boolean expressions, analog lanes carry
//! expressions or ramps that interpolate between their neighbors, camera lanes
//! mark the steps during which a picture is taken.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CompilationError;
use crate::expression::Expression;

/// A value spanning a whole number of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block<V> {
    pub value: V,
    pub span: usize,
}

/// A finite, ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lane<V> {
    blocks: Vec<Block<V>>,
}

impl<V> Lane<V> {
    /// Builds a lane from explicit blocks. Every span must be at least one step.
    pub fn new(blocks: Vec<Block<V>>) -> Result<Lane<V>, CompilationError> {
        if blocks.iter().any(|block| block.span == 0) {
            return Err(CompilationError::InvalidValue(
                "lane blocks must span at least one step".to_string(),
            ));
        }
        Ok(Lane { blocks })
    }

    pub fn blocks(&self) -> &[Block<V>] {
        &self.blocks
    }

    pub fn total_span(&self) -> usize {
        self.blocks.iter().map(|block| block.span).sum()
    }

    /// Iterates blocks as `(start_step, stop_step, value)`.
    pub fn block_bounds(&self) -> impl Iterator<Item = (usize, usize, &V)> {
        self.blocks.iter().scan(0usize, |start, block| {
            let begin = *start;
            *start += block.span;
            Some((begin, *start, &block.value))
        })
    }
}

impl<V: PartialEq> Lane<V> {
    /// Builds a lane from one value per step, merging equal consecutive values
    /// into a single block.
    pub fn from_step_values(values: impl IntoIterator<Item = V>) -> Lane<V> {
        let mut blocks: Vec<Block<V>> = Vec::new();
        for value in values {
            match blocks.last_mut() {
                Some(last) if last.value == value => last.span += 1,
                _ => blocks.push(Block { value, span: 1 }),
            }
        }
        Lane { blocks }
    }
}

/// Value of one digital lane block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DigitalBlockValue {
    Constant(bool),
    Expression(Expression),
}

impl From<bool> for DigitalBlockValue {
    fn from(value: bool) -> DigitalBlockValue {
        DigitalBlockValue::Constant(value)
    }
}

impl From<Expression> for DigitalBlockValue {
    fn from(value: Expression) -> DigitalBlockValue {
        DigitalBlockValue::Expression(value)
    }
}

/// Value of one analog lane block. A `Ramp` interpolates linearly from the final
/// value of the previous block to the initial value of the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalogBlockValue {
    Expression(Expression),
    Ramp,
}

impl From<Expression> for AnalogBlockValue {
    fn from(value: Expression) -> AnalogBlockValue {
        AnalogBlockValue::Expression(value)
    }
}

/// Value of one camera lane block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CameraBlockValue {
    Idle,
    TakePicture { label: String },
}

pub type DigitalTimeLane = Lane<DigitalBlockValue>;
pub type AnalogTimeLane = Lane<AnalogBlockValue>;
pub type CameraTimeLane = Lane<CameraBlockValue>;

/// A lane of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TimeLane {
    Digital(DigitalTimeLane),
    Analog(AnalogTimeLane),
    Camera(CameraTimeLane),
}

impl TimeLane {
    pub fn total_span(&self) -> usize {
        match self {
            TimeLane::Digital(lane) => lane.total_span(),
            TimeLane::Analog(lane) => lane.total_span(),
            TimeLane::Camera(lane) => lane.total_span(),
        }
    }
}

/// The shared step partition of a shot plus its lanes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeLanes {
    step_names: Vec<String>,
    step_durations: Vec<Expression>,
    lanes: IndexMap<String, TimeLane>,
}

impl TimeLanes {
    /// Builds and validates the container: step names and durations must have the
    /// same length, and every lane must cover all steps.
    pub fn new(
        step_names: Vec<String>,
        step_durations: Vec<Expression>,
        lanes: IndexMap<String, TimeLane>,
    ) -> Result<TimeLanes, CompilationError> {
        if step_names.len() != step_durations.len() {
            return Err(CompilationError::InvalidValue(format!(
                "there are {} step names but {} step durations",
                step_names.len(),
                step_durations.len()
            )));
        }
        if step_names.is_empty() {
            return Err(CompilationError::InvalidValue(
                "a shot must have at least one step".to_string(),
            ));
        }
        for (name, lane) in &lanes {
            if lane.total_span() != step_names.len() {
                return Err(CompilationError::InvalidValue(format!(
                    "lane \"{name}\" spans {} steps but the shot has {}",
                    lane.total_span(),
                    step_names.len()
                )));
            }
        }
        Ok(TimeLanes {
            step_names,
            step_durations,
            lanes,
        })
    }

    pub fn number_steps(&self) -> usize {
        self.step_names.len()
    }

    pub fn step_names(&self) -> &[String] {
        &self.step_names
    }

    pub fn step_durations(&self) -> &[Expression] {
        &self.step_durations
    }

    pub fn lanes(&self) -> &IndexMap<String, TimeLane> {
        &self.lanes
    }

    pub fn lane(&self, name: &str) -> Option<&TimeLane> {
        self.lanes.get(name)
    }
}
