//! The declarative channel-output tree and its evaluator.
//!
//! Channels constitute the unit of interaction between a sequencer and the hardware
//! it drives. What a channel emits is described by a [`ChannelOutput`] tree: a
//! constant, the values of a lane, the trigger of another device, or a functional
//! combination of these (calibration, timing shifts, pulse broadening, logical
//! negation). The tree is purely declarative; evaluation happens against a
//! [`ShotContext`] at a requested time step.
//!
//! ## Evaluation contract
//!
//! `evaluate(time_step, prepend, append, shot)` returns a [`DimensionedSeries`] of
//! exactly `number_ticks(shot) + prepend + append` samples. The `prepend`/`append`
//! tick counts exist so that [`ChannelOutput::Advance`] and [`ChannelOutput::Delay`]
//! can shift their input without changing its length: the device compiler first asks
//! every channel for its worst-case shift ([`ChannelOutput::max_advance_and_delay`])
//! and then evaluates all channels with that common padding.
//!
//! New output kinds are added by extending the sum type; every `match` below is
//! exhaustive on purpose so the compiler flags each site to update.

use serde::{Deserialize, Serialize};

use crate::error::{CompilationError, EvaluationError};
use crate::expression::{evaluate_scalar, Expression};
use crate::instruction::{ramp, ChannelSamples, TimedInstruction};
use crate::lane::{compile_analog_lane, compile_camera_lane, compile_digital_lane};
use crate::parameter::Value;
use crate::shot::ShotContext;
use crate::timing::{duration_to_ticks, Time, TimeStep};
use crate::timelane::TimeLane;
use crate::units::{BaseUnit, Dimension, UnitRegistry};

/// A series of values to output on a channel, with the base unit they are
/// expressed in (`None` for dimensionless and for digital series).
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionedSeries {
    pub values: ChannelSamples,
    pub unit: Option<BaseUnit>,
}

/// Declarative description of what a channel outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelOutput {
    /// A time-independent expression broadcast over the whole shot.
    Constant { value: Expression },
    /// The compiled values of a named lane; `default` applies when the shot does
    /// not define the lane.
    LaneValues {
        lane: String,
        default: Option<Box<ChannelOutput>>,
    },
    /// The waveform that drives the named device's sequencer, synthesized from
    /// that device's trigger policy; `default` applies when the device is not
    /// part of the sequence.
    DeviceTrigger {
        device_name: String,
        default: Option<Box<ChannelOutput>>,
    },
    /// Piecewise-linear interpolation through measured `(input, output)` points.
    CalibratedAnalogMapping {
        input: Box<ChannelOutput>,
        input_units: Option<String>,
        output_units: Option<String>,
        measured_data_points: Vec<(f64, f64)>,
    },
    /// Shifts the input earlier by a duration, consuming prepended ticks.
    Advance {
        input: Box<ChannelOutput>,
        advance: Expression,
    },
    /// Shifts the input later by a duration, consuming appended ticks.
    Delay {
        input: Box<ChannelOutput>,
        delay: Expression,
    },
    /// Opens boolean pulses early: the output at tick `t` is the OR of the input
    /// over `[t, t + width]`, clipped at the series boundaries.
    BroadenLeft {
        input: Box<ChannelOutput>,
        width: Expression,
    },
    /// Pointwise logical NOT of a boolean input.
    NotGate { input: Box<ChannelOutput> },
}

fn invalid_value(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidValue(message))
}

fn invalid_type(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidType(message))
}

fn invalid_dim(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidDimensionality(message))
}

/// Evaluates a duration expression (e.g. the amount of an [`ChannelOutput::Advance`])
/// to an exact time. Plain zero is accepted; anything else must carry a time unit.
fn evaluate_duration(
    expression: &Expression,
    shot: &ShotContext,
    what: &str,
) -> Result<Time, EvaluationError> {
    let value = evaluate_scalar(expression, shot.parameters(), shot.registry())?;
    let seconds = match value {
        Value::Quantity { magnitude, unit } if unit.dimension() == Dimension::TIME => magnitude,
        Value::Integer(0) => 0.0,
        Value::Float(v) if v == 0.0 => 0.0,
        other => {
            return Err(invalid_dim(format!(
                "{what} must be a duration, got {other}"
            )))
        }
    };
    if seconds < 0.0 {
        return Err(invalid_value(format!("{what} is negative: {seconds} s")));
    }
    Time::from_secs(seconds).map_err(EvaluationError::Compilation)
}

/// Pads an instruction with repeats of its first sample on the left and its last
/// sample on the right.
fn pad<T: crate::instruction::Sample>(
    instr: TimedInstruction<T>,
    prepend: usize,
    append: usize,
) -> Result<TimedInstruction<T>, EvaluationError> {
    if prepend == 0 && append == 0 {
        return Ok(instr);
    }
    let first = instr
        .first_value()
        .ok_or_else(|| invalid_value("cannot pad an empty instruction".to_string()))?;
    let last = instr.last_value().expect("non-empty");
    Ok(TimedInstruction::concat([
        TimedInstruction::constant(first, prepend),
        instr,
        TimedInstruction::constant(last, append),
    ]))
}

impl ChannelOutput {
    /// Worst-case ticks of advance and delay this output requests on its inputs,
    /// including its own contribution.
    pub fn max_advance_and_delay(
        &self,
        time_step: TimeStep,
        shot: &ShotContext,
    ) -> Result<(usize, usize), EvaluationError> {
        match self {
            ChannelOutput::Constant { .. } => Ok((0, 0)),
            ChannelOutput::LaneValues { default, .. }
            | ChannelOutput::DeviceTrigger { default, .. } => match default {
                Some(default) => default.max_advance_and_delay(time_step, shot),
                None => Ok((0, 0)),
            },
            ChannelOutput::CalibratedAnalogMapping { input, .. }
            | ChannelOutput::BroadenLeft { input, .. }
            | ChannelOutput::NotGate { input } => input.max_advance_and_delay(time_step, shot),
            ChannelOutput::Advance { input, advance } => {
                let duration = evaluate_duration(advance, shot, "the advance amount")?;
                let ticks = duration_to_ticks(duration, time_step);
                let (input_advance, input_delay) = input.max_advance_and_delay(time_step, shot)?;
                Ok((input_advance + ticks, input_delay))
            }
            ChannelOutput::Delay { input, delay } => {
                let duration = evaluate_duration(delay, shot, "the delay amount")?;
                let ticks = duration_to_ticks(duration, time_step);
                let (input_advance, input_delay) = input.max_advance_and_delay(time_step, shot)?;
                Ok((input_advance, input_delay + ticks))
            }
        }
    }

    /// Evaluates the output to a series of `number_ticks(shot) + prepend + append`
    /// samples at `time_step`.
    pub fn evaluate(
        &self,
        time_step: TimeStep,
        prepend: usize,
        append: usize,
        shot: &ShotContext,
    ) -> Result<DimensionedSeries, EvaluationError> {
        match self {
            ChannelOutput::Constant { value } => {
                let length = shot.number_ticks(time_step) + prepend + append;
                match evaluate_scalar(value, shot.parameters(), shot.registry())? {
                    Value::Boolean(state) => Ok(DimensionedSeries {
                        values: ChannelSamples::Digital(TimedInstruction::constant(state, length)),
                        unit: None,
                    }),
                    Value::Integer(v) => Ok(DimensionedSeries {
                        values: ChannelSamples::Analog(TimedInstruction::constant(
                            v as f64, length,
                        )),
                        unit: None,
                    }),
                    Value::Float(v) => Ok(DimensionedSeries {
                        values: ChannelSamples::Analog(TimedInstruction::constant(v, length)),
                        unit: None,
                    }),
                    Value::Quantity { magnitude, unit } => Ok(DimensionedSeries {
                        values: ChannelSamples::Analog(TimedInstruction::constant(
                            magnitude, length,
                        )),
                        unit: Some(unit),
                    }),
                }
            }
            ChannelOutput::LaneValues { lane, default } => {
                match shot.time_lanes().lane(lane) {
                    Some(TimeLane::Digital(digital_lane)) => {
                        let instr = compile_digital_lane(
                            digital_lane,
                            shot.step_bounds(),
                            time_step,
                            shot.parameters(),
                            shot.registry(),
                        )?;
                        Ok(DimensionedSeries {
                            values: ChannelSamples::Digital(pad(instr, prepend, append)?),
                            unit: None,
                        })
                    }
                    Some(TimeLane::Analog(analog_lane)) => {
                        let series = compile_analog_lane(
                            analog_lane,
                            shot.step_bounds(),
                            time_step,
                            shot.parameters(),
                            shot.registry(),
                        )?;
                        Ok(DimensionedSeries {
                            values: ChannelSamples::Analog(pad(
                                series.values,
                                prepend,
                                append,
                            )?),
                            unit: series.unit,
                        })
                    }
                    Some(TimeLane::Camera(camera_lane)) => {
                        let instr =
                            compile_camera_lane(camera_lane, shot.step_bounds(), time_step)?;
                        Ok(DimensionedSeries {
                            values: ChannelSamples::Digital(pad(instr, prepend, append)?),
                            unit: None,
                        })
                    }
                    None => match default {
                        Some(default) => default.evaluate(time_step, prepend, append, shot),
                        None => Err(invalid_value(format!(
                            "the shot does not define a lane named \"{lane}\""
                        ))),
                    },
                }
            }
            ChannelOutput::DeviceTrigger {
                device_name,
                default,
            } => match shot.device_configuration(device_name) {
                Some(configuration) => {
                    let instr = crate::device::trigger_waveform(
                        device_name,
                        configuration,
                        time_step,
                        prepend,
                        append,
                        shot,
                    )?;
                    Ok(DimensionedSeries {
                        values: ChannelSamples::Digital(instr),
                        unit: None,
                    })
                }
                None => match default {
                    Some(default) => default.evaluate(time_step, prepend, append, shot),
                    None => Err(invalid_value(format!(
                        "the sequence does not contain a device named \"{device_name}\""
                    ))),
                },
            },
            ChannelOutput::CalibratedAnalogMapping {
                input,
                input_units,
                output_units,
                measured_data_points,
            } => {
                let series = input.evaluate(time_step, prepend, append, shot)?;
                let values = match series.values {
                    ChannelSamples::Analog(values) => values,
                    ChannelSamples::Digital(_) => {
                        return Err(invalid_type(
                            "a calibrated mapping requires an analog input".to_string(),
                        ))
                    }
                };
                let calibration = Calibration::new(
                    measured_data_points,
                    input_units.as_deref(),
                    output_units.as_deref(),
                    shot.registry(),
                )?;
                if series.unit != calibration.input_unit {
                    return Err(invalid_dim(format!(
                        "cannot apply a calibration expecting {} to values in {}",
                        display_unit(calibration.input_unit),
                        display_unit(series.unit),
                    )));
                }
                Ok(DimensionedSeries {
                    values: ChannelSamples::Analog(calibration.apply(&values)),
                    unit: calibration.output_unit,
                })
            }
            ChannelOutput::Advance { input, advance } => {
                let duration = evaluate_duration(advance, shot, "the advance amount")?;
                let ticks = duration_to_ticks(duration, time_step);
                if ticks > prepend {
                    return Err(invalid_value(format!(
                        "cannot advance by {ticks} ticks when only {prepend} are available"
                    )));
                }
                input.evaluate(time_step, prepend - ticks, append + ticks, shot)
            }
            ChannelOutput::Delay { input, delay } => {
                let duration = evaluate_duration(delay, shot, "the delay amount")?;
                let ticks = duration_to_ticks(duration, time_step);
                if ticks > append {
                    return Err(invalid_value(format!(
                        "cannot delay by {ticks} ticks when only {append} are available"
                    )));
                }
                input.evaluate(time_step, prepend + ticks, append - ticks, shot)
            }
            ChannelOutput::BroadenLeft { input, width } => {
                let duration = evaluate_duration(width, shot, "the broadening width")?;
                let ticks = duration_to_ticks(duration, time_step);
                let series = input.evaluate(time_step, prepend, append, shot)?;
                match series.values {
                    ChannelSamples::Digital(values) => Ok(DimensionedSeries {
                        values: ChannelSamples::Digital(broaden_left(&values, ticks)),
                        unit: None,
                    }),
                    ChannelSamples::Analog(_) => Err(invalid_type(
                        "broaden-left requires a boolean input".to_string(),
                    )),
                }
            }
            ChannelOutput::NotGate { input } => {
                let series = input.evaluate(time_step, prepend, append, shot)?;
                match series.values {
                    ChannelSamples::Digital(values) => Ok(DimensionedSeries {
                        values: ChannelSamples::Digital(values.not()),
                        unit: None,
                    }),
                    ChannelSamples::Analog(_) => Err(invalid_type(
                        "a NOT gate requires a boolean input".to_string(),
                    )),
                }
            }
        }
    }
}

fn display_unit(unit: Option<BaseUnit>) -> String {
    match unit {
        Some(unit) => unit.to_string(),
        None => "dimensionless".to_string(),
    }
}

// ==================== Piecewise-linear calibration ====================

struct Calibration {
    input_points: Vec<f64>,
    output_points: Vec<f64>,
    input_unit: Option<BaseUnit>,
    output_unit: Option<BaseUnit>,
}

impl Calibration {
    fn new(
        measured_data_points: &[(f64, f64)],
        input_units: Option<&str>,
        output_units: Option<&str>,
        registry: &UnitRegistry,
    ) -> Result<Calibration, EvaluationError> {
        if measured_data_points.len() < 2 {
            return Err(invalid_value(
                "a calibration must have at least 2 data points".to_string(),
            ));
        }
        let convert = |value: f64, unit: Option<&str>| -> Result<(f64, Option<BaseUnit>), EvaluationError> {
            match unit {
                None => Ok((value, None)),
                Some(name) => {
                    let def = registry.unit(name).map_err(EvaluationError::Compilation)?;
                    Ok(registry.to_base(value, def))
                }
            }
        };
        let mut points = Vec::with_capacity(measured_data_points.len());
        let mut input_unit = None;
        let mut output_unit = None;
        for &(x, y) in measured_data_points {
            let (x, xu) = convert(x, input_units)?;
            let (y, yu) = convert(y, output_units)?;
            input_unit = xu;
            output_unit = yu;
            points.push((x, y));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Calibration {
            input_points: points.iter().map(|&(x, _)| x).collect(),
            output_points: points.iter().map(|&(_, y)| y).collect(),
            input_unit,
            output_unit,
        })
    }

    /// Clamped piecewise-linear interpolation.
    fn interp(&self, value: f64) -> f64 {
        let n = self.input_points.len();
        if value <= self.input_points[0] {
            return self.output_points[0];
        }
        if value >= self.input_points[n - 1] {
            return self.output_points[n - 1];
        }
        let idx = self.input_points.partition_point(|&x| x <= value);
        let (x0, x1) = (self.input_points[idx - 1], self.input_points[idx]);
        let (y0, y1) = (self.output_points[idx - 1], self.output_points[idx]);
        y0 + (y1 - y0) * (value - x0) / (x1 - x0)
    }

    fn apply(&self, instr: &TimedInstruction<f64>) -> TimedInstruction<f64> {
        match instr {
            TimedInstruction::Pattern(p) => TimedInstruction::pattern(
                p.samples().iter().map(|&v| self.interp(v)).collect::<Vec<f64>>(),
            ),
            TimedInstruction::Concatenated(c) => TimedInstruction::concat(
                c.children().iter().map(|child| self.apply(child)).collect::<Vec<_>>(),
            ),
            TimedInstruction::Repeated(r) => self.apply(r.child()).repeat(r.count()),
            TimedInstruction::Ramp(r) => self.apply_ramp(r.start(), r.stop(), instr.len()),
        }
    }

    /// A ramp maps onto a concatenation of sub-ramps, split where the ramp crosses
    /// a calibration breakpoint; the clamped regions outside the calibrated range
    /// come out flat.
    fn apply_ramp(&self, start: f64, stop: f64, len: usize) -> TimedInstruction<f64> {
        if start == stop {
            return TimedInstruction::constant(self.interp(start), len);
        }
        let value_at = |i: usize| start + (stop - start) * i as f64 / len as f64;
        let tick_of = |x: f64| len as f64 * (x - start) / (stop - start);
        let low = start.min(stop);
        let high = start.max(stop);

        let mut marks = vec![0usize];
        let mut cuts: Vec<f64> = self
            .input_points
            .iter()
            .filter(|&&x| x > low && x < high)
            .map(|&x| tick_of(x))
            .collect();
        cuts.sort_by(f64::total_cmp);
        for cut in cuts {
            let tick = cut.ceil().clamp(0.0, len as f64) as usize;
            if tick > *marks.last().expect("non-empty") && tick < len {
                marks.push(tick);
            }
        }
        marks.push(len);

        let mut parts = Vec::new();
        for pair in marks.windows(2) {
            let (section_start, section_stop) = (pair[0], pair[1]);
            let section_len = section_stop - section_start;
            if section_len == 0 {
                continue;
            }
            let y0 = self.interp(value_at(section_start));
            if section_len == 1 {
                parts.push(TimedInstruction::pattern([y0]));
                continue;
            }
            let y1 = self.interp(value_at(section_stop - 1));
            // Extrapolate the endpoint so samples 0..section_len hit y0..y1 exactly
            let extrapolated = y0 + section_len as f64 * (y1 - y0) / (section_len as f64 - 1.0);
            parts.push(ramp(y0, extrapolated, section_len));
        }
        TimedInstruction::concat(parts)
    }
}

// ==================== Pulse broadening ====================

fn push_run(runs: &mut Vec<(bool, usize)>, state: bool, length: usize) {
    if length == 0 {
        return;
    }
    match runs.last_mut() {
        Some((last_state, last_length)) if *last_state == state => *last_length += length,
        _ => runs.push((state, length)),
    }
}

fn collect_runs(instr: &TimedInstruction<bool>, runs: &mut Vec<(bool, usize)>) {
    match instr {
        TimedInstruction::Pattern(p) => {
            for &sample in p.samples() {
                push_run(runs, sample, 1);
            }
        }
        TimedInstruction::Concatenated(c) => {
            for child in c.children() {
                collect_runs(child, runs);
            }
        }
        TimedInstruction::Repeated(r) => {
            if let Some(state) = r.child().constant_value() {
                push_run(runs, state, instr.len());
            } else {
                for _ in 0..r.count() {
                    collect_runs(r.child(), runs);
                }
            }
        }
        TimedInstruction::Ramp(_) => unreachable!("boolean instructions have no ramps"),
    }
}

/// Extends every high interval to open `width` ticks early, clipped at the series
/// start: the output at tick `t` is the OR of the input over `[t, t + width]`.
fn broaden_left(instr: &TimedInstruction<bool>, width: usize) -> TimedInstruction<bool> {
    if width == 0 || instr.is_empty() {
        return instr.clone();
    }
    let mut runs = Vec::new();
    collect_runs(instr, &mut runs);

    // High intervals with their start pulled left
    let mut intervals: Vec<(usize, usize)> = Vec::new();
    let mut position: usize = 0;
    for (state, length) in runs {
        if state {
            let start = position.saturating_sub(width);
            let stop = position + length;
            match intervals.last_mut() {
                Some((_, last_stop)) if *last_stop >= start => {
                    *last_stop = (*last_stop).max(stop)
                }
                _ => intervals.push((start, stop)),
            }
        }
        position += length;
    }
    let total = position;

    let mut parts = Vec::new();
    let mut cursor = 0;
    for (start, stop) in intervals {
        parts.push(TimedInstruction::constant(false, start - cursor));
        parts.push(TimedInstruction::constant(true, stop - start));
        cursor = stop;
    }
    parts.push(TimedInstruction::constant(false, total - cursor));
    TimedInstruction::concat(parts)
}

// Keep the round-trip property of the declarative tree visible to serde users
impl ChannelOutput {
    /// Convenience constructor for a constant output.
    pub fn constant(value: Expression) -> ChannelOutput {
        ChannelOutput::Constant { value }
    }

    /// Convenience constructor for lane-driven output without a default.
    pub fn lane(name: impl Into<String>) -> ChannelOutput {
        ChannelOutput::LaneValues {
            lane: name.into(),
            default: None,
        }
    }

    /// Names of the devices whose triggers this output (transitively) requests.
    pub fn trigger_dependencies(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_trigger_dependencies(&mut names);
        names
    }

    fn collect_trigger_dependencies<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            ChannelOutput::Constant { .. } => {}
            ChannelOutput::LaneValues { default, .. } => {
                if let Some(default) = default {
                    default.collect_trigger_dependencies(names);
                }
            }
            ChannelOutput::DeviceTrigger {
                device_name,
                default,
            } => {
                names.push(device_name);
                if let Some(default) = default {
                    default.collect_trigger_dependencies(names);
                }
            }
            ChannelOutput::CalibratedAnalogMapping { input, .. }
            | ChannelOutput::Advance { input, .. }
            | ChannelOutput::Delay { input, .. }
            | ChannelOutput::BroadenLeft { input, .. }
            | ChannelOutput::NotGate { input } => input.collect_trigger_dependencies(names),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    mod broaden {
        use super::super::*;

        fn pattern(bits: &[bool]) -> TimedInstruction<bool> {
            TimedInstruction::pattern(bits.to_vec())
        }

        #[test]
        fn pulse_opens_early_and_clips_at_the_start() {
            let input = pattern(&[false, false, true, false]);
            let result = broaden_left(&input, 2);
            assert_eq!(result.to_array().to_vec(), vec![true, true, true, false]);
        }

        #[test]
        fn zero_width_is_the_identity() {
            let input = pattern(&[false, true, false]);
            assert_eq!(broaden_left(&input, 0), input);
        }

        #[test]
        fn overlapping_extensions_merge() {
            let input = pattern(&[false, false, true, false, false, true, false]);
            let result = broaden_left(&input, 2);
            assert_eq!(
                result.to_array().to_vec(),
                vec![true, true, true, true, true, true, false]
            );
        }

        #[test]
        fn compressed_input_stays_compressed() {
            let input = TimedInstruction::concat([
                TimedInstruction::constant(false, 1_000_000),
                TimedInstruction::constant(true, 10),
                TimedInstruction::constant(false, 1_000_000),
            ]);
            let result = broaden_left(&input, 100);
            assert_eq!(
                result,
                TimedInstruction::concat([
                    TimedInstruction::constant(false, 999_900),
                    TimedInstruction::constant(true, 110),
                    TimedInstruction::constant(false, 1_000_000),
                ])
            );
        }
    }

    mod calibration {
        use super::super::*;
        use float_cmp::assert_approx_eq;

        fn simple() -> Calibration {
            Calibration::new(
                &[(0.0, 0.0), (1.0, 10.0), (2.0, 40.0)],
                None,
                None,
                &UnitRegistry::new(),
            )
            .unwrap()
        }

        #[test]
        fn interpolation_clamps_at_the_edges() {
            let cal = simple();
            assert_approx_eq!(f64, cal.interp(-5.0), 0.0);
            assert_approx_eq!(f64, cal.interp(0.5), 5.0);
            assert_approx_eq!(f64, cal.interp(1.5), 25.0);
            assert_approx_eq!(f64, cal.interp(5.0), 40.0);
        }

        #[test]
        fn points_are_sorted_on_construction() {
            let cal = Calibration::new(
                &[(2.0, 40.0), (0.0, 0.0), (1.0, 10.0)],
                None,
                None,
                &UnitRegistry::new(),
            )
            .unwrap();
            assert_approx_eq!(f64, cal.interp(0.5), 5.0);
        }

        #[test]
        fn ramp_within_one_segment_stays_a_ramp() {
            let cal = simple();
            let result = cal.apply(&ramp(0.0, 1.0, 10));
            match &result {
                TimedInstruction::Ramp(_) => {}
                other => panic!("expected a ramp, got {other:?}"),
            }
            for i in 0..10 {
                let input = i as f64 / 10.0;
                assert_approx_eq!(f64, result.value_at(i), cal.interp(input));
            }
        }

        #[test]
        fn ramp_across_breakpoints_splits_but_matches_samples() {
            let cal = simple();
            let input = ramp(0.0, 2.0, 20);
            let result = cal.apply(&input);
            assert_eq!(result.len(), 20);
            for i in 0..20 {
                assert_approx_eq!(
                    f64,
                    result.value_at(i),
                    cal.interp(input.value_at(i)),
                    epsilon = 1e-9
                );
            }
        }

        #[test]
        fn descending_ramp_matches_samples() {
            let cal = simple();
            let input = ramp(2.0, 0.0, 20);
            let result = cal.apply(&input);
            assert_eq!(result.len(), 20);
            for i in 0..20 {
                assert_approx_eq!(
                    f64,
                    result.value_at(i),
                    cal.interp(input.value_at(i)),
                    epsilon = 1e-9
                );
            }
        }

        #[test]
        fn ramp_exceeding_the_range_clamps_flat() {
            let cal = simple();
            let input = ramp(-1.0, 3.0, 40);
            let result = cal.apply(&input);
            assert_eq!(result.len(), 40);
            for i in 0..40 {
                assert_approx_eq!(
                    f64,
                    result.value_at(i),
                    cal.interp(input.value_at(i)),
                    epsilon = 1e-9
                );
            }
        }

        #[test]
        fn too_few_points_are_rejected() {
            let result = Calibration::new(&[(0.0, 1.0)], None, None, &UnitRegistry::new());
            assert!(result.is_err());
        }

        #[test]
        fn units_convert_to_base() {
            let cal = Calibration::new(
                &[(0.0, 0.0), (1000.0, 2000.0)],
                Some("MHz"),
                Some("mV"),
                &UnitRegistry::new(),
            )
            .unwrap();
            assert_eq!(cal.input_unit.unwrap().to_string(), "Hz");
            assert_eq!(cal.output_unit.unwrap().to_string(), "V");
            // Halfway through the calibrated range: 500 MHz maps to 1 V
            assert_approx_eq!(f64, cal.interp(5e8), 1.0);
        }
    }

    mod serde_round_trip {
        use super::super::*;

        #[test]
        fn channel_output_round_trips_through_the_tagged_form() {
            let output = ChannelOutput::Advance {
                input: Box::new(ChannelOutput::CalibratedAnalogMapping {
                    input: Box::new(ChannelOutput::LaneValues {
                        lane: "626 \\ MOT \\ power".to_string(),
                        default: Some(Box::new(ChannelOutput::Constant {
                            value: Expression::new("0 dB"),
                        })),
                    }),
                    input_units: Some("dB".to_string()),
                    output_units: Some("V".to_string()),
                    measured_data_points: vec![(-40.0, 0.0), (0.0, 1.5)],
                }),
                advance: Expression::new("2 us"),
            };
            let json = serde_json::to_string(&output).unwrap();
            let back: ChannelOutput = serde_json::from_str(&json).unwrap();
            assert_eq!(back, output);
        }

        #[test]
        fn every_variant_round_trips() {
            let variants = vec![
                ChannelOutput::constant(Expression::new("Disabled")),
                ChannelOutput::lane("shutter"),
                ChannelOutput::DeviceTrigger {
                    device_name: "ni6738".to_string(),
                    default: None,
                },
                ChannelOutput::NotGate {
                    input: Box::new(ChannelOutput::lane("shutter")),
                },
                ChannelOutput::BroadenLeft {
                    input: Box::new(ChannelOutput::lane("shutter")),
                    width: Expression::new("20 ms"),
                },
                ChannelOutput::Delay {
                    input: Box::new(ChannelOutput::lane("aom")),
                    delay: Expression::new("1 us"),
                },
            ];
            for variant in variants {
                let json = serde_json::to_string(&variant).unwrap();
                let back: ChannelOutput = serde_json::from_str(&json).unwrap();
                assert_eq!(back, variant);
            }
        }
    }

    #[test]
    fn trigger_dependencies_are_collected() {
        let output = ChannelOutput::NotGate {
            input: Box::new(ChannelOutput::DeviceTrigger {
                device_name: "camera streamer".to_string(),
                default: None,
            }),
        };
        assert_eq!(output.trigger_dependencies(), vec!["camera streamer"]);
    }
}
