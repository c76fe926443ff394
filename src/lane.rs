//! Lane compilers: from authored blocks to tick-exact instructions.
//!
//! Block boundaries are the exact prefix sums of the step durations; each block
//! compiles to `number_ticks(t_begin, t_end, Δt)` samples, so the concatenated lane
//! always has exactly `number_ticks(0, total, Δt)` ticks regardless of where the
//! boundaries fall on the grid.
//!
//! Analog lanes compile in two passes. Expression blocks evaluate first, keeping
//! their initial and final magnitudes; ramp blocks then interpolate from the final
//! value of the previous block to the initial value of the next one, with the
//! endpoints adjusted when the block boundaries are off the tick grid.

use log::trace;

use crate::error::{CompilationError, EvaluationError};
use crate::expression::compile::{compile_expression, CompilationContext};
use crate::expression::time_dependent::{
    evaluate_time_dependent, evaluate_time_dependent_digital, EvaluationResult,
};
use crate::instruction::{ramp, TimedInstruction};
use crate::parameter::{ParameterSchema, Parameters};
use crate::timing::{number_ticks, start_tick, stop_tick, Time, TimeStep};
use crate::timelane::{
    AnalogBlockValue, AnalogTimeLane, CameraBlockValue, CameraTimeLane, DigitalBlockValue,
    DigitalTimeLane,
};
use crate::units::{BaseUnit, UnitRegistry};

/// An analog instruction together with the base unit of its samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogSeries {
    pub values: TimedInstruction<f64>,
    pub unit: Option<BaseUnit>,
}

fn invalid_value(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidValue(message))
}

fn check_bounds(total_span: usize, step_bounds: &[Time]) -> Result<(), EvaluationError> {
    if step_bounds.len() != total_span + 1 {
        return Err(invalid_value(format!(
            "lane spans {total_span} steps but {} step bounds were provided",
            step_bounds.len()
        )));
    }
    Ok(())
}

/// Compiles a digital lane into a boolean instruction covering its full extent.
pub fn compile_digital_lane(
    lane: &DigitalTimeLane,
    step_bounds: &[Time],
    time_step: TimeStep,
    parameters: &Parameters,
    registry: &UnitRegistry,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    check_bounds(lane.total_span(), step_bounds)?;
    let schema = ParameterSchema::of_constants(parameters);
    let ctx = CompilationContext {
        schema: &schema,
        registry,
    };
    let mut parts = Vec::new();
    for (start_step, stop_step, value) in lane.block_bounds() {
        let t_begin = step_bounds[start_step];
        let t_end = step_bounds[stop_step];
        let length = number_ticks(t_begin, t_end, time_step);
        match value {
            DigitalBlockValue::Constant(state) => {
                parts.push(TimedInstruction::constant(*state, length));
            }
            DigitalBlockValue::Expression(expression) => {
                let compiled = compile_expression(expression, &ctx, true)?;
                parts.push(evaluate_time_dependent_digital(
                    &compiled, parameters, t_begin, t_end, time_step,
                )?);
            }
        }
    }
    Ok(TimedInstruction::concat(parts))
}

/// Compiles a camera lane into its exposure trigger: high while a picture is
/// being taken, low otherwise.
pub fn compile_camera_lane(
    lane: &CameraTimeLane,
    step_bounds: &[Time],
    time_step: TimeStep,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    check_bounds(lane.total_span(), step_bounds)?;
    let mut parts = Vec::new();
    for (start_step, stop_step, value) in lane.block_bounds() {
        let length = number_ticks(step_bounds[start_step], step_bounds[stop_step], time_step);
        let state = matches!(value, CameraBlockValue::TakePicture { .. });
        parts.push(TimedInstruction::constant(state, length));
    }
    Ok(TimedInstruction::concat(parts))
}

enum AnalogBlock {
    Series {
        result: EvaluationResult,
    },
    Ramp {
        t_begin: Time,
        t_end: Time,
    },
}

/// Compiles an analog lane. All expression blocks must share one base dimension
/// (or all be dimensionless); the result carries the common unit.
pub fn compile_analog_lane(
    lane: &AnalogTimeLane,
    step_bounds: &[Time],
    time_step: TimeStep,
    parameters: &Parameters,
    registry: &UnitRegistry,
) -> Result<AnalogSeries, EvaluationError> {
    check_bounds(lane.total_span(), step_bounds)?;
    trace!(
        "compiling analog lane: {} blocks over {} steps",
        lane.blocks().len(),
        lane.total_span()
    );
    let schema = ParameterSchema::of_constants(parameters);
    let ctx = CompilationContext {
        schema: &schema,
        registry,
    };

    // First pass: evaluate every expression block
    let mut blocks = Vec::with_capacity(lane.blocks().len());
    for (start_step, stop_step, value) in lane.block_bounds() {
        let t_begin = step_bounds[start_step];
        let t_end = step_bounds[stop_step];
        match value {
            AnalogBlockValue::Expression(expression) => {
                let compiled = compile_expression(expression, &ctx, true)?;
                let result =
                    evaluate_time_dependent(&compiled, parameters, t_begin, t_end, time_step)?;
                blocks.push(AnalogBlock::Series { result });
            }
            AnalogBlockValue::Ramp => {
                blocks.push(AnalogBlock::Ramp { t_begin, t_end });
            }
        }
    }

    // All expression blocks must agree on one base unit
    let mut common_unit: Option<Option<BaseUnit>> = None;
    for block in &blocks {
        if let AnalogBlock::Series { result } = block {
            match common_unit {
                None => common_unit = Some(result.unit),
                Some(unit) if unit == result.unit => {}
                Some(unit) => {
                    return Err(EvaluationError::Compilation(
                        CompilationError::InvalidDimensionality(format!(
                            "analog lane mixes {} and {}",
                            unit.map(|u| u.to_string())
                                .unwrap_or_else(|| "dimensionless".to_string()),
                            result
                                .unit
                                .map(|u| u.to_string())
                                .unwrap_or_else(|| "dimensionless".to_string()),
                        )),
                    ))
                }
            }
        }
    }

    // Second pass: resolve ramps against their neighbors
    let mut parts = Vec::with_capacity(blocks.len());
    for (idx, block) in blocks.iter().enumerate() {
        match block {
            AnalogBlock::Series { result } => parts.push(result.values.clone()),
            AnalogBlock::Ramp { t_begin, t_end } => {
                let previous = match idx.checked_sub(1).map(|prev| &blocks[prev]) {
                    Some(AnalogBlock::Series { result }) => result,
                    Some(AnalogBlock::Ramp { .. }) => {
                        return Err(invalid_value(
                            "two consecutive ramps in an analog lane".to_string(),
                        ))
                    }
                    None => {
                        return Err(invalid_value(
                            "a ramp cannot start an analog lane".to_string(),
                        ))
                    }
                };
                let next = match blocks.get(idx + 1) {
                    Some(AnalogBlock::Series { result }) => result,
                    Some(AnalogBlock::Ramp { .. }) => {
                        return Err(invalid_value(
                            "two consecutive ramps in an analog lane".to_string(),
                        ))
                    }
                    None => {
                        return Err(invalid_value(
                            "a ramp cannot end an analog lane".to_string(),
                        ))
                    }
                };
                parts.push(compile_ramp_block(
                    previous.final_value,
                    next.initial_value,
                    *t_begin,
                    *t_end,
                    time_step,
                ));
            }
        }
    }
    Ok(AnalogSeries {
        values: TimedInstruction::concat(parts),
        unit: common_unit.flatten(),
    })
}

/// Builds the instruction for one ramp block. The endpoints are adjusted for the
/// offset between the block boundaries and the tick grid, so sample values always
/// lie on the line from `(t_begin, from)` to `(t_end, to)`.
fn compile_ramp_block(
    from: f64,
    to: f64,
    t_begin: Time,
    t_end: Time,
    time_step: TimeStep,
) -> TimedInstruction<f64> {
    let tick_start = start_tick(t_begin, time_step);
    let tick_stop = stop_tick(t_end, time_step);
    let length = tick_stop - tick_start;
    if length == 0 {
        return TimedInstruction::empty();
    }
    let duration = (t_end - t_begin).to_secs();
    let fraction_at = |tick: usize| (time_step.times(tick) - t_begin).to_secs() / duration;
    let start_value = from + (to - from) * fraction_at(tick_start);
    let stop_value = from + (to - from) * fraction_at(tick_stop);
    ramp(start_value, stop_value, length)
}
