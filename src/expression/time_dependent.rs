//! Time-dependent evaluation: compiled expressions over a tick grid.
//!
//! An expression evaluated between `t1` and `t2` at a device time step produces a
//! compressed instruction of exactly `number_ticks(t1, t2, Δt)` samples. Constants
//! broadcast as repeated patterns; the reserved variable `t` becomes a [`Ramp`]
//! holding the *local* time (`tick·Δt - t1`) of each covered tick, so the first
//! sample of a block that does not start on the grid is offset accordingly.
//! Operators distribute pointwise and keep the tree shape where the operation is
//! affine; anything else materializes the touched segments.
//!
//! [`Ramp`]: crate::instruction::TimedInstruction
//!
//! The digital side accepts boolean constants and the `square_wave(x[, duty])`
//! builtin, whose ramp argument expands into one pulse per period; concatenation
//! then collapses the periods into a single repetition.

use crate::error::{CompilationError, EvaluationError};
use crate::expression::ast::{BinaryOp, UnaryOp};
use crate::expression::compile::{CompiledExpression, Node};
use crate::expression::evaluate::{eval_node, ScalarFunction};
use crate::instruction::{ramp, TimedInstruction};
use crate::parameter::{Parameters, Value};
use crate::timing::{number_ticks, start_tick, stop_tick, Time, TimeStep};
use crate::units::{BaseUnit, Dimension};

/// A time-dependent analog expression evaluated over a tick grid.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// One sample per tick, magnitudes in base units.
    pub values: TimedInstruction<f64>,
    /// The base unit shared by all samples; `None` for dimensionless.
    pub unit: Option<BaseUnit>,
    /// Magnitude at local time zero (the interval start).
    pub initial_value: f64,
    /// Magnitude at the interval end (`t2 - t1` in local time).
    pub final_value: f64,
}

/// Evaluates an analog expression between `t1` and `t2` at `time_step`.
pub fn evaluate_time_dependent(
    compiled: &CompiledExpression,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<EvaluationResult, EvaluationError> {
    eval_analog(compiled.root(), parameters, t1, t2, time_step)
        .map_err(|err| err.in_expression(compiled.source().source()))
}

/// Evaluates a digital expression between `t1` and `t2` at `time_step`.
pub fn evaluate_time_dependent_digital(
    compiled: &CompiledExpression,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    eval_digital(compiled.root(), parameters, t1, t2, time_step)
        .map_err(|err| err.in_expression(compiled.source().source()))
}

fn depends_on_time(node: &Node) -> bool {
    match node {
        Node::Time => true,
        Node::Literal(_) | Node::Variable { .. } => false,
        Node::Unary { operand, .. } => depends_on_time(operand),
        Node::Binary { lhs, rhs, .. } => depends_on_time(lhs) || depends_on_time(rhs),
        Node::Call { args, .. } => args.iter().any(depends_on_time),
    }
}

fn invalid_type(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidType(message))
}

fn invalid_dim(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidDimensionality(message))
}

fn invalid_op(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidOperation(message))
}

fn invalid_value(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidValue(message))
}

/// Unpacks a scalar into `(magnitude in base units, unit)`.
fn analog_scalar(value: Value) -> Result<(f64, Option<BaseUnit>), EvaluationError> {
    match value {
        Value::Integer(v) => Ok((v as f64, None)),
        Value::Float(v) => Ok((v, None)),
        Value::Quantity { magnitude, unit } => Ok((magnitude, Some(unit))),
        Value::Boolean(_) => Err(invalid_type(
            "expected an analog value, got a boolean".to_string(),
        )),
    }
}

fn eval_analog(
    node: &Node,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<EvaluationResult, EvaluationError> {
    if !depends_on_time(node) {
        let (magnitude, unit) = analog_scalar(eval_node(node, parameters)?)?;
        let length = number_ticks(t1, t2, time_step);
        return Ok(EvaluationResult {
            values: TimedInstruction::constant(magnitude, length),
            unit,
            initial_value: magnitude,
            final_value: magnitude,
        });
    }
    match node {
        Node::Time => {
            let tick_start = start_tick(t1, time_step);
            let tick_stop = stop_tick(t2, time_step);
            let length = tick_stop - tick_start;
            // Local time: the grid tick times with the interval start subtracted
            let value_start = (time_step.times(tick_start) - t1).to_secs();
            let value_stop = (time_step.times(tick_stop) - t1).to_secs();
            Ok(EvaluationResult {
                values: ramp(value_start, value_stop, length),
                unit: Some(BaseUnit::SECOND),
                initial_value: 0.0,
                final_value: (t2 - t1).to_secs(),
            })
        }
        Node::Unary { op, operand } => {
            let series = eval_analog(operand, parameters, t1, t2, time_step)?;
            match op {
                UnaryOp::Plus => Ok(series),
                UnaryOp::Neg => Ok(EvaluationResult {
                    values: series.values.map_affine(-1.0, 0.0),
                    unit: series.unit,
                    initial_value: -series.initial_value,
                    final_value: -series.final_value,
                }),
            }
        }
        Node::Binary { op, lhs, rhs } => {
            eval_analog_binary(*op, lhs, rhs, parameters, t1, t2, time_step)
        }
        Node::Call { function, args } => {
            eval_analog_call(*function, args, parameters, t1, t2, time_step)
        }
        Node::Literal(_) | Node::Variable { .. } => {
            unreachable!("time-independent nodes are handled above")
        }
    }
}

enum Side {
    Scalar(f64, Option<BaseUnit>),
    Series(EvaluationResult),
}

fn eval_side(
    node: &Node,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<Side, EvaluationError> {
    if depends_on_time(node) {
        Ok(Side::Series(eval_analog(node, parameters, t1, t2, time_step)?))
    } else {
        let (magnitude, unit) = analog_scalar(eval_node(node, parameters)?)?;
        Ok(Side::Scalar(magnitude, unit))
    }
}

fn side_unit(side: &Side) -> Option<BaseUnit> {
    match side {
        Side::Scalar(_, unit) => *unit,
        Side::Series(series) => series.unit,
    }
}

fn dimension_of(unit: Option<BaseUnit>) -> Dimension {
    unit.map(|u| u.dimension()).unwrap_or(Dimension::DIMENSIONLESS)
}

fn unit_of_dimension(dim: Dimension) -> Option<BaseUnit> {
    if dim.is_dimensionless() {
        None
    } else {
        Some(BaseUnit::new(dim))
    }
}

fn unit_name(unit: Option<BaseUnit>) -> String {
    match unit {
        Some(unit) => unit.to_string(),
        None => "dimensionless".to_string(),
    }
}

fn combine_endpoints(op: BinaryOp, left: f64, right: f64) -> Result<f64, EvaluationError> {
    match op {
        BinaryOp::Add => Ok(left + right),
        BinaryOp::Sub => Ok(left - right),
        BinaryOp::Mul => Ok(left * right),
        BinaryOp::Div => {
            if right == 0.0 {
                return Err(EvaluationError::DivisionByZero);
            }
            Ok(left / right)
        }
        BinaryOp::Pow => {
            let result = left.powf(right);
            if result.is_nan() && !left.is_nan() && !right.is_nan() {
                return Err(EvaluationError::MathDomain(format!(
                    "cannot raise {left} to the power {right}"
                )));
            }
            Ok(result)
        }
    }
}

fn eval_analog_binary(
    op: BinaryOp,
    lhs: &Node,
    rhs: &Node,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<EvaluationResult, EvaluationError> {
    let left = eval_side(lhs, parameters, t1, t2, time_step)?;
    let right = eval_side(rhs, parameters, t1, t2, time_step)?;

    // Unit algebra first, so dimensionality faults surface before any sampling
    let left_unit = side_unit(&left);
    let right_unit = side_unit(&right);
    let result_unit = match op {
        BinaryOp::Add | BinaryOp::Sub => {
            if left_unit != right_unit {
                return Err(invalid_dim(format!(
                    "cannot combine {} and {} with '{op}'",
                    unit_name(left_unit),
                    unit_name(right_unit)
                )));
            }
            left_unit
        }
        BinaryOp::Mul => {
            unit_of_dimension(dimension_of(left_unit).mul(dimension_of(right_unit)))
        }
        BinaryOp::Div => {
            unit_of_dimension(dimension_of(left_unit).div(dimension_of(right_unit)))
        }
        BinaryOp::Pow => {
            let exponent = match &right {
                Side::Scalar(magnitude, None) => *magnitude,
                Side::Scalar(_, Some(unit)) => {
                    return Err(invalid_op(format!(
                        "the exponent of '**' must be a real number, got a quantity in {unit}"
                    )))
                }
                Side::Series(_) => {
                    return Err(invalid_op(
                        "a time-dependent exponent is not supported".to_string(),
                    ))
                }
            };
            match left_unit {
                None => None,
                Some(unit) => {
                    let dim = crate::expression::evaluate::quantity_pow_dimension(unit, exponent)
                        .map_err(EvaluationError::from)?;
                    unit_of_dimension(dim)
                }
            }
        }
    };

    let (initial_value, final_value, values) = match (left, right) {
        (Side::Scalar(a, _), Side::Series(b)) => {
            let values = combine_scalar_series(op, a, &b.values, true)?;
            (
                combine_endpoints(op, a, b.initial_value)?,
                combine_endpoints(op, a, b.final_value)?,
                values,
            )
        }
        (Side::Series(a), Side::Scalar(b, _)) => {
            let values = combine_scalar_series(op, b, &a.values, false)?;
            (
                combine_endpoints(op, a.initial_value, b)?,
                combine_endpoints(op, a.final_value, b)?,
                values,
            )
        }
        (Side::Series(a), Side::Series(b)) => {
            let values = zip_series(op, &a.values, &b.values)?;
            (
                combine_endpoints(op, a.initial_value, b.initial_value)?,
                combine_endpoints(op, a.final_value, b.final_value)?,
                values,
            )
        }
        (Side::Scalar(_, _), Side::Scalar(_, _)) => {
            unreachable!("binary nodes with two scalar sides are time-independent")
        }
    };
    Ok(EvaluationResult {
        values,
        unit: result_unit,
        initial_value,
        final_value,
    })
}

/// Combines a scalar with a series. `scalar_on_left` distinguishes `c op x` from
/// `x op c`.
fn combine_scalar_series(
    op: BinaryOp,
    scalar: f64,
    series: &TimedInstruction<f64>,
    scalar_on_left: bool,
) -> Result<TimedInstruction<f64>, EvaluationError> {
    match (op, scalar_on_left) {
        (BinaryOp::Add, _) => Ok(series.map_affine(1.0, scalar)),
        (BinaryOp::Sub, true) => Ok(series.map_affine(-1.0, scalar)),
        (BinaryOp::Sub, false) => Ok(series.map_affine(1.0, -scalar)),
        (BinaryOp::Mul, _) => Ok(series.map_affine(scalar, 0.0)),
        (BinaryOp::Div, false) => {
            if scalar == 0.0 {
                return Err(EvaluationError::DivisionByZero);
            }
            Ok(series.map_affine(1.0 / scalar, 0.0))
        }
        (BinaryOp::Div, true) => {
            try_elementwise(series, &|x| combine_endpoints(BinaryOp::Div, scalar, x))
        }
        (BinaryOp::Pow, true) => {
            try_elementwise(series, &|x| combine_endpoints(BinaryOp::Pow, scalar, x))
        }
        (BinaryOp::Pow, false) => {
            if scalar == 1.0 {
                return Ok(series.clone());
            }
            try_elementwise(series, &|x| combine_endpoints(BinaryOp::Pow, x, scalar))
        }
    }
}

/// Pointwise combination of two equal-length series, preserving structure where
/// cheap: constants broadcast affinely, ramps add and subtract as ramps, aligned
/// repetitions recurse, concatenation boundaries split; the rest materializes.
fn zip_series(
    op: BinaryOp,
    a: &TimedInstruction<f64>,
    b: &TimedInstruction<f64>,
) -> Result<TimedInstruction<f64>, EvaluationError> {
    debug_assert_eq!(a.len(), b.len());
    if let Some(constant) = a.constant_value() {
        return combine_scalar_series(op, constant, b, true);
    }
    if let Some(constant) = b.constant_value() {
        return combine_scalar_series(op, constant, a, false);
    }
    if let (TimedInstruction::Ramp(ra), TimedInstruction::Ramp(rb)) = (a, b) {
        if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let sign = if op == BinaryOp::Add { 1.0 } else { -1.0 };
            return Ok(ramp(
                ra.start() + sign * rb.start(),
                ra.stop() + sign * rb.stop(),
                a.len(),
            ));
        }
    }
    if let (TimedInstruction::Repeated(ra), TimedInstruction::Repeated(rb)) = (a, b) {
        if ra.count() == rb.count() && ra.child().len() == rb.child().len() {
            let combined = zip_series(op, ra.child(), rb.child())?;
            return Ok(combined.repeat(ra.count()));
        }
    }
    let a_cuts = top_level_cuts(a);
    let b_cuts = top_level_cuts(b);
    if a_cuts.len() > 1 || b_cuts.len() > 1 {
        let mut cuts: Vec<usize> = a_cuts.into_iter().chain(b_cuts).collect();
        cuts.sort_unstable();
        cuts.dedup();
        let mut parts = Vec::new();
        let mut prev = 0;
        for cut in cuts {
            if cut > prev {
                parts.push(zip_series(op, &a.slice(prev..cut), &b.slice(prev..cut))?);
                prev = cut;
            }
        }
        return Ok(TimedInstruction::concat(parts));
    }
    // Leaves of different shapes: materialize
    let mut a_samples = Vec::with_capacity(a.len());
    a.extend_vec(&mut a_samples);
    let mut b_samples = Vec::with_capacity(b.len());
    b.extend_vec(&mut b_samples);
    let mut out = Vec::with_capacity(a_samples.len());
    for (x, y) in a_samples.into_iter().zip(b_samples) {
        out.push(combine_endpoints(op, x, y)?);
    }
    Ok(TimedInstruction::pattern(out))
}

fn top_level_cuts(instr: &TimedInstruction<f64>) -> Vec<usize> {
    match instr {
        TimedInstruction::Concatenated(c) => c.ends().to_vec(),
        other => vec![other.len()],
    }
}

fn try_elementwise(
    series: &TimedInstruction<f64>,
    f: &impl Fn(f64) -> Result<f64, EvaluationError>,
) -> Result<TimedInstruction<f64>, EvaluationError> {
    let mut samples = Vec::with_capacity(series.len());
    series.extend_vec(&mut samples);
    let mut out = Vec::with_capacity(samples.len());
    for sample in samples {
        out.push(f(sample)?);
    }
    Ok(TimedInstruction::pattern(out))
}

fn eval_analog_call(
    function: ScalarFunction,
    args: &[Node],
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<EvaluationResult, EvaluationError> {
    if function == ScalarFunction::SquareWave {
        return Err(invalid_type(
            "square_wave produces a digital value and cannot be used in an analog context"
                .to_string(),
        ));
    }
    if args.len() != 1 {
        return Err(invalid_op(format!(
            "function {} does not support time-dependent arguments",
            function.name()
        )));
    }
    let series = eval_analog(&args[0], parameters, t1, t2, time_step)?;
    if function != ScalarFunction::Abs {
        if let Some(unit) = series.unit {
            return Err(invalid_dim(format!(
                "the argument of {} must be dimensionless, got a quantity in {unit}",
                function.name()
            )));
        }
    }
    let apply = |x: f64| -> Result<f64, EvaluationError> {
        match crate::expression::evaluate::apply_function(function, &[Value::Float(x)]) {
            Ok(Value::Float(v)) => Ok(v),
            Ok(Value::Quantity { magnitude, .. }) => Ok(magnitude),
            Ok(other) => Err(invalid_type(format!(
                "function {} produced a non-analog value {other}",
                function.name()
            ))),
            Err(err) => Err(err.into()),
        }
    };
    let values = try_elementwise(&series.values, &apply)?;
    Ok(EvaluationResult {
        values,
        unit: if function == ScalarFunction::Abs { series.unit } else { None },
        initial_value: apply(series.initial_value)?,
        final_value: apply(series.final_value)?,
    })
}

fn eval_digital(
    node: &Node,
    parameters: &Parameters,
    t1: Time,
    t2: Time,
    time_step: TimeStep,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    if !depends_on_time(node) {
        let length = number_ticks(t1, t2, time_step);
        return match eval_node(node, parameters)? {
            Value::Boolean(state) => Ok(TimedInstruction::constant(state, length)),
            other => Err(invalid_type(format!(
                "expected a digital value, got {other}"
            ))),
        };
    }
    match node {
        Node::Call {
            function: ScalarFunction::SquareWave,
            args,
        } => {
            let x = eval_analog(&args[0], parameters, t1, t2, time_step)?;
            if let Some(unit) = x.unit {
                return Err(invalid_dim(format!(
                    "the argument of square_wave must be dimensionless, got a quantity in {unit}"
                )));
            }
            let duty_cycle = match args.get(1) {
                None => 0.5,
                Some(arg) => {
                    if depends_on_time(arg) {
                        return Err(invalid_op(
                            "the duty cycle of square_wave cannot depend on time".to_string(),
                        ));
                    }
                    let (magnitude, unit) = analog_scalar(eval_node(arg, parameters)?)?;
                    if unit.is_some() {
                        return Err(invalid_dim(
                            "the duty cycle of square_wave must be dimensionless".to_string(),
                        ));
                    }
                    magnitude
                }
            };
            if !(0.0..=1.0).contains(&duty_cycle) {
                return Err(invalid_value(format!(
                    "duty cycle of square_wave must be between 0 and 1, got {duty_cycle}"
                )));
            }
            square_wave(&x.values, duty_cycle)
        }
        _ => Err(invalid_op(
            "not a valid time-dependent digital expression".to_string(),
        )),
    }
}

/// Samples `frac(x) < duty_cycle` over a phase series. A ramp argument expands
/// structurally into one high/low pair per period.
fn square_wave(
    x: &TimedInstruction<f64>,
    duty_cycle: f64,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    if let Some(phase) = x.constant_value() {
        let state = phase - phase.floor() < duty_cycle;
        return Ok(TimedInstruction::constant(state, x.len()));
    }
    match x {
        TimedInstruction::Concatenated(c) => {
            let mut parts = Vec::with_capacity(c.children().len());
            for child in c.children() {
                parts.push(square_wave(child, duty_cycle)?);
            }
            Ok(TimedInstruction::concat(parts))
        }
        TimedInstruction::Repeated(r) => {
            Ok(square_wave(r.child(), duty_cycle)?.repeat(r.count()))
        }
        TimedInstruction::Pattern(_) => {
            Ok(x.map_into(&|phase| phase - phase.floor() < duty_cycle))
        }
        TimedInstruction::Ramp(r) => {
            let (a, b) = (r.start(), r.stop());
            let length = x.len();
            if b <= a {
                // Decreasing phase: fall back to pointwise sampling
                return Ok(x.map_into(&|phase| phase - phase.floor() < duty_cycle));
            }
            let ticks_per_period = length as f64 / (b - a);
            if ticks_per_period < 2.0 {
                return Err(invalid_value(format!(
                    "square_wave period covers {ticks_per_period:.3} ticks, need at least 2"
                )));
            }
            // The small tolerance keeps pulse edges exact when the duty cycle is
            // not representable in binary (e.g. 0.1)
            let tick_at = |phase: f64| -> usize {
                let tick = (length as f64 * (phase - a) / (b - a) - 1e-9).ceil();
                tick.clamp(0.0, length as f64) as usize
            };
            let mut parts = Vec::new();
            let mut period = a.floor();
            while period < b {
                let rise = tick_at(period);
                let fall = tick_at(period + duty_cycle);
                let next = tick_at(period + 1.0);
                parts.push(TimedInstruction::constant(true, fall - rise));
                parts.push(TimedInstruction::constant(false, next - fall));
                period += 1.0;
            }
            Ok(TimedInstruction::concat(parts))
        }
    }
}
