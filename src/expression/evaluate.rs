//! Scalar evaluation: the closed function table, the operator semantics shared by
//! constant folding and runtime evaluation, and the evaluator for the compiled IR.

use std::f64::consts::{E, PI};

use crate::error::{CompilationError, EvaluationError};
use crate::expression::ast::{BinaryOp, UnaryOp};
use crate::expression::compile::{compile_expression, CompilationContext, Node};
use crate::expression::Expression;
use crate::parameter::{ParameterSchema, Parameters, Value};
use crate::units::{BaseUnit, UnitRegistry};

/// The closed table of scalar functions callable from expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunction {
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Log,
    Log10,
    Abs,
    Min,
    Max,
    /// Only meaningful in time-dependent digital expressions; scalar evaluation
    /// computes the instantaneous value `frac(x) < duty_cycle`.
    SquareWave,
}

impl ScalarFunction {
    pub fn lookup(name: &str) -> Option<ScalarFunction> {
        Some(match name {
            "sqrt" => ScalarFunction::Sqrt,
            "sin" => ScalarFunction::Sin,
            "cos" => ScalarFunction::Cos,
            "tan" => ScalarFunction::Tan,
            "asin" => ScalarFunction::Asin,
            "acos" => ScalarFunction::Acos,
            "atan" => ScalarFunction::Atan,
            "exp" => ScalarFunction::Exp,
            "log" => ScalarFunction::Log,
            "log10" => ScalarFunction::Log10,
            "abs" => ScalarFunction::Abs,
            "min" => ScalarFunction::Min,
            "max" => ScalarFunction::Max,
            "square_wave" => ScalarFunction::SquareWave,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScalarFunction::Sqrt => "sqrt",
            ScalarFunction::Sin => "sin",
            ScalarFunction::Cos => "cos",
            ScalarFunction::Tan => "tan",
            ScalarFunction::Asin => "asin",
            ScalarFunction::Acos => "acos",
            ScalarFunction::Atan => "atan",
            ScalarFunction::Exp => "exp",
            ScalarFunction::Log => "log",
            ScalarFunction::Log10 => "log10",
            ScalarFunction::Abs => "abs",
            ScalarFunction::Min => "min",
            ScalarFunction::Max => "max",
            ScalarFunction::SquareWave => "square_wave",
        }
    }

    /// Inclusive range of accepted argument counts.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            ScalarFunction::Min | ScalarFunction::Max => (2, 2),
            ScalarFunction::SquareWave => (1, 2),
            _ => (1, 1),
        }
    }
}

/// Builtin named constants, resolved after the parameter schema.
pub(crate) fn builtin_constant(name: &str) -> Option<Value> {
    Some(match name {
        "pi" => Value::Float(PI),
        "e" => Value::Float(E),
        "Enabled" => Value::Boolean(true),
        "Disabled" => Value::Boolean(false),
        _ => return None,
    })
}

/// Error of a single scalar operation: either a type-level fault (reported at
/// compile time when the operands are constant) or a numeric fault.
#[derive(Debug)]
pub(crate) enum OpError {
    Compile(CompilationError),
    Eval(EvaluationError),
}

impl From<CompilationError> for OpError {
    fn from(err: CompilationError) -> OpError {
        OpError::Compile(err)
    }
}

impl From<EvaluationError> for OpError {
    fn from(err: EvaluationError) -> OpError {
        OpError::Eval(err)
    }
}

impl From<OpError> for EvaluationError {
    fn from(err: OpError) -> EvaluationError {
        match err {
            OpError::Compile(inner) => EvaluationError::Compilation(inner),
            OpError::Eval(inner) => inner,
        }
    }
}

fn invalid_type(message: String) -> OpError {
    OpError::Compile(CompilationError::InvalidType(message))
}

fn invalid_dim(message: String) -> OpError {
    OpError::Compile(CompilationError::InvalidDimensionality(message))
}

fn invalid_op(message: String) -> OpError {
    OpError::Compile(CompilationError::InvalidOperation(message))
}

fn math_domain(message: String) -> OpError {
    OpError::Eval(EvaluationError::MathDomain(message))
}

/// A plain (dimensionless) float, rejecting booleans and dimensioned quantities.
pub(crate) fn dimensionless_magnitude(value: &Value, context: &str) -> Result<f64, OpError> {
    match value {
        Value::Integer(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v),
        Value::Quantity { unit, .. } => Err(invalid_dim(format!(
            "{context} must be dimensionless, got a quantity in {unit}"
        ))),
        Value::Boolean(_) => Err(invalid_type(format!("{context} must be a number, got a boolean"))),
    }
}

pub(crate) fn scalar_unary(op: UnaryOp, value: Value) -> Result<Value, OpError> {
    match op {
        UnaryOp::Plus => match value {
            Value::Boolean(_) => Err(invalid_type("cannot apply unary + to a boolean".to_string())),
            other => Ok(other),
        },
        UnaryOp::Neg => match value {
            Value::Boolean(_) => Err(invalid_type("cannot negate a boolean".to_string())),
            Value::Integer(v) => Ok(Value::Integer(-v)),
            Value::Float(v) => Ok(Value::Float(-v)),
            Value::Quantity { magnitude, unit } => Ok(Value::Quantity {
                magnitude: -magnitude,
                unit,
            }),
        },
    }
}

pub(crate) fn scalar_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, OpError> {
    if matches!(left, Value::Boolean(_)) || matches!(right, Value::Boolean(_)) {
        return Err(invalid_type(format!(
            "cannot apply '{op}' to boolean operands ({left} {op} {right})"
        )));
    }
    match op {
        BinaryOp::Add | BinaryOp::Sub => add_sub(op, left, right),
        BinaryOp::Mul => mul(left, right),
        BinaryOp::Div => div(left, right),
        BinaryOp::Pow => pow(left, right),
    }
}

fn add_sub(op: BinaryOp, left: Value, right: Value) -> Result<Value, OpError> {
    let sign = if op == BinaryOp::Add { 1.0 } else { -1.0 };
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => {
            let combined = if op == BinaryOp::Add {
                a.checked_add(b)
            } else {
                a.checked_sub(b)
            };
            Ok(combined
                .map(Value::Integer)
                .unwrap_or(Value::Float(a as f64 + sign * b as f64)))
        }
        (
            Value::Quantity { magnitude: a, unit: u },
            Value::Quantity { magnitude: b, unit: v },
        ) => {
            if u != v {
                return Err(invalid_dim(format!("cannot combine {u} and {v} with '{op}'")));
            }
            Ok(Value::Quantity {
                magnitude: a + sign * b,
                unit: u,
            })
        }
        (Value::Quantity { unit, .. }, _) | (_, Value::Quantity { unit, .. }) => {
            Err(invalid_dim(format!(
                "cannot add a pure number to a quantity in {unit}"
            )))
        }
        (a, b) => {
            let a = a.magnitude().expect("numeric");
            let b = b.magnitude().expect("numeric");
            Ok(Value::Float(a + sign * b))
        }
    }
}

fn mul(left: Value, right: Value) -> Result<Value, OpError> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => Ok(a
            .checked_mul(b)
            .map(Value::Integer)
            .unwrap_or(Value::Float(a as f64 * b as f64))),
        (a, b) => {
            let magnitude = a.magnitude().expect("numeric") * b.magnitude().expect("numeric");
            let dim = a
                .base_unit()
                .map(|u| u.dimension())
                .unwrap_or(crate::units::Dimension::DIMENSIONLESS)
                .mul(
                    b.base_unit()
                        .map(|u| u.dimension())
                        .unwrap_or(crate::units::Dimension::DIMENSIONLESS),
                );
            if dim.is_dimensionless() {
                Ok(Value::Float(magnitude))
            } else {
                Ok(Value::Quantity {
                    magnitude,
                    unit: BaseUnit::new(dim),
                })
            }
        }
    }
}

fn div(left: Value, right: Value) -> Result<Value, OpError> {
    let divisor = right.magnitude().expect("numeric");
    if divisor == 0.0 {
        return Err(OpError::Eval(EvaluationError::DivisionByZero));
    }
    let magnitude = left.magnitude().expect("numeric") / divisor;
    let dim = left
        .base_unit()
        .map(|u| u.dimension())
        .unwrap_or(crate::units::Dimension::DIMENSIONLESS)
        .div(
            right
                .base_unit()
                .map(|u| u.dimension())
                .unwrap_or(crate::units::Dimension::DIMENSIONLESS),
        );
    if dim.is_dimensionless() {
        Ok(Value::Float(magnitude))
    } else {
        Ok(Value::Quantity {
            magnitude,
            unit: BaseUnit::new(dim),
        })
    }
}

fn pow(left: Value, right: Value) -> Result<Value, OpError> {
    let exponent = match right {
        Value::Integer(v) => v as f64,
        Value::Float(v) => v,
        Value::Quantity { unit, .. } => {
            return Err(invalid_op(format!(
                "the exponent of '**' must be a real number, got a quantity in {unit}"
            )))
        }
        Value::Boolean(_) => unreachable!("filtered above"),
    };
    match left {
        Value::Integer(base) => {
            if let Value::Integer(exp) = right {
                if (0..=u32::MAX as i64).contains(&exp) {
                    if let Some(result) = base.checked_pow(exp as u32) {
                        return Ok(Value::Integer(result));
                    }
                }
            }
            float_pow(base as f64, exponent).map(Value::Float)
        }
        Value::Float(base) => float_pow(base, exponent).map(Value::Float),
        Value::Quantity { magnitude, unit } => {
            let dim = quantity_pow_dimension(unit, exponent)?;
            let magnitude = float_pow(magnitude, exponent)?;
            if dim.is_dimensionless() {
                Ok(Value::Float(magnitude))
            } else {
                Ok(Value::Quantity {
                    magnitude,
                    unit: BaseUnit::new(dim),
                })
            }
        }
        Value::Boolean(_) => unreachable!("filtered above"),
    }
}

fn float_pow(base: f64, exponent: f64) -> Result<f64, OpError> {
    let result = base.powf(exponent);
    if result.is_nan() && !base.is_nan() && !exponent.is_nan() {
        return Err(math_domain(format!("cannot raise {base} to the power {exponent}")));
    }
    Ok(result)
}

/// The dimension of a quantity raised to `exponent`. Integer and half-integer
/// exponents are supported; the latter only when every exponent stays integral.
pub(crate) fn quantity_pow_dimension(
    unit: BaseUnit,
    exponent: f64,
) -> Result<crate::units::Dimension, OpError> {
    let dim = unit.dimension();
    if exponent.fract() == 0.0 && exponent.abs() <= i32::MAX as f64 {
        return Ok(dim.pow(exponent as i32));
    }
    let doubled = exponent * 2.0;
    if doubled.fract() == 0.0 && doubled.abs() <= i32::MAX as f64 {
        if let Some(halved) = dim.try_sqrt() {
            return Ok(halved.pow(doubled as i32));
        }
    }
    Err(invalid_op(format!(
        "cannot raise a quantity in {unit} to the non-integer power {exponent}"
    )))
}

pub(crate) fn apply_function(
    function: ScalarFunction,
    args: &[Value],
) -> Result<Value, OpError> {
    let (min_args, max_args) = function.arity();
    if args.len() < min_args || args.len() > max_args {
        return Err(invalid_op(format!(
            "function {} expects {min_args}..={max_args} argument(s), got {}",
            function.name(),
            args.len()
        )));
    }
    let name = function.name();
    match function {
        ScalarFunction::Sqrt => match args[0] {
            Value::Quantity { magnitude, unit } => {
                let dim = unit.dimension().try_sqrt().ok_or_else(|| {
                    invalid_dim(format!("cannot take the square root of a quantity in {unit}"))
                })?;
                if magnitude < 0.0 {
                    return Err(math_domain(format!("sqrt of negative value {magnitude}")));
                }
                Ok(Value::Quantity {
                    magnitude: magnitude.sqrt(),
                    unit: BaseUnit::new(dim),
                })
            }
            ref v => {
                let x = dimensionless_magnitude(v, "the argument of sqrt")?;
                if x < 0.0 {
                    return Err(math_domain(format!("sqrt of negative value {x}")));
                }
                Ok(Value::Float(x.sqrt()))
            }
        },
        ScalarFunction::Sin | ScalarFunction::Cos | ScalarFunction::Tan => {
            let x = dimensionless_magnitude(&args[0], &format!("the argument of {name}"))?;
            let result = match function {
                ScalarFunction::Sin => x.sin(),
                ScalarFunction::Cos => x.cos(),
                _ => x.tan(),
            };
            Ok(Value::Float(result))
        }
        ScalarFunction::Asin | ScalarFunction::Acos => {
            let x = dimensionless_magnitude(&args[0], &format!("the argument of {name}"))?;
            if !(-1.0..=1.0).contains(&x) {
                return Err(math_domain(format!("{name} of {x} is undefined")));
            }
            let result = if function == ScalarFunction::Asin {
                x.asin()
            } else {
                x.acos()
            };
            Ok(Value::Float(result))
        }
        ScalarFunction::Atan => {
            let x = dimensionless_magnitude(&args[0], "the argument of atan")?;
            Ok(Value::Float(x.atan()))
        }
        ScalarFunction::Exp => {
            let x = dimensionless_magnitude(&args[0], "the argument of exp")?;
            Ok(Value::Float(x.exp()))
        }
        ScalarFunction::Log | ScalarFunction::Log10 => {
            let x = dimensionless_magnitude(&args[0], &format!("the argument of {name}"))?;
            if x <= 0.0 {
                return Err(math_domain(format!("{name} of non-positive value {x}")));
            }
            let result = if function == ScalarFunction::Log {
                x.ln()
            } else {
                x.log10()
            };
            Ok(Value::Float(result))
        }
        ScalarFunction::Abs => match args[0] {
            Value::Integer(v) => Ok(v
                .checked_abs()
                .map(Value::Integer)
                .unwrap_or(Value::Float((v as f64).abs()))),
            Value::Float(v) => Ok(Value::Float(v.abs())),
            Value::Quantity { magnitude, unit } => Ok(Value::Quantity {
                magnitude: magnitude.abs(),
                unit,
            }),
            Value::Boolean(_) => Err(invalid_type("cannot take abs of a boolean".to_string())),
        },
        ScalarFunction::Min | ScalarFunction::Max => {
            let pick_min = function == ScalarFunction::Min;
            match (&args[0], &args[1]) {
                (Value::Integer(a), Value::Integer(b)) => Ok(Value::Integer(if pick_min {
                    *a.min(b)
                } else {
                    *a.max(b)
                })),
                (
                    Value::Quantity { magnitude: a, unit: u },
                    Value::Quantity { magnitude: b, unit: v },
                ) => {
                    if u != v {
                        return Err(invalid_dim(format!(
                            "cannot compare quantities in {u} and {v}"
                        )));
                    }
                    let magnitude = if pick_min { a.min(*b) } else { a.max(*b) };
                    Ok(Value::Quantity { magnitude, unit: *u })
                }
                (a, b) => {
                    let x = dimensionless_magnitude(a, &format!("the arguments of {name}"))?;
                    let y = dimensionless_magnitude(b, &format!("the arguments of {name}"))?;
                    Ok(Value::Float(if pick_min { x.min(y) } else { x.max(y) }))
                }
            }
        }
        ScalarFunction::SquareWave => {
            let x = dimensionless_magnitude(&args[0], "the argument of square_wave")?;
            let duty_cycle = match args.get(1) {
                Some(v) => dimensionless_magnitude(v, "the duty cycle of square_wave")?,
                None => 0.5,
            };
            if !(0.0..=1.0).contains(&duty_cycle) {
                return Err(OpError::Compile(CompilationError::InvalidValue(format!(
                    "duty cycle of square_wave must be between 0 and 1, got {duty_cycle}"
                ))));
            }
            Ok(Value::Boolean(x - x.floor() < duty_cycle))
        }
    }
}

/// Evaluates a compiled IR node against concrete parameter bindings.
pub(crate) fn eval_node(node: &Node, parameters: &Parameters) -> Result<Value, EvaluationError> {
    match node {
        Node::Literal(value) => Ok(*value),
        Node::Variable { name, ty } => {
            let value = parameters
                .get(name)
                .ok_or_else(|| EvaluationError::MissingParameter(name.clone()))?;
            if value.ty() != *ty {
                return Err(EvaluationError::Compilation(CompilationError::InvalidType(
                    format!(
                        "parameter \"{name}\" is declared as {ty} but bound to {value}",
                    ),
                )));
            }
            Ok(*value)
        }
        Node::Time => Err(EvaluationError::Compilation(
            CompilationError::InvalidOperation(
                "the time variable cannot be evaluated in a scalar context".to_string(),
            ),
        )),
        Node::Unary { op, operand } => {
            let value = eval_node(operand, parameters)?;
            scalar_unary(*op, value).map_err(EvaluationError::from)
        }
        Node::Binary { op, lhs, rhs } => {
            let left = eval_node(lhs, parameters)?;
            let right = eval_node(rhs, parameters)?;
            scalar_binary(*op, left, right).map_err(EvaluationError::from)
        }
        Node::Call { function, args } => {
            let values = args
                .iter()
                .map(|arg| eval_node(arg, parameters))
                .collect::<Result<Vec<Value>, EvaluationError>>()?;
            apply_function(*function, &values).map_err(EvaluationError::from)
        }
    }
}

/// Compiles and evaluates an expression with every parameter treated as a constant.
/// This is the scalar evaluation path of the shot compiler.
pub fn evaluate_scalar(
    expression: &Expression,
    parameters: &Parameters,
    registry: &UnitRegistry,
) -> Result<Value, EvaluationError> {
    let schema = ParameterSchema::of_constants(parameters);
    let ctx = CompilationContext {
        schema: &schema,
        registry,
    };
    let compiled = compile_expression(expression, &ctx, false)?;
    compiled
        .evaluate(parameters)
        .map_err(|err| err.in_expression(expression.source()))
}
