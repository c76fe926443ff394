//! Expression compilation: typed IR construction with eager constant folding.
//!
//! Identifier resolution order is fixed: unit name, then schema constant, then
//! schema variable, then the reserved time variable `t` (only when the caller allows
//! time dependence), then the builtin constants (`pi`, `e`, `Enabled`, `Disabled`).
//! Unknown names fail with a nearest-match suggestion.
//!
//! Every subtree whose leaves are all constant folds to a literal during
//! compilation, so type and dimensionality faults in constant expressions (e.g.
//! `1 + 1 MHz`) surface at compile time with the offending span underlined.

use std::sync::Arc;

use crate::error::{CompilationError, EvaluationError};
use crate::expression::ast::{is_time_dependent, Ast, AstNode, BinaryOp, UnaryOp};
use crate::expression::evaluate::{
    apply_function, builtin_constant, eval_node, quantity_pow_dimension, scalar_binary,
    scalar_unary, OpError, ScalarFunction,
};
use crate::expression::parse::parse;
use crate::expression::Expression;
use crate::parameter::{ParameterSchema, ParameterType, Parameters, Value};
use crate::units::{BaseUnit, Dimension, Scale, UnitDef, UnitRegistry};

/// Everything needed to compile an expression: the parameter schema and the unit
/// registry, passed explicitly rather than reached through a global.
#[derive(Debug, Clone, Copy)]
pub struct CompilationContext<'a> {
    pub schema: &'a ParameterSchema,
    pub registry: &'a UnitRegistry,
}

/// The output type of a compiled expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpressionType {
    Boolean,
    Integer,
    Float,
    Quantity(BaseUnit),
}

impl std::fmt::Display for ExpressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpressionType::Boolean => write!(f, "boolean"),
            ExpressionType::Integer => write!(f, "integer"),
            ExpressionType::Float => write!(f, "float"),
            ExpressionType::Quantity(unit) => write!(f, "quantity in {unit}"),
        }
    }
}

/// Compiled IR. Constant subtrees have already been folded into literals.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Literal(Value),
    Variable { name: String, ty: ParameterType },
    Time,
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Call {
        function: ScalarFunction,
        args: Vec<Node>,
    },
}

/// A compiled, type-checked expression.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Expression,
    root: Arc<Node>,
    output: ExpressionType,
    time_dependent: bool,
}

impl CompiledExpression {
    pub fn source(&self) -> &Expression {
        &self.source
    }

    pub fn output_type(&self) -> ExpressionType {
        self.output
    }

    /// Whether the reserved identifier `t` occurs in the expression.
    pub fn is_time_dependent(&self) -> bool {
        self.time_dependent
    }

    pub(crate) fn root(&self) -> &Node {
        &self.root
    }

    /// Evaluates to a scalar value. Time-dependent expressions must use
    /// [`crate::expression::time_dependent`] instead.
    pub fn evaluate(&self, parameters: &Parameters) -> Result<Value, EvaluationError> {
        eval_node(&self.root, parameters)
    }

    fn require_scalar(&self, wanted: &str) -> Result<(), CompilationError> {
        if self.time_dependent {
            return Err(CompilationError::InvalidOperation(format!(
                "a time-dependent expression cannot be projected to a {wanted}"
            ))
            .in_expression(self.source.source(), (0, self.source.source().len())));
        }
        Ok(())
    }

    fn wrong_type(&self, wanted: &str) -> CompilationError {
        CompilationError::InvalidType(format!(
            "expected the expression to evaluate to a {wanted}, but it evaluates to a {}",
            self.output
        ))
        .in_expression(self.source.source(), (0, self.source.source().len()))
    }

    /// Projection to an integer.
    pub fn as_integer(
        &self,
    ) -> Result<impl Fn(&Parameters) -> Result<i64, EvaluationError>, CompilationError> {
        self.require_scalar("integer")?;
        if self.output != ExpressionType::Integer {
            return Err(self.wrong_type("integer"));
        }
        let root = Arc::clone(&self.root);
        let source = self.source.clone();
        Ok(move |parameters: &Parameters| {
            match eval_node(&root, parameters)
                .map_err(|err| err.in_expression(source.source()))?
            {
                Value::Integer(v) => Ok(v),
                other => Err(EvaluationError::Compilation(CompilationError::InvalidType(
                    format!("expected an integer, got {other}"),
                ))),
            }
        })
    }

    /// Projection to a float. Integers promote; quantities do not.
    pub fn as_float(
        &self,
    ) -> Result<impl Fn(&Parameters) -> Result<f64, EvaluationError>, CompilationError> {
        self.require_scalar("float")?;
        if !matches!(self.output, ExpressionType::Integer | ExpressionType::Float) {
            return Err(self.wrong_type("float"));
        }
        let root = Arc::clone(&self.root);
        let source = self.source.clone();
        Ok(move |parameters: &Parameters| {
            match eval_node(&root, parameters)
                .map_err(|err| err.in_expression(source.source()))?
            {
                Value::Integer(v) => Ok(v as f64),
                Value::Float(v) => Ok(v),
                other => Err(EvaluationError::Compilation(CompilationError::InvalidType(
                    format!("expected a float, got {other}"),
                ))),
            }
        })
    }

    /// Projection to a boolean.
    pub fn as_boolean(
        &self,
    ) -> Result<impl Fn(&Parameters) -> Result<bool, EvaluationError>, CompilationError> {
        self.require_scalar("boolean")?;
        if self.output != ExpressionType::Boolean {
            return Err(self.wrong_type("boolean"));
        }
        let root = Arc::clone(&self.root);
        let source = self.source.clone();
        Ok(move |parameters: &Parameters| {
            match eval_node(&root, parameters)
                .map_err(|err| err.in_expression(source.source()))?
            {
                Value::Boolean(v) => Ok(v),
                other => Err(EvaluationError::Compilation(CompilationError::InvalidType(
                    format!("expected a boolean, got {other}"),
                ))),
            }
        })
    }

    /// Projection to the magnitude of the expression in `unit`. A plain number
    /// converts iff `unit` is dimensionless-compatible; a quantity converts iff the
    /// dimensions agree.
    pub fn as_quantity(
        &self,
        unit: &UnitDef,
    ) -> Result<impl Fn(&Parameters) -> Result<f64, EvaluationError>, CompilationError> {
        self.require_scalar("quantity")?;
        match self.output {
            ExpressionType::Integer | ExpressionType::Float => {
                if !unit.dim.is_dimensionless() {
                    return Err(self.wrong_type(&format!("quantity in {}", unit.name)));
                }
            }
            ExpressionType::Quantity(base) => {
                if base.dimension() != unit.dim {
                    return Err(CompilationError::InvalidDimensionality(format!(
                        "cannot convert a quantity in {base} to {}",
                        unit.name
                    ))
                    .in_expression(self.source.source(), (0, self.source.source().len())));
                }
            }
            ExpressionType::Boolean => return Err(self.wrong_type("quantity")),
        }
        let root = Arc::clone(&self.root);
        let source = self.source.clone();
        let scale = unit.scale;
        let unit_name = unit.name;
        Ok(move |parameters: &Parameters| {
            let value = eval_node(&root, parameters)
                .map_err(|err| err.in_expression(source.source()))?;
            let base_magnitude = value.magnitude().ok_or_else(|| {
                EvaluationError::Compilation(CompilationError::InvalidType(format!(
                    "expected a numeric value, got {value}"
                )))
            })?;
            match scale {
                Scale::Linear(factor) => Ok(base_magnitude / factor),
                Scale::Log { reference } => {
                    let ratio = base_magnitude / reference;
                    if ratio <= 0.0 {
                        return Err(EvaluationError::MathDomain(format!(
                            "cannot express non-positive magnitude {base_magnitude} in {unit_name}"
                        )));
                    }
                    Ok(10.0 * ratio.log10())
                }
            }
        })
    }
}

/// Compile-time operand types. Dimensionless quantities are normalized to floats.
#[derive(Debug, Clone, Copy, PartialEq)]
enum OperandType {
    Boolean,
    Integer,
    Float,
    Quantity(Dimension),
}

impl std::fmt::Display for OperandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperandType::Boolean => write!(f, "boolean"),
            OperandType::Integer => write!(f, "integer"),
            OperandType::Float => write!(f, "float"),
            OperandType::Quantity(dim) => write!(f, "quantity in {dim}"),
        }
    }
}

fn quantity_type(dim: Dimension) -> OperandType {
    if dim.is_dimensionless() {
        OperandType::Float
    } else {
        OperandType::Quantity(dim)
    }
}

/// A bare unit appearing as an operand (e.g. the `MHz` in `x * MHz`).
#[derive(Debug, Clone)]
struct UnitOperand {
    factor: f64,
    dim: Dimension,
    logarithmic: bool,
    name: String,
}

/// Result of compiling one subtree.
enum Compiled {
    Value(Value),
    Unit(UnitOperand),
    Node { node: Node, ty: OperandType },
}

impl Compiled {
    fn ty(&self) -> OperandType {
        match self {
            Compiled::Value(Value::Boolean(_)) => OperandType::Boolean,
            Compiled::Value(Value::Integer(_)) => OperandType::Integer,
            Compiled::Value(Value::Float(_)) => OperandType::Float,
            Compiled::Value(Value::Quantity { unit, .. }) => quantity_type(unit.dimension()),
            Compiled::Node { ty, .. } => *ty,
            Compiled::Unit(_) => unreachable!("unit operands are resolved before typing"),
        }
    }

    fn into_node(self) -> Node {
        match self {
            Compiled::Value(value) => Node::Literal(value),
            Compiled::Node { node, .. } => node,
            Compiled::Unit(_) => unreachable!("unit operands are resolved before lowering"),
        }
    }

    fn constant(&self) -> Option<&Value> {
        match self {
            Compiled::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Compiles an expression against a schema. `time_dependent` permits the reserved
/// identifier `t`.
pub fn compile_expression(
    expression: &Expression,
    ctx: &CompilationContext,
    time_dependent: bool,
) -> Result<CompiledExpression, CompilationError> {
    let source = expression.source();
    let ast = parse(source)?;
    let compiled = compile_ast(&ast, source, ctx, time_dependent)?;
    let whole = (0, source.len());
    match compiled {
        Compiled::Unit(unit) => Err(CompilationError::InvalidType(format!(
            "the expression evaluates to the unit {}, not a value",
            unit.name
        ))
        .in_expression(source, whole)),
        compiled => {
            let output = match compiled.ty() {
                OperandType::Boolean => ExpressionType::Boolean,
                OperandType::Integer => ExpressionType::Integer,
                OperandType::Float => ExpressionType::Float,
                OperandType::Quantity(dim) => ExpressionType::Quantity(BaseUnit::new(dim)),
            };
            Ok(CompiledExpression {
                source: expression.clone(),
                root: Arc::new(compiled.into_node()),
                output,
                time_dependent: time_dependent && is_time_dependent(&ast),
            })
        }
    }
}

fn fold_op_error(err: OpError) -> CompilationError {
    match err {
        OpError::Compile(inner) => inner,
        // A numeric fault on constant operands is a configuration mistake
        OpError::Eval(inner) => CompilationError::InvalidValue(inner.to_string()),
    }
}

fn compile_ast(
    ast: &Ast,
    source: &str,
    ctx: &CompilationContext,
    time_dependent: bool,
) -> Result<Compiled, CompilationError> {
    let here = |err: CompilationError| err.in_expression(source, ast.span);
    match &ast.node {
        AstNode::Integer(value) => Ok(Compiled::Value(Value::Integer(*value))),
        AstNode::Float(value) => Ok(Compiled::Value(Value::Float(*value))),
        AstNode::Quantity { magnitude, unit } => {
            let def = ctx.registry.unit(unit).map_err(here)?;
            let (base_magnitude, base_unit) = ctx.registry.to_base(*magnitude, def);
            Ok(Compiled::Value(match base_unit {
                Some(unit) => Value::Quantity {
                    magnitude: base_magnitude,
                    unit,
                },
                None => Value::Float(base_magnitude),
            }))
        }
        AstNode::Identifier(name) => compile_identifier(name, ctx, time_dependent).map_err(here),
        AstNode::Unary { op, operand } => {
            let operand = compile_ast(operand, source, ctx, time_dependent)?;
            match operand {
                Compiled::Unit(unit) => Err(here(CompilationError::InvalidOperation(format!(
                    "cannot apply unary '{op}' to the bare unit {}",
                    unit.name
                )))),
                Compiled::Value(value) => scalar_unary(*op, value)
                    .map(Compiled::Value)
                    .map_err(|err| here(fold_op_error(err))),
                Compiled::Node { node, ty } => {
                    if ty == OperandType::Boolean {
                        return Err(here(CompilationError::InvalidType(format!(
                            "cannot apply unary '{op}' to a boolean"
                        ))));
                    }
                    if *op == UnaryOp::Plus {
                        return Ok(Compiled::Node { node, ty });
                    }
                    Ok(Compiled::Node {
                        node: Node::Unary {
                            op: *op,
                            operand: Box::new(node),
                        },
                        ty,
                    })
                }
            }
        }
        AstNode::Binary { op, lhs, rhs } => {
            let lhs = compile_ast(lhs, source, ctx, time_dependent)?;
            let rhs = compile_ast(rhs, source, ctx, time_dependent)?;
            compile_binary(*op, lhs, rhs).map_err(here)
        }
        AstNode::Call { function, args } => {
            let function_name = function;
            let function = ScalarFunction::lookup(function_name).ok_or_else(|| {
                here(CompilationError::UndefinedFunction(function_name.clone()))
            })?;
            let (min_args, max_args) = function.arity();
            if args.len() < min_args || args.len() > max_args {
                return Err(here(CompilationError::InvalidOperation(format!(
                    "function {function_name} expects {min_args}..={max_args} argument(s), got {}",
                    args.len()
                ))));
            }
            let mut compiled_args = Vec::with_capacity(args.len());
            for arg in args {
                let compiled = compile_ast(arg, source, ctx, time_dependent)?;
                if let Compiled::Unit(unit) = &compiled {
                    return Err(here(CompilationError::InvalidOperation(format!(
                        "cannot apply the function {function_name} to the bare unit {}",
                        unit.name
                    ))));
                }
                compiled_args.push(compiled);
            }
            if compiled_args.iter().all(|arg| arg.constant().is_some()) {
                let values: Vec<Value> = compiled_args
                    .iter()
                    .map(|arg| *arg.constant().expect("checked constant"))
                    .collect();
                return apply_function(function, &values)
                    .map(Compiled::Value)
                    .map_err(|err| here(fold_op_error(err)));
            }
            let arg_types: Vec<OperandType> = compiled_args.iter().map(Compiled::ty).collect();
            let ty = call_result_type(function, &arg_types).map_err(here)?;
            Ok(Compiled::Node {
                node: Node::Call {
                    function,
                    args: compiled_args.into_iter().map(Compiled::into_node).collect(),
                },
                ty,
            })
        }
    }
}

fn compile_identifier(
    name: &str,
    ctx: &CompilationContext,
    time_dependent: bool,
) -> Result<Compiled, CompilationError> {
    if let Some(def) = ctx.registry.get(name) {
        return Ok(Compiled::Unit(UnitOperand {
            factor: match def.scale {
                Scale::Linear(factor) => factor,
                Scale::Log { .. } => 1.0,
            },
            dim: def.dim,
            logarithmic: def.is_logarithmic(),
            name: def.name.to_string(),
        }));
    }
    if let Some(value) = ctx.schema.constant(name) {
        return Ok(Compiled::Value(*value));
    }
    if let Some(ty) = ctx.schema.variable(name) {
        let operand_ty = match ty {
            ParameterType::Boolean => OperandType::Boolean,
            ParameterType::Integer => OperandType::Integer,
            ParameterType::Float => OperandType::Float,
            ParameterType::Quantity(unit) => quantity_type(unit.dimension()),
        };
        return Ok(Compiled::Node {
            node: Node::Variable {
                name: name.to_string(),
                ty,
            },
            ty: operand_ty,
        });
    }
    if name == "t" && time_dependent {
        return Ok(Compiled::Node {
            node: Node::Time,
            ty: OperandType::Quantity(Dimension::TIME),
        });
    }
    if let Some(value) = builtin_constant(name) {
        return Ok(Compiled::Value(value));
    }
    Err(CompilationError::UndefinedParameter {
        name: name.to_string(),
        suggestion: closest_match(name, ctx.schema.names()),
    })
}

fn compile_binary(op: BinaryOp, lhs: Compiled, rhs: Compiled) -> Result<Compiled, CompilationError> {
    // Bare units only take part in multiplicative operations
    if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
        if let Compiled::Unit(unit) = &lhs {
            return Err(CompilationError::InvalidOperation(format!(
                "cannot use the bare unit {} with '{op}'; write a quantity like \"1 {}\"",
                unit.name, unit.name
            )));
        }
        if let Compiled::Unit(unit) = &rhs {
            return Err(CompilationError::InvalidOperation(format!(
                "cannot use the bare unit {} with '{op}'; write a quantity like \"1 {}\"",
                unit.name, unit.name
            )));
        }
    }
    let lhs = resolve_unit_operand(lhs)?;
    let rhs = resolve_unit_operand(rhs)?;

    if let (Some(&left), Some(&right)) = (lhs.constant(), rhs.constant()) {
        return scalar_binary(op, left, right)
            .map(Compiled::Value)
            .map_err(fold_op_error);
    }

    let ty = binary_result_type(op, lhs.ty(), rhs.ty(), rhs.constant())?;
    Ok(Compiled::Node {
        node: Node::Binary {
            op,
            lhs: Box::new(lhs.into_node()),
            rhs: Box::new(rhs.into_node()),
        },
        ty,
    })
}

/// Turns a bare linear unit into the quantity `1 <unit>` so that multiplicative
/// operators treat it dimensionally. Logarithmic units cannot be used this way.
fn resolve_unit_operand(operand: Compiled) -> Result<Compiled, CompilationError> {
    match operand {
        Compiled::Unit(unit) => {
            if unit.logarithmic {
                return Err(CompilationError::InvalidOperation(format!(
                    "the logarithmic unit {} can only appear in a quantity literal",
                    unit.name
                )));
            }
            Ok(Compiled::Value(if unit.dim.is_dimensionless() {
                Value::Float(unit.factor)
            } else {
                Value::Quantity {
                    magnitude: unit.factor,
                    unit: BaseUnit::new(unit.dim),
                }
            }))
        }
        other => Ok(other),
    }
}

fn binary_result_type(
    op: BinaryOp,
    lt: OperandType,
    rt: OperandType,
    rhs_const: Option<&Value>,
) -> Result<OperandType, CompilationError> {
    if lt == OperandType::Boolean || rt == OperandType::Boolean {
        return Err(CompilationError::InvalidType(format!(
            "cannot apply '{op}' to boolean operands"
        )));
    }
    match op {
        BinaryOp::Add | BinaryOp::Sub => match (lt, rt) {
            (OperandType::Integer, OperandType::Integer) => Ok(OperandType::Integer),
            (OperandType::Quantity(d1), OperandType::Quantity(d2)) => {
                if d1 == d2 {
                    Ok(OperandType::Quantity(d1))
                } else {
                    Err(CompilationError::InvalidDimensionality(format!(
                        "cannot combine quantities in {d1} and {d2} with '{op}'"
                    )))
                }
            }
            (OperandType::Quantity(d), _) | (_, OperandType::Quantity(d)) => {
                Err(CompilationError::InvalidDimensionality(format!(
                    "cannot add a pure number to a quantity in {d}"
                )))
            }
            _ => Ok(OperandType::Float),
        },
        BinaryOp::Mul | BinaryOp::Div => {
            if op == BinaryOp::Mul && lt == OperandType::Integer && rt == OperandType::Integer {
                return Ok(OperandType::Integer);
            }
            let ld = match lt {
                OperandType::Quantity(d) => d,
                _ => Dimension::DIMENSIONLESS,
            };
            let rd = match rt {
                OperandType::Quantity(d) => d,
                _ => Dimension::DIMENSIONLESS,
            };
            let dim = if op == BinaryOp::Mul { ld.mul(rd) } else { ld.div(rd) };
            Ok(quantity_type(dim))
        }
        BinaryOp::Pow => {
            match rt {
                OperandType::Integer | OperandType::Float => {}
                _ => {
                    return Err(CompilationError::InvalidOperation(
                        "the exponent of '**' must be a real number".to_string(),
                    ))
                }
            }
            match lt {
                OperandType::Integer => match rhs_const {
                    Some(Value::Integer(n)) if *n >= 0 => Ok(OperandType::Integer),
                    _ => Ok(OperandType::Float),
                },
                OperandType::Float => Ok(OperandType::Float),
                OperandType::Quantity(dim) => {
                    let exponent = match rhs_const {
                        Some(value) => value.magnitude().expect("numeric exponent"),
                        None => {
                            return Err(CompilationError::InvalidOperation(
                                "the exponent of a dimensioned base must be a constant".to_string(),
                            ))
                        }
                    };
                    let result = quantity_pow_dimension(BaseUnit::new(dim), exponent)
                        .map_err(fold_op_error)?;
                    Ok(quantity_type(result))
                }
                OperandType::Boolean => unreachable!("filtered above"),
            }
        }
    }
}

fn call_result_type(
    function: ScalarFunction,
    args: &[OperandType],
) -> Result<OperandType, CompilationError> {
    let name = function.name();
    let reject_boolean = |ty: OperandType| {
        if ty == OperandType::Boolean {
            Err(CompilationError::InvalidType(format!(
                "cannot apply {name} to a boolean"
            )))
        } else {
            Ok(())
        }
    };
    match function {
        ScalarFunction::Sqrt => {
            reject_boolean(args[0])?;
            match args[0] {
                OperandType::Quantity(dim) => {
                    let halved = dim.try_sqrt().ok_or_else(|| {
                        CompilationError::InvalidDimensionality(format!(
                            "cannot take the square root of a quantity in {dim}"
                        ))
                    })?;
                    Ok(quantity_type(halved))
                }
                _ => Ok(OperandType::Float),
            }
        }
        ScalarFunction::Abs => {
            reject_boolean(args[0])?;
            Ok(args[0])
        }
        ScalarFunction::Min | ScalarFunction::Max => {
            reject_boolean(args[0])?;
            reject_boolean(args[1])?;
            match (args[0], args[1]) {
                (OperandType::Integer, OperandType::Integer) => Ok(OperandType::Integer),
                (OperandType::Quantity(d1), OperandType::Quantity(d2)) => {
                    if d1 == d2 {
                        Ok(OperandType::Quantity(d1))
                    } else {
                        Err(CompilationError::InvalidDimensionality(format!(
                            "cannot compare quantities in {d1} and {d2}"
                        )))
                    }
                }
                (OperandType::Quantity(d), _) | (_, OperandType::Quantity(d)) => {
                    Err(CompilationError::InvalidDimensionality(format!(
                        "cannot compare a pure number with a quantity in {d}"
                    )))
                }
                _ => Ok(OperandType::Float),
            }
        }
        ScalarFunction::SquareWave => {
            for arg in args {
                reject_boolean(*arg)?;
                if let OperandType::Quantity(dim) = arg {
                    return Err(CompilationError::InvalidDimensionality(format!(
                        "the arguments of square_wave must be dimensionless, got a quantity in {dim}"
                    )));
                }
            }
            Ok(OperandType::Boolean)
        }
        _ => {
            // Remaining single-argument functions want a dimensionless number
            reject_boolean(args[0])?;
            if let OperandType::Quantity(dim) = args[0] {
                return Err(CompilationError::InvalidDimensionality(format!(
                    "the argument of {name} must be dimensionless, got a quantity in {dim}"
                )));
            }
            Ok(OperandType::Float)
        }
    }
}

/// Nearest-match suggestion for an unknown name, in the spirit of difflib's
/// `get_close_matches`: the closest candidate by edit distance, if close enough.
fn closest_match<'a>(name: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let distance = levenshtein(name, candidate);
        if best.map_or(true, |(best_distance, _)| distance < best_distance) {
            best = Some((distance, candidate));
        }
    }
    let (distance, candidate) = best?;
    let longest = name.chars().count().max(candidate.chars().count());
    // Similarity cutoff around 0.6, like difflib
    (distance * 5 <= longest * 2).then(|| candidate.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
