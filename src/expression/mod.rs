//! Expression parsing, compilation, and evaluation.
//!
//! Expressions are data, not code: a source string is parsed into a span-carrying
//! AST ([`ast`]), compiled against a [`crate::parameter::ParameterSchema`] into a
//! typed intermediate form with eager constant folding ([`compile`]), and only then
//! evaluated - either to a scalar [`crate::parameter::Value`] ([`evaluate`]) or,
//! when the reserved identifier `t` is allowed, to a compressed waveform over a tick
//! grid ([`time_dependent`]).
//!
//! The grammar (normative):
//!
//! ```text
//! expression     := additive
//! additive       := multiplicative (('+'|'-') multiplicative)*
//! multiplicative := power          (('*'|'/') power)*
//! power          := unary          ('**' unary)?
//! unary          := ('+'|'-')? primary
//! primary        := number unit? | identifier | identifier '(' args? ')' | '(' expression ')'
//! args           := expression (',' expression)*
//! identifier     := [A-Za-z_][A-Za-z_0-9]* ('.' [A-Za-z_][A-Za-z_0-9]*)*
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ast;
pub mod compile;
pub mod evaluate;
pub mod parse;
pub mod time_dependent;

pub use compile::{compile_expression, CompilationContext, CompiledExpression, ExpressionType};
pub use evaluate::evaluate_scalar;
pub use time_dependent::{
    evaluate_time_dependent, evaluate_time_dependent_digital, EvaluationResult,
};

/// A human-authored arithmetic expression, kept as its source string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expression(String);

impl Expression {
    pub fn new(source: impl Into<String>) -> Expression {
        Expression(source.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Expression {
    fn from(source: &str) -> Expression {
        Expression::new(source)
    }
}
