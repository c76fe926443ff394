//! Recoverable error taxonomy of the shot compiler.
//!
//! Every fault a user can cause (a typo in an expression, a unit mismatch, a ramp
//! placed at a lane boundary) surfaces as one of the types below rather than a panic.
//! The taxonomy mirrors the compilation pipeline:
//!
//! - [`CompilationError`] - an expression or configuration failed to compile. Name
//!   resolution, type and dimensionality checks, and structural validation all live
//!   here. When the fault is tied to a region of an expression, the error wraps the
//!   source with the offending span underlined.
//! - [`EvaluationError`] - an otherwise well-typed expression failed at shot
//!   evaluation time (division by zero, log of a non-positive number, a parameter
//!   with no bound value).
//! - [`SequencerCompilationError`] - the per-device aggregate. Channel errors are
//!   collected, not short-circuited, so a single compile call reports every faulty
//!   channel at once.
//!
//! Panics are reserved for internal invariant breaches (out-of-bounds instruction
//! slicing panics the same way `std` slices do).

use thiserror::Error;

/// Byte span of a region inside an expression source string.
/// Start is inclusive, end is exclusive.
pub type Span = (usize, usize);

/// Reproduces `source` with the `span` region underlined (ANSI escape codes),
/// so terminals show the user exactly which part of the expression is at fault.
pub fn underline(source: &str, span: Span) -> String {
    let start = span.0.min(source.len());
    let stop = span.1.clamp(start, source.len());
    format!(
        "{}\u{1b}[4m{}\u{1b}[0m{}",
        &source[..start],
        &source[start..stop],
        &source[stop..]
    )
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" Did you mean \"{name}\"?"),
        None => String::new(),
    }
}

/// An expression or configuration failed to compile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompilationError {
    /// Wraps a cause with the offending expression, the faulty region underlined.
    #[error("an error occurred while compiling \"{underlined}\"")]
    InExpression {
        underlined: String,
        #[source]
        cause: Box<CompilationError>,
    },

    #[error("invalid syntax: {0}")]
    Syntax(String),

    #[error("parameter \"{name}\" is not defined.{}", did_you_mean(.suggestion))]
    UndefinedParameter {
        name: String,
        suggestion: Option<String>,
    },

    #[error("unit \"{0}\" is not defined")]
    UndefinedUnit(String),

    #[error("function \"{0}\" is not defined")]
    UndefinedFunction(String),

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("invalid dimensionality: {0}")]
    InvalidDimensionality(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl CompilationError {
    /// Wraps `self` with the expression it occurred in, underlining `span`.
    pub fn in_expression(self, source: &str, span: Span) -> CompilationError {
        CompilationError::InExpression {
            underlined: underline(source, span),
            cause: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any [`CompilationError::InExpression`] layers.
    pub fn root(&self) -> &CompilationError {
        match self {
            CompilationError::InExpression { cause, .. } => cause.root(),
            other => other,
        }
    }
}

/// A well-typed expression failed while being evaluated against concrete parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    /// Wraps a cause with the expression being evaluated.
    #[error("could not evaluate \"{expression}\"")]
    InExpression {
        expression: String,
        #[source]
        cause: Box<EvaluationError>,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("math domain error: {0}")]
    MathDomain(String),

    #[error("result of \"{0}\" is not finite")]
    NotFinite(String),

    #[error("parameter \"{0}\" has no value bound")]
    MissingParameter(String),

    #[error(transparent)]
    Compilation(#[from] CompilationError),
}

impl EvaluationError {
    pub fn in_expression(self, source: &str) -> EvaluationError {
        EvaluationError::InExpression {
            expression: source.to_string(),
            cause: Box::new(self),
        }
    }

    /// The innermost compilation error, if this evaluation failure wraps one.
    pub fn compilation_root(&self) -> Option<&CompilationError> {
        match self {
            EvaluationError::InExpression { cause, .. } => cause.compilation_root(),
            EvaluationError::Compilation(inner) => Some(inner.root()),
            _ => None,
        }
    }
}

/// Error of a single channel, kept alongside the channel's position and description.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("channel {index} ({description}): {cause}")]
pub struct ChannelError {
    pub index: usize,
    pub description: String,
    #[source]
    pub cause: EvaluationError,
}

fn list_channel_errors(errors: &[ChannelError]) -> String {
    errors
        .iter()
        .map(|err| format!("\n\t{err}"))
        .collect::<String>()
}

/// Aggregate error of one sequencer device: every channel that failed to compile,
/// reported in one pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("errors occurred when evaluating outputs for device {device}:{}", list_channel_errors(.channel_errors))]
pub struct SequencerCompilationError {
    pub device: String,
    pub channel_errors: Vec<ChannelError>,
}

/// Whole-shot compilation failure: either the shared timeline could not be
/// evaluated, or one or more devices failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShotCompilationError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("compilation failed for {} device(s)", .0.len())]
    Devices(Vec<SequencerCompilationError>),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn underline_marks_span() {
        let marked = underline("1 + oops", (4, 8));
        assert!(marked.starts_with("1 + "));
        assert!(marked.contains("\u{1b}[4moops\u{1b}[0m"));
    }

    #[test]
    fn underline_clamps_out_of_range_span() {
        // A span beyond the source must not panic
        let marked = underline("abc", (10, 20));
        assert!(marked.contains("abc"));
    }

    #[test]
    fn root_unwraps_nested_context() {
        let err = CompilationError::UndefinedUnit("XHz".to_string())
            .in_expression("1 XHz", (2, 5))
            .in_expression("1 XHz + 2", (0, 5));
        assert_eq!(err.root(), &CompilationError::UndefinedUnit("XHz".to_string()));
    }

    #[test]
    fn suggestion_is_rendered() {
        let err = CompilationError::UndefinedParameter {
            name: "mot_loading.duratoin".to_string(),
            suggestion: Some("mot_loading.duration".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Did you mean \"mot_loading.duration\"?"));
    }
}
