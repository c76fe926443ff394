//! Parameter values, types, and the sequence-wide parameter schema.
//!
//! A [`Value`] is what an expression evaluates to and what a shot binds to a dotted
//! parameter name. Dimensioned values are always held in base units
//! ([`crate::units`]), so two quantities of the same dimension compare and combine
//! directly.
//!
//! The [`ParameterSchema`] splits names into *constants* (values fixed for a whole
//! sequence, known at expression-compile time) and *variables* (typed slots whose
//! values change from shot to shot). The two name sets never overlap.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CompilationError;
use crate::units::BaseUnit;

/// A scalar value: boolean, integer, float, or dimensioned quantity in base units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Quantity { magnitude: f64, unit: BaseUnit },
}

impl Value {
    pub fn ty(&self) -> ParameterType {
        match self {
            Value::Boolean(_) => ParameterType::Boolean,
            Value::Integer(_) => ParameterType::Integer,
            Value::Float(_) => ParameterType::Float,
            Value::Quantity { unit, .. } => ParameterType::Quantity(*unit),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_) | Value::Quantity { .. })
    }

    /// The magnitude of a numeric value, in base units for quantities.
    pub fn magnitude(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Quantity { magnitude, .. } => Some(*magnitude),
            Value::Boolean(_) => None,
        }
    }

    pub fn base_unit(&self) -> Option<BaseUnit> {
        match self {
            Value::Quantity { unit, .. } => Some(*unit),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Quantity { magnitude, unit } => write!(f, "{magnitude} {unit}"),
        }
    }
}

/// The type of a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterType {
    Boolean,
    Integer,
    Float,
    Quantity(BaseUnit),
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterType::Boolean => write!(f, "boolean"),
            ParameterType::Integer => write!(f, "integer"),
            ParameterType::Float => write!(f, "float"),
            ParameterType::Quantity(unit) => write!(f, "quantity in {unit}"),
        }
    }
}

/// Concrete per-shot parameter bindings: dotted name to value.
pub type Parameters = IndexMap<String, Value>;

/// The types of every parameter of a sequence, split into constants and variables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterSchema {
    constants: IndexMap<String, Value>,
    variables: IndexMap<String, ParameterType>,
}

impl ParameterSchema {
    /// Builds a schema, rejecting any name declared both constant and variable.
    pub fn new(
        constants: IndexMap<String, Value>,
        variables: IndexMap<String, ParameterType>,
    ) -> Result<ParameterSchema, CompilationError> {
        for name in constants.keys() {
            if variables.contains_key(name) {
                return Err(CompilationError::InvalidValue(format!(
                    "parameter \"{name}\" is declared both constant and variable"
                )));
            }
        }
        Ok(ParameterSchema { constants, variables })
    }

    pub fn empty() -> ParameterSchema {
        ParameterSchema::default()
    }

    /// A schema in which every binding of `parameters` is a constant. This is how
    /// the shot compiler evaluates expressions: all values are known, so compiled
    /// expressions fold to literals.
    pub fn of_constants(parameters: &Parameters) -> ParameterSchema {
        ParameterSchema {
            constants: parameters.clone(),
            variables: IndexMap::new(),
        }
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<ParameterType> {
        self.variables.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constants.contains_key(name) || self.variables.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constants
            .keys()
            .chain(self.variables.keys())
            .map(String::as_str)
    }

    /// The declared type of a parameter, constant or variable.
    pub fn ty(&self, name: &str) -> Option<ParameterType> {
        if let Some(value) = self.constants.get(name) {
            return Some(value.ty());
        }
        self.variables.get(name).copied()
    }
}
