//! The unit registry and dimensional bookkeeping.
//!
//! The registry is a fixed, closed table loaded once by [`UnitRegistry::new`] and then
//! passed by reference through the compilation contexts - evaluation code never
//! reaches into a global. Each unit maps a magnitude into the canonical *base unit*
//! of its dimension: volts for electric potential, hertz for frequency, seconds for
//! time, and so on. Logarithmic units (`dB`, `dBm`) convert to their linear base
//! counterpart on construction, so downstream code only ever sees linear magnitudes.
//!
//! Dimensions are integer exponent vectors over the SI base (s, m, kg, A, K, mol, cd).
//! Angles and ratios (`rad`, `deg`, `%`, `dB`) are dimensionless: converting them to
//! base yields a plain number.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CompilationError, EvaluationError};

/// Number of SI base dimensions tracked: s, m, kg, A, K, mol, cd.
const NUM_DIMS: usize = 7;

const DIM_NAMES: [&str; NUM_DIMS] = ["s", "m", "kg", "A", "K", "mol", "cd"];

/// Integer exponents over the SI base dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    exps: [i8; NUM_DIMS],
}

impl Dimension {
    pub const DIMENSIONLESS: Dimension = Dimension { exps: [0; NUM_DIMS] };
    pub const TIME: Dimension = Dimension::base(0);
    pub const LENGTH: Dimension = Dimension::base(1);
    pub const MASS: Dimension = Dimension::base(2);
    pub const CURRENT: Dimension = Dimension::base(3);
    pub const FREQUENCY: Dimension = Dimension {
        exps: [-1, 0, 0, 0, 0, 0, 0],
    };
    pub const POWER: Dimension = Dimension {
        exps: [-3, 2, 1, 0, 0, 0, 0],
    };
    pub const VOLTAGE: Dimension = Dimension {
        exps: [-3, 2, 1, -1, 0, 0, 0],
    };

    const fn base(idx: usize) -> Dimension {
        let mut exps = [0i8; NUM_DIMS];
        exps[idx] = 1;
        Dimension { exps }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.exps.iter().all(|&e| e == 0)
    }

    pub fn mul(self, other: Dimension) -> Dimension {
        let mut exps = [0i8; NUM_DIMS];
        for i in 0..NUM_DIMS {
            exps[i] = self.exps[i] + other.exps[i];
        }
        Dimension { exps }
    }

    pub fn div(self, other: Dimension) -> Dimension {
        let mut exps = [0i8; NUM_DIMS];
        for i in 0..NUM_DIMS {
            exps[i] = self.exps[i] - other.exps[i];
        }
        Dimension { exps }
    }

    pub fn pow(self, exponent: i32) -> Dimension {
        let mut exps = [0i8; NUM_DIMS];
        for i in 0..NUM_DIMS {
            exps[i] = (self.exps[i] as i32 * exponent) as i8;
        }
        Dimension { exps }
    }

    /// Halves every exponent, or `None` if any exponent is odd.
    pub fn try_sqrt(self) -> Option<Dimension> {
        let mut exps = [0i8; NUM_DIMS];
        for i in 0..NUM_DIMS {
            if self.exps[i] % 2 != 0 {
                return None;
            }
            exps[i] = self.exps[i] / 2;
        }
        Some(Dimension { exps })
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", compose_name(*self))
    }
}

/// The canonical representative of a dimension; every dimensioned value in the
/// compiler is expressed in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseUnit {
    dim: Dimension,
}

impl BaseUnit {
    pub const SECOND: BaseUnit = BaseUnit { dim: Dimension::TIME };

    pub fn new(dim: Dimension) -> BaseUnit {
        BaseUnit { dim }
    }

    pub fn dimension(&self) -> Dimension {
        self.dim
    }
}

impl fmt::Display for BaseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", compose_name(self.dim))
    }
}

/// Well-known base unit symbols, checked before composing a name from exponents.
const CANONICAL_NAMES: [(Dimension, &str); 7] = [
    (Dimension::TIME, "s"),
    (Dimension::LENGTH, "m"),
    (Dimension::MASS, "kg"),
    (Dimension::CURRENT, "A"),
    (Dimension::FREQUENCY, "Hz"),
    (Dimension::POWER, "W"),
    (Dimension::VOLTAGE, "V"),
];

fn compose_name(dim: Dimension) -> String {
    if dim.is_dimensionless() {
        return "dimensionless".to_string();
    }
    for (known, name) in CANONICAL_NAMES {
        if known == dim {
            return name.to_string();
        }
    }
    let mut parts = Vec::new();
    for (idx, &exp) in dim.exps.iter().enumerate() {
        match exp {
            0 => {}
            1 => parts.push(DIM_NAMES[idx].to_string()),
            _ => parts.push(format!("{}^{}", DIM_NAMES[idx], exp)),
        }
    }
    parts.join(" * ")
}

/// How a unit's magnitude maps onto its base unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// `base = magnitude * factor`
    Linear(f64),
    /// `base = 10^(magnitude / 10) * reference` (decibel family)
    Log { reference: f64 },
}

/// One entry of the unit table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitDef {
    pub name: &'static str,
    pub dim: Dimension,
    pub scale: Scale,
}

impl UnitDef {
    pub fn is_logarithmic(&self) -> bool {
        matches!(self.scale, Scale::Log { .. })
    }
}

const D: Dimension = Dimension::DIMENSIONLESS;

const fn lin(name: &'static str, dim: Dimension, factor: f64) -> UnitDef {
    UnitDef {
        name,
        dim,
        scale: Scale::Linear(factor),
    }
}

const UNIT_TABLE: &[UnitDef] = &[
    // time
    lin("s", Dimension::TIME, 1.0),
    lin("ms", Dimension::TIME, 1e-3),
    lin("us", Dimension::TIME, 1e-6),
    lin("µs", Dimension::TIME, 1e-6),
    lin("ns", Dimension::TIME, 1e-9),
    // frequency
    lin("Hz", Dimension::FREQUENCY, 1.0),
    lin("kHz", Dimension::FREQUENCY, 1e3),
    lin("MHz", Dimension::FREQUENCY, 1e6),
    lin("GHz", Dimension::FREQUENCY, 1e9),
    lin("THz", Dimension::FREQUENCY, 1e12),
    // power
    lin("W", Dimension::POWER, 1.0),
    lin("mW", Dimension::POWER, 1e-3),
    UnitDef {
        name: "dBm",
        dim: Dimension::POWER,
        scale: Scale::Log { reference: 1e-3 },
    },
    // ratios
    UnitDef {
        name: "dB",
        dim: D,
        scale: Scale::Log { reference: 1.0 },
    },
    lin("%", D, 1e-2),
    // current
    lin("A", Dimension::CURRENT, 1.0),
    lin("mA", Dimension::CURRENT, 1e-3),
    // voltage
    lin("V", Dimension::VOLTAGE, 1.0),
    lin("mV", Dimension::VOLTAGE, 1e-3),
    // length
    lin("m", Dimension::LENGTH, 1.0),
    lin("mm", Dimension::LENGTH, 1e-3),
    lin("um", Dimension::LENGTH, 1e-6),
    lin("µm", Dimension::LENGTH, 1e-6),
    lin("nm", Dimension::LENGTH, 1e-9),
    // angles (dimensionless, radian base)
    lin("rad", D, 1.0),
    lin("deg", D, std::f64::consts::PI / 180.0),
    lin("°", D, std::f64::consts::PI / 180.0),
];

/// The closed unit vocabulary, resolved by name.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    units: indexmap::IndexMap<&'static str, UnitDef>,
}

impl UnitRegistry {
    pub fn new() -> UnitRegistry {
        let mut units = indexmap::IndexMap::with_capacity(UNIT_TABLE.len());
        for def in UNIT_TABLE {
            units.insert(def.name, *def);
        }
        UnitRegistry { units }
    }

    pub fn get(&self, name: &str) -> Option<&UnitDef> {
        self.units.get(name)
    }

    pub fn is_unit(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Resolves a unit name, failing with [`CompilationError::UndefinedUnit`].
    pub fn unit(&self, name: &str) -> Result<&UnitDef, CompilationError> {
        self.get(name)
            .ok_or_else(|| CompilationError::UndefinedUnit(name.to_string()))
    }

    /// Converts a magnitude expressed in `unit` into the base unit of its dimension.
    /// Dimensionless results carry no unit.
    pub fn to_base(&self, magnitude: f64, unit: &UnitDef) -> (f64, Option<BaseUnit>) {
        let base_magnitude = match unit.scale {
            Scale::Linear(factor) => magnitude * factor,
            Scale::Log { reference } => 10f64.powf(magnitude / 10.0) * reference,
        };
        let base_unit = if unit.dim.is_dimensionless() {
            None
        } else {
            Some(BaseUnit { dim: unit.dim })
        };
        (base_magnitude, base_unit)
    }

    /// Expresses a base-unit magnitude in `unit`. The caller must have checked
    /// dimensional compatibility beforehand.
    pub fn from_base(&self, base_magnitude: f64, unit: &UnitDef) -> Result<f64, EvaluationError> {
        match unit.scale {
            Scale::Linear(factor) => Ok(base_magnitude / factor),
            Scale::Log { reference } => {
                let ratio = base_magnitude / reference;
                if ratio <= 0.0 {
                    return Err(EvaluationError::MathDomain(format!(
                        "cannot express non-positive magnitude {base_magnitude} in {}",
                        unit.name
                    )));
                }
                Ok(10.0 * ratio.log10())
            }
        }
    }

    pub fn is_compatible(&self, left: &UnitDef, right: &UnitDef) -> bool {
        left.dim == right.dim
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        UnitRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn vocabulary_is_resolved() {
        let reg = UnitRegistry::new();
        for name in [
            "s", "ms", "us", "ns", "Hz", "kHz", "MHz", "GHz", "THz", "W", "mW", "dBm", "dB", "A",
            "mA", "V", "mV", "m", "mm", "um", "nm", "deg", "rad", "°", "%",
        ] {
            assert!(reg.is_unit(name), "unit {name} missing from the table");
        }
        assert!(matches!(
            reg.unit("XHz"),
            Err(CompilationError::UndefinedUnit(_))
        ));
    }

    #[test]
    fn linear_units_convert_to_base() {
        let reg = UnitRegistry::new();
        let (mag, unit) = reg.to_base(1.2, reg.get("MHz").unwrap());
        assert_approx_eq!(f64, mag, 1.2e6);
        assert_eq!(unit, Some(BaseUnit::new(Dimension::FREQUENCY)));

        let (mag, unit) = reg.to_base(100.0, reg.get("mV").unwrap());
        assert_approx_eq!(f64, mag, 0.1);
        assert_eq!(unit.unwrap().to_string(), "V");
    }

    #[test]
    fn log_units_convert_to_linear_base() {
        let reg = UnitRegistry::new();
        let (mag, unit) = reg.to_base(0.0, reg.get("dB").unwrap());
        assert_approx_eq!(f64, mag, 1.0);
        assert_eq!(unit, None);

        let (mag, _) = reg.to_base(10.0, reg.get("dB").unwrap());
        assert_approx_eq!(f64, mag, 10.0);

        // 30 dBm = 1 W
        let (mag, unit) = reg.to_base(30.0, reg.get("dBm").unwrap());
        assert_approx_eq!(f64, mag, 1.0, epsilon = 1e-12);
        assert_eq!(unit, Some(BaseUnit::new(Dimension::POWER)));
    }

    #[test]
    fn from_base_round_trips() {
        let reg = UnitRegistry::new();
        let khz = reg.get("kHz").unwrap();
        let (base, _) = reg.to_base(2.5, khz);
        assert_approx_eq!(f64, reg.from_base(base, khz).unwrap(), 2.5);

        let dbm = reg.get("dBm").unwrap();
        let (base, _) = reg.to_base(7.0, dbm);
        assert_approx_eq!(f64, reg.from_base(base, dbm).unwrap(), 7.0, epsilon = 1e-12);

        assert!(reg.from_base(-1.0, reg.get("dB").unwrap()).is_err());
    }

    #[test]
    fn angles_are_dimensionless() {
        let reg = UnitRegistry::new();
        let (mag, unit) = reg.to_base(90.0, reg.get("°").unwrap());
        assert_approx_eq!(f64, mag, std::f64::consts::FRAC_PI_2);
        assert_eq!(unit, None);
    }

    #[test]
    fn dimension_algebra() {
        let hz = Dimension::FREQUENCY;
        let s = Dimension::TIME;
        assert!(hz.mul(s).is_dimensionless());
        assert_eq!(s.pow(2).try_sqrt(), Some(s));
        assert_eq!(s.try_sqrt(), None);
        assert_eq!(Dimension::VOLTAGE.to_string(), "V");
        assert_eq!(s.pow(-1), hz);
    }
}
