//! Exact time representation and tick arithmetic.
//!
//! Shot-local times and device time steps are held as integer femtosecond counts -
//! a rational over nanoseconds with fixed denominator 10^6. Accumulating step
//! durations and dividing by a time step are exact integer operations, so adjacent
//! lane blocks never gain or lose a tick to floating-point drift. Floats only appear
//! when a time is turned into a sample value.
//!
//! Tick convention: `start_tick` is the ceiling of `t / Δt` and gives the first tick
//! covered by an interval starting at `t`; `stop_tick` is the same ceiling applied to
//! the exclusive end. `number_ticks(a, b, Δt) = stop_tick(b) - start_tick(a)`, so the
//! tick count of adjacent intervals always adds up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter;
use std::ops::{Add, Sub};

use crate::error::CompilationError;

const FS_PER_NS: i128 = 1_000_000;
const FS_PER_SEC: i128 = 1_000_000_000_000_000;

/// A shot-local point in time (or duration), in integer femtoseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Time {
    fs: i128,
}

impl Time {
    pub const ZERO: Time = Time { fs: 0 };

    /// Converts seconds to a `Time`, rounding to the nearest femtosecond.
    ///
    /// Durations must be finite and non-negative.
    pub fn from_secs(secs: f64) -> Result<Time, CompilationError> {
        if !secs.is_finite() {
            return Err(CompilationError::InvalidValue(format!(
                "duration {secs} is not finite"
            )));
        }
        if secs < 0.0 {
            return Err(CompilationError::InvalidValue(format!(
                "duration {secs} s is negative"
            )));
        }
        Ok(Time {
            fs: (secs * FS_PER_SEC as f64).round() as i128,
        })
    }

    pub fn from_femtoseconds(fs: i128) -> Time {
        Time { fs }
    }

    pub fn to_secs(self) -> f64 {
        self.fs as f64 / FS_PER_SEC as f64
    }

    pub fn femtoseconds(self) -> i128 {
        self.fs
    }
}

impl Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time { fs: self.fs + rhs.fs }
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time { fs: self.fs - rhs.fs }
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} s", self.to_secs())
    }
}

/// The sample clock period of a device, in integer femtoseconds. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeStep {
    fs: i128,
}

impl TimeStep {
    /// Builds a time step from a nanosecond value. Fractional nanoseconds are
    /// allowed down to femtosecond resolution.
    pub fn from_ns(ns: f64) -> Result<TimeStep, CompilationError> {
        if !ns.is_finite() || ns <= 0.0 {
            return Err(CompilationError::InvalidValue(format!(
                "time step {ns} ns must be positive"
            )));
        }
        let fs = (ns * FS_PER_NS as f64).round() as i128;
        if fs == 0 {
            return Err(CompilationError::InvalidValue(format!(
                "time step {ns} ns is below femtosecond resolution"
            )));
        }
        Ok(TimeStep { fs })
    }

    pub fn to_secs(self) -> f64 {
        self.fs as f64 / FS_PER_SEC as f64
    }

    /// The time covered by `ticks` sample clock periods.
    pub fn times(self, ticks: usize) -> Time {
        Time {
            fs: self.fs * ticks as i128,
        }
    }

    /// Returns `Some(m)` when `self` is exactly `m` times `other`.
    pub fn multiple_of(self, other: TimeStep) -> Option<u64> {
        if self.fs % other.fs == 0 {
            Some((self.fs / other.fs) as u64)
        } else {
            None
        }
    }

    pub fn femtoseconds(self) -> i128 {
        self.fs
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ns", self.fs as f64 / FS_PER_NS as f64)
    }
}

fn ceil_div(num: i128, den: i128) -> i128 {
    debug_assert!(num >= 0 && den > 0);
    (num + den - 1) / den
}

/// First tick index covered by an interval starting at `t` (inclusive).
pub fn start_tick(t: Time, time_step: TimeStep) -> usize {
    ceil_div(t.fs, time_step.fs) as usize
}

/// One past the last tick index covered by an interval ending at `t` (exclusive).
pub fn stop_tick(t: Time, time_step: TimeStep) -> usize {
    ceil_div(t.fs, time_step.fs) as usize
}

/// Number of ticks between `start` and `stop`.
pub fn number_ticks(start: Time, stop: Time, time_step: TimeStep) -> usize {
    debug_assert!(start <= stop);
    stop_tick(stop, time_step) - start_tick(start, time_step)
}

/// Rounds a duration to the nearest whole number of ticks (half away from zero).
pub fn duration_to_ticks(duration: Time, time_step: TimeStep) -> usize {
    ((2 * duration.fs + time_step.fs) / (2 * time_step.fs)) as usize
}

/// Exact prefix sums of the step durations, starting at zero. The result has one
/// more element than the input; the last element is the total extent.
pub fn step_bounds(durations: impl IntoIterator<Item = Time>) -> Vec<Time> {
    iter::once(Time::ZERO)
        .chain(durations.into_iter().scan(Time::ZERO, |acc, d| {
            *acc = *acc + d;
            Some(*acc)
        }))
        .collect()
}
