//! The compressed timed-instruction tree - the central data structure of the compiler.
//!
//! A [`TimedInstruction`] represents a fixed-length sequence of samples of a single
//! dtype (`bool` or `f64`) without materializing them. Four variants cover the shapes
//! a sequencer program is made of:
//!
//! - [`Pattern`] - literal samples.
//! - [`Concatenated`] - ordered children covering adjacent, disjoint tick ranges.
//! - [`Repeated`] - `count` repetitions of a child instruction.
//! - [`Ramp`] - a linear segment, kept symbolic so a ten-minute ramp at nanosecond
//!   resolution costs three words instead of gigabytes.
//!
//! Instructions are immutable values: every operation returns a new tree and all
//! operations are polynomial in the *tree size*, never in the expanded sample count.
//! Expansion to a flat buffer ([`TimedInstruction::to_array`] /
//! [`TimedInstruction::fill_into`]) is the explicit opt-in used at the device
//! boundary.
//!
//! ## Normalization
//!
//! [`TimedInstruction::concat`] normalizes as it builds: empty parts are dropped,
//! adjacent patterns merge, identical consecutive children collapse into a
//! [`Repeated`], and a fully periodic child list becomes a single [`Repeated`] over
//! one period. [`TimedInstruction::normalize`] applies the same rules recursively and
//! is idempotent, which is what makes the serialized wire form round-trip exactly.
//!
//! ## Slicing
//!
//! `slice` follows `std` slice conventions (panics on an out-of-bounds range - an
//! internal invariant breach, not a user-recoverable fault) and preserves structure
//! where possible: slicing a repetition across whole periods yields a repetition,
//! slicing inside a ramp yields a shorter ramp.

use ndarray::{Array1, ArrayViewMut1};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;

use crate::error::CompilationError;

/// Sample dtypes a sequencer channel can emit.
pub trait Sample:
    Copy + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Sample `idx` of a linear ramp of `len` samples from `start` to `stop`.
    fn interpolate(start: Self, stop: Self, idx: usize, len: usize) -> Self;
}

impl Sample for f64 {
    fn interpolate(start: f64, stop: f64, idx: usize, len: usize) -> f64 {
        start + (stop - start) * idx as f64 / len as f64
    }
}

impl Sample for bool {
    fn interpolate(start: bool, _stop: bool, _idx: usize, _len: usize) -> bool {
        // Boolean trees never contain ramps; constructors only build f64 ramps.
        start
    }
}

/// Literal samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern<T: Sample> {
    samples: Vec<T>,
}

impl<T: Sample> Pattern<T> {
    pub fn samples(&self) -> &[T] {
        &self.samples
    }
}

/// Ordered children covering adjacent tick ranges. Never nests another
/// `Concatenated` directly when built through [`TimedInstruction::concat`].
#[derive(Debug, Clone, PartialEq)]
pub struct Concatenated<T: Sample> {
    children: Vec<TimedInstruction<T>>,
    /// Cumulative end offsets of the children; the last entry is the total length.
    ends: Vec<usize>,
}

impl<T: Sample> Concatenated<T> {
    fn new(children: Vec<TimedInstruction<T>>) -> Self {
        let mut ends = Vec::with_capacity(children.len());
        let mut acc = 0;
        for child in &children {
            acc += child.len();
            ends.push(acc);
        }
        Concatenated { children, ends }
    }

    pub fn children(&self) -> &[TimedInstruction<T>] {
        &self.children
    }

    pub fn ends(&self) -> &[usize] {
        &self.ends
    }
}

/// `count` repetitions of a child instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Repeated<T: Sample> {
    count: usize,
    child: Box<TimedInstruction<T>>,
    len: usize,
}

impl<T: Sample> Repeated<T> {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn child(&self) -> &TimedInstruction<T> {
        &self.child
    }
}

/// A linear segment: sample `i` equals `start + (stop - start) * i / len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp<T: Sample> {
    start: T,
    stop: T,
    len: usize,
}

impl<T: Sample> Ramp<T> {
    pub fn start(&self) -> T {
        self.start
    }

    pub fn stop(&self) -> T {
        self.stop
    }
}

/// A compressed, tick-exact sample sequence of known length.
#[derive(Debug, Clone, PartialEq)]
pub enum TimedInstruction<T: Sample> {
    Pattern(Pattern<T>),
    Concatenated(Concatenated<T>),
    Repeated(Repeated<T>),
    Ramp(Ramp<T>),
}

/// Builds a linear ramp instruction. Degenerate shapes collapse: zero length is
/// empty, a flat ramp is a constant, a single sample is a pattern.
pub fn ramp(start: f64, stop: f64, len: usize) -> TimedInstruction<f64> {
    if len == 0 {
        return TimedInstruction::empty();
    }
    if start == stop {
        return TimedInstruction::constant(start, len);
    }
    if len == 1 {
        return TimedInstruction::pattern([start]);
    }
    TimedInstruction::Ramp(Ramp { start, stop, len })
}

impl<T: Sample> TimedInstruction<T> {
    pub fn empty() -> Self {
        TimedInstruction::Pattern(Pattern { samples: Vec::new() })
    }

    pub fn pattern(samples: impl Into<Vec<T>>) -> Self {
        TimedInstruction::Pattern(Pattern {
            samples: samples.into(),
        })
    }

    /// `Pattern([value])` repeated `len` times.
    pub fn constant(value: T, len: usize) -> Self {
        match len {
            0 => Self::empty(),
            1 => Self::pattern([value]),
            _ => TimedInstruction::Repeated(Repeated {
                count: len,
                child: Box::new(Self::pattern([value])),
                len,
            }),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TimedInstruction::Pattern(p) => p.samples.len(),
            TimedInstruction::Concatenated(c) => c.ends.last().copied().unwrap_or(0),
            TimedInstruction::Repeated(r) => r.len,
            TimedInstruction::Ramp(r) => r.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The sample at `idx`. Panics when out of bounds.
    pub fn value_at(&self, idx: usize) -> T {
        match self {
            TimedInstruction::Pattern(p) => p.samples[idx],
            TimedInstruction::Concatenated(c) => {
                let child_idx = c.ends.partition_point(|&end| end <= idx);
                let child_start = if child_idx == 0 { 0 } else { c.ends[child_idx - 1] };
                c.children[child_idx].value_at(idx - child_start)
            }
            TimedInstruction::Repeated(r) => {
                assert!(idx < r.len, "index {idx} out of bounds for length {}", r.len);
                r.child.value_at(idx % r.child.len())
            }
            TimedInstruction::Ramp(r) => {
                assert!(idx < r.len, "index {idx} out of bounds for length {}", r.len);
                T::interpolate(r.start, r.stop, idx, r.len)
            }
        }
    }

    pub fn first_value(&self) -> Option<T> {
        if self.is_empty() {
            None
        } else {
            Some(self.value_at(0))
        }
    }

    pub fn last_value(&self) -> Option<T> {
        if self.is_empty() {
            None
        } else {
            Some(self.value_at(self.len() - 1))
        }
    }

    /// `Some(v)` when every sample of the instruction equals `v`.
    pub fn constant_value(&self) -> Option<T> {
        match self {
            TimedInstruction::Pattern(p) => {
                let first = *p.samples.first()?;
                p.samples.iter().all(|&s| s == first).then_some(first)
            }
            TimedInstruction::Concatenated(c) => {
                let mut values = c.children.iter().map(|child| child.constant_value());
                let first = values.next()??;
                values.all(|v| v == Some(first)).then_some(first)
            }
            TimedInstruction::Repeated(r) => r.child.constant_value(),
            TimedInstruction::Ramp(r) => (r.start == r.stop).then_some(r.start),
        }
    }

    /// Structure-preserving slice with `std` range semantics.
    ///
    /// # Panics
    /// Panics when the range exceeds the instruction length.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let (start, end) = (range.start, range.end);
        assert!(
            start <= end && end <= self.len(),
            "slice {start}..{end} out of bounds for instruction of length {}",
            self.len()
        );
        if start == end {
            return Self::empty();
        }
        if start == 0 && end == self.len() {
            return self.clone();
        }
        match self {
            TimedInstruction::Pattern(p) => Self::pattern(p.samples[start..end].to_vec()),
            TimedInstruction::Ramp(r) => {
                let new_start = T::interpolate(r.start, r.stop, start, r.len);
                let new_stop = T::interpolate(r.start, r.stop, end, r.len);
                TimedInstruction::Ramp(Ramp {
                    start: new_start,
                    stop: new_stop,
                    len: end - start,
                })
            }
            TimedInstruction::Concatenated(c) => {
                let mut parts = Vec::new();
                let mut child_start = 0;
                for child in &c.children {
                    let child_end = child_start + child.len();
                    if child_end > start && child_start < end {
                        let lo = start.max(child_start) - child_start;
                        let hi = end.min(child_end) - child_start;
                        parts.push(child.slice(lo..hi));
                    }
                    if child_end >= end {
                        break;
                    }
                    child_start = child_end;
                }
                Self::concat(parts)
            }
            TimedInstruction::Repeated(r) => {
                let period = r.child.len();
                let first_period = start / period;
                let first_rem = start % period;
                let last_period = end / period;
                let last_rem = end % period;
                if first_period == last_period {
                    return r.child.slice(first_rem..last_rem);
                }
                let mut parts = Vec::new();
                let mut full_start = first_period;
                if first_rem > 0 {
                    parts.push(r.child.slice(first_rem..period));
                    full_start += 1;
                }
                if last_period > full_start {
                    parts.push((*r.child).clone().repeat(last_period - full_start));
                }
                if last_rem > 0 {
                    parts.push(r.child.slice(0..last_rem));
                }
                Self::concat(parts)
            }
        }
    }

    /// `count` repetitions of `self`. `count == 1` is the identity; repeating a
    /// repetition fuses the counts.
    ///
    /// # Panics
    /// Panics when `count == 0`.
    pub fn repeat(self, count: usize) -> Self {
        assert!(count > 0, "cannot repeat an instruction zero times");
        if count == 1 || self.is_empty() {
            return self;
        }
        match self {
            TimedInstruction::Repeated(r) => TimedInstruction::Repeated(Repeated {
                count: r.count * count,
                len: r.len * count,
                child: r.child,
            }),
            other => {
                let len = other.len() * count;
                TimedInstruction::Repeated(Repeated {
                    count,
                    child: Box::new(other),
                    len,
                })
            }
        }
    }

    /// Concatenates parts into one instruction, normalizing along the way.
    pub fn concat(parts: impl IntoIterator<Item = Self>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            match part {
                TimedInstruction::Concatenated(c) => flat.extend(c.children),
                other => flat.push(other),
            }
        }
        let mut out: Vec<Self> = Vec::with_capacity(flat.len());
        for item in flat {
            push_normalized(&mut out, item);
        }
        let out = collapse_periodic(out);
        match out.len() {
            0 => Self::empty(),
            1 => out.into_iter().next().unwrap(),
            _ => TimedInstruction::Concatenated(Concatenated::new(out)),
        }
    }

    /// Applies `f` to every sample, possibly changing the dtype. The ramp variant
    /// does not survive an arbitrary function and is materialized; use
    /// [`TimedInstruction::map_affine`] when `f` is affine.
    pub fn map_into<U: Sample>(&self, f: &impl Fn(T) -> U) -> TimedInstruction<U> {
        match self {
            TimedInstruction::Pattern(p) => {
                TimedInstruction::pattern(p.samples.iter().map(|&s| f(s)).collect::<Vec<U>>())
            }
            TimedInstruction::Concatenated(c) => TimedInstruction::concat(
                c.children
                    .iter()
                    .map(|child| child.map_into(f))
                    .collect::<Vec<_>>(),
            ),
            TimedInstruction::Repeated(r) => r.child.map_into(f).repeat(r.count),
            TimedInstruction::Ramp(r) => TimedInstruction::pattern(
                (0..r.len)
                    .map(|i| f(T::interpolate(r.start, r.stop, i, r.len)))
                    .collect::<Vec<U>>(),
            ),
        }
    }

    pub fn map(&self, f: &impl Fn(T) -> T) -> Self {
        self.map_into(f)
    }

    /// Recursively applies the normalization rules of [`TimedInstruction::concat`].
    /// Idempotent: `normalize(normalize(i)) == normalize(i)`.
    pub fn normalize(&self) -> Self {
        match self {
            TimedInstruction::Pattern(_) => self.clone(),
            TimedInstruction::Ramp(r) => {
                if r.len == 0 {
                    Self::empty()
                } else if r.start == r.stop {
                    Self::constant(r.start, r.len)
                } else if r.len == 1 {
                    Self::pattern([r.start])
                } else {
                    self.clone()
                }
            }
            TimedInstruction::Concatenated(c) => Self::concat(
                c.children
                    .iter()
                    .map(|child| child.normalize())
                    .collect::<Vec<_>>(),
            ),
            TimedInstruction::Repeated(r) => {
                let child = r.child.normalize();
                if r.count == 0 || child.is_empty() {
                    Self::empty()
                } else {
                    child.repeat(r.count)
                }
            }
        }
    }

    /// Appends every sample to `out`. Expansion is linear in the sample count.
    pub fn extend_vec(&self, out: &mut Vec<T>) {
        match self {
            TimedInstruction::Pattern(p) => out.extend_from_slice(&p.samples),
            TimedInstruction::Concatenated(c) => {
                for child in &c.children {
                    child.extend_vec(out);
                }
            }
            TimedInstruction::Repeated(r) => {
                for _ in 0..r.count {
                    r.child.extend_vec(out);
                }
            }
            TimedInstruction::Ramp(r) => {
                out.extend((0..r.len).map(|i| T::interpolate(r.start, r.stop, i, r.len)));
            }
        }
    }

    /// Materializes the instruction into a flat sample array. This is the opt-in
    /// decompression used at the device boundary.
    pub fn to_array(&self) -> Array1<T> {
        let mut samples = Vec::with_capacity(self.len());
        self.extend_vec(&mut samples);
        Array1::from_vec(samples)
    }

    /// Writes the samples into a caller-provided buffer view.
    ///
    /// # Panics
    /// Panics when the buffer length does not match the instruction length.
    pub fn fill_into(&self, mut out: ArrayViewMut1<T>) {
        assert_eq!(
            out.len(),
            self.len(),
            "buffer length {} does not match instruction length {}",
            out.len(),
            self.len()
        );
        let mut samples = Vec::with_capacity(self.len());
        self.extend_vec(&mut samples);
        for (slot, value) in out.iter_mut().zip(samples) {
            *slot = value;
        }
    }
}

impl TimedInstruction<f64> {
    /// Applies `x -> scale * x + offset` pointwise, preserving ramps.
    pub fn map_affine(&self, scale: f64, offset: f64) -> Self {
        match self {
            TimedInstruction::Pattern(p) => TimedInstruction::pattern(
                p.samples
                    .iter()
                    .map(|&s| scale * s + offset)
                    .collect::<Vec<f64>>(),
            ),
            TimedInstruction::Concatenated(c) => TimedInstruction::concat(
                c.children
                    .iter()
                    .map(|child| child.map_affine(scale, offset))
                    .collect::<Vec<_>>(),
            ),
            TimedInstruction::Repeated(r) => r.child.map_affine(scale, offset).repeat(r.count),
            TimedInstruction::Ramp(r) => {
                ramp(scale * r.start + offset, scale * r.stop + offset, r.len)
            }
        }
    }
}

impl TimedInstruction<bool> {
    /// Pointwise logical NOT, preserving the tree shape.
    pub fn not(&self) -> Self {
        match self {
            TimedInstruction::Pattern(p) => {
                TimedInstruction::pattern(p.samples.iter().map(|&s| !s).collect::<Vec<bool>>())
            }
            TimedInstruction::Concatenated(c) => TimedInstruction::concat(
                c.children.iter().map(|child| child.not()).collect::<Vec<_>>(),
            ),
            TimedInstruction::Repeated(r) => r.child.not().repeat(r.count),
            TimedInstruction::Ramp(_) => unreachable!("boolean instructions have no ramps"),
        }
    }
}

fn push_normalized<T: Sample>(out: &mut Vec<TimedInstruction<T>>, item: TimedInstruction<T>) {
    if let Some(last) = out.last_mut() {
        // Adjacent patterns merge into one
        if let (TimedInstruction::Pattern(prev), TimedInstruction::Pattern(next)) =
            (&mut *last, &item)
        {
            prev.samples.extend_from_slice(&next.samples);
            return;
        }
        // A repetition followed by its own child (or another repetition of it) extends
        if let TimedInstruction::Repeated(prev) = &mut *last {
            if *prev.child == item {
                prev.len += item.len();
                prev.count += 1;
                return;
            }
            if let TimedInstruction::Repeated(next) = &item {
                if prev.child == next.child {
                    prev.count += next.count;
                    prev.len += next.len;
                    return;
                }
            }
        }
        // Identical consecutive children collapse into a repetition
        if *last == item {
            let child = std::mem::replace(last, TimedInstruction::empty());
            let len = child.len() * 2;
            *last = TimedInstruction::Repeated(Repeated {
                count: 2,
                child: Box::new(child),
                len,
            });
            return;
        }
        if let TimedInstruction::Repeated(next) = &item {
            if *next.child == *last {
                let child = std::mem::replace(last, TimedInstruction::empty());
                let len = child.len() * (next.count + 1);
                *last = TimedInstruction::Repeated(Repeated {
                    count: next.count + 1,
                    child: Box::new(child),
                    len,
                });
                return;
            }
        }
    }
    out.push(item);
}

/// Detects a child list that is `k >= 2` repetitions of its prefix and folds it
/// into a single repetition over one period.
fn collapse_periodic<T: Sample>(children: Vec<TimedInstruction<T>>) -> Vec<TimedInstruction<T>> {
    let n = children.len();
    if n < 2 {
        return children;
    }
    for period in 1..=n / 2 {
        if n % period != 0 {
            continue;
        }
        let repeats = (period..n).all(|i| children[i] == children[i - period]);
        if repeats {
            let count = n / period;
            let mut prefix = children;
            prefix.truncate(period);
            let child = if period == 1 {
                prefix.into_iter().next().unwrap()
            } else {
                TimedInstruction::Concatenated(Concatenated::new(prefix))
            };
            return vec![child.repeat(count)];
        }
    }
    children
}

// ==================== Stacked instructions ====================

/// Samples of one channel, tagged with the channel's dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelSamples {
    Digital(TimedInstruction<bool>),
    Analog(TimedInstruction<f64>),
}

impl ChannelSamples {
    pub fn len(&self) -> usize {
        match self {
            ChannelSamples::Digital(instr) => instr.len(),
            ChannelSamples::Analog(instr) => instr.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One named field of a stacked instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedField {
    pub name: String,
    pub values: ChannelSamples,
}

/// Equal-length per-channel instructions joined into one multi-field record,
/// suitable for a device upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackedInstruction {
    fields: Vec<StackedField>,
    len: usize,
}

/// Joins the given fields. All fields must share the same length.
pub fn stack(fields: Vec<StackedField>) -> Result<StackedInstruction, CompilationError> {
    use itertools::Itertools;
    if !fields.iter().map(|f| f.values.len()).all_equal() {
        let lengths: Vec<(String, usize)> = fields
            .iter()
            .map(|f| (f.name.clone(), f.values.len()))
            .collect();
        return Err(CompilationError::InvalidValue(format!(
            "cannot stack instructions of different lengths: {lengths:?}"
        )));
    }
    let len = fields.first().map(|f| f.values.len()).unwrap_or(0);
    Ok(StackedInstruction { fields, len })
}

impl StackedInstruction {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fields(&self) -> &[StackedField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StackedField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ==================== Wire form ====================

/// Transient tagged-union wire form:
/// `{Pattern: [...]} | {Concatenated: [...]} | {Repeated: {count, instruction}} |
/// {Ramp: {start, stop, length}}`.
#[derive(Serialize, Deserialize)]
enum Wire<T> {
    Pattern(Vec<T>),
    Concatenated(Vec<Wire<T>>),
    Repeated {
        count: usize,
        instruction: Box<Wire<T>>,
    },
    Ramp {
        start: T,
        stop: T,
        length: usize,
    },
}

impl<T: Sample> TimedInstruction<T> {
    fn to_wire(&self) -> Wire<T> {
        match self {
            TimedInstruction::Pattern(p) => Wire::Pattern(p.samples.clone()),
            TimedInstruction::Concatenated(c) => {
                Wire::Concatenated(c.children.iter().map(|child| child.to_wire()).collect())
            }
            TimedInstruction::Repeated(r) => Wire::Repeated {
                count: r.count,
                instruction: Box::new(r.child.to_wire()),
            },
            TimedInstruction::Ramp(r) => Wire::Ramp {
                start: r.start,
                stop: r.stop,
                length: r.len,
            },
        }
    }

    fn from_wire(wire: Wire<T>) -> Self {
        match wire {
            Wire::Pattern(samples) => Self::pattern(samples),
            Wire::Concatenated(children) => TimedInstruction::Concatenated(Concatenated::new(
                children.into_iter().map(Self::from_wire).collect(),
            )),
            Wire::Repeated { count, instruction } => {
                let child = Self::from_wire(*instruction);
                let len = count * child.len();
                TimedInstruction::Repeated(Repeated {
                    count,
                    child: Box::new(child),
                    len,
                })
            }
            Wire::Ramp { start, stop, length } => TimedInstruction::Ramp(Ramp {
                start,
                stop,
                len: length,
            }),
        }
    }
}

impl<T: Sample> Serialize for TimedInstruction<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de, T: Sample> Deserialize<'de> for TimedInstruction<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_wire(Wire::deserialize(deserializer)?))
    }
}

// ==================== Unit tests ====================

#[cfg(test)]
mod test {
    mod construction {
        use crate::instruction::*;

        #[test]
        fn constant_is_a_repeated_pattern() {
            let instr = TimedInstruction::constant(true, 1_000_000_000);
            assert_eq!(instr.len(), 1_000_000_000);
            assert_eq!(instr.constant_value(), Some(true));
            match &instr {
                TimedInstruction::Repeated(r) => {
                    assert_eq!(r.count(), 1_000_000_000);
                    assert_eq!(r.child().len(), 1);
                }
                other => panic!("expected Repeated, got {other:?}"),
            }
        }

        #[test]
        fn ramp_samples_are_linear() {
            let r = ramp(0.0, 10.0, 4);
            assert_eq!(r.len(), 4);
            assert_eq!(r.value_at(0), 0.0);
            assert_eq!(r.value_at(1), 2.5);
            assert_eq!(r.value_at(3), 7.5);
        }

        #[test]
        fn degenerate_ramps_collapse() {
            assert!(ramp(1.0, 2.0, 0).is_empty());
            assert_eq!(ramp(3.0, 3.0, 5), TimedInstruction::constant(3.0, 5));
            assert_eq!(ramp(3.0, 9.0, 1), TimedInstruction::pattern([3.0]));
        }

        #[test]
        #[should_panic]
        fn zero_repetitions_are_disallowed() {
            let _ = TimedInstruction::pattern([1.0]).repeat(0);
        }

        #[test]
        fn repeat_fuses_nested_repetitions() {
            let instr = TimedInstruction::constant(0.5, 10).repeat(3);
            match instr {
                TimedInstruction::Repeated(r) => assert_eq!(r.count(), 30),
                other => panic!("expected Repeated, got {other:?}"),
            }
        }
    }

    mod concat {
        use crate::instruction::*;

        #[test]
        fn adjacent_patterns_merge() {
            let joined = TimedInstruction::concat([
                TimedInstruction::pattern([1.0, 2.0]),
                TimedInstruction::pattern([3.0]),
            ]);
            assert_eq!(joined, TimedInstruction::pattern([1.0, 2.0, 3.0]));
        }

        #[test]
        fn empty_parts_are_dropped() {
            let joined = TimedInstruction::concat([
                TimedInstruction::empty(),
                TimedInstruction::pattern([true]),
                TimedInstruction::empty(),
            ]);
            assert_eq!(joined, TimedInstruction::pattern([true]));
        }

        #[test]
        fn equal_constants_fuse_into_one_repetition() {
            let joined = TimedInstruction::concat([
                TimedInstruction::constant(true, 1_000_000_000),
                TimedInstruction::constant(true, 1_000_000_000),
                TimedInstruction::constant(false, 1_000_000_000),
            ]);
            match &joined {
                TimedInstruction::Concatenated(c) => {
                    assert_eq!(c.children().len(), 2);
                    assert_eq!(
                        c.children()[0],
                        TimedInstruction::constant(true, 2_000_000_000)
                    );
                    assert_eq!(
                        c.children()[1],
                        TimedInstruction::constant(false, 1_000_000_000)
                    );
                }
                other => panic!("expected Concatenated, got {other:?}"),
            }
        }

        #[test]
        fn periodic_children_collapse_into_a_loop() {
            let pulse = |v: bool, n: usize| TimedInstruction::constant(v, n);
            let parts: Vec<_> = (0..10)
                .flat_map(|_| [pulse(true, 50), pulse(false, 50)])
                .collect();
            let joined = TimedInstruction::concat(parts);
            let period = TimedInstruction::concat([pulse(true, 50), pulse(false, 50)]);
            assert_eq!(joined, period.repeat(10));
        }

        #[test]
        fn nested_concatenations_flatten() {
            let inner = TimedInstruction::concat([
                TimedInstruction::constant(1.0, 5),
                ramp(0.0, 1.0, 4),
            ]);
            let joined = TimedInstruction::concat([inner, TimedInstruction::constant(2.0, 3)]);
            match joined {
                TimedInstruction::Concatenated(c) => assert_eq!(c.children().len(), 3),
                other => panic!("expected Concatenated, got {other:?}"),
            }
        }
    }

    mod slice {
        use crate::instruction::*;

        #[test]
        fn slicing_a_ramp_yields_a_ramp() {
            let r = ramp(0.0, 10.0, 10);
            let sliced = r.slice(2..7);
            assert_eq!(sliced.len(), 5);
            match &sliced {
                TimedInstruction::Ramp(inner) => {
                    assert_eq!(inner.start(), 2.0);
                    assert_eq!(inner.stop(), 7.0);
                }
                other => panic!("expected Ramp, got {other:?}"),
            }
            for i in 0..5 {
                assert_eq!(sliced.value_at(i), r.value_at(i + 2));
            }
        }

        #[test]
        fn slicing_whole_periods_yields_a_repetition() {
            let instr = TimedInstruction::pattern([1.0, 2.0]).repeat(1000);
            let sliced = instr.slice(10..500);
            match sliced {
                TimedInstruction::Repeated(r) => assert_eq!(r.count(), 245),
                other => panic!("expected Repeated, got {other:?}"),
            }
        }

        #[test]
        fn slicing_across_period_boundaries() {
            let instr = TimedInstruction::pattern([1.0, 2.0, 3.0]).repeat(4);
            let sliced = instr.slice(2..10);
            assert_eq!(sliced.len(), 8);
            let expected: Vec<f64> = (2..10).map(|i| instr.value_at(i)).collect();
            let got: Vec<f64> = (0..8).map(|i| sliced.value_at(i)).collect();
            assert_eq!(got, expected);
        }

        #[test]
        fn slicing_concatenations_descends_into_children() {
            let instr = TimedInstruction::concat([
                TimedInstruction::constant(0.0, 10),
                ramp(0.0, 10.0, 10),
                TimedInstruction::constant(1.0, 10),
            ]);
            let sliced = instr.slice(5..25);
            assert_eq!(sliced.len(), 20);
            for i in 0..20 {
                assert_eq!(sliced.value_at(i), instr.value_at(i + 5));
            }
        }

        #[test]
        #[should_panic]
        fn out_of_bounds_slice_panics() {
            let _ = TimedInstruction::constant(1.0, 4).slice(2..6);
        }
    }

    mod maps {
        use crate::instruction::*;

        #[test]
        fn affine_map_preserves_ramps() {
            let mapped = ramp(0.0, 1.0, 8).map_affine(2.0, 1.0);
            match &mapped {
                TimedInstruction::Ramp(r) => {
                    assert_eq!(r.start(), 1.0);
                    assert_eq!(r.stop(), 3.0);
                }
                other => panic!("expected Ramp, got {other:?}"),
            }
        }

        #[test]
        fn general_map_materializes_ramps() {
            let mapped = ramp(0.0, 4.0, 4).map(&|x| x * x);
            assert_eq!(mapped, TimedInstruction::pattern([0.0, 1.0, 4.0, 9.0]));
        }

        #[test]
        fn not_preserves_shape() {
            let instr = TimedInstruction::concat([
                TimedInstruction::constant(true, 100),
                TimedInstruction::constant(false, 50),
            ]);
            let inverted = instr.not();
            assert_eq!(
                inverted,
                TimedInstruction::concat([
                    TimedInstruction::constant(false, 100),
                    TimedInstruction::constant(true, 50),
                ])
            );
        }
    }

    mod normalize {
        use crate::instruction::*;

        fn messy() -> TimedInstruction<f64> {
            // Round-tripping through the wire form keeps shapes concat() would clean up
            let json = serde_json::json!({"Concatenated": [
                {"Pattern": [1.0]},
                {"Pattern": [2.0, 3.0]},
                {"Repeated": {"count": 1, "instruction": {"Pattern": [4.0]}}},
                {"Ramp": {"start": 5.0, "stop": 5.0, "length": 3}},
            ]});
            serde_json::from_value(json).unwrap()
        }

        #[test]
        fn normalization_is_idempotent() {
            let instr = messy();
            let once = instr.normalize();
            let twice = once.normalize();
            assert_eq!(once, twice);
        }

        #[test]
        fn trivial_repetition_flattens() {
            let instr: TimedInstruction<bool> = serde_json::from_value(serde_json::json!(
                {"Repeated": {"count": 1, "instruction": {"Pattern": [true, false]}}}
            ))
            .unwrap();
            assert_eq!(instr.normalize(), TimedInstruction::pattern([true, false]));
        }

        #[test]
        fn samples_survive_normalization() {
            let instr = messy();
            let normalized = instr.normalize();
            assert_eq!(instr.len(), normalized.len());
            for i in 0..instr.len() {
                assert_eq!(instr.value_at(i), normalized.value_at(i));
            }
        }
    }

    mod expansion {
        use crate::instruction::*;
        use ndarray::Array1;

        #[test]
        fn to_array_expands_all_variants() {
            let instr = TimedInstruction::concat([
                TimedInstruction::constant(1.0, 2),
                ramp(0.0, 2.0, 2),
                TimedInstruction::pattern([9.0]),
            ]);
            assert_eq!(
                instr.to_array(),
                Array1::from_vec(vec![1.0, 1.0, 0.0, 1.0, 9.0])
            );
        }

        #[test]
        fn fill_into_matches_to_array() {
            let instr = TimedInstruction::pattern([1.0, 2.0]).repeat(3);
            let mut buf = Array1::from_elem(6, 0.0);
            instr.fill_into(buf.view_mut());
            assert_eq!(buf, instr.to_array());
        }
    }

    mod stacking {
        use crate::instruction::*;

        #[test]
        fn stack_requires_equal_lengths() {
            let ok = stack(vec![
                StackedField {
                    name: "ch 0".to_string(),
                    values: ChannelSamples::Digital(TimedInstruction::constant(true, 10)),
                },
                StackedField {
                    name: "ch 1".to_string(),
                    values: ChannelSamples::Analog(TimedInstruction::constant(0.5, 10)),
                },
            ])
            .unwrap();
            assert_eq!(ok.len(), 10);
            assert!(ok.field("ch 1").is_some());

            let err = stack(vec![
                StackedField {
                    name: "ch 0".to_string(),
                    values: ChannelSamples::Digital(TimedInstruction::constant(true, 10)),
                },
                StackedField {
                    name: "ch 1".to_string(),
                    values: ChannelSamples::Analog(TimedInstruction::constant(0.5, 11)),
                },
            ]);
            assert!(err.is_err());
        }
    }

    mod wire {
        use crate::instruction::*;

        #[test]
        fn round_trip_preserves_normalized_trees() {
            let instr = TimedInstruction::concat([
                TimedInstruction::constant(0.0, 1_000_000),
                ramp(0.0, 5.0, 1_000),
                TimedInstruction::pattern([1.0, 2.0, 3.0]),
            ]);
            let json = serde_json::to_string(&instr).unwrap();
            let back: TimedInstruction<f64> = serde_json::from_str(&json).unwrap();
            assert_eq!(back, instr);
            assert_eq!(back.normalize(), instr.normalize());
        }

        #[test]
        fn wire_form_is_the_documented_tagged_union() {
            let json = serde_json::to_value(TimedInstruction::pattern([true, false])).unwrap();
            assert_eq!(json, serde_json::json!({"Pattern": [true, false]}));

            let json = serde_json::to_value(ramp(0.0, 1.0, 4)).unwrap();
            assert_eq!(
                json,
                serde_json::json!({"Ramp": {"start": 0.0, "stop": 1.0, "length": 4}})
            );
        }
    }
}
