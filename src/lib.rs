//! # Shot compilation for multi-channel hardware sequencers with `shot_compiler`
//!
//! Experimental control systems for cold-atom and quantum-optics laboratories run
//! "shots": bounded segments of experimental time divided into labeled steps, with
//! per-channel time lanes carrying digital states, analog waveforms, ramps, and
//! camera triggers. The hardware that plays them back - digital pulse generators,
//! analog DAC cards, trigger streamers - wants something very different: one sample
//! per tick of its own clock, for every channel, from shot start to shot end.
//!
//! `shot_compiler` is the deterministic compiler between the two. Given a set of
//! named parameter values (possibly with physical units), a set of time lanes of
//! equal extent, and per-device configurations declaring how each channel's output
//! is synthesized, it produces for every device a compressed, tick-exact
//! representation of the samples it must emit.
//!
//! ## Why compressed
//!
//! A ten-minute shot at nanosecond resolution is 6e11 samples. Pre-sampling such a
//! waveform is out of the question, but almost all of it is piecewise-constant or
//! piecewise-linear. The compiler therefore never materializes samples: it works on
//! [`TimedInstruction`] trees (patterns, concatenations, repetitions, ramps) whose
//! operations are polynomial in the tree size. Expansion to flat buffers is an
//! explicit opt-in at the device boundary.
//!
//! # Navigating the crate
//!
//! - [`shot`] - **your starting point**: [`ShotContext`], [`compile_shot`] and
//!   [`compile_device`] tie everything together.
//! - [`timelane`] - the authored data model: steps, lanes, and blocks.
//! - [`device`] - sequencer configurations, trigger policies, and the device
//!   compiler that stacks per-channel instructions into one upload.
//! - [`channel`] - the declarative [`ChannelOutput`] tree (constants, lane values,
//!   device triggers, calibrations, timing shifts, gates) and its evaluator.
//! - [`expression`] - parsing, typed compilation, and scalar or time-dependent
//!   evaluation of the arithmetic expression language.
//! - [`lane`] - compilers from lanes to instructions.
//! - [`instruction`] - the timed-instruction algebra itself.
//! - [`timing`] - exact femtosecond time arithmetic and the tick conventions.
//! - [`units`] - the closed unit registry and dimensional bookkeeping.
//! - [`error`] - the recoverable error taxonomy.
//!
//! The compiler is pure and single-threaded: every compile call is a function of
//! its inputs, compiled results are immutable and freely shareable across threads,
//! and no global state exists beyond the unit table (which is passed explicitly).

pub mod channel;
pub mod device;
pub mod error;
pub mod expression;
pub mod instruction;
pub mod lane;
pub mod parameter;
pub mod shot;
pub mod timelane;
pub mod timing;
pub mod units;

pub use channel::{ChannelOutput, DimensionedSeries};
pub use device::{
    AnalogChannelConfiguration, ChannelConfiguration, DigitalChannelConfiguration,
    SequencerConfiguration, SequencerParameters, Trigger, TriggerEdge,
};
pub use error::{
    ChannelError, CompilationError, EvaluationError, SequencerCompilationError,
    ShotCompilationError,
};
pub use expression::{
    compile_expression, evaluate_scalar, evaluate_time_dependent,
    evaluate_time_dependent_digital, CompilationContext, CompiledExpression, EvaluationResult,
    Expression, ExpressionType,
};
pub use instruction::{
    ramp, stack, ChannelSamples, Sample, StackedField, StackedInstruction, TimedInstruction,
};
pub use lane::{compile_analog_lane, compile_camera_lane, compile_digital_lane, AnalogSeries};
pub use parameter::{ParameterSchema, ParameterType, Parameters, Value};
pub use shot::{compile_device, compile_shot, ShotContext};
pub use timelane::{
    AnalogBlockValue, AnalogTimeLane, Block, CameraBlockValue, CameraTimeLane,
    DigitalBlockValue, DigitalTimeLane, Lane, TimeLane, TimeLanes,
};
pub use timing::{
    duration_to_ticks, number_ticks, start_tick, step_bounds, stop_tick, Time, TimeStep,
};
pub use units::{BaseUnit, Dimension, UnitDef, UnitRegistry};
