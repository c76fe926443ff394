//! Sequencer device configurations and the device compiler.
//!
//! A [`SequencerConfiguration`] describes one piece of output hardware: its sample
//! clock period, how its sequencer is started or clocked ([`Trigger`]), and an
//! ordered tuple of channels, each declaring how its output is synthesized from the
//! shot ([`ChannelOutput`]).
//!
//! ## Compilation
//!
//! [`compile_sequencer`] first recurses through every channel-output tree to find
//! the worst-case advance and delay any channel requests, then evaluates every
//! channel with that common padding so all outputs share one length, type-checks
//! each result against the channel's declared kind, and stacks them into the
//! device's `sequence` upload. Channel faults are collected, not short-circuited:
//! one compile call reports every failing channel.
//!
//! ## Trigger synthesis
//!
//! A channel of one device can drive the trigger input of another
//! ([`ChannelOutput::DeviceTrigger`]); the waveform depends on the *target's*
//! trigger policy:
//!
//! - `ExternalTriggerStart` - one pulse at shot start, nominally as wide as one
//!   target time step, low afterwards.
//! - `ExternalClock` - a square wave with one period per target tick; the target
//!   time step must be an integer multiple `m >= 2` of the generating step, and an
//!   odd `m` splits into `ceil(m/2)` high and `floor(m/2)` low.
//! - `ExternalClockOnChange` - the same square wave, but a region where the
//!   target's compiled sequence is constant receives only its opening pulse.
//!
//! A falling-edge trigger input inverts the waveform.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelOutput, DimensionedSeries};
use crate::error::{ChannelError, CompilationError, EvaluationError, SequencerCompilationError};
use crate::instruction::{
    stack, ChannelSamples, Sample, StackedField, StackedInstruction, TimedInstruction,
};
use crate::shot::ShotContext;
use crate::timing::TimeStep;
use crate::units::UnitRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    Rising,
    Falling,
}

/// How a device's sequencer is started or clocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Trigger {
    /// Started by software; takes no trigger line.
    SoftwareTrigger,
    /// Started by a single edge at shot start, then free-running on its own clock.
    ExternalTriggerStart { edge: TriggerEdge },
    /// Every sample is clocked in externally.
    ExternalClock { edge: TriggerEdge },
    /// Clocked externally, but only where its sequence changes value.
    ExternalClockOnChange { edge: TriggerEdge },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalChannelConfiguration {
    pub description: String,
    pub output: ChannelOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogChannelConfiguration {
    pub description: String,
    /// Unit the hardware expects; the compiled samples are expressed in its base
    /// unit. `None` declares a dimensionless channel.
    pub output_unit: Option<String>,
    pub output: ChannelOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChannelConfiguration {
    Digital(DigitalChannelConfiguration),
    Analog(AnalogChannelConfiguration),
}

impl ChannelConfiguration {
    pub fn description(&self) -> &str {
        match self {
            ChannelConfiguration::Digital(cfg) => &cfg.description,
            ChannelConfiguration::Analog(cfg) => &cfg.description,
        }
    }

    pub fn output(&self) -> &ChannelOutput {
        match self {
            ChannelConfiguration::Digital(cfg) => &cfg.output,
            ChannelConfiguration::Analog(cfg) => &cfg.output,
        }
    }
}

/// Static configuration of one sequencer device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfiguration {
    pub time_step: TimeStep,
    pub trigger: Trigger,
    pub channels: Vec<ChannelConfiguration>,
}

/// What a compiled device exposes to the runtime: the stacked per-channel
/// sequence plus the static time step and trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerParameters {
    pub sequence: StackedInstruction,
    pub time_step: TimeStep,
    pub trigger: Trigger,
}

/// Compiles one sequencer. On success also reports the advance/delay padding the
/// sequence carries on each side of the shot.
pub(crate) fn compile_sequencer(
    device_name: &str,
    configuration: &SequencerConfiguration,
    shot: &ShotContext,
) -> Result<(SequencerParameters, usize, usize), SequencerCompilationError> {
    let time_step = configuration.time_step;
    let mut channel_errors = Vec::new();

    // Worst-case advance and delay over all channels
    let mut max_advance = 0;
    let mut max_delay = 0;
    for (index, channel) in configuration.channels.iter().enumerate() {
        match channel.output().max_advance_and_delay(time_step, shot) {
            Ok((advance, delay)) => {
                max_advance = max_advance.max(advance);
                max_delay = max_delay.max(delay);
            }
            Err(cause) => channel_errors.push(ChannelError {
                index,
                description: channel.description().to_string(),
                cause,
            }),
        }
    }
    if !channel_errors.is_empty() {
        return Err(SequencerCompilationError {
            device: device_name.to_string(),
            channel_errors,
        });
    }
    debug!(
        "[{device_name}] compiling {} channels at {time_step} with advance {max_advance} / delay {max_delay}",
        configuration.channels.len()
    );

    let mut fields = Vec::with_capacity(configuration.channels.len());
    for (index, channel) in configuration.channels.iter().enumerate() {
        let result = channel
            .output()
            .evaluate(time_step, max_advance, max_delay, shot)
            .and_then(|series| convert_series(series, channel, shot.registry()));
        match result {
            Ok(values) => fields.push(StackedField {
                name: format!("ch {index}"),
                values,
            }),
            Err(cause) => channel_errors.push(ChannelError {
                index,
                description: channel.description().to_string(),
                cause,
            }),
        }
    }
    if !channel_errors.is_empty() {
        return Err(SequencerCompilationError {
            device: device_name.to_string(),
            channel_errors,
        });
    }

    let sequence = stack(fields).expect("channel outputs must share one length");
    Ok((
        SequencerParameters {
            sequence,
            time_step,
            trigger: configuration.trigger,
        },
        max_advance,
        max_delay,
    ))
}

/// Type-checks an evaluated series against the channel's declared kind.
fn convert_series(
    series: DimensionedSeries,
    channel: &ChannelConfiguration,
    registry: &UnitRegistry,
) -> Result<ChannelSamples, EvaluationError> {
    match channel {
        ChannelConfiguration::Digital(_) => match series.values {
            ChannelSamples::Digital(_) => {
                if let Some(unit) = series.unit {
                    return Err(EvaluationError::Compilation(
                        CompilationError::InvalidDimensionality(format!(
                            "a digital channel output carries units ({unit})"
                        )),
                    ));
                }
                Ok(series.values)
            }
            ChannelSamples::Analog(_) => Err(EvaluationError::Compilation(
                CompilationError::InvalidType(
                    "a digital channel received an analog output".to_string(),
                ),
            )),
        },
        ChannelConfiguration::Analog(cfg) => match series.values {
            ChannelSamples::Analog(_) => {
                let required = match &cfg.output_unit {
                    None => None,
                    Some(name) => {
                        let def = registry.unit(name).map_err(EvaluationError::Compilation)?;
                        registry.to_base(1.0, def).1
                    }
                };
                if series.unit != required {
                    return Err(EvaluationError::Compilation(
                        CompilationError::InvalidDimensionality(format!(
                            "an analog channel declared in {} received values in {}",
                            cfg.output_unit.as_deref().unwrap_or("dimensionless"),
                            series
                                .unit
                                .map(|u| u.to_string())
                                .unwrap_or_else(|| "dimensionless".to_string()),
                        )),
                    ));
                }
                Ok(series.values)
            }
            ChannelSamples::Digital(_) => Err(EvaluationError::Compilation(
                CompilationError::InvalidType(
                    "an analog channel received a digital output".to_string(),
                ),
            )),
        },
    }
}

fn invalid_value(message: String) -> EvaluationError {
    EvaluationError::Compilation(CompilationError::InvalidValue(message))
}

/// Synthesizes the waveform that the current device must emit to drive the
/// trigger input of `target`.
pub(crate) fn trigger_waveform(
    target_name: &str,
    target: &SequencerConfiguration,
    time_step: TimeStep,
    prepend: usize,
    append: usize,
    shot: &ShotContext,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    let base_length = shot.number_ticks(time_step);
    let (wave, edge) = match target.trigger {
        Trigger::SoftwareTrigger => {
            return Err(invalid_value(format!(
                "device \"{target_name}\" is software-triggered and takes no trigger line"
            )))
        }
        Trigger::ExternalTriggerStart { edge } => {
            // Nominal pulse width: the ticks covering one target time step
            let ratio = (target.time_step.femtoseconds() + time_step.femtoseconds() - 1)
                / time_step.femtoseconds();
            let pulse = (ratio.max(1) as usize).min(base_length);
            let wave = TimedInstruction::concat([
                TimedInstruction::constant(true, pulse),
                TimedInstruction::constant(false, base_length - pulse),
            ]);
            (wave, edge)
        }
        Trigger::ExternalClock { edge } => {
            let period = clock_period(target_name, target.time_step, time_step)?;
            let target_ticks = shot.number_ticks(target.time_step);
            let wave = if target_ticks == 0 {
                TimedInstruction::empty()
            } else {
                period.repeat(target_ticks)
            };
            (fit_length(wave, base_length), edge)
        }
        Trigger::ExternalClockOnChange { edge } => {
            let period = clock_period(target_name, target.time_step, time_step)?;
            let period_ticks = period.len();
            let target_ticks = shot.number_ticks(target.time_step);
            let compiled = shot.device_sequence(target_name)?;
            let regions = stacked_constant_regions(
                &compiled.parameters.sequence,
                compiled.max_advance,
                compiled.max_advance + target_ticks,
            );
            let mut parts = Vec::new();
            for (length, is_constant) in regions {
                if length == 0 {
                    continue;
                }
                if is_constant {
                    // The change into the region is still clocked; the inside is not
                    parts.push(period.clone());
                    parts.push(TimedInstruction::constant(
                        false,
                        (length - 1) * period_ticks,
                    ));
                } else {
                    parts.push(period.clone().repeat(length));
                }
            }
            (fit_length(TimedInstruction::concat(parts), base_length), edge)
        }
    };
    let idle = matches!(edge, TriggerEdge::Falling);
    let wave = match edge {
        TriggerEdge::Rising => wave,
        TriggerEdge::Falling => wave.not(),
    };
    Ok(TimedInstruction::concat([
        TimedInstruction::constant(idle, prepend),
        wave,
        TimedInstruction::constant(idle, append),
    ]))
}

/// One clock period: `ceil(m/2)` high then `floor(m/2)` low, where the target
/// time step must be an integer multiple `m >= 2` of the generating step.
fn clock_period(
    target_name: &str,
    target_step: TimeStep,
    time_step: TimeStep,
) -> Result<TimedInstruction<bool>, EvaluationError> {
    let multiplier = target_step.multiple_of(time_step).ok_or_else(|| {
        invalid_value(format!(
            "the time step of \"{target_name}\" ({target_step}) is not an integer multiple \
             of the generating device's time step ({time_step})"
        ))
    })? as usize;
    if multiplier < 2 {
        return Err(invalid_value(format!(
            "the time step of \"{target_name}\" ({target_step}) must be at least twice \
             the generating device's time step ({time_step})"
        )));
    }
    let high = multiplier.div_ceil(2);
    let low = multiplier / 2;
    Ok(TimedInstruction::concat([
        TimedInstruction::constant(true, high),
        TimedInstruction::constant(false, low),
    ]))
}

/// Truncates or low-pads a waveform to exactly `length` ticks.
fn fit_length(wave: TimedInstruction<bool>, length: usize) -> TimedInstruction<bool> {
    use std::cmp::Ordering;
    match wave.len().cmp(&length) {
        Ordering::Equal => wave,
        Ordering::Greater => wave.slice(0..length),
        Ordering::Less => {
            let missing = length - wave.len();
            TimedInstruction::concat([wave, TimedInstruction::constant(false, missing)])
        }
    }
}

// ==================== Constancy analysis for on-change clocks ====================

fn push_span(spans: &mut Vec<(usize, bool)>, length: usize, is_constant: bool) {
    if length == 0 {
        return;
    }
    match spans.last_mut() {
        Some((last_length, last_constant)) if *last_constant == is_constant => {
            *last_length += length
        }
        _ => spans.push((length, is_constant)),
    }
}

/// Splits one instruction into spans that are locally constant (a pure
/// `Repeated(_, Pattern([v]))` or equivalent) and spans that vary.
fn constant_spans<T: Sample>(instr: &TimedInstruction<T>, spans: &mut Vec<(usize, bool)>) {
    match instr {
        TimedInstruction::Pattern(_) | TimedInstruction::Ramp(_) => push_span(
            spans,
            instr.len(),
            instr.constant_value().is_some(),
        ),
        TimedInstruction::Repeated(r) => push_span(
            spans,
            instr.len(),
            r.child().constant_value().is_some(),
        ),
        TimedInstruction::Concatenated(c) => {
            for child in c.children() {
                constant_spans(child, spans);
            }
        }
    }
}

/// Per-tick constancy of a stacked instruction over `[start, stop)`: a tick range
/// is constant only when every field is constant there.
fn stacked_constant_regions(
    stacked: &StackedInstruction,
    start: usize,
    stop: usize,
) -> Vec<(usize, bool)> {
    let mut per_field: Vec<Vec<(usize, bool)>> = Vec::with_capacity(stacked.fields().len());
    for field in stacked.fields() {
        let mut spans = Vec::new();
        match &field.values {
            ChannelSamples::Digital(instr) => constant_spans(instr, &mut spans),
            ChannelSamples::Analog(instr) => constant_spans(instr, &mut spans),
        }
        per_field.push(spans);
    }
    if per_field.is_empty() {
        return vec![(stop - start, true)];
    }

    // Cumulative end positions per field for span lookup
    let cumulative: Vec<Vec<(usize, bool)>> = per_field
        .iter()
        .map(|spans| {
            let mut acc = 0;
            spans
                .iter()
                .map(|&(length, is_constant)| {
                    acc += length;
                    (acc, is_constant)
                })
                .collect()
        })
        .collect();

    let mut boundaries: Vec<usize> = cumulative
        .iter()
        .flat_map(|spans| spans.iter().map(|&(end, _)| end))
        .filter(|&end| end > start && end < stop)
        .collect();
    boundaries.push(stop);
    boundaries.sort_unstable();
    boundaries.dedup();

    let constant_at = |field: &[(usize, bool)], position: usize| -> bool {
        let idx = field.partition_point(|&(end, _)| end <= position);
        field.get(idx).map(|&(_, c)| c).unwrap_or(true)
    };

    let mut regions = Vec::new();
    let mut cursor = start;
    for boundary in boundaries {
        let is_constant = cumulative
            .iter()
            .all(|field| constant_at(field, cursor));
        push_span(&mut regions, boundary - cursor, is_constant);
        cursor = boundary;
    }
    regions
}

#[cfg(test)]
mod test {
    use super::*;

    mod clock_period {
        use super::super::*;
        use crate::timing::TimeStep;

        fn ns(v: f64) -> TimeStep {
            TimeStep::from_ns(v).unwrap()
        }

        #[test]
        fn even_multiple_splits_evenly() {
            let period = clock_period("cam", ns(4.0), ns(1.0)).unwrap();
            assert_eq!(period.to_array().to_vec(), vec![true, true, false, false]);
        }

        #[test]
        fn odd_multiple_has_the_extra_high_tick() {
            let period = clock_period("cam", ns(5.0), ns(1.0)).unwrap();
            assert_eq!(
                period.to_array().to_vec(),
                vec![true, true, true, false, false]
            );
        }

        #[test]
        fn non_integer_multiple_is_rejected() {
            assert!(clock_period("cam", ns(2.5), ns(1.0)).is_err());
        }

        #[test]
        fn equal_time_steps_are_rejected() {
            assert!(clock_period("cam", ns(1.0), ns(1.0)).is_err());
        }
    }

    mod constancy {
        use super::super::*;

        #[test]
        fn repeated_constants_are_constant_spans() {
            let mut spans = Vec::new();
            let instr = TimedInstruction::concat([
                TimedInstruction::constant(1.0, 100),
                crate::instruction::ramp(0.0, 1.0, 50),
                TimedInstruction::constant(2.0, 25),
            ]);
            constant_spans(&instr, &mut spans);
            assert_eq!(spans, vec![(100, true), (50, false), (25, true)]);
        }

        #[test]
        fn stacked_regions_intersect_fields() {
            let stacked = stack(vec![
                StackedField {
                    name: "ch 0".to_string(),
                    values: ChannelSamples::Analog(TimedInstruction::concat([
                        TimedInstruction::constant(0.0, 60),
                        crate::instruction::ramp(0.0, 1.0, 40),
                    ])),
                },
                StackedField {
                    name: "ch 1".to_string(),
                    values: ChannelSamples::Digital(TimedInstruction::concat([
                        TimedInstruction::constant(false, 20),
                        TimedInstruction::constant(true, 80),
                    ])),
                },
            ])
            .unwrap();
            // ch 0 varies over [60, 100); ch 1 is constant throughout (two constant
            // spans); the intersection is constant on [0, 60) only
            let regions = stacked_constant_regions(&stacked, 0, 100);
            assert_eq!(regions, vec![(60, true), (40, false)]);
        }

        #[test]
        fn region_window_is_respected() {
            let stacked = stack(vec![StackedField {
                name: "ch 0".to_string(),
                values: ChannelSamples::Analog(TimedInstruction::concat([
                    TimedInstruction::constant(0.0, 10),
                    crate::instruction::ramp(0.0, 1.0, 10),
                    TimedInstruction::constant(1.0, 10),
                ])),
            }])
            .unwrap();
            let regions = stacked_constant_regions(&stacked, 5, 25);
            assert_eq!(regions, vec![(5, true), (10, false), (5, true)]);
        }
    }
}
