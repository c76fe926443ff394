//! Shot-level compilation: one bounded execution of the experimental timeline.
//!
//! A [`ShotContext`] bundles everything a single compile call reads: the concrete
//! parameter bindings, the time lanes, the sequencer configurations, and the unit
//! registry. The step durations are evaluated once, exactly, when the context is
//! built; every device then compiles against the same exact step bounds.
//!
//! Devices may reference each other through trigger channels, so the context keeps
//! a cache of already-compiled devices and detects circular trigger dependencies.
//! The whole context is read-only for callers; compiled results are immutable and
//! shared by reference counting.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::device::{compile_sequencer, SequencerConfiguration, SequencerParameters};
use crate::error::{
    CompilationError, EvaluationError, SequencerCompilationError, ShotCompilationError,
};
use crate::expression::evaluate_scalar;
use crate::parameter::{Parameters, Value};
use crate::timelane::TimeLanes;
use crate::timing::{number_ticks, step_bounds, Time, TimeStep};
use crate::units::{Dimension, UnitRegistry};

/// A compiled device kept in the shot cache, with the padding its sequence
/// carries around the shot proper.
#[derive(Debug)]
pub(crate) struct CompiledDevice {
    pub parameters: SequencerParameters,
    pub max_advance: usize,
    pub max_delay: usize,
}

/// Read-only context of one shot compilation.
#[derive(Debug)]
pub struct ShotContext<'a> {
    parameters: &'a Parameters,
    time_lanes: &'a TimeLanes,
    devices: &'a IndexMap<String, SequencerConfiguration>,
    registry: &'a UnitRegistry,
    step_bounds: Vec<Time>,
    compiled: RefCell<IndexMap<String, Arc<CompiledDevice>>>,
    in_progress: RefCell<HashSet<String>>,
}

impl<'a> ShotContext<'a> {
    /// Builds the context, evaluating every step duration to an exact time.
    pub fn new(
        parameters: &'a Parameters,
        time_lanes: &'a TimeLanes,
        devices: &'a IndexMap<String, SequencerConfiguration>,
        registry: &'a UnitRegistry,
    ) -> Result<ShotContext<'a>, EvaluationError> {
        let mut durations = Vec::with_capacity(time_lanes.number_steps());
        for (name, expression) in time_lanes
            .step_names()
            .iter()
            .zip(time_lanes.step_durations())
        {
            let value = evaluate_scalar(expression, parameters, registry)?;
            let seconds = match value {
                Value::Quantity { magnitude, unit } if unit.dimension() == Dimension::TIME => {
                    magnitude
                }
                Value::Integer(0) => 0.0,
                Value::Float(v) if v == 0.0 => 0.0,
                other => {
                    return Err(EvaluationError::Compilation(
                        CompilationError::InvalidDimensionality(format!(
                            "the duration of step \"{name}\" must be a time, got {other}"
                        )),
                    ))
                }
            };
            durations.push(Time::from_secs(seconds).map_err(|err| {
                EvaluationError::Compilation(CompilationError::InvalidValue(format!(
                    "the duration of step \"{name}\" is invalid: {err}"
                )))
            })?);
        }
        Ok(ShotContext {
            parameters,
            time_lanes,
            devices,
            registry,
            step_bounds: step_bounds(durations),
            compiled: RefCell::new(IndexMap::new()),
            in_progress: RefCell::new(HashSet::new()),
        })
    }

    pub fn parameters(&self) -> &Parameters {
        self.parameters
    }

    pub fn time_lanes(&self) -> &TimeLanes {
        self.time_lanes
    }

    pub fn registry(&self) -> &UnitRegistry {
        self.registry
    }

    /// Exact step boundaries: one more entry than there are steps.
    pub fn step_bounds(&self) -> &[Time] {
        &self.step_bounds
    }

    pub fn shot_duration(&self) -> Time {
        *self.step_bounds.last().expect("at least one step")
    }

    /// The number of ticks a device at `time_step` emits over the shot proper.
    pub fn number_ticks(&self, time_step: TimeStep) -> usize {
        number_ticks(Time::ZERO, self.shot_duration(), time_step)
    }

    pub fn device_configuration(&self, name: &str) -> Option<&SequencerConfiguration> {
        self.devices.get(name)
    }

    fn cached(&self, name: &str) -> Option<Arc<CompiledDevice>> {
        self.compiled.borrow().get(name).cloned()
    }

    fn cache(&self, name: &str, device: Arc<CompiledDevice>) {
        self.compiled
            .borrow_mut()
            .insert(name.to_string(), device);
    }

    /// Compiles (or fetches) the sequence of another device, as needed by
    /// trigger synthesis. Circular trigger dependencies are rejected.
    pub(crate) fn device_sequence(
        &self,
        name: &str,
    ) -> Result<Arc<CompiledDevice>, EvaluationError> {
        if let Some(found) = self.cached(name) {
            return Ok(found);
        }
        let configuration = self.devices.get(name).ok_or_else(|| {
            EvaluationError::Compilation(CompilationError::InvalidValue(format!(
                "the sequence does not contain a device named \"{name}\""
            )))
        })?;
        if !self.in_progress.borrow_mut().insert(name.to_string()) {
            return Err(EvaluationError::Compilation(CompilationError::InvalidValue(
                format!("circular trigger dependency through device \"{name}\""),
            )));
        }
        let result = compile_sequencer(name, configuration, self);
        self.in_progress.borrow_mut().remove(name);
        match result {
            Ok((parameters, max_advance, max_delay)) => {
                let device = Arc::new(CompiledDevice {
                    parameters,
                    max_advance,
                    max_delay,
                });
                self.cache(name, Arc::clone(&device));
                Ok(device)
            }
            Err(error) => Err(EvaluationError::Compilation(CompilationError::InvalidValue(
                format!("failed to compile the sequence of device \"{name}\": {error}"),
            ))),
        }
    }
}

/// Compiles one device of the shot.
pub fn compile_device(
    device_name: &str,
    shot: &ShotContext,
) -> Result<SequencerParameters, ShotCompilationError> {
    if let Some(found) = shot.cached(device_name) {
        return Ok(found.parameters.clone());
    }
    let configuration = shot.device_configuration(device_name).ok_or_else(|| {
        ShotCompilationError::Evaluation(EvaluationError::Compilation(
            CompilationError::InvalidValue(format!(
                "the sequence does not contain a device named \"{device_name}\""
            )),
        ))
    })?;
    let (parameters, max_advance, max_delay) = compile_sequencer(device_name, configuration, shot)
        .map_err(|error| ShotCompilationError::Devices(vec![error]))?;
    shot.cache(
        device_name,
        Arc::new(CompiledDevice {
            parameters: parameters.clone(),
            max_advance,
            max_delay,
        }),
    );
    Ok(parameters)
}

/// Compiles every device of the shot. Per-device failures are collected so one
/// call reports every faulty device, each with all of its faulty channels.
pub fn compile_shot(
    parameters: &Parameters,
    time_lanes: &TimeLanes,
    devices: &IndexMap<String, SequencerConfiguration>,
    registry: &UnitRegistry,
) -> Result<IndexMap<String, SequencerParameters>, ShotCompilationError> {
    let shot = ShotContext::new(parameters, time_lanes, devices, registry)?;
    debug!(
        "compiling shot: {} steps, {} lanes, {} devices",
        time_lanes.number_steps(),
        time_lanes.lanes().len(),
        devices.len()
    );
    let mut results = IndexMap::with_capacity(devices.len());
    let mut failures = Vec::new();
    for name in devices.keys() {
        match compile_device(name, &shot) {
            Ok(compiled) => {
                results.insert(name.clone(), compiled);
            }
            Err(ShotCompilationError::Devices(errors)) => failures.extend(errors),
            Err(other) => return Err(other),
        }
    }
    if !failures.is_empty() {
        return Err(ShotCompilationError::Devices(failures));
    }
    Ok(results)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelOutput;
    use crate::device::{
        AnalogChannelConfiguration, ChannelConfiguration, DigitalChannelConfiguration, Trigger,
        TriggerEdge,
    };
    use crate::expression::Expression;
    use crate::instruction::{ramp, ChannelSamples, TimedInstruction};
    use crate::timelane::{
        AnalogBlockValue, Block, CameraBlockValue, DigitalBlockValue, Lane, TimeLane,
    };
    use indexmap::indexmap;

    fn ns(v: f64) -> TimeStep {
        TimeStep::from_ns(v).unwrap()
    }

    fn expression_steps(durations: &[&str]) -> (Vec<String>, Vec<Expression>) {
        let names = (0..durations.len()).map(|i| format!("step {i}")).collect();
        let durations = durations.iter().map(|d| Expression::new(*d)).collect();
        (names, durations)
    }

    fn digital_channel(description: &str, output: ChannelOutput) -> ChannelConfiguration {
        ChannelConfiguration::Digital(DigitalChannelConfiguration {
            description: description.to_string(),
            output,
        })
    }

    fn analog_channel(
        description: &str,
        output_unit: Option<&str>,
        output: ChannelOutput,
    ) -> ChannelConfiguration {
        ChannelConfiguration::Analog(AnalogChannelConfiguration {
            description: description.to_string(),
            output_unit: output_unit.map(str::to_string),
            output,
        })
    }

    fn digital_instruction(sequence: &SequencerParameters, field: &str) -> TimedInstruction<bool> {
        match &sequence.sequence.field(field).unwrap().values {
            ChannelSamples::Digital(instr) => instr.clone(),
            other => panic!("expected a digital field, got {other:?}"),
        }
    }

    fn analog_instruction(sequence: &SequencerParameters, field: &str) -> TimedInstruction<f64> {
        match &sequence.sequence.field(field).unwrap().values {
            ChannelSamples::Analog(instr) => instr.clone(),
            other => panic!("expected an analog field, got {other:?}"),
        }
    }

    #[test]
    fn digital_lane_drives_a_digital_channel() {
        let (names, durations) = expression_steps(&["1 s", "1 s"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "aom".to_string() => TimeLane::Digital(Lane::from_step_values([
                    DigitalBlockValue::Constant(true),
                    DigitalBlockValue::Constant(false),
                ])),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("aom switch", ChannelOutput::lane("aom"))],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();

        let sequence = &result["spincore"];
        assert_eq!(sequence.sequence.len(), 2_000_000_000);
        assert_eq!(
            digital_instruction(sequence, "ch 0"),
            TimedInstruction::concat([
                TimedInstruction::constant(true, 1_000_000_000),
                TimedInstruction::constant(false, 1_000_000_000),
            ])
        );
    }

    #[test]
    fn analog_lane_with_ramp_and_units() {
        let (names, durations) = expression_steps(&["10 ns", "20 ns", "30 ns"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "coil".to_string() => TimeLane::Analog(Lane::new(vec![
                    Block { value: AnalogBlockValue::Expression(Expression::new("10 V")), span: 1 },
                    Block { value: AnalogBlockValue::Ramp, span: 1 },
                    Block { value: AnalogBlockValue::Expression(Expression::new("100 mV")), span: 1 },
                ]).unwrap()),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(10.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![analog_channel("coil driver", Some("V"), ChannelOutput::lane("coil"))],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();

        let sequence = &result["dac"];
        assert_eq!(
            analog_instruction(sequence, "ch 0"),
            TimedInstruction::concat([
                TimedInstruction::pattern([10.0]),
                ramp(10.0, 0.1, 2),
                TimedInstruction::constant(0.1, 3),
            ])
        );
    }

    #[test]
    fn unit_mismatch_on_an_analog_channel_is_reported() {
        let (names, durations) = expression_steps(&["10 ns"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "coil".to_string() => TimeLane::Analog(Lane::new(vec![
                    Block { value: AnalogBlockValue::Expression(Expression::new("1 A")), span: 1 },
                ]).unwrap()),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![analog_channel("coil driver", Some("V"), ChannelOutput::lane("coil"))],
            },
        };
        let registry = UnitRegistry::new();
        let err =
            compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap_err();
        match err {
            ShotCompilationError::Devices(devices) => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].channel_errors.len(), 1);
                assert_eq!(devices[0].channel_errors[0].index, 0);
            }
            other => panic!("expected device errors, got {other:?}"),
        }
    }

    #[test]
    fn all_faulty_channels_are_reported_at_once() {
        let (names, durations) = expression_steps(&["1 us"]);
        let time_lanes = TimeLanes::new(names, durations, indexmap! {}).unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![
                    digital_channel("a", ChannelOutput::lane("missing lane")),
                    digital_channel("b", ChannelOutput::constant(Expression::new("oops"))),
                    digital_channel("c", ChannelOutput::constant(Expression::new("Disabled"))),
                ],
            },
        };
        let registry = UnitRegistry::new();
        let err =
            compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap_err();
        match err {
            ShotCompilationError::Devices(devices) => {
                assert_eq!(devices[0].channel_errors.len(), 2);
                let indices: Vec<usize> =
                    devices[0].channel_errors.iter().map(|e| e.index).collect();
                assert_eq!(indices, vec![0, 1]);
            }
            other => panic!("expected device errors, got {other:?}"),
        }
    }

    #[test]
    fn advance_shifts_within_the_common_padding() {
        let (names, durations) = expression_steps(&["1 us", "1 us"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "shutter".to_string() => TimeLane::Digital(Lane::from_step_values([
                    DigitalBlockValue::Constant(false),
                    DigitalBlockValue::Constant(true),
                ])),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![
                    digital_channel("shifted", ChannelOutput::Advance {
                        input: Box::new(ChannelOutput::lane("shutter")),
                        advance: Expression::new("100 ns"),
                    }),
                    digital_channel("reference", ChannelOutput::lane("shutter")),
                ],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        let sequence = &result["spincore"];

        // Both channels carry the common 100-tick advance padding
        assert_eq!(sequence.sequence.len(), 2100);
        let shifted = digital_instruction(sequence, "ch 0");
        let reference = digital_instruction(sequence, "ch 1");
        // The reference opens at tick 100 + 1000; the shifted channel 100 ticks earlier
        assert!(!reference.value_at(1099));
        assert!(reference.value_at(1100));
        assert!(!shifted.value_at(999));
        assert!(shifted.value_at(1000));
        // The shifted channel keeps its final value over the freed ticks at the end
        assert!(shifted.value_at(2099));
    }

    #[test]
    fn negative_advance_is_rejected() {
        let (names, durations) = expression_steps(&["1 us"]);
        let time_lanes = TimeLanes::new(names, durations, indexmap! {}).unwrap();
        let devices = indexmap! {
            "dev".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![
                    digital_channel("bad", ChannelOutput::Advance {
                        input: Box::new(ChannelOutput::constant(Expression::new("Disabled"))),
                        advance: Expression::new("-100 ns"),
                    }),
                ],
            },
        };
        let registry = UnitRegistry::new();
        let err =
            compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap_err();
        match err {
            ShotCompilationError::Devices(devices) => {
                assert!(matches!(
                    devices[0].channel_errors[0].cause.compilation_root(),
                    Some(CompilationError::InvalidValue(_))
                ));
            }
            other => panic!("expected device errors, got {other:?}"),
        }
    }

    #[test]
    fn camera_lane_drives_an_exposure_line() {
        let (names, durations) = expression_steps(&["1 us", "2 us", "1 us"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "cam".to_string() => TimeLane::Camera(Lane::from_step_values([
                    CameraBlockValue::Idle,
                    CameraBlockValue::TakePicture { label: "picture 0".to_string() },
                    CameraBlockValue::Idle,
                ])),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("camera trigger", ChannelOutput::lane("cam"))],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        assert_eq!(
            digital_instruction(&result["spincore"], "ch 0"),
            TimedInstruction::concat([
                TimedInstruction::constant(false, 1000),
                TimedInstruction::constant(true, 2000),
                TimedInstruction::constant(false, 1000),
            ])
        );
    }

    #[test]
    fn external_clock_trigger_is_synthesized() {
        let (names, durations) = expression_steps(&["40 ns"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "power".to_string() => TimeLane::Analog(Lane::new(vec![
                    Block { value: AnalogBlockValue::Expression(Expression::new("0.5")), span: 1 },
                ]).unwrap()),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(10.0),
                trigger: Trigger::ExternalClock { edge: TriggerEdge::Rising },
                channels: vec![analog_channel("power", None, ChannelOutput::lane("power"))],
            },
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("dac clock", ChannelOutput::DeviceTrigger {
                    device_name: "dac".to_string(),
                    default: None,
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        let clock = digital_instruction(&result["spincore"], "ch 0");
        assert_eq!(clock.len(), 40);
        // One period per dac tick: 5 high, 5 low
        let period = TimedInstruction::concat([
            TimedInstruction::constant(true, 5),
            TimedInstruction::constant(false, 5),
        ]);
        assert_eq!(clock, period.repeat(4));
    }

    #[test]
    fn clock_requires_an_integer_multiple() {
        let (names, durations) = expression_steps(&["40 ns"]);
        let time_lanes = TimeLanes::new(names, durations, indexmap! {}).unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(2.5),
                trigger: Trigger::ExternalClock { edge: TriggerEdge::Rising },
                channels: vec![],
            },
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("dac clock", ChannelOutput::DeviceTrigger {
                    device_name: "dac".to_string(),
                    default: None,
                })],
            },
        };
        let registry = UnitRegistry::new();
        let err =
            compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap_err();
        match err {
            ShotCompilationError::Devices(devices) => {
                assert_eq!(devices[0].device, "spincore");
                assert!(matches!(
                    devices[0].channel_errors[0].cause.compilation_root(),
                    Some(CompilationError::InvalidValue(_))
                ));
            }
            other => panic!("expected device errors, got {other:?}"),
        }
    }

    #[test]
    fn on_change_clock_pauses_over_constant_regions() {
        let (names, durations) = expression_steps(&["40 ns", "40 ns", "40 ns"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "power".to_string() => TimeLane::Analog(Lane::new(vec![
                    Block { value: AnalogBlockValue::Expression(Expression::new("0")), span: 1 },
                    Block { value: AnalogBlockValue::Ramp, span: 1 },
                    Block { value: AnalogBlockValue::Expression(Expression::new("1")), span: 1 },
                ]).unwrap()),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(10.0),
                trigger: Trigger::ExternalClockOnChange { edge: TriggerEdge::Rising },
                channels: vec![analog_channel("power", None, ChannelOutput::lane("power"))],
            },
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("dac clock", ChannelOutput::DeviceTrigger {
                    device_name: "dac".to_string(),
                    default: None,
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        let clock = digital_instruction(&result["spincore"], "ch 0");
        assert_eq!(clock.len(), 120);

        let samples = clock.to_array();
        // Constant first region: a single opening pulse, then low until the ramp
        assert!(samples[0]);
        assert!(!samples[10]);
        assert!(!samples[39]);
        // Ramp region (dac ticks 4..8): one pulse per dac tick
        for dac_tick in 4..8 {
            assert!(samples[dac_tick * 10], "missing pulse at dac tick {dac_tick}");
            assert!(!samples[dac_tick * 10 + 7]);
        }
        // Constant last region: opening pulse then silence
        assert!(samples[80]);
        assert!(!samples[90]);
        assert!(!samples[119]);
    }

    #[test]
    fn not_gate_inverts_lane_values() {
        let (names, durations) = expression_steps(&["1 s", "1 s"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "test lane".to_string() => TimeLane::Digital(Lane::from_step_values([
                    DigitalBlockValue::Constant(true),
                    DigitalBlockValue::Constant(false),
                ])),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("inverted", ChannelOutput::NotGate {
                    input: Box::new(ChannelOutput::lane("test lane")),
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        assert_eq!(
            digital_instruction(&result["spincore"], "ch 0"),
            TimedInstruction::concat([
                TimedInstruction::constant(false, 1_000_000_000),
                TimedInstruction::constant(true, 1_000_000_000),
            ])
        );
    }

    #[test]
    fn broaden_left_opens_a_shutter_early() {
        let (names, durations) = expression_steps(&["10 us", "5 us", "10 us"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "kill shutter".to_string() => TimeLane::Digital(Lane::from_step_values([
                    DigitalBlockValue::Constant(false),
                    DigitalBlockValue::Constant(true),
                    DigitalBlockValue::Constant(false),
                ])),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("shutter", ChannelOutput::BroadenLeft {
                    input: Box::new(ChannelOutput::lane("kill shutter")),
                    width: Expression::new("2 us"),
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        assert_eq!(
            digital_instruction(&result["spincore"], "ch 0"),
            TimedInstruction::concat([
                TimedInstruction::constant(false, 8_000),
                TimedInstruction::constant(true, 7_000),
                TimedInstruction::constant(false, 10_000),
            ])
        );
    }

    #[test]
    fn circular_trigger_dependencies_are_rejected() {
        let (names, durations) = expression_steps(&["1 us"]);
        let time_lanes = TimeLanes::new(names, durations, indexmap! {}).unwrap();
        let devices = indexmap! {
            "a".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::ExternalClockOnChange { edge: TriggerEdge::Rising },
                channels: vec![digital_channel("b clock", ChannelOutput::DeviceTrigger {
                    device_name: "b".to_string(),
                    default: None,
                })],
            },
            "b".to_string() => SequencerConfiguration {
                time_step: ns(2.0),
                trigger: Trigger::ExternalClockOnChange { edge: TriggerEdge::Rising },
                channels: vec![digital_channel("a clock", ChannelOutput::DeviceTrigger {
                    device_name: "a".to_string(),
                    default: None,
                })],
            },
        };
        let registry = UnitRegistry::new();
        let err =
            compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap_err();
        assert!(matches!(err, ShotCompilationError::Devices(_)));
    }

    #[test]
    fn missing_trigger_target_falls_back_to_the_default() {
        let (names, durations) = expression_steps(&["1 us"]);
        let time_lanes = TimeLanes::new(names, durations, indexmap! {}).unwrap();
        let devices = indexmap! {
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("spare trigger", ChannelOutput::DeviceTrigger {
                    device_name: "not present".to_string(),
                    default: Some(Box::new(ChannelOutput::constant(Expression::new("Disabled")))),
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        assert_eq!(
            digital_instruction(&result["spincore"], "ch 0"),
            TimedInstruction::constant(false, 1000)
        );
    }

    #[test]
    fn start_trigger_pulse_at_shot_start() {
        let (names, durations) = expression_steps(&["1 us"]);
        let time_lanes = TimeLanes::new(
            names,
            durations,
            indexmap! {
                "x".to_string() => TimeLane::Analog(Lane::new(vec![
                    Block { value: AnalogBlockValue::Expression(Expression::new("0")), span: 1 },
                ]).unwrap()),
            },
        )
        .unwrap();
        let devices = indexmap! {
            "dac".to_string() => SequencerConfiguration {
                time_step: ns(50.0),
                trigger: Trigger::ExternalTriggerStart { edge: TriggerEdge::Rising },
                channels: vec![analog_channel("x", None, ChannelOutput::lane("x"))],
            },
            "spincore".to_string() => SequencerConfiguration {
                time_step: ns(1.0),
                trigger: Trigger::SoftwareTrigger,
                channels: vec![digital_channel("dac start", ChannelOutput::DeviceTrigger {
                    device_name: "dac".to_string(),
                    default: None,
                })],
            },
        };
        let registry = UnitRegistry::new();
        let result = compile_shot(&Parameters::new(), &time_lanes, &devices, &registry).unwrap();
        let trigger = digital_instruction(&result["spincore"], "ch 0");
        assert_eq!(
            trigger,
            TimedInstruction::concat([
                TimedInstruction::constant(true, 50),
                TimedInstruction::constant(false, 950),
            ])
        );
    }

    #[test]
    fn parameters_flow_into_step_durations() {
        let (names, _) = expression_steps(&["ignored"]);
        let time_lanes = TimeLanes::new(
            names,
            vec![Expression::new("mot_loading.duration")],
            indexmap! {},
        )
        .unwrap();
        let parameters = indexmap! {
            "mot_loading.duration".to_string() => Value::Quantity {
                magnitude: 50e-3,
                unit: crate::units::BaseUnit::SECOND,
            },
        };
        let registry = UnitRegistry::new();
        let devices = IndexMap::new();
        let shot = ShotContext::new(&parameters, &time_lanes, &devices, &registry).unwrap();
        assert_eq!(shot.shot_duration(), Time::from_secs(50e-3).unwrap());
        assert_eq!(shot.number_ticks(ns(1.0)), 50_000_000);
    }

    #[test]
    fn dimensionless_step_duration_is_rejected() {
        let (names, _) = expression_steps(&["x"]);
        let time_lanes =
            TimeLanes::new(names, vec![Expression::new("2.5")], indexmap! {}).unwrap();
        let registry = UnitRegistry::new();
        let devices = IndexMap::new();
        let err = ShotContext::new(&Parameters::new(), &time_lanes, &devices, &registry)
            .unwrap_err();
        assert!(matches!(
            err.compilation_root(),
            Some(CompilationError::InvalidDimensionality(_))
        ));
    }
}
