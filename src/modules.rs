//! Module Catalogue
//!
//! Every module type is a variant of the closed [`ModuleKind`] enum. The kind
//! decides the ports, the parameters and whether the module hosts a step
//! generator in the renderer. [`Module`] is the interactive-side record the
//! patch graph keeps for each placed module.

use crate::arp::{ArpMode, ArpPattern, ARP_SUBDIVISION};
use crate::bridge::{step_channel, ControlMessage, Pattern, StepController, StepRunner};
use crate::config::EngineConfig;
use crate::io::StepOutputs;
use crate::port::{ParamDef, ParamValue, Parameters, PortDef, PortSpec, SignalKind};
use crate::render::UnitId;
use crate::sequencer::{SequenceMode, SequencerPattern, Step, SEQUENCE_LENGTH};
use crate::step::{ClockPattern, StepEngine, StepEvent};
use crate::transport::{DEFAULT_TEMPO, MAX_TEMPO, MIN_TEMPO};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// All module types known to the patch editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Keyboard,
    Output,
    Clock,
    Sequencer,
    Arpeggiator,
    Oscillator,
    Lfo,
    Filter,
    Vca,
    Adsr,
    Mixer,
    Delay,
    Reverb,
    Compressor,
}

/// Which step pattern a module's runner plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    Clock,
    Sequencer,
    Arpeggiator,
}

const TEMPO: ParamDef = ParamDef::number("tempo", MIN_TEMPO, MAX_TEMPO, DEFAULT_TEMPO);
const DIVISION: ParamDef = ParamDef::number("division", 1.0, 16.0, 4.0);
const GATE_LENGTH: ParamDef = ParamDef::number("gateLength", 0.01, 1.0, 0.5);
// Applied last on restore, so it must stay last in every table
const RUNNING: ParamDef = ParamDef::toggle("running", false);

const CLOCK_PARAMS: &[ParamDef] = &[TEMPO, DIVISION, GATE_LENGTH, RUNNING];

const SEQUENCER_PARAMS: &[ParamDef] = &[
    TEMPO,
    DIVISION,
    ParamDef::choice("mode", SequenceMode::NAMES, "forward"),
    RUNNING,
];

const ARP_PARAMS: &[ParamDef] = &[
    TEMPO,
    ParamDef::choice("mode", ArpMode::NAMES, "up"),
    ParamDef::integer("octaves", 1.0, 4.0, 1.0),
    GATE_LENGTH,
    ParamDef::toggle("hold", false),
    RUNNING,
];

const OUTPUT_PARAMS: &[ParamDef] = &[ParamDef::number("volume", 0.0, 1.0, 0.8)];

const OSCILLATOR_PARAMS: &[ParamDef] = &[
    ParamDef::number("frequency", 20.0, 20_000.0, 440.0),
    ParamDef::number("detune", -1200.0, 1200.0, 0.0),
    ParamDef::choice(
        "waveform",
        &["sine", "square", "sawtooth", "triangle"],
        "sine",
    ),
];

const LFO_PARAMS: &[ParamDef] = &[
    ParamDef::number("rate", 0.01, 20.0, 1.0),
    ParamDef::number("depth", 0.0, 1.0, 1.0),
    ParamDef::choice(
        "waveform",
        &["sine", "square", "sawtooth", "triangle"],
        "sine",
    ),
];

const FILTER_PARAMS: &[ParamDef] = &[
    ParamDef::number("cutoff", 20.0, 20_000.0, 1000.0),
    ParamDef::number("resonance", 0.0, 30.0, 1.0),
    ParamDef::choice(
        "filterType",
        &["lowpass", "highpass", "bandpass", "notch"],
        "lowpass",
    ),
];

const VCA_PARAMS: &[ParamDef] = &[ParamDef::number("gain", 0.0, 1.0, 1.0)];

const ADSR_PARAMS: &[ParamDef] = &[
    ParamDef::number("attack", 0.001, 10.0, 0.01),
    ParamDef::number("decay", 0.001, 10.0, 0.1),
    ParamDef::number("sustain", 0.0, 1.0, 0.7),
    ParamDef::number("release", 0.001, 10.0, 0.3),
];

const MIXER_PARAMS: &[ParamDef] = &[
    ParamDef::number("level1", 0.0, 1.0, 0.8),
    ParamDef::number("level2", 0.0, 1.0, 0.8),
    ParamDef::number("level3", 0.0, 1.0, 0.8),
    ParamDef::number("level4", 0.0, 1.0, 0.8),
];

const DELAY_PARAMS: &[ParamDef] = &[
    ParamDef::number("time", 0.0, 2.0, 0.3),
    ParamDef::number("feedback", 0.0, 0.95, 0.4),
    ParamDef::number("mix", 0.0, 1.0, 0.5),
];

const REVERB_PARAMS: &[ParamDef] = &[
    ParamDef::number("decay", 0.1, 10.0, 2.0),
    ParamDef::number("mix", 0.0, 1.0, 0.3),
];

const COMPRESSOR_PARAMS: &[ParamDef] = &[
    ParamDef::number("threshold", -60.0, 0.0, -24.0),
    ParamDef::number("ratio", 1.0, 20.0, 4.0),
    ParamDef::number("attack", 0.0, 1.0, 0.003),
    ParamDef::number("release", 0.0, 1.0, 0.25),
];

impl ModuleKind {
    pub const ALL: &'static [ModuleKind] = &[
        ModuleKind::Keyboard,
        ModuleKind::Output,
        ModuleKind::Clock,
        ModuleKind::Sequencer,
        ModuleKind::Arpeggiator,
        ModuleKind::Oscillator,
        ModuleKind::Lfo,
        ModuleKind::Filter,
        ModuleKind::Vca,
        ModuleKind::Adsr,
        ModuleKind::Mixer,
        ModuleKind::Delay,
        ModuleKind::Reverb,
        ModuleKind::Compressor,
    ];

    /// Name used in patch documents
    pub fn type_name(&self) -> &'static str {
        match self {
            ModuleKind::Keyboard => "keyboard",
            ModuleKind::Output => "output",
            ModuleKind::Clock => "clock",
            ModuleKind::Sequencer => "sequencer",
            ModuleKind::Arpeggiator => "arpeggiator",
            ModuleKind::Oscillator => "oscillator",
            ModuleKind::Lfo => "lfo",
            ModuleKind::Filter => "filter",
            ModuleKind::Vca => "vca",
            ModuleKind::Adsr => "adsr",
            ModuleKind::Mixer => "mixer",
            ModuleKind::Delay => "delay",
            ModuleKind::Reverb => "reverb",
            ModuleKind::Compressor => "compressor",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.type_name() == name)
    }

    /// Keyboard and output exist for the whole session and cannot be deleted
    pub fn is_permanent(&self) -> bool {
        matches!(self, ModuleKind::Keyboard | ModuleKind::Output)
    }

    pub fn step_role(&self) -> Option<StepRole> {
        match self {
            ModuleKind::Clock => Some(StepRole::Clock),
            ModuleKind::Sequencer => Some(StepRole::Sequencer),
            ModuleKind::Arpeggiator => Some(StepRole::Arpeggiator),
            _ => None,
        }
    }

    pub fn params(&self) -> &'static [ParamDef] {
        match self {
            ModuleKind::Keyboard => &[],
            ModuleKind::Output => OUTPUT_PARAMS,
            ModuleKind::Clock => CLOCK_PARAMS,
            ModuleKind::Sequencer => SEQUENCER_PARAMS,
            ModuleKind::Arpeggiator => ARP_PARAMS,
            ModuleKind::Oscillator => OSCILLATOR_PARAMS,
            ModuleKind::Lfo => LFO_PARAMS,
            ModuleKind::Filter => FILTER_PARAMS,
            ModuleKind::Vca => VCA_PARAMS,
            ModuleKind::Adsr => ADSR_PARAMS,
            ModuleKind::Mixer => MIXER_PARAMS,
            ModuleKind::Delay => DELAY_PARAMS,
            ModuleKind::Reverb => REVERB_PARAMS,
            ModuleKind::Compressor => COMPRESSOR_PARAMS,
        }
    }

    pub fn param(&self, name: &str) -> Option<&'static ParamDef> {
        self.params().iter().find(|p| p.name == name)
    }

    pub fn default_parameters(&self) -> Parameters {
        self.params()
            .iter()
            .map(|p| (p.name.to_string(), p.default_value()))
            .collect()
    }

    pub fn port_spec(&self) -> PortSpec {
        use SignalKind::{Audio, Cv, Gate};

        let audio_in = || PortDef::new("in", Audio);
        let audio_out = || PortDef::new("out", Audio);
        let automation = |name: &str| PortDef::new(name, Cv).scalar();

        let (inputs, outputs) = match self {
            ModuleKind::Keyboard => (
                vec![],
                vec![PortDef::new("pitch", Cv), PortDef::new("gate", Gate)],
            ),
            ModuleKind::Output => (vec![audio_in(), automation("volume")], vec![]),
            ModuleKind::Clock => (
                vec![PortDef::new("clock", Gate)],
                vec![PortDef::new("gate", Gate)],
            ),
            ModuleKind::Sequencer => (
                vec![PortDef::new("clock", Gate)],
                vec![PortDef::new("pitch", Cv), PortDef::new("gate", Gate)],
            ),
            ModuleKind::Arpeggiator => (
                vec![
                    PortDef::new("pitch", Cv),
                    PortDef::new("gate", Gate),
                    PortDef::new("clock", Gate),
                ],
                vec![PortDef::new("pitch", Cv), PortDef::new("gate", Gate)],
            ),
            ModuleKind::Oscillator => (
                vec![
                    PortDef::new("pitch", Cv),
                    automation("frequency"),
                    automation("detune"),
                ],
                vec![audio_out()],
            ),
            ModuleKind::Lfo => (vec![automation("rate")], vec![PortDef::new("out", Cv)]),
            ModuleKind::Filter => (
                vec![audio_in(), automation("cutoff"), automation("resonance")],
                vec![audio_out()],
            ),
            ModuleKind::Vca => (vec![audio_in(), automation("gain")], vec![audio_out()]),
            ModuleKind::Adsr => (vec![PortDef::new("gate", Gate)], vec![PortDef::new("out", Cv)]),
            ModuleKind::Mixer => (
                vec![
                    PortDef::new("in1", Audio),
                    PortDef::new("in2", Audio),
                    PortDef::new("in3", Audio),
                    PortDef::new("in4", Audio),
                ],
                vec![audio_out()],
            ),
            ModuleKind::Delay => (vec![audio_in(), automation("time")], vec![audio_out()]),
            ModuleKind::Reverb | ModuleKind::Compressor => (vec![audio_in()], vec![audio_out()]),
        };
        PortSpec { inputs, outputs }
    }
}

/// Parameter update refused by a module
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("{kind:?} has no parameter `{name}`")]
    Unknown { kind: ModuleKind, name: String },

    #[error("value not accepted for `{name}`")]
    Invalid { name: String },
}

/// Construction progress of a module's renderer unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
}

/// Snapshot of a module used by persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub kind: ModuleKind,
    pub parameters: Parameters,
    /// Extra document fields owned by the module (the sequencer's `steps`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A placed module
#[derive(Debug)]
pub struct Module {
    kind: ModuleKind,
    spec: PortSpec,
    params: Parameters,
    position: (f64, f64),
    unit: UnitId,
    readiness: Readiness,
    step: Option<StepController>,
    sequence: Option<[Step; SEQUENCE_LENGTH]>,
    external_clock: bool,
}

impl Module {
    /// Build the interactive record. Step generators also get the runner the
    /// renderer must host.
    pub(crate) fn new(
        kind: ModuleKind,
        unit: UnitId,
        position: (f64, f64),
        config: &EngineConfig,
        seed: u64,
    ) -> (Self, Option<StepRunner>) {
        let params = kind.default_parameters();
        let tempo = params.get("tempo").and_then(ParamValue::as_f64).unwrap_or(120.0);
        let division = params
            .get("division")
            .and_then(ParamValue::as_f64)
            .unwrap_or(ARP_SUBDIVISION);

        let pattern = kind.step_role().map(|role| match role {
            StepRole::Clock => Pattern::Clock(ClockPattern::default()),
            StepRole::Sequencer => Pattern::Sequencer(SequencerPattern::new(seed)),
            StepRole::Arpeggiator => Pattern::Arp(ArpPattern::new(seed)),
        });

        let (step, runner) = match pattern {
            Some(pattern) => {
                let (controller, runner) = step_channel(
                    pattern,
                    StepEngine::new(tempo, division),
                    config.control_queue_capacity,
                    config.event_queue_capacity,
                );
                (Some(controller), Some(runner))
            }
            None => (None, None),
        };

        let module = Self {
            kind,
            spec: kind.port_spec(),
            params,
            position,
            unit,
            readiness: Readiness::Pending,
            step,
            sequence: (kind == ModuleKind::Sequencer).then(|| [Step::default(); SEQUENCE_LENGTH]),
            external_clock: false,
        };
        (module, runner)
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }

    pub(crate) fn set_position(&mut self, x: f64, y: f64) {
        self.position = (x, y);
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    pub(crate) fn mark_ready(&mut self) {
        self.readiness = Readiness::Ready;
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }

    pub fn is_step_generator(&self) -> bool {
        self.step.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.params
            .get("running")
            .and_then(ParamValue::as_bool)
            .unwrap_or(false)
    }

    /// True while a cable feeds the clock input
    pub fn is_externally_clocked(&self) -> bool {
        self.external_clock
    }

    /// Tempo has no effect while an external clock drives the module
    pub fn is_parameter_hidden(&self, name: &str) -> bool {
        name == "tempo" && self.external_clock
    }

    pub fn sequence(&self) -> Option<&[Step]> {
        self.sequence.as_ref().map(|s| s.as_slice())
    }

    /// Output levels published by the step generator
    pub fn outputs(&self) -> Option<&Arc<StepOutputs>> {
        self.step.as_ref().map(StepController::outputs)
    }

    pub fn output_level(&self, port: &str) -> Option<f64> {
        self.outputs()?.level(port)
    }

    pub fn step_controller(&self) -> Option<&StepController> {
        self.step.as_ref()
    }

    /// Validate, store and forward a parameter. Returns the stored value.
    pub(crate) fn set_parameter(
        &mut self,
        name: &str,
        value: &ParamValue,
    ) -> Result<ParamValue, ParameterError> {
        let def = self.kind.param(name).ok_or_else(|| ParameterError::Unknown {
            kind: self.kind,
            name: name.to_string(),
        })?;
        let value = def.coerce(value).ok_or_else(|| ParameterError::Invalid {
            name: name.to_string(),
        })?;

        if let Some(message) = self.control_message(name, &value) {
            self.send(message);
        }
        self.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn control_message(&self, name: &str, value: &ParamValue) -> Option<ControlMessage> {
        self.step.as_ref()?;
        let message = match name {
            "tempo" => ControlMessage::SetTempo(value.as_f64()?),
            "division" => ControlMessage::SetDivision(value.as_f64()?),
            "gateLength" => ControlMessage::SetGateLength(value.as_f64()?),
            "running" if value.as_bool()? => ControlMessage::Start,
            "running" => ControlMessage::Stop,
            "octaves" => ControlMessage::SetOctaves(value.as_f64()? as u8),
            "hold" => ControlMessage::SetHold(value.as_bool()?),
            "mode" => match self.kind.step_role()? {
                StepRole::Sequencer => {
                    ControlMessage::SetSequenceMode(SequenceMode::from_name(value.as_str()?)?)
                }
                StepRole::Arpeggiator => {
                    ControlMessage::SetArpMode(ArpMode::from_name(value.as_str()?)?)
                }
                StepRole::Clock => return None,
            },
            _ => return None,
        };
        Some(message)
    }

    pub(crate) fn set_step(&mut self, index: usize, step: Step) -> Result<(), ParameterError> {
        let slot = self
            .sequence
            .as_mut()
            .and_then(|s| s.get_mut(index))
            .ok_or_else(|| ParameterError::Invalid {
                name: format!("steps[{}]", index),
            })?;
        *slot = step;
        self.send(ControlMessage::SetStep { index, step });
        Ok(())
    }

    pub(crate) fn set_external_clock(&mut self, external: bool) {
        if self.external_clock != external {
            self.external_clock = external;
            self.send(ControlMessage::SetExternalClock(external));
        }
    }

    /// Post a message to the step runner. Returns false for plain modules.
    pub(crate) fn send(&mut self, message: ControlMessage) -> bool {
        match self.step.as_mut() {
            Some(controller) => {
                controller.send(message);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drain_events(&mut self, out: &mut Vec<StepEvent>) -> usize {
        self.step
            .as_mut()
            .map_or(0, |controller| controller.drain_events(out))
    }

    pub fn capture_state(&self) -> ModuleState {
        let payload = self
            .sequence
            .as_ref()
            .map(|steps| serde_json::json!({ "steps": steps.as_slice() }));
        ModuleState {
            kind: self.kind,
            parameters: self.params.clone(),
            payload,
        }
    }
}

/// Decode a sequencer payload. Missing or malformed steps become defaults.
pub fn steps_from_payload(payload: Option<&serde_json::Value>) -> [Step; SEQUENCE_LENGTH] {
    let mut steps = [Step::default(); SEQUENCE_LENGTH];
    let entries = payload
        .and_then(|p| p.get("steps"))
        .and_then(serde_json::Value::as_array);
    if let Some(entries) = entries {
        for (slot, entry) in steps.iter_mut().zip(entries) {
            match serde_json::from_value::<Step>(entry.clone()) {
                Ok(step) => *slot = step,
                Err(e) => log::debug!("default step in place of malformed entry: {}", e),
            }
        }
    }
    steps
}
