//! Step Sequencer pattern
//!
//! A fixed-length sequence of CV steps with per-step gate length and
//! on/off/skip state, traversed in one of four directions.

use crate::step::{palindrome, StepOutcome, StepSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Number of steps in every sequence
pub const SEQUENCE_LENGTH: usize = 16;

/// Lowest MIDI note reachable by a step (C2)
pub const CV_PITCH_LOW: f64 = 36.0;

/// Semitone span of the 0..1 CV range (four octaves, up to C6)
pub const CV_PITCH_SPAN: f64 = 48.0;

/// Map a step CV (0..1) onto the fixed pitch range, quantized to semitones.
///
/// Non-finite CV yields NaN, which the engine treats as "no pitch".
pub fn cv_to_midi(cv: f64) -> f64 {
    if !cv.is_finite() {
        return f64::NAN;
    }
    CV_PITCH_LOW + libm::round(cv.clamp(0.0, 1.0) * CV_PITCH_SPAN)
}

/// Per-step play state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    /// Plays its pitch
    #[default]
    On,
    /// Silent, but occupies one full step
    Off,
    /// Takes no time at all
    Skip,
}

/// A single sequencer step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub cv: f64,
    pub gate_length: f64,
    #[serde(default)]
    pub state: StepState,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            cv: 0.5,
            gate_length: 0.5,
            state: StepState::On,
        }
    }
}

impl Step {
    pub fn new(cv: f64, gate_length: f64, state: StepState) -> Self {
        Self {
            cv,
            gate_length,
            state,
        }
    }
}

/// Traversal order of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SequenceMode {
    #[default]
    Forward,
    Backward,
    PingPong,
    Random,
}

impl SequenceMode {
    pub const NAMES: &'static [&'static str] = &["forward", "backward", "ping-pong", "random"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "forward" => Some(SequenceMode::Forward),
            "backward" => Some(SequenceMode::Backward),
            "ping-pong" => Some(SequenceMode::PingPong),
            "random" => Some(SequenceMode::Random),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SequenceMode::Forward => "forward",
            SequenceMode::Backward => "backward",
            SequenceMode::PingPong => "ping-pong",
            SequenceMode::Random => "random",
        }
    }
}

/// Sequencer step source
#[derive(Debug, Clone)]
pub struct SequencerPattern {
    steps: [Step; SEQUENCE_LENGTH],
    mode: SequenceMode,
    position: usize,
    rng: StdRng,
}

impl SequencerPattern {
    pub fn new(seed: u64) -> Self {
        Self {
            steps: [Step::default(); SEQUENCE_LENGTH],
            mode: SequenceMode::Forward,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn set_step(&mut self, index: usize, step: Step) {
        if let Some(slot) = self.steps.get_mut(index) {
            *slot = step;
        }
    }

    pub fn step_at(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn set_mode(&mut self, mode: SequenceMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    /// Sequence position of the most recently produced step
    pub fn position(&self) -> usize {
        self.position
    }

    fn position_for(&mut self, index: u64) -> usize {
        let len = SEQUENCE_LENGTH;
        match self.mode {
            SequenceMode::Forward => (index % len as u64) as usize,
            SequenceMode::Backward => len - 1 - (index % len as u64) as usize,
            SequenceMode::PingPong => palindrome(index, len),
            SequenceMode::Random => self.rng.gen_range(0..len),
        }
    }
}

impl StepSource for SequencerPattern {
    fn step(&mut self, index: u64) -> StepOutcome {
        self.position = self.position_for(index);
        let step = self.steps[self.position];
        match step.state {
            StepState::On => StepOutcome::Note {
                pitch: cv_to_midi(step.cv),
                gate_length: step.gate_length,
            },
            StepState::Off => StepOutcome::Rest,
            StepState::Skip => StepOutcome::Skip,
        }
    }

    fn skip_limit(&self) -> usize {
        SEQUENCE_LENGTH - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{Gate, StepEngine, StepEvent};

    const SR: f64 = 48000.0;

    fn ramp() -> SequencerPattern {
        let mut pattern = SequencerPattern::new(7);
        for i in 0..SEQUENCE_LENGTH {
            pattern.set_step(i, Step::new(i as f64 / 48.0, 0.5, StepState::On));
        }
        pattern
    }

    fn positions(pattern: &mut SequencerPattern, count: u64) -> Vec<usize> {
        (0..count)
            .map(|i| {
                pattern.step(i);
                pattern.position()
            })
            .collect()
    }

    #[test]
    fn test_cv_mapping() {
        assert_eq!(cv_to_midi(0.0), 36.0);
        assert_eq!(cv_to_midi(1.0), 84.0);
        assert_eq!(cv_to_midi(0.5), 60.0);
        assert_eq!(cv_to_midi(2.0), 84.0);
        assert!(cv_to_midi(f64::INFINITY).is_nan());
    }

    #[test]
    fn test_forward_and_backward() {
        let mut p = ramp();
        assert_eq!(positions(&mut p, 18)[15..], [15, 0, 1]);
        p.set_mode(SequenceMode::Backward);
        assert_eq!(positions(&mut p, 3), vec![15, 14, 13]);
    }

    #[test]
    fn test_ping_pong_does_not_repeat_ends() {
        let mut p = ramp();
        p.set_mode(SequenceMode::PingPong);
        let pos = positions(&mut p, 32);
        assert_eq!(pos[14..18], [14, 15, 14, 13]);
        assert_eq!(pos[30], 0);
        assert_eq!(pos[31], 1);
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut p = ramp();
        p.set_mode(SequenceMode::Random);
        assert!(positions(&mut p, 200).iter().all(|&i| i < SEQUENCE_LENGTH));
    }

    #[test]
    fn test_mode_names_round_trip() {
        for name in SequenceMode::NAMES {
            assert_eq!(SequenceMode::from_name(name).unwrap().name(), *name);
        }
        let json = serde_json::to_string(&SequenceMode::PingPong).unwrap();
        assert_eq!(json, "\"ping-pong\"");
    }

    #[test]
    fn test_step_serde_shape() {
        let step: Step = serde_json::from_str(r#"{"cv":0.25,"gateLength":0.8}"#).unwrap();
        assert_eq!(step.state, StepState::On);
        let json = serde_json::to_value(Step::new(0.1, 0.2, StepState::Skip)).unwrap();
        assert_eq!(json["state"], "skip");
        assert_eq!(json["gateLength"], 0.2);
    }

    fn run(pattern: &mut SequencerPattern, seconds: f64) -> Vec<StepEvent> {
        let mut engine = StepEngine::new(120.0, 4.0);
        engine.start(0.0);
        let mut events = Vec::new();
        let frames = (seconds * SR) as usize;
        engine.process(0.0, SR, frames, None, pattern, |e| events.push(e));
        events
    }

    #[test]
    fn test_skip_takes_no_time_and_off_takes_a_step() {
        let mut p = ramp();
        p.set_step(1, Step::new(0.0, 0.5, StepState::Skip));
        p.set_step(2, Step::new(0.0, 0.5, StepState::Off));
        // ticks at 0, .125, .25, .375
        let ons: Vec<(f64, f64)> = run(&mut p, 0.5)
            .into_iter()
            .filter(|e| e.gate == Gate::On)
            .map(|e| (e.time, e.pitch.unwrap()))
            .collect();
        // step 0 at 0; step 1 skipped so step 2 (off) takes tick .125;
        // step 3 at .25; step 4 at .375
        assert_eq!(
            ons,
            vec![
                (0.0, cv_to_midi(0.0)),
                (0.25, cv_to_midi(3.0 / 48.0)),
                (0.375, cv_to_midi(4.0 / 48.0)),
            ]
        );
    }

    #[test]
    fn test_all_skip_is_silent_but_advances() {
        let mut p = SequencerPattern::new(1);
        for i in 0..SEQUENCE_LENGTH {
            p.set_step(i, Step::new(0.5, 0.5, StepState::Skip));
        }
        let events = run(&mut p, 0.5);
        assert!(events.is_empty());
    }
}
