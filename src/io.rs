//! Output signal levels
//!
//! Step generators publish their current gate and pitch as lock-free values
//! that the renderer reads as constant sources. Pitch uses 1V/octave with
//! 0V = MIDI note 60 (middle C).

use crate::step::{Gate, StepEvent};
use std::sync::atomic::{AtomicU64, Ordering};

/// MIDI note mapped to 0V
pub const REFERENCE_NOTE: f64 = 60.0;

/// MIDI note to pitch voltage
#[inline]
pub fn midi_to_volts(note: f64) -> f64 {
    (note - REFERENCE_NOTE) / 12.0
}

/// Pitch voltage to the nearest MIDI note, clamped to 0..=127
#[inline]
pub fn volts_to_midi(volts: f64) -> u8 {
    let note = libm::round(REFERENCE_NOTE + volts * 12.0);
    if note.is_finite() {
        note.clamp(0.0, 127.0) as u8
    } else {
        REFERENCE_NOTE as u8
    }
}

/// Atomic f64 for lock-free communication between threads
///
/// Uses AtomicU64 internally since there's no native AtomicF64.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// Gate and pitch levels of a step generator's outputs
#[derive(Debug, Default)]
pub struct StepOutputs {
    gate: AtomicF64,
    pitch: AtomicF64,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an event onto the output levels.
    ///
    /// Gate on/off becomes 1/0. A note-on with a pitch moves the pitch output;
    /// pitch is held through the note-off so release tails keep their note.
    pub fn apply(&self, event: &StepEvent) {
        match event.gate {
            Gate::On => {
                if let Some(pitch) = event.pitch {
                    self.pitch.set(midi_to_volts(pitch));
                }
                self.gate.set(1.0);
            }
            Gate::Off => self.gate.set(0.0),
        }
    }

    pub fn gate(&self) -> f64 {
        self.gate.get()
    }

    pub fn pitch_volts(&self) -> f64 {
        self.pitch.get()
    }

    /// Level of an output port by name
    pub fn level(&self, port: &str) -> Option<f64> {
        match port {
            "gate" => Some(self.gate()),
            "pitch" => Some(self.pitch_volts()),
            _ => None,
        }
    }

    pub fn reset(&self) {
        self.gate.set(0.0);
        self.pitch.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f64() {
        let a = AtomicF64::new(1.5);
        assert_eq!(a.get(), 1.5);
        a.set(-0.25);
        assert_eq!(a.clone().get(), -0.25);
    }

    #[test]
    fn test_pitch_conversions() {
        assert_eq!(midi_to_volts(60.0), 0.0);
        assert_eq!(midi_to_volts(72.0), 1.0);
        assert_eq!(volts_to_midi(-1.0), 48);
        assert_eq!(volts_to_midi(0.99 / 12.0), 61);
        assert_eq!(volts_to_midi(100.0), 127);
        assert_eq!(volts_to_midi(f64::NAN), 60);
    }

    #[test]
    fn test_step_outputs_follow_events() {
        let out = StepOutputs::new();
        out.apply(&StepEvent::on(0.0, Some(72.0)));
        assert_eq!(out.gate(), 1.0);
        assert_eq!(out.pitch_volts(), 1.0);

        out.apply(&StepEvent::off(0.1, Some(72.0)));
        assert_eq!(out.gate(), 0.0);
        assert_eq!(out.level("pitch"), Some(1.0));

        // Clock pulses leave pitch untouched
        out.apply(&StepEvent::on(0.2, None));
        assert_eq!(out.level("gate"), Some(1.0));
        assert_eq!(out.pitch_volts(), 1.0);
        assert!(out.level("out").is_none());
    }
}
