//! Arpeggiator pattern
//!
//! Cycles through the currently held notes across a number of octaves.
//! Held notes live in fixed-capacity storage so note handling stays
//! allocation-free on the real-time side.

use crate::io::volts_to_midi;
use crate::step::{palindrome, StepOutcome, StepSource};
use crate::transport::PULSE_THRESHOLD;
use arrayvec::ArrayVec;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Maximum number of simultaneously held notes
pub const MAX_HELD_NOTES: usize = 32;

/// Arpeggiator always runs in sixteenth notes
pub const ARP_SUBDIVISION: f64 = 4.0;

pub const MAX_OCTAVES: u8 = 4;

/// Arpeggio direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArpMode {
    #[default]
    Up,
    Down,
    UpDown,
    Random,
}

impl ArpMode {
    pub const NAMES: &'static [&'static str] = &["up", "down", "up-down", "random"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "up" => Some(ArpMode::Up),
            "down" => Some(ArpMode::Down),
            "up-down" => Some(ArpMode::UpDown),
            "random" => Some(ArpMode::Random),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArpMode::Up => "up",
            ArpMode::Down => "down",
            ArpMode::UpDown => "up-down",
            ArpMode::Random => "random",
        }
    }
}

type NoteSet = ArrayVec<u8, MAX_HELD_NOTES>;

fn insert_sorted(set: &mut NoteSet, pitch: u8) {
    if let Err(at) = set.binary_search(&pitch) {
        // Full: the new note is dropped
        let _ = set.try_insert(at, pitch);
    }
}

fn remove(set: &mut NoteSet, pitch: u8) {
    if let Ok(at) = set.binary_search(&pitch) {
        set.remove(at);
    }
}

/// Sorted set of held pitches with optional hold (latch).
///
/// `pressed` tracks keys physically down; `held` is what the arpeggio plays.
/// With hold enabled, releasing a key keeps its note until hold is released.
#[derive(Debug, Clone, Default)]
pub struct HeldNotes {
    pressed: NoteSet,
    held: NoteSet,
    hold: bool,
}

impl HeldNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, pitch: u8) {
        insert_sorted(&mut self.pressed, pitch);
        insert_sorted(&mut self.held, pitch);
    }

    pub fn release(&mut self, pitch: u8) {
        remove(&mut self.pressed, pitch);
        if !self.hold {
            remove(&mut self.held, pitch);
        }
    }

    pub fn set_hold(&mut self, hold: bool) {
        self.hold = hold;
        if !hold {
            let pressed = &self.pressed;
            self.held.retain(|p| pressed.contains(p));
        }
    }

    pub fn hold(&self) -> bool {
        self.hold
    }

    pub fn clear(&mut self) {
        self.pressed.clear();
        self.held.clear();
    }

    /// Held pitches in ascending order
    pub fn sorted(&self) -> &[u8] {
        &self.held
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Turns patched pitch + gate signals into press/release calls
#[derive(Debug, Clone, Copy, Default)]
pub struct NoteInput {
    last_gate: f32,
    sounding: Option<u8>,
}

impl NoteInput {
    /// Scan the samples in `range` of a block's pitch (1V/oct) and gate
    /// buffers. Successive calls must cover the block in order.
    pub fn scan(
        &mut self,
        pitch: Option<&[f32]>,
        gate: &[f32],
        range: Range<usize>,
        notes: &mut HeldNotes,
    ) {
        for i in range {
            let Some(&g) = gate.get(i) else {
                break;
            };
            let was_high = self.last_gate > PULSE_THRESHOLD;
            let is_high = g > PULSE_THRESHOLD;
            self.last_gate = g;
            if is_high && !was_high {
                let volts = pitch.and_then(|p| p.get(i)).copied().unwrap_or(0.0);
                let note = volts_to_midi(volts as f64);
                if let Some(prev) = self.sounding.replace(note) {
                    notes.release(prev);
                }
                notes.press(note);
            } else if was_high && !is_high {
                if let Some(prev) = self.sounding.take() {
                    notes.release(prev);
                }
            }
        }
    }
}

/// Arpeggiator step source
#[derive(Debug, Clone)]
pub struct ArpPattern {
    pub notes: HeldNotes,
    mode: ArpMode,
    octaves: u8,
    gate_length: f64,
    rng: StdRng,
}

impl ArpPattern {
    pub fn new(seed: u64) -> Self {
        Self {
            notes: HeldNotes::new(),
            mode: ArpMode::Up,
            octaves: 1,
            gate_length: 0.5,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn set_mode(&mut self, mode: ArpMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ArpMode {
        self.mode
    }

    pub fn set_octaves(&mut self, octaves: u8) {
        self.octaves = octaves.clamp(1, MAX_OCTAVES);
    }

    pub fn octaves(&self) -> u8 {
        self.octaves
    }

    pub fn set_gate_length(&mut self, gate_length: f64) {
        self.gate_length = gate_length;
    }

    /// Pitch for step `index`, or `None` when nothing is held
    pub fn pitch_at(&mut self, index: u64) -> Option<f64> {
        let sorted = self.notes.sorted();
        let n = sorted.len();
        if n == 0 {
            return None;
        }
        let octaves = self.octaves.max(1) as usize;
        let span = n * octaves;

        let (note, octave) = match self.mode {
            ArpMode::Up => {
                let idx = (index % span as u64) as usize;
                (sorted[idx % n], idx / n)
            }
            ArpMode::Down => {
                let idx = (index % span as u64) as usize;
                (sorted[n - 1 - idx % n], idx / n)
            }
            ArpMode::UpDown => {
                let idx = palindrome(index, span);
                (sorted[idx % n], idx / n)
            }
            ArpMode::Random => {
                let note = sorted[self.rng.gen_range(0..n)];
                (note, self.rng.gen_range(0..octaves))
            }
        };
        Some(note as f64 + 12.0 * octave as f64)
    }
}

impl StepSource for ArpPattern {
    fn step(&mut self, index: u64) -> StepOutcome {
        match self.pitch_at(index) {
            Some(pitch) => StepOutcome::Note {
                pitch,
                gate_length: self.gate_length,
            },
            None => StepOutcome::Rest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::midi_to_volts;

    fn arp(notes: &[u8], mode: ArpMode, octaves: u8) -> ArpPattern {
        let mut p = ArpPattern::new(42);
        for &n in notes {
            p.notes.press(n);
        }
        p.set_mode(mode);
        p.set_octaves(octaves);
        p
    }

    fn pitches(p: &mut ArpPattern, count: u64) -> Vec<f64> {
        (0..count).filter_map(|i| p.pitch_at(i)).collect()
    }

    #[test]
    fn test_up() {
        let mut p = arp(&[67, 60, 64], ArpMode::Up, 1);
        assert_eq!(pitches(&mut p, 6), vec![60.0, 64.0, 67.0, 60.0, 64.0, 67.0]);
    }

    #[test]
    fn test_down() {
        let mut p = arp(&[60, 64, 67], ArpMode::Down, 1);
        assert_eq!(pitches(&mut p, 6), vec![67.0, 64.0, 60.0, 67.0, 64.0, 60.0]);
    }

    #[test]
    fn test_up_two_octaves() {
        let mut p = arp(&[60, 64], ArpMode::Up, 2);
        assert_eq!(pitches(&mut p, 5), vec![60.0, 64.0, 72.0, 76.0, 60.0]);
    }

    #[test]
    fn test_up_down_palindrome() {
        let mut p = arp(&[60, 64, 67], ArpMode::UpDown, 1);
        assert_eq!(
            pitches(&mut p, 8),
            vec![60.0, 64.0, 67.0, 64.0, 60.0, 64.0, 67.0, 64.0]
        );
        let mut single = arp(&[60], ArpMode::UpDown, 1);
        assert_eq!(pitches(&mut single, 3), vec![60.0, 60.0, 60.0]);
    }

    #[test]
    fn test_random_choices_stay_in_span() {
        let mut p = arp(&[60, 64, 67], ArpMode::Random, 2);
        let allowed = [60.0, 64.0, 67.0, 72.0, 76.0, 79.0];
        assert!(pitches(&mut p, 100).iter().all(|x| allowed.contains(x)));
    }

    #[test]
    fn test_empty_is_rest() {
        let mut p = ArpPattern::new(0);
        assert_eq!(p.step(0), StepOutcome::Rest);
    }

    #[test]
    fn test_hold_latches_until_release() {
        let mut notes = HeldNotes::new();
        notes.set_hold(true);
        notes.press(60);
        notes.press(64);
        notes.release(60);
        notes.release(64);
        assert_eq!(notes.sorted(), &[60, 64]);
        notes.press(67);
        notes.set_hold(false);
        assert_eq!(notes.sorted(), &[67]);
    }

    #[test]
    fn test_held_notes_ignore_duplicates() {
        let mut notes = HeldNotes::new();
        notes.press(64);
        notes.press(64);
        notes.release(64);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_note_input_edges() {
        let mut notes = HeldNotes::new();
        let mut input = NoteInput::default();
        let pitch = [midi_to_volts(64.0) as f32; 4];
        input.scan(Some(&pitch), &[0.0, 1.0, 1.0, 1.0], 0..4, &mut notes);
        assert_eq!(notes.sorted(), &[64]);
        input.scan(Some(&pitch), &[1.0, 0.0, 0.0, 0.0], 0..4, &mut notes);
        assert!(notes.is_empty());
    }

    #[test]
    fn test_note_input_partial_scan() {
        let mut notes = HeldNotes::new();
        let mut input = NoteInput::default();
        let pitch = [midi_to_volts(67.0) as f32; 4];
        let gate = [0.0, 0.0, 1.0, 1.0];
        input.scan(Some(&pitch), &gate, 0..2, &mut notes);
        assert!(notes.is_empty());
        input.scan(Some(&pitch), &gate, 2..8, &mut notes);
        assert_eq!(notes.sorted(), &[67]);
    }
}
