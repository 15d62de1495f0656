//! Step Engine
//!
//! The scheduler shared by every time-based generator (clock, sequencer,
//! arpeggiator). A [`StepEngine`] decides *when* a step fires, from either its
//! internal tempo or rising edges on an external clock signal, and keeps note
//! on/off pairing correct. *What* a step plays comes from a [`StepSource`].
//!
//! The engine runs inside the renderer's real-time callback: it never
//! allocates and never blocks. Events are handed to a caller-supplied sink in
//! time order.

use crate::transport::{clamp_tempo, step_duration, InternalClock, PulseDetector};
use serde::{Deserialize, Serialize};

/// Gate transition carried by a [`StepEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    On,
    Off,
}

/// A note or gate event posted from a step engine to its owning module.
///
/// `pitch` is a MIDI note number, absent for pitch-less clock pulses. A
/// note-off carries the pitch of the note it ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "step")]
pub struct StepEvent {
    pub time: f64,
    pub pitch: Option<f64>,
    pub gate: Gate,
}

impl StepEvent {
    pub fn on(time: f64, pitch: Option<f64>) -> Self {
        Self {
            time,
            pitch,
            gate: Gate::On,
        }
    }

    pub fn off(time: f64, pitch: Option<f64>) -> Self {
        Self {
            time,
            pitch,
            gate: Gate::Off,
        }
    }
}

/// What a single step produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Play a pitch for `gate_length` of the step. Non-finite pitches are silent.
    Note { pitch: f64, gate_length: f64 },

    /// Pitch-less gate pulse (clock ticks)
    Pulse { gate_length: f64 },

    /// Silent step that still occupies its full duration
    Rest,

    /// Consumes no time: the engine immediately asks for the next step
    Skip,
}

/// Supplies the value of each step.
pub trait StepSource {
    /// Produce step number `index`, counted from zero since the last start.
    fn step(&mut self, index: u64) -> StepOutcome;

    /// How many consecutive skips may be taken within one tick before the
    /// tick is treated as a rest.
    fn skip_limit(&self) -> usize {
        0
    }

    /// Called with a step's time just before the step is produced. Sources
    /// fed by sampled input consume it up to this point.
    fn advance_to(&mut self, _time: f64) {}
}

/// Position within a palindromic traversal of `len` items (0, 1, .., len-1, .., 1).
#[inline]
pub fn palindrome(index: u64, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = (2 * len - 2) as u64;
    let p = (index % period) as usize;
    if p < len {
        p
    } else {
        period as usize - p
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScheduledOff {
    time: f64,
    pitch: Option<f64>,
}

/// Transport-synchronized step scheduler
#[derive(Debug, Clone)]
pub struct StepEngine {
    running: bool,
    external: bool,
    tempo: f64,
    subdivision: f64,
    clock: InternalClock,
    pulse: PulseDetector,
    step_index: u64,
    pending_off: Option<ScheduledOff>,
}

impl StepEngine {
    pub fn new(tempo: f64, subdivision: f64) -> Self {
        let tempo = clamp_tempo(tempo);
        Self {
            running: false,
            external: false,
            tempo,
            subdivision,
            clock: InternalClock::new(step_duration(tempo, subdivision)),
            pulse: PulseDetector::new(),
            step_index: 0,
            pending_off: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Number of steps consumed since the last start (skips included)
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Whether a note-off is still scheduled
    pub fn is_sounding(&self) -> bool {
        self.pending_off.is_some()
    }

    /// Step duration currently in force.
    ///
    /// Externally clocked engines use the measured pulse interval once two
    /// edges have been seen.
    pub fn step_duration(&self) -> f64 {
        match (self.external, self.pulse.period()) {
            (true, Some(period)) => period,
            _ => self.clock.duration(),
        }
    }

    /// Start from step zero with the first step due at `now`.
    pub fn start(&mut self, now: f64) {
        self.running = true;
        self.step_index = 0;
        self.clock.arm(now);
    }

    /// Stop advancing. A scheduled note-off is still delivered.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = clamp_tempo(tempo);
        self.clock
            .set_duration(step_duration(self.tempo, self.subdivision));
    }

    pub fn set_subdivision(&mut self, subdivision: f64) {
        self.subdivision = subdivision;
        self.clock
            .set_duration(step_duration(self.tempo, self.subdivision));
    }

    /// Switch between external pulses and internal tempo.
    ///
    /// Returning to internal mode re-arms the grid at `now` so a long
    /// externally clocked stretch does not produce a burst of overdue steps.
    pub fn set_external(&mut self, external: bool, now: f64) {
        if self.external == external {
            return;
        }
        self.external = external;
        self.pulse.forget_timing();
        if !external {
            self.clock.arm(now);
        }
    }

    /// Advance over one render block.
    ///
    /// `clock` holds the external pulse samples for this block; it is only
    /// read in external mode and a missing buffer reads as silence. Events are
    /// passed to `emit` in time order.
    pub fn process<S, F>(
        &mut self,
        block_start: f64,
        sample_rate: f64,
        frames: usize,
        clock: Option<&[f32]>,
        source: &mut S,
        mut emit: F,
    ) where
        S: StepSource + ?Sized,
        F: FnMut(StepEvent),
    {
        let block_end = block_start + frames as f64 / sample_rate;

        if self.external {
            for i in 0..frames {
                let sample = clock.and_then(|c| c.get(i)).copied().unwrap_or(0.0);
                let time = block_start + i as f64 / sample_rate;
                if self.pulse.observe(sample, time) && self.running {
                    self.flush_offs(time, &mut emit);
                    let duration = self.step_duration();
                    self.fire(time, duration, source, &mut emit);
                }
            }
        } else if self.running {
            while self.clock.next_due() < block_end {
                let time = self.clock.next_due();
                self.flush_offs(time, &mut emit);
                let duration = self.clock.duration();
                self.fire(time, duration, source, &mut emit);
                self.clock.advance();
            }
        }

        // Offs strictly inside the block; one landing on the boundary belongs
        // to the next block
        if let Some(off) = self.pending_off {
            if off.time < block_end {
                self.pending_off = None;
                emit(StepEvent::off(off.time, off.pitch));
            }
        }
    }

    fn flush_offs<F: FnMut(StepEvent)>(&mut self, until: f64, emit: &mut F) {
        if let Some(off) = self.pending_off {
            if off.time <= until {
                self.pending_off = None;
                emit(StepEvent::off(off.time, off.pitch));
            }
        }
    }

    fn fire<S, F>(&mut self, time: f64, duration: f64, source: &mut S, emit: &mut F)
    where
        S: StepSource + ?Sized,
        F: FnMut(StepEvent),
    {
        // Monophonic: a note still sounding is cut at the new step
        if let Some(off) = self.pending_off.take() {
            emit(StepEvent::off(time, off.pitch));
        }

        source.advance_to(time);
        let mut outcome = source.step(self.step_index);
        self.step_index += 1;
        let mut skips = 0;
        while outcome == StepOutcome::Skip && skips < source.skip_limit() {
            outcome = source.step(self.step_index);
            self.step_index += 1;
            skips += 1;
        }

        let (pitch, gate_length) = match outcome {
            StepOutcome::Note { pitch, gate_length } if pitch.is_finite() => {
                (Some(pitch), gate_length)
            }
            StepOutcome::Pulse { gate_length } => (None, gate_length),
            _ => return,
        };

        emit(StepEvent::on(time, pitch));
        self.pending_off = Some(ScheduledOff {
            time: time + duration * gate_length.clamp(0.0, 1.0),
            pitch,
        });
    }
}

/// Clock pattern: every step is a pitch-less gate pulse
#[derive(Debug, Clone, Copy)]
pub struct ClockPattern {
    pub gate_length: f64,
}

impl Default for ClockPattern {
    fn default() -> Self {
        Self { gate_length: 0.5 }
    }
}

impl StepSource for ClockPattern {
    fn step(&mut self, _index: u64) -> StepOutcome {
        StepOutcome::Pulse {
            gate_length: self.gate_length,
        }
    }
}
