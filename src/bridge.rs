//! Bridge between the interactive context and a step generator's real-time half.
//!
//! # Architecture
//!
//! - **Interactive side** owns a [`StepController`]: it posts configuration as
//!   [`ControlMessage`]s and drains [`StepEvent`]s.
//! - **Real-time side** owns a [`StepRunner`]: once per render block it applies
//!   every pending message, advances the [`StepEngine`] and posts events back.
//!
//! Both directions are bounded single-producer/single-consumer rings. Neither
//! side ever blocks: a full control ring is coalesced last-value-wins on the
//! interactive side, a full event ring drops the event and counts it.

use crate::arp::{ArpMode, ArpPattern, NoteInput};
use crate::io::{midi_to_volts, StepOutputs};
use crate::sequencer::{SequenceMode, SequencerPattern, Step};
use crate::step::{ClockPattern, Gate, StepEngine, StepEvent, StepOutcome, StepSource};
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Configuration posted from the interactive context to a running engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMessage {
    Start,
    Stop,
    SetTempo(f64),
    SetDivision(f64),
    SetGateLength(f64),
    SetExternalClock(bool),
    SetSequenceMode(SequenceMode),
    SetStep { index: usize, step: Step },
    SetArpMode(ArpMode),
    SetOctaves(u8),
    SetHold(bool),
    NoteOn(u8),
    NoteOff(u8),
    ReleaseAll,
}

/// Settings that later messages overwrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    Running,
    Tempo,
    Division,
    GateLength,
    ExternalClock,
    SequenceMode,
    Step(usize),
    ArpMode,
    Octaves,
    Hold,
}

impl ControlMessage {
    fn setting(&self) -> Option<Setting> {
        match self {
            ControlMessage::Start | ControlMessage::Stop => Some(Setting::Running),
            ControlMessage::SetTempo(_) => Some(Setting::Tempo),
            ControlMessage::SetDivision(_) => Some(Setting::Division),
            ControlMessage::SetGateLength(_) => Some(Setting::GateLength),
            ControlMessage::SetExternalClock(_) => Some(Setting::ExternalClock),
            ControlMessage::SetSequenceMode(_) => Some(Setting::SequenceMode),
            ControlMessage::SetStep { index, .. } => Some(Setting::Step(*index)),
            ControlMessage::SetArpMode(_) => Some(Setting::ArpMode),
            ControlMessage::SetOctaves(_) => Some(Setting::Octaves),
            ControlMessage::SetHold(_) => Some(Setting::Hold),
            ControlMessage::NoteOn(_) | ControlMessage::NoteOff(_) | ControlMessage::ReleaseAll => {
                None
            }
        }
    }
}

/// The step source driven by a runner
#[derive(Debug, Clone)]
pub enum Pattern {
    Clock(ClockPattern),
    Sequencer(SequencerPattern),
    Arp(ArpPattern),
}

impl StepSource for Pattern {
    fn step(&mut self, index: u64) -> StepOutcome {
        match self {
            Pattern::Clock(p) => p.step(index),
            Pattern::Sequencer(p) => p.step(index),
            Pattern::Arp(p) => p.step(index),
        }
    }

    fn skip_limit(&self) -> usize {
        match self {
            Pattern::Clock(p) => p.skip_limit(),
            Pattern::Sequencer(p) => p.skip_limit(),
            Pattern::Arp(p) => p.skip_limit(),
        }
    }
}

/// Input buffers for one block. Absent buffers read as silence.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockInputs<'a> {
    pub clock: Option<&'a [f32]>,
    pub pitch: Option<&'a [f32]>,
    pub gate: Option<&'a [f32]>,
}

/// Output buffers for one block
#[derive(Debug)]
pub struct BlockOutputs<'a> {
    pub gate: &'a mut [f32],
    pub pitch: &'a mut [f32],
}

impl BlockOutputs<'_> {
    fn fill(&mut self, from: usize, to: usize, levels: &Levels) {
        let gate_end = to.min(self.gate.len());
        if from < gate_end {
            self.gate[from..gate_end].fill(levels.gate);
        }
        let pitch_end = to.min(self.pitch.len());
        if from < pitch_end {
            self.pitch[from..pitch_end].fill(levels.pitch);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Levels {
    gate: f32,
    pitch: f32,
}

impl Levels {
    fn apply(&mut self, event: &StepEvent) {
        match event.gate {
            Gate::On => {
                if let Some(pitch) = event.pitch {
                    self.pitch = midi_to_volts(pitch) as f32;
                }
                self.gate = 1.0;
            }
            Gate::Off => self.gate = 0.0,
        }
    }
}

/// Create a linked controller/runner pair around a pattern.
pub fn step_channel(
    pattern: Pattern,
    engine: StepEngine,
    control_capacity: usize,
    event_capacity: usize,
) -> (StepController, StepRunner) {
    let (control_tx, control_rx) = RingBuffer::new(control_capacity.max(1));
    let (event_tx, event_rx) = RingBuffer::new(event_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    let controller = StepController {
        control: control_tx,
        events: event_rx,
        backlog: Vec::new(),
        outputs: Arc::new(StepOutputs::new()),
        dropped: Arc::clone(&dropped),
    };

    let runner = StepRunner {
        control: control_rx,
        events: event_tx,
        engine,
        pattern,
        note_input: NoteInput::default(),
        levels: Levels::default(),
        dropped,
    };

    (controller, runner)
}

/// Interactive-side handle of a step generator
pub struct StepController {
    control: Producer<ControlMessage>,
    events: Consumer<StepEvent>,
    backlog: Vec<ControlMessage>,
    outputs: Arc<StepOutputs>,
    dropped: Arc<AtomicU64>,
}

impl StepController {
    /// Post a message without blocking.
    ///
    /// If the ring is full the message waits in a backlog. A setting
    /// overwrites an older backlog entry for the same setting in place, unless
    /// a note message was queued after that entry.
    pub fn send(&mut self, message: ControlMessage) {
        self.flush();
        if self.backlog.is_empty() {
            if let Err(rtrb::PushError::Full(message)) = self.control.push(message) {
                self.enqueue_backlog(message);
            }
        } else {
            self.enqueue_backlog(message);
        }
    }

    fn enqueue_backlog(&mut self, message: ControlMessage) {
        if let Some(setting) = message.setting() {
            // Entries before the last note message keep their order
            let mergeable = self
                .backlog
                .iter()
                .rposition(|m| m.setting().is_none())
                .map_or(0, |i| i + 1);
            if let Some(slot) = self.backlog[mergeable..]
                .iter_mut()
                .find(|m| m.setting() == Some(setting))
            {
                *slot = message;
                return;
            }
        }
        self.backlog.push(message);
    }

    /// Move as much of the backlog into the ring as fits. Returns what is left.
    pub fn flush(&mut self) -> usize {
        let mut sent = 0;
        for message in &self.backlog {
            if self.control.push(*message).is_err() {
                break;
            }
            sent += 1;
        }
        self.backlog.drain(..sent);
        self.backlog.len()
    }

    /// Drain pending events, updating the output levels. Returns the count.
    pub fn drain_events(&mut self, out: &mut Vec<StepEvent>) -> usize {
        self.flush();
        let mut count = 0;
        while let Ok(event) = self.events.pop() {
            self.outputs.apply(&event);
            out.push(event);
            count += 1;
        }
        count
    }

    pub fn outputs(&self) -> &Arc<StepOutputs> {
        &self.outputs
    }

    /// Events the real-time side had to drop because the ring was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

impl std::fmt::Debug for StepController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepController")
            .field("backlog", &self.backlog)
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

/// Real-time half of a step generator, hosted by the renderer
pub struct StepRunner {
    control: Consumer<ControlMessage>,
    events: Producer<StepEvent>,
    engine: StepEngine,
    pattern: Pattern,
    note_input: NoteInput,
    levels: Levels,
    dropped: Arc<AtomicU64>,
}

impl StepRunner {
    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Render one block.
    ///
    /// Control messages posted since the previous block are applied first, at
    /// `block_start`. Output buffers, when given, receive the gate (0/1) and
    /// pitch (1V/oct) levels sample by sample.
    pub fn process(
        &mut self,
        block_start: f64,
        sample_rate: f64,
        frames: usize,
        inputs: BlockInputs<'_>,
        mut outputs: Option<BlockOutputs<'_>>,
    ) {
        while let Ok(message) = self.control.pop() {
            self.apply(message, block_start);
        }

        let Self {
            engine,
            pattern,
            note_input,
            events,
            levels,
            dropped,
            ..
        } = self;

        let mut cursor = 0usize;
        let emit = |event: StepEvent| {
            let offset = ((event.time - block_start) * sample_rate).round().max(0.0) as usize;
            let offset = offset.min(frames);
            if let Some(out) = outputs.as_mut() {
                out.fill(cursor, offset, levels);
            }
            cursor = cursor.max(offset);
            levels.apply(&event);
            if events.push(event).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        };

        match (pattern, inputs.gate) {
            (Pattern::Arp(arp), Some(gate)) => {
                let mut source = GatedArp {
                    arp,
                    input: note_input,
                    pitch: inputs.pitch,
                    gate,
                    block_start,
                    sample_rate,
                    scanned: 0,
                };
                engine.process(
                    block_start,
                    sample_rate,
                    frames,
                    inputs.clock,
                    &mut source,
                    emit,
                );
                source.scan_until(frames);
            }
            (pattern, _) => {
                engine.process(block_start, sample_rate, frames, inputs.clock, pattern, emit)
            }
        }

        if let Some(out) = outputs.as_mut() {
            out.fill(cursor, frames, levels);
        }
    }

    fn apply(&mut self, message: ControlMessage, now: f64) {
        match (message, &mut self.pattern) {
            (ControlMessage::Start, _) => self.engine.start(now),
            (ControlMessage::Stop, _) => self.engine.stop(),
            (ControlMessage::SetTempo(tempo), _) => self.engine.set_tempo(tempo),
            (ControlMessage::SetDivision(division), _) => self.engine.set_subdivision(division),
            (ControlMessage::SetExternalClock(external), _) => {
                self.engine.set_external(external, now)
            }
            (ControlMessage::SetGateLength(length), Pattern::Clock(clock)) => {
                clock.gate_length = length
            }
            (ControlMessage::SetGateLength(length), Pattern::Arp(arp)) => {
                arp.set_gate_length(length)
            }
            (ControlMessage::SetSequenceMode(mode), Pattern::Sequencer(seq)) => seq.set_mode(mode),
            (ControlMessage::SetStep { index, step }, Pattern::Sequencer(seq)) => {
                seq.set_step(index, step)
            }
            (ControlMessage::SetArpMode(mode), Pattern::Arp(arp)) => arp.set_mode(mode),
            (ControlMessage::SetOctaves(octaves), Pattern::Arp(arp)) => arp.set_octaves(octaves),
            (ControlMessage::SetHold(hold), Pattern::Arp(arp)) => arp.notes.set_hold(hold),
            (ControlMessage::NoteOn(pitch), Pattern::Arp(arp)) => arp.notes.press(pitch),
            (ControlMessage::NoteOff(pitch), Pattern::Arp(arp)) => arp.notes.release(pitch),
            (ControlMessage::ReleaseAll, Pattern::Arp(arp)) => arp.notes.clear(),
            // Settings that do not apply to this pattern
            _ => {}
        }
    }
}

/// Arpeggiator whose held notes follow patched gate and pitch inputs.
///
/// Input samples are consumed up to each step's time, so a key pressed later
/// in the block never sounds on an earlier step.
struct GatedArp<'a, 'b> {
    arp: &'a mut ArpPattern,
    input: &'a mut NoteInput,
    pitch: Option<&'b [f32]>,
    gate: &'b [f32],
    block_start: f64,
    sample_rate: f64,
    scanned: usize,
}

impl GatedArp<'_, '_> {
    fn scan_until(&mut self, end: usize) {
        let end = end.min(self.gate.len());
        if self.scanned < end {
            self.input.scan(self.pitch, self.gate, self.scanned..end, &mut self.arp.notes);
            self.scanned = end;
        }
    }
}

impl StepSource for GatedArp<'_, '_> {
    fn step(&mut self, index: u64) -> StepOutcome {
        self.arp.step(index)
    }

    fn skip_limit(&self) -> usize {
        self.arp.skip_limit()
    }

    fn advance_to(&mut self, time: f64) {
        // The sample at the step's own time is included
        let offset = ((time - self.block_start) * self.sample_rate).round().max(0.0) as usize;
        self.scan_until(offset + 1);
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("engine", &self.engine)
            .field("pattern", &self.pattern)
            .finish()
    }
}
