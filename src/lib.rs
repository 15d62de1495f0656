//! # Patchbay: Live Modular Patch Graph
//!
//! `patchbay` is the core of an interactive modular-synthesizer editor. Users
//! place modules and wire them with patch cables while audio is running; this
//! crate keeps the module graph and the real-time renderer in agreement, and
//! drives every time-based generator (clock, step sequencer, arpeggiator) from
//! one sample-accurate step engine.
//!
//! ## Architecture
//!
//! - **Patch graph** - [`Patch`] owns modules and connections and mirrors every
//!   change into a [`RenderingEngine`]
//! - **Step engine** - [`StepEngine`] advances musical steps from an internal
//!   tempo or from patched clock pulses
//! - **Bridge** - each step generator is split into an interactive
//!   [`StepController`] and a real-time [`StepRunner`] joined by lock-free rings
//! - **Persistence** - [`PatchDocument`] captures and restores whole patches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patchbay::prelude::*;
//!
//! let renderer = MemoryRenderer::new(48000.0);
//! let mut patch = Patch::new(renderer, EngineConfig::default()).unwrap();
//!
//! let clock = patch.create(ModuleKind::Clock, (0.0, 0.0)).unwrap();
//! let seq = patch.create(ModuleKind::Sequencer, (200.0, 0.0)).unwrap();
//! patch.settle(16);
//!
//! // Patching the clock input switches the sequencer to external clocking
//! patch.connect(PortRef::new(clock, "gate"), PortRef::new(seq, "clock")).unwrap();
//! patch.start(clock).unwrap();
//! patch.start(seq).unwrap();
//!
//! patch.renderer_mut().render_block(4800);
//! for (module, event) in patch.poll_events() {
//!     println!("{:?}: {:?}", module, event);
//! }
//! ```

pub mod arp;
pub mod bridge;
pub mod config;
pub mod graph;
pub mod intent;
pub mod io;
pub mod modules;
pub mod port;
pub mod render;
pub mod sequencer;
pub mod serialize;
pub mod step;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    // Ports and parameters
    pub use crate::port::{
        InputTarget, ParamDef, ParamRange, ParamValue, Parameters, PortDef, PortDirection,
        PortSpec, SignalKind,
    };

    // Patch graph
    pub use crate::graph::{
        Connection, ConnectionId, ModuleId, Patch, PatchError, PortRef, CLOCK_INPUT,
    };

    // Modules
    pub use crate::modules::{
        Module, ModuleKind, ModuleState, ParameterError, Readiness, StepRole,
    };

    // Rendering engine adapter
    pub use crate::render::{
        ChannelMap, MemoryRenderer, RenderError, RenderingEngine, Route, Sink, Source, UnitId,
    };

    // Step engine
    pub use crate::step::{ClockPattern, Gate, StepEngine, StepEvent, StepOutcome, StepSource};
    pub use crate::transport::{step_duration, InternalClock, PulseDetector};

    // Patterns
    pub use crate::arp::{ArpMode, ArpPattern, HeldNotes};
    pub use crate::sequencer::{SequenceMode, SequencerPattern, Step, StepState};

    // Cross-context messaging
    pub use crate::bridge::{
        step_channel, BlockInputs, BlockOutputs, ControlMessage, Pattern, StepController,
        StepRunner,
    };
    pub use crate::io::{AtomicF64, StepOutputs};

    // Persistence
    pub use crate::serialize::{
        ConnectionRecord, DocumentError, ModuleRecord, PatchDocument, RestoreReport,
    };

    // Interaction
    pub use crate::intent::{Intent, IntentError, IntentQueue, Notice, Outcome};

    pub use crate::config::EngineConfig;
}

// Re-export key types at crate root for convenience
pub use prelude::*;
