//! Patch Graph
//!
//! [`Patch`] owns every module and connection of a session and is the only
//! place that mutates them. Each structural change is mirrored into the
//! [`RenderingEngine`]; the graph only records a change after the renderer
//! has accepted it, so a refusal always leaves both sides as they were.

use crate::bridge::ControlMessage;
use crate::config::EngineConfig;
use crate::modules::{Module, ModuleKind, ParameterError, StepRole};
use crate::port::{ParamValue, PortDirection, SignalKind};
use crate::render::{ChannelMap, RenderError, RenderingEngine, Sink, Source};
use crate::sequencer::Step;
use crate::step::StepEvent;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::task::Poll;
use thiserror::Error;

new_key_type! {
    /// Session-unique module identifier
    pub struct ModuleId;

    /// Identifier of one cable
    pub struct ConnectionId;
}

/// Name of the input that switches a step generator to external clocking
pub const CLOCK_INPUT: &str = "clock";

/// Reference to a named port on a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub module: ModuleId,
    pub port: String,
}

impl PortRef {
    pub fn new(module: ModuleId, port: impl Into<String>) -> Self {
        Self {
            module,
            port: port.into(),
        }
    }
}

/// A cable from an output to an input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: PortRef,
    pub dest: PortRef,
    /// Signal kind of the source port, for cable coloring
    pub kind: SignalKind,
}

impl Connection {
    pub fn touches(&self, module: ModuleId) -> bool {
        self.source.module == module || self.dest.module == module
    }
}

/// Errors for patch operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("no module {0:?}")]
    InvalidModule(ModuleId),

    #[error("module {module:?} has no {direction:?} port `{port}`")]
    InvalidPort {
        module: ModuleId,
        port: String,
        direction: PortDirection,
    },

    #[error("no connection {0:?}")]
    InvalidConnection(ConnectionId),

    #[error("unknown module type `{0}`")]
    UnknownModuleType(String),

    #[error("module {0:?} is not ready yet")]
    NotReady(ModuleId),

    #[error("cannot connect {output:?} output to {input:?} input")]
    KindMismatch { output: SignalKind, input: SignalKind },

    #[error("module {0:?} is permanent")]
    PermanentModule(ModuleId),

    #[error("only one {0:?} module may exist")]
    SingletonExists(ModuleKind),

    #[error("module {module:?} has no parameter `{name}`")]
    UnknownParameter { module: ModuleId, name: String },

    #[error("value not accepted for parameter `{name}` of module {module:?}")]
    InvalidParameterValue { module: ModuleId, name: String },

    #[error("module {module:?} does not support {operation}")]
    Unsupported {
        module: ModuleId,
        operation: &'static str,
    },

    #[error("renderer refused: {0}")]
    RendererRejected(#[from] RenderError),
}

impl PatchError {
    fn from_parameter(module: ModuleId, error: ParameterError) -> Self {
        match error {
            ParameterError::Unknown { name, .. } => PatchError::UnknownParameter { module, name },
            ParameterError::Invalid { name } => PatchError::InvalidParameterValue { module, name },
        }
    }
}

/// The session's module graph
pub struct Patch<R: RenderingEngine> {
    renderer: R,
    config: EngineConfig,
    modules: SlotMap<ModuleId, Module>,
    connections: SlotMap<ConnectionId, Connection>,
    keyboard: ModuleId,
    output: ModuleId,
    modules_created: u64,
}

impl<R: RenderingEngine> Patch<R> {
    /// Create a patch holding the permanent keyboard and output modules.
    pub fn new(renderer: R, config: EngineConfig) -> Result<Self, PatchError> {
        let mut patch = Self {
            renderer,
            config,
            modules: SlotMap::with_key(),
            connections: SlotMap::with_key(),
            keyboard: ModuleId::default(),
            output: ModuleId::default(),
            modules_created: 0,
        };
        patch.keyboard = patch.spawn(ModuleKind::Keyboard, (0.0, 0.0))?;
        patch.output = patch.spawn(ModuleKind::Output, (0.0, 0.0))?;
        patch.settle(patch.config.readiness_polls);
        Ok(patch)
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keyboard(&self) -> ModuleId {
        self.keyboard
    }

    pub fn output(&self) -> ModuleId {
        self.output
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules.iter()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.connections.iter()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Every connection with `module` at either end
    pub fn connections_of(&self, module: ModuleId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.touches(module))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn is_externally_clocked(&self, id: ModuleId) -> bool {
        self.modules
            .get(id)
            .is_some_and(Module::is_externally_clocked)
    }

    /// Place a new module. It stays pending until the renderer reports its
    /// unit ready (see [`poll_ready`](Self::poll_ready)).
    pub fn create(
        &mut self,
        kind: ModuleKind,
        position: (f64, f64),
    ) -> Result<ModuleId, PatchError> {
        if kind.is_permanent() {
            return Err(PatchError::SingletonExists(kind));
        }
        self.spawn(kind, position)
    }

    pub fn create_by_name(
        &mut self,
        type_name: &str,
        position: (f64, f64),
    ) -> Result<ModuleId, PatchError> {
        let kind = ModuleKind::from_type_name(type_name)
            .ok_or_else(|| PatchError::UnknownModuleType(type_name.to_string()))?;
        self.create(kind, position)
    }

    fn spawn(&mut self, kind: ModuleKind, position: (f64, f64)) -> Result<ModuleId, PatchError> {
        let unit = self
            .renderer
            .create_unit(kind, &kind.default_parameters())?;

        let seed = self.config.rng_seed.wrapping_add(self.modules_created);
        self.modules_created += 1;
        let (module, runner) = Module::new(kind, unit, position, &self.config, seed);

        if let Some(runner) = runner {
            if let Err(e) = self.renderer.install_processor(unit, runner) {
                self.renderer.release_unit(unit);
                log::warn!("could not install {} processor: {}", kind.type_name(), e);
                return Err(e.into());
            }
        }

        let id = self.modules.insert(module);
        log::info!("created {} module {:?}", kind.type_name(), id);
        Ok(id)
    }

    /// Check whether a module's renderer unit has finished construction.
    ///
    /// Never blocks. A non-permanent module whose construction failed is
    /// removed and the failure returned.
    pub fn poll_ready(&mut self, id: ModuleId) -> Poll<Result<(), PatchError>> {
        let Some(module) = self.modules.get_mut(id) else {
            return Poll::Ready(Err(PatchError::InvalidModule(id)));
        };
        if module.is_ready() {
            return Poll::Ready(Ok(()));
        }

        match self.renderer.poll_ready(module.unit()) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                module.mark_ready();
                log::debug!("module {:?} ready", id);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                log::warn!(
                    "{} module {:?} failed to construct: {}",
                    module.kind().type_name(),
                    id,
                    e
                );
                if !module.is_permanent() {
                    let unit = module.unit();
                    self.modules.remove(id);
                    self.renderer.release_unit(unit);
                }
                Poll::Ready(Err(e.into()))
            }
        }
    }

    /// Poll every pending module up to `max_rounds` times. Returns how many
    /// are still pending.
    pub fn settle(&mut self, max_rounds: usize) -> usize {
        let mut pending = self.pending_modules();
        for _ in 0..max_rounds {
            if pending.is_empty() {
                break;
            }
            pending.retain(|&id| self.poll_ready(id).is_pending());
        }
        if !pending.is_empty() {
            log::debug!("{} modules still constructing", pending.len());
        }
        pending.len()
    }

    fn pending_modules(&self) -> Vec<ModuleId> {
        self.modules
            .iter()
            .filter(|(_, m)| !m.is_ready())
            .map(|(id, _)| id)
            .collect()
    }

    /// Connect an output port to an input port.
    ///
    /// Patching a step generator's `clock` input switches it to external
    /// clocking.
    pub fn connect(&mut self, source: PortRef, dest: PortRef) -> Result<ConnectionId, PatchError> {
        let (route_source, sink, kind) = self.resolve(&source, &dest)?;

        self.renderer
            .connect(route_source, sink, ChannelMap::default())
            .map_err(|e| {
                log::warn!("renderer refused {:?} -> {:?}: {}", source, dest, e);
                PatchError::RendererRejected(e)
            })?;

        let clocks = dest.port == CLOCK_INPUT;
        let dest_module = dest.module;
        let id = self.connections.insert(Connection { source, dest, kind });
        log::debug!("connected {:?}", id);

        if clocks {
            if let Some(module) = self.modules.get_mut(dest_module) {
                module.set_external_clock(true);
            }
        }
        Ok(id)
    }

    /// Validate both ends of a prospective cable and look up the renderer
    /// endpoints.
    fn resolve(
        &self,
        source: &PortRef,
        dest: &PortRef,
    ) -> Result<(Source, Sink, SignalKind), PatchError> {
        let src = self
            .modules
            .get(source.module)
            .ok_or(PatchError::InvalidModule(source.module))?;
        let dst = self
            .modules
            .get(dest.module)
            .ok_or(PatchError::InvalidModule(dest.module))?;

        let src_port = src
            .port_spec()
            .output_by_name(&source.port)
            .ok_or_else(|| PatchError::InvalidPort {
                module: source.module,
                port: source.port.clone(),
                direction: PortDirection::Output,
            })?;
        let dst_port = dst
            .port_spec()
            .input_by_name(&dest.port)
            .ok_or_else(|| PatchError::InvalidPort {
                module: dest.module,
                port: dest.port.clone(),
                direction: PortDirection::Input,
            })?;

        for (id, module) in [(source.module, src), (dest.module, dst)] {
            if !module.is_ready() {
                return Err(PatchError::NotReady(id));
            }
        }
        let route_source = self
            .renderer
            .output_port(src.unit(), &source.port)
            .ok_or(PatchError::NotReady(source.module))?;
        let sink = self
            .renderer
            .input_port(dst.unit(), &dest.port)
            .ok_or(PatchError::NotReady(dest.module))?;

        if src_port.kind != dst_port.kind {
            if self.config.strict_port_kinds {
                return Err(PatchError::KindMismatch {
                    output: src_port.kind,
                    input: dst_port.kind,
                });
            }
            log::debug!(
                "cross-kind cable {:?} -> {:?}",
                src_port.kind,
                dst_port.kind
            );
        }

        Ok((route_source, sink, src_port.kind))
    }

    /// Remove a cable. Succeeds even if the renderer already dropped the route.
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<Connection, PatchError> {
        let connection = self
            .connections
            .remove(id)
            .ok_or(PatchError::InvalidConnection(id))?;

        let endpoints = self
            .modules
            .get(connection.source.module)
            .zip(self.modules.get(connection.dest.module))
            .and_then(|(src, dst)| {
                let source = self.renderer.output_port(src.unit(), &connection.source.port)?;
                let sink = self.renderer.input_port(dst.unit(), &connection.dest.port)?;
                Some((source, sink))
            });
        match endpoints {
            Some((source, sink)) => {
                if !self.renderer.disconnect(source, sink, ChannelMap::default()) {
                    log::debug!("route for {:?} already released by renderer", id);
                }
            }
            None => log::debug!("endpoints for {:?} already gone", id),
        }

        if connection.dest.port == CLOCK_INPUT {
            let dest = &connection.dest;
            let still_clocked = self.connections.values().any(|c| c.dest == *dest);
            if !still_clocked {
                if let Some(module) = self.modules.get_mut(dest.module) {
                    module.set_external_clock(false);
                }
            }
        }

        log::debug!("disconnected {:?}", id);
        Ok(connection)
    }

    /// Delete a module after removing every cable attached to it.
    pub fn delete_module(&mut self, id: ModuleId) -> Result<(), PatchError> {
        let module = self.modules.get(id).ok_or(PatchError::InvalidModule(id))?;
        if module.is_permanent() {
            return Err(PatchError::PermanentModule(id));
        }

        for connection in self.connections_of(id) {
            self.disconnect(connection)?;
        }

        if let Some(module) = self.modules.remove(id) {
            self.renderer.release_unit(module.unit());
            log::info!("deleted {} module {:?}", module.kind().type_name(), id);
        }
        Ok(())
    }

    /// Set a parameter. The value is clamped to the declared range and
    /// forwarded to the renderer and, for step generators, the step runner.
    /// Returns the value actually stored.
    pub fn set_parameter(
        &mut self,
        id: ModuleId,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<ParamValue, PatchError> {
        let module = self
            .modules
            .get_mut(id)
            .ok_or(PatchError::InvalidModule(id))?;
        let stored = module
            .set_parameter(name, &value.into())
            .map_err(|e| PatchError::from_parameter(id, e))?;

        let numeric = module
            .kind()
            .param(name)
            .and_then(|def| def.render_value(&stored));
        if let Some(v) = numeric {
            self.renderer.set_parameter(module.unit(), name, v);
        }
        Ok(stored)
    }

    pub fn start(&mut self, id: ModuleId) -> Result<(), PatchError> {
        self.set_running(id, true)
    }

    pub fn stop(&mut self, id: ModuleId) -> Result<(), PatchError> {
        self.set_running(id, false)
    }

    fn set_running(&mut self, id: ModuleId, running: bool) -> Result<(), PatchError> {
        let module = self.modules.get(id).ok_or(PatchError::InvalidModule(id))?;
        if !module.is_step_generator() {
            return Err(PatchError::Unsupported {
                module: id,
                operation: if running { "start" } else { "stop" },
            });
        }
        self.set_parameter(id, "running", running).map(|_| ())
    }

    /// Replace one sequencer step
    pub fn set_step(&mut self, id: ModuleId, index: usize, step: Step) -> Result<(), PatchError> {
        let module = self
            .modules
            .get_mut(id)
            .ok_or(PatchError::InvalidModule(id))?;
        if module.kind().step_role() != Some(StepRole::Sequencer) {
            return Err(PatchError::Unsupported {
                module: id,
                operation: "steps",
            });
        }
        module
            .set_step(index, step)
            .map_err(|e| PatchError::from_parameter(id, e))
    }

    pub fn note_on(&mut self, id: ModuleId, pitch: u8) -> Result<(), PatchError> {
        self.send_note(id, ControlMessage::NoteOn(pitch), "note_on")
    }

    pub fn note_off(&mut self, id: ModuleId, pitch: u8) -> Result<(), PatchError> {
        self.send_note(id, ControlMessage::NoteOff(pitch), "note_off")
    }

    /// Forget every held note of an arpeggiator, latched ones included
    pub fn release_held(&mut self, id: ModuleId) -> Result<(), PatchError> {
        self.send_note(id, ControlMessage::ReleaseAll, "release_held")
    }

    fn send_note(
        &mut self,
        id: ModuleId,
        message: ControlMessage,
        operation: &'static str,
    ) -> Result<(), PatchError> {
        let module = self
            .modules
            .get_mut(id)
            .ok_or(PatchError::InvalidModule(id))?;
        if module.kind().step_role() != Some(StepRole::Arpeggiator) {
            return Err(PatchError::Unsupported {
                module: id,
                operation,
            });
        }
        module.send(message);
        Ok(())
    }

    pub fn set_position(&mut self, id: ModuleId, x: f64, y: f64) -> Result<(), PatchError> {
        let module = self
            .modules
            .get_mut(id)
            .ok_or(PatchError::InvalidModule(id))?;
        module.set_position(x, y);
        Ok(())
    }

    /// Drain step events from every step generator, updating their output
    /// levels.
    pub fn poll_events(&mut self) -> Vec<(ModuleId, StepEvent)> {
        let mut all = Vec::new();
        let mut buffer = Vec::new();
        for (id, module) in self.modules.iter_mut() {
            if module.drain_events(&mut buffer) > 0 {
                all.extend(buffer.drain(..).map(|event| (id, event)));
            }
        }
        all
    }
}

impl<R: RenderingEngine + std::fmt::Debug> std::fmt::Debug for Patch<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("modules", &self.modules.len())
            .field("connections", &self.connections.len())
            .field("renderer", &self.renderer)
            .finish()
    }
}
