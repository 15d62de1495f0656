//! Interaction layer
//!
//! User gestures arrive as [`Intent`]s. An [`IntentQueue`] applies them to a
//! [`Patch`] one at a time in arrival order; failures become [`Notice`]s for
//! the editor to show instead of interrupting the session.

use crate::graph::{Connection, ConnectionId, ModuleId, Patch, PatchError, PortRef};
use crate::modules::ModuleKind;
use crate::port::ParamValue;
use crate::render::RenderingEngine;
use crate::serialize::{DocumentError, PatchDocument, RestoreReport};
use std::collections::VecDeque;
use thiserror::Error;

/// A requested change to the patch
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Create {
        kind: ModuleKind,
        position: (f64, f64),
    },
    Connect {
        source: PortRef,
        dest: PortRef,
    },
    Disconnect(ConnectionId),
    DeleteModule(ModuleId),
    SetParameter {
        module: ModuleId,
        name: String,
        value: ParamValue,
    },
    Start(ModuleId),
    Stop(ModuleId),
    RequestSave,
    /// Restore from a JSON patch document
    RequestLoad(String),
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Create { .. } => "create",
            Intent::Connect { .. } => "connect",
            Intent::Disconnect(_) => "disconnect",
            Intent::DeleteModule(_) => "delete",
            Intent::SetParameter { .. } => "set parameter",
            Intent::Start(_) => "start",
            Intent::Stop(_) => "stop",
            Intent::RequestSave => "save",
            Intent::RequestLoad(_) => "load",
        }
    }
}

/// Result of an applied intent
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created(ModuleId),
    Connected(ConnectionId),
    Disconnected(Connection),
    Deleted(ModuleId),
    ParameterSet(ParamValue),
    Started(ModuleId),
    Stopped(ModuleId),
    /// JSON of the captured document
    Saved(String),
    Loaded(RestoreReport),
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("could not read patch document: {0}")]
    Document(#[from] DocumentError),

    #[error("could not write patch document: {0}")]
    Save(#[from] serde_json::Error),
}

impl IntentError {
    /// Not-ready refusals are expected while units construct
    pub fn is_not_ready(&self) -> bool {
        matches!(self, IntentError::Patch(PatchError::NotReady(_)))
    }
}

/// A failed intent, kept for the editor to display
#[derive(Debug)]
pub struct Notice {
    pub intent: &'static str,
    pub error: IntentError,
}

impl<R: RenderingEngine> Patch<R> {
    pub fn apply(&mut self, intent: Intent) -> Result<Outcome, IntentError> {
        let outcome = match intent {
            Intent::Create { kind, position } => Outcome::Created(self.create(kind, position)?),
            Intent::Connect { source, dest } => Outcome::Connected(self.connect(source, dest)?),
            Intent::Disconnect(id) => Outcome::Disconnected(self.disconnect(id)?),
            Intent::DeleteModule(id) => {
                self.delete_module(id)?;
                Outcome::Deleted(id)
            }
            Intent::SetParameter {
                module,
                name,
                value,
            } => Outcome::ParameterSet(self.set_parameter(module, &name, value)?),
            Intent::Start(id) => {
                self.start(id)?;
                Outcome::Started(id)
            }
            Intent::Stop(id) => {
                self.stop(id)?;
                Outcome::Stopped(id)
            }
            Intent::RequestSave => Outcome::Saved(self.capture().to_json()?),
            Intent::RequestLoad(json) => {
                let document = PatchDocument::from_json(&json)?;
                Outcome::Loaded(self.restore(&document))
            }
        };
        Ok(outcome)
    }
}

/// FIFO of pending intents
#[derive(Debug, Default)]
pub struct IntentQueue {
    pending: VecDeque<Intent>,
    notices: Vec<Notice>,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: Intent) {
        self.pending.push_back(intent);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply every queued intent in order. Failed intents are logged and
    /// kept as notices; they are not retried.
    pub fn run<R: RenderingEngine>(&mut self, patch: &mut Patch<R>) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(self.pending.len());
        while let Some(intent) = self.pending.pop_front() {
            let label = intent.label();
            match patch.apply(intent) {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    if error.is_not_ready() {
                        log::info!("{} refused: {}", label, error);
                    } else {
                        log::warn!("{} failed: {}", label, error);
                    }
                    self.notices.push(Notice {
                        intent: label,
                        error,
                    });
                }
            }
        }
        outcomes
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::render::MemoryRenderer;

    fn patch() -> Patch<MemoryRenderer> {
        Patch::new(MemoryRenderer::new(48000.0), EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_apply_create_and_connect() {
        let mut p = patch();
        let Ok(Outcome::Created(osc)) = p.apply(Intent::Create {
            kind: ModuleKind::Oscillator,
            position: (0.0, 0.0),
        }) else {
            panic!("create failed");
        };
        p.settle(1);
        let out = p.output();
        let outcome = p
            .apply(Intent::Connect {
                source: PortRef::new(osc, "out"),
                dest: PortRef::new(out, "in"),
            })
            .unwrap();
        assert!(matches!(outcome, Outcome::Connected(_)));
    }

    #[test]
    fn test_queue_collects_notices_and_continues() {
        let mut p = patch();
        p.renderer_mut().set_ready_after(5);
        let filter = p.create(ModuleKind::Filter, (0.0, 0.0)).unwrap();
        let keyboard = p.keyboard();

        let mut queue = IntentQueue::new();
        queue.push(Intent::Connect {
            source: PortRef::new(keyboard, "pitch"),
            dest: PortRef::new(filter, "cutoff"),
        });
        queue.push(Intent::DeleteModule(keyboard));
        queue.push(Intent::SetParameter {
            module: filter,
            name: "cutoff".into(),
            value: 440.0.into(),
        });
        assert_eq!(queue.len(), 3);

        let outcomes = queue.run(&mut p);
        assert!(queue.is_empty());
        assert_eq!(outcomes, vec![Outcome::ParameterSet(ParamValue::Number(440.0))]);

        let notices = queue.take_notices();
        assert_eq!(notices.len(), 2);
        assert!(notices[0].error.is_not_ready());
        assert_eq!(notices[1].intent, "delete");
        assert!(queue.notices().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let mut p = patch();
        p.create(ModuleKind::Clock, (4.0, 5.0)).unwrap();
        let Ok(Outcome::Saved(json)) = p.apply(Intent::RequestSave) else {
            panic!("save failed");
        };

        let mut q = patch();
        match q.apply(Intent::RequestLoad(json)) {
            Ok(Outcome::Loaded(report)) => assert_eq!(report.modules_created, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            q.apply(Intent::RequestLoad("not json".into())),
            Err(IntentError::Document(_))
        ));
    }
}
