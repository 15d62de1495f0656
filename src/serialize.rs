//! Serialization and Persistence
//!
//! Patch documents are plain JSON:
//!
//! ```json
//! {
//!   "modules": [{ "id": "3", "type": "filter", "x": 120, "y": 40, "cutoff": 800 }],
//!   "connections": [{ "sourceId": "3", "sourcePort": "out", "destId": "2", "destPort": "in" }]
//! }
//! ```
//!
//! Module parameters sit next to the record's own fields. Loading is lenient:
//! a malformed entry is skipped with a warning instead of failing the whole
//! document, and restoring never aborts on a single bad module or cable.

use crate::graph::{ModuleId, Patch, PatchError, PortRef};
use crate::modules::{steps_from_payload, ModuleKind, ModuleState, StepRole};
use crate::port::{ParamValue, Parameters};
use crate::render::RenderingEngine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slotmap::Key;
use std::collections::HashMap;
use thiserror::Error;

/// Document-level failures. Entry-level problems are skipped, not reported here.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("patch document must be a JSON object")]
    NotAnObject,
}

/// Serializable patch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchDocument {
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,

    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

/// Serializable module instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub module_type: String,

    #[serde(default)]
    pub x: f64,

    #[serde(default)]
    pub y: f64,

    /// Parameters and module-specific fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Serializable cable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub source_id: String,
    pub source_port: String,
    pub dest_id: String,
    pub dest_port: String,
}

impl PatchDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a document, skipping entries that do not decode.
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_str(json)?;
        let object = value.as_object().ok_or(DocumentError::NotAnObject)?;
        Ok(Self {
            modules: entries(object, "modules"),
            connections: entries(object, "connections"),
        })
    }
}

fn entries<T: serde::de::DeserializeOwned>(object: &Map<String, Value>, key: &str) -> Vec<T> {
    let items = match object.get(key) {
        None => return Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            log::warn!("`{}` is not an array; ignoring it", key);
            return Vec::new();
        }
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match serde_json::from_value(item.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("skipping malformed {} entry {}: {}", key, i, e);
                None
            }
        })
        .collect()
}

impl ModuleRecord {
    /// Pick out the parameters and payload a module of `kind` understands.
    /// Unknown fields are ignored.
    pub fn state(&self, kind: ModuleKind) -> ModuleState {
        let mut parameters = Parameters::new();
        for def in kind.params() {
            if let Some(value) = self.fields.get(def.name) {
                match serde_json::from_value::<ParamValue>(value.clone()) {
                    Ok(v) => {
                        parameters.insert(def.name.to_string(), v);
                    }
                    Err(_) => log::debug!("ignoring unreadable `{}` on {}", def.name, self.id),
                }
            }
        }
        let payload = (kind.step_role() == Some(StepRole::Sequencer))
            .then(|| self.fields.get("steps"))
            .flatten()
            .map(|steps| serde_json::json!({ "steps": steps }));
        ModuleState {
            kind,
            parameters,
            payload,
        }
    }
}

/// Outcome of [`Patch::restore`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    /// Document id to live module
    pub id_map: HashMap<String, ModuleId>,
    pub modules_created: usize,
    pub modules_skipped: usize,
    pub connections_made: usize,
    pub connections_skipped: usize,
}

/// Document id of a live module
pub fn document_id(id: ModuleId) -> String {
    id.data().as_ffi().to_string()
}

impl<R: RenderingEngine> Patch<R> {
    /// Snapshot every module and cable.
    pub fn capture(&self) -> PatchDocument {
        let modules = self
            .modules()
            .map(|(id, module)| {
                let state = module.capture_state();
                let mut fields = Map::new();
                for (name, value) in &state.parameters {
                    if let Ok(v) = serde_json::to_value(value) {
                        fields.insert(name.clone(), v);
                    }
                }
                if let Some(Value::Object(payload)) = state.payload {
                    fields.extend(payload);
                }
                let (x, y) = module.position();
                ModuleRecord {
                    id: document_id(id),
                    module_type: module.kind().type_name().to_string(),
                    x,
                    y,
                    fields,
                }
            })
            .collect();

        let connections = self
            .connections()
            .map(|(_, c)| ConnectionRecord {
                source_id: document_id(c.source.module),
                source_port: c.source.port.clone(),
                dest_id: document_id(c.dest.module),
                dest_port: c.dest.port.clone(),
            })
            .collect();

        PatchDocument {
            modules,
            connections,
        }
    }

    /// Apply a captured state to a live module. Parameters the state does
    /// not carry, or carries with unusable values, return to their defaults.
    pub fn apply_state(&mut self, id: ModuleId, state: &ModuleState) -> Result<(), PatchError> {
        let kind = self
            .module(id)
            .ok_or(PatchError::InvalidModule(id))?
            .kind();

        if kind.step_role() == Some(StepRole::Sequencer) {
            let steps = steps_from_payload(state.payload.as_ref());
            for (index, step) in steps.into_iter().enumerate() {
                self.set_step(id, index, step)?;
            }
        }

        // Declaration order; `running` comes last
        for def in kind.params() {
            let stored = match state.parameters.get(def.name) {
                Some(value) => self.set_parameter(id, def.name, value.clone()),
                None => self.set_parameter(id, def.name, def.default_value()),
            };
            if let Err(e) = stored {
                log::debug!("default `{}` for {:?}: {}", def.name, id, e);
                self.set_parameter(id, def.name, def.default_value())?;
            }
        }
        Ok(())
    }

    /// Replace the patch with a document's contents.
    ///
    /// Every cable and every non-permanent module goes first. Records for
    /// the keyboard and output update the existing singletons; all other
    /// records become new modules. Cables are then replayed through the
    /// id mapping. Failures are logged and counted, never fatal.
    pub fn restore(&mut self, document: &PatchDocument) -> RestoreReport {
        let mut report = RestoreReport::default();

        let cables: Vec<_> = self.connections().map(|(id, _)| id).collect();
        for id in cables {
            if let Err(e) = self.disconnect(id) {
                log::warn!("could not remove cable: {}", e);
            }
        }
        let doomed: Vec<_> = self
            .modules()
            .filter(|(_, m)| !m.is_permanent())
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            if let Err(e) = self.delete_module(id) {
                log::warn!("could not remove module: {}", e);
            }
        }

        let mut created = Vec::new();
        for record in &document.modules {
            let Some(kind) = ModuleKind::from_type_name(&record.module_type) else {
                log::warn!(
                    "skipping module {}: unknown type `{}`",
                    record.id,
                    record.module_type
                );
                report.modules_skipped += 1;
                continue;
            };

            let id = match kind {
                ModuleKind::Keyboard => self.keyboard(),
                ModuleKind::Output => self.output(),
                _ => match self.create(kind, (record.x, record.y)) {
                    Ok(id) => {
                        created.push(id);
                        id
                    }
                    Err(e) => {
                        log::warn!("skipping module {}: {}", record.id, e);
                        report.modules_skipped += 1;
                        continue;
                    }
                },
            };

            if let Err(e) = self.set_position(id, record.x, record.y) {
                log::warn!("module {}: {}", record.id, e);
            }
            if let Err(e) = self.apply_state(id, &record.state(kind)) {
                log::warn!("module {} state not applied: {}", record.id, e);
            }
            if report.id_map.insert(record.id.clone(), id).is_some() {
                log::warn!("duplicate module id {} in document", record.id);
            }
        }

        let still_pending = self.settle(self.config().readiness_polls);
        if still_pending > 0 {
            log::warn!("{} modules not ready after restore", still_pending);
        }

        // Modules whose construction failed are gone by now
        let before = report.id_map.len();
        report.id_map.retain(|_, id| self.module(*id).is_some());
        report.modules_skipped += before - report.id_map.len();
        report.modules_created = created
            .iter()
            .filter(|id| self.module(**id).is_some())
            .count();

        for record in &document.connections {
            let ends = report
                .id_map
                .get(&record.source_id)
                .zip(report.id_map.get(&record.dest_id));
            let Some((&source, &dest)) = ends else {
                log::debug!(
                    "skipping cable {} -> {}: unresolved module",
                    record.source_id,
                    record.dest_id
                );
                report.connections_skipped += 1;
                continue;
            };
            match self.connect(
                PortRef::new(source, record.source_port.as_str()),
                PortRef::new(dest, record.dest_port.as_str()),
            ) {
                Ok(_) => report.connections_made += 1,
                Err(e) => {
                    log::warn!(
                        "skipping cable {}.{} -> {}.{}: {}",
                        record.source_id,
                        record.source_port,
                        record.dest_id,
                        record.dest_port,
                        e
                    );
                    report.connections_skipped += 1;
                }
            }
        }

        log::info!(
            "restored {} modules, {} cables ({} modules and {} cables skipped)",
            report.modules_created,
            report.connections_made,
            report.modules_skipped,
            report.connections_skipped
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::render::MemoryRenderer;
    use crate::sequencer::{Step, StepState};

    fn patch() -> Patch<MemoryRenderer> {
        Patch::new(MemoryRenderer::new(48000.0), EngineConfig::default()).unwrap()
    }

    fn build(p: &mut Patch<MemoryRenderer>) -> (ModuleId, ModuleId) {
        let seq = p.create(ModuleKind::Sequencer, (10.0, 20.0)).unwrap();
        let osc = p.create(ModuleKind::Oscillator, (30.0, 40.0)).unwrap();
        p.settle(4);
        p.set_parameter(seq, "tempo", 96.0).unwrap();
        p.set_parameter(seq, "mode", "ping-pong").unwrap();
        p.set_step(seq, 2, Step::new(0.75, 0.3, StepState::Skip))
            .unwrap();
        p.set_parameter(osc, "waveform", "square").unwrap();
        p.set_parameter(p.output(), "volume", 0.5).unwrap();
        p.connect(PortRef::new(seq, "pitch"), PortRef::new(osc, "pitch"))
            .unwrap();
        p.connect(PortRef::new(osc, "out"), PortRef::new(p.output(), "in"))
            .unwrap();
        (seq, osc)
    }

    /// Module types, parameters and positions, in an id-independent form
    fn shape(doc: &PatchDocument) -> Vec<(String, f64, f64, Map<String, Value>)> {
        let mut modules: Vec<_> = doc
            .modules
            .iter()
            .map(|m| (m.module_type.clone(), m.x, m.y, m.fields.clone()))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        modules
    }

    fn cables(doc: &PatchDocument) -> Vec<(String, String, String, String)> {
        let type_of = |id: &str| {
            doc.modules
                .iter()
                .find(|m| m.id == id)
                .map(|m| m.module_type.clone())
                .unwrap_or_default()
        };
        let mut cables: Vec<_> = doc
            .connections
            .iter()
            .map(|c| {
                (
                    type_of(&c.source_id),
                    c.source_port.clone(),
                    type_of(&c.dest_id),
                    c.dest_port.clone(),
                )
            })
            .collect();
        cables.sort();
        cables
    }

    #[test]
    fn test_document_json_shape() {
        let mut p = patch();
        build(&mut p);
        let json: Value = serde_json::from_str(&p.capture().to_json().unwrap()).unwrap();
        let modules = json["modules"].as_array().unwrap();
        let seq = modules.iter().find(|m| m["type"] == "sequencer").unwrap();
        assert_eq!(seq["tempo"], 96.0);
        assert_eq!(seq["mode"], "ping-pong");
        assert_eq!(seq["steps"][2]["state"], "skip");
        assert_eq!(seq["steps"][2]["gateLength"], 0.3);
        assert!(json["connections"][0]["sourceId"].is_string());
    }

    #[test]
    fn test_round_trip_up_to_ids() {
        let mut p = patch();
        build(&mut p);
        let saved = p.capture();

        let mut q = patch();
        let report = q.restore(&PatchDocument::from_json(&saved.to_json().unwrap()).unwrap());
        assert_eq!(report.modules_created, 2);
        assert_eq!(report.connections_made, 2);
        assert_eq!(report.modules_skipped + report.connections_skipped, 0);

        let restored = q.capture();
        assert_eq!(shape(&restored), shape(&saved));
        assert_eq!(cables(&restored), cables(&saved));
    }

    #[test]
    fn test_restore_keeps_permanent_identity() {
        let mut p = patch();
        build(&mut p);
        let saved = p.capture();
        let keyboard = p.keyboard();
        let output = p.output();

        let report = p.restore(&saved);
        assert_eq!(p.keyboard(), keyboard);
        assert_eq!(p.output(), output);
        assert_eq!(report.id_map[&document_id(output)], output);
        assert_eq!(p.module_count(), 4);
        assert_eq!(p.connection_count(), 2);
        assert_eq!(
            p.module(output).unwrap().parameter("volume"),
            Some(&ParamValue::Number(0.5))
        );
        assert_eq!(p.renderer().routes().len(), 2);
    }

    #[test]
    fn test_partially_failing_document() {
        let json = r#"{
            "modules": [
                { "id": "a", "type": "oscillator", "x": 1, "y": 2 },
                { "id": "b", "type": "theremin" },
                { "id": "c", "type": "reverb" },
                { "type": "vca" },
                { "id": "d", "type": "vca", "gain": 0.25 }
            ],
            "connections": [
                { "sourceId": "a", "sourcePort": "out", "destId": "d", "destPort": "in" },
                { "sourceId": "b", "sourcePort": "out", "destId": "d", "destPort": "in" },
                { "sourceId": "c", "sourcePort": "out", "destId": "d", "destPort": "in" },
                { "sourceId": "a", "sourcePort": "nope", "destId": "d", "destPort": "in" },
                { "sourceId": "a" }
            ]
        }"#;
        let doc = PatchDocument::from_json(json).unwrap();
        assert_eq!(doc.modules.len(), 4);
        assert_eq!(doc.connections.len(), 4);

        let mut p = patch();
        p.renderer_mut().fail_kind(ModuleKind::Reverb);
        let report = p.restore(&doc);
        assert_eq!(report.modules_created, 2);
        assert_eq!(report.modules_skipped, 2);
        assert_eq!(report.connections_made, 1);
        assert_eq!(report.connections_skipped, 3);
        let vca = report.id_map["d"];
        assert_eq!(
            p.module(vca).unwrap().parameter("gain"),
            Some(&ParamValue::Number(0.25))
        );
    }

    #[test]
    fn test_unknown_fields_and_defaults() {
        let json = r#"{
            "modules": [
                { "id": "1", "type": "clock", "tempo": 90, "colour": "red", "division": "lots" }
            ]
        }"#;
        let mut p = patch();
        let report = p.restore(&PatchDocument::from_json(json).unwrap());
        let clock = p.module(report.id_map["1"]).unwrap();
        assert_eq!(clock.parameter("tempo"), Some(&ParamValue::Number(90.0)));
        assert_eq!(clock.parameter("division"), Some(&ParamValue::Number(4.0)));
        assert_eq!(clock.parameter("gateLength"), Some(&ParamValue::Number(0.5)));
        assert!(clock.parameter("colour").is_none());
        assert_eq!(clock.position(), (0.0, 0.0));
    }

    #[test]
    fn test_restore_replaces_previous_patch() {
        let mut p = patch();
        build(&mut p);
        p.restore(&PatchDocument::new());
        assert_eq!(p.module_count(), 2);
        assert_eq!(p.connection_count(), 0);
        assert!(p.renderer().routes().is_empty());
        assert_eq!(p.renderer().unit_count(), 2);
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            PatchDocument::from_json("[1, 2]"),
            Err(DocumentError::NotAnObject)
        ));
        assert!(matches!(
            PatchDocument::from_json("{"),
            Err(DocumentError::Json(_))
        ));
        let doc = PatchDocument::from_json(r#"{"modules": 3}"#).unwrap();
        assert!(doc.modules.is_empty());
    }

    #[test]
    fn test_restored_sequencer_plays() {
        let mut p = patch();
        let (seq, _) = build(&mut p);
        p.start(seq).unwrap();
        let saved = p.capture();

        let mut q = patch();
        let report = q.restore(&saved);
        let seq = report.id_map[&document_id(seq)];
        assert!(q.module(seq).unwrap().is_running());
        assert_eq!(
            q.module(seq).unwrap().sequence().unwrap()[2].state,
            StepState::Skip
        );
        q.renderer_mut().render_block(4800);
        assert!(!q.poll_events().is_empty());
    }
}
