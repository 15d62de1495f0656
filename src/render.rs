//! Rendering engine adapter
//!
//! The patch graph never processes audio itself. It drives a
//! [`RenderingEngine`] that creates signal-processing units, exposes their
//! ports as endpoints and performs the actual routing. [`MemoryRenderer`] is a
//! complete in-process implementation used for headless sessions and tests.

use crate::bridge::{BlockInputs, BlockOutputs, StepRunner};
use crate::config::EngineConfig;
use crate::modules::ModuleKind;
use crate::port::{InputTarget, Parameters, PortSpec};
use std::collections::{HashMap, VecDeque};
use std::task::Poll;
use thiserror::Error;

/// Renderer-side identity of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// Output endpoint of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Source {
    pub unit: UnitId,
    pub output: usize,
}

/// Input endpoint of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sink {
    /// Summing signal input
    Stream { unit: UnitId, input: usize },

    /// Scalar automation target
    Scalar { unit: UnitId, param: usize },
}

impl Sink {
    pub fn unit(&self) -> UnitId {
        match self {
            Sink::Stream { unit, .. } | Sink::Scalar { unit, .. } => *unit,
        }
    }
}

/// Channel selection for a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelMap {
    pub output: u32,
    pub input: u32,
}

/// Errors reported by a rendering engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    #[error("unknown unit {0:?}")]
    UnknownUnit(UnitId),

    #[error("unit {0:?} is still under construction")]
    NotReady(UnitId),

    #[error("unit construction failed: {0}")]
    ConstructionFailed(String),

    #[error("route rejected: {0}")]
    Rejected(String),
}

/// The real-time renderer as seen from the patch graph.
///
/// Structural calls happen on the interactive side only. Implementations use
/// their own thread-safe primitives to hand routing changes to the audio
/// callback.
pub trait RenderingEngine {
    /// Begin constructing a unit. Construction may finish later; see [`poll_ready`].
    ///
    /// [`poll_ready`]: RenderingEngine::poll_ready
    fn create_unit(&mut self, kind: ModuleKind, params: &Parameters)
        -> Result<UnitId, RenderError>;

    /// Check construction progress without blocking.
    fn poll_ready(&mut self, unit: UnitId) -> Poll<Result<(), RenderError>>;

    /// Input endpoint by port name; `None` while the unit is not ready.
    fn input_port(&self, unit: UnitId, name: &str) -> Option<Sink>;

    /// Output endpoint by port name; `None` while the unit is not ready.
    fn output_port(&self, unit: UnitId, name: &str) -> Option<Source>;

    fn connect(&mut self, source: Source, sink: Sink, channels: ChannelMap)
        -> Result<(), RenderError>;

    /// Remove one route. Idempotent: returns false when no such route existed.
    fn disconnect(&mut self, source: Source, sink: Sink, channels: ChannelMap) -> bool;

    /// Update a scalar parameter of a unit
    fn set_parameter(&mut self, _unit: UnitId, _name: &str, _value: f64) {}

    /// Hand a step runner to the unit's real-time callback
    fn install_processor(&mut self, unit: UnitId, runner: StepRunner) -> Result<(), RenderError>;

    /// Release all resources of a unit
    fn release_unit(&mut self, unit: UnitId);

    /// Monotonic render time in seconds
    fn now(&self) -> f64;
}

/// An established route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub source: Source,
    pub sink: Sink,
    pub channels: ChannelMap,
}

struct MemoryUnit {
    kind: ModuleKind,
    spec: PortSpec,
    polls_until_ready: u32,
    failure: Option<String>,
    params: HashMap<String, f64>,
    constants: HashMap<usize, f32>,
    processor: Option<StepRunner>,
    gate: Vec<f32>,
    pitch: Vec<f32>,
}

impl MemoryUnit {
    fn is_ready(&self) -> bool {
        self.polls_until_ready == 0 && self.failure.is_none()
    }
}

/// In-process renderer keeping a routing multiset.
///
/// Units can be made to report readiness only after a number of polls, and
/// connects can be made to fail, to exercise the graph's error paths.
/// [`render_block`](MemoryRenderer::render_block) runs the installed step
/// runners, feeding each one the summed signals routed into it.
pub struct MemoryRenderer {
    units: HashMap<UnitId, MemoryUnit>,
    routes: Vec<Route>,
    next_unit: u64,
    sample_rate: f64,
    block_size: usize,
    frames_rendered: u64,
    ready_after_polls: u32,
    reject_connects: u32,
    failing_kinds: Vec<ModuleKind>,
}

impl MemoryRenderer {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            units: HashMap::new(),
            routes: Vec::new(),
            next_unit: 1,
            sample_rate,
            block_size: 128,
            frames_rendered: 0,
            ready_after_polls: 0,
            reject_connects: 0,
            failing_kinds: Vec::new(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut renderer = Self::new(config.sample_rate);
        renderer.block_size = config.block_size.max(1);
        renderer
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Render one block of the configured size
    pub fn render(&mut self) {
        self.render_block(self.block_size);
    }

    /// New units report ready only after `polls` calls to `poll_ready`
    pub fn with_ready_after(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls;
        self
    }

    pub fn set_ready_after(&mut self, polls: u32) {
        self.ready_after_polls = polls;
    }

    /// Reject the next `count` connect calls
    pub fn reject_next_connects(&mut self, count: u32) {
        self.reject_connects = count;
    }

    /// Make construction of every unit of `kind` fail
    pub fn fail_kind(&mut self, kind: ModuleKind) {
        self.failing_kinds.push(kind);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn has_unit(&self, unit: UnitId) -> bool {
        self.units.contains_key(&unit)
    }

    pub fn unit_kind(&self, unit: UnitId) -> Option<ModuleKind> {
        self.units.get(&unit).map(|u| u.kind)
    }

    pub fn parameter(&self, unit: UnitId, name: &str) -> Option<f64> {
        self.units.get(&unit)?.params.get(name).copied()
    }

    pub fn processor(&self, unit: UnitId) -> Option<&StepRunner> {
        self.units.get(&unit)?.processor.as_ref()
    }

    /// Drop a route behind the graph's back, as a renderer may when it
    /// tears down a voice on its own.
    pub fn drop_route(&mut self, source: Source, sink: Sink) -> bool {
        match self
            .routes
            .iter()
            .position(|r| r.source == source && r.sink == sink)
        {
            Some(i) => {
                self.routes.remove(i);
                true
            }
            None => false,
        }
    }

    /// Hold an output of a plain unit at a constant level (keyboard, LFO stand-ins)
    pub fn set_output_level(&mut self, unit: UnitId, output: &str, level: f32) {
        if let Some(u) = self.units.get_mut(&unit) {
            if let Some(index) = u.spec.output_index(output) {
                u.constants.insert(index, level);
            }
        }
    }

    /// Last rendered block of a unit's output
    pub fn output_buffer(&self, unit: UnitId, output: &str) -> Option<&[f32]> {
        let u = self.units.get(&unit)?;
        match output {
            "gate" if u.processor.is_some() => Some(&u.gate),
            "pitch" if u.processor.is_some() => Some(&u.pitch),
            _ => None,
        }
    }

    /// Render `frames` frames: run every installed step runner and advance time.
    ///
    /// Runners are processed so that a runner feeding another one's clock is
    /// rendered first; runners in a feedback loop read silence for inputs
    /// from units not yet rendered in this block.
    pub fn render_block(&mut self, frames: usize) {
        let start = self.now();
        let order = self.processing_order();
        let mut rendered: Vec<UnitId> = Vec::with_capacity(order.len());

        for unit in order {
            let clock = self.gather(unit, "clock", frames, &rendered);
            let pitch = self.gather(unit, "pitch", frames, &rendered);
            let gate = self.gather(unit, "gate", frames, &rendered);

            let sample_rate = self.sample_rate;
            if let Some(u) = self.units.get_mut(&unit) {
                u.gate.resize(frames, 0.0);
                u.pitch.resize(frames, 0.0);
                let MemoryUnit {
                    processor,
                    gate: gate_out,
                    pitch: pitch_out,
                    ..
                } = u;
                if let Some(runner) = processor.as_mut() {
                    runner.process(
                        start,
                        sample_rate,
                        frames,
                        BlockInputs {
                            clock: clock.as_deref(),
                            pitch: pitch.as_deref(),
                            gate: gate.as_deref(),
                        },
                        Some(BlockOutputs {
                            gate: gate_out,
                            pitch: pitch_out,
                        }),
                    );
                }
            }
            rendered.push(unit);
        }

        self.frames_rendered += frames as u64;
    }

    /// Sum of every signal routed into a stream input, `None` when unpatched
    fn gather(
        &self,
        unit: UnitId,
        input: &str,
        frames: usize,
        rendered: &[UnitId],
    ) -> Option<Vec<f32>> {
        let index = self.units.get(&unit)?.spec.input_index(input)?;
        let sink = Sink::Stream { unit, input: index };
        let mut sum: Option<Vec<f32>> = None;

        for route in self.routes.iter().filter(|r| r.sink == sink) {
            let buffer = sum.get_or_insert_with(|| vec![0.0; frames]);
            let Some(src) = self.units.get(&route.source.unit) else {
                continue;
            };
            if let Some(&level) = src.constants.get(&route.source.output) {
                buffer.iter_mut().for_each(|s| *s += level);
                continue;
            }
            if src.processor.is_none() || !rendered.contains(&route.source.unit) {
                continue;
            }
            let signal = match src.spec.outputs.get(route.source.output).map(|p| p.name.as_str()) {
                Some("gate") => &src.gate,
                Some("pitch") => &src.pitch,
                _ => continue,
            };
            for (s, v) in buffer.iter_mut().zip(signal) {
                *s += *v;
            }
        }
        sum
    }

    /// Units hosting a runner, upstream first (Kahn's algorithm)
    fn processing_order(&self) -> Vec<UnitId> {
        let mut hosts: Vec<UnitId> = self
            .units
            .iter()
            .filter(|(_, u)| u.processor.is_some())
            .map(|(&id, _)| id)
            .collect();
        hosts.sort();

        let mut in_degree: HashMap<UnitId, usize> = hosts.iter().map(|&id| (id, 0)).collect();
        let mut successors: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        for route in &self.routes {
            let (from, to) = (route.source.unit, route.sink.unit());
            if from != to && in_degree.contains_key(&from) && in_degree.contains_key(&to) {
                *in_degree.entry(to).or_insert(0) += 1;
                successors.entry(from).or_default().push(to);
            }
        }

        let mut queue: VecDeque<UnitId> = hosts
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(hosts.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for succ in successors.get(&id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*succ);
                    }
                }
            }
        }
        // Units in a cycle still run, in id order
        for id in hosts {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    fn ready_unit(&self, unit: UnitId) -> Option<&MemoryUnit> {
        self.units.get(&unit).filter(|u| u.is_ready())
    }
}

impl RenderingEngine for MemoryRenderer {
    fn create_unit(
        &mut self,
        kind: ModuleKind,
        params: &Parameters,
    ) -> Result<UnitId, RenderError> {
        let id = UnitId(self.next_unit);
        self.next_unit += 1;

        let failure = self
            .failing_kinds
            .contains(&kind)
            .then(|| format!("{} unit unavailable", kind.type_name()));
        let params = params
            .iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
            .collect();

        self.units.insert(
            id,
            MemoryUnit {
                kind,
                spec: kind.port_spec(),
                polls_until_ready: self.ready_after_polls,
                failure,
                params,
                constants: HashMap::new(),
                processor: None,
                gate: Vec::new(),
                pitch: Vec::new(),
            },
        );
        Ok(id)
    }

    fn poll_ready(&mut self, unit: UnitId) -> Poll<Result<(), RenderError>> {
        let Some(u) = self.units.get_mut(&unit) else {
            return Poll::Ready(Err(RenderError::UnknownUnit(unit)));
        };
        if u.polls_until_ready > 0 {
            u.polls_until_ready -= 1;
            return Poll::Pending;
        }
        match &u.failure {
            Some(reason) => Poll::Ready(Err(RenderError::ConstructionFailed(reason.clone()))),
            None => Poll::Ready(Ok(())),
        }
    }

    fn input_port(&self, unit: UnitId, name: &str) -> Option<Sink> {
        let u = self.ready_unit(unit)?;
        let index = u.spec.input_index(name)?;
        Some(match u.spec.inputs[index].target {
            InputTarget::Stream => Sink::Stream { unit, input: index },
            InputTarget::Scalar => Sink::Scalar { unit, param: index },
        })
    }

    fn output_port(&self, unit: UnitId, name: &str) -> Option<Source> {
        let u = self.ready_unit(unit)?;
        let output = u.spec.output_index(name)?;
        Some(Source { unit, output })
    }

    fn connect(
        &mut self,
        source: Source,
        sink: Sink,
        channels: ChannelMap,
    ) -> Result<(), RenderError> {
        if self.reject_connects > 0 {
            self.reject_connects -= 1;
            return Err(RenderError::Rejected("renderer refused route".to_string()));
        }
        for unit in [source.unit, sink.unit()] {
            match self.units.get(&unit) {
                None => return Err(RenderError::UnknownUnit(unit)),
                Some(u) if !u.is_ready() => return Err(RenderError::NotReady(unit)),
                Some(_) => {}
            }
        }
        self.routes.push(Route {
            source,
            sink,
            channels,
        });
        Ok(())
    }

    fn disconnect(&mut self, source: Source, sink: Sink, channels: ChannelMap) -> bool {
        match self
            .routes
            .iter()
            .position(|r| r.source == source && r.sink == sink && r.channels == channels)
        {
            Some(i) => {
                self.routes.remove(i);
                true
            }
            None => false,
        }
    }

    fn set_parameter(&mut self, unit: UnitId, name: &str, value: f64) {
        if let Some(u) = self.units.get_mut(&unit) {
            u.params.insert(name.to_string(), value);
        }
    }

    fn install_processor(&mut self, unit: UnitId, runner: StepRunner) -> Result<(), RenderError> {
        let u = self
            .units
            .get_mut(&unit)
            .ok_or(RenderError::UnknownUnit(unit))?;
        u.processor = Some(runner);
        Ok(())
    }

    fn release_unit(&mut self, unit: UnitId) {
        self.units.remove(&unit);
        self.routes
            .retain(|r| r.source.unit != unit && r.sink.unit() != unit);
    }

    fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_unit(r: &mut MemoryRenderer, kind: ModuleKind) -> UnitId {
        let unit = r.create_unit(kind, &Parameters::new()).unwrap();
        assert!(r.poll_ready(unit).is_ready());
        unit
    }

    #[test]
    fn test_endpoints_absent_until_ready() {
        let mut r = MemoryRenderer::new(48000.0).with_ready_after(2);
        let unit = r.create_unit(ModuleKind::Filter, &Parameters::new()).unwrap();
        assert!(r.input_port(unit, "in").is_none());
        assert!(r.poll_ready(unit).is_pending());
        assert!(r.poll_ready(unit).is_pending());
        assert_eq!(r.poll_ready(unit), Poll::Ready(Ok(())));
        assert!(matches!(r.input_port(unit, "in"), Some(Sink::Stream { .. })));
        assert!(matches!(
            r.input_port(unit, "cutoff"),
            Some(Sink::Scalar { .. })
        ));
    }

    #[test]
    fn test_failed_construction() {
        let mut r = MemoryRenderer::new(48000.0);
        r.fail_kind(ModuleKind::Reverb);
        let unit = r.create_unit(ModuleKind::Reverb, &Parameters::new()).unwrap();
        assert!(matches!(
            r.poll_ready(unit),
            Poll::Ready(Err(RenderError::ConstructionFailed(_)))
        ));
        assert!(r.output_port(unit, "out").is_none());
    }

    #[test]
    fn test_routes_are_a_multiset() {
        let mut r = MemoryRenderer::new(48000.0);
        let osc = ready_unit(&mut r, ModuleKind::Oscillator);
        let vca = ready_unit(&mut r, ModuleKind::Vca);
        let src = r.output_port(osc, "out").unwrap();
        let sink = r.input_port(vca, "in").unwrap();

        r.connect(src, sink, ChannelMap::default()).unwrap();
        r.connect(src, sink, ChannelMap::default()).unwrap();
        assert_eq!(r.routes().len(), 2);
        assert!(r.disconnect(src, sink, ChannelMap::default()));
        assert_eq!(r.routes().len(), 1);
        assert!(r.disconnect(src, sink, ChannelMap::default()));
        assert!(!r.disconnect(src, sink, ChannelMap::default()));
    }

    #[test]
    fn test_rejected_connect_leaves_no_route() {
        let mut r = MemoryRenderer::new(48000.0);
        let osc = ready_unit(&mut r, ModuleKind::Oscillator);
        let vca = ready_unit(&mut r, ModuleKind::Vca);
        let src = r.output_port(osc, "out").unwrap();
        let sink = r.input_port(vca, "in").unwrap();
        r.reject_next_connects(1);
        assert!(r.connect(src, sink, ChannelMap::default()).is_err());
        assert!(r.routes().is_empty());
        assert!(r.connect(src, sink, ChannelMap::default()).is_ok());
    }

    #[test]
    fn test_release_removes_routes() {
        let mut r = MemoryRenderer::new(48000.0);
        let osc = ready_unit(&mut r, ModuleKind::Oscillator);
        let vca = ready_unit(&mut r, ModuleKind::Vca);
        let src = r.output_port(osc, "out").unwrap();
        let sink = r.input_port(vca, "in").unwrap();
        r.connect(src, sink, ChannelMap::default()).unwrap();
        r.release_unit(osc);
        assert!(!r.has_unit(osc));
        assert!(r.routes().is_empty());
    }

    #[test]
    fn test_now_follows_rendered_frames() {
        let mut r = MemoryRenderer::new(48000.0);
        assert_eq!(r.now(), 0.0);
        r.render_block(480);
        assert_eq!(r.now(), 0.01);
    }

    #[test]
    fn test_configured_block_size() {
        let config = EngineConfig::default().with_sample_rate(1000.0);
        let mut r = MemoryRenderer::from_config(&config);
        assert_eq!(r.block_size(), 128);
        r.render();
        assert_eq!(r.now(), 0.128);
    }
}
