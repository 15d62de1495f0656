//! Engine configuration
//!
//! All fields have defaults, so a configuration document only needs to name
//! what it changes.

use serde::{Deserialize, Serialize};

/// Session-wide settings for a [`Patch`](crate::graph::Patch) and its step runners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Renderer sample rate in Hz
    pub sample_rate: f64,

    /// Frames per render block
    pub block_size: usize,

    /// Capacity of each interactive → real-time control ring
    pub control_queue_capacity: usize,

    /// Capacity of each real-time → interactive event ring
    pub event_queue_capacity: usize,

    /// How many readiness polls a restore makes before giving up on
    /// still-constructing units
    pub readiness_polls: usize,

    /// Reject cables whose source and destination signal kinds differ
    pub strict_port_kinds: bool,

    /// Seed for random step modes
    pub rng_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 128,
            control_queue_capacity: 64,
            event_queue_capacity: 256,
            readiness_polls: 64,
            strict_port_kinds: false,
            rng_seed: 0x5eed,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_strict_port_kinds(mut self, strict: bool) -> Self {
        self.strict_port_kinds = strict;
        self
    }

    pub fn with_queue_capacities(mut self, control: usize, events: usize) -> Self {
        self.control_queue_capacity = control;
        self.event_queue_capacity = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"sampleRate": 44100, "strictPortKinds": true}"#)
            .unwrap();
        assert_eq!(config.sample_rate, 44100.0);
        assert!(config.strict_port_kinds);
        assert_eq!(config.block_size, 128);
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::default().with_queue_capacities(4, 8);
        let loaded = EngineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(loaded, config);
    }
}
