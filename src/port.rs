//! Signal Conventions and Port System
//!
//! This module defines the signal kinds, port definitions and parameter
//! descriptions shared by the patch graph, the renderer adapter and the
//! persistence layer.
//!
//! Signal kinds are advisory. The renderer treats every signal as a numeric
//! stream, so any output may legally drive any input; the kind exists for
//! cable coloring and for the optional strict validation mode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic signal classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Audio-rate signal, nominally ±1
    Audio,

    /// Control voltage (pitch, modulation). Pitch follows 1V/octave with
    /// 0V = MIDI note 60.
    Cv,

    /// Gate or clock pulse, low = 0, high = 1
    Gate,
}

/// Direction of a port relative to its module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// How the renderer exposes an input port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputTarget {
    /// Signal sink that sums incoming streams
    #[default]
    Stream,

    /// Automation target of a scalar parameter (modulation adds to the knob value)
    Scalar,
}

/// Definition of a single port (input or output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDef {
    /// Human-readable name (e.g., "cutoff", "clock", "out")
    pub name: String,

    /// Signal type for cable coloring and strict validation
    pub kind: SignalKind,

    /// Renderer endpoint shape. Always `Stream` for outputs.
    pub target: InputTarget,
}

impl PortDef {
    pub fn new(name: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: InputTarget::Stream,
        }
    }

    /// Mark this input as a scalar automation target
    pub fn scalar(mut self) -> Self {
        self.target = InputTarget::Scalar;
        self
    }
}

/// Specification of all ports for a module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<PortDef>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_by_name(&self, name: &str) -> Option<&PortDef> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&PortDef> {
        self.outputs.iter().find(|p| p.name == name)
    }

    /// Index of an input within the spec, used as the renderer-side port number
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }
}

/// A parameter value as stored on a module and in patch documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
    Choice(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Choice(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Flag(b) => Some(*b),
            ParamValue::Number(v) => Some(*v > 0.5),
            ParamValue::Choice(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Choice(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Flag(b)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Choice(s.to_string())
    }
}

/// Named parameter values, ordered for stable documents
pub type Parameters = BTreeMap<String, ParamValue>;

/// Accepted values and default of a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamRange {
    Number { min: f64, max: f64, default: f64 },
    /// Whole numbers only; stored values are rounded
    Integer { min: f64, max: f64, default: f64 },
    Toggle { default: bool },
    Choice {
        options: &'static [&'static str],
        default: &'static str,
    },
}

/// Parameter definition for one module type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamDef {
    pub name: &'static str,
    pub range: ParamRange,
}

impl ParamDef {
    pub const fn number(name: &'static str, min: f64, max: f64, default: f64) -> Self {
        Self {
            name,
            range: ParamRange::Number { min, max, default },
        }
    }

    pub const fn integer(name: &'static str, min: f64, max: f64, default: f64) -> Self {
        Self {
            name,
            range: ParamRange::Integer { min, max, default },
        }
    }

    pub const fn toggle(name: &'static str, default: bool) -> Self {
        Self {
            name,
            range: ParamRange::Toggle { default },
        }
    }

    pub const fn choice(
        name: &'static str,
        options: &'static [&'static str],
        default: &'static str,
    ) -> Self {
        Self {
            name,
            range: ParamRange::Choice { options, default },
        }
    }

    pub fn default_value(&self) -> ParamValue {
        match self.range {
            ParamRange::Number { default, .. } | ParamRange::Integer { default, .. } => {
                ParamValue::Number(default)
            }
            ParamRange::Toggle { default } => ParamValue::Flag(default),
            ParamRange::Choice { default, .. } => ParamValue::Choice(default.to_string()),
        }
    }

    /// Coerce a value into this parameter's range.
    ///
    /// Numbers are clamped (integers rounded first), toggles accept numbers
    /// (> 0.5 is on), choices must name one of the options. Returns `None`
    /// when the value cannot be used.
    pub fn coerce(&self, value: &ParamValue) -> Option<ParamValue> {
        match self.range {
            ParamRange::Number { min, max, .. } => {
                let v = value.as_f64()?;
                v.is_finite().then(|| ParamValue::Number(v.clamp(min, max)))
            }
            ParamRange::Integer { min, max, .. } => {
                let v = value.as_f64()?;
                v.is_finite()
                    .then(|| ParamValue::Number(libm::round(v).clamp(min, max)))
            }
            ParamRange::Toggle { .. } => value.as_bool().map(ParamValue::Flag),
            ParamRange::Choice { options, .. } => {
                let s = value.as_str()?;
                options
                    .contains(&s)
                    .then(|| ParamValue::Choice(s.to_string()))
            }
        }
    }

    /// Numeric form handed to the renderer. Choices become their option index.
    pub fn render_value(&self, value: &ParamValue) -> Option<f64> {
        match self.range {
            ParamRange::Choice { options, .. } => {
                let s = value.as_str()?;
                options.iter().position(|o| *o == s).map(|i| i as f64)
            }
            _ => value.as_f64(),
        }
    }
}
