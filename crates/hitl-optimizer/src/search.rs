//! Search space definitions.

use hitl_types::{validation_error, HitlResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "r").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

impl ParameterKind {
    /// Bounds of the continuous domain samplers work in.
    ///
    /// Log-uniform ranges map to `[ln low, ln high]`; integer ranges are
    /// widened by half a step on each side so every integer gets an equal
    /// share of the interval.
    pub fn internal_bounds(&self) -> (f64, f64) {
        match *self {
            Self::FloatRange { low, high } => (low, high),
            Self::IntRange { low, high } => (low as f64 - 0.5, high as f64 + 0.5),
            Self::LogUniform { low, high } => (low.ln(), high.ln()),
        }
    }

    /// Map a concrete value into the internal domain.
    pub fn to_internal(&self, value: &ParameterValue) -> f64 {
        match self {
            Self::LogUniform { .. } => value.as_f64().ln(),
            _ => value.as_f64(),
        }
    }

    /// Map an internal-domain point back to a concrete in-bounds value.
    pub fn from_internal(&self, x: f64) -> ParameterValue {
        match *self {
            Self::FloatRange { low, high } => ParameterValue::Float(x.clamp(low, high)),
            Self::IntRange { low, high } => ParameterValue::Int((x.round() as i64).clamp(low, high)),
            Self::LogUniform { low, high } => ParameterValue::Float(x.exp().clamp(low, high)),
        }
    }

    /// Whether `value` lies inside this range.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match (*self, value) {
            (Self::IntRange { low, high }, ParameterValue::Int(v)) => *v >= low && *v <= high,
            (Self::IntRange { .. }, ParameterValue::Float(_)) => false,
            (Self::FloatRange { low, high }, v) | (Self::LogUniform { low, high }, v) => {
                let v = v.as_f64();
                v >= low && v <= high
            }
        }
    }
}

/// A concrete parameter value produced by a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
}

impl ParameterValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
        }
    }
}

/// One sampled parameter vector, keyed by parameter name.
pub type Params = BTreeMap<String, ParameterValue>;

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    /// The (r, g, b) unit cube explored by the color study.
    pub fn rgb() -> Self {
        Self::new()
            .add_float("r", 0.0, 1.0)
            .add_float("g", 0.0, 1.0)
            .add_float("b", 0.0, 1.0)
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    /// Reject empty or duplicate names and malformed ranges.
    pub fn validate(&self) -> HitlResult<()> {
        if self.parameters.is_empty() {
            return Err(validation_error!("search space has no parameters"));
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.name.is_empty() {
                return Err(validation_error!("parameter name must not be empty"));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(validation_error!("duplicate parameter name: {}", param.name));
            }
            let valid = match param.kind {
                ParameterKind::FloatRange { low, high } => {
                    low.is_finite() && high.is_finite() && low <= high
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    low > 0.0 && high.is_finite() && low <= high
                }
            };
            if !valid {
                return Err(validation_error!(
                    "invalid range for parameter {}: {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_space_is_valid() {
        let space = SearchSpace::rgb();
        assert_eq!(space.parameters.len(), 3);
        space.validate().unwrap();
        assert!(space.get("g").is_some());
        assert!(space.get("alpha").is_none());
    }

    #[test]
    fn search_space_builder_chain() {
        let space = SearchSpace::new()
            .add_int("a", 1, 10)
            .add_float("b", 0.0, 1.0)
            .add_log_uniform("c", 0.001, 100.0);
        assert_eq!(space.parameters.len(), 3);
        space.validate().unwrap();
    }

    #[test]
    fn duplicate_names_rejected() {
        let space = SearchSpace::new().add_float("r", 0.0, 1.0).add_float("r", 0.0, 1.0);
        assert!(space.validate().is_err());
    }

    #[test]
    fn inverted_and_non_positive_log_ranges_rejected() {
        assert!(SearchSpace::new().add_float("x", 1.0, 0.0).validate().is_err());
        assert!(SearchSpace::new().add_log_uniform("lr", 0.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn internal_domain_round_trips_within_bounds() {
        let log = ParameterKind::LogUniform { low: 1e-3, high: 1.0 };
        let (lo, hi) = log.internal_bounds();
        assert!((lo - 1e-3f64.ln()).abs() < 1e-12);
        assert_eq!(hi, 0.0);
        let v = log.from_internal(lo - 5.0);
        assert!(log.contains(&v));

        let int = ParameterKind::IntRange { low: 1, high: 3 };
        assert_eq!(int.from_internal(3.49), ParameterValue::Int(3));
        assert_eq!(int.from_internal(10.0), ParameterValue::Int(3));
        assert!(!int.contains(&ParameterValue::Float(2.0)));
    }

    #[test]
    fn parameter_value_untagged_json() {
        let params: Params = serde_json::from_str(r#"{"r":0.25,"n":3}"#).unwrap();
        assert_eq!(params["r"], ParameterValue::Float(0.25));
        assert_eq!(params["n"], ParameterValue::Int(3));
    }
}
