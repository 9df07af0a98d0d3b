//! Parameter values and configurations as seen by the scheduler.
//!
//! The scheduler treats a configuration as an opaque bag of named values:
//! it is produced by an optimizer, carried by a [`Job`](crate::job::Job),
//! and handed to the user evaluation function without inspection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A concrete parameter value produced by an optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Float(f64),
    Int(i64),
    Json(serde_json::Value),
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl ParameterValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }
}

/// A full candidate configuration: parameter name -> sampled value.
pub type Configuration = HashMap<String, ParameterValue>;

/// Configurations are shared, never mutated, so they travel behind an `Arc`:
/// the job table, the observation history, and the optimizer all hold the
/// same allocation.
pub type SharedConfiguration = Arc<Configuration>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_value_display() {
        assert_eq!(ParameterValue::Float(0.5).to_string(), "0.5");
        assert_eq!(ParameterValue::Int(7).to_string(), "7");
        assert_eq!(
            ParameterValue::Json(serde_json::json!("adam")).to_string(),
            "\"adam\""
        );
    }

    #[test]
    fn parameter_value_as_f64() {
        assert_eq!(ParameterValue::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(ParameterValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(
            ParameterValue::Json(serde_json::json!("adam")).as_f64(),
            None
        );
    }

    #[test]
    fn configuration_serializes_flat() {
        let mut config = Configuration::new();
        config.insert("lr".into(), ParameterValue::Float(0.01));
        config.insert("layers".into(), ParameterValue::Int(3));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lr"], serde_json::json!(0.01));
        assert_eq!(json["layers"], serde_json::json!(3));
    }
}
