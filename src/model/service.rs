//! Service metadata: the signatures the compiler materializes arguments against.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::process_chain::Argument;

/// Data-type tag marking an input whose file collection collapses to the
/// files' common parent directory during materialization.
pub const DATA_TYPE_DIRECTORY: &str = "directory";

/// Direction of a service parameter or a materialized argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentKind {
    Input,
    Output,
}

impl std::fmt::Display for ArgumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Inclusive bounds on how many arguments a parameter accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cardinality {
    pub min: u32,
    pub max: u32,
}

impl Cardinality {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Exactly one argument.
    pub fn required() -> Self {
        Self { min: 1, max: 1 }
    }

    /// At least `min`, no upper bound.
    pub fn at_least(min: u32) -> Self {
        Self { min, max: u32::MAX }
    }

    pub fn contains(&self, count: u32) -> bool {
        count >= self.min && count <= self.max
    }
}

impl Default for Cardinality {
    fn default() -> Self {
        Self::required()
    }
}

/// One slot of a service signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceParameter {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ArgumentKind,
    pub data_type: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_suffix: Option<String>,
}

impl ServiceParameter {
    pub fn new(id: impl Into<String>, kind: ArgumentKind, data_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            data_type: data_type.into(),
            cardinality: Cardinality::required(),
            default: None,
            file_suffix: None,
        }
    }
}

/// Description of an executable service as provided by the metadata registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub id: String,
    pub name: String,
    pub path: String,
    pub runtime: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ServiceParameter>,
    /// Arguments passed to the runtime itself (e.g. container flags), copied
    /// verbatim onto every executable built from this service.
    #[serde(default)]
    pub runtime_args: Vec<Argument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Maximum runtime in seconds before the agent aborts the invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime: Option<u64>,
}
