//! Process chains: the scheduling primitive handed to the external agent layer.

use serde::{Deserialize, Serialize};

use super::service::ArgumentKind;

/// Variable binding carried by an argument: the workflow variable id and the
/// value materialized for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgumentVariable {
    pub id: String,
    pub value: String,
}

/// One concrete command-line argument of an executable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Id of the service parameter this argument was materialized for.
    pub id: String,
    pub label: String,
    pub variable: ArgumentVariable,
    #[serde(rename = "type")]
    pub kind: ArgumentKind,
    pub data_type: String,
}

/// One concrete invocation inside a process chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Executable {
    pub service_name: String,
    pub path: String,
    pub arguments: Vec<Argument>,
    pub runtime: String,
    #[serde(default)]
    pub runtime_args: Vec<Argument>,
    pub service_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime: Option<u64>,
}

/// Linear sequence of executables dispatched as one unit.
///
/// Immutable once generated. `required_capabilities` is the union over the
/// member services, kept sorted so equal chains serialize identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessChain {
    pub id: String,
    pub executables: Vec<Executable>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}
