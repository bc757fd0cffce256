//! Workflow definitions: variables, actions, and the parameters that bind them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Named data carrier inside a workflow.
///
/// A variable either holds a literal value declared in the workflow or is
/// bound later, when a process chain result for its id arrives. Two instances
/// with the same `id` refer to the same logical variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Variable {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
        }
    }

    pub fn with_value(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
        }
    }
}

/// Input slot of an execute action, matched to a service parameter by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub id: String,
    pub variable: Variable,
}

/// Output slot of an execute action.
///
/// `store` selects the persistent output directory over the temporary one;
/// `prefix` is prepended to the generated file name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputParameter {
    pub id: String,
    pub variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub store: bool,
}

/// Leaf action calling a registered service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteAction {
    /// Per-copy identity. Unrolling produces many actions with equal content;
    /// the pending set tells them apart by this id, not by value equality.
    #[serde(default = "Uuid::new_v4")]
    pub action_uuid: Uuid,
    pub service_id: String,
    #[serde(default)]
    pub inputs: Vec<InputParameter>,
    #[serde(default)]
    pub outputs: Vec<OutputParameter>,
}

impl ExecuteAction {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            action_uuid: Uuid::new_v4(),
            service_id: service_id.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, id: impl Into<String>, variable: Variable) -> Self {
        self.inputs.push(InputParameter {
            id: id.into(),
            variable,
        });
        self
    }

    pub fn with_output(mut self, id: impl Into<String>, variable: Variable) -> Self {
        self.outputs.push(OutputParameter {
            id: id.into(),
            variable,
            prefix: None,
            store: false,
        });
        self
    }
}

/// Iteration construct binding `enumerator` to each element of `input`.
///
/// `yield_to_output` appends a body variable's value to the collected
/// `output` on every iteration; `yield_to_input` appends back to `input`,
/// which turns the for-each into a data-driven fixed point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForEachAction {
    #[serde(default = "Uuid::new_v4")]
    pub action_uuid: Uuid,
    pub input: Variable,
    pub enumerator: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_to_output: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yield_to_input: Option<Variable>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Node of the workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Execute(ExecuteAction),
    ForEach(ForEachAction),
}

impl Action {
    pub fn action_uuid(&self) -> Uuid {
        match self {
            Action::Execute(action) => action.action_uuid,
            Action::ForEach(action) => action.action_uuid,
        }
    }

    pub fn as_execute(&self) -> Option<&ExecuteAction> {
        if let Action::Execute(action) = self {
            Some(action)
        } else {
            None
        }
    }

    pub fn as_for_each(&self) -> Option<&ForEachAction> {
        if let Action::ForEach(action) = self {
            Some(action)
        } else {
            None
        }
    }
}

impl From<ExecuteAction> for Action {
    fn from(action: ExecuteAction) -> Self {
        Action::Execute(action)
    }
}

impl From<ForEachAction> for Action {
    fn from(action: ForEachAction) -> Self {
        Action::ForEach(action)
    }
}

/// Declarative input to the compiler. Immutable after construction; the
/// compiler works on its own copy of the variables and actions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub vars: Vec<Variable>,
    #[serde(default)]
    pub actions: Vec<Action>,
}
