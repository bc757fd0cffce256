//! Incremental lowering of workflows into executable process chains.
//!
//! One [`Compiler`] exists per submission. Every [`Compiler::generate`] call
//! runs the same fixed pipeline over the pending actions: ingest delivered
//! results, collect completed for-each yields to a fixpoint, unroll ready
//! for-each actions, then fuse ready execute actions into linear process
//! chains and retire them. The mutable state in between is serializable so
//! the controller can checkpoint it after every round.

mod fuse;
mod unroll;
mod values;

use std::collections::HashMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backends::OutputAdapterOracle;
use crate::id::IdGenerator;
use crate::model::{Action, ProcessChain, ServiceMetadata, Variable, Workflow};

use self::values::yield_to;

/// Raised when a workflow cannot be lowered.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// Structurally broken workflow, e.g. a yield referencing a variable no
    /// body action produces.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error(
        "no value for input parameter `{parameter}` (variable `{variable}`) of service `{service}`"
    )]
    MissingInput {
        parameter: String,
        variable: String,
        service: String,
    },

    #[error(
        "parameter `{parameter}` of service `{service}` got {actual} argument(s), expected {min} to {max}"
    )]
    Cardinality {
        parameter: String,
        service: String,
        min: u32,
        max: u32,
        actual: u32,
    },
}

/// Serializable snapshot of everything a compiler accumulates between
/// generate rounds. Round-trips losslessly through [`Compiler::save_state`]
/// and [`Compiler::load_state`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerState {
    #[serde(default)]
    pub vars: Vec<Variable>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub variable_values: HashMap<String, Value>,
    #[serde(default)]
    pub for_each_outputs_to_be_collected: HashMap<String, Vec<Variable>>,
    #[serde(default)]
    pub iterations: HashMap<String, u64>,
}

/// Stateful workflow-to-process-chain compiler.
///
/// Not concurrency-safe; owned exclusively by one submission loop.
pub struct Compiler {
    vars: Vec<Variable>,
    /// Pending actions. Shrinks as actions are converted or retired, except
    /// that unrolling appends body copies before removing the parent.
    actions: Vec<Action>,
    /// Authoritative values delivered by results or collected from yields.
    variable_values: FxHashMap<String, Value>,
    /// Collected-output targets keyed by destination variable id. Once every
    /// listed variable has a value, the aggregate is published into
    /// `variable_values` under the key.
    for_each_outputs_to_be_collected: FxHashMap<String, Vec<Variable>>,
    /// Last used iteration index per enumerator id, seeded at 0 on first use.
    iterations: FxHashMap<String, u64>,
    tmp_path: String,
    out_path: String,
    services: FxHashMap<String, ServiceMetadata>,
    adapters: Arc<dyn OutputAdapterOracle>,
    id_generator: Arc<dyn IdGenerator>,
}

impl Compiler {
    /// Build a compiler for one workflow. No eager validation happens here;
    /// structural problems surface from [`Compiler::generate`].
    pub fn new(
        workflow: Workflow,
        tmp_path: impl Into<String>,
        out_path: impl Into<String>,
        services: Vec<ServiceMetadata>,
        adapters: Arc<dyn OutputAdapterOracle>,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            vars: workflow.vars,
            actions: workflow.actions,
            variable_values: FxHashMap::default(),
            for_each_outputs_to_be_collected: FxHashMap::default(),
            iterations: FxHashMap::default(),
            tmp_path: tmp_path.into(),
            out_path: out_path.into(),
            services: services
                .into_iter()
                .map(|service| (service.id.clone(), service))
                .collect(),
            adapters,
            id_generator,
        }
    }

    /// True iff no actions are pending. An empty [`Compiler::generate`]
    /// return together with `is_finished()` means the workflow is done;
    /// empty while unfinished means the compiler is waiting for results.
    pub fn is_finished(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run one generate round over the given per-variable results.
    pub fn generate(
        &mut self,
        results: &HashMap<String, Vec<Value>>,
    ) -> Result<Vec<ProcessChain>, CompileError> {
        self.ingest_results(results);
        self.collect_for_each_outputs();
        self.unroll_for_each_actions()?;
        self.build_process_chains()
    }

    /// Snapshot the compiler state as an opaque JSON blob.
    pub fn save_state(&self) -> Value {
        let state = CompilerState {
            vars: self.vars.clone(),
            actions: self.actions.clone(),
            variable_values: self.variable_values.iter().map(clone_entry).collect(),
            for_each_outputs_to_be_collected: self
                .for_each_outputs_to_be_collected
                .iter()
                .map(clone_entry)
                .collect(),
            iterations: self.iterations.iter().map(clone_entry).collect(),
        };
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    /// Overwrite the compiler state from a blob produced by
    /// [`Compiler::save_state`].
    pub fn load_state(&mut self, blob: Value) -> serde_json::Result<()> {
        let state: CompilerState = serde_json::from_value(blob)?;
        self.vars = state.vars;
        self.actions = state.actions;
        self.variable_values = state.variable_values.into_iter().collect();
        self.for_each_outputs_to_be_collected =
            state.for_each_outputs_to_be_collected.into_iter().collect();
        self.iterations = state.iterations.into_iter().collect();
        Ok(())
    }

    /// Record delivered results. A single value binds the variable directly;
    /// multiple values bind it to the sequence of them.
    fn ingest_results(&mut self, results: &HashMap<String, Vec<Value>>) {
        for (id, values) in results {
            let value = match values.as_slice() {
                [single] => single.clone(),
                many => Value::Array(many.to_vec()),
            };
            self.variable_values.insert(id.clone(), value);
        }
    }

    /// Publish every collected-output entry whose variables are all known,
    /// repeating until a pass makes no progress so that yields unblocking
    /// other yields are observed within the same call.
    fn collect_for_each_outputs(&mut self) {
        loop {
            let ready: Vec<String> = self
                .for_each_outputs_to_be_collected
                .iter()
                .filter(|(_, variables)| {
                    variables
                        .iter()
                        .all(|v| v.value.is_some() || self.variable_values.contains_key(&v.id))
                })
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                let Some(variables) = self.for_each_outputs_to_be_collected.remove(&id) else {
                    continue;
                };
                let outputs: Vec<Value> = variables
                    .iter()
                    .map(|v| {
                        v.value
                            .clone()
                            .or_else(|| self.variable_values.get(&v.id).cloned())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                let dest = self.variable_values.remove(&id);
                self.variable_values.insert(id, yield_to(dest, outputs));
            }
        }
    }

    pub(crate) fn next_iteration(&mut self, enumerator_id: &str) -> u64 {
        use std::collections::hash_map::Entry;
        match self.iterations.entry(enumerator_id.to_string()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += 1;
                *entry.get()
            }
            Entry::Vacant(entry) => *entry.insert(0),
        }
    }

    pub(crate) fn remove_action(&mut self, action_uuid: Uuid) {
        self.actions
            .retain(|action| action.action_uuid() != action_uuid);
    }

    #[cfg(test)]
    pub(crate) fn variable_value(&self, id: &str) -> Option<&Value> {
        self.variable_values.get(id)
    }
}

fn clone_entry<K: Clone, V: Clone>((key, value): (&K, &V)) -> (K, V) {
    (key.clone(), value.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::backends::NoOutputAdapters;
    use crate::id::SequentialIdGenerator;
    use crate::model::{ExecuteAction, Variable};

    use super::*;

    fn empty_compiler(workflow: Workflow) -> Compiler {
        Compiler::new(
            workflow,
            "/tmp/drover",
            "/out/drover",
            Vec::new(),
            Arc::new(NoOutputAdapters),
            Arc::new(SequentialIdGenerator::new()),
        )
    }

    #[test]
    fn ingest_distinguishes_single_and_multiple_results() {
        let mut compiler = empty_compiler(Workflow::default());
        let results = HashMap::from([
            ("single".to_string(), vec![json!("a")]),
            ("multi".to_string(), vec![json!("a"), json!("b")]),
            ("none".to_string(), Vec::new()),
        ]);
        compiler.ingest_results(&results);
        assert_eq!(compiler.variable_value("single"), Some(&json!("a")));
        assert_eq!(compiler.variable_value("multi"), Some(&json!(["a", "b"])));
        assert_eq!(compiler.variable_value("none"), Some(&json!([])));
    }

    #[test]
    fn collect_runs_to_fixpoint_across_chained_yields() {
        let mut compiler = empty_compiler(Workflow::default());
        // `inner` collects from a delivered result; `outer` collects from
        // `inner`, so it only becomes ready once the first pass publishes.
        compiler
            .for_each_outputs_to_be_collected
            .insert("inner".to_string(), vec![Variable::new("leaf")]);
        compiler
            .for_each_outputs_to_be_collected
            .insert("outer".to_string(), vec![Variable::new("inner")]);
        compiler
            .variable_values
            .insert("leaf".to_string(), json!("v"));

        compiler.collect_for_each_outputs();

        assert!(compiler.for_each_outputs_to_be_collected.is_empty());
        assert_eq!(compiler.variable_value("inner"), Some(&json!(["v"])));
        assert_eq!(compiler.variable_value("outer"), Some(&json!(["v"])));
    }

    #[test]
    fn iterations_are_seeded_at_zero_and_monotonic() {
        let mut compiler = empty_compiler(Workflow::default());
        assert_eq!(compiler.next_iteration("e"), 0);
        assert_eq!(compiler.next_iteration("e"), 1);
        assert_eq!(compiler.next_iteration("other"), 0);
        assert_eq!(compiler.next_iteration("e"), 2);
    }

    #[test]
    fn save_load_save_round_trip_is_idempotent() {
        let workflow = Workflow {
            vars: vec![Variable::with_value("x", json!("a.txt"))],
            actions: vec![
                ExecuteAction::new("cp")
                    .with_input("input", Variable::new("x"))
                    .into(),
            ],
        };
        let mut compiler = empty_compiler(workflow);
        compiler
            .variable_values
            .insert("y".to_string(), json!([1, 2]));
        compiler
            .for_each_outputs_to_be_collected
            .insert("z".to_string(), vec![Variable::new("y")]);
        compiler.iterations.insert("e".to_string(), 3);

        let first = compiler.save_state();
        let mut restored = empty_compiler(Workflow::default());
        restored.load_state(first.clone()).expect("load state");
        let second = restored.save_state();
        assert_eq!(first, second, "save/load/save must be lossless");

        let keys: Vec<&String> = first
            .as_object()
            .expect("state is an object")
            .keys()
            .collect();
        for key in [
            "vars",
            "actions",
            "variableValues",
            "forEachOutputsToBeCollected",
            "iterations",
        ] {
            assert!(keys.iter().any(|k| *k == key), "state blob carries {key}");
        }
    }
}
