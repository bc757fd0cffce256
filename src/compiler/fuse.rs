//! Fusion of ready execute actions into linear process chains.

use std::collections::{BTreeSet, HashSet};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::model::{
    Argument, ArgumentKind, ArgumentVariable, DATA_TYPE_DIRECTORY, Executable, ExecuteAction,
    OutputParameter, ProcessChain, ServiceMetadata, ServiceParameter,
};

use super::values::{merge_to_dir, normalize_separators, stringify, to_string_collection};
use super::{CompileError, Compiler};

impl Compiler {
    /// Convert every pending execute action whose inputs are available into
    /// process chains, fusing an action with its sole consumer where the
    /// forking and output-adapter rules allow, and retire the converted
    /// actions.
    pub(crate) fn build_process_chains(&mut self) -> Result<Vec<ProcessChain>, CompileError> {
        let candidates: Vec<ExecuteAction> = self
            .actions
            .iter()
            .filter_map(|action| action.as_execute().cloned())
            .collect();

        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut converted: HashSet<Uuid> = HashSet::new();
        let mut chains: Vec<ProcessChain> = Vec::new();

        for start in &candidates {
            if visited.contains(&start.action_uuid) {
                continue;
            }
            let mut executables: Vec<Executable> = Vec::new();
            let mut capabilities: BTreeSet<String> = BTreeSet::new();
            // Values materialized while building this chain, keyed by
            // variable id. Scoped to the chain: a consumer in another chain
            // must wait for the executed results instead.
            let mut argument_values: FxHashMap<String, String> = FxHashMap::default();

            let mut current = start;
            loop {
                let service = self
                    .services
                    .get(&current.service_id)
                    .ok_or_else(|| CompileError::UnknownService(current.service_id.clone()))?;
                match self.materialize(current, service, &mut argument_values) {
                    Ok(executable) => {
                        visited.insert(current.action_uuid);
                        converted.insert(current.action_uuid);
                        capabilities.extend(service.required_capabilities.iter().cloned());
                        let adapter_boundary = executable.arguments.iter().any(|argument| {
                            argument.kind == ArgumentKind::Output
                                && self.adapters.has_adapter_for(&argument.data_type)
                        });
                        executables.push(executable);
                        if adapter_boundary {
                            // An output adapter will reshape the results; the
                            // chain must end so the adapter can run.
                            break;
                        }
                    }
                    Err(CompileError::MissingInput { .. }) => {
                        // A chain start may become ready next round and stays
                        // untouched; a successor reached mid-chain is parked
                        // for the rest of this round.
                        if !executables.is_empty() {
                            visited.insert(current.action_uuid);
                        }
                        break;
                    }
                    Err(other) => return Err(other),
                }

                match sole_pending_consumer(current, &candidates, &visited) {
                    Some(consumer) => current = consumer,
                    None => break,
                }
            }

            if !executables.is_empty() {
                let chain = ProcessChain {
                    id: self.id_generator.next_id(),
                    executables,
                    required_capabilities: capabilities.into_iter().collect(),
                };
                trace!(
                    process_chain_id = %chain.id,
                    executables = chain.executables.len(),
                    "fused process chain"
                );
                chains.push(chain);
            }
        }

        self.actions
            .retain(|action| !converted.contains(&action.action_uuid()));
        Ok(chains)
    }

    /// Materialize one execute action against its service signature.
    fn materialize(
        &self,
        action: &ExecuteAction,
        service: &ServiceMetadata,
        argument_values: &mut FxHashMap<String, String>,
    ) -> Result<Executable, CompileError> {
        let mut arguments: Vec<Argument> = Vec::new();
        for parameter in &service.parameters {
            let mut count: u32 = 0;
            match parameter.kind {
                ArgumentKind::Output => {
                    for output in action.outputs.iter().filter(|o| o.id == parameter.id) {
                        let path = self.make_output_path(parameter, output);
                        argument_values.insert(output.variable.id.clone(), path.clone());
                        arguments.push(argument(parameter, &output.variable.id, path));
                        count += 1;
                    }
                }
                ArgumentKind::Input => {
                    for input in action.inputs.iter().filter(|i| i.id == parameter.id) {
                        let resolved = self.resolve_input(
                            &input.variable.id,
                            input.variable.value.as_ref(),
                            parameter,
                            argument_values,
                        )
                        .ok_or_else(|| CompileError::MissingInput {
                            parameter: parameter.id.clone(),
                            variable: input.variable.id.clone(),
                            service: service.id.clone(),
                        })?;
                        let values = to_string_collection(&resolved);
                        if let Some(first) = values.first() {
                            argument_values.insert(input.variable.id.clone(), first.clone());
                        }
                        for value in values {
                            arguments.push(argument(parameter, &input.variable.id, value));
                            count += 1;
                        }
                    }
                }
            }
            if count == 0
                && parameter.kind == ArgumentKind::Input
                && parameter.cardinality.min == 1
                && parameter.cardinality.max == 1
                && let Some(default) = &parameter.default
            {
                arguments.push(argument(parameter, &parameter.id, stringify(default)));
                count = 1;
            }
            if !parameter.cardinality.contains(count) {
                return Err(CompileError::Cardinality {
                    parameter: parameter.id.clone(),
                    service: service.id.clone(),
                    min: parameter.cardinality.min,
                    max: parameter.cardinality.max,
                    actual: count,
                });
            }
        }
        Ok(Executable {
            service_name: service.name.clone(),
            path: service.path.clone(),
            arguments,
            runtime: service.runtime.clone(),
            runtime_args: service.runtime_args.clone(),
            service_id: service.id.clone(),
            retries: service.retries,
            max_runtime: service.max_runtime,
        })
    }

    /// Pick the first defined source for an input value: the literal, the
    /// known variable value (directory-merged where applicable), a value
    /// already materialized within this chain, then the service default.
    fn resolve_input(
        &self,
        variable_id: &str,
        literal: Option<&Value>,
        parameter: &ServiceParameter,
        argument_values: &FxHashMap<String, String>,
    ) -> Option<Value> {
        if let Some(value) = literal {
            return Some(value.clone());
        }
        if let Some(value) = self.variable_values.get(variable_id) {
            if parameter.data_type == DATA_TYPE_DIRECTORY
                && let Some(directory) = merge_to_dir(value)
            {
                return Some(Value::String(directory));
            }
            return Some(value.clone());
        }
        if let Some(value) = argument_values.get(variable_id) {
            return Some(Value::String(value.clone()));
        }
        parameter.default.clone()
    }

    /// Generate a fresh file path for an output parameter.
    fn make_output_path(
        &self,
        parameter: &ServiceParameter,
        output: &OutputParameter,
    ) -> String {
        let base = if output.store {
            &self.out_path
        } else {
            &self.tmp_path
        };
        let prefix = match output.prefix.as_deref() {
            Some(prefix) if prefix.starts_with('/') => prefix.to_string(),
            Some(prefix) => format!("{base}/{prefix}"),
            None => format!("{base}/"),
        };
        let suffix = parameter.file_suffix.as_deref().unwrap_or("");
        normalize_separators(&format!(
            "{prefix}{}{suffix}",
            self.id_generator.next_id()
        ))
    }
}

fn argument(parameter: &ServiceParameter, variable_id: &str, value: String) -> Argument {
    Argument {
        id: parameter.id.clone(),
        label: parameter.label.clone(),
        variable: ArgumentVariable {
            id: variable_id.to_string(),
            value,
        },
        kind: parameter.kind,
        data_type: parameter.data_type.clone(),
    }
}

/// An action fuses with its consumer only when exactly one pending action
/// consumes any of its outputs; forks keep their branches in separate chains.
fn sole_pending_consumer<'a>(
    current: &ExecuteAction,
    candidates: &'a [ExecuteAction],
    visited: &HashSet<Uuid>,
) -> Option<&'a ExecuteAction> {
    let output_ids: HashSet<&str> = current
        .outputs
        .iter()
        .map(|output| output.variable.id.as_str())
        .collect();
    let mut consumers = candidates.iter().filter(|candidate| {
        candidate
            .inputs
            .iter()
            .any(|input| output_ids.contains(input.variable.id.as_str()))
    });
    let first = consumers.next()?;
    if consumers.next().is_some() {
        return None;
    }
    if visited.contains(&first.action_uuid) {
        return None;
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::backends::NoOutputAdapters;
    use crate::id::SequentialIdGenerator;
    use crate::model::{Cardinality, Variable, Workflow};

    use super::*;

    fn service(id: &str, parameters: Vec<ServiceParameter>) -> ServiceMetadata {
        ServiceMetadata {
            id: id.to_string(),
            name: id.to_string(),
            path: format!("/opt/services/{id}"),
            runtime: "other".to_string(),
            required_capabilities: Vec::new(),
            parameters,
            runtime_args: Vec::new(),
            retries: None,
            max_runtime: None,
        }
    }

    fn compiler_with(services: Vec<ServiceMetadata>, workflow: Workflow) -> Compiler {
        Compiler::new(
            workflow,
            "/tmp/drover",
            "/out/drover",
            services,
            Arc::new(NoOutputAdapters),
            Arc::new(SequentialIdGenerator::new()),
        )
    }

    #[test]
    fn materialize_flattens_sequence_inputs_into_one_argument_each() {
        let cp = service(
            "cp",
            vec![ServiceParameter {
                cardinality: Cardinality::at_least(1),
                ..ServiceParameter::new("input", ArgumentKind::Input, "file")
            }],
        );
        let workflow = Workflow {
            vars: Vec::new(),
            actions: vec![
                ExecuteAction::new("cp")
                    .with_input(
                        "input",
                        Variable::with_value("files", json!(["a.txt", ["b.txt", "c.txt"]])),
                    )
                    .into(),
            ],
        };
        let mut compiler = compiler_with(vec![cp], workflow);
        let chains = compiler.build_process_chains().expect("chains");
        let values: Vec<&str> = chains[0].executables[0]
            .arguments
            .iter()
            .map(|argument| argument.variable.value.as_str())
            .collect();
        assert_eq!(values, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn materialize_synthesizes_default_for_absent_required_parameter() {
        let sort = service(
            "sort",
            vec![
                ServiceParameter::new("input", ArgumentKind::Input, "file"),
                ServiceParameter {
                    default: Some(json!(1)),
                    ..ServiceParameter::new("threads", ArgumentKind::Input, "integer")
                },
            ],
        );
        let workflow = Workflow {
            vars: Vec::new(),
            actions: vec![
                ExecuteAction::new("sort")
                    .with_input("input", Variable::with_value("x", json!("a.txt")))
                    .into(),
            ],
        };
        let mut compiler = compiler_with(vec![sort], workflow);
        let chains = compiler.build_process_chains().expect("chains");
        let threads = chains[0].executables[0]
            .arguments
            .iter()
            .find(|argument| argument.id == "threads")
            .expect("synthesized argument");
        assert_eq!(threads.variable.value, "1");
    }

    #[test]
    fn materialize_rejects_cardinality_violations() {
        let strict = service(
            "strict",
            vec![ServiceParameter::new("input", ArgumentKind::Input, "file")],
        );
        let workflow = Workflow {
            vars: Vec::new(),
            actions: vec![
                ExecuteAction::new("strict")
                    .with_input("input", Variable::with_value("x", json!(["a", "b"])))
                    .into(),
            ],
        };
        let mut compiler = compiler_with(vec![strict], workflow);
        let error = compiler.build_process_chains().expect_err("too many values");
        assert!(matches!(error, CompileError::Cardinality { actual: 2, .. }));
    }

    #[test]
    fn materialize_merges_file_collections_for_directory_inputs() {
        let index = service(
            "index",
            vec![ServiceParameter::new(
                "dir",
                ArgumentKind::Input,
                DATA_TYPE_DIRECTORY,
            )],
        );
        let workflow = Workflow {
            vars: Vec::new(),
            actions: vec![
                ExecuteAction::new("index")
                    .with_input("dir", Variable::new("files"))
                    .into(),
            ],
        };
        let mut compiler = compiler_with(vec![index], workflow);
        compiler.variable_values.insert(
            "files".to_string(),
            json!(["/data/in/a.txt", "/data/in/b.txt"]),
        );
        let chains = compiler.build_process_chains().expect("chains");
        assert_eq!(
            chains[0].executables[0].arguments[0].variable.value,
            "/data/in"
        );
    }

    #[test]
    fn unknown_service_is_reported() {
        let workflow = Workflow {
            vars: Vec::new(),
            actions: vec![ExecuteAction::new("ghost").into()],
        };
        let mut compiler = compiler_with(Vec::new(), workflow);
        let error = compiler.build_process_chains().expect_err("ghost service");
        assert!(matches!(error, CompileError::UnknownService(id) if id == "ghost"));
    }

    #[test]
    fn output_paths_respect_store_and_prefix() {
        let parameter = ServiceParameter {
            file_suffix: Some(".out".to_string()),
            ..ServiceParameter::new("out", ArgumentKind::Output, "file")
        };
        let compiler = compiler_with(Vec::new(), Workflow::default());
        let temp = compiler.make_output_path(
            &parameter,
            &OutputParameter {
                id: "out".to_string(),
                variable: Variable::new("y"),
                prefix: None,
                store: false,
            },
        );
        assert_eq!(temp, "/tmp/drover/0000.out");
        let stored = compiler.make_output_path(
            &parameter,
            &OutputParameter {
                id: "out".to_string(),
                variable: Variable::new("y"),
                prefix: Some("results/".to_string()),
                store: true,
            },
        );
        assert_eq!(stored, "/out/drover/results/0001.out");
        let absolute = compiler.make_output_path(
            &parameter,
            &OutputParameter {
                id: "out".to_string(),
                variable: Variable::new("y"),
                prefix: Some("/abs//path/".to_string()),
                store: false,
            },
        );
        assert_eq!(absolute, "/abs/path/0002.out");
    }
}
