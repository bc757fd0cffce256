//! For-each unrolling: per-iteration body copies with variable substitution.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::model::{Action, ExecuteAction, ForEachAction, InputParameter, OutputParameter, Variable};

use super::{CompileError, Compiler};

/// Key of the buffer a recursive for-each feeds yielded inputs back into.
fn recursive_input_id(action: &ForEachAction) -> String {
    format!("{}${}", action.input.id, action.enumerator.id)
}

impl Compiler {
    /// Unroll every pending for-each whose input is known, breadth-first so
    /// that nested for-each copies produced in this round are unrolled in the
    /// same round when their inputs are already bound.
    pub(crate) fn unroll_for_each_actions(&mut self) -> Result<(), CompileError> {
        let mut queue: VecDeque<ForEachAction> = self
            .actions
            .iter()
            .filter_map(|action| action.as_for_each().cloned())
            .collect();
        while let Some(action) = queue.pop_front() {
            self.unroll_one(action, &mut queue)?;
        }
        Ok(())
    }

    fn unroll_one(
        &mut self,
        action: ForEachAction,
        queue: &mut VecDeque<ForEachAction>,
    ) -> Result<(), CompileError> {
        let recursive_id = recursive_input_id(&action);

        // The recursive buffer takes precedence over the plain variable value
        // and the literal; with none of the three the action waits for a
        // later round.
        let (input_value, consumed_buffer) =
            if let Some(value) = self.variable_values.get(&recursive_id) {
                (value.clone(), true)
            } else if let Some(value) = self.variable_values.get(&action.input.id) {
                (value.clone(), false)
            } else if let Some(value) = &action.input.value {
                (value.clone(), false)
            } else {
                return Ok(());
            };

        let elements = match input_value {
            Value::Array(items) => items,
            scalar => vec![scalar],
        };

        let mut unrolled: Vec<Action> = Vec::new();
        let mut yielded_outputs: Vec<Variable> = Vec::new();
        let mut yielded_inputs: Vec<Variable> = Vec::new();

        for element in elements {
            let iteration = self.next_iteration(&action.enumerator.id);
            let mut substitutions: FxHashMap<String, Variable> = FxHashMap::default();
            substitutions.insert(
                action.enumerator.id.clone(),
                Variable::with_value(
                    format!("{}${}", action.enumerator.id, iteration),
                    element,
                ),
            );
            for body_action in &action.actions {
                unrolled.push(unroll_action(body_action, &mut substitutions, iteration));
            }
            if let Some(yield_var) = &action.yield_to_output {
                yielded_outputs.push(resolve_yield(&substitutions, yield_var, "output")?);
            }
            if let Some(yield_var) = &action.yield_to_input {
                yielded_inputs.push(resolve_yield(&substitutions, yield_var, "input")?);
            }
        }

        trace!(
            enumerator = %action.enumerator.id,
            copies = unrolled.len(),
            yields_back = yielded_inputs.len(),
            "unrolled for-each"
        );

        for new_action in &unrolled {
            if let Action::ForEach(nested) = new_action {
                queue.push_back(nested.clone());
            }
        }
        self.actions.extend(unrolled);

        // Consumed buffer values must not be iterated again; later yields are
        // collected on top of the emptied sequence.
        if consumed_buffer {
            self.variable_values
                .insert(recursive_id.clone(), Value::Array(Vec::new()));
        }

        if let Some(output) = &action.output {
            self.for_each_outputs_to_be_collected
                .entry(format!("{}$$", output.id))
                .or_default()
                .extend(yielded_outputs);
        }

        if yielded_inputs.is_empty() {
            if self
                .for_each_outputs_to_be_collected
                .contains_key(&recursive_id)
            {
                // Downstream work may still yield more iterations into the
                // buffer; the for-each stays pending.
                return Ok(());
            }
            self.retire_for_each(&action, &recursive_id, consumed_buffer);
        } else {
            self.variable_values
                .insert(recursive_id.clone(), Value::Array(Vec::new()));
            self.for_each_outputs_to_be_collected
                .entry(recursive_id)
                .or_default()
                .extend(yielded_inputs);
        }
        Ok(())
    }

    /// Remove a finished for-each and make its collected output visible to
    /// downstream actions by dropping the `$$` guard suffix.
    fn retire_for_each(
        &mut self,
        action: &ForEachAction,
        recursive_id: &str,
        consumed_buffer: bool,
    ) {
        self.remove_action(action.action_uuid);
        if let Some(output) = &action.output {
            let guarded_id = format!("{}$$", output.id);
            if let Some(variables) = self.for_each_outputs_to_be_collected.remove(&guarded_id) {
                self.for_each_outputs_to_be_collected
                    .entry(output.id.clone())
                    .or_default()
                    .extend(variables);
            }
            if let Some(value) = self.variable_values.remove(&guarded_id) {
                self.variable_values.insert(output.id.clone(), value);
            }
        }
        if consumed_buffer {
            self.variable_values.remove(recursive_id);
        }
    }
}

fn resolve_yield(
    substitutions: &FxHashMap<String, Variable>,
    variable: &Variable,
    direction: &str,
) -> Result<Variable, CompileError> {
    substitutions.get(&variable.id).cloned().ok_or_else(|| {
        CompileError::InvalidWorkflow(format!(
            "for-each yields `{}` to its {direction} but no body action produces that variable",
            variable.id
        ))
    })
}

/// Deep-copy one body action for an iteration, renaming produced variables
/// and substituting consumed ones. The substitution map is shared across the
/// whole iteration so an output renamed by one action feeds the inputs of
/// its successors.
fn unroll_action(
    action: &Action,
    substitutions: &mut FxHashMap<String, Variable>,
    iteration: u64,
) -> Action {
    match action {
        Action::Execute(execute) => {
            let inputs = execute
                .inputs
                .iter()
                .map(|parameter| InputParameter {
                    id: parameter.id.clone(),
                    variable: substitute(substitutions, &parameter.variable),
                })
                .collect();
            let outputs = execute
                .outputs
                .iter()
                .map(|parameter| OutputParameter {
                    id: parameter.id.clone(),
                    variable: rename(substitutions, &parameter.variable, iteration),
                    prefix: parameter.prefix.clone(),
                    store: parameter.store,
                })
                .collect();
            Action::Execute(ExecuteAction {
                action_uuid: Uuid::new_v4(),
                service_id: execute.service_id.clone(),
                inputs,
                outputs,
            })
        }
        Action::ForEach(for_each) => {
            let input = substitute(substitutions, &for_each.input);
            // The enumerator rename must be recorded before the body copy so
            // body references to it pick up the fresh id.
            let enumerator = rename(substitutions, &for_each.enumerator, iteration);
            let actions = for_each
                .actions
                .iter()
                .map(|nested| unroll_action(nested, substitutions, iteration))
                .collect();
            let output = for_each
                .output
                .as_ref()
                .map(|variable| rename(substitutions, variable, iteration));
            let yield_to_output = for_each
                .yield_to_output
                .as_ref()
                .map(|variable| substitute(substitutions, variable));
            let yield_to_input = for_each
                .yield_to_input
                .as_ref()
                .map(|variable| substitute(substitutions, variable));
            Action::ForEach(ForEachAction {
                action_uuid: Uuid::new_v4(),
                input,
                enumerator,
                output,
                yield_to_output,
                yield_to_input,
                actions,
            })
        }
    }
}

fn substitute(substitutions: &FxHashMap<String, Variable>, variable: &Variable) -> Variable {
    substitutions
        .get(&variable.id)
        .cloned()
        .unwrap_or_else(|| variable.clone())
}

fn rename(
    substitutions: &mut FxHashMap<String, Variable>,
    variable: &Variable,
    iteration: u64,
) -> Variable {
    substitutions
        .entry(variable.id.clone())
        .or_insert_with(|| Variable::new(format!("{}${}", variable.id, iteration)))
        .clone()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unroll_renames_outputs_and_feeds_successors() {
        let body: Vec<Action> = vec![
            ExecuteAction::new("first")
                .with_input("in", Variable::new("e"))
                .with_output("out", Variable::new("mid"))
                .into(),
            ExecuteAction::new("second")
                .with_input("in", Variable::new("mid"))
                .with_output("out", Variable::new("end"))
                .into(),
        ];
        let mut substitutions = FxHashMap::default();
        substitutions.insert("e".to_string(), Variable::with_value("e$7", json!("x")));

        let copies: Vec<Action> = body
            .iter()
            .map(|action| unroll_action(action, &mut substitutions, 7))
            .collect();

        let first = copies[0].as_execute().expect("execute copy");
        assert_eq!(first.inputs[0].variable.id, "e$7");
        assert_eq!(first.inputs[0].variable.value, Some(json!("x")));
        assert_eq!(first.outputs[0].variable.id, "mid$7");
        let second = copies[1].as_execute().expect("execute copy");
        assert_eq!(
            second.inputs[0].variable.id, "mid$7",
            "renamed output must substitute into later inputs of the same iteration"
        );
        assert_eq!(second.outputs[0].variable.id, "end$7");
    }

    #[test]
    fn unroll_rewrites_nested_for_each() {
        let nested: Action = ForEachAction {
            action_uuid: Uuid::new_v4(),
            input: Variable::new("e"),
            enumerator: Variable::new("inner"),
            output: Some(Variable::new("collected")),
            yield_to_output: Some(Variable::new("leaf")),
            yield_to_input: None,
            actions: vec![
                ExecuteAction::new("work")
                    .with_input("in", Variable::new("inner"))
                    .with_output("out", Variable::new("leaf"))
                    .into(),
            ],
        }
        .into();
        let mut substitutions = FxHashMap::default();
        substitutions.insert(
            "e".to_string(),
            Variable::with_value("e$2", json!(["a", "b"])),
        );

        let copy = unroll_action(&nested, &mut substitutions, 2);
        let for_each = copy.as_for_each().expect("for-each copy");
        assert_eq!(for_each.input.id, "e$2");
        assert_eq!(for_each.input.value, Some(json!(["a", "b"])));
        assert_eq!(for_each.enumerator.id, "inner$2");
        assert_eq!(for_each.output.as_ref().map(|v| v.id.as_str()), Some("collected$2"));
        assert_eq!(
            for_each.yield_to_output.as_ref().map(|v| v.id.as_str()),
            Some("leaf$2"),
            "yield target must follow the body rename"
        );
        let body = for_each.actions[0].as_execute().expect("body copy");
        assert_eq!(body.inputs[0].variable.id, "inner$2");
        assert_eq!(body.outputs[0].variable.id, "leaf$2");
    }
}
