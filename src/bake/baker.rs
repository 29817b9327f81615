//! Baker
//!
//! Compiles a workflow plus input bindings into ordered, fully substituted
//! [`CompiledStep`]s.
//!
//! Baking always validates first and always returns steps in dependency
//! order (stable with respect to declaration order). `needs` lists are
//! carried through as written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::{Map, Value};
use thiserror::Error;

use super::compiled::{
    AgentConfig, BranchConfig, BranchTarget, CompiledStep, ExecutorConfig, ExpandConfig,
    ForeachConfig, KillConfig, ShellConfig, SpawnConfig, StepStatus, DEFAULT_AGENT_MODE,
    DEFAULT_KILL_TIMEOUT,
};
use crate::template::{has_placeholders, render_value, StepSnapshot, TemplateError, VarContext};
use crate::workflow::graph::{format_cycle, DependencyGraph};
use crate::workflow::model::{ExecutorKind, ExpansionTarget, FlexValue, Step, VarType, Workflow};
use crate::workflow::validator::{validate_full, ValidationResult};

/// Command a gate step waits on; the step ID is appended.
pub const APPROVAL_COMMAND: &str = "meow await-approval";

const AGENT_BUILTIN: &str = "agent";

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("workflow failed validation:\n{0}")]
    Invalid(ValidationResult),

    #[error("failed to read file for variable '{name}' ({}): {source}", .path.display())]
    VariableFile {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("variable '{name}': {message}")]
    InvalidVariable { name: String, message: String },

    #[error("step '{step}', field '{field}': {source}")]
    Field {
        step: String,
        field: String,
        #[source]
        source: TemplateError,
    },

    #[error("step '{step}', field '{field}': {message}")]
    InvalidValue {
        step: String,
        field: String,
        message: String,
    },

    #[error("step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("step '{step}': unsupported executor '{executor}'")]
    UnsupportedExecutor { step: String, executor: String },

    #[error("duplicate step ID '{0}'")]
    DuplicateStep(String),

    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<String> },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Parses a textual flag: `true`/`1`/`yes` or `false`/`0`/`no`.
pub fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn agent_field(step: &Step) -> &'static str {
    if step.agent.is_some() {
        "agent"
    } else {
        "assignee"
    }
}

fn prompt_field(step: &Step) -> &'static str {
    if step.prompt.is_some() {
        "prompt"
    } else {
        "instructions"
    }
}

/// Compiles workflows for one run.
///
/// A baker owns the [`VarContext`] of its run; create one per bake.
pub struct Baker {
    workflow_id: String,
    default_assignee: Option<String>,
    shell_escaping: bool,
    context: VarContext,
}

impl Baker {
    /// Creates a baker for the run `workflow_id`, with deferred resolution on.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let mut context = VarContext::new();
        context.set_deferred(true);
        Self {
            workflow_id: workflow_id.into(),
            default_assignee: None,
            shell_escaping: false,
            context,
        }
    }

    /// Agent used by agent steps that name none.
    pub fn with_default_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.default_assignee = Some(assignee.into());
        self
    }

    /// Whether references to future step outputs may stay unresolved.
    pub fn with_deferred(mut self, deferred: bool) -> Self {
        self.context.set_deferred(deferred);
        self
    }

    /// Single-quotes substituted values in shell commands and branch
    /// conditions.
    pub fn with_shell_escaping(mut self, enabled: bool) -> Self {
        self.shell_escaping = enabled;
        self
    }

    pub fn with_output_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<StepSnapshot> + 'static,
    {
        self.context.set_output_lookup(lookup);
        self
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + 'static,
    {
        self.context.set_clock(clock);
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn context(&self) -> &VarContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut VarContext {
        &mut self.context
    }

    /// Validates and compiles `workflow` with the given input bindings.
    ///
    /// State seeded through [`context_mut`](Self::context_mut) applies to
    /// this bake only; the context is reset when it returns.
    pub fn bake_workflow(
        &mut self,
        workflow: &Workflow,
        inputs: &HashMap<String, String>,
    ) -> Result<Vec<CompiledStep>, BakeError> {
        let result = self.bake_workflow_steps(workflow, inputs);
        self.context.reset();
        result
    }

    fn bake_workflow_steps(
        &mut self,
        workflow: &Workflow,
        inputs: &HashMap<String, String>,
    ) -> Result<Vec<CompiledStep>, BakeError> {
        info!("Baking workflow '{}' as '{}'", workflow.name, self.workflow_id);

        validate_full(workflow)
            .into_result()
            .map_err(BakeError::Invalid)?;

        self.bind_inputs(workflow, inputs)?;
        self.context.apply_defaults(&workflow.variables);
        self.context
            .validate_required(&workflow.variables)
            .map_err(|err| match err {
                TemplateError::MissingRequired(names) => BakeError::MissingVariables(names),
                other => BakeError::Template(other),
            })?;
        self.check_variable_values(workflow)?;
        self.seed_builtins();

        let mut compiled = Vec::with_capacity(workflow.len());
        for step in &workflow.steps {
            compiled.push(self.compile_step(step, &step.id)?);
        }

        let ordered = order(compiled)?;
        info!("Baked {} step(s) for '{}'", ordered.len(), self.workflow_id);
        Ok(ordered)
    }

    /// Compiles a batch of inline steps under `parent_id`.
    ///
    /// Compiled IDs are `parent.child`. Needs on other steps of the batch are
    /// rewritten to the compiled IDs; a step that needs nothing in the batch
    /// also needs `parent_id`.
    pub fn bake_inline(
        &mut self,
        steps: &[Step],
        parent_id: &str,
    ) -> Result<Vec<CompiledStep>, BakeError> {
        let mut internal: HashSet<&str> = HashSet::new();
        for step in steps {
            if !internal.insert(step.id.as_str()) {
                return Err(BakeError::DuplicateStep(format!("{}.{}", parent_id, step.id)));
            }
        }
        if let Some(path) = DependencyGraph::from_steps(steps).find_cycles().into_iter().next() {
            return Err(BakeError::Cycle { path });
        }

        let mut compiled = Vec::with_capacity(steps.len());
        for step in steps {
            let id = format!("{}.{}", parent_id, step.id);
            let mut out = self.compile_step(step, &id)?;

            let has_internal = step.needs.iter().any(|need| internal.contains(need.as_str()));
            out.needs = step
                .needs
                .iter()
                .map(|need| {
                    if internal.contains(need.as_str()) {
                        format!("{}.{}", parent_id, need)
                    } else {
                        need.clone()
                    }
                })
                .collect();
            if !has_internal {
                out.needs.push(parent_id.to_string());
            }
            compiled.push(out);
        }

        debug!("Baked {} inline step(s) under '{}'", compiled.len(), parent_id);
        order(compiled)
    }

    fn bind_inputs(
        &mut self,
        workflow: &Workflow,
        inputs: &HashMap<String, String>,
    ) -> Result<(), BakeError> {
        for (name, value) in inputs {
            let declared = workflow.variables.get(name);
            if declared.and_then(|var| var.var_type) == Some(VarType::File) {
                let contents = fs::read_to_string(value).map_err(|source| BakeError::VariableFile {
                    name: name.clone(),
                    path: PathBuf::from(value),
                    source,
                })?;
                debug!("Variable '{}' read from {}", name, value);
                self.context.set_var(name.clone(), contents.trim().to_string());
            } else {
                if declared.is_none() {
                    debug!("Input '{}' is not declared by '{}'", name, workflow.name);
                }
                self.context.set_var(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Checks declared `type` and `enum` against the final values.
    fn check_variable_values(&self, workflow: &Workflow) -> Result<(), BakeError> {
        for (name, var) in &workflow.variables {
            let Some(value) = self.context.var(name) else {
                continue;
            };
            let text = render_value(value);
            if has_placeholders(&text) {
                continue;
            }

            let invalid = |message: String| BakeError::InvalidVariable {
                name: name.clone(),
                message,
            };
            match var.var_type {
                Some(VarType::Int) if text.trim().parse::<i64>().is_err() => {
                    return Err(invalid(format!("'{}' is not an integer", text)));
                }
                Some(VarType::Bool) if parse_flag(&text).is_none() => {
                    return Err(invalid(format!("'{}' is not a boolean", text)));
                }
                _ => {}
            }
            if let Some(allowed) = &var.allowed {
                if !allowed.iter().any(|a| *a == text) {
                    return Err(invalid(format!(
                        "'{}' is not one of: {}",
                        text,
                        allowed.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    fn seed_builtins(&mut self) {
        self.context.set_builtin("workflow_id", self.workflow_id.clone());
        self.context.set_builtin("molecule_id", self.workflow_id.clone());
    }

    /// Binds `agent` for one step: the step's own agent, else the default
    /// assignee. With neither, deferred mode keeps `{{agent}}` for runtime.
    fn bind_step_agent(&mut self, step: &Step, id: &str) -> Result<(), BakeError> {
        self.context.remove_builtin(AGENT_BUILTIN);
        if self.context.is_deferred() && !self.context.has_var(AGENT_BUILTIN) {
            self.context.bind_late(AGENT_BUILTIN);
        } else {
            self.context.unbind_late(AGENT_BUILTIN);
        }

        let agent = match step.agent_name() {
            Some(raw) => Some(self.text(id, agent_field(step), raw)?),
            None => self.default_assignee.clone(),
        };
        if let Some(agent) = agent {
            self.context.unbind_late(AGENT_BUILTIN);
            self.context.set_builtin(AGENT_BUILTIN, agent);
        }
        Ok(())
    }

    fn compile_step(&mut self, step: &Step, id: &str) -> Result<CompiledStep, BakeError> {
        self.context.set_builtin("step_id", id);
        self.context.set_builtin("bead_id", id);
        self.bind_step_agent(step, id)?;

        let class = step.classify().ok_or_else(|| BakeError::UnsupportedExecutor {
            step: id.to_string(),
            executor: step
                .executor
                .clone()
                .or_else(|| step.step_type.clone())
                .unwrap_or_default(),
        })?;
        debug!("Compiling step '{}' as {}", id, class.executor);

        let title = self.optional(id, "title", step.title.as_deref())?;
        let config = match class.executor {
            ExecutorKind::Shell => ExecutorConfig::Shell(self.shell_config(step, id)?),
            ExecutorKind::Spawn => ExecutorConfig::Spawn(self.spawn_config(step, id)?),
            ExecutorKind::Kill => ExecutorConfig::Kill(self.kill_config(step, id)?),
            ExecutorKind::Expand => ExecutorConfig::Expand(ExpandConfig {
                template: self.required(id, "template", step.template.as_deref())?,
                variables: self.variables(id, "variables", &step.variables)?,
            }),
            ExecutorKind::Foreach => ExecutorConfig::Foreach(self.foreach_config(step, id)?),
            ExecutorKind::Branch => ExecutorConfig::Branch(self.branch_config(step, id, class.gate)?),
            ExecutorKind::Agent => ExecutorConfig::Agent(self.agent_config(step, id)?),
        };

        Ok(CompiledStep {
            id: id.to_string(),
            title,
            status: StepStatus::Pending,
            needs: step.needs.clone(),
            config,
        })
    }

    fn shell_config(&mut self, step: &Step, id: &str) -> Result<ShellConfig, BakeError> {
        let field = if step.command.is_some() { "command" } else { "code" };
        Ok(ShellConfig {
            command: self.command(id, field, step.command_text().unwrap_or_default())?,
            workdir: self.optional(id, "workdir", step.workdir.as_deref())?,
            env: self.env(id, &step.env)?,
            on_error: step.on_error.clone(),
            outputs: step.outputs.clone(),
        })
    }

    fn spawn_config(&mut self, step: &Step, id: &str) -> Result<SpawnConfig, BakeError> {
        let agent = self.required(id, agent_field(step), step.agent_name())?;

        let mut spawn_args = Vec::with_capacity(step.spawn_args.len());
        for (index, arg) in step.spawn_args.iter().enumerate() {
            spawn_args.push(self.text(id, &format!("spawn_args[{}]", index), arg)?);
        }

        Ok(SpawnConfig {
            agent,
            adapter: self.optional(id, "adapter", step.adapter.as_deref())?,
            workdir: self.optional(id, "workdir", step.workdir.as_deref())?,
            env: self.env(id, &step.env)?,
            resume_session: step.resume_session.clone(),
            spawn_args,
            prompt: self.optional(id, prompt_field(step), step.prompt_text())?,
        })
    }

    fn kill_config(&mut self, step: &Step, id: &str) -> Result<KillConfig, BakeError> {
        let timeout = match step.timeout.as_deref() {
            Some(timeout) => self.text(id, "timeout", timeout)?,
            None => DEFAULT_KILL_TIMEOUT.to_string(),
        };
        Ok(KillConfig {
            agent: self.required(id, agent_field(step), step.agent_name())?,
            graceful: step.graceful.unwrap_or(true),
            timeout,
        })
    }

    fn foreach_config(&mut self, step: &Step, id: &str) -> Result<ForeachConfig, BakeError> {
        match (&step.items, &step.items_file) {
            (Some(_), Some(_)) => {
                return Err(BakeError::InvalidStep {
                    step: id.to_string(),
                    message: "items and items_file are mutually exclusive".to_string(),
                })
            }
            (None, None) => {
                return Err(BakeError::InvalidStep {
                    step: id.to_string(),
                    message: "foreach step requires items or items_file".to_string(),
                })
            }
            _ => {}
        }

        // Item and index are bound per iteration at expansion time
        self.context.bind_late(step.item_var());
        if let Some(index_var) = &step.index_var {
            self.context.bind_late(index_var.clone());
        }
        let config = self.foreach_fields(step, id);
        self.context.unbind_late(step.item_var());
        if let Some(index_var) = &step.index_var {
            self.context.unbind_late(index_var);
        }
        config
    }

    fn foreach_fields(&mut self, step: &Step, id: &str) -> Result<ForeachConfig, BakeError> {
        let parallel = match &step.parallel {
            Some(flex) => self.flex_bool(id, "parallel", flex)?,
            None => true,
        };
        let max_concurrent = match &step.max_concurrent {
            Some(flex) => Some(self.flex_count(id, "max_concurrent", flex)?),
            None => None,
        };

        Ok(ForeachConfig {
            template: self.required(id, "template", step.template.as_deref())?,
            variables: self.variables(id, "variables", &step.variables)?,
            items: self.optional(id, "items", step.items.as_deref())?,
            items_file: self.optional(id, "items_file", step.items_file.as_deref())?,
            item_var: step.item_var().to_string(),
            index_var: step.index_var.clone(),
            parallel,
            max_concurrent,
        })
    }

    fn branch_config(&mut self, step: &Step, id: &str, gate: bool) -> Result<BranchConfig, BakeError> {
        let condition = if gate {
            format!("{} {}", APPROVAL_COMMAND, id)
        } else {
            let raw = step
                .condition
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| BakeError::InvalidStep {
                    step: id.to_string(),
                    message: "branch step requires a condition".to_string(),
                })?;
            self.command(id, "condition", raw)?
        };

        let mut config = BranchConfig {
            condition,
            prompt: self.optional(id, prompt_field(step), step.prompt_text())?,
            workdir: self.optional(id, "workdir", step.workdir.as_deref())?,
            env: self.env(id, &step.env)?,
            outputs: step.outputs.clone(),
            timeout: self.optional(id, "timeout", step.timeout.as_deref())?,
            ..BranchConfig::default()
        };

        // Targets last: baking inline steps moves `step_id`
        if let Some(target) = &step.on_true {
            config.on_true = Some(self.branch_target(id, "on_true", target)?);
        }
        if let Some(target) = &step.on_false {
            config.on_false = Some(self.branch_target(id, "on_false", target)?);
        }
        if let Some(target) = &step.on_timeout {
            config.on_timeout = Some(self.branch_target(id, "on_timeout", target)?);
        }
        Ok(config)
    }

    fn branch_target(
        &mut self,
        id: &str,
        name: &str,
        target: &ExpansionTarget,
    ) -> Result<BranchTarget, BakeError> {
        let steps = if target.inline.is_empty() {
            Vec::new()
        } else {
            self.bake_inline(&target.inline, id)?
        };
        Ok(BranchTarget {
            template: self.optional(id, &format!("{}.template", name), target.template.as_deref())?,
            variables: self.variables(id, &format!("{}.variables", name), &target.variables)?,
            steps,
        })
    }

    fn agent_config(&mut self, step: &Step, id: &str) -> Result<AgentConfig, BakeError> {
        let agent = match step.agent_name() {
            Some(agent) => Some(self.text(id, agent_field(step), agent)?),
            None => self.default_assignee.clone(),
        };
        let mode = match step.mode.as_deref() {
            Some(mode) => self.text(id, "mode", mode)?,
            None => DEFAULT_AGENT_MODE.to_string(),
        };

        Ok(AgentConfig {
            agent,
            prompt: self.text(id, prompt_field(step), step.prompt_text().unwrap_or_default())?,
            mode,
            outputs: step.outputs.clone(),
        })
    }

    fn text(&mut self, step: &str, field: &str, value: &str) -> Result<String, BakeError> {
        self.context
            .substitute(value)
            .map_err(|source| BakeError::Field {
                step: step.to_string(),
                field: field.to_string(),
                source,
            })
    }

    /// Like [`text`](Self::text), quoting values when shell escaping is on.
    fn command(&mut self, step: &str, field: &str, value: &str) -> Result<String, BakeError> {
        let result = if self.shell_escaping {
            self.context.substitute_shell(value)
        } else {
            self.context.substitute(value)
        };
        result.map_err(|source| BakeError::Field {
            step: step.to_string(),
            field: field.to_string(),
            source,
        })
    }

    fn optional(
        &mut self,
        step: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, BakeError> {
        value.map(|v| self.text(step, field, v)).transpose()
    }

    fn required(&mut self, step: &str, field: &str, value: Option<&str>) -> Result<String, BakeError> {
        match value.filter(|v| !v.trim().is_empty()) {
            Some(v) => self.text(step, field, v),
            None => Err(BakeError::InvalidStep {
                step: step.to_string(),
                message: format!("missing required field '{}'", field),
            }),
        }
    }

    fn env(
        &mut self,
        step: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, BakeError> {
        let mut out = BTreeMap::new();
        for (key, value) in env {
            out.insert(key.clone(), self.text(step, &format!("env.{}", key), value)?);
        }
        Ok(out)
    }

    fn variables(
        &mut self,
        step: &str,
        prefix: &str,
        variables: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, BakeError> {
        let mut out = BTreeMap::new();
        for (key, value) in variables {
            let field = format!("{}.{}", prefix, key);
            out.insert(key.clone(), self.value(step, &field, value)?);
        }
        Ok(out)
    }

    /// Substitutes every string inside a JSON value.
    fn value(&mut self, step: &str, field: &str, value: &Value) -> Result<Value, BakeError> {
        match value {
            Value::String(s) => Ok(Value::String(self.text(step, field, s)?)),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.value(step, field, item)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.value(step, field, item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn flex_bool(&mut self, step: &str, field: &str, value: &FlexValue) -> Result<bool, BakeError> {
        match value {
            FlexValue::Bool(b) => Ok(*b),
            FlexValue::Int(n) => Ok(*n != 0),
            FlexValue::Float(f) => Ok(*f != 0.0),
            FlexValue::Text(text) => {
                let resolved = self.text(step, field, text)?;
                parse_flag(&resolved).ok_or_else(|| BakeError::InvalidValue {
                    step: step.to_string(),
                    field: field.to_string(),
                    message: format!(
                        "'{}' is not a boolean (expected true/1/yes or false/0/no)",
                        resolved
                    ),
                })
            }
        }
    }

    fn flex_count(&mut self, step: &str, field: &str, value: &FlexValue) -> Result<usize, BakeError> {
        let invalid = |shown: String| BakeError::InvalidValue {
            step: step.to_string(),
            field: field.to_string(),
            message: format!("'{}' is not a non-negative integer", shown),
        };
        match value {
            FlexValue::Int(n) => usize::try_from(*n).map_err(|_| invalid(n.to_string())),
            FlexValue::Float(f) if f.fract() == 0.0 && *f >= 0.0 => Ok(*f as usize),
            FlexValue::Float(f) => Err(invalid(f.to_string())),
            FlexValue::Bool(b) => Err(invalid(b.to_string())),
            FlexValue::Text(text) => {
                let resolved = self.text(step, field, text)?;
                resolved.trim().parse::<usize>().map_err(|_| invalid(resolved.clone()))
            }
        }
    }
}

/// Orders compiled steps so that each comes after the steps it needs.
fn order(steps: Vec<CompiledStep>) -> Result<Vec<CompiledStep>, BakeError> {
    let positions: Vec<usize> = {
        let graph = DependencyGraph::from_edges(
            steps.iter().map(|s| (s.id.as_str(), s.needs.as_slice())),
        );
        match graph.topological_order() {
            Ok(sorted) => {
                let mut index: HashMap<&str, usize> = HashMap::new();
                for (position, step) in steps.iter().enumerate() {
                    index.entry(step.id.as_str()).or_insert(position);
                }
                sorted.iter().map(|id| index[id]).collect()
            }
            Err(_) => {
                let path = graph.find_cycles().into_iter().next().unwrap_or_default();
                return Err(BakeError::Cycle { path });
            }
        }
    };

    let mut slots: Vec<Option<CompiledStep>> = steps.into_iter().map(Some).collect();
    Ok(positions
        .into_iter()
        .filter_map(|position| slots[position].take())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Var;
    use crate::workflow::parser::parse_module;
    use chrono::TimeZone;
    use serde_json::json;
    use std::io::Write;

    fn shell(id: &str, command: &str) -> Step {
        Step::new(id).with_executor(ExecutorKind::Shell).with_command(command)
    }

    fn no_inputs() -> HashMap<String, String> {
        HashMap::new()
    }

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn ids(steps: &[CompiledStep]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    fn shell_command(step: &CompiledStep) -> &str {
        match &step.config {
            ExecutorConfig::Shell(config) => &config.command,
            other => panic!("expected shell config, got {:?}", other),
        }
    }

    #[test]
    fn test_default_and_override() {
        let workflow = Workflow::from_steps("wf", vec![shell("run", "Using {{framework}}")])
            .with_variable("framework", Var::with_default("pytest"));

        let steps = Baker::new("run-1").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[0]), "Using pytest");

        let steps = Baker::new("run-2")
            .bake_workflow(&workflow, &inputs(&[("framework", "jest")]))
            .unwrap();
        assert_eq!(shell_command(&steps[0]), "Using jest");
    }

    #[test]
    fn test_rebake_starts_from_declared_defaults() {
        let workflow = Workflow::from_steps("wf", vec![shell("run", "Using {{framework}}")])
            .with_variable("framework", Var::with_default("pytest"));
        let mut baker = Baker::new("run-1");

        let first = baker
            .bake_workflow(&workflow, &inputs(&[("framework", "jest")]))
            .unwrap();
        assert_eq!(shell_command(&first[0]), "Using jest");

        let second = baker.bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&second[0]), "Using pytest");
        assert!(baker.context().var("framework").is_none());
        assert!(baker.context().builtin("step_id").is_none());
    }

    #[test]
    fn test_seeded_outputs_apply_to_next_bake_only() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![shell("build", "make"), shell("ship", "cp {{build.outputs.path}} /dist").depends_on("build")],
        );
        let mut baker = Baker::new("r");
        let mut outputs = Map::new();
        outputs.insert("path".to_string(), json!("target/app"));
        baker.context_mut().set_step_outputs("build", outputs);

        let steps = baker.bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[1]), "cp target/app /dist");

        let steps = baker.bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[1]), "cp {{build.outputs.path}} /dist");
    }

    #[test]
    fn test_agent_builtin_per_step() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![
                shell("who", "echo {{agent}}"),
                Step::new("start")
                    .with_executor(ExecutorKind::Spawn)
                    .with_agent("coder")
                    .with_prompt("You are {{agent}}"),
                shell("after", "echo {{agent}}").depends_on("start"),
            ],
        );
        assert!(validate_full(&workflow).is_valid());

        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[0]), "echo {{agent}}");
        let ExecutorConfig::Spawn(spawn) = &steps[1].config else {
            panic!("expected spawn config");
        };
        assert_eq!(spawn.prompt.as_deref(), Some("You are coder"));
        assert_eq!(shell_command(&steps[2]), "echo {{agent}}");

        let steps = Baker::new("r")
            .with_default_assignee("worker")
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();
        assert_eq!(shell_command(&steps[0]), "echo worker");
        let ExecutorConfig::Spawn(spawn) = &steps[1].config else {
            panic!("expected spawn config");
        };
        assert_eq!(spawn.prompt.as_deref(), Some("You are coder"));
        assert_eq!(shell_command(&steps[2]), "echo worker");

        let err = Baker::new("r")
            .with_deferred(false)
            .bake_workflow(&workflow, &no_inputs())
            .unwrap_err();
        assert!(matches!(err, BakeError::Field { ref step, .. } if step == "who"));
    }

    #[test]
    fn test_steps_start_pending_with_needs_verbatim() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![shell("a", "true"), shell("b", "true").depends_on("a")],
        );
        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(steps[1].needs, vec!["a"]);
        assert_eq!(steps[1].executor(), ExecutorKind::Shell);
    }

    #[test]
    fn test_topological_order() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![
                shell("a", "1"),
                shell("b", "2").depends_on("a"),
                shell("c", "3").depends_on("a").depends_on("b"),
            ],
        );
        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(ids(&steps), vec!["a", "b", "c"]);

        let shuffled = Workflow::from_steps(
            "wf",
            vec![
                shell("c", "3").depends_on("a").depends_on("b"),
                shell("b", "2").depends_on("a"),
                shell("a", "1"),
            ],
        );
        let steps = Baker::new("r").bake_workflow(&shuffled, &no_inputs()).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(ids(&steps), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_fails_validation_gate() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![shell("a", "1").depends_on("b"), shell("b", "2").depends_on("a")],
        );
        match Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap_err() {
            BakeError::Invalid(result) => {
                assert!(result.to_string().contains("dependency cycle: a → b → a"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_required_is_aggregated() {
        let workflow = Workflow::from_steps("wf", vec![shell("a", "{{task}} {{branch}}")])
            .with_variable("task", Var::required())
            .with_variable("branch", Var::required())
            .with_variable(
                "base",
                Var {
                    required: true,
                    default: Some(json!("main")),
                    ..Var::default()
                },
            );

        match Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap_err() {
            BakeError::MissingVariables(names) => assert_eq!(names, vec!["branch", "task"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_variable_type_and_enum_checks() {
        let workflow = Workflow::from_steps("wf", vec![shell("a", "{{level}} {{count}}")])
            .with_variable(
                "level",
                Var {
                    default: Some(json!("low")),
                    allowed: Some(vec!["low".to_string(), "high".to_string()]),
                    ..Var::default()
                },
            )
            .with_variable(
                "count",
                Var {
                    default: Some(json!(3)),
                    var_type: Some(VarType::Int),
                    ..Var::default()
                },
            );

        assert!(Baker::new("r").bake_workflow(&workflow, &no_inputs()).is_ok());

        let err = Baker::new("r")
            .bake_workflow(&workflow, &inputs(&[("level", "mid")]))
            .unwrap_err();
        assert!(matches!(err, BakeError::InvalidVariable { ref name, .. } if name == "level"));

        let err = Baker::new("r")
            .bake_workflow(&workflow, &inputs(&[("count", "many")]))
            .unwrap_err();
        assert!(matches!(err, BakeError::InvalidVariable { ref name, .. } if name == "count"));
    }

    #[test]
    fn test_file_variable_reads_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  Fix the flaky test  ").unwrap();

        let workflow = Workflow::from_steps(
            "wf",
            vec![Step::new("work")
                .with_executor(ExecutorKind::Agent)
                .with_agent("worker")
                .with_prompt("Task: {{brief}}")],
        )
        .with_variable(
            "brief",
            Var {
                required: true,
                var_type: Some(VarType::File),
                ..Var::default()
            },
        );

        let path = file.path().to_string_lossy().to_string();
        let steps = Baker::new("r")
            .bake_workflow(&workflow, &inputs(&[("brief", &path)]))
            .unwrap();
        match &steps[0].config {
            ExecutorConfig::Agent(config) => assert_eq!(config.prompt, "Task: Fix the flaky test"),
            other => panic!("unexpected config: {:?}", other),
        }

        let err = Baker::new("r")
            .bake_workflow(&workflow, &inputs(&[("brief", "/nonexistent/brief.md")]))
            .unwrap_err();
        assert!(matches!(err, BakeError::VariableFile { .. }));
    }

    #[test]
    fn test_builtins() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![shell("a", "{{workflow_id}} {{molecule_id}} {{step_id}} {{bead_id}} {{date}}")],
        );
        let clock = || Utc.with_ymd_and_hms(2024, 3, 9, 8, 30, 0).unwrap();
        let steps = Baker::new("run-7")
            .with_clock(clock)
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();
        assert_eq!(shell_command(&steps[0]), "run-7 run-7 a a 2024-03-09");
    }

    #[test]
    fn test_gate_synthesizes_condition_without_agent() {
        let mut gate = Step::new("approve").with_type("gate");
        gate.instructions = Some("Check the {{what}}".to_string());

        let workflow = Workflow::from_steps("wf", vec![gate])
            .with_variable("what", Var::with_default("diff"));
        let steps = Baker::new("r")
            .with_default_assignee("worker")
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();

        let ExecutorConfig::Branch(config) = &steps[0].config else {
            panic!("expected branch config");
        };
        assert_eq!(config.condition, "meow await-approval approve");
        assert_eq!(config.prompt.as_deref(), Some("Check the diff"));

        let json = serde_json::to_value(&steps[0]).unwrap();
        assert!(json["config"].get("agent").is_none());
        assert!(json["config"].get("assignee").is_none());
    }

    #[test]
    fn test_legacy_types_and_aliases() {
        let mut code = Step::new("build").with_type("code");
        code.code = Some("make {{target}}".to_string());

        let mut task = Step::new("write").with_type("task");
        task.instructions = Some("Implement it".to_string());

        let mut owned = Step::new("review").with_type("collaborative");
        owned.assignee = Some("reviewer".to_string());
        owned.instructions = Some("Review it".to_string());

        let workflow = Workflow::from_steps("wf", vec![code, task, owned])
            .with_variable("target", Var::with_default("all"));
        let steps = Baker::new("r")
            .with_default_assignee("worker")
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();

        assert_eq!(shell_command(&steps[0]), "make all");
        match (&steps[1].config, &steps[2].config) {
            (ExecutorConfig::Agent(task), ExecutorConfig::Agent(owned)) => {
                assert_eq!(task.agent.as_deref(), Some("worker"));
                assert_eq!(task.prompt, "Implement it");
                assert_eq!(task.mode, "autonomous");
                assert_eq!(owned.agent.as_deref(), Some("reviewer"));
            }
            other => panic!("unexpected configs: {:?}", other),
        }
    }

    #[test]
    fn test_spawn_and_kill_configs() {
        let mut spawn = Step::new("start")
            .with_executor(ExecutorKind::Spawn)
            .with_agent("{{who}}")
            .with_prompt("Hello {{who}}");
        spawn.workdir = Some("/work/{{who}}".to_string());
        spawn.env.insert("ROLE".to_string(), "{{who}}".to_string());
        spawn.resume_session = Some("{{not-substituted}}".to_string());
        spawn.spawn_args = vec!["--name={{who}}".to_string()];

        let kill = Step::new("stop")
            .with_executor(ExecutorKind::Kill)
            .with_agent("{{who}}")
            .depends_on("start");

        let mut forced = Step::new("force")
            .with_executor(ExecutorKind::Kill)
            .with_agent("other");
        forced.graceful = Some(false);
        forced.timeout = Some("1s".to_string());

        let workflow = Workflow::from_steps("wf", vec![spawn, kill, forced])
            .with_variable("who", Var::with_default("worker"));
        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();

        let ExecutorConfig::Spawn(config) = &steps[0].config else {
            panic!("expected spawn config");
        };
        assert_eq!(config.agent, "worker");
        assert_eq!(config.workdir.as_deref(), Some("/work/worker"));
        assert_eq!(config.env["ROLE"], "worker");
        assert_eq!(config.resume_session.as_deref(), Some("{{not-substituted}}"));
        assert_eq!(config.spawn_args, vec!["--name=worker"]);
        assert_eq!(config.prompt.as_deref(), Some("Hello worker"));

        let kill = steps.iter().find(|s| s.id == "stop").unwrap();
        assert_eq!(
            kill.config,
            ExecutorConfig::Kill(KillConfig {
                agent: "worker".to_string(),
                graceful: true,
                timeout: "10s".to_string(),
            })
        );

        let forced = steps.iter().find(|s| s.id == "force").unwrap();
        assert_eq!(
            forced.config,
            ExecutorConfig::Kill(KillConfig {
                agent: "other".to_string(),
                graceful: false,
                timeout: "1s".to_string(),
            })
        );
    }

    fn foreach_workflow() -> Workflow {
        let mut each = Step::new("each")
            .with_executor(ExecutorKind::Foreach)
            .with_template(".per-file");
        each.items = Some("{{files}}".to_string());
        each.item_var = Some("file".to_string());
        each.index_var = Some("n".to_string());
        each.parallel = Some(FlexValue::Text("{{par}}".to_string()));
        each.max_concurrent = Some(FlexValue::Text("{{limit}}".to_string()));
        each.variables.insert("path".to_string(), json!("{{dir}}/{{file}}"));
        each.variables.insert("position".to_string(), json!("{{n}}"));

        Workflow::from_steps("wf", vec![each])
            .with_variable("files", Var::with_default("a.rs b.rs"))
            .with_variable("dir", Var::with_default("src"))
            .with_variable("par", Var::with_default("yes"))
            .with_variable("limit", Var::with_default("3"))
    }

    #[test]
    fn test_foreach_config() {
        let steps = Baker::new("r").bake_workflow(&foreach_workflow(), &no_inputs()).unwrap();
        let ExecutorConfig::Foreach(config) = &steps[0].config else {
            panic!("expected foreach config");
        };
        assert_eq!(config.template, ".per-file");
        assert_eq!(config.items.as_deref(), Some("a.rs b.rs"));
        assert_eq!(config.item_var, "file");
        assert!(config.parallel);
        assert_eq!(config.max_concurrent, Some(3));
        assert_eq!(config.variables["path"], json!("src/{{file}}"));
        assert_eq!(config.variables["position"], json!("{{n}}"));
    }

    #[test]
    fn test_foreach_flex_values() {
        for (raw, expected) in [("true", true), ("1", true), ("yes", true), ("false", false), ("0", false), ("no", false)] {
            let steps = Baker::new("r")
                .bake_workflow(&foreach_workflow(), &inputs(&[("par", raw)]))
                .unwrap();
            let ExecutorConfig::Foreach(config) = &steps[0].config else {
                panic!("expected foreach config");
            };
            assert_eq!(config.parallel, expected, "parallel = {}", raw);
        }

        let err = Baker::new("r")
            .bake_workflow(&foreach_workflow(), &inputs(&[("par", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, BakeError::InvalidValue { ref field, .. } if field == "parallel"));

        let err = Baker::new("r")
            .bake_workflow(&foreach_workflow(), &inputs(&[("limit", "-2")]))
            .unwrap_err();
        assert!(matches!(err, BakeError::InvalidValue { ref field, .. } if field == "max_concurrent"));
    }

    #[test]
    fn test_foreach_literal_flex_and_default_parallel() {
        let mut workflow = foreach_workflow();
        let each = &mut workflow.steps[0];
        each.parallel = None;
        each.max_concurrent = Some(FlexValue::Int(2));

        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        let ExecutorConfig::Foreach(config) = &steps[0].config else {
            panic!("expected foreach config");
        };
        assert!(config.parallel);
        assert_eq!(config.max_concurrent, Some(2));
    }

    #[test]
    fn test_foreach_items_exclusive_in_inline_batch() {
        let mut each = Step::new("each")
            .with_executor(ExecutorKind::Foreach)
            .with_template("t");
        each.items = Some("a".to_string());
        each.items_file = Some("list.txt".to_string());

        let err = Baker::new("r").bake_inline(&[each], "p").unwrap_err();
        assert!(matches!(err, BakeError::InvalidStep { .. }));
    }

    #[test]
    fn test_output_references() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![
                shell("build", "make"),
                shell("ship", "cp {{build.outputs.path}} /dist").depends_on("build"),
            ],
        );

        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[1]), "cp {{build.outputs.path}} /dist");

        let steps = Baker::new("r")
            .with_output_lookup(|step| {
                (step == "build").then(|| {
                    let mut outputs = Map::new();
                    outputs.insert("path".to_string(), json!("target/app"));
                    StepSnapshot::done(outputs)
                })
            })
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();
        assert_eq!(shell_command(&steps[1]), "cp target/app /dist");

        let err = Baker::new("r")
            .with_deferred(false)
            .bake_workflow(&workflow, &no_inputs())
            .unwrap_err();
        assert!(matches!(err, BakeError::Field { ref step, ref field, .. } if step == "ship" && field == "command"));
    }

    #[test]
    fn test_shell_escaping() {
        let mut check = Step::new("check")
            .with_executor(ExecutorKind::Branch)
            .with_condition("test -f {{msg}}");
        check.on_true = Some(ExpansionTarget::template("other"));

        let workflow = Workflow::from_steps("wf", vec![shell("say", "echo {{msg}}"), check])
            .with_variable("msg", Var::with_default("it's"));

        let steps = Baker::new("r")
            .with_shell_escaping(true)
            .bake_workflow(&workflow, &no_inputs())
            .unwrap();
        assert_eq!(shell_command(&steps[0]), "echo 'it'\"'\"'s'");
        let ExecutorConfig::Branch(config) = &steps[1].config else {
            panic!("expected branch config");
        };
        assert_eq!(config.condition, "test -f 'it'\"'\"'s'");

        let steps = Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap();
        assert_eq!(shell_command(&steps[0]), "echo it's");
    }

    #[test]
    fn test_bake_inline_single_step_needs_parent() {
        let steps = Baker::new("r").bake_inline(&[Step::new("x").with_executor(ExecutorKind::Shell).with_command("true")], "p").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, "p.x");
        assert_eq!(steps[0].needs, vec!["p"]);
    }

    #[test]
    fn test_bake_inline_rewrites_internal_needs() {
        let batch = vec![
            shell("y", "2").depends_on("x"),
            shell("x", "1"),
            shell("z", "3").depends_on("prepare"),
        ];
        let steps = Baker::new("r").bake_inline(&batch, "p").unwrap();

        assert_eq!(ids(&steps), vec!["p.x", "p.z", "p.y"]);
        let needs: HashMap<&str, &Vec<String>> =
            steps.iter().map(|s| (s.id.as_str(), &s.needs)).collect();
        assert_eq!(needs["p.x"], &vec!["p".to_string()]);
        assert_eq!(needs["p.y"], &vec!["p.x".to_string()]);
        assert_eq!(needs["p.z"], &vec!["prepare".to_string(), "p".to_string()]);
    }

    #[test]
    fn test_bake_inline_errors() {
        let mut baker = Baker::new("r");

        let err = baker.bake_inline(&[shell("x", "1"), shell("x", "2")], "p").unwrap_err();
        assert!(matches!(err, BakeError::DuplicateStep(ref id) if id == "p.x"));

        let err = baker
            .bake_inline(
                &[
                    shell("a", "1").depends_on("c"),
                    shell("b", "2").depends_on("a"),
                    shell("c", "3").depends_on("b"),
                ],
                "p",
            )
            .unwrap_err();
        match err {
            BakeError::Cycle { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(format_cycle(&path), "a → c → b → a");
            }
            other => panic!("unexpected error: {}", other),
        }

        let mut unknown = Step::new("t");
        unknown.executor = Some("teleport".to_string());
        let err = baker.bake_inline(&[unknown], "p").unwrap_err();
        assert!(matches!(err, BakeError::UnsupportedExecutor { ref executor, .. } if executor == "teleport"));
    }

    #[test]
    fn test_branch_targets_compile_inline_steps() {
        let module = parse_module(
            r#"
[main]
[main.variables]
fixer = { default = "worker" }

[[main.steps]]
id = "check"
executor = "branch"
condition = "make test"

[main.steps.on_true]
template = ".release"
variables = { channel = "{{workflow_id}}" }

[[main.steps.on_false.inline]]
id = "fix"
executor = "agent"
agent = "{{fixer}}"
prompt = "Fix {{step_id}}"

[[main.steps.on_false.inline]]
id = "retest"
executor = "shell"
command = "make test"
needs = ["fix"]

[release]
[[release.steps]]
id = "tag"
executor = "shell"
command = "git tag"
"#,
        )
        .unwrap();

        let workflow = module.entry().unwrap();
        let steps = Baker::new("run-3").bake_workflow(workflow, &no_inputs()).unwrap();
        let ExecutorConfig::Branch(config) = &steps[0].config else {
            panic!("expected branch config");
        };

        let on_true = config.on_true.as_ref().unwrap();
        assert_eq!(on_true.template.as_deref(), Some(".release"));
        assert_eq!(on_true.variables["channel"], json!("run-3"));

        let on_false = config.on_false.as_ref().unwrap();
        assert_eq!(ids(&on_false.steps), vec!["check.fix", "check.retest"]);
        assert_eq!(on_false.steps[0].needs, vec!["check"]);
        assert_eq!(on_false.steps[1].needs, vec!["check.fix"]);
        match &on_false.steps[0].config {
            ExecutorConfig::Agent(agent) => {
                assert_eq!(agent.agent.as_deref(), Some("worker"));
                assert_eq!(agent.prompt, "Fix check.fix");
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_workflow_is_rejected_before_binding() {
        let workflow = Workflow::from_steps("wf", vec![shell("a", "").depends_on("ghost")]);
        match Baker::new("r").bake_workflow(&workflow, &no_inputs()).unwrap_err() {
            BakeError::Invalid(result) => {
                let report = result.to_string();
                assert!(report.contains("shell step requires a command"));
                assert!(report.contains("ghost"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag(" YES "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
