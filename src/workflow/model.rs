//! Workflow Data Model
//!
//! Core data structures representing declared workflows, their variables
//! and their steps.
//!
//! # Example Document (module shape)
//!
//! ```toml
//! [main]
//! description = "Implement and test a change"
//!
//! [main.variables]
//! task = { required = true, description = "What to build" }
//! framework = { default = "pytest" }
//!
//! [[main.steps]]
//! id = "implement"
//! executor = "agent"
//! agent = "worker"
//! prompt = "Implement {{task}}"
//!
//! [[main.steps]]
//! id = "test"
//! executor = "shell"
//! command = "{{framework}} -q"
//! needs = ["implement"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of step behaviors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Shell,
    Spawn,
    Kill,
    Expand,
    Branch,
    Foreach,
    Agent,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 7] = [
        ExecutorKind::Shell,
        ExecutorKind::Spawn,
        ExecutorKind::Kill,
        ExecutorKind::Expand,
        ExecutorKind::Branch,
        ExecutorKind::Foreach,
        ExecutorKind::Agent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Spawn => "spawn",
            Self::Kill => "kill",
            Self::Expand => "expand",
            Self::Branch => "branch",
            Self::Foreach => "foreach",
            Self::Agent => "agent",
        }
    }

    /// Returns true for kinds whose steps produce a child subgraph.
    pub fn produces_children(self) -> bool {
        matches!(self, Self::Expand | Self::Foreach | Self::Branch)
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown executor '{}'", s))
    }
}

/// Free-text step types from the legacy document shape.
///
/// This is the only place where legacy types are interpreted; everything
/// downstream works with the [`Classification`] a step resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyType {
    Task,
    Collaborative,
    Code,
    Condition,
    Start,
    Stop,
    Expand,
    Gate,
}

impl LegacyType {
    /// Recognized spellings, used for suggestions.
    pub const NAMES: [&'static str; 8] = [
        "task",
        "collaborative",
        "code",
        "condition",
        "start",
        "stop",
        "expand",
        "gate",
    ];

    /// Parses a legacy type. The empty string is a plain task.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" | "task" => Some(Self::Task),
            "collaborative" => Some(Self::Collaborative),
            "code" => Some(Self::Code),
            "condition" => Some(Self::Condition),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "expand" => Some(Self::Expand),
            "gate" => Some(Self::Gate),
            _ => None,
        }
    }

    /// The executor a legacy type maps onto.
    pub fn executor(self) -> ExecutorKind {
        match self {
            Self::Task | Self::Collaborative => ExecutorKind::Agent,
            Self::Code => ExecutorKind::Shell,
            Self::Condition | Self::Gate => ExecutorKind::Branch,
            Self::Start => ExecutorKind::Spawn,
            Self::Stop => ExecutorKind::Kill,
            Self::Expand => ExecutorKind::Expand,
        }
    }
}

/// How a declared step is executed, after legacy aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub executor: ExecutorKind,
    /// Branch that waits for human approval
    pub gate: bool,
    /// Legacy type the executor came from, if any
    pub legacy: Option<LegacyType>,
}

/// Declared type of a workflow variable.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Int,
    Bool,
    /// The bound value is a path whose contents are substituted
    File,
}

/// A workflow variable declaration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Var {
    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub var_type: Option<VarType>,

    /// Allowed values
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Var {
    /// A required variable with no default.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    /// An optional variable with a default value.
    pub fn with_default(default: impl Into<Value>) -> Self {
        Self {
            default: Some(default.into()),
            ..Self::default()
        }
    }
}

/// A value that may be written as a literal or as a `{{var}}` string.
///
/// Used for `parallel` and `max_concurrent` on foreach steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FlexValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Output capture (shell) or output declaration (agent).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OutputSpec {
    /// Where a shell step reads the value from (`stdout`, `stderr`, `file:<path>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// What happens on a branch outcome: another workflow, or inline steps.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExpansionTarget {
    /// Workflow reference (`name`, `file#workflow` or `.local`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,

    /// Steps spliced in directly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inline: Vec<Step>,
}

impl ExpansionTarget {
    pub fn template(reference: impl Into<String>) -> Self {
        Self {
            template: Some(reference.into()),
            ..Self::default()
        }
    }

    pub fn inline(steps: Vec<Step>) -> Self {
        Self {
            inline: steps,
            ..Self::default()
        }
    }
}

/// Represents a single declared step in a workflow.
///
/// Steps are flat tables; which fields matter depends on the executor the
/// step classifies to. Legacy aliases (`code`, `assignee`, `instructions`)
/// are read through [`Step::command_text`], [`Step::agent_name`] and
/// [`Step::prompt_text`].
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Explicit executor kind (`shell`, `spawn`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    /// Legacy free-text type (`task`, `code`, `gate`, ...)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// IDs of steps that must complete before this step can run
    #[serde(default, deserialize_with = "single_or_vec")]
    pub needs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawn_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<FlexValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<FlexValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_true: Option<ExpansionTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_false: Option<ExpansionTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<ExpansionTarget>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Item variable name used by foreach steps that don't declare one.
pub const DEFAULT_ITEM_VAR: &str = "item";

impl Step {
    /// Creates a step with only an identifier.
    ///
    /// # Example
    ///
    /// ```
    /// use meow::workflow::{ExecutorKind, Step};
    ///
    /// let step = Step::new("test")
    ///     .with_executor(ExecutorKind::Shell)
    ///     .with_command("cargo test")
    ///     .depends_on("build");
    /// assert_eq!(step.needs, vec!["build"]);
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = Some(kind.as_str().to_string());
        self
    }

    /// Sets the legacy `type` field.
    pub fn with_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = Some(step_type.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.needs.push(step_id.into());
        self
    }

    /// Resolves the executor, mapping legacy types through [`LegacyType`].
    ///
    /// An explicit `executor` wins over `type`. Returns `None` when neither
    /// names a known kind.
    pub fn classify(&self) -> Option<Classification> {
        if let Some(executor) = &self.executor {
            return executor.parse().ok().map(|executor| Classification {
                executor,
                gate: false,
                legacy: None,
            });
        }

        let legacy = LegacyType::parse(self.step_type.as_deref().unwrap_or_default())?;
        Some(Classification {
            executor: legacy.executor(),
            gate: legacy == LegacyType::Gate,
            legacy: Some(legacy),
        })
    }

    /// `command`, falling back to legacy `code`.
    pub fn command_text(&self) -> Option<&str> {
        self.command.as_deref().or(self.code.as_deref())
    }

    /// `agent`, falling back to legacy `assignee`.
    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_deref().or(self.assignee.as_deref())
    }

    /// `prompt`, falling back to legacy `instructions`.
    pub fn prompt_text(&self) -> Option<&str> {
        self.prompt.as_deref().or(self.instructions.as_deref())
    }

    pub fn item_var(&self) -> &str {
        self.item_var.as_deref().unwrap_or(DEFAULT_ITEM_VAR)
    }

    /// Branch outcomes that are set, with their field names.
    pub fn targets(&self) -> Vec<(&'static str, &ExpansionTarget)> {
        [
            ("on_true", &self.on_true),
            ("on_false", &self.on_false),
            ("on_timeout", &self.on_timeout),
        ]
        .into_iter()
        .filter_map(|(name, target)| target.as_ref().map(|t| (name, t)))
        .collect()
    }

    /// Every free-text field that may carry placeholders, with its field name.
    ///
    /// Does not descend into inline target steps.
    pub fn text_fields(&self) -> Vec<(String, &str)> {
        let mut fields: Vec<(String, &str)> = [
            ("title", &self.title),
            ("command", &self.command),
            ("code", &self.code),
            ("workdir", &self.workdir),
            ("agent", &self.agent),
            ("assignee", &self.assignee),
            ("adapter", &self.adapter),
            ("prompt", &self.prompt),
            ("instructions", &self.instructions),
            ("timeout", &self.timeout),
            ("template", &self.template),
            ("items", &self.items),
            ("items_file", &self.items_file),
            ("condition", &self.condition),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|v| (name.to_string(), v)))
        .collect();

        for (key, value) in &self.env {
            fields.push((format!("env.{}", key), value.as_str()));
        }
        for (key, value) in &self.variables {
            if let Value::String(s) = value {
                fields.push((format!("variables.{}", key), s.as_str()));
            }
        }
        for (index, arg) in self.spawn_args.iter().enumerate() {
            fields.push((format!("spawn_args[{}]", index), arg.as_str()));
        }
        for (name, flex) in [("parallel", &self.parallel), ("max_concurrent", &self.max_concurrent)] {
            if let Some(FlexValue::Text(s)) = flex {
                fields.push((name.to_string(), s.as_str()));
            }
        }
        for (name, target) in self.targets() {
            if let Some(template) = &target.template {
                fields.push((format!("{}.template", name), template.as_str()));
            }
            for (key, value) in &target.variables {
                if let Value::String(s) = value {
                    fields.push((format!("{}.variables.{}", name, key), s.as_str()));
                }
            }
        }

        fields
    }
}

/// Represents a complete workflow: variables plus an ordered list of steps.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Var>,

    /// Ordered list of steps in the workflow
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Runs are not kept after completion
    #[serde(default)]
    pub ephemeral: bool,

    /// Only reachable from workflows in the same document
    #[serde(default)]
    pub internal: bool,

    /// Workflow whose hooks this one attaches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks_to: Option<String>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Self::default()
        }
    }

    /// Declares a variable, builder style.
    pub fn with_variable(mut self, name: impl Into<String>, var: Var) -> Self {
        self.variables.insert(name.into(), var);
        self
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.needs.is_empty()).collect()
    }

    pub fn step_ids(&self) -> HashSet<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A document holding one or more named workflows.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub workflows: BTreeMap<String, Workflow>,

    /// File the module was loaded from, if any
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Module {
    /// Conventional name of the entry workflow.
    pub const DEFAULT_WORKFLOW: &'static str = "main";

    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a single workflow as the module's `main`.
    pub fn single(workflow: Workflow) -> Self {
        let mut module = Self::new();
        module.insert(Self::DEFAULT_WORKFLOW, workflow);
        module
    }

    pub fn insert(&mut self, key: impl Into<String>, workflow: Workflow) {
        self.workflows.insert(key.into(), workflow);
    }

    pub fn get(&self, key: &str) -> Option<&Workflow> {
        self.workflows.get(key)
    }

    /// The entry workflow: `main`, or the only workflow there is.
    pub fn entry(&self) -> Option<&Workflow> {
        self.workflows.get(Self::DEFAULT_WORKFLOW).or_else(|| {
            if self.workflows.len() == 1 {
                self.workflows.values().next()
            } else {
                None
            }
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_creation() {
        let step = Step::new(" build ")
            .with_executor(ExecutorKind::Shell)
            .with_command("make")
            .depends_on("fetch")
            .depends_on("configure");

        assert_eq!(step.id, "build");
        assert_eq!(step.executor.as_deref(), Some("shell"));
        assert_eq!(step.needs, vec!["fetch", "configure"]);
    }

    #[test]
    fn test_legacy_type_table() {
        let cases = [
            ("task", ExecutorKind::Agent),
            ("collaborative", ExecutorKind::Agent),
            ("", ExecutorKind::Agent),
            ("code", ExecutorKind::Shell),
            ("condition", ExecutorKind::Branch),
            ("start", ExecutorKind::Spawn),
            ("stop", ExecutorKind::Kill),
            ("expand", ExecutorKind::Expand),
            ("gate", ExecutorKind::Branch),
        ];
        for (raw, expected) in cases {
            let legacy = LegacyType::parse(raw).unwrap();
            assert_eq!(legacy.executor(), expected, "type '{}'", raw);
        }
        assert!(LegacyType::parse("deploy").is_none());
    }

    #[test]
    fn test_classify_prefers_executor() {
        let step = Step::new("s").with_executor(ExecutorKind::Shell).with_type("task");
        let class = step.classify().unwrap();
        assert_eq!(class.executor, ExecutorKind::Shell);
        assert!(class.legacy.is_none());
    }

    #[test]
    fn test_classify_gate_and_default() {
        let gate = Step::new("approve").with_type("gate").classify().unwrap();
        assert_eq!(gate.executor, ExecutorKind::Branch);
        assert!(gate.gate);

        let untyped = Step::new("plain").classify().unwrap();
        assert_eq!(untyped.executor, ExecutorKind::Agent);
        assert_eq!(untyped.legacy, Some(LegacyType::Task));
    }

    #[test]
    fn test_classify_unknown() {
        assert!(Step::new("x").with_type("deploy").classify().is_none());
        let mut step = Step::new("y");
        step.executor = Some("teleport".to_string());
        assert!(step.classify().is_none());
    }

    #[test]
    fn test_executor_from_str() {
        assert_eq!("foreach".parse::<ExecutorKind>().unwrap(), ExecutorKind::Foreach);
        assert!("Foreach".parse::<ExecutorKind>().is_err());
        assert_eq!(ExecutorKind::Kill.to_string(), "kill");
    }

    #[test]
    fn test_legacy_field_aliases() {
        let mut step = Step::new("s");
        step.code = Some("echo legacy".to_string());
        step.assignee = Some("alice".to_string());
        step.instructions = Some("do it".to_string());
        assert_eq!(step.command_text(), Some("echo legacy"));
        assert_eq!(step.agent_name(), Some("alice"));
        assert_eq!(step.prompt_text(), Some("do it"));

        step.command = Some("echo new".to_string());
        step.agent = Some("bob".to_string());
        step.prompt = Some("do this".to_string());
        assert_eq!(step.command_text(), Some("echo new"));
        assert_eq!(step.agent_name(), Some("bob"));
        assert_eq!(step.prompt_text(), Some("do this"));
    }

    #[test]
    fn test_needs_accepts_single_string() {
        let step: Step = serde_json::from_value(json!({"id": "b", "needs": "a"})).unwrap();
        assert_eq!(step.needs, vec!["a"]);

        let step: Step = serde_json::from_value(json!({"id": "c", "needs": ["a", "b"]})).unwrap();
        assert_eq!(step.needs, vec!["a", "b"]);

        assert!(serde_json::from_value::<Step>(json!({"id": "d", "needs": 3})).is_err());
    }

    #[test]
    fn test_flex_value_variants() {
        let step: Step = serde_json::from_value(json!({
            "id": "f",
            "parallel": "{{par}}",
            "max_concurrent": 4
        }))
        .unwrap();
        assert_eq!(step.parallel, Some(FlexValue::Text("{{par}}".to_string())));
        assert_eq!(step.max_concurrent, Some(FlexValue::Int(4)));

        let step: Step = serde_json::from_value(json!({"id": "g", "parallel": false})).unwrap();
        assert_eq!(step.parallel, Some(FlexValue::Bool(false)));
    }

    #[test]
    fn test_text_fields_cover_nested_values() {
        let mut step = Step::new("s").with_command("run {{a}}");
        step.env.insert("KEY".to_string(), "{{b}}".to_string());
        step.on_true = Some(ExpansionTarget {
            template: Some(".fix".to_string()),
            variables: [("x".to_string(), json!("{{c}}"))].into_iter().collect(),
            inline: Vec::new(),
        });

        let names: Vec<String> = step.text_fields().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"command".to_string()));
        assert!(names.contains(&"env.KEY".to_string()));
        assert!(names.contains(&"on_true.template".to_string()));
        assert!(names.contains(&"on_true.variables.x".to_string()));
    }

    #[test]
    fn test_workflow_add_step() {
        let mut workflow = Workflow::new("wf");
        let step = Step::new("step1");

        assert!(workflow.add_step(step.clone()).is_ok());
        assert!(workflow.add_step(step).is_err()); // Duplicate
        assert_eq!(workflow.len(), 1);
        assert!(workflow.get_step("step1").is_some());
        assert!(workflow.get_step("nonexistent").is_none());
    }

    #[test]
    fn test_workflow_root_steps() {
        let workflow = Workflow::from_steps(
            "wf",
            vec![Step::new("root"), Step::new("leaf").depends_on("root")],
        );
        let roots = workflow.root_steps();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, "root");
    }

    #[test]
    fn test_module_entry() {
        let mut module = Module::new();
        assert!(module.entry().is_none());

        module.insert("helper", Workflow::new("helper"));
        assert_eq!(module.entry().unwrap().name, "helper");

        module.insert("other", Workflow::new("other"));
        assert!(module.entry().is_none());

        module.insert("main", Workflow::new("main"));
        assert_eq!(module.entry().unwrap().name, "main");
        assert_eq!(module.names(), vec!["helper", "main", "other"]);
    }

    #[test]
    fn test_var_constructors() {
        assert!(Var::required().required);
        assert_eq!(Var::with_default("pytest").default, Some(json!("pytest")));
    }
}
