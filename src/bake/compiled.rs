//! Compiled Steps
//!
//! The baker's output: fully substituted steps with a typed configuration
//! per executor kind, ready to hand to an execution engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::model::{ExecutorKind, OutputSpec};

/// Kill timeout used when a step doesn't set one.
pub const DEFAULT_KILL_TIMEOUT: &str = "10s";

/// Agent mode used when a step doesn't set one.
pub const DEFAULT_AGENT_MODE: &str = "autonomous";

/// Execution status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShellConfig {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    /// Output capture specs, carried verbatim
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,
}

/// Arguments for starting an agent process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpawnConfig {
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Opaque session identifier, never substituted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spawn_args: Vec<String>,
    /// Initial prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Arguments for stopping an agent process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillConfig {
    pub agent: String,
    pub graceful: bool,
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpandConfig {
    pub template: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeachConfig {
    pub template: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_file: Option<String>,
    pub item_var: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    pub parallel: bool,
    /// `None` means no limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

/// A compiled branch outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BranchTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Compiled inline steps
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<CompiledStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BranchConfig {
    pub condition: String,
    /// Instructions shown while a gate waits for approval
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_true: Option<BranchTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_false: Option<BranchTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<BranchTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub prompt: String,
    pub mode: String,
    /// Declared outputs, carried verbatim
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,
}

/// Executor-specific configuration of a compiled step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "executor", rename_all = "lowercase")]
pub enum ExecutorConfig {
    Shell(ShellConfig),
    Spawn(SpawnConfig),
    Kill(KillConfig),
    Expand(ExpandConfig),
    Branch(BranchConfig),
    Foreach(ForeachConfig),
    Agent(AgentConfig),
}

impl ExecutorConfig {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorConfig::Shell(_) => ExecutorKind::Shell,
            ExecutorConfig::Spawn(_) => ExecutorKind::Spawn,
            ExecutorConfig::Kill(_) => ExecutorKind::Kill,
            ExecutorConfig::Expand(_) => ExecutorKind::Expand,
            ExecutorConfig::Branch(_) => ExecutorKind::Branch,
            ExecutorConfig::Foreach(_) => ExecutorKind::Foreach,
            ExecutorConfig::Agent(_) => ExecutorKind::Agent,
        }
    }
}

/// A step ready for execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledStep {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: StepStatus,
    pub needs: Vec<String>,
    pub config: ExecutorConfig,
}

impl CompiledStep {
    /// A pending step.
    pub fn new(id: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            id: id.into(),
            title: None,
            status: StepStatus::Pending,
            needs: Vec::new(),
            config,
        }
    }

    pub fn executor(&self) -> ExecutorKind {
        self.config.kind()
    }
}
