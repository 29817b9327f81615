//! Bake Module
//!
//! Turns a parsed [`Workflow`](crate::workflow::Workflow) plus input
//! bindings into executor-ready [`CompiledStep`]s.
//!
//! - [`compiled`]: Output types (per-executor configs, step status)
//! - [`baker`]: Variable binding, substitution and ordering

pub mod baker;
pub mod compiled;

pub use baker::{parse_flag, BakeError, Baker, APPROVAL_COMMAND};
pub use compiled::{
    AgentConfig, BranchConfig, BranchTarget, CompiledStep, ExecutorConfig, ExpandConfig,
    ForeachConfig, KillConfig, ShellConfig, SpawnConfig, StepStatus, DEFAULT_AGENT_MODE,
    DEFAULT_KILL_TIMEOUT,
};
