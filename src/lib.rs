//! meow - Workflow Template Compiler
//!
//! Compiles declarative workflow documents (TOML) into validated,
//! dependency-ordered step lists for an agent orchestration runtime.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`template`]: Placeholder scanning and variable resolution
//! - [`workflow`]: Document model, parsing, validation and template loading
//! - [`bake`]: Compilation of a workflow plus inputs into executor configs
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use meow::{load_document, validate_full_module, Baker};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a document in either shape
//!     let module = load_document("release.meow.toml")?;
//!     validate_full_module(&module).into_result()?;
//!
//!     // Bake the entry workflow for one run
//!     let workflow = module.entry().ok_or("no entry workflow")?;
//!     let mut inputs = HashMap::new();
//!     inputs.insert("version".to_string(), "1.4.0".to_string());
//!
//!     let steps = Baker::new("release-42").bake_workflow(workflow, &inputs)?;
//!     println!("{}", serde_json::to_string_pretty(&steps)?);
//!     Ok(())
//! }
//! ```

pub mod bake;
pub mod template;
pub mod workflow;

// Re-export commonly used types
pub use bake::{BakeError, Baker, CompiledStep, ExecutorConfig, StepStatus};
pub use template::VarContext;
pub use workflow::model::{Module, Step, Workflow};
pub use workflow::parser::{load_document, parse_module};
pub use workflow::validator::{validate_full, validate_full_module};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "meow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "meow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("test").with_command("echo test");
        assert_eq!(step.id, "test");
        assert_eq!(step.command_text(), Some("echo test"));
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new("empty");
        assert!(workflow.is_empty());
        assert!(!validate_full(&workflow).is_valid());
    }

    #[test]
    fn test_end_to_end_bake() {
        let module = parse_module(
            r#"
[main]
[main.variables]
name = { default = "world" }

[[main.steps]]
id = "greet"
executor = "shell"
command = "echo hello {{name}}"
"#,
        )
        .unwrap();
        assert!(validate_full_module(&module).is_valid());

        let steps = Baker::new("run")
            .bake_workflow(module.entry().unwrap(), &Default::default())
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);
        match &steps[0].config {
            ExecutorConfig::Shell(shell) => assert_eq!(shell.command, "echo hello world"),
            other => panic!("unexpected config: {:?}", other),
        }
    }
}
