//! Workflow Parser
//!
//! Handles loading and parsing workflow documents from TOML. Two shapes are
//! recognized:
//!
//! - **Legacy**: a single workflow with a top-level `[meta]` table,
//!   `[variables.*]` tables and a `[[steps]]` array.
//! - **Module**: one or more named top-level tables, each with a `steps`
//!   array, plus per-workflow `internal` / `ephemeral` / `hooks_to` flags.
//!
//! Parsing never validates; see [`super::validator`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use super::model::{Module, Step, Var, Workflow};

/// Errors raised while reading or decoding a document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read workflow file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workflow document: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("workflow '{name}' is malformed: {source}")]
    Workflow {
        name: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("document contains no workflows (expected [meta] or a table with a `steps` array)")]
    NoWorkflows,
}

/// A parsed document, in whichever shape it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Legacy(Workflow),
    Module(Module),
}

impl Document {
    /// Converts to a module; a legacy workflow becomes the `main` workflow.
    pub fn into_module(self) -> Module {
        match self {
            Document::Legacy(workflow) => Module::single(workflow),
            Document::Module(module) => module,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Document::Legacy(_))
    }
}

#[derive(Deserialize)]
struct LegacyDocument {
    meta: LegacyMeta,
    #[serde(default)]
    variables: BTreeMap<String, Var>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct LegacyMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    ephemeral: bool,
}

/// Parses a document, detecting its shape.
///
/// # Example
///
/// ```
/// use meow::workflow::parser::{parse_document, Document};
///
/// let doc = parse_document(r#"
/// [meta]
/// name = "hello"
///
/// [[steps]]
/// id = "greet"
/// type = "code"
/// code = "echo hello"
/// "#).unwrap();
/// assert!(matches!(doc, Document::Legacy(_)));
/// ```
pub fn parse_document(text: &str) -> Result<Document, ParseError> {
    let table: toml::Table = toml::from_str(text)?;

    if table.contains_key("meta") {
        let legacy: LegacyDocument = toml::Value::Table(table).try_into()?;
        debug!(
            "Parsed legacy workflow '{}' (version {})",
            legacy.meta.name,
            legacy.meta.version.as_deref().unwrap_or("unversioned")
        );
        return Ok(Document::Legacy(Workflow {
            name: legacy.meta.name,
            description: legacy.meta.description,
            variables: legacy.variables,
            steps: legacy.steps,
            ephemeral: legacy.meta.ephemeral,
            internal: false,
            hooks_to: None,
        }));
    }

    let mut module = Module::new();
    for (key, value) in table {
        let is_workflow = value
            .as_table()
            .and_then(|t| t.get("steps"))
            .map(|steps| steps.is_array())
            .unwrap_or(false);

        if !is_workflow {
            debug!("Ignoring top-level key '{}' (not a workflow table)", key);
            continue;
        }

        let mut workflow: Workflow = value.try_into().map_err(|source| ParseError::Workflow {
            name: key.clone(),
            source,
        })?;
        if workflow.name.trim().is_empty() {
            workflow.name = key.clone();
        }
        module.insert(key, workflow);
    }

    if module.is_empty() {
        return Err(ParseError::NoWorkflows);
    }

    debug!("Parsed module with workflows: {:?}", module.names());
    Ok(Document::Module(module))
}

/// Parses a document of either shape into a [`Module`].
pub fn parse_module(text: &str) -> Result<Module, ParseError> {
    parse_document(text).map(Document::into_module)
}

/// Loads a workflow document from a file.
///
/// The returned module remembers its path, which the loader uses to key
/// cross-file references.
pub fn load_document(path: impl AsRef<Path>) -> Result<Module, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow document from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Document content loaded ({} bytes)", content.len());

    let mut module = parse_module(&content)?;
    module.path = Some(path.to_path_buf());

    info!(
        "Parsed {} workflow(s) from {}",
        module.len(),
        path.display()
    );
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{ExecutorKind, FlexValue, VarType};
    use serde_json::json;

    const LEGACY: &str = r#"
[meta]
name = "implement"
description = "Legacy template"
version = "1.2.0"

[variables.framework]
default = "pytest"
description = "Test runner"

[variables.task]
required = true

[[steps]]
id = "write"
type = "task"
title = "Write the code"
instructions = "Implement {{task}}"
assignee = "worker"

[[steps]]
id = "verify"
type = "code"
code = "{{framework}} -q"
needs = ["write"]

[[steps]]
id = "approve"
type = "gate"
instructions = "Approve the change"
needs = "verify"
"#;

    const MODULE: &str = r#"
version = "2"

[main]
description = "Entry point"
ephemeral = true

[main.variables]
target = { required = true, type = "string" }
count = { default = 3, type = "int" }
level = { default = "low", enum = ["low", "high"] }

[[main.steps]]
id = "build"
executor = "shell"
command = "make {{target}}"
env = { CC = "clang" }

[[main.steps]]
id = "each"
executor = "foreach"
items = "{{targets}}"
template = ".per_target"
parallel = "{{par}}"
max_concurrent = 2
needs = ["build"]

[[main.steps]]
id = "check"
executor = "branch"
condition = "test -f out"
needs = ["each"]

[main.steps.on_true]
template = ".per_target"
variables = { target = "all" }

[[main.steps.on_false.inline]]
id = "fix"
executor = "agent"
prompt = "Fix the build"

[per_target]
internal = true
hooks_to = "main"

[[per_target.steps]]
id = "run"
executor = "shell"
command = "run {{target}}"
"#;

    #[test]
    fn test_parse_legacy_shape() {
        let doc = parse_document(LEGACY).unwrap();
        assert!(doc.is_legacy());

        let Document::Legacy(workflow) = doc else {
            panic!("expected legacy document");
        };
        assert_eq!(workflow.name, "implement");
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.variables["framework"].default, Some(json!("pytest")));
        assert!(workflow.variables["task"].required);

        let verify = workflow.get_step("verify").unwrap();
        assert_eq!(verify.command_text(), Some("{{framework}} -q"));
        assert_eq!(verify.classify().unwrap().executor, ExecutorKind::Shell);

        let approve = workflow.get_step("approve").unwrap();
        assert_eq!(approve.needs, vec!["verify"]);
        assert!(approve.classify().unwrap().gate);
    }

    #[test]
    fn test_parse_module_shape() {
        let module = parse_module(MODULE).unwrap();
        assert_eq!(module.names(), vec!["main", "per_target"]);

        let main = module.entry().unwrap();
        assert_eq!(main.name, "main");
        assert!(main.ephemeral);
        assert!(!main.internal);
        assert_eq!(main.variables["target"].var_type, Some(VarType::String));
        assert_eq!(main.variables["count"].default, Some(json!(3)));
        assert_eq!(
            main.variables["level"].allowed,
            Some(vec!["low".to_string(), "high".to_string()])
        );

        let build = main.get_step("build").unwrap();
        assert_eq!(build.env["CC"], "clang");

        let each = main.get_step("each").unwrap();
        assert_eq!(each.parallel, Some(FlexValue::Text("{{par}}".to_string())));
        assert_eq!(each.max_concurrent, Some(FlexValue::Int(2)));

        let check = main.get_step("check").unwrap();
        let on_true = check.on_true.as_ref().unwrap();
        assert_eq!(on_true.template.as_deref(), Some(".per_target"));
        assert_eq!(on_true.variables["target"], json!("all"));
        let on_false = check.on_false.as_ref().unwrap();
        assert_eq!(on_false.inline.len(), 1);
        assert_eq!(on_false.inline[0].id, "fix");

        let helper = module.get("per_target").unwrap();
        assert!(helper.internal);
        assert_eq!(helper.hooks_to.as_deref(), Some("main"));
    }

    #[test]
    fn test_legacy_into_module() {
        let module = parse_module(LEGACY).unwrap();
        assert_eq!(module.names(), vec!["main"]);
        assert_eq!(module.entry().unwrap().name, "implement");
    }

    #[test]
    fn test_parse_invalid_syntax() {
        let err = parse_document("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ParseError::Syntax(_)));
    }

    #[test]
    fn test_parse_no_workflows() {
        let err = parse_document("name = \"x\"\n[settings]\nverbose = true\n").unwrap_err();
        assert!(matches!(err, ParseError::NoWorkflows));
    }

    #[test]
    fn test_parse_malformed_workflow_names_table() {
        let err = parse_document("[main]\nsteps = [{ id = 3 }]\n").unwrap_err();
        match err {
            ParseError::Workflow { name, .. } => assert_eq!(name, "main"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parse_does_not_validate() {
        // Duplicate ids and dangling needs are the validator's job
        let doc = parse_document(
            "[main]\n[[main.steps]]\nid = \"a\"\nneeds = [\"ghost\"]\n[[main.steps]]\nid = \"a\"\n",
        );
        assert!(doc.is_ok());
    }

    #[test]
    fn test_load_document_file_not_found() {
        let err = load_document("/nonexistent/path/workflow.meow.toml").unwrap_err();
        assert!(matches!(err, ParseError::Io { .. }));
    }

    #[test]
    fn test_load_document_records_path() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("legacy.meow.toml");
        std::fs::write(&path, LEGACY).unwrap();

        let module = load_document(&path).unwrap();
        assert_eq!(module.path.as_deref(), Some(path.as_path()));
        assert_eq!(module.entry().unwrap().steps.len(), 3);
    }
}
