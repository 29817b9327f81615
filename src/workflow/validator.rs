//! Workflow Validation
//!
//! Structural and semantic checks over parsed workflows. Validation never
//! stops at the first problem: every finding is collected into a
//! [`ValidationResult`] so authors can fix a document in one pass.
//!
//! Checks performed:
//! - Structure (name, steps present, unique step IDs)
//! - Dependency references, with "did you mean" suggestions
//! - Dependency cycles, reported with the full cycle path
//! - Local workflow references (`.name`) against sibling workflows
//! - Variable references against declared and builtin variables
//! - Executor-specific required fields

use std::collections::HashSet;
use std::fmt;

use log::{debug, info};
use serde::Serialize;

use super::graph::{format_cycle, DependencyGraph};
use super::model::{ExecutorKind, LegacyType, Module, Step, Workflow};
use crate::template::{has_placeholders, is_output_reference, scan};

/// Variables the baker always provides.
pub const BUILTIN_VARIABLES: &[&str] = &[
    "timestamp",
    "date",
    "time",
    "agent",
    "bead_id",
    "step_id",
    "workflow_id",
    "molecule_id",
];

/// Accepted values for an agent step's `mode`.
pub const AGENT_MODES: &[&str] = &["autonomous", "interactive"];

/// A single validation finding with its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub workflow: String,
    pub step: String,
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(workflow: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            step: String::new(),
            field: String::new(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn at_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_suggestion(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut location = Vec::new();
        if !self.workflow.is_empty() {
            location.push(format!("workflow '{}'", self.workflow));
        }
        if !self.step.is_empty() {
            location.push(format!("step '{}'", self.step));
        }
        if !self.field.is_empty() {
            location.push(format!("field '{}'", self.field));
        }

        if location.is_empty() {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "{}: {}", location.join(", "), self.message)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (did you mean '{}'?)", suggestion)?;
        }
        Ok(())
    }
}

/// All findings of one validation run, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when there are no findings.
    pub fn into_result(self) -> Result<(), ValidationResult> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", lines.join("\n"))
    }
}

impl std::error::Error for ValidationResult {}

/// Picks the candidate most similar to `target`.
///
/// Similarity is the length of the common prefix plus the common suffix of
/// what remains. A candidate is only returned when its score exceeds half
/// the length of `target`; ties go to the earliest candidate.
pub fn suggest<'c, I>(target: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'c str>,
{
    let mut best: Option<(&str, usize)> = None;
    for candidate in candidates {
        if candidate == target {
            continue;
        }
        let score = similarity(target, candidate);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((candidate, score));
        }
    }

    let length = target.chars().count();
    best.filter(|(_, score)| 2 * score > length)
        .map(|(candidate, _)| candidate.to_string())
}

fn similarity(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    prefix + suffix
}

/// Validates a standalone workflow.
///
/// Local (`.name`) references cannot be checked without the surrounding
/// module and are skipped.
pub fn validate_full(workflow: &Workflow) -> ValidationResult {
    info!("Validating workflow '{}' with {} steps", workflow.name, workflow.len());
    let scope = Scope::new(workflow, None);
    let mut result = ValidationResult::new();
    validate_workflow(&scope, &mut result);
    log_outcome(&workflow.name, &result);
    result
}

/// Validates every workflow of a module, including references between them.
pub fn validate_full_module(module: &Module) -> ValidationResult {
    let mut result = ValidationResult::new();

    if module.is_empty() {
        result.push(ValidationError::new("", "module has no workflows"));
        return result;
    }

    for (key, workflow) in &module.workflows {
        info!("Validating workflow '{}' with {} steps", key, workflow.len());
        let scope = Scope::new(workflow, Some(module));
        validate_workflow(&scope, &mut result);

        if let Some(hooks_to) = &workflow.hooks_to {
            if module.get(hooks_to).is_none() {
                result.push(
                    ValidationError::new(&workflow.name, format!("hooks_to references unknown workflow '{}'", hooks_to))
                        .at_field("hooks_to")
                        .with_suggestion(suggest(hooks_to, module.names())),
                );
            }
        }
    }

    log_outcome("module", &result);
    result
}

fn log_outcome(name: &str, result: &ValidationResult) {
    if result.is_valid() {
        info!("'{}' validated", name);
    } else {
        info!("'{}' has {} validation error(s)", name, result.len());
    }
}

/// Everything a check needs to know about where it runs.
struct Scope<'a> {
    workflow: &'a Workflow,
    module: Option<&'a Module>,
    /// Declared variables first, then builtins
    known_vars: Vec<&'a str>,
}

impl<'a> Scope<'a> {
    fn new(workflow: &'a Workflow, module: Option<&'a Module>) -> Self {
        let known_vars = workflow
            .variables
            .keys()
            .map(String::as_str)
            .chain(BUILTIN_VARIABLES.iter().copied())
            .collect();
        Self {
            workflow,
            module,
            known_vars,
        }
    }

    fn error(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::new(&self.workflow.name, message)
    }

    /// Sibling workflow named by a `.name` reference, when it can be known.
    fn local_workflow(&self, reference: &str) -> Option<&'a Workflow> {
        let name = reference.strip_prefix('.')?;
        if has_placeholders(reference) {
            return None;
        }
        self.module?.get(name)
    }
}

fn validate_workflow(scope: &Scope, result: &mut ValidationResult) {
    let workflow = scope.workflow;

    if workflow.name.trim().is_empty() {
        result.push(scope.error("workflow has no name").at_field("name"));
    }
    if workflow.steps.is_empty() {
        result.push(scope.error("workflow has no steps").at_field("steps"));
        return;
    }

    check_batch(scope, &workflow.steps, None, &HashSet::new(), result);
}

fn full_id(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        Some(parent) => format!("{}.{}", parent, id),
        None => id.to_string(),
    }
}

/// Checks a list of sibling steps: the workflow's own steps, or the inline
/// steps of a branch target (`prefix` is then the owning step's ID).
fn check_batch(
    scope: &Scope,
    steps: &[Step],
    prefix: Option<&str>,
    outer_ids: &HashSet<String>,
    result: &mut ValidationResult,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            result.push(scope.error("step has empty or whitespace-only ID").at_field("id"));
            continue;
        }
        if !seen.insert(step.id.as_str()) {
            result.push(
                scope
                    .error(format!("duplicate step ID '{}'", step.id))
                    .at_step(full_id(prefix, &step.id))
                    .at_field("id"),
            );
        }
    }

    let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    for step in steps {
        check_needs(scope, step, steps, &seen, prefix, outer_ids, result);
    }

    for cycle in DependencyGraph::from_steps(steps).find_cycles() {
        let at = cycle.first().map(|id| full_id(prefix, id)).unwrap_or_default();
        result.push(
            scope
                .error(format!("dependency cycle: {}", format_cycle(&cycle)))
                .at_step(at)
                .at_field("needs"),
        );
    }

    let mut nested_outer = outer_ids.clone();
    nested_outer.extend(ids.iter().map(|id| full_id(prefix, id)));

    for step in steps {
        let id = full_id(prefix, &step.id);
        result.errors.extend(validate_step(scope, step, &id));
        check_local_references(scope, step, &id, result);
        check_variable_references(scope, step, &id, result);

        for (name, target) in step.targets() {
            if !target.inline.is_empty() {
                debug!("Checking {} inline step(s) of '{}.{}'", target.inline.len(), id, name);
                check_batch(scope, &target.inline, Some(id.as_str()), &nested_outer, result);
            }
        }
    }
}

/// What a `prefix.child` reference may point at.
enum Children {
    /// The subgraph is not known until expansion
    Unknown,
    Known(Vec<String>),
}

fn children_of(scope: &Scope, step: &Step) -> Option<Children> {
    let class = step.classify()?;
    if !class.executor.produces_children() {
        return None;
    }

    let mut known = Vec::new();
    let mut complete = true;

    let templates = step
        .template
        .iter()
        .chain(step.targets().into_iter().filter_map(|(_, t)| t.template.as_ref()));
    for reference in templates {
        match scope.local_workflow(reference) {
            Some(child) => known.extend(child.steps.iter().map(|s| s.id.clone())),
            None => complete = false,
        }
    }
    for (_, target) in step.targets() {
        known.extend(target.inline.iter().map(|s| s.id.clone()));
    }

    if complete {
        Some(Children::Known(known))
    } else {
        Some(Children::Unknown)
    }
}

fn check_needs(
    scope: &Scope,
    step: &Step,
    siblings: &[Step],
    known: &HashSet<&str>,
    prefix: Option<&str>,
    outer_ids: &HashSet<String>,
    result: &mut ValidationResult,
) {
    let id = full_id(prefix, &step.id);

    for need in &step.needs {
        if known.contains(need.as_str()) || outer_ids.contains(need) {
            continue;
        }

        if let Some((parent_id, child)) = need.split_once('.') {
            if let Some(parent) = siblings.iter().find(|s| s.id == parent_id) {
                match children_of(scope, parent) {
                    None => result.push(
                        scope
                            .error(format!(
                                "'{}' references children of '{}', which is not an expand, foreach or branch step",
                                need, parent_id
                            ))
                            .at_step(&id)
                            .at_field("needs"),
                    ),
                    Some(Children::Unknown) => {}
                    Some(Children::Known(_)) if child == "*" => {}
                    Some(Children::Known(children)) => {
                        if !children.iter().any(|c| c == child) {
                            result.push(
                                scope
                                    .error(format!("step '{}' has no child step '{}'", parent_id, child))
                                    .at_step(&id)
                                    .at_field("needs")
                                    .with_suggestion(
                                        suggest(child, children.iter().map(String::as_str))
                                            .map(|c| format!("{}.{}", parent_id, c)),
                                    ),
                            );
                        }
                    }
                }
                continue;
            }
        }

        let candidates = siblings
            .iter()
            .map(|s| s.id.as_str())
            .chain(outer_ids.iter().map(String::as_str));
        result.push(
            scope
                .error(format!("unknown dependency '{}'", need))
                .at_step(&id)
                .at_field("needs")
                .with_suggestion(suggest(need, candidates)),
        );
    }
}

fn check_local_references(scope: &Scope, step: &Step, id: &str, result: &mut ValidationResult) {
    let Some(module) = scope.module else {
        return;
    };

    let references = step
        .template
        .iter()
        .map(|t| ("template".to_string(), t))
        .chain(
            step.targets()
                .into_iter()
                .filter_map(|(name, t)| t.template.as_ref().map(|r| (format!("{}.template", name), r))),
        );

    for (field, reference) in references {
        let Some(name) = reference.strip_prefix('.') else {
            continue;
        };
        if has_placeholders(reference) || module.get(name).is_some() {
            continue;
        }
        result.push(
            scope
                .error(format!("local reference '{}' does not name a workflow in this module", reference))
                .at_step(id)
                .at_field(field)
                .with_suggestion(suggest(name, module.names()).map(|n| format!(".{}", n))),
        );
    }
}

fn check_variable_references(scope: &Scope, step: &Step, id: &str, result: &mut ValidationResult) {
    let mut known: Vec<&str> = scope.known_vars.clone();
    if step.classify().map(|c| c.executor) == Some(ExecutorKind::Foreach) {
        known.push(step.item_var());
        if let Some(index_var) = &step.index_var {
            known.push(index_var.as_str());
        }
    }

    for (field, text) in step.text_fields() {
        for placeholder in scan(text) {
            if is_output_reference(&placeholder.path) {
                continue;
            }
            let root = placeholder.root();
            if known.contains(&root) {
                continue;
            }
            result.push(
                scope
                    .error(format!("undefined variable '{}'", root))
                    .at_step(id)
                    .at_field(field.clone())
                    .with_suggestion(suggest(root, known.iter().copied())),
            );
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Validates a single step's executor-specific fields.
fn validate_step(scope: &Scope, step: &Step, id: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let error = |field: &str, message: String| scope.error(message).at_step(id).at_field(field);

    let Some(class) = step.classify() else {
        if let Some(executor) = &step.executor {
            let names = ExecutorKind::ALL.map(ExecutorKind::as_str);
            errors.push(
                error("executor", format!("unknown executor '{}'", executor))
                    .with_suggestion(suggest(executor, names)),
            );
        } else {
            let raw = step.step_type.as_deref().unwrap_or_default();
            errors.push(
                error("type", format!("unknown step type '{}'", raw))
                    .with_suggestion(suggest(raw, LegacyType::NAMES)),
            );
        }
        return errors;
    };

    match class.executor {
        ExecutorKind::Shell => {
            if is_blank(step.command_text()) {
                errors.push(error("command", "shell step requires a command".to_string()));
            }
        }
        ExecutorKind::Spawn | ExecutorKind::Kill => {
            if is_blank(step.agent_name()) {
                let (field, message) = match class.legacy {
                    Some(LegacyType::Start) | Some(LegacyType::Stop) => {
                        ("assignee", format!("{} step requires an assignee", class.executor))
                    }
                    _ => ("agent", format!("{} step requires an agent", class.executor)),
                };
                errors.push(error(field, message));
            }
        }
        ExecutorKind::Expand => {
            if is_blank(step.template.as_deref()) {
                errors.push(error("template", "expand step requires a template".to_string()));
            }
        }
        ExecutorKind::Foreach => {
            if is_blank(step.template.as_deref()) {
                errors.push(error("template", "foreach step requires a template".to_string()));
            }
            match (&step.items, &step.items_file) {
                (Some(_), Some(_)) => errors.push(error(
                    "items",
                    "items and items_file are mutually exclusive".to_string(),
                )),
                (None, None) => errors.push(error(
                    "items",
                    "foreach step requires items or items_file".to_string(),
                )),
                _ => {}
            }
        }
        ExecutorKind::Branch if class.gate => {
            if is_blank(step.instructions.as_deref()) {
                errors.push(error("instructions", "gate step requires instructions".to_string()));
            }
            if step.agent_name().is_some() {
                errors.push(error("assignee", "gate step must not have an assignee".to_string()));
            }
        }
        ExecutorKind::Branch => {
            if is_blank(step.condition.as_deref()) {
                errors.push(error("condition", "branch step requires a condition".to_string()));
            }
            if step.targets().is_empty() {
                errors.push(error(
                    "on_true",
                    "branch step requires at least one of on_true, on_false or on_timeout".to_string(),
                ));
            }
        }
        ExecutorKind::Agent => {
            if let Some(mode) = &step.mode {
                if !has_placeholders(mode) && !AGENT_MODES.contains(&mode.as_str()) {
                    errors.push(
                        error("mode", format!("unknown agent mode '{}'", mode))
                            .with_suggestion(suggest(mode, AGENT_MODES.iter().copied())),
                    );
                }
            }
        }
    }

    for (name, target) in step.targets() {
        match (&target.template, target.inline.is_empty()) {
            (Some(_), false) => errors.push(error(
                name,
                "target must have either a template or inline steps, not both".to_string(),
            )),
            (None, true) => errors.push(error(
                name,
                "target must have a template or inline steps".to_string(),
            )),
            _ => {}
        }
    }

    errors
}
