//! Variable Resolution Engine
//!
//! [`VarContext`] resolves `{{path}}` placeholders against three layers:
//! user variables, builtins provided by the baker, and the outputs of other
//! steps. Resolution is recursive (bounded), and can defer references that
//! cannot be known yet, such as outputs of steps that have not run.
//!
//! One context belongs to one bake operation. It is mutated as baking
//! proceeds and is not meant to be shared between concurrent bakes.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, trace};
use serde_json::{Map, Value};
use thiserror::Error;

use super::scanner::scan;
use crate::bake::StepStatus;
use crate::workflow::model::Var;

/// Maximum number of substitution rounds before giving up on a chain.
pub const MAX_SUBSTITUTION_DEPTH: usize = 10;

/// Errors raised while resolving placeholders.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("unknown field '{field}' while resolving '{path}'")]
    UnknownField { path: String, field: String },

    #[error("step '{step}' has no output '{field}' (available: {available})")]
    UnknownOutputField {
        step: String,
        field: String,
        available: String,
    },

    #[error("outputs of step '{0}' are not available")]
    StepOutputsUnavailable(String),

    #[error("step '{step}' is not done yet (status: {status})")]
    StepNotDone { step: String, status: StepStatus },

    #[error("unresolved after max depth ({depth} rounds): {remaining}")]
    UnresolvedAfterMaxDepth { depth: usize, remaining: String },

    #[error("missing required variables: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

/// Status and outputs of a step, as reported by an output lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    pub status: StepStatus,
    pub outputs: Map<String, Value>,
}

impl StepSnapshot {
    /// Snapshot of a finished step.
    pub fn done(outputs: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Done,
            outputs,
        }
    }
}

/// Callback used to fetch another step's outputs on demand.
pub type OutputLookup = Box<dyn Fn(&str) -> Option<StepSnapshot>>;

/// Source of the current time for `timestamp`, `date` and `time`.
pub type Clock = Box<dyn Fn() -> DateTime<Utc>>;

/// Outcome of resolving a single path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Value(Value),
    /// Left for execution time (deferred mode only)
    Deferred,
}

/// Runtime state of placeholder resolution for one bake.
pub struct VarContext {
    vars: HashMap<String, Value>,
    builtins: HashMap<String, Value>,
    outputs: HashMap<String, Map<String, Value>>,
    lookup: Option<OutputLookup>,
    deferred: bool,
    /// Roots bound only at expansion time, always kept verbatim
    late: HashSet<String>,
    clock: Clock,
}

impl VarContext {
    /// Creates an empty context with the system clock and deferral off.
    pub fn new() -> Self {
        Self {
            vars: HashMap::new(),
            builtins: HashMap::new(),
            outputs: HashMap::new(),
            lookup: None,
            deferred: false,
            late: HashSet::new(),
            clock: Box::new(Utc::now),
        }
    }

    /// Binds a user variable, replacing any previous value.
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Binds a builtin. User variables shadow builtins of the same name.
    pub fn set_builtin(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.builtins.insert(name.into(), value.into());
    }

    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    pub fn remove_builtin(&mut self, name: &str) -> Option<Value> {
        self.builtins.remove(name)
    }

    /// Seeds the output cache for a step.
    pub fn set_step_outputs(&mut self, step_id: impl Into<String>, outputs: Map<String, Value>) {
        self.outputs.insert(step_id.into(), outputs);
    }

    /// Installs the callback used for outputs missing from the cache.
    ///
    /// The callback is invoked synchronously; any timeout or cancellation
    /// policy belongs to the callback itself.
    pub fn set_output_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<StepSnapshot> + 'static,
    {
        self.lookup = Some(Box::new(lookup));
    }

    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Keeps placeholders rooted at `name` verbatim until
    /// [`unbind_late`](Self::unbind_late), whatever the deferred mode.
    pub fn bind_late(&mut self, name: impl Into<String>) {
        self.late.insert(name.into());
    }

    pub fn unbind_late(&mut self, name: &str) {
        self.late.remove(name);
    }

    /// Drops variables, builtins, cached outputs and late-bound roots.
    ///
    /// The output lookup, deferred flag and clock are kept.
    pub fn reset(&mut self) {
        self.vars.clear();
        self.builtins.clear();
        self.outputs.clear();
        self.late.clear();
    }

    /// Replaces the clock used for `timestamp`, `date` and `time`.
    pub fn set_clock<F>(&mut self, clock: F)
    where
        F: Fn() -> DateTime<Utc> + 'static,
    {
        self.clock = Box::new(clock);
    }

    /// Substitutes every placeholder in `text`, recursively.
    ///
    /// Values that themselves contain placeholders are substituted again, up
    /// to [`MAX_SUBSTITUTION_DEPTH`] rounds. Text without placeholders is
    /// returned unchanged. In deferred mode, references that cannot be
    /// resolved yet are kept verbatim, and leftovers after the bound are
    /// tolerated.
    pub fn substitute(&mut self, text: &str) -> Result<String, TemplateError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let mut current = text.to_string();
        for round in 0..MAX_SUBSTITUTION_DEPTH {
            let (next, changed) = self.substitute_pass(&current, false)?;
            current = next;
            if !changed {
                trace!("Substitution settled after {} rounds", round + 1);
                return Ok(current);
            }
        }

        let remaining = scan(&current);
        if remaining.is_empty() || self.deferred {
            return Ok(current);
        }

        Err(TemplateError::UnresolvedAfterMaxDepth {
            depth: MAX_SUBSTITUTION_DEPTH,
            remaining: remaining
                .iter()
                .map(|p| p.path.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Single-pass substitution with every value single-quoted for the shell.
    ///
    /// Embedded single quotes become `'"'"'`. Deferred placeholders are left
    /// verbatim and unquoted.
    pub fn substitute_shell(&mut self, text: &str) -> Result<String, TemplateError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        let (result, _) = self.substitute_pass(text, true)?;
        Ok(result)
    }

    fn substitute_pass(&mut self, text: &str, quote: bool) -> Result<(String, bool), TemplateError> {
        let placeholders = scan(text);
        if placeholders.is_empty() {
            return Ok((text.to_string(), false));
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut changed = false;

        for placeholder in placeholders {
            out.push_str(&text[last..placeholder.span.start]);
            match self.resolve(&placeholder.path)? {
                Resolution::Value(value) => {
                    let rendered = render_value(&value);
                    if quote {
                        out.push_str(&shell_quote(&rendered));
                    } else {
                        out.push_str(&rendered);
                    }
                    changed = true;
                }
                Resolution::Deferred => out.push_str(&text[placeholder.span.clone()]),
            }
            last = placeholder.span.end;
        }
        out.push_str(&text[last..]);

        Ok((out, changed))
    }

    /// Resolves a dotted path to a value.
    pub fn resolve(&mut self, path: &str) -> Result<Resolution, TemplateError> {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();

        let output_reference = match segments.as_slice() {
            ["output", step, rest @ ..] => Some((*step, rest)),
            [step, "outputs", rest @ ..] => Some((*step, rest)),
            _ => None,
        };
        if let Some((step, rest)) = output_reference {
            return self.resolve_output(path, step, rest);
        }

        let root = segments[0];
        if self.late.contains(root) {
            return Ok(Resolution::Deferred);
        }
        if let Some(value) = self.vars.get(root).or_else(|| self.builtins.get(root)) {
            return walk(path, value, &segments[1..]).map(Resolution::Value);
        }

        if segments.len() == 1 {
            let now = (self.clock)();
            let computed = match root {
                "timestamp" => Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
                "date" => Some(now.format("%Y-%m-%d").to_string()),
                "time" => Some(now.format("%H:%M:%S").to_string()),
                _ => None,
            };
            if let Some(value) = computed {
                return Ok(Resolution::Value(Value::String(value)));
            }
        }

        Err(TemplateError::UndefinedVariable(path.to_string()))
    }

    fn resolve_output(
        &mut self,
        path: &str,
        step: &str,
        rest: &[&str],
    ) -> Result<Resolution, TemplateError> {
        if !self.outputs.contains_key(step) {
            let snapshot = self.lookup.as_ref().and_then(|lookup| lookup(step));
            match snapshot {
                Some(snapshot) if snapshot.status == StepStatus::Done => {
                    debug!("Caching outputs of step '{}'", step);
                    self.outputs.insert(step.to_string(), snapshot.outputs);
                }
                Some(snapshot) => {
                    if self.deferred {
                        return Ok(Resolution::Deferred);
                    }
                    return Err(TemplateError::StepNotDone {
                        step: step.to_string(),
                        status: snapshot.status,
                    });
                }
                None => {
                    if self.deferred {
                        return Ok(Resolution::Deferred);
                    }
                    return Err(TemplateError::StepOutputsUnavailable(step.to_string()));
                }
            }
        }

        let outputs = &self.outputs[step];
        let Some((field, deeper)) = rest.split_first() else {
            return Ok(Resolution::Value(Value::Object(outputs.clone())));
        };

        let value = outputs.get(*field).ok_or_else(|| {
            let mut available: Vec<&str> = outputs.keys().map(String::as_str).collect();
            available.sort_unstable();
            TemplateError::UnknownOutputField {
                step: step.to_string(),
                field: field.to_string(),
                available: available.join(", "),
            }
        })?;

        walk(path, value, deeper).map(Resolution::Value)
    }

    /// Fills every unset variable that declares a default.
    pub fn apply_defaults(&mut self, declared: &BTreeMap<String, Var>) {
        for (name, var) in declared {
            if self.vars.contains_key(name) {
                continue;
            }
            if let Some(default) = &var.default {
                debug!("Variable '{}' defaults to {}", name, default);
                self.vars.insert(name.clone(), default.clone());
            }
        }
    }

    /// Reports, in one error, every required variable that is still unset.
    ///
    /// A variable with a default is never missing.
    pub fn validate_required(&self, declared: &BTreeMap<String, Var>) -> Result<(), TemplateError> {
        let missing: Vec<String> = declared
            .iter()
            .filter(|(name, var)| {
                var.required && var.default.is_none() && !self.vars.contains_key(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::MissingRequired(missing))
        }
    }
}

impl Default for VarContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Follows `segments` through nested objects.
fn walk(path: &str, value: &Value, segments: &[&str]) -> Result<Value, TemplateError> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment),
            _ => None,
        }
        .ok_or_else(|| TemplateError::UnknownField {
            path: path.to_string(),
            field: segment.to_string(),
        })?;
    }
    Ok(current.clone())
}

/// Formats a resolved value as substitution text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Wraps `value` in single quotes for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}
