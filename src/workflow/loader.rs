//! Template Loader
//!
//! Locates workflow documents by name. Search order:
//!
//! 1. `<project>/.meow/templates/<name>.meow.toml`
//! 2. `<user config dir>/meow/templates/<name>.meow.toml`
//! 3. The [`ResourceProvider`] passed in at construction (bundled documents)
//!
//! References between documents take three forms: `name` (the document's
//! entry workflow), `name#workflow`, and `.workflow` (a sibling in the
//! referencing document).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use super::model::{Module, Step, Workflow};
use super::parser::{parse_module, ParseError};
use super::references::{ReferenceError, ReferenceTracker};
use crate::template::has_placeholders;

/// File suffix of workflow documents.
pub const TEMPLATE_EXTENSION: &str = ".meow.toml";

/// Source of bundled workflow documents, keyed by template name.
pub trait ResourceProvider {
    fn get(&self, name: &str) -> Option<String>;
}

/// In-memory documents, for bundling and for tests.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedTemplates {
    documents: BTreeMap<String, String>,
}

impl EmbeddedTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.documents.insert(name.into(), text.into());
    }

    pub fn names(&self) -> Vec<&str> {
        self.documents.keys().map(String::as_str).collect()
    }
}

impl ResourceProvider for EmbeddedTemplates {
    fn get(&self, name: &str) -> Option<String> {
        self.documents.get(name).cloned()
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("template '{name}' not found (searched: {})", .searched.join(", "))]
    NotFound { name: String, searched: Vec<String> },

    #[error("failed to read template '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template '{name}' could not be parsed: {source}")]
    Parse {
        name: String,
        #[source]
        source: ParseError,
    },

    #[error("template '{file}' has no workflow '{workflow}' (available: {})", .available.join(", "))]
    MissingWorkflow {
        file: String,
        workflow: String,
        available: Vec<String>,
    },

    #[error("workflow '{file}#{workflow}' is internal and cannot be referenced from outside its file")]
    Internal { file: String, workflow: String },

    #[error("local reference '{0}' has no enclosing document")]
    DanglingLocal(String),

    #[error(transparent)]
    Circular(#[from] ReferenceError),
}

/// A parsed workflow reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `.workflow`
    Local(String),
    /// `name` or `name#workflow`
    External {
        file: String,
        workflow: Option<String>,
    },
}

impl Reference {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(local) = text.strip_prefix('.') {
            return Reference::Local(local.to_string());
        }
        match text.split_once('#') {
            Some((file, workflow)) => Reference::External {
                file: file.to_string(),
                workflow: Some(workflow.to_string()),
            },
            None => Reference::External {
                file: text.to_string(),
                workflow: None,
            },
        }
    }
}

/// Documents loaded while following references from a root template.
#[derive(Debug, Clone, Default)]
pub struct TemplateTree {
    pub root: String,
    pub modules: BTreeMap<String, Module>,
}

impl TemplateTree {
    pub fn root_module(&self) -> Option<&Module> {
        self.modules.get(&self.root)
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }
}

/// Finds and parses workflow documents.
pub struct TemplateLoader {
    project_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    provider: Box<dyn ResourceProvider>,
}

impl TemplateLoader {
    /// Creates a loader rooted at `project_root`, using the platform's
    /// user configuration directory for the second tier.
    pub fn new(project_root: impl AsRef<Path>, provider: impl ResourceProvider + 'static) -> Self {
        Self {
            project_dir: Some(project_root.as_ref().join(".meow").join("templates")),
            user_dir: dirs::config_dir().map(|dir| dir.join("meow").join("templates")),
            provider: Box::new(provider),
        }
    }

    /// Overrides the user-level template directory.
    pub fn with_user_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.user_dir = dir;
        self
    }

    fn file_name(name: &str) -> String {
        format!("{}{}", name, TEMPLATE_EXTENSION)
    }

    /// Candidate file paths for `name`, in search order.
    pub fn search_paths(&self, name: &str) -> Vec<PathBuf> {
        let file = Self::file_name(name);
        self.project_dir
            .iter()
            .chain(self.user_dir.iter())
            .map(|dir| dir.join(&file))
            .collect()
    }

    /// Loads the document `name` from the first tier that has it.
    pub fn load(&self, name: &str) -> Result<Module, LoadError> {
        let mut searched = Vec::new();

        for path in self.search_paths(name) {
            if path.is_file() {
                info!("Loading template '{}' from {}", name, path.display());
                let text = fs::read_to_string(&path).map_err(|source| LoadError::Io {
                    name: name.to_string(),
                    source,
                })?;
                let mut module = self.parse(name, &text)?;
                module.path = Some(path);
                return Ok(module);
            }
            searched.push(path.display().to_string());
        }

        if let Some(text) = self.provider.get(name) {
            info!("Loading embedded template '{}'", name);
            return self.parse(name, &text);
        }
        searched.push(format!("embedded:{}", name));

        Err(LoadError::NotFound {
            name: name.to_string(),
            searched,
        })
    }

    fn parse(&self, name: &str, text: &str) -> Result<Module, LoadError> {
        parse_module(text).map_err(|source| LoadError::Parse {
            name: name.to_string(),
            source,
        })
    }

    /// Loads `reference` and every document reachable from it through
    /// template references, failing on circular references.
    ///
    /// References containing placeholders are left for bake time.
    pub fn load_tree(&self, reference: &str) -> Result<TemplateTree, LoadError> {
        let (file, workflow) = match Reference::parse(reference) {
            Reference::Local(_) => return Err(LoadError::DanglingLocal(reference.to_string())),
            Reference::External { file, workflow } => (file, workflow),
        };

        let mut tree = TemplateTree {
            root: file.clone(),
            modules: BTreeMap::new(),
        };
        let mut tracker = ReferenceTracker::new();
        self.walk(&file, workflow.as_deref(), None, &mut tracker, &mut tree)?;

        debug!("Loaded {} document(s) for '{}'", tree.modules.len(), reference);
        Ok(tree)
    }

    /// Like [`load_tree`](Self::load_tree), rooted at an already parsed
    /// document (for example one read from an explicit path) registered
    /// under `name`.
    pub fn load_tree_from(
        &self,
        name: &str,
        module: Module,
        workflow: Option<&str>,
    ) -> Result<TemplateTree, LoadError> {
        let mut tree = TemplateTree {
            root: name.to_string(),
            modules: BTreeMap::new(),
        };
        tree.modules.insert(name.to_string(), module);
        let mut tracker = ReferenceTracker::new();
        self.walk(name, workflow, None, &mut tracker, &mut tree)?;

        debug!("Loaded {} document(s) from root '{}'", tree.modules.len(), name);
        Ok(tree)
    }

    fn walk(
        &self,
        file: &str,
        workflow: Option<&str>,
        from: Option<&str>,
        tracker: &mut ReferenceTracker,
        tree: &mut TemplateTree,
    ) -> Result<(), LoadError> {
        if !tree.modules.contains_key(file) {
            let module = self.load(file)?;
            tree.modules.insert(file.to_string(), module);
        }
        let Some(module) = tree.modules.get(file) else {
            return Ok(());
        };

        let (key, selected) = select_workflow(module, file, workflow)?;
        if selected.internal && from != Some(file) {
            return Err(LoadError::Internal {
                file: file.to_string(),
                workflow: key,
            });
        }
        let references = template_references(&selected.steps);

        tracker.enter(file, &key)?;
        for reference in references {
            match Reference::parse(&reference) {
                Reference::Local(name) => {
                    self.walk(file, Some(&name), Some(file), tracker, tree)?;
                }
                Reference::External { file: next, workflow } => {
                    self.walk(&next, workflow.as_deref(), Some(file), tracker, tree)?;
                }
            }
        }
        tracker.exit();
        Ok(())
    }
}

fn select_workflow<'m>(
    module: &'m Module,
    file: &str,
    workflow: Option<&str>,
) -> Result<(String, &'m Workflow), LoadError> {
    let found = match workflow {
        Some(name) => module.workflows.get_key_value(name),
        None => module
            .workflows
            .get_key_value(Module::DEFAULT_WORKFLOW)
            .or_else(|| {
                if module.len() == 1 {
                    module.workflows.iter().next()
                } else {
                    None
                }
            }),
    };

    found
        .map(|(key, wf)| (key.clone(), wf))
        .ok_or_else(|| LoadError::MissingWorkflow {
            file: file.to_string(),
            workflow: workflow.unwrap_or(Module::DEFAULT_WORKFLOW).to_string(),
            available: module.names().into_iter().map(String::from).collect(),
        })
}

/// Static template references of a batch of steps, including inline
/// target steps, in declaration order.
fn template_references(steps: &[Step]) -> Vec<String> {
    let mut references = Vec::new();
    for step in steps {
        let targets = step.targets();
        let templates = step
            .template
            .iter()
            .chain(targets.iter().filter_map(|(_, t)| t.template.as_ref()));
        for template in templates {
            if !has_placeholders(template) && !references.contains(template) {
                references.push(template.clone());
            }
        }
        for (_, target) in targets {
            for nested in template_references(&target.inline) {
                if !references.contains(&nested) {
                    references.push(nested);
                }
            }
        }
    }
    references
}
