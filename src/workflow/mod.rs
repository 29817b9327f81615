//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating declarative workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow, Module)
//! - [`parser`]: TOML parsing for both document shapes
//! - [`graph`]: Dependency graph, cycle finding and ordering
//! - [`validator`]: Validation rules and dependency checking
//! - [`references`]: Circular cross-file reference detection
//! - [`loader`]: Locating documents by name

pub mod graph;
pub mod loader;
pub mod model;
pub mod parser;
pub mod references;
pub mod validator;

pub use graph::DependencyGraph;
pub use loader::{EmbeddedTemplates, LoadError, Reference, ResourceProvider, TemplateLoader};
pub use model::{
    Classification, ExecutorKind, ExpansionTarget, FlexValue, LegacyType, Module, OutputSpec,
    Step, Var, VarType, Workflow,
};
pub use parser::{load_document, parse_document, parse_module, Document, ParseError};
pub use references::{ReferenceError, ReferenceTracker};
pub use validator::{
    validate_full, validate_full_module, ValidationError, ValidationResult, BUILTIN_VARIABLES,
};
