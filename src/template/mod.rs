//! Template Substitution Module
//!
//! The `{{path}}` substitution language used in workflow documents.
//!
//! # Structure
//!
//! - [`scanner`]: Finds placeholders in strings
//! - [`context`]: Resolves placeholders against variables, builtins and step outputs

pub mod context;
pub mod scanner;

pub use context::{
    render_value, shell_quote, Resolution, StepSnapshot, TemplateError, VarContext,
    MAX_SUBSTITUTION_DEPTH,
};
pub use scanner::{has_placeholders, is_output_reference, scan, Placeholder};
