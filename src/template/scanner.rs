//! Placeholder Scanner
//!
//! Finds `{{ path }}` references inside arbitrary strings. The scanner does
//! not interpret paths; resolution lives in [`super::context`].

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches `{{ path }}` where the path contains no braces.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("placeholder pattern is valid"));

/// One `{{ ... }}` occurrence in a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Byte range of the whole placeholder, braces included
    pub span: Range<usize>,
    /// Path with surrounding whitespace trimmed
    pub path: String,
}

impl Placeholder {
    /// Root segment of the dotted path (`a` for `a.b.c`).
    pub fn root(&self) -> &str {
        self.path.split('.').next().unwrap_or_default()
    }
}

/// Returns every placeholder in `text`, in order of appearance.
///
/// Placeholders whose path is empty after trimming are skipped.
///
/// # Example
///
/// ```
/// use meow::template::scanner::scan;
///
/// let found = scan("Using {{ framework }} in {{workdir}}");
/// assert_eq!(found.len(), 2);
/// assert_eq!(found[0].path, "framework");
/// ```
pub fn scan(text: &str) -> Vec<Placeholder> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let path = cap.get(1)?.as_str().trim();
            if path.is_empty() {
                return None;
            }
            Some(Placeholder {
                span: whole.range(),
                path: path.to_string(),
            })
        })
        .collect()
}

/// Cheap check for whether `text` contains any placeholder.
pub fn has_placeholders(text: &str) -> bool {
    text.contains("{{") && !scan(text).is_empty()
}

/// Returns true for paths that name another step's outputs
/// (`id.outputs.field` or `output.id.field`).
pub fn is_output_reference(path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        ["output", _, ..] => true,
        [_, "outputs", ..] => true,
        _ => false,
    }
}
