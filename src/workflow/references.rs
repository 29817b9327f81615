//! Cross-File Reference Tracking
//!
//! Detects circular references when one workflow document pulls in a
//! workflow defined in another file, which may in turn reference others.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use log::debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("circular workflow reference: {}", .chain.join(" → "))]
    Circular { chain: Vec<String> },
}

/// Normalizes `file` lexically (drops `.`, folds `..`) and joins it with the
/// workflow name as `file#workflow`.
pub fn reference_key(file: impl AsRef<Path>, workflow: &str) -> String {
    format!("{}#{}", normalize(file.as_ref()).display(), workflow)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(out.components().next_back(), None | Some(Component::ParentDir));
                if at_root && !out.has_root() {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The chain of `file#workflow` references currently being loaded.
#[derive(Debug, Default, Clone)]
pub struct ReferenceTracker {
    in_progress: HashSet<String>,
    stack: Vec<String>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a reference as being loaded.
    ///
    /// Fails if the same reference is already in progress further up the
    /// chain; the error carries the chain closed back onto itself.
    pub fn enter(&mut self, file: impl AsRef<Path>, workflow: &str) -> Result<(), ReferenceError> {
        let key = reference_key(file, workflow);

        if self.in_progress.contains(&key) {
            let start = self.stack.iter().position(|k| *k == key).unwrap_or(0);
            let mut chain: Vec<String> = self.stack[start..].to_vec();
            chain.push(key);
            return Err(ReferenceError::Circular { chain });
        }

        debug!("Entering reference {} (depth {})", key, self.stack.len() + 1);
        self.in_progress.insert(key.clone());
        self.stack.push(key);
        Ok(())
    }

    /// Finishes the most recently entered reference.
    pub fn exit(&mut self) -> Option<String> {
        let key = self.stack.pop()?;
        self.in_progress.remove(&key);
        Some(key)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn chain(&self) -> &[String] {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_key_normalizes() {
        assert_eq!(reference_key("a/./b/../c.toml", "main"), "a/c.toml#main");
        assert_eq!(reference_key("../x.toml", "w"), "../x.toml#w");
        assert_eq!(reference_key("/root/../etc/w.toml", "main"), "/etc/w.toml#main");
        assert_eq!(
            reference_key("dir/w.toml", "main"),
            reference_key("dir/sub/../w.toml", "main")
        );
    }

    #[test]
    fn test_enter_exit() {
        let mut tracker = ReferenceTracker::new();
        tracker.enter("a.toml", "main").unwrap();
        tracker.enter("b.toml", "main").unwrap();
        assert_eq!(tracker.depth(), 2);
        assert!(tracker.enter("./a.toml", "main").is_err());

        assert_eq!(tracker.exit().as_deref(), Some("b.toml#main"));
        assert_eq!(tracker.chain(), &["a.toml#main".to_string()]);

        // Re-entering after exit is fine
        tracker.enter("b.toml", "main").unwrap();
        assert_eq!(tracker.depth(), 2);
    }

    #[test]
    fn test_same_file_different_workflow_is_not_circular() {
        let mut tracker = ReferenceTracker::new();
        tracker.enter("a.toml", "main").unwrap();
        assert!(tracker.enter("a.toml", "helper").is_ok());
    }

    #[test]
    fn test_circular_reference_reports_chain() {
        let mut tracker = ReferenceTracker::new();
        tracker.enter("root.toml", "main").unwrap();
        tracker.enter("a.toml", "main").unwrap();
        tracker.enter("b.toml", "main").unwrap();

        let err = tracker.enter("./a.toml", "main").unwrap_err();
        let ReferenceError::Circular { chain } = &err;
        assert_eq!(chain, &["a.toml#main", "b.toml#main", "a.toml#main"]);
        assert_eq!(
            err.to_string(),
            "circular workflow reference: a.toml#main → b.toml#main → a.toml#main"
        );
        // Failed enter leaves the stack untouched
        assert_eq!(tracker.depth(), 3);
    }

    #[test]
    fn test_exit_on_empty() {
        assert!(ReferenceTracker::new().exit().is_none());
    }
}
