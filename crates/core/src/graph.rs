//! Read-only lookup of targets by label

use crate::label::BuildLabel;
use crate::target::BuildTarget;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The set of known targets.
///
/// Backends only read from the graph; the scheduler owns insertion and
/// applies build outcomes to its own copies of the targets.
#[derive(Debug, Default)]
pub struct BuildGraph {
    targets: RwLock<HashMap<BuildLabel, Arc<BuildTarget>>>,
}

impl BuildGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a target
    pub fn add_target(&self, target: BuildTarget) {
        let mut targets = self
            .targets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        targets.insert(target.label.clone(), Arc::new(target));
    }

    /// Look up a target by label
    #[must_use]
    pub fn target(&self, label: &BuildLabel) -> Option<Arc<BuildTarget>> {
        let targets = self
            .targets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        targets.get(label).cloned()
    }

    /// Number of targets in the graph
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let graph = BuildGraph::new();
        assert!(graph.is_empty());

        let label = BuildLabel::new("package", "tool");
        let mut tool = BuildTarget::new(label.clone());
        tool.add_output("bin");
        graph.add_target(tool);

        let found = graph.target(&label).unwrap();
        assert_eq!(found.outputs(), ["bin"]);
        assert!(graph.target(&BuildLabel::new("package", "other")).is_none());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_add_replaces_existing() {
        let graph = BuildGraph::new();
        let label = BuildLabel::new("package", "t");
        graph.add_target(BuildTarget::new(label.clone()));

        let mut updated = BuildTarget::new(label.clone());
        updated.add_output("new.txt");
        graph.add_target(updated);

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.target(&label).unwrap().outputs(), ["new.txt"]);
    }
}
