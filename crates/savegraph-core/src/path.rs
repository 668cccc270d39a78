//! Structural position of a node inside a saved graph.

use serde::Serialize;
use std::fmt;

/// Where in the input graph a node (or a failure) sits.
///
/// The root segment names the aggregate root's entity; each further segment
/// names the association walked to reach the next level, e.g.
/// `BookStore.books.authors`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SavePath {
    root: &'static str,
    associations: Vec<&'static str>,
}

impl SavePath {
    /// Path of an aggregate root of the given entity type.
    #[must_use]
    pub fn root(entity: &'static str) -> Self {
        Self {
            root: entity,
            associations: Vec::new(),
        }
    }

    /// Path one association deeper.
    #[must_use]
    pub fn child(&self, association: &'static str) -> Self {
        let mut associations = self.associations.clone();
        associations.push(association);
        Self {
            root: self.root,
            associations,
        }
    }

    /// The aggregate root's entity name.
    pub fn root_entity(&self) -> &'static str {
        self.root
    }

    /// Association names from root to this position.
    pub fn associations(&self) -> &[&'static str] {
        &self.associations
    }

    /// Nesting depth (0 for the root).
    pub fn depth(&self) -> usize {
        self.associations.len()
    }

    /// Whether this is the aggregate root.
    pub fn is_root(&self) -> bool {
        self.associations.is_empty()
    }
}

impl fmt::Display for SavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for association in &self.associations {
            write!(f, ".{association}")?;
        }
        Ok(())
    }
}
