//! Outcome of origin and database deletion

use std::path::PathBuf;

use crate::origin::Origin;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDeletion {
    /// File cut to zero bytes; other processes see an invalid database
    Truncated,
    /// No file on disk or no catalog path, nothing to do
    Missing,
    Failed { path: PathBuf, reason: String },
}

impl FileDeletion {
    pub fn is_failure(&self) -> bool {
        matches!(self, FileDeletion::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFileOutcome {
    pub name: String,
    pub outcome: FileDeletion,
}

/// Per-database file results of a delete that succeeded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub origin: Origin,
    pub files: Vec<DatabaseFileOutcome>,
}

impl DeletionReport {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            files: Vec::new(),
        }
    }

    pub fn push(&mut self, name: String, outcome: FileDeletion) {
        self.files.push(DatabaseFileOutcome { name, outcome });
    }

    pub fn failures(&self) -> impl Iterator<Item = &DatabaseFileOutcome> {
        self.files.iter().filter(|f| f.outcome.is_failure())
    }

    /// True when every file was handled.
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}
