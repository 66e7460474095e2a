//! Database detail records

use serde::{Deserialize, Serialize};

use crate::origin::Origin;

/// Catalog details of one named database, plus its current file size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDetails {
    pub name: String,
    pub display_name: String,
    /// Size estimate supplied by the page when the database was opened
    pub expected_usage: u64,
    /// Bytes on disk right now
    pub current_usage: u64,
}

impl DatabaseDetails {
    pub fn new(name: String, display_name: String, expected_usage: u64, current_usage: u64) -> Self {
        Self {
            name,
            display_name,
            expected_usage,
            current_usage,
        }
    }

    /// True for the empty record returned when no catalog row exists.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

/// A database whose creation waits on a quota-increase decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedDatabase {
    pub origin: Origin,
    pub details: DatabaseDetails,
}

impl ProposedDatabase {
    pub fn matches(&self, origin: &Origin, name: &str) -> bool {
        &self.origin == origin && self.details.name == name
    }
}
