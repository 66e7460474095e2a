//! Per-origin disk usage accounting
//!
//! An origin starts being tracked the first time its usage is asked for.
//! After that the tracker feeds database additions and removals in, so the
//! total never needs a full rescan. File sizes are read lazily and cached
//! until a database is marked as modified.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use websql_storage::fs;

use crate::origin::Origin;

#[derive(Debug, Default)]
struct DatabaseUsage {
    path: Option<PathBuf>,
    size: Option<u64>,
}

#[derive(Debug, Default)]
struct OriginUsageRecord {
    databases: HashMap<String, DatabaseUsage>,
    cached_total: Option<u64>,
}

impl OriginUsageRecord {
    fn disk_usage(&mut self) -> u64 {
        if let Some(total) = self.cached_total {
            return total;
        }

        let mut total: u64 = 0;
        for usage in self.databases.values_mut() {
            let size = match usage.size {
                Some(size) => size,
                None => {
                    let size = usage
                        .path
                        .as_deref()
                        .map(fs::database_file_size)
                        .unwrap_or(0);
                    usage.size = Some(size);
                    size
                }
            };
            total = total.saturating_add(size);
        }
        self.cached_total = Some(total);
        total
    }
}

pub struct OriginQuotaManager {
    origins: Mutex<HashMap<Origin, OriginUsageRecord>>,
}

impl OriginQuotaManager {
    pub fn new() -> Self {
        Self {
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Take the manager's lock for a sequence of usage operations.
    pub fn lock(&self) -> QuotaManagerGuard<'_> {
        QuotaManagerGuard {
            origins: self.origins.lock(),
        }
    }
}

impl Default for OriginQuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QuotaManagerGuard<'a> {
    origins: MutexGuard<'a, HashMap<Origin, OriginUsageRecord>>,
}

impl QuotaManagerGuard<'_> {
    pub fn track_origin(&mut self, origin: &Origin) {
        self.origins.entry(origin.clone()).or_default();
    }

    pub fn tracks_origin(&self, origin: &Origin) -> bool {
        self.origins.contains_key(origin)
    }

    pub fn add_database(&mut self, origin: &Origin, name: &str, path: Option<&Path>) {
        let Some(record) = self.origins.get_mut(origin) else {
            debug_assert!(false, "adding database {name} to untracked origin {origin}");
            tracing::warn!(origin = %origin, name = %name, "Origin is not tracked by the quota manager");
            return;
        };

        record.databases.insert(
            name.to_string(),
            DatabaseUsage {
                path: path.map(Path::to_path_buf),
                size: None,
            },
        );
        record.cached_total = None;
    }

    pub fn remove_database(&mut self, origin: &Origin, name: &str) {
        if let Some(record) = self.origins.get_mut(origin) {
            if record.databases.remove(name).is_some() {
                record.cached_total = None;
            }
        }
    }

    pub fn remove_origin(&mut self, origin: &Origin) {
        self.origins.remove(origin);
    }

    /// Forget the cached size of a database that has been written to.
    pub fn mark_database(&mut self, origin: &Origin, name: &str) {
        if let Some(record) = self.origins.get_mut(origin) {
            if let Some(usage) = record.databases.get_mut(name) {
                usage.size = None;
                record.cached_total = None;
            }
        }
    }

    /// Total bytes used by an origin's tracked databases, 0 if untracked.
    pub fn disk_usage(&mut self, origin: &Origin) -> u64 {
        self.origins
            .get_mut(origin)
            .map(OriginUsageRecord::disk_usage)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::new("https", "example.com", None)
    }

    #[test]
    fn test_untracked_origin_has_no_usage() {
        let manager = OriginQuotaManager::new();
        let mut guard = manager.lock();
        assert!(!guard.tracks_origin(&origin()));
        assert_eq!(guard.disk_usage(&origin()), 0);
    }

    #[test]
    fn test_usage_sums_file_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        std::fs::write(&a, vec![0u8; 100]).unwrap();
        std::fs::write(&b, vec![0u8; 50]).unwrap();

        let manager = OriginQuotaManager::new();
        let mut guard = manager.lock();
        guard.track_origin(&origin());
        guard.add_database(&origin(), "a", Some(&a));
        guard.add_database(&origin(), "b", Some(&b));
        guard.add_database(&origin(), "pending", None);
        assert_eq!(guard.disk_usage(&origin()), 150);

        guard.remove_database(&origin(), "b");
        assert_eq!(guard.disk_usage(&origin()), 100);
    }

    #[test]
    fn test_mark_database_rereads_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.db");
        std::fs::write(&a, vec![0u8; 10]).unwrap();

        let manager = OriginQuotaManager::new();
        let mut guard = manager.lock();
        guard.track_origin(&origin());
        guard.add_database(&origin(), "a", Some(&a));
        assert_eq!(guard.disk_usage(&origin()), 10);

        std::fs::write(&a, vec![0u8; 30]).unwrap();
        assert_eq!(guard.disk_usage(&origin()), 10);

        guard.mark_database(&origin(), "a");
        assert_eq!(guard.disk_usage(&origin()), 30);
    }

    #[test]
    fn test_remove_origin_stops_tracking() {
        let manager = OriginQuotaManager::new();
        let mut guard = manager.lock();
        guard.track_origin(&origin());
        guard.remove_origin(&origin());
        assert!(!guard.tracks_origin(&origin()));
    }
}
