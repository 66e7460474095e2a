//! Open database registry
//!
//! Tracks every live database handle by (origin, name). Handles are added
//! when a database is opened and removed exactly once when it closes.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use crate::origin::Origin;

/// The worker thread a database runs its transactions on.
pub trait DatabaseThread: Send + Sync {
    fn set_paused(&self, paused: bool);
}

/// A live, opened database as seen by the tracker.
pub trait DatabaseHandle: Send + Sync {
    fn origin(&self) -> &Origin;

    fn name(&self) -> &str;

    /// Full path of the file this handle has open.
    fn file_path(&self) -> &Path;

    fn is_deleted(&self) -> bool;

    /// Interrupt pending work, close the file and refuse further use.
    fn mark_as_deleted_and_close(&self);

    fn database_thread(&self) -> Arc<dyn DatabaseThread>;
}

/// Handle compared by identity rather than by contents.
#[derive(Clone)]
struct HandleRef(Arc<dyn DatabaseHandle>);

impl HandleRef {
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for HandleRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for HandleRef {}

impl Hash for HandleRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

type DatabaseKey = (Origin, String);

pub struct OpenDatabaseRegistry {
    open: Mutex<HashMap<DatabaseKey, HashSet<HandleRef>>>,
}

impl OpenDatabaseRegistry {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, handle: Arc<dyn DatabaseHandle>) {
        let key = (handle.origin().clone(), handle.name().to_string());
        tracing::debug!(origin = %key.0, name = %key.1, "Added open database");
        self.open
            .lock()
            .entry(key)
            .or_default()
            .insert(HandleRef(handle));
    }

    /// Remove a handle. Returns false, and trips a debug assertion, when the
    /// handle was never added or has already been removed.
    pub fn remove(&self, handle: &Arc<dyn DatabaseHandle>) -> bool {
        let key = (handle.origin().clone(), handle.name().to_string());
        let target = HandleRef(Arc::clone(handle));

        let mut open = self.open.lock();
        let removed = open
            .get_mut(&key)
            .map(|set| set.remove(&target))
            .unwrap_or(false);
        if open.get(&key).is_some_and(HashSet::is_empty) {
            open.remove(&key);
        }
        drop(open);

        if removed {
            tracing::debug!(origin = %key.0, name = %key.1, "Removed open database");
        } else {
            tracing::error!(origin = %key.0, name = %key.1, "Removed a database that was not open");
        }
        debug_assert!(removed, "open database {}/{} removed twice", key.0, key.1);
        removed
    }

    /// Handles currently open for one database.
    pub fn handles_for(&self, origin: &Origin, name: &str) -> Vec<Arc<dyn DatabaseHandle>> {
        self.open
            .lock()
            .get(&(origin.clone(), name.to_string()))
            .map(|set| set.iter().map(|h| Arc::clone(&h.0)).collect())
            .unwrap_or_default()
    }

    /// Copy of every open handle grouped by database.
    pub fn snapshot(&self) -> Vec<(Origin, String, Vec<Arc<dyn DatabaseHandle>>)> {
        self.open
            .lock()
            .iter()
            .map(|((origin, name), set)| {
                (
                    origin.clone(),
                    name.clone(),
                    set.iter().map(|h| Arc::clone(&h.0)).collect(),
                )
            })
            .collect()
    }

    /// Pause or resume every distinct database thread with an open handle.
    /// Returns how many threads were touched.
    pub fn set_paused(&self, paused: bool) -> usize {
        let open = self.open.lock();
        let mut handled: HashSet<*const ()> = HashSet::new();

        for handle in open.values().flatten() {
            let thread = handle.0.database_thread();
            if handled.insert(Arc::as_ptr(&thread) as *const ()) {
                thread.set_paused(paused);
            }
        }
        handled.len()
    }

    pub fn open_count(&self, origin: &Origin, name: &str) -> usize {
        self.open
            .lock()
            .get(&(origin.clone(), name.to_string()))
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn has_open_for_origin(&self, origin: &Origin) -> bool {
        self.open.lock().keys().any(|(o, _)| o == origin)
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

impl Default for OpenDatabaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}
