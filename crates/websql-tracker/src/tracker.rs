//! Database tracker
//!
//! One tracker serves a process. It owns the catalog of which databases
//! exist per origin, the cached origin quotas, the per-origin usage totals
//! and the registry of open handles.
//!
//! Catalog-mutating calls belong to the owner thread, the thread that built
//! the tracker. Database threads only add and remove open handles, pause,
//! count transactions, schedule change notifications and read quotas.
//!
//! Lock order: quota map, then quota manager, then catalog store. The open
//! database registry, the notification queue and the transaction counter
//! are leaves and never wait on another tracker lock.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::{params, OpenFlags, OptionalExtension};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use websql_storage::{fs, CatalogStore, StorageError};

use crate::config::TrackerConfig;
use crate::deletion::{DeletionReport, FileDeletion};
use crate::details::{DatabaseDetails, ProposedDatabase};
use crate::error::TrackerError;
use crate::notify::{DatabaseTrackerClient, NotificationQueue, OwnerTask};
use crate::origin::Origin;
use crate::quota::OriginQuotaManager;
use crate::registry::{DatabaseHandle, OpenDatabaseRegistry};
use crate::Result;

/// Asked to raise an origin's quota when a new database would not fit.
///
/// Runs synchronously on the owner thread; call `QuotaRequest::set_quota`
/// before returning to let the creation proceed.
pub trait QuotaIncreaseHandler: Send + Sync {
    fn database_exceeded_quota(&self, request: &QuotaRequest<'_>);
}

impl<F> QuotaIncreaseHandler for F
where
    F: Fn(&QuotaRequest<'_>) + Send + Sync,
{
    fn database_exceeded_quota(&self, request: &QuotaRequest<'_>) {
        self(request)
    }
}

/// The pending creation handed to a `QuotaIncreaseHandler`.
///
/// The proposed database exists only for the duration of the handler call.
/// Lookups made through the request see it; lookups made directly on the
/// tracker do not.
pub struct QuotaRequest<'a> {
    tracker: &'a DatabaseTracker,
    proposed: &'a ProposedDatabase,
}

impl QuotaRequest<'_> {
    pub fn origin(&self) -> &Origin {
        &self.proposed.origin
    }

    pub fn details(&self) -> &DatabaseDetails {
        &self.proposed.details
    }

    pub fn tracker(&self) -> &DatabaseTracker {
        self.tracker
    }

    pub fn usage(&self) -> u64 {
        self.tracker.usage_for_origin(self.origin())
    }

    pub fn quota(&self) -> u64 {
        self.tracker.quota_for_origin(self.origin())
    }

    pub fn set_quota(&self, quota: u64) {
        self.tracker.set_quota(self.origin(), quota)
    }

    /// Like `DatabaseTracker::full_path_for_database`, but the proposed
    /// database has no path yet.
    pub fn full_path_for_database(
        &self,
        origin: &Origin,
        name: &str,
        create_if_not_exists: bool,
    ) -> Option<PathBuf> {
        if self.proposed.matches(origin, name) {
            return None;
        }
        self.tracker
            .full_path_for_database(origin, name, create_if_not_exists)
    }

    pub fn details_for_name_and_origin(&self, name: &str, origin: &Origin) -> DatabaseDetails {
        if self.proposed.matches(origin, name) {
            return self.proposed.details.clone();
        }
        self.tracker.details_for_name_and_origin(name, origin)
    }
}

struct OwnerThread {
    thread: Option<ThreadId>,
}

impl OwnerThread {
    fn is_current(&self) -> bool {
        self.thread.map_or(true, |id| id == thread::current().id())
    }
}

type QuotaMap = HashMap<Origin, u64>;

pub struct DatabaseTracker {
    config: TrackerConfig,
    store: CatalogStore,
    quota_map: Mutex<Option<QuotaMap>>,
    quota_manager: OriginQuotaManager,
    open_databases: OpenDatabaseRegistry,
    notifications: NotificationQueue,
    tasks: Sender<OwnerTask>,
    task_receiver: Receiver<OwnerTask>,
    transactions_in_progress: Mutex<u32>,
    open_database_lock: Mutex<()>,
    client: RwLock<Option<Arc<dyn DatabaseTrackerClient>>>,
    quota_handler: RwLock<Option<Arc<dyn QuotaIncreaseHandler>>>,
    owner: OwnerThread,
}

impl DatabaseTracker {
    /// Build a tracker owned by the calling thread.
    pub fn new(config: TrackerConfig) -> Self {
        let (tasks, task_receiver) = crossbeam_channel::unbounded();
        let store = CatalogStore::new(config.tracker_database_path());

        tracing::info!(
            directory = %config.database_directory.display(),
            "Created database tracker"
        );

        Self {
            config,
            store,
            quota_map: Mutex::new(None),
            quota_manager: OriginQuotaManager::new(),
            open_databases: OpenDatabaseRegistry::new(),
            notifications: NotificationQueue::new(tasks.clone()),
            tasks,
            task_receiver,
            transactions_in_progress: Mutex::new(0),
            open_database_lock: Mutex::new(()),
            client: RwLock::new(None),
            quota_handler: RwLock::new(None),
            owner: OwnerThread {
                thread: Some(thread::current().id()),
            },
        }
    }

    /// Drop the owner-thread check, for embedders that serialize access
    /// through their own application lock.
    pub fn without_owner_thread_check(mut self) -> Self {
        self.owner.thread = None;
        self
    }

    fn assert_owner_thread(&self) {
        debug_assert!(
            self.owner.is_current(),
            "database tracker used off its owner thread"
        );
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn database_directory(&self) -> &Path {
        &self.config.database_directory
    }

    pub fn tracker_database_path(&self) -> &Path {
        self.store.path()
    }

    pub fn origin_path(&self, origin: &Origin) -> PathBuf {
        self.config
            .database_directory
            .join(origin.database_identifier())
    }

    pub fn set_client(&self, client: Option<Arc<dyn DatabaseTrackerClient>>) {
        self.assert_owner_thread();
        *self.client.write() = client;
    }

    pub fn set_quota_increase_handler(&self, handler: Option<Arc<dyn QuotaIncreaseHandler>>) {
        self.assert_owner_thread();
        *self.quota_handler.write() = handler;
    }

    fn client(&self) -> Option<Arc<dyn DatabaseTrackerClient>> {
        self.client.read().clone()
    }

    // ---- origins and quotas ----

    /// Load the quota map from the catalog the first time it is needed.
    pub fn populate_origins(&self) {
        let mut map = self.quota_map.lock();
        if map.is_some() {
            return;
        }
        self.assert_owner_thread();
        *map = Some(self.load_quota_map());
    }

    /// Throw away cached quotas and read them again from the catalog.
    pub fn reload_origins(&self) {
        self.assert_owner_thread();
        let mut map = self.quota_map.lock();
        *map = Some(self.load_quota_map());
    }

    fn load_quota_map(&self) -> QuotaMap {
        match self.read_origins() {
            Ok(origins) => origins.into_iter().collect(),
            Err(e) if is_unavailable(&e) => QuotaMap::new(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read in all origins from the catalog");
                QuotaMap::new()
            }
        }
    }

    pub fn origins(&self) -> Vec<Origin> {
        self.assert_owner_thread();
        self.populate_origins();
        self.quota_map
            .lock()
            .as_ref()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_entry_for_origin(&self, origin: &Origin) -> bool {
        self.assert_owner_thread();
        self.populate_origins();
        self.quota_map
            .lock()
            .as_ref()
            .is_some_and(|map| map.contains_key(origin))
    }

    /// Quota for an origin, or the configured default for unseen origins.
    /// Safe on database threads once origins have been populated.
    pub fn quota_for_origin(&self, origin: &Origin) -> u64 {
        self.populate_origins();
        self.quota_map
            .lock()
            .as_ref()
            .and_then(|map| map.get(origin).copied())
            .unwrap_or(self.config.default_origin_quota)
    }

    pub fn set_quota(&self, origin: &Origin, quota: u64) {
        self.assert_owner_thread();
        if self.quota_for_origin(origin) == quota {
            return;
        }

        if let Err(e) = self.store.open(true) {
            tracing::error!(origin = %origin, error = %e, "Unable to open catalog to set quota");
            return;
        }

        let inserted_new_origin = {
            let mut guard = self.quota_map.lock();
            let map = guard.get_or_insert_with(QuotaMap::new);

            let inserted = if map.contains_key(origin) {
                if let Err(e) = self.update_origin_quota(origin, quota) {
                    tracing::error!(
                        origin = %origin,
                        quota,
                        error = %e,
                        "Failed to set quota in catalog"
                    );
                }
                false
            } else {
                match self.insert_origin(origin, quota) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(
                            origin = %origin,
                            error = %e,
                            "Unable to establish origin in the catalog"
                        );
                        false
                    }
                }
            };

            // Memory wins even when the catalog write failed; the next
            // reload_origins will surface the divergence.
            map.insert(origin.clone(), quota);
            inserted
        };

        tracing::info!(origin = %origin, quota, "Set origin quota");

        if let Some(client) = self.client() {
            if inserted_new_origin {
                client.did_add_new_origin(origin);
            }
            client.did_modify_origin(origin);
        }
    }

    // ---- database creation ----

    /// Decide whether a database may be opened, asking the quota handler
    /// for more room when a new database would not fit.
    pub fn can_establish_database(
        &self,
        origin: &Origin,
        name: &str,
        display_name: &str,
        estimated_size: u64,
    ) -> bool {
        self.assert_owner_thread();

        // quota_for_origin must be answerable from the database thread later.
        self.populate_origins();

        // A revised estimate never blocks a database that already exists.
        if self.has_entry_for_database(origin, name) {
            return true;
        }

        let usage = self.usage_for_origin(origin);
        let Some(requirement) = usage.checked_add(estimated_size.max(1)) else {
            tracing::warn!(
                origin = %origin,
                name = %name,
                estimated_size,
                "Estimated size overflows the origin usage"
            );
            return false;
        };
        if requirement <= self.quota_for_origin(origin) {
            return true;
        }

        let proposed = ProposedDatabase {
            origin: origin.clone(),
            details: DatabaseDetails::new(
                name.to_string(),
                display_name.to_string(),
                estimated_size,
                0,
            ),
        };
        let handler = self.quota_handler.read().clone();
        if let Some(handler) = handler {
            handler.database_exceeded_quota(&QuotaRequest {
                tracker: self,
                proposed: &proposed,
            });
        }

        requirement <= self.quota_for_origin(origin)
    }

    pub fn has_entry_for_database(&self, origin: &Origin, name: &str) -> bool {
        self.assert_owner_thread();
        match self.lookup_file_name(origin, name) {
            Ok(found) => found.is_some(),
            Err(e) => {
                log_store_error(&e, "Failed to look up database in catalog");
                false
            }
        }
    }

    /// Path of a database file, registering a new file for it when asked.
    pub fn full_path_for_database(
        &self,
        origin: &Origin,
        name: &str,
        create_if_not_exists: bool,
    ) -> Option<PathBuf> {
        self.assert_owner_thread();

        let origin_path = self.origin_path(origin);
        if create_if_not_exists {
            if let Err(e) = fs::ensure_database_directory_exists(&origin_path) {
                tracing::error!(origin = %origin, error = %e, "Unable to create origin directory");
                return None;
            }
        }

        let existing = if create_if_not_exists {
            self.store
                .open(true)
                .map_err(TrackerError::from)
                .and_then(|()| self.lookup_file_name(origin, name))
        } else {
            self.lookup_file_name(origin, name)
        };

        match existing {
            Ok(Some(file_name)) => return Some(origin_path.join(file_name)),
            Ok(None) if !create_if_not_exists => return None,
            Ok(None) => {}
            Err(e) => {
                log_store_error(&e, "Failed to retrieve file name from catalog");
                return None;
            }
        }

        let file_name = match fs::file_name_for_new_database(&origin_path, |candidate| {
            self.is_file_name_cataloged(origin, candidate)
        }) {
            Ok(file_name) => file_name,
            Err(e) => {
                tracing::error!(origin = %origin, name = %name, error = %e, "Unable to pick a database file name");
                return None;
            }
        };

        if let Err(e) = self.add_database(origin, name, &file_name) {
            tracing::error!(origin = %origin, name = %name, error = %e, "Failed to add database to catalog");
            return None;
        }

        let full_path = origin_path.join(&file_name);
        {
            let mut manager = self.quota_manager.lock();
            if manager.tracks_origin(origin) {
                manager.add_database(origin, name, Some(&full_path));
            }
        }

        tracing::info!(origin = %origin, name = %name, path = %full_path.display(), "Registered new database");
        Some(full_path)
    }

    fn add_database(&self, origin: &Origin, name: &str, file_name: &str) -> Result<()> {
        if !self.has_entry_for_origin(origin) {
            // Another process may have stored the origin since we loaded.
            let (quota, inserted) = match self.read_origin_quota(origin)? {
                Some(quota) => (quota, false),
                None => {
                    self.insert_origin(origin, self.config.default_origin_quota)?;
                    (self.config.default_origin_quota, true)
                }
            };
            self.quota_map
                .lock()
                .get_or_insert_with(QuotaMap::new)
                .insert(origin.clone(), quota);
            if inserted {
                if let Some(client) = self.client() {
                    client.did_add_new_origin(origin);
                }
            }
        }

        self.store.with_connection(true, |conn| {
            conn.execute(
                "INSERT INTO Databases (origin, name, path) VALUES (?1, ?2, ?3)",
                params![origin.database_identifier(), name, file_name],
            )?;
            Ok(())
        })?;

        if let Some(client) = self.client() {
            client.did_modify_origin(origin);
        }
        Ok(())
    }

    // ---- database details and usage ----

    pub fn database_names_for_origin(&self, origin: &Origin) -> Option<Vec<String>> {
        self.assert_owner_thread();
        match self.read_database_names(origin) {
            Ok(names) => Some(names),
            Err(e) => {
                log_store_error(&e, "Failed to retrieve database names for origin");
                None
            }
        }
    }

    pub fn details_for_name_and_origin(&self, name: &str, origin: &Origin) -> DatabaseDetails {
        self.assert_owner_thread();

        let row = self.store.with_connection(false, |conn| {
            Ok(conn
                .query_row(
                    "SELECT displayName, estimatedSize FROM Databases WHERE origin = ?1 AND name = ?2",
                    params![origin.database_identifier(), name],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                        ))
                    },
                )
                .optional()?)
        });

        match row {
            Ok(Some((display_name, estimated_size))) => DatabaseDetails::new(
                name.to_string(),
                display_name.unwrap_or_default(),
                estimated_size.unwrap_or(0) as u64,
                self.usage_for_database(name, origin),
            ),
            Ok(None) => DatabaseDetails::default(),
            Err(e) => {
                log_store_error(
                    &TrackerError::from(e),
                    "Error retrieving database details from catalog",
                );
                DatabaseDetails::default()
            }
        }
    }

    pub fn set_database_details(
        &self,
        origin: &Origin,
        name: &str,
        display_name: &str,
        estimated_size: u64,
    ) {
        self.assert_owner_thread();

        let updated = self.store.with_connection(true, |conn| {
            let guid: Option<i64> = conn
                .query_row(
                    "SELECT guid FROM Databases WHERE origin = ?1 AND name = ?2",
                    params![origin.database_identifier(), name],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(guid) = guid else {
                return Ok(false);
            };
            conn.execute(
                "UPDATE Databases SET displayName = ?1, estimatedSize = ?2 WHERE guid = ?3",
                params![display_name, estimated_size as i64, guid],
            )?;
            Ok(true)
        });

        match updated {
            Ok(true) => {
                if let Some(client) = self.client() {
                    client.did_modify_database(origin, name);
                }
            }
            Ok(false) => {
                // The catalog is shared with other processes, so this is
                // reported rather than asserted.
                tracing::error!(
                    origin = %origin,
                    name = %name,
                    "Cannot set details for a database missing from the catalog"
                );
            }
            Err(e) => {
                tracing::error!(origin = %origin, name = %name, error = %e, "Failed to update database details");
            }
        }
    }

    pub fn usage_for_database(&self, name: &str, origin: &Origin) -> u64 {
        self.full_path_for_database(origin, name, false)
            .map(|path| fs::database_file_size(&path))
            .unwrap_or(0)
    }

    /// Bytes used by an origin. The first call starts tracking the origin.
    pub fn usage_for_origin(&self, origin: &Origin) -> u64 {
        self.assert_owner_thread();
        let mut manager = self.quota_manager.lock();

        if manager.tracks_origin(origin) {
            return manager.disk_usage(origin);
        }

        manager.track_origin(origin);
        let names = self.read_database_names(origin).unwrap_or_else(|e| {
            log_store_error(&e, "Failed to retrieve database names for origin");
            Vec::new()
        });
        for name in names {
            let path = match self.lookup_file_name(origin, &name) {
                Ok(file_name) => file_name.map(|f| self.origin_path(origin).join(f)),
                Err(e) => {
                    log_store_error(&e, "Failed to retrieve file name from catalog");
                    None
                }
            };
            manager.add_database(origin, &name, path.as_deref());
        }

        manager.disk_usage(origin)
    }

    /// Largest size the handle's database may grow to: the origin's quota
    /// minus what every other database of the origin uses.
    pub fn max_size_for_database(&self, handle: &dyn DatabaseHandle) -> u64 {
        let origin = handle.origin();
        let quota = self.quota_for_origin(origin);
        let usage = self.quota_manager.lock().disk_usage(origin);
        let own = fs::database_file_size(handle.file_path());
        quota.saturating_sub(usage.saturating_sub(own))
    }

    // ---- deletion ----

    pub fn delete_all_databases(&self) -> Vec<DeletionReport> {
        self.assert_owner_thread();
        self.origins()
            .into_iter()
            .filter_map(|origin| match self.delete_origin(&origin) {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!(origin = %origin, error = %e, "Unable to delete origin");
                    None
                }
            })
            .collect()
    }

    /// Delete every database of an origin along with the origin itself.
    ///
    /// A file that cannot be removed does not stop the others; it shows up
    /// in the report. The call fails only when the catalog cannot be updated.
    pub fn delete_origin(&self, origin: &Origin) -> Result<DeletionReport> {
        self.assert_owner_thread();
        self.populate_origins();
        self.store.open(false)?;

        let names = self.read_database_names(origin).inspect_err(|e| {
            tracing::error!(origin = %origin, error = %e, "Unable to list databases for origin");
        })?;

        let mut report = DeletionReport::new(origin.clone());
        for name in &names {
            let outcome = self.delete_database_file(origin, name);
            if let FileDeletion::Failed { path, reason } = &outcome {
                tracing::error!(
                    origin = %origin,
                    name = %name,
                    path = %path.display(),
                    reason = %reason,
                    "Unable to delete database file"
                );
            }
            report.push(name.clone(), outcome);
        }

        self.store
            .transaction(false, |conn| {
                conn.execute(
                    "DELETE FROM Databases WHERE origin = ?1",
                    [origin.database_identifier()],
                )?;
                conn.execute(
                    "DELETE FROM Origins WHERE origin = ?1",
                    [origin.database_identifier()],
                )?;
                Ok(())
            })
            .inspect_err(|e| {
                tracing::error!(origin = %origin, error = %e, "Unable to delete origin from catalog");
            })?;

        fs::delete_empty_database_directory(&self.origin_path(origin));

        {
            let mut guard = self.quota_map.lock();
            let map = guard.get_or_insert_with(QuotaMap::new);
            map.remove(origin);
            self.quota_manager.lock().remove_origin(origin);

            if map.is_empty() {
                if let Err(e) = self.store.close_and_delete() {
                    tracing::error!(error = %e, "Unable to delete catalog after last origin");
                }
                fs::delete_empty_database_directory(&self.config.database_directory);
            }
        }

        tracing::info!(origin = %origin, databases = names.len(), "Deleted origin");

        if let Some(client) = self.client() {
            client.did_modify_origin(origin);
            client.did_delete_database_origin();
            for name in &names {
                client.did_modify_database(origin, name);
            }
        }

        Ok(report)
    }

    pub fn delete_database(&self, origin: &Origin, name: &str) -> Result<DeletionReport> {
        self.assert_owner_thread();
        self.store.open(false)?;

        let outcome = self.delete_database_file(origin, name);
        if let FileDeletion::Failed { path, reason } = outcome {
            tracing::error!(
                origin = %origin,
                name = %name,
                path = %path.display(),
                reason = %reason,
                "Unable to delete database file"
            );
            return Err(TrackerError::FileDeletion {
                name: name.to_string(),
                path,
            });
        }

        self.store
            .with_connection(false, |conn| {
                conn.execute(
                    "DELETE FROM Databases WHERE origin = ?1 AND name = ?2",
                    params![origin.database_identifier(), name],
                )?;
                Ok(())
            })
            .inspect_err(|e| {
                tracing::error!(origin = %origin, name = %name, error = %e, "Unable to delete database from catalog");
            })?;

        self.quota_manager.lock().remove_database(origin, name);

        tracing::info!(origin = %origin, name = %name, "Deleted database");

        if let Some(client) = self.client() {
            client.did_modify_origin(origin);
            client.did_modify_database(origin, name);
            client.did_delete_database();
        }

        let mut report = DeletionReport::new(origin.clone());
        report.push(name.to_string(), outcome);
        Ok(report)
    }

    /// Close open handles of a database and truncate its file.
    fn delete_database_file(&self, origin: &Origin, name: &str) -> FileDeletion {
        let Some(path) = self.full_path_for_database(origin, name, false) else {
            return FileDeletion::Missing;
        };

        // Closing a handle waits on its database thread, which may itself be
        // waiting on the registry lock, so collect first and close after.
        for handle in self.open_databases.handles_for(origin, name) {
            handle.mark_as_deleted_and_close();
        }

        if !path.exists() {
            return FileDeletion::Missing;
        }
        match fs::truncate_database_file(&path) {
            Ok(()) => FileDeletion::Truncated,
            Err(e) => FileDeletion::Failed {
                path,
                reason: e.to_string(),
            },
        }
    }

    /// Delete a database file only if it is empty, double-checking the size
    /// while holding an exclusive lock on it.
    pub fn delete_database_file_if_empty(path: &Path) -> bool {
        match try_delete_database_file_if_empty(path) {
            Ok(deleted) => deleted,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unable to check empty database file");
                false
            }
        }
    }

    /// Block database opening until the guard is dropped.
    pub fn open_database_lock(&self) -> MutexGuard<'_, ()> {
        self.open_database_lock.lock()
    }

    /// Remove zero-byte database files left behind by truncating deletes.
    pub fn remove_empty_database_files(&self) -> Vec<PathBuf> {
        let _opening = self.open_database_lock();
        let mut removed = Vec::new();

        let origin_dirs = match std::fs::read_dir(&self.config.database_directory) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "No database directory to sweep");
                return removed;
            }
        };

        for dir in origin_dirs.flatten() {
            let dir = dir.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension() != Some(OsStr::new("db")) {
                    continue;
                }
                if Self::delete_database_file_if_empty(&path) {
                    tracing::info!(path = %path.display(), "Removed empty database file");
                    removed.push(path);
                }
            }
        }

        removed
    }

    // ---- reconciliation with other processes ----

    /// Pick up origins added or removed by another process. Returns the
    /// origins whose membership changed.
    pub fn origins_did_change(&self) -> Vec<Origin> {
        self.assert_owner_thread();

        if let Err(e) = self.store.open(false) {
            tracing::debug!(error = %e, "Catalog not available for reconciliation");
            return Vec::new();
        }

        let mut changed = Vec::new();
        {
            let mut guard = self.quota_map.lock();
            let Some(map) = guard.as_mut() else {
                return changed;
            };

            let stored = match self.read_origins() {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read in all origins from the catalog");
                    return changed;
                }
            };

            let mut stale: HashSet<Origin> = map.keys().cloned().collect();
            for (origin, quota) in stored {
                if !stale.remove(&origin) {
                    map.insert(origin.clone(), quota);
                    changed.push(origin);
                }
            }

            for origin in stale {
                // Never drop an origin that still has databases, on disk or open.
                match self.read_database_names(&origin) {
                    Ok(names) if names.is_empty() => {}
                    _ => continue,
                }
                if self.open_databases.has_open_for_origin(&origin) {
                    continue;
                }

                map.remove(&origin);
                self.quota_manager.lock().remove_origin(&origin);
                changed.push(origin);
            }

            if map.is_empty() {
                self.store.close();
            }
        }

        if let Some(client) = self.client() {
            for origin in &changed {
                client.did_modify_origin(origin);
            }
        }
        changed
    }

    /// Close open handles whose database another process deleted or
    /// replaced. Returns how many handles were closed.
    pub fn remove_deleted_opened_databases(&self) -> usize {
        self.assert_owner_thread();

        if let Err(e) = self.store.open(false) {
            tracing::debug!(error = %e, "Catalog not available for open database check");
            return 0;
        }

        let mut deleted_handles = Vec::new();
        let mut vanished: BTreeMap<Origin, Vec<String>> = BTreeMap::new();

        for (origin, name, handles) in self.open_databases.snapshot() {
            let file_name = match self.lookup_file_name(&origin, &name) {
                Ok(file_name) => file_name,
                Err(e) => {
                    tracing::error!(origin = %origin, name = %name, error = %e, "Unable to look up open database");
                    continue;
                }
            };

            let mut found_deleted = false;
            for handle in handles {
                if handle.is_deleted() {
                    continue;
                }
                let still_current = file_name
                    .as_deref()
                    .is_some_and(|f| handle.file_path().file_name() == Some(OsStr::new(f)));
                if !still_current {
                    deleted_handles.push(handle);
                    found_deleted = true;
                }
            }

            if found_deleted && file_name.is_none() {
                vanished.entry(origin).or_default().push(name);
            }
        }

        for handle in &deleted_handles {
            tracing::info!(
                origin = %handle.origin(),
                name = %handle.name(),
                "Closing database deleted by another process"
            );
            handle.mark_as_deleted_and_close();
        }

        let client = self.client();
        for (origin, names) in vanished {
            if let Some(client) = &client {
                client.did_modify_origin(&origin);
            }
            for name in names {
                self.quota_manager.lock().remove_database(&origin, &name);
                if let Some(client) = &client {
                    client.did_modify_database(&origin, &name);
                }
            }
        }

        deleted_handles.len()
    }

    // ---- open handles, any thread ----

    pub fn add_open_database(&self, handle: Arc<dyn DatabaseHandle>) {
        self.open_databases.add(handle);
    }

    pub fn remove_open_database(&self, handle: &Arc<dyn DatabaseHandle>) -> bool {
        self.open_databases.remove(handle)
    }

    pub fn open_databases(&self) -> &OpenDatabaseRegistry {
        &self.open_databases
    }

    pub fn set_databases_paused(&self, paused: bool) {
        let threads = self.open_databases.set_paused(paused);
        tracing::debug!(paused, threads, "Set database threads paused");
    }

    pub fn increment_transaction_in_progress_count(&self) {
        let mut count = self.transactions_in_progress.lock();
        *count += 1;
        if *count == 1 {
            self.post(OwnerTask::FirstTransactionBegan);
        }
    }

    pub fn decrement_transaction_in_progress_count(&self) {
        let mut count = self.transactions_in_progress.lock();
        debug_assert!(*count > 0, "transaction count decremented below zero");
        if *count == 0 {
            tracing::error!("Transaction count decremented below zero");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.post(OwnerTask::LastTransactionEnded);
        }
    }

    /// Queue a change notification for the owner thread and mark the
    /// database's cached size stale.
    pub fn schedule_notify_database_changed(&self, origin: &Origin, name: &str) {
        self.quota_manager.lock().mark_database(origin, name);
        self.notifications
            .schedule(origin.clone(), name.to_string());
    }

    fn post(&self, task: OwnerTask) {
        if self.tasks.send(task).is_err() {
            tracing::warn!(?task, "Owner task channel closed");
        }
    }

    // ---- owner thread task loop ----

    /// Channel of work for the owner thread, for embedding in an event loop.
    pub fn task_receiver(&self) -> Receiver<OwnerTask> {
        self.task_receiver.clone()
    }

    /// Run the tasks queued so far. Tasks posted while running wait for the
    /// next call.
    pub fn run_pending_tasks(&self) -> usize {
        self.assert_owner_thread();
        let tasks: Vec<OwnerTask> = self.task_receiver.try_iter().collect();
        for task in &tasks {
            self.handle_task(*task);
        }
        tasks.len()
    }

    pub fn handle_task(&self, task: OwnerTask) {
        self.assert_owner_thread();
        match task {
            OwnerTask::NotifyDatabasesChanged => self.notify_databases_changed(),
            OwnerTask::FirstTransactionBegan => {
                if let Some(client) = self.client() {
                    client.will_begin_first_transaction();
                }
            }
            OwnerTask::LastTransactionEnded => {
                if let Some(client) = self.client() {
                    client.did_finish_last_transaction();
                }
            }
        }
    }

    fn notify_databases_changed(&self) {
        let notifications = self.notifications.take();
        let Some(client) = self.client() else {
            return;
        };
        for (origin, name) in &notifications {
            client.did_modify_database(origin, name);
        }
    }

    // ---- catalog queries ----

    fn read_origins(&self) -> Result<Vec<(Origin, u64)>> {
        let rows = self.store.with_connection(false, |conn| {
            let mut stmt = conn.prepare("SELECT origin, quota FROM Origins")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(identifier, quota)| {
                match Origin::from_database_identifier(&identifier) {
                    Ok(origin) => Some((origin, quota as u64)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed origin in catalog");
                        None
                    }
                }
            })
            .collect())
    }

    fn read_origin_quota(&self, origin: &Origin) -> Result<Option<u64>> {
        let quota = self.store.with_connection(true, |conn| {
            Ok(conn
                .query_row(
                    "SELECT quota FROM Origins WHERE origin = ?1",
                    [origin.database_identifier()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?)
        })?;
        Ok(quota.map(|quota| quota as u64))
    }

    fn insert_origin(&self, origin: &Origin, quota: u64) -> Result<()> {
        self.store.with_connection(true, |conn| {
            conn.execute(
                "INSERT INTO Origins VALUES (?1, ?2)",
                params![origin.database_identifier(), quota as i64],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn update_origin_quota(&self, origin: &Origin, quota: u64) -> Result<()> {
        self.store.with_connection(true, |conn| {
            conn.execute(
                "UPDATE Origins SET quota = ?1 WHERE origin = ?2",
                params![quota as i64, origin.database_identifier()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn read_database_names(&self, origin: &Origin) -> Result<Vec<String>> {
        Ok(self.store.with_connection(false, |conn| {
            let mut stmt = conn.prepare("SELECT name FROM Databases WHERE origin = ?1")?;
            let names = stmt
                .query_map([origin.database_identifier()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })?)
    }

    /// Catalog file name of a database. An absent catalog means no entry.
    fn lookup_file_name(&self, origin: &Origin, name: &str) -> Result<Option<String>> {
        let found = self.store.with_connection(false, |conn| {
            Ok(conn
                .query_row(
                    "SELECT path FROM Databases WHERE origin = ?1 AND name = ?2",
                    params![origin.database_identifier(), name],
                    |row| row.get(0),
                )
                .optional()?)
        });
        match found {
            Ok(file_name) => Ok(file_name),
            Err(StorageError::Unavailable(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_file_name_cataloged(
        &self,
        origin: &Origin,
        file_name: &str,
    ) -> websql_storage::Result<bool> {
        self.store.with_connection(false, |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM Databases WHERE origin = ?1 AND path = ?2",
                    params![origin.database_identifier(), file_name],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}

fn is_unavailable(err: &TrackerError) -> bool {
    matches!(err, TrackerError::Storage(StorageError::Unavailable(_)))
}

fn log_store_error(err: &TrackerError, message: &str) {
    if is_unavailable(err) {
        tracing::debug!(error = %err, "{message}");
    } else {
        tracing::error!(error = %err, "{message}");
    }
}

fn try_delete_database_file_if_empty(path: &Path) -> Result<bool> {
    if !fs::is_zero_byte_file(path) {
        return Ok(false);
    }

    let conn = rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(StorageError::from)?;

    // In exclusive mode the next read takes a lock that is kept until close.
    let _mode: String = conn
        .query_row("PRAGMA locking_mode=EXCLUSIVE", [], |row| row.get(0))
        .map_err(StorageError::from)?;

    let has_schema = conn
        .query_row("SELECT * FROM sqlite_master LIMIT 1", [], |_| Ok(()))
        .optional()
        .map_err(StorageError::from)?
        .is_some();
    if has_schema {
        return Ok(false);
    }

    // Holding the lock now; a writer may have raced the first size check.
    if !fs::is_zero_byte_file(path) {
        return Ok(false);
    }

    fs::delete_database_file(path)?;
    drop(conn);
    Ok(true)
}
