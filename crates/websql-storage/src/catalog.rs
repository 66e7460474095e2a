//! Catalog connection

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::StorageError;
use crate::fs;
use crate::migrations::run_migrations;
use crate::Result;

/// Lazily opened connection to the tracker catalog file.
///
/// The file is only created when a caller asks for it (`create_if_missing`),
/// so read-only queries against a fresh directory leave nothing behind.
pub struct CatalogStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl CatalogStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Open the catalog if it is not open yet.
    pub fn open(&self, create_if_missing: bool) -> Result<()> {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            *conn = Some(open_connection(&self.path, create_if_missing)?);
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.conn.lock().take().is_some() {
            tracing::debug!(path = %self.path.display(), "Closed catalog store");
        }
    }

    /// Close the catalog and remove its file from disk.
    pub fn close_and_delete(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.take();
        fs::delete_database_file(&self.path)?;
        tracing::info!(path = %self.path.display(), "Deleted catalog store");
        Ok(())
    }

    pub fn with_connection<F, T>(&self, create_if_missing: bool, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            *conn = Some(open_connection(&self.path, create_if_missing)?);
        }
        match conn.as_ref() {
            Some(conn) => f(conn),
            None => Err(StorageError::Unavailable(self.path.clone())),
        }
    }

    pub fn transaction<F, T>(&self, create_if_missing: bool, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            *conn = Some(open_connection(&self.path, create_if_missing)?);
        }
        let Some(conn) = conn.as_mut() else {
            return Err(StorageError::Unavailable(self.path.clone()));
        };
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        self.with_connection(false, |conn| table_exists(conn, name))
    }
}

impl Clone for CatalogStore {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            conn: Arc::clone(&self.conn),
        }
    }
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn open_connection(path: &Path, create_if_missing: bool) -> Result<Connection> {
    if !fs::ensure_database_file_exists(path, create_if_missing) {
        return Err(StorageError::Unavailable(path.to_path_buf()));
    }

    let conn = Connection::open(path)?;
    run_migrations(&conn)?;

    tracing::debug!(path = %path.display(), "Opened catalog store");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_without_create_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("Databases.db"));

        let err = store.open(false).unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(!store.is_open());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_open_with_create_builds_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("nested").join("Databases.db"));

        store.open(true).unwrap();
        assert!(store.is_open());
        assert!(store.table_exists("Origins").unwrap());
        assert!(store.table_exists("Databases").unwrap());
        assert!(!store.table_exists("Missing").unwrap());
    }

    #[test]
    fn test_close_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("Databases.db"));
        store.open(true).unwrap();

        store.close_and_delete().unwrap();
        assert!(!store.is_open());
        assert!(!store.path().exists());

        // Reopening without create must not resurrect the file.
        assert!(store.open(false).is_err());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::new(dir.path().join("Databases.db"));

        let result: Result<()> = store.transaction(true, |conn| {
            conn.execute("INSERT INTO Origins VALUES ('http_a_0', 1)", [])?;
            Err(StorageError::Unavailable(PathBuf::from("forced")))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_connection(false, |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM Origins", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
