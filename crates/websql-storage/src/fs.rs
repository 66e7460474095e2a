//! Database file helpers
//!
//! Every origin gets its own directory under the tracker directory; database
//! files inside it are named by a zero-padded hex sequence number.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::Result;

const SIDECAR_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

pub fn ensure_database_directory_exists(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Returns true when the file exists, or when it may be created on open.
pub fn ensure_database_file_exists(path: &Path, create_if_missing: bool) -> bool {
    if path.exists() {
        return true;
    }
    if !create_if_missing {
        return false;
    }
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).is_ok(),
        None => true,
    }
}

/// Size of a database file in bytes; missing files count as empty.
pub fn database_file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn is_zero_byte_file(path: &Path) -> bool {
    matches!(fs::metadata(path), Ok(m) if m.is_file() && m.len() == 0)
}

/// Pick a file name in `origin_path` that exists neither on disk nor in the
/// catalog. `is_taken` is asked about every candidate that is free on disk.
pub fn file_name_for_new_database<F>(origin_path: &Path, mut is_taken: F) -> Result<String>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut sequence: u64 = 0;
    loop {
        sequence += 1;
        let file_name = format!("{sequence:016x}.db");
        if origin_path.join(&file_name).exists() {
            continue;
        }
        if !is_taken(&file_name)? {
            return Ok(file_name);
        }
    }
}

/// Cut a database file down to zero bytes without unlinking it.
///
/// Other processes may hold POSIX locks on the file; unlinking would drop
/// those locks while truncation makes their next access fail cleanly.
pub fn truncate_database_file(path: &Path) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(0)?;
    file.sync_all()?;
    Ok(())
}

/// Remove a database file and its journal sidecars.
pub fn delete_database_file(path: &Path) -> Result<()> {
    remove_if_present(path)?;
    for suffix in SIDECAR_SUFFIXES {
        remove_if_present(&sidecar_path(path, suffix))?;
    }
    Ok(())
}

/// Remove `path` if it is an empty directory.
pub fn delete_empty_database_directory(path: &Path) -> bool {
    fs::remove_dir(path).is_ok()
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
