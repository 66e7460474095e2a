#![allow(dead_code)]

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;
use websql_tracker::{
    DatabaseHandle, DatabaseThread, DatabaseTracker, DatabaseTrackerClient, Origin, TrackerConfig,
};

pub fn tracker_in(dir: &Path) -> DatabaseTracker {
    DatabaseTracker::new(TrackerConfig::new(dir.to_path_buf()))
}

pub fn new_tracker() -> (TempDir, DatabaseTracker) {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker_in(dir.path());
    (dir, tracker)
}

pub fn origin(host: &str) -> Origin {
    Origin::new("https", host, None)
}

pub fn write_bytes(path: &Path, len: usize) {
    std::fs::write(path, vec![0u8; len]).unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    AddedOrigin(String),
    ModifiedOrigin(String),
    ModifiedDatabase(String, String),
    DeletedDatabase,
    DeletedOrigin,
    FirstTransactionBegan,
    LastTransactionEnded,
}

#[derive(Default)]
pub struct RecordingClient {
    events: Mutex<Vec<Event>>,
}

impl RecordingClient {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl DatabaseTrackerClient for RecordingClient {
    fn did_add_new_origin(&self, origin: &Origin) {
        self.push(Event::AddedOrigin(origin.to_string()));
    }

    fn did_modify_origin(&self, origin: &Origin) {
        self.push(Event::ModifiedOrigin(origin.to_string()));
    }

    fn did_modify_database(&self, origin: &Origin, name: &str) {
        self.push(Event::ModifiedDatabase(origin.to_string(), name.to_string()));
    }

    fn did_delete_database(&self) {
        self.push(Event::DeletedDatabase);
    }

    fn did_delete_database_origin(&self) {
        self.push(Event::DeletedOrigin);
    }

    fn will_begin_first_transaction(&self) {
        self.push(Event::FirstTransactionBegan);
    }

    fn did_finish_last_transaction(&self) {
        self.push(Event::LastTransactionEnded);
    }
}

#[derive(Default)]
pub struct FakeThread {
    pub pause_calls: AtomicUsize,
    pub paused: AtomicBool,
}

impl DatabaseThread for FakeThread {
    fn set_paused(&self, paused: bool) {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(paused, Ordering::SeqCst);
    }
}

pub struct FakeHandle {
    origin: Origin,
    name: String,
    path: PathBuf,
    deleted: AtomicBool,
    thread: Arc<FakeThread>,
}

impl FakeHandle {
    pub fn new(origin: &Origin, name: &str, path: PathBuf, thread: Arc<FakeThread>) -> Arc<Self> {
        Arc::new(Self {
            origin: origin.clone(),
            name: name.to_string(),
            path,
            deleted: AtomicBool::new(false),
            thread,
        })
    }
}

impl DatabaseHandle for FakeHandle {
    fn origin(&self) -> &Origin {
        &self.origin
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn mark_as_deleted_and_close(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn database_thread(&self) -> Arc<dyn DatabaseThread> {
        self.thread.clone()
    }
}
