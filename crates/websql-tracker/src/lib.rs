//! WebSQL Tracker
//!
//! Keeps the per-origin catalog of client-side databases, enforces origin
//! quotas before a database is created, and tracks open database handles so
//! that deletion and pausing are safe across database threads.

mod config;
mod deletion;
mod details;
mod error;
mod notify;
mod origin;
mod quota;
mod registry;
mod tracker;

pub use config::TrackerConfig;
pub use deletion::{DatabaseFileOutcome, DeletionReport, FileDeletion};
pub use details::{DatabaseDetails, ProposedDatabase};
pub use error::TrackerError;
pub use notify::{DatabaseTrackerClient, NotificationQueue, OwnerTask};
pub use origin::Origin;
pub use quota::{OriginQuotaManager, QuotaManagerGuard};
pub use registry::{DatabaseHandle, DatabaseThread, OpenDatabaseRegistry};
pub use tracker::{DatabaseTracker, QuotaIncreaseHandler, QuotaRequest};

pub use websql_storage::{CatalogStore, StorageError};

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Initialize logging
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
