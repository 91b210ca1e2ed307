//! MetaFuse Share Storage
//!
//! SQLite persistence for share objects, share items and dataset locks.
//!
//! # Threading
//!
//! `rusqlite::Connection` is blocking, so every call opens its own connection
//! inside `tokio::task::spawn_blocking` and drops it before returning. No
//! connection is ever held across an `.await`.

use metafuse_share_core::{Result, ShareError};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod lock;
pub mod repository;

pub use lock::{DatasetLockCoordinator, LockRetryPolicy};
pub use repository::{
    ItemFilter, ItemHealth, ItemStatusChange, NewShareItem, NewShareObject, ShareFilter,
    ShareRepository, ShareTransition,
};

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection with the pragmas every share store connection needs.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Create the schema and switch to WAL.
///
/// Returns true when this call stamped the schema version.
pub async fn initialize_store(db_path: impl Into<PathBuf>) -> Result<bool> {
    let db_path = db_path.into();
    run_blocking(db_path.clone(), move |conn| {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let created = metafuse_share_core::init_share_store(conn)?;
        tracing::info!(
            db_path = %db_path.display(),
            journal_mode = %mode,
            schema_version = metafuse_share_core::SCHEMA_VERSION,
            created,
            "Share store initialized"
        );
        Ok(created)
    })
    .await
}

/// Run `f` against a fresh connection on the blocking pool.
pub(crate) async fn run_blocking<T, F>(db_path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = open_connection(&db_path)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| ShareError::Other(format!("Task join error: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_store_creates_schema_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shares.db");

        assert!(initialize_store(&path).await.unwrap());
        assert!(!initialize_store(&path).await.unwrap());
    }
}
