//! MetaFuse Share Core
//!
//! Core types, state machine tables, and SQLite schema for MetaFuse dataset
//! sharing. A share object is one access request from a group (or a delegated
//! role) to a dataset; its items are the concrete resources being granted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod permissions;
pub mod state;
pub mod status;
pub mod validation;

pub use state::{ShareItemAction, ShareObjectAction};
pub use status::{
    PrincipalType, RequestedAction, ShareItemHealthStatus, ShareItemStatus,
    ShareObjectDataPermission, ShareObjectStatus, ShareableType,
};

/// An access request from one principal to one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareObject {
    /// Unique identifier of the share
    pub share_uri: String,
    /// Dataset being shared
    pub dataset_uri: String,
    /// Environment that owns the dataset
    pub source_environment_uri: String,
    /// Environment of the requesting principal
    pub target_environment_uri: String,
    /// Group that requested the share
    pub group_uri: String,
    /// Principal receiving access (group name, role id or warehouse namespace)
    pub principal_id: String,
    pub principal_type: PrincipalType,
    /// Name of the role that is granted access in the target environment
    pub principal_role_name: String,
    pub permissions: Vec<ShareObjectDataPermission>,
    pub status: ShareObjectStatus,
    /// Username of the requester
    pub owner: String,
    pub request_purpose: Option<String>,
    pub reject_purpose: Option<String>,
    /// Whether the consumer acknowledged the share after approval
    pub confirmed: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

impl ShareObject {
    /// Whether the share still counts toward the one-active-share rule.
    pub fn is_active(&self) -> bool {
        self.deleted.is_none() && !self.status.is_closed()
    }
}

/// A single resource attached to a share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareObjectItem {
    pub share_item_uri: String,
    pub share_uri: String,
    pub item_type: ShareableType,
    /// Reference to the shared resource (table id, folder id, bucket id)
    pub item_uri: String,
    /// Display name; for folders this is the object prefix
    pub item_name: String,
    pub permission: ShareObjectDataPermission,
    pub status: ShareItemStatus,
    /// Last requested action, decides whether reapply grants or revokes
    pub action: RequestedAction,
    pub health_status: Option<ShareItemHealthStatus>,
    pub health_message: Option<String>,
    pub last_verification_time: Option<DateTime<Utc>>,
    pub owner: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
}

/// Mutual-exclusion row for all grant/revoke/verify batches on a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetLock {
    pub dataset_uri: String,
    pub is_locked: bool,
    /// Holder of the lock, always set while `is_locked` is true
    pub acquired_by: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Item counts shown on a share overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareStatistics {
    pub shared_items: u64,
    pub revoked_items: u64,
    pub failed_items: u64,
    pub pending_items: u64,
}

impl ShareStatistics {
    /// Tally a list of item statuses.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ShareItemStatus>,
    {
        let mut stats = ShareStatistics::default();
        for status in statuses {
            match status {
                ShareItemStatus::ShareSucceeded => stats.shared_items += 1,
                ShareItemStatus::RevokeSucceeded => stats.revoked_items += 1,
                ShareItemStatus::ShareFailed | ShareItemStatus::RevokeFailed => {
                    stats.failed_items += 1
                }
                ShareItemStatus::PendingApproval => stats.pending_items += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Errors that can occur in sharing operations
#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Share object not found: {0}")]
    ShareNotFound(String),

    #[error("Share item not found: {0}")]
    ItemNotFound(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Unauthorized operation {action}: {message}")]
    UnauthorizedOperation { action: String, message: String },

    #[error("Invalid input for {param} ({value}): {constraint}")]
    InvalidInput {
        param: String,
        value: String,
        constraint: String,
    },

    #[error("Principal role not found during {action}: {message}")]
    PrincipalRoleNotFound { action: String, message: String },

    #[error("Resource lock timeout during {action}: {message}")]
    ResourceLockTimeout { action: String, message: String },

    #[error("Share items found during {action}: {message}")]
    ShareItemsFound { action: String, message: String },

    #[error("Invalid {entity} transition: cannot {action} from {from}")]
    InvalidTransition {
        entity: String,
        from: String,
        action: String,
    },

    #[error("Conflict detected: {0}")]
    ConflictError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ShareError {
    pub fn unauthorized(action: impl Into<String>, message: impl Into<String>) -> Self {
        ShareError::UnauthorizedOperation {
            action: action.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(
        param: impl Into<String>,
        value: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        ShareError::InvalidInput {
            param: param.into(),
            value: value.into(),
            constraint: constraint.into(),
        }
    }

    pub fn role_not_found(action: impl Into<String>, message: impl Into<String>) -> Self {
        ShareError::PrincipalRoleNotFound {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Errors raised before any state change, surfaced directly to the caller.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ShareError::ShareNotFound(_)
                | ShareError::ItemNotFound(_)
                | ShareError::DatasetNotFound(_)
                | ShareError::EnvironmentNotFound(_)
                | ShareError::UnauthorizedOperation { .. }
                | ShareError::InvalidInput { .. }
                | ShareError::PrincipalRoleNotFound { .. }
                | ShareError::ResourceLockTimeout { .. }
                | ShareError::ShareItemsFound { .. }
                | ShareError::InvalidTransition { .. }
        )
    }

    /// Whether a background task should expect the next run to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShareError::ResourceLockTimeout { .. } => true,
            ShareError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        ShareError::SerializationError(err.to_string())
    }
}

/// Result type for sharing operations
pub type Result<T> = std::result::Result<T, ShareError>;

/// Initialize the SQLite schema for share objects
///
/// Creates all necessary tables if they don't exist:
/// - `share_object`: one row per access request
/// - `share_object_item`: resources attached to a share
/// - `dataset_lock`: per-dataset mutual exclusion flag
pub fn init_sqlite_schema(conn: &rusqlite::Connection) -> Result<()> {
    let ddl = r#"
    CREATE TABLE IF NOT EXISTS share_object (
      share_uri TEXT PRIMARY KEY,
      dataset_uri TEXT NOT NULL,
      source_environment_uri TEXT NOT NULL,
      target_environment_uri TEXT NOT NULL,
      group_uri TEXT NOT NULL,
      principal_id TEXT NOT NULL,
      principal_type TEXT NOT NULL,
      principal_role_name TEXT NOT NULL,
      permissions TEXT NOT NULL,
      status TEXT NOT NULL,
      owner TEXT NOT NULL,
      request_purpose TEXT,
      reject_purpose TEXT,
      confirmed INTEGER NOT NULL DEFAULT 0,
      created TEXT NOT NULL,
      updated TEXT NOT NULL,
      deleted TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_share_object_dataset ON share_object(dataset_uri);
    CREATE INDEX IF NOT EXISTS idx_share_object_status ON share_object(status);

    -- At most one active share per (dataset, principal)
    CREATE UNIQUE INDEX IF NOT EXISTS idx_share_object_active_principal
      ON share_object(dataset_uri, principal_id, principal_type)
      WHERE deleted IS NULL AND status NOT IN ('Deleted', 'Rejected');

    CREATE TABLE IF NOT EXISTS share_object_item (
      share_item_uri TEXT PRIMARY KEY,
      share_uri TEXT NOT NULL,
      item_type TEXT NOT NULL,
      item_uri TEXT NOT NULL,
      item_name TEXT NOT NULL,
      permission TEXT NOT NULL,
      status TEXT NOT NULL,
      action TEXT NOT NULL,
      health_status TEXT,
      health_message TEXT,
      last_verification_time TEXT,
      owner TEXT NOT NULL,
      created TEXT NOT NULL,
      updated TEXT NOT NULL,
      deleted TEXT,
      FOREIGN KEY (share_uri) REFERENCES share_object(share_uri) ON DELETE CASCADE,
      UNIQUE(share_uri, item_uri)
    );

    CREATE INDEX IF NOT EXISTS idx_share_item_share ON share_object_item(share_uri);
    CREATE INDEX IF NOT EXISTS idx_share_item_status ON share_object_item(status);

    CREATE TABLE IF NOT EXISTS dataset_lock (
      dataset_uri TEXT PRIMARY KEY,
      is_locked INTEGER NOT NULL DEFAULT 0,
      acquired_by TEXT,
      acquired_at TEXT,
      CHECK (is_locked = 0 OR acquired_by IS NOT NULL)
    );

    -- Reapplier moves Unhealthy items to PendingReApply per share
    CREATE INDEX IF NOT EXISTS idx_share_item_health ON share_object_item(share_uri, health_status);
    "#;

    conn.execute_batch(ddl)?;
    Ok(())
}

/// Schema version stamped into `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Create the schema and stamp its version.
///
/// Returns true when this call stamped the database, false when it was
/// already current. A database written by a newer release is refused.
pub fn init_share_store(conn: &rusqlite::Connection) -> Result<bool> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(ShareError::Other(format!(
            "Share store schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    init_sqlite_schema(conn)?;
    if version == SCHEMA_VERSION {
        return Ok(false);
    }
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(true)
}
