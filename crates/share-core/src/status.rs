//! Status and kind enums stored on share objects and items.
//!
//! Every enum is persisted as its text form, so the variant spelling doubles as
//! the wire and database representation.

use crate::{Result, ShareError};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ShareError;

            fn from_str(s: &str) -> Result<Self> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| {
                        ShareError::ValidationError(format!(
                            "Unknown {}: {}",
                            stringify!($name),
                            s
                        ))
                    })
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ShareError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Lifecycle status of a share object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareObjectStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    /// Revoke requested for some items, batch not started yet
    Revoked,
    #[serde(rename = "Share_In_Progress")]
    ShareInProgress,
    #[serde(rename = "Revoke_In_Progress")]
    RevokeInProgress,
    Processed,
    Deleted,
}

text_enum!(ShareObjectStatus {
    Draft => "Draft",
    Submitted => "Submitted",
    Approved => "Approved",
    Rejected => "Rejected",
    Revoked => "Revoked",
    ShareInProgress => "Share_In_Progress",
    RevokeInProgress => "Revoke_In_Progress",
    Processed => "Processed",
    Deleted => "Deleted",
});

impl ShareObjectStatus {
    /// Closed shares no longer block a new request for the same principal.
    pub fn is_closed(&self) -> bool {
        matches!(self, ShareObjectStatus::Rejected | ShareObjectStatus::Deleted)
    }

    /// Statuses during which a grant or revoke batch is running.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ShareObjectStatus::ShareInProgress | ShareObjectStatus::RevokeInProgress
        )
    }
}

/// Lifecycle status of a single share item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareItemStatus {
    PendingApproval,
    #[serde(rename = "Share_Approved")]
    ShareApproved,
    #[serde(rename = "Share_Rejected")]
    ShareRejected,
    #[serde(rename = "Share_In_Progress")]
    ShareInProgress,
    #[serde(rename = "Share_Succeeded")]
    ShareSucceeded,
    #[serde(rename = "Share_Failed")]
    ShareFailed,
    #[serde(rename = "Revoke_Approved")]
    RevokeApproved,
    #[serde(rename = "Revoke_In_Progress")]
    RevokeInProgress,
    #[serde(rename = "Revoke_Succeeded")]
    RevokeSucceeded,
    #[serde(rename = "Revoke_Failed")]
    RevokeFailed,
}

text_enum!(ShareItemStatus {
    PendingApproval => "PendingApproval",
    ShareApproved => "Share_Approved",
    ShareRejected => "Share_Rejected",
    ShareInProgress => "Share_In_Progress",
    ShareSucceeded => "Share_Succeeded",
    ShareFailed => "Share_Failed",
    RevokeApproved => "Revoke_Approved",
    RevokeInProgress => "Revoke_In_Progress",
    RevokeSucceeded => "Revoke_Succeeded",
    RevokeFailed => "Revoke_Failed",
});

impl ShareItemStatus {
    /// Items that still hold, or may still hold, access in the target
    /// environment. A share with any of these cannot be deleted.
    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            ShareItemStatus::ShareApproved
                | ShareItemStatus::ShareInProgress
                | ShareItemStatus::ShareSucceeded
                | ShareItemStatus::RevokeApproved
                | ShareItemStatus::RevokeInProgress
                | ShareItemStatus::RevokeFailed
        )
    }

    /// Failed statuses that reapply retries in place.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ShareItemStatus::ShareFailed | ShareItemStatus::RevokeFailed
        )
    }

    /// Items that may be detached from a share.
    pub fn is_removable(&self) -> bool {
        matches!(
            self,
            ShareItemStatus::PendingApproval
                | ShareItemStatus::ShareRejected
                | ShareItemStatus::ShareFailed
                | ShareItemStatus::RevokeSucceeded
        )
    }
}

/// Health of a shared item, orthogonal to its lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareItemHealthStatus {
    Healthy,
    Unhealthy,
    PendingVerify,
    #[serde(rename = "PendingReApply")]
    PendingReApply,
}

text_enum!(ShareItemHealthStatus {
    Healthy => "Healthy",
    Unhealthy => "Unhealthy",
    PendingVerify => "PendingVerify",
    PendingReApply => "PendingReApply",
});

/// Last action requested on an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestedAction {
    Share,
    Revoke,
}

text_enum!(RequestedAction {
    Share => "Share",
    Revoke => "Revoke",
});

/// Kind of principal receiving access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrincipalType {
    /// An environment team, acting through its team role
    Group,
    /// A role registered by a team for consumption outside the platform
    ConsumptionRole,
    /// A warehouse namespace consuming a datashare
    WarehouseNamespace,
}

text_enum!(PrincipalType {
    Group => "Group",
    ConsumptionRole => "ConsumptionRole",
    WarehouseNamespace => "WarehouseNamespace",
});

/// Kind of resource a share item points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareableType {
    /// Catalog table
    Table,
    /// Folder (object prefix) inside the dataset bucket
    StorageLocation,
    /// Whole dataset bucket
    S3Bucket,
    /// Table exposed through a warehouse datashare
    WarehouseTable,
}

text_enum!(ShareableType {
    Table => "Table",
    StorageLocation => "StorageLocation",
    S3Bucket => "S3Bucket",
    WarehouseTable => "WarehouseTable",
});

/// Access level requested for a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShareObjectDataPermission {
    Read,
    Write,
    Modify,
}

text_enum!(ShareObjectDataPermission {
    Read => "Read",
    Write => "Write",
    Modify => "Modify",
});
