//! Share object and share item persistence.
//!
//! Every status change is a compare-and-set against the status the caller
//! read, so two writers racing on the same share cannot both succeed. Object
//! transitions update the share row and its items in one transaction and
//! re-check the item consistency table before committing.

use crate::run_blocking;
use chrono::{DateTime, Utc};
use metafuse_share_core::state::check_item_consistency;
use metafuse_share_core::{
    PrincipalType, RequestedAction, Result, ShareError, ShareItemHealthStatus, ShareItemStatus,
    ShareObject, ShareObjectDataPermission, ShareObjectItem, ShareObjectStatus, ShareableType,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

const SHARE_COLUMNS: &str = "share_uri, dataset_uri, source_environment_uri, target_environment_uri, \
     group_uri, principal_id, principal_type, principal_role_name, permissions, status, owner, \
     request_purpose, reject_purpose, confirmed, created, updated, deleted";

const ITEM_COLUMNS: &str = "share_item_uri, share_uri, item_type, item_uri, item_name, permission, \
     status, action, health_status, health_message, last_verification_time, owner, created, \
     updated, deleted";

/// Fields needed to open a new share request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewShareObject {
    pub dataset_uri: String,
    pub source_environment_uri: String,
    pub target_environment_uri: String,
    pub group_uri: String,
    pub principal_id: String,
    pub principal_type: PrincipalType,
    pub principal_role_name: String,
    pub permissions: Vec<ShareObjectDataPermission>,
    pub owner: String,
    pub request_purpose: Option<String>,
}

/// Fields needed to attach a resource to a share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewShareItem {
    pub share_uri: String,
    pub item_type: ShareableType,
    pub item_uri: String,
    pub item_name: String,
    pub permission: ShareObjectDataPermission,
    pub owner: String,
}

/// Filter for listing share objects
#[derive(Debug, Clone, Default)]
pub struct ShareFilter {
    pub dataset_uri: Option<String>,
    pub status: Option<ShareObjectStatus>,
    /// Exclude deleted and rejected shares
    pub active_only: bool,
}

impl ShareFilter {
    pub fn active() -> Self {
        ShareFilter {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn for_dataset(mut self, dataset_uri: impl Into<String>) -> Self {
        self.dataset_uri = Some(dataset_uri.into());
        self
    }
}

/// Filter for listing the items of one share
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub statuses: Option<Vec<ShareItemStatus>>,
    pub health_statuses: Option<Vec<ShareItemHealthStatus>>,
    pub share_item_uris: Option<Vec<String>>,
}

impl ItemFilter {
    pub fn with_statuses(statuses: &[ShareItemStatus]) -> Self {
        ItemFilter {
            statuses: Some(statuses.to_vec()),
            ..Default::default()
        }
    }

    pub fn with_health(health: &[ShareItemHealthStatus]) -> Self {
        ItemFilter {
            health_statuses: Some(health.to_vec()),
            ..Default::default()
        }
    }

    pub fn with_uris(share_item_uris: &[String]) -> Self {
        ItemFilter {
            share_item_uris: Some(share_item_uris.to_vec()),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &ShareObjectItem) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&item.status) {
                return false;
            }
        }
        if let Some(health) = &self.health_statuses {
            match item.health_status {
                Some(h) if health.contains(&h) => {}
                _ => return false,
            }
        }
        if let Some(uris) = &self.share_item_uris {
            if !uris.contains(&item.share_item_uri) {
                return false;
            }
        }
        true
    }
}

/// Health columns written together on an item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemHealth {
    pub status: Option<ShareItemHealthStatus>,
    pub message: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl ItemHealth {
    /// No health recorded yet.
    pub fn unset() -> Self {
        ItemHealth::default()
    }

    /// Diagnostic message without a health verdict.
    pub fn message(message: impl Into<String>) -> Self {
        ItemHealth {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn healthy(at: DateTime<Utc>) -> Self {
        ItemHealth {
            status: Some(ShareItemHealthStatus::Healthy),
            message: None,
            verified_at: Some(at),
        }
    }

    pub fn unhealthy(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        ItemHealth {
            status: Some(ShareItemHealthStatus::Unhealthy),
            message: Some(message.into()),
            verified_at: Some(at),
        }
    }
}

/// Item status change applied as part of an object transition.
#[derive(Debug, Clone)]
pub struct ItemStatusChange {
    pub from: ShareItemStatus,
    pub to: ShareItemStatus,
    /// Restrict to these items; `None` changes every item in `from`
    pub share_item_uris: Option<Vec<String>>,
    /// Overwrite the item's requested action
    pub action: Option<RequestedAction>,
}

impl ItemStatusChange {
    pub fn all(from: ShareItemStatus, to: ShareItemStatus) -> Self {
        ItemStatusChange {
            from,
            to,
            share_item_uris: None,
            action: None,
        }
    }

    pub fn only(from: ShareItemStatus, to: ShareItemStatus, share_item_uris: Vec<String>) -> Self {
        ItemStatusChange {
            from,
            to,
            share_item_uris: Some(share_item_uris),
            action: None,
        }
    }

    pub fn with_action(mut self, action: RequestedAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// A share object transition with the item changes it drives.
#[derive(Debug, Clone)]
pub struct ShareTransition {
    pub share_uri: String,
    pub from: ShareObjectStatus,
    pub to: ShareObjectStatus,
    pub items: Vec<ItemStatusChange>,
    pub reject_purpose: Option<String>,
}

impl ShareTransition {
    pub fn new(share_uri: impl Into<String>, from: ShareObjectStatus, to: ShareObjectStatus) -> Self {
        ShareTransition {
            share_uri: share_uri.into(),
            from,
            to,
            items: Vec::new(),
            reject_purpose: None,
        }
    }

    pub fn with_items(mut self, change: ItemStatusChange) -> Self {
        self.items.push(change);
        self
    }
}

/// SQLite-backed store for share objects and items
#[derive(Debug, Clone)]
pub struct ShareRepository {
    db_path: PathBuf,
}

impl ShareRepository {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Create the schema if missing.
    pub async fn initialize(&self) -> Result<bool> {
        crate::initialize_store(self.db_path.clone()).await
    }

    /// Insert a new share in `Draft`.
    ///
    /// Fails with `ConflictError` when an active share already exists for the
    /// same dataset and principal.
    pub async fn create_share(&self, new: NewShareObject) -> Result<ShareObject> {
        let share_uri = uuid::Uuid::new_v4().to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let now = Utc::now();
            let permissions = serde_json::to_string(&new.permissions)?;

            let inserted = conn.execute(
                r#"
                INSERT INTO share_object (share_uri, dataset_uri, source_environment_uri,
                    target_environment_uri, group_uri, principal_id, principal_type,
                    principal_role_name, permissions, status, owner, request_purpose,
                    confirmed, created, updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, ?13, ?13)
                "#,
                params![
                    share_uri,
                    new.dataset_uri,
                    new.source_environment_uri,
                    new.target_environment_uri,
                    new.group_uri,
                    new.principal_id,
                    new.principal_type,
                    new.principal_role_name,
                    permissions,
                    ShareObjectStatus::Draft,
                    new.owner,
                    new.request_purpose,
                    now,
                ],
            );

            if let Err(e) = inserted {
                if is_constraint_violation(&e) {
                    return Err(ShareError::ConflictError(format!(
                        "An active share already exists for principal {} on dataset {}",
                        new.principal_id, new.dataset_uri
                    )));
                }
                return Err(e.into());
            }

            info!(
                share_uri = %share_uri,
                dataset_uri = %new.dataset_uri,
                principal_id = %new.principal_id,
                "Created share object"
            );

            get_share_inner(conn, &share_uri)?.ok_or(ShareError::ShareNotFound(share_uri))
        })
        .await
    }

    pub async fn get_share(&self, share_uri: &str) -> Result<Option<ShareObject>> {
        let share_uri = share_uri.to_string();
        run_blocking(self.db_path.clone(), move |conn| get_share_inner(conn, &share_uri)).await
    }

    /// The active share for a (dataset, principal) pair, if any.
    pub async fn find_active_share(
        &self,
        dataset_uri: &str,
        principal_id: &str,
        principal_type: PrincipalType,
    ) -> Result<Option<ShareObject>> {
        let dataset_uri = dataset_uri.to_string();
        let principal_id = principal_id.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let share = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM share_object
                         WHERE dataset_uri = ?1 AND principal_id = ?2 AND principal_type = ?3
                           AND deleted IS NULL AND status NOT IN ('Deleted', 'Rejected')",
                        SHARE_COLUMNS
                    ),
                    params![dataset_uri, principal_id, principal_type],
                    share_from_row,
                )
                .optional()?;
            Ok(share)
        })
        .await
    }

    pub async fn list_shares(&self, filter: ShareFilter) -> Result<Vec<ShareObject>> {
        run_blocking(self.db_path.clone(), move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM share_object
                 WHERE (?1 IS NULL OR dataset_uri = ?1)
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 = 0 OR (deleted IS NULL AND status NOT IN ('Deleted', 'Rejected')))
                 ORDER BY created, share_uri",
                SHARE_COLUMNS
            ))?;

            let shares = stmt
                .query_map(
                    params![filter.dataset_uri, filter.status, filter.active_only],
                    share_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(shares)
        })
        .await
    }

    /// Active shares, optionally restricted to one dataset.
    pub async fn list_active_shares(&self, dataset_uri: Option<&str>) -> Result<Vec<ShareObject>> {
        let mut filter = ShareFilter::active();
        filter.dataset_uri = dataset_uri.map(str::to_string);
        self.list_shares(filter).await
    }

    pub async fn set_request_purpose(&self, share_uri: &str, purpose: &str) -> Result<ShareObject> {
        self.set_purpose(share_uri, "request_purpose", purpose).await
    }

    pub async fn set_reject_purpose(&self, share_uri: &str, purpose: &str) -> Result<ShareObject> {
        self.set_purpose(share_uri, "reject_purpose", purpose).await
    }

    async fn set_purpose(
        &self,
        share_uri: &str,
        column: &'static str,
        purpose: &str,
    ) -> Result<ShareObject> {
        let share_uri = share_uri.to_string();
        let purpose = purpose.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let rows = conn.execute(
                &format!(
                    "UPDATE share_object SET {} = ?1, updated = ?2 WHERE share_uri = ?3",
                    column
                ),
                params![purpose, Utc::now(), share_uri],
            )?;
            if rows == 0 {
                return Err(ShareError::ShareNotFound(share_uri));
            }
            get_share_inner(conn, &share_uri)?.ok_or(ShareError::ShareNotFound(share_uri))
        })
        .await
    }

    /// Apply an object transition and its item changes atomically.
    pub async fn apply_transition(&self, transition: ShareTransition) -> Result<ShareObject> {
        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let rows = tx.execute(
                "UPDATE share_object
                 SET status = ?1, updated = ?2, reject_purpose = COALESCE(?3, reject_purpose)
                 WHERE share_uri = ?4 AND status = ?5",
                params![
                    transition.to,
                    now,
                    transition.reject_purpose,
                    transition.share_uri,
                    transition.from
                ],
            )?;
            if rows == 0 {
                return Err(status_conflict(&tx, &transition.share_uri, transition.from));
            }

            for change in &transition.items {
                match &change.share_item_uris {
                    None => {
                        tx.execute(
                            "UPDATE share_object_item
                             SET status = ?1, action = COALESCE(?2, action), updated = ?3
                             WHERE share_uri = ?4 AND status = ?5",
                            params![change.to, change.action, now, transition.share_uri, change.from],
                        )?;
                    }
                    Some(uris) => {
                        for uri in uris {
                            let rows = tx.execute(
                                "UPDATE share_object_item
                                 SET status = ?1, action = COALESCE(?2, action), updated = ?3
                                 WHERE share_item_uri = ?4 AND share_uri = ?5 AND status = ?6",
                                params![
                                    change.to,
                                    change.action,
                                    now,
                                    uri,
                                    transition.share_uri,
                                    change.from
                                ],
                            )?;
                            if rows != 1 {
                                return Err(ShareError::ConflictError(format!(
                                    "Share item {} is not in status {}",
                                    uri, change.from
                                )));
                            }
                        }
                    }
                }
            }

            let statuses = item_statuses_inner(&tx, &transition.share_uri)?;
            check_item_consistency(transition.to, statuses)?;

            let share = get_share_inner(&tx, &transition.share_uri)?
                .ok_or_else(|| ShareError::ShareNotFound(transition.share_uri.clone()))?;
            tx.commit()?;

            debug!(
                share_uri = %transition.share_uri,
                from = %transition.from,
                to = %transition.to,
                "Applied share transition"
            );
            Ok(share)
        })
        .await
    }

    /// Attach an item in `PendingApproval`, moving the share from
    /// `share_from` to `share_to` in the same transaction.
    pub async fn add_item(
        &self,
        new: NewShareItem,
        share_from: ShareObjectStatus,
        share_to: ShareObjectStatus,
    ) -> Result<ShareObjectItem> {
        let share_item_uri = uuid::Uuid::new_v4().to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let rows = tx.execute(
                "UPDATE share_object SET status = ?1, updated = ?2 WHERE share_uri = ?3 AND status = ?4",
                params![share_to, now, new.share_uri, share_from],
            )?;
            if rows == 0 {
                return Err(status_conflict(&tx, &new.share_uri, share_from));
            }

            let inserted = tx.execute(
                r#"
                INSERT INTO share_object_item (share_item_uri, share_uri, item_type, item_uri,
                    item_name, permission, status, action, owner, created, updated)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                "#,
                params![
                    share_item_uri,
                    new.share_uri,
                    new.item_type,
                    new.item_uri,
                    new.item_name,
                    new.permission,
                    ShareItemStatus::PendingApproval,
                    RequestedAction::Share,
                    new.owner,
                    now,
                ],
            );
            if let Err(e) = inserted {
                if is_constraint_violation(&e) {
                    return Err(ShareError::ConflictError(format!(
                        "Item {} is already attached to share {}",
                        new.item_uri, new.share_uri
                    )));
                }
                return Err(e.into());
            }

            let item = get_item_inner(&tx, &share_item_uri)?
                .ok_or_else(|| ShareError::ItemNotFound(share_item_uri.clone()))?;
            tx.commit()?;

            info!(
                share_uri = %item.share_uri,
                item_uri = %item.item_uri,
                item_type = %item.item_type,
                "Added share item"
            );
            Ok(item)
        })
        .await
    }

    /// Detach an item that is still in `item_status`.
    pub async fn remove_item(
        &self,
        share_item_uri: &str,
        item_status: ShareItemStatus,
        share_from: ShareObjectStatus,
        share_to: ShareObjectStatus,
    ) -> Result<()> {
        let share_item_uri = share_item_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let item = get_item_inner(&tx, &share_item_uri)?
                .ok_or_else(|| ShareError::ItemNotFound(share_item_uri.clone()))?;

            let rows = tx.execute(
                "UPDATE share_object SET status = ?1, updated = ?2 WHERE share_uri = ?3 AND status = ?4",
                params![share_to, Utc::now(), item.share_uri, share_from],
            )?;
            if rows == 0 {
                return Err(status_conflict(&tx, &item.share_uri, share_from));
            }

            let rows = tx.execute(
                "DELETE FROM share_object_item WHERE share_item_uri = ?1 AND status = ?2",
                params![share_item_uri, item_status],
            )?;
            if rows == 0 {
                return Err(ShareError::ConflictError(format!(
                    "Share item {} is no longer in status {}",
                    share_item_uri, item_status
                )));
            }
            tx.commit()?;

            info!(share_uri = %item.share_uri, item_uri = %item.item_uri, "Removed share item");
            Ok(())
        })
        .await
    }

    /// Move the share to `Deleted` and remove it together with its items.
    ///
    /// Fails with `ShareItemsFound` while any item may still hold access.
    pub async fn delete_share(&self, share_uri: &str, from: ShareObjectStatus) -> Result<()> {
        let share_uri = share_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let shared = item_statuses_inner(&tx, &share_uri)?
                .into_iter()
                .filter(ShareItemStatus::is_shared)
                .count();
            if shared > 0 {
                return Err(ShareError::ShareItemsFound {
                    action: "delete share object".to_string(),
                    message: format!(
                        "Revoke access to the {} shared item(s) before deleting share {}",
                        shared, share_uri
                    ),
                });
            }

            let rows = tx.execute(
                "UPDATE share_object SET status = ?1, updated = ?2 WHERE share_uri = ?3 AND status = ?4",
                params![ShareObjectStatus::Deleted, Utc::now(), share_uri, from],
            )?;
            if rows == 0 {
                return Err(status_conflict(&tx, &share_uri, from));
            }

            tx.execute(
                "DELETE FROM share_object_item WHERE share_uri = ?1",
                [&share_uri],
            )?;
            tx.execute("DELETE FROM share_object WHERE share_uri = ?1", [&share_uri])?;
            tx.commit()?;

            info!(share_uri = %share_uri, "Deleted share object");
            Ok(())
        })
        .await
    }

    pub async fn get_item(&self, share_item_uri: &str) -> Result<Option<ShareObjectItem>> {
        let share_item_uri = share_item_uri.to_string();
        run_blocking(self.db_path.clone(), move |conn| {
            get_item_inner(conn, &share_item_uri)
        })
        .await
    }

    /// The item pointing at `item_uri` inside a share, if attached.
    pub async fn find_item(&self, share_uri: &str, item_uri: &str) -> Result<Option<ShareObjectItem>> {
        let share_uri = share_uri.to_string();
        let item_uri = item_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let item = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM share_object_item WHERE share_uri = ?1 AND item_uri = ?2",
                        ITEM_COLUMNS
                    ),
                    params![share_uri, item_uri],
                    item_from_row,
                )
                .optional()?;
            Ok(item)
        })
        .await
    }

    pub async fn list_items(&self, share_uri: &str, filter: ItemFilter) -> Result<Vec<ShareObjectItem>> {
        let share_uri = share_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM share_object_item WHERE share_uri = ?1 ORDER BY created, share_item_uri",
                ITEM_COLUMNS
            ))?;
            let items = stmt
                .query_map([&share_uri], item_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(items.into_iter().filter(|i| filter.matches(i)).collect())
        })
        .await
    }

    pub async fn item_statuses(&self, share_uri: &str) -> Result<Vec<ShareItemStatus>> {
        let share_uri = share_uri.to_string();
        run_blocking(self.db_path.clone(), move |conn| {
            item_statuses_inner(conn, &share_uri)
        })
        .await
    }

    /// Record the outcome of a grant or revoke on one item.
    pub async fn update_item_status(
        &self,
        share_item_uri: &str,
        from: ShareItemStatus,
        to: ShareItemStatus,
        health: ItemHealth,
    ) -> Result<ShareObjectItem> {
        let share_item_uri = share_item_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let rows = conn.execute(
                "UPDATE share_object_item
                 SET status = ?1, health_status = ?2, health_message = ?3,
                     last_verification_time = ?4, updated = ?5
                 WHERE share_item_uri = ?6 AND status = ?7",
                params![
                    to,
                    health.status,
                    health.message,
                    health.verified_at,
                    Utc::now(),
                    share_item_uri,
                    from
                ],
            )?;
            if rows == 0 {
                return match get_item_inner(conn, &share_item_uri)? {
                    None => Err(ShareError::ItemNotFound(share_item_uri)),
                    Some(item) => Err(ShareError::ConflictError(format!(
                        "Share item {} is {} (expected {})",
                        share_item_uri, item.status, from
                    ))),
                };
            }
            get_item_inner(conn, &share_item_uri)?.ok_or(ShareError::ItemNotFound(share_item_uri))
        })
        .await
    }

    /// Overwrite the health columns of one item without touching its status.
    pub async fn update_item_health(
        &self,
        share_item_uri: &str,
        health: ItemHealth,
    ) -> Result<ShareObjectItem> {
        let share_item_uri = share_item_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let rows = conn.execute(
                "UPDATE share_object_item
                 SET health_status = ?1, health_message = ?2, last_verification_time = ?3, updated = ?4
                 WHERE share_item_uri = ?5",
                params![
                    health.status,
                    health.message,
                    health.verified_at,
                    Utc::now(),
                    share_item_uri
                ],
            )?;
            if rows == 0 {
                return Err(ShareError::ItemNotFound(share_item_uri));
            }
            get_item_inner(conn, &share_item_uri)?.ok_or(ShareError::ItemNotFound(share_item_uri))
        })
        .await
    }

    /// Set only the health status of the given items, keeping their message.
    pub async fn mark_items_health(
        &self,
        share_uri: &str,
        share_item_uris: &[String],
        health_status: ShareItemHealthStatus,
    ) -> Result<usize> {
        let share_uri = share_uri.to_string();
        let share_item_uris = share_item_uris.to_vec();

        run_blocking(self.db_path.clone(), move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut updated = 0;
            for uri in &share_item_uris {
                updated += tx.execute(
                    "UPDATE share_object_item SET health_status = ?1, updated = ?2
                     WHERE share_item_uri = ?3 AND share_uri = ?4",
                    params![health_status, now, uri, share_uri],
                )?;
            }
            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Move every item of a share from one health status to another.
    pub async fn bulk_update_health(
        &self,
        share_uri: &str,
        from: ShareItemHealthStatus,
        to: ShareItemHealthStatus,
    ) -> Result<usize> {
        let share_uri = share_uri.to_string();

        run_blocking(self.db_path.clone(), move |conn| {
            let updated = conn.execute(
                "UPDATE share_object_item SET health_status = ?1, updated = ?2
                 WHERE share_uri = ?3 AND health_status = ?4",
                params![to, Utc::now(), share_uri, from],
            )?;
            if updated > 0 {
                debug!(share_uri = %share_uri, from = %from, to = %to, updated, "Bulk health update");
            }
            Ok(updated)
        })
        .await
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn status_conflict(conn: &Connection, share_uri: &str, expected: ShareObjectStatus) -> ShareError {
    match get_share_inner(conn, share_uri) {
        Ok(Some(share)) => ShareError::ConflictError(format!(
            "Share {} is {} (expected {})",
            share_uri, share.status, expected
        )),
        Ok(None) => ShareError::ShareNotFound(share_uri.to_string()),
        Err(e) => e,
    }
}

fn get_share_inner(conn: &Connection, share_uri: &str) -> Result<Option<ShareObject>> {
    let share = conn
        .query_row(
            &format!("SELECT {} FROM share_object WHERE share_uri = ?1", SHARE_COLUMNS),
            [share_uri],
            share_from_row,
        )
        .optional()?;
    Ok(share)
}

fn get_item_inner(conn: &Connection, share_item_uri: &str) -> Result<Option<ShareObjectItem>> {
    let item = conn
        .query_row(
            &format!(
                "SELECT {} FROM share_object_item WHERE share_item_uri = ?1",
                ITEM_COLUMNS
            ),
            [share_item_uri],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

fn item_statuses_inner(conn: &Connection, share_uri: &str) -> Result<Vec<ShareItemStatus>> {
    let mut stmt = conn.prepare("SELECT status FROM share_object_item WHERE share_uri = ?1")?;
    let statuses = stmt
        .query_map([share_uri], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(statuses)
}

fn share_from_row(row: &Row<'_>) -> rusqlite::Result<ShareObject> {
    let permissions_json: String = row.get(8)?;
    let permissions = serde_json::from_str(&permissions_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(ShareObject {
        share_uri: row.get(0)?,
        dataset_uri: row.get(1)?,
        source_environment_uri: row.get(2)?,
        target_environment_uri: row.get(3)?,
        group_uri: row.get(4)?,
        principal_id: row.get(5)?,
        principal_type: row.get(6)?,
        principal_role_name: row.get(7)?,
        permissions,
        status: row.get(9)?,
        owner: row.get(10)?,
        request_purpose: row.get(11)?,
        reject_purpose: row.get(12)?,
        confirmed: row.get(13)?,
        created: row.get(14)?,
        updated: row.get(15)?,
        deleted: row.get(16)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ShareObjectItem> {
    Ok(ShareObjectItem {
        share_item_uri: row.get(0)?,
        share_uri: row.get(1)?,
        item_type: row.get(2)?,
        item_uri: row.get(3)?,
        item_name: row.get(4)?,
        permission: row.get(5)?,
        status: row.get(6)?,
        action: row.get(7)?,
        health_status: row.get(8)?,
        health_message: row.get(9)?,
        last_verification_time: row.get(10)?,
        owner: row.get(11)?,
        created: row.get(12)?,
        updated: row.get(13)?,
        deleted: row.get(14)?,
    })
}
