//! Share lifecycle orchestration.
//!
//! [`ShareService`] drives share objects and their items through the state
//! machine defined in `metafuse_share_core::state`. Every grant, revoke and
//! verify batch runs inside the dataset lock; precondition errors abort the
//! call before anything changes, while item-level failures from processors
//! are recorded on the items and never returned to the caller.

use crate::config::SharingConfig;
use crate::context::{user_role_for_share, RequestContext, ShareObjectRole};
use crate::directory::{CatalogDirectory, Dataset, Environment, IdentityProvider};
use crate::notification::{ShareNotification, ShareNotifier};
use crate::policy::ResourcePolicyService;
use crate::processor::{BatchOutcome, HealthOutcome, ItemOutcome, ShareData, VerifyOutcome};
use crate::registry::SharingRegistry;
use crate::tasks::SweepReport;
use crate::validator::CreateShareCheck;
use chrono::Utc;
use metafuse_share_core::permissions::{PermissionRegistry, ShareSide, SHARE_OBJECT_RESOURCE};
use metafuse_share_core::validation::{
    validate_identifier, validate_item_name, validate_item_uris, validate_purpose,
};
use metafuse_share_core::{
    PrincipalType, RequestedAction, Result, ShareError, ShareItemHealthStatus, ShareItemStatus,
    ShareObject, ShareObjectAction, ShareObjectDataPermission, ShareObjectItem, ShareObjectStatus,
    ShareStatistics, ShareableType,
};
use metafuse_share_storage::{
    DatasetLockCoordinator, ItemFilter, ItemHealth, ItemStatusChange, NewShareItem,
    NewShareObject, ShareRepository, ShareTransition,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Username recorded as approver when a dataset approves shares automatically.
pub const AUTO_APPROVER: &str = "auto-approval";

/// External collaborators the service calls but does not own
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn CatalogDirectory>,
    pub identity: Arc<dyn IdentityProvider>,
    pub policies: Arc<dyn ResourcePolicyService>,
    pub notifier: Arc<dyn ShareNotifier>,
}

/// A resource to attach to a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareItemRequest {
    pub item_type: ShareableType,
    pub item_uri: String,
    pub item_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShareRequest {
    pub dataset_uri: String,
    /// Environment of the requesting principal
    pub environment_uri: String,
    pub group_uri: String,
    pub principal_id: String,
    pub principal_type: PrincipalType,
    /// Required for warehouse namespaces; resolved from the environment otherwise
    pub principal_role_name: Option<String>,
    pub permissions: Vec<ShareObjectDataPermission>,
    pub request_purpose: Option<String>,
    pub item: Option<ShareItemRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedShare {
    pub share: ShareObject,
    pub item: Option<ShareObjectItem>,
    /// The request reused an active share for the same dataset and principal
    pub already_existed: bool,
}

/// Health verdicts written by one verify batch, as share item uris
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<String>,
}

/// Items retried by one reapply batch, as share item uris
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapplyReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl ReapplyReport {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequiredRole {
    Requester,
    Approver,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOperation {
    Grant,
    Revoke,
}

impl BatchOperation {
    fn as_str(&self) -> &'static str {
        match self {
            BatchOperation::Grant => "grant",
            BatchOperation::Revoke => "revoke",
        }
    }
}

#[derive(Clone)]
pub struct ShareService {
    repo: ShareRepository,
    locks: DatasetLockCoordinator,
    registry: Arc<SharingRegistry>,
    directory: Arc<dyn CatalogDirectory>,
    identity: Arc<dyn IdentityProvider>,
    policies: Arc<dyn ResourcePolicyService>,
    notifier: Arc<dyn ShareNotifier>,
}

impl ShareService {
    pub fn new(config: &SharingConfig, registry: SharingRegistry, collaborators: Collaborators) -> Self {
        Self {
            repo: ShareRepository::new(config.db_path.clone()),
            locks: DatasetLockCoordinator::new(config.db_path.clone(), config.lock_retry_policy()),
            registry: Arc::new(registry),
            directory: collaborators.directory,
            identity: collaborators.identity,
            policies: collaborators.policies,
            notifier: collaborators.notifier,
        }
    }

    pub fn repository(&self) -> &ShareRepository {
        &self.repo
    }

    pub fn locks(&self) -> &DatasetLockCoordinator {
        &self.locks
    }

    // ========================================================================
    // Requester operations
    // ========================================================================

    /// Open a share request, or reuse the active one for the same dataset and
    /// principal, and attach the requested item.
    pub async fn create_share_object(
        &self,
        ctx: &RequestContext,
        request: CreateShareRequest,
    ) -> Result<CreatedShare> {
        const ACTION: &str = "create share object";

        validate_identifier("datasetUri", &request.dataset_uri)?;
        validate_identifier("environmentUri", &request.environment_uri)?;
        validate_identifier("groupUri", &request.group_uri)?;
        validate_identifier("principalId", &request.principal_id)?;
        if let Some(purpose) = &request.request_purpose {
            validate_purpose("requestPurpose", purpose)?;
        }
        if let Some(item) = &request.item {
            validate_identifier("itemUri", &item.item_uri)?;
            validate_item_name(&item.item_name)?;
        }
        if request.permissions.is_empty() {
            return Err(ShareError::invalid_input(
                "permissions",
                "[]",
                "at least one permission is required",
            ));
        }

        let dataset = self.dataset(&request.dataset_uri).await?;
        let environment = self.environment(&request.environment_uri).await?;

        if !ctx.is_member(&request.group_uri) {
            return Err(ShareError::unauthorized(
                ACTION,
                format!("User {} is not a member of team {}", ctx.username, request.group_uri),
            ));
        }
        if !environment.has_group(&request.group_uri) {
            return Err(ShareError::unauthorized(
                ACTION,
                format!(
                    "Team {} is not invited to environment {}",
                    request.group_uri, environment.name
                ),
            ));
        }

        let principal_role_name = match request.principal_role_name.clone().or_else(|| {
            environment
                .principal_role_name(request.principal_type, &request.principal_id)
                .map(str::to_string)
        }) {
            Some(role) => role,
            None => {
                return Err(ShareError::role_not_found(
                    ACTION,
                    format!(
                        "No role found for principal {} in environment {}",
                        request.principal_id, environment.name
                    ),
                ))
            }
        };

        let validator = self.registry.validator(dataset.kind())?;
        validator
            .validate_share_object_create(&CreateShareCheck {
                dataset: &dataset,
                environment: &environment,
                group_uri: &request.group_uri,
                principal_id: &request.principal_id,
                principal_type: request.principal_type,
                principal_role_name: &principal_role_name,
                permissions: &request.permissions,
            })
            .await?;

        let existing = self
            .repo
            .find_active_share(&request.dataset_uri, &request.principal_id, request.principal_type)
            .await?;

        let (share, already_existed) = match existing {
            Some(share) => (share, true),
            None => {
                let new = NewShareObject {
                    dataset_uri: request.dataset_uri.clone(),
                    source_environment_uri: dataset.environment_uri.clone(),
                    target_environment_uri: request.environment_uri.clone(),
                    group_uri: request.group_uri.clone(),
                    principal_id: request.principal_id.clone(),
                    principal_type: request.principal_type,
                    principal_role_name,
                    permissions: request.permissions.clone(),
                    owner: ctx.username.clone(),
                    request_purpose: request.request_purpose.clone(),
                };
                match self.repo.create_share(new).await {
                    Ok(share) => {
                        self.attach_share_policies(&share, &dataset).await;
                        (share, false)
                    }
                    // Lost a race against a concurrent create for the same principal
                    Err(ShareError::ConflictError(_)) => {
                        let share = self
                            .repo
                            .find_active_share(
                                &request.dataset_uri,
                                &request.principal_id,
                                request.principal_type,
                            )
                            .await?
                            .ok_or_else(|| {
                                ShareError::ConflictError(format!(
                                    "Share for principal {} on dataset {} changed concurrently",
                                    request.principal_id, request.dataset_uri
                                ))
                            })?;
                        (share, true)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let item = match &request.item {
            Some(item) => match self.repo.find_item(&share.share_uri, &item.item_uri).await? {
                Some(existing) => Some(existing),
                None => Some(self.attach_item(&share, item, &ctx.username).await?),
            },
            None => None,
        };

        let share = self.share(&share.share_uri).await?;
        info!(
            share_uri = %share.share_uri,
            dataset_uri = %share.dataset_uri,
            already_existed,
            "Share object ready"
        );
        Ok(CreatedShare {
            share,
            item,
            already_existed,
        })
    }

    pub async fn add_shared_item(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        item: ShareItemRequest,
    ) -> Result<ShareObjectItem> {
        validate_identifier("itemUri", &item.item_uri)?;
        validate_item_name(&item.item_name)?;

        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "add share item", RequiredRole::Requester)
            .await?;
        self.attach_item(&share, &item, &ctx.username).await
    }

    pub async fn remove_shared_item(&self, ctx: &RequestContext, share_item_uri: &str) -> Result<()> {
        const ACTION: &str = "remove share item";

        let item = self
            .repo
            .get_item(share_item_uri)
            .await?
            .ok_or_else(|| ShareError::ItemNotFound(share_item_uri.to_string()))?;
        let share = self.share(&item.share_uri).await?;
        self.authorize(ctx, &share, ACTION, RequiredRole::Requester)
            .await?;

        if !item.status.is_removable() {
            return Err(ShareError::ShareItemsFound {
                action: ACTION.to_string(),
                message: format!(
                    "Item {} is {} and must be revoked before it can be removed",
                    item.item_name, item.status
                ),
            });
        }

        let next = share.status.transition(ShareObjectAction::RemoveItem)?;
        self.repo
            .remove_item(share_item_uri, item.status, share.status, next)
            .await
    }

    /// Send the share to its approvers. Datasets with auto-approval approve
    /// it right away.
    pub async fn submit_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
    ) -> Result<ShareObject> {
        const ACTION: &str = "submit share object";

        let share = self.share(share_uri).await?;
        let dataset = self
            .authorize(ctx, &share, ACTION, RequiredRole::Requester)
            .await?;
        let next = share.status.transition(ShareObjectAction::Submit)?;

        let pending = self
            .repo
            .list_items(share_uri, ItemFilter::with_statuses(&[ShareItemStatus::PendingApproval]))
            .await?;
        if pending.is_empty() {
            return Err(ShareError::ShareItemsFound {
                action: ACTION.to_string(),
                message: format!("Share {} has no items pending approval", share_uri),
            });
        }

        let environment = self.environment(&share.target_environment_uri).await?;
        let validator = self.registry.validator(dataset.kind())?;
        validator
            .validate_share_object_create(&CreateShareCheck {
                dataset: &dataset,
                environment: &environment,
                group_uri: &share.group_uri,
                principal_id: &share.principal_id,
                principal_type: share.principal_type,
                principal_role_name: &share.principal_role_name,
                permissions: &share.permissions,
            })
            .await?;
        validator
            .validate_share_object_submit(&dataset, &environment, &share)
            .await?;

        let share = self
            .repo
            .apply_transition(ShareTransition::new(share_uri, share.status, next))
            .await?;
        info!(share_uri = %share_uri, items = pending.len(), "Share object submitted");

        self.notify(ShareNotification::ShareObjectSubmitted {
            share_uri: share.share_uri.clone(),
            dataset_uri: share.dataset_uri.clone(),
            requester: ctx.username.clone(),
        })
        .await;

        if dataset.auto_approval_enabled {
            info!(share_uri = %share_uri, "Dataset approves shares automatically");
            return self.approve(share, &dataset, AUTO_APPROVER).await;
        }
        Ok(share)
    }

    pub async fn update_request_purpose(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        purpose: &str,
    ) -> Result<ShareObject> {
        validate_purpose("requestPurpose", purpose)?;
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "update request purpose", RequiredRole::Requester)
            .await?;
        self.repo.set_request_purpose(share_uri, purpose).await
    }

    /// Delete a share that no longer holds access, with its policies.
    pub async fn delete_share_object(&self, ctx: &RequestContext, share_uri: &str) -> Result<()> {
        const ACTION: &str = "delete share object";

        let share = self.share(share_uri).await?;
        let dataset = self
            .authorize(ctx, &share, ACTION, RequiredRole::Requester)
            .await?;
        share.status.transition(ShareObjectAction::Delete)?;

        let shared = self
            .repo
            .item_statuses(share_uri)
            .await?
            .into_iter()
            .filter(ShareItemStatus::is_shared)
            .count();
        if shared > 0 {
            return Err(ShareError::ShareItemsFound {
                action: ACTION.to_string(),
                message: format!(
                    "Revoke access to the {} shared item(s) before deleting share {}",
                    shared, share_uri
                ),
            });
        }

        self.delete_share_policies(&share, &dataset).await;
        self.repo.delete_share(share_uri, share.status).await
    }

    // ========================================================================
    // Approver operations
    // ========================================================================

    /// Approve a submitted share and grant its items.
    ///
    /// Approving a share that was already processed and has nothing pending
    /// returns it unchanged.
    pub async fn approve_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
    ) -> Result<ShareObject> {
        let share = self.share(share_uri).await?;
        let dataset = self
            .authorize(ctx, &share, "approve share object", RequiredRole::Approver)
            .await?;

        if share.status == ShareObjectStatus::Processed && !self.has_pending_items(share_uri).await? {
            debug!(share_uri = %share_uri, "Share already processed, nothing to approve");
            return Ok(share);
        }

        self.approve(share, &dataset, &ctx.username).await
    }

    pub async fn reject_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        reason: Option<String>,
    ) -> Result<ShareObject> {
        if let Some(reason) = &reason {
            validate_purpose("rejectPurpose", reason)?;
        }

        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "reject share object", RequiredRole::Approver)
            .await?;
        let next = share.status.transition(ShareObjectAction::Reject)?;

        let mut transition = ShareTransition::new(share_uri, share.status, next).with_items(
            ItemStatusChange::all(ShareItemStatus::PendingApproval, ShareItemStatus::ShareRejected),
        );
        transition.reject_purpose = reason.clone();
        let share = self.repo.apply_transition(transition).await?;
        info!(share_uri = %share_uri, "Share object rejected");

        self.notify(ShareNotification::ShareObjectRejected {
            share_uri: share.share_uri.clone(),
            dataset_uri: share.dataset_uri.clone(),
            approver: ctx.username.clone(),
            reason,
        })
        .await;
        Ok(share)
    }

    pub async fn update_reject_purpose(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        purpose: &str,
    ) -> Result<ShareObject> {
        validate_purpose("rejectPurpose", purpose)?;
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "update reject purpose", RequiredRole::Approver)
            .await?;
        self.repo.set_reject_purpose(share_uri, purpose).await
    }

    // ========================================================================
    // Operations open to both sides
    // ========================================================================

    /// Revoke access to shared items.
    pub async fn revoke_items_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        share_item_uris: Vec<String>,
    ) -> Result<ShareObject> {
        const ACTION: &str = "revoke items share object";

        validate_item_uris(&share_item_uris)?;
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, ACTION, RequiredRole::Either)
            .await?;
        share.status.transition(ShareObjectAction::RevokeItems)?;

        let items = self
            .repo
            .list_items(share_uri, ItemFilter::with_uris(&share_item_uris))
            .await?;
        for uri in &share_item_uris {
            match items.iter().find(|i| &i.share_item_uri == uri) {
                None => return Err(ShareError::ItemNotFound(uri.clone())),
                Some(item) if item.status != ShareItemStatus::ShareSucceeded => {
                    return Err(ShareError::invalid_input(
                        "itemUris",
                        uri.as_str(),
                        format!("only {} items can be revoked (item is {})", ShareItemStatus::ShareSucceeded, item.status),
                    ))
                }
                Some(_) => {}
            }
        }

        let data = self.share_data(&share).await?;
        self.with_dataset_lock(&share, ACTION, || self.revoke_locked(data, share_item_uris))
            .await
    }

    /// Check shared items against the external resources. Defaults to every
    /// shared item of the share.
    pub async fn verify_items_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        share_item_uris: Option<Vec<String>>,
    ) -> Result<VerifyReport> {
        if let Some(uris) = &share_item_uris {
            validate_item_uris(uris)?;
        }
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "verify items share object", RequiredRole::Either)
            .await?;
        self.verify_share(share_uri, share_item_uris.as_deref()).await
    }

    /// Retry the given items. Eligible items are failed ones and shared items
    /// whose health is unhealthy or pending reapply.
    pub async fn reapply_items_share_object(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        share_item_uris: Vec<String>,
    ) -> Result<ReapplyReport> {
        validate_item_uris(&share_item_uris)?;
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "reapply items share object", RequiredRole::Either)
            .await?;

        let items = self
            .repo
            .list_items(share_uri, ItemFilter::with_uris(&share_item_uris))
            .await?;
        for uri in &share_item_uris {
            let item = items
                .iter()
                .find(|i| &i.share_item_uri == uri)
                .ok_or_else(|| ShareError::ItemNotFound(uri.clone()))?;
            if !is_reapplicable(item) {
                let health = item
                    .health_status
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "unverified".to_string());
                return Err(ShareError::invalid_input(
                    "itemUris",
                    uri.as_str(),
                    format!(
                        "item in status {} with health {} cannot be reapplied",
                        item.status, health
                    ),
                ));
            }
        }

        self.reapply_share(share_uri, Some(&share_item_uris)).await
    }

    /// Verify every active share of a dataset. Only the dataset's approvers
    /// may run this; one failing share does not stop the others.
    pub async fn verify_dataset_share_objects(
        &self,
        ctx: &RequestContext,
        dataset_uri: &str,
    ) -> Result<SweepReport> {
        validate_identifier("datasetUri", dataset_uri)?;
        let dataset = self.dataset(dataset_uri).await?;
        if !dataset.approver_groups().into_iter().any(|g| ctx.is_member(g)) {
            return Err(ShareError::unauthorized(
                "verify dataset share objects",
                format!(
                    "User {} does not administer dataset {}",
                    ctx.username, dataset.name
                ),
            ));
        }

        let mut report = SweepReport::default();
        for share in self.repo.list_active_shares(Some(dataset_uri)).await? {
            match self.verify_share(&share.share_uri, None).await {
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!(share_uri = %share.share_uri, error = %e, "Share verification failed");
                    report
                        .errors
                        .push(format!("{}: {}", share.share_uri, e));
                }
            }
        }
        Ok(report)
    }

    // ========================================================================
    // Read side
    // ========================================================================

    pub async fn get_share_object(&self, ctx: &RequestContext, share_uri: &str) -> Result<ShareObject> {
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "get share object", RequiredRole::Either)
            .await?;
        Ok(share)
    }

    pub async fn list_share_items(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
        filter: ItemFilter,
    ) -> Result<Vec<ShareObjectItem>> {
        let share = self.share(share_uri).await?;
        self.authorize(ctx, &share, "list shared items", RequiredRole::Either)
            .await?;
        self.repo.list_items(share_uri, filter).await
    }

    /// The caller's role on a share.
    pub async fn user_role_for_share(
        &self,
        ctx: &RequestContext,
        share_uri: &str,
    ) -> Result<ShareObjectRole> {
        let share = self.share(share_uri).await?;
        let dataset = self.dataset(&share.dataset_uri).await?;
        Ok(user_role_for_share(ctx, &share, &dataset))
    }

    pub async fn share_statistics(&self, share_uri: &str) -> Result<ShareStatistics> {
        self.share(share_uri).await?;
        let statuses = self.repo.item_statuses(share_uri).await?;
        Ok(ShareStatistics::from_statuses(statuses))
    }

    // ========================================================================
    // Batches, also driven by the background tasks
    // ========================================================================

    /// Verify shared items of a share and record their health. Runs without
    /// caller authorization.
    pub async fn verify_share(
        &self,
        share_uri: &str,
        share_item_uris: Option<&[String]>,
    ) -> Result<VerifyReport> {
        let share = self.share(share_uri).await?;
        if !share.is_active() {
            return Ok(VerifyReport::default());
        }
        let data = self.share_data(&share).await?;
        let uris = share_item_uris.map(<[String]>::to_vec);
        self.with_dataset_lock(&share, "verify share items", || self.verify_locked(data, uris))
            .await
    }

    /// Retry failed and unhealthy items of a share. Runs without caller
    /// authorization.
    pub async fn reapply_share(
        &self,
        share_uri: &str,
        share_item_uris: Option<&[String]>,
    ) -> Result<ReapplyReport> {
        let share = self.share(share_uri).await?;
        if !share.is_active() {
            return Ok(ReapplyReport::default());
        }
        let data = self.share_data(&share).await?;
        let uris = share_item_uris.map(<[String]>::to_vec);
        self.with_dataset_lock(&share, "reapply share items", || self.reapply_locked(data, uris))
            .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn approve(&self, share: ShareObject, dataset: &Dataset, approver: &str) -> Result<ShareObject> {
        const ACTION: &str = "approve share object";

        // Approved and Share_In_Progress are either held by a running batch or
        // left by an interrupted one; the check under the lock decides
        if !matches!(
            share.status,
            ShareObjectStatus::Approved | ShareObjectStatus::ShareInProgress
        ) {
            share.status.transition(ShareObjectAction::Approve)?;
        }
        let environment = self.environment(&share.target_environment_uri).await?;
        self.registry
            .validator(dataset.kind())?
            .validate_share_object_approve(dataset, &environment, &share)
            .await?;

        let data = self.share_data(&share).await?;
        self.with_dataset_lock(&share, ACTION, || self.approve_locked(data, approver))
            .await
    }

    async fn approve_locked(&self, data: ShareData, approver: &str) -> Result<ShareObject> {
        let share_uri = data.share.share_uri.clone();

        // Another approve may have finished while this one waited for the lock
        let current = self.share(&share_uri).await?;
        match current.status {
            ShareObjectStatus::Processed if !self.has_pending_items(&share_uri).await? => {
                return Ok(current);
            }
            // Nothing else runs while the lock is held, so this batch was interrupted
            ShareObjectStatus::Approved | ShareObjectStatus::ShareInProgress => {
                warn!(share_uri = %share_uri, status = %current.status, "Resuming interrupted grant batch");
                let data = ShareData {
                    share: current,
                    ..data
                };
                return self.run_batch(BatchOperation::Grant, data).await;
            }
            _ => {}
        }
        let next = current.status.transition(ShareObjectAction::Approve)?;

        let approved = self
            .repo
            .apply_transition(
                ShareTransition::new(&share_uri, current.status, next).with_items(
                    ItemStatusChange::all(ShareItemStatus::PendingApproval, ShareItemStatus::ShareApproved)
                        .with_action(RequestedAction::Share),
                ),
            )
            .await?;
        info!(share_uri = %share_uri, approver = %approver, "Share object approved");

        self.notify(ShareNotification::ShareObjectApproved {
            share_uri: share_uri.clone(),
            dataset_uri: approved.dataset_uri.clone(),
            approver: approver.to_string(),
        })
        .await;

        let data = ShareData {
            share: approved,
            ..data
        };
        self.run_batch(BatchOperation::Grant, data).await
    }

    async fn revoke_locked(&self, data: ShareData, share_item_uris: Vec<String>) -> Result<ShareObject> {
        let share_uri = data.share.share_uri.clone();

        let current = self.share(&share_uri).await?;
        let next = current.status.transition(ShareObjectAction::RevokeItems)?;
        let revoked = self
            .repo
            .apply_transition(
                ShareTransition::new(&share_uri, current.status, next).with_items(
                    ItemStatusChange::only(
                        ShareItemStatus::ShareSucceeded,
                        ShareItemStatus::RevokeApproved,
                        share_item_uris,
                    )
                    .with_action(RequestedAction::Revoke),
                ),
            )
            .await?;
        info!(share_uri = %share_uri, "Share items approved for revoke");

        let data = ShareData {
            share: revoked,
            ..data
        };
        self.run_batch(BatchOperation::Revoke, data).await
    }

    /// Start a grant or revoke batch, record each item's outcome and finish
    /// the share. Must run under the dataset lock.
    async fn run_batch(&self, operation: BatchOperation, data: ShareData) -> Result<ShareObject> {
        let share_uri = data.share.share_uri.clone();
        let (approved, running, succeeded, failed) = match operation {
            BatchOperation::Grant => (
                ShareItemStatus::ShareApproved,
                ShareItemStatus::ShareInProgress,
                ShareItemStatus::ShareSucceeded,
                ShareItemStatus::ShareFailed,
            ),
            BatchOperation::Revoke => (
                ShareItemStatus::RevokeApproved,
                ShareItemStatus::RevokeInProgress,
                ShareItemStatus::RevokeSucceeded,
                ShareItemStatus::RevokeFailed,
            ),
        };

        // An interrupted batch is already in progress and may still hold approved items
        let in_progress = if data.share.status.is_in_progress() {
            data.share.status
        } else {
            data.share.status.transition(ShareObjectAction::Start)?
        };
        let started = self
            .repo
            .apply_transition(
                ShareTransition::new(&share_uri, data.share.status, in_progress)
                    .with_items(ItemStatusChange::all(approved, running)),
            )
            .await?;
        let data = ShareData {
            share: started,
            ..data
        };

        let items = self
            .repo
            .list_items(&share_uri, ItemFilter::with_statuses(&[running]))
            .await?;
        info!(
            share_uri = %share_uri,
            dataset_uri = %data.share.dataset_uri,
            operation = operation.as_str(),
            items = items.len(),
            "Processing share batch"
        );

        let outcomes = self.dispatch(operation, &data, &items).await;

        let mut failed_items = Vec::new();
        let mut record_error = None;
        for item in &items {
            let outcome = outcomes
                .get(&item.share_item_uri)
                .cloned()
                .unwrap_or_else(|| ItemOutcome::Failed("No outcome recorded".to_string()));

            #[cfg(feature = "metrics")]
            crate::metrics::record_item_outcome(
                operation.as_str(),
                if outcome.is_success() { "succeeded" } else { "failed" },
            );

            let recorded = match &outcome {
                ItemOutcome::Succeeded => {
                    self.repo
                        .update_item_status(&item.share_item_uri, running, succeeded, ItemHealth::unset())
                        .await
                }
                ItemOutcome::Failed(message) => {
                    failed_items.push(item.item_name.clone());
                    self.repo
                        .update_item_status(
                            &item.share_item_uri,
                            running,
                            failed,
                            ItemHealth::message(message.clone()),
                        )
                        .await
                }
            };

            match recorded {
                Ok(_) if outcome.is_success() => {
                    self.sync_item_policy(&data.share, item, operation).await
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        share_uri = %share_uri,
                        item_uri = %item.item_uri,
                        error = %e,
                        "Failed to record item outcome"
                    );
                    record_error.get_or_insert(e);
                }
            }
        }

        let finished = data.share.status.transition(ShareObjectAction::Finish)?;
        let share = self
            .repo
            .apply_transition(ShareTransition::new(&share_uri, data.share.status, finished))
            .await?;
        if let Some(e) = record_error {
            return Err(e);
        }

        info!(
            share_uri = %share_uri,
            operation = operation.as_str(),
            failed = failed_items.len(),
            status = %share.status,
            "Share batch finished"
        );

        if !failed_items.is_empty() {
            self.notify(ShareNotification::ShareObjectFailed {
                share_uri: share_uri.clone(),
                dataset_uri: share.dataset_uri.clone(),
                failed_items,
            })
            .await;
        }
        Ok(share)
    }

    async fn verify_locked(&self, data: ShareData, share_item_uris: Option<Vec<String>>) -> Result<VerifyReport> {
        let share = &data.share;
        let mut filter = ItemFilter::with_statuses(&[ShareItemStatus::ShareSucceeded]);
        filter.share_item_uris = share_item_uris;
        let items = self.repo.list_items(&share.share_uri, filter).await?;
        if items.is_empty() {
            return Ok(VerifyReport::default());
        }

        let role_exists = self
            .identity
            .role_exists(
                &data.target_environment,
                share.principal_type,
                &share.principal_role_name,
            )
            .await?;

        let outcomes = if role_exists {
            self.dispatch_verify(&data, &items).await
        } else {
            let message = format!(
                "Principal role {} no longer exists in environment {}",
                share.principal_role_name, data.target_environment.name
            );
            items
                .iter()
                .map(|i| (i.share_item_uri.clone(), HealthOutcome::Unhealthy(message.clone())))
                .collect()
        };

        let now = Utc::now();
        let mut report = VerifyReport::default();
        let mut unhealthy_names = Vec::new();
        let mut healed_names = Vec::new();

        for item in &items {
            let outcome = outcomes
                .get(&item.share_item_uri)
                .cloned()
                .unwrap_or_else(|| HealthOutcome::Unhealthy("No verification result".to_string()));

            #[cfg(feature = "metrics")]
            crate::metrics::record_item_outcome(
                "verify",
                if outcome == HealthOutcome::Healthy { "healthy" } else { "unhealthy" },
            );

            match outcome {
                HealthOutcome::Healthy => {
                    self.repo
                        .update_item_health(&item.share_item_uri, ItemHealth::healthy(now))
                        .await?;
                    if matches!(
                        item.health_status,
                        Some(ShareItemHealthStatus::Unhealthy | ShareItemHealthStatus::PendingReApply)
                    ) {
                        healed_names.push(item.item_name.clone());
                    }
                    report.healthy.push(item.share_item_uri.clone());
                }
                HealthOutcome::Unhealthy(message) => {
                    debug!(item_uri = %item.item_uri, message = %message, "Share item unhealthy");
                    self.repo
                        .update_item_health(&item.share_item_uri, ItemHealth::unhealthy(message, now))
                        .await?;
                    unhealthy_names.push(item.item_name.clone());
                    report.unhealthy.push(item.share_item_uri.clone());
                }
            }
        }

        info!(
            share_uri = %share.share_uri,
            healthy = report.healthy.len(),
            unhealthy = report.unhealthy.len(),
            "Verified share items"
        );

        if !unhealthy_names.is_empty() {
            self.notify(ShareNotification::ShareItemsUnhealthy {
                share_uri: share.share_uri.clone(),
                dataset_uri: share.dataset_uri.clone(),
                items: unhealthy_names,
            })
            .await;
        }
        if !healed_names.is_empty() {
            self.notify(ShareNotification::ShareItemsHealthy {
                share_uri: share.share_uri.clone(),
                dataset_uri: share.dataset_uri.clone(),
                items: healed_names,
            })
            .await;
        }
        Ok(report)
    }

    async fn reapply_locked(&self, data: ShareData, share_item_uris: Option<Vec<String>>) -> Result<ReapplyReport> {
        let share = &data.share;

        let marked = match &share_item_uris {
            None => {
                self.repo
                    .bulk_update_health(
                        &share.share_uri,
                        ShareItemHealthStatus::Unhealthy,
                        ShareItemHealthStatus::PendingReApply,
                    )
                    .await?
            }
            Some(uris) => {
                let unhealthy: Vec<String> = self
                    .repo
                    .list_items(
                        &share.share_uri,
                        ItemFilter {
                            share_item_uris: Some(uris.clone()),
                            ..ItemFilter::with_health(&[ShareItemHealthStatus::Unhealthy])
                        },
                    )
                    .await?
                    .into_iter()
                    .filter(|i| i.status == ShareItemStatus::ShareSucceeded)
                    .map(|i| i.share_item_uri)
                    .collect();
                if unhealthy.is_empty() {
                    0
                } else {
                    self.repo
                        .mark_items_health(
                            &share.share_uri,
                            &unhealthy,
                            ShareItemHealthStatus::PendingReApply,
                        )
                        .await?
                }
            }
        };
        if marked > 0 {
            debug!(share_uri = %share.share_uri, marked, "Items marked for reapply");
        }

        let filter = ItemFilter {
            share_item_uris,
            ..Default::default()
        };
        let items: Vec<ShareObjectItem> = self
            .repo
            .list_items(&share.share_uri, filter)
            .await?
            .into_iter()
            .filter(is_reapplicable)
            .collect();
        if items.is_empty() {
            return Ok(ReapplyReport::default());
        }

        let (grants, revokes): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|i| i.action == RequestedAction::Share);

        let mut outcomes = BatchOutcome::new();
        if !grants.is_empty() {
            outcomes.extend(self.dispatch(BatchOperation::Grant, &data, &grants).await);
        }
        if !revokes.is_empty() {
            outcomes.extend(self.dispatch(BatchOperation::Revoke, &data, &revokes).await);
        }

        let now = Utc::now();
        let mut report = ReapplyReport::default();
        let mut failed_items = Vec::new();
        for (item, operation) in grants
            .iter()
            .map(|i| (i, BatchOperation::Grant))
            .chain(revokes.iter().map(|i| (i, BatchOperation::Revoke)))
        {
            let outcome = outcomes
                .get(&item.share_item_uri)
                .cloned()
                .unwrap_or_else(|| ItemOutcome::Failed("No outcome recorded".to_string()));

            #[cfg(feature = "metrics")]
            crate::metrics::record_item_outcome(
                "reapply",
                if outcome.is_success() { "succeeded" } else { "failed" },
            );

            match (operation, outcome) {
                (BatchOperation::Grant, ItemOutcome::Succeeded) => {
                    self.repo
                        .update_item_status(
                            &item.share_item_uri,
                            item.status,
                            ShareItemStatus::ShareSucceeded,
                            ItemHealth::healthy(now),
                        )
                        .await?;
                    self.sync_item_policy(share, item, BatchOperation::Grant).await;
                    report.succeeded.push(item.share_item_uri.clone());
                }
                (BatchOperation::Revoke, ItemOutcome::Succeeded) => {
                    self.repo
                        .update_item_status(
                            &item.share_item_uri,
                            item.status,
                            ShareItemStatus::RevokeSucceeded,
                            ItemHealth::unset(),
                        )
                        .await?;
                    self.sync_item_policy(share, item, BatchOperation::Revoke).await;
                    report.succeeded.push(item.share_item_uri.clone());
                }
                (_, ItemOutcome::Failed(message)) => {
                    let health = if item.status == ShareItemStatus::ShareSucceeded {
                        ItemHealth::unhealthy(message, now)
                    } else {
                        ItemHealth::message(message)
                    };
                    self.repo
                        .update_item_health(&item.share_item_uri, health)
                        .await?;
                    report.failed.push(item.share_item_uri.clone());
                    failed_items.push(item.item_name.clone());
                }
            }
        }

        info!(
            share_uri = %share.share_uri,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Reapplied share items"
        );

        if !failed_items.is_empty() {
            self.notify(ShareNotification::ShareObjectFailed {
                share_uri: share.share_uri.clone(),
                dataset_uri: share.dataset_uri.clone(),
                failed_items,
            })
            .await;
        }
        Ok(report)
    }

    /// Hand items to their processors grouped by item kind. Every item gets
    /// an outcome, including items no processor claims.
    async fn dispatch(
        &self,
        operation: BatchOperation,
        data: &ShareData,
        items: &[ShareObjectItem],
    ) -> BatchOutcome {
        let mut outcomes = BatchOutcome::new();
        for (item_type, group) in group_by_type(items) {
            let processor = match self.registry.processor(item_type) {
                Some(p) => p,
                None => {
                    for item in &group {
                        outcomes.insert(
                            item.share_item_uri.clone(),
                            ItemOutcome::Failed(format!("No sharing processor for {} items", item_type)),
                        );
                    }
                    continue;
                }
            };

            let mut result = match operation {
                BatchOperation::Grant => processor.grant(data, &group).await,
                BatchOperation::Revoke => processor.revoke(data, &group).await,
            };
            for item in &group {
                let outcome = result.remove(&item.share_item_uri).unwrap_or_else(|| {
                    ItemOutcome::Failed(format!("Processor {} reported no outcome", processor.name()))
                });
                outcomes.insert(item.share_item_uri.clone(), outcome);
            }
        }
        outcomes
    }

    async fn dispatch_verify(&self, data: &ShareData, items: &[ShareObjectItem]) -> VerifyOutcome {
        let mut outcomes = VerifyOutcome::new();
        for (item_type, group) in group_by_type(items) {
            let mut result = match self.registry.processor(item_type) {
                Some(processor) => processor.verify(data, &group).await,
                None => VerifyOutcome::new(),
            };
            for item in &group {
                let outcome = result.remove(&item.share_item_uri).unwrap_or_else(|| {
                    HealthOutcome::Unhealthy(format!("No verification available for {} items", item_type))
                });
                outcomes.insert(item.share_item_uri.clone(), outcome);
            }
        }
        outcomes
    }

    async fn attach_item(
        &self,
        share: &ShareObject,
        item: &ShareItemRequest,
        owner: &str,
    ) -> Result<ShareObjectItem> {
        let next = share.status.transition(ShareObjectAction::AddItem)?;
        let permission = share
            .permissions
            .iter()
            .max()
            .copied()
            .unwrap_or(ShareObjectDataPermission::Read);

        self.repo
            .add_item(
                NewShareItem {
                    share_uri: share.share_uri.clone(),
                    item_type: item.item_type,
                    item_uri: item.item_uri.clone(),
                    item_name: item.item_name.clone(),
                    permission,
                    owner: owner.to_string(),
                },
                share.status,
                next,
            )
            .await
    }

    async fn has_pending_items(&self, share_uri: &str) -> Result<bool> {
        Ok(self
            .repo
            .item_statuses(share_uri)
            .await?
            .contains(&ShareItemStatus::PendingApproval))
    }

    /// Check the caller's role and return the share's dataset.
    async fn authorize(
        &self,
        ctx: &RequestContext,
        share: &ShareObject,
        action: &str,
        required: RequiredRole,
    ) -> Result<Dataset> {
        let dataset = self.dataset(&share.dataset_uri).await?;
        let role = user_role_for_share(ctx, share, &dataset);
        let allowed = match required {
            RequiredRole::Requester => role.is_requester(),
            RequiredRole::Approver => role.is_approver(),
            RequiredRole::Either => role != ShareObjectRole::NoPermission,
        };
        if !allowed {
            return Err(ShareError::unauthorized(
                action,
                format!(
                    "User {} has role {} on share {}",
                    ctx.username, role, share.share_uri
                ),
            ));
        }
        Ok(dataset)
    }

    async fn with_dataset_lock<T, F, Fut>(&self, share: &ShareObject, action: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        #[cfg(feature = "metrics")]
        let requested = std::time::Instant::now();

        self.locks
            .with_lock(&share.dataset_uri, &share.share_uri, action, || {
                #[cfg(feature = "metrics")]
                crate::metrics::record_lock_wait(requested.elapsed());
                f()
            })
            .await
    }

    async fn share(&self, share_uri: &str) -> Result<ShareObject> {
        self.repo
            .get_share(share_uri)
            .await?
            .ok_or_else(|| ShareError::ShareNotFound(share_uri.to_string()))
    }

    async fn dataset(&self, dataset_uri: &str) -> Result<Dataset> {
        self.directory
            .get_dataset(dataset_uri)
            .await?
            .ok_or_else(|| ShareError::DatasetNotFound(dataset_uri.to_string()))
    }

    async fn environment(&self, environment_uri: &str) -> Result<Environment> {
        self.directory
            .get_environment(environment_uri)
            .await?
            .ok_or_else(|| ShareError::EnvironmentNotFound(environment_uri.to_string()))
    }

    async fn share_data(&self, share: &ShareObject) -> Result<ShareData> {
        Ok(ShareData {
            share: share.clone(),
            dataset: self.dataset(&share.dataset_uri).await?,
            source_environment: self.environment(&share.source_environment_uri).await?,
            target_environment: self.environment(&share.target_environment_uri).await?,
        })
    }

    pub(crate) async fn notify(&self, notification: ShareNotification) {
        let kind = notification.kind();
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(kind, error = %e, "Failed to send share notification");
        }
    }

    async fn attach_share_policies(&self, share: &ShareObject, dataset: &Dataset) {
        let registry = PermissionRegistry::global();
        let mut grants = vec![(
            share.group_uri.as_str(),
            registry.share_object_permissions(ShareSide::Requester),
        )];
        for group in dataset.approver_groups() {
            grants.push((group, registry.share_object_permissions(ShareSide::Approver)));
        }

        for (group, permissions) in grants {
            if let Err(e) = self
                .policies
                .attach_resource_policy(group, permissions, &share.share_uri, SHARE_OBJECT_RESOURCE)
                .await
            {
                warn!(share_uri = %share.share_uri, group = %group, error = %e, "Failed to attach share policy");
            }
        }
    }

    async fn delete_share_policies(&self, share: &ShareObject, dataset: &Dataset) {
        let mut groups = vec![share.group_uri.as_str()];
        groups.extend(dataset.approver_groups());

        for group in groups {
            if let Err(e) = self
                .policies
                .delete_resource_policy(group, &share.share_uri, SHARE_OBJECT_RESOURCE)
                .await
            {
                warn!(share_uri = %share.share_uri, group = %group, error = %e, "Failed to delete share policy");
            }
        }
    }

    /// Give the requester group read access to a granted item, or take it
    /// away after a revoke.
    async fn sync_item_policy(&self, share: &ShareObject, item: &ShareObjectItem, operation: BatchOperation) {
        let resource_type = item.item_type.as_str();
        let result = match operation {
            BatchOperation::Grant => {
                let permissions = PermissionRegistry::global().item_read_permissions(item.item_type);
                self.policies
                    .attach_resource_policy(&share.group_uri, permissions, &item.item_uri, resource_type)
                    .await
            }
            BatchOperation::Revoke => {
                self.policies
                    .delete_resource_policy(&share.group_uri, &item.item_uri, resource_type)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(
                share_uri = %share.share_uri,
                item_uri = %item.item_uri,
                operation = operation.as_str(),
                error = %e,
                "Failed to update item policy"
            );
        }
    }
}

/// Failed items and shared items flagged for reapply.
fn is_reapplicable(item: &ShareObjectItem) -> bool {
    match item.status {
        ShareItemStatus::ShareFailed => item.action == RequestedAction::Share,
        ShareItemStatus::RevokeFailed => item.action == RequestedAction::Revoke,
        ShareItemStatus::ShareSucceeded => matches!(
            item.health_status,
            Some(ShareItemHealthStatus::Unhealthy | ShareItemHealthStatus::PendingReApply)
        ),
        _ => false,
    }
}

/// Group items by kind, keeping the order in which kinds first appear.
fn group_by_type(items: &[ShareObjectItem]) -> Vec<(ShareableType, Vec<ShareObjectItem>)> {
    let mut groups: Vec<(ShareableType, Vec<ShareObjectItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(t, _)| *t == item.item_type) {
            Some((_, group)) => group.push(item.clone()),
            None => groups.push((item.item_type, vec![item.clone()])),
        }
    }
    groups
}
