//! Object storage sharing through bucket, access point and role policies.
//!
//! Each item maps to a set of policy statements identified by a statement id
//! derived from the item. Whole-bucket items get a bucket policy statement;
//! folder items get an access point policy statement scoped to their prefix.
//! Both also get a statement on the consumer role. Verification lists the
//! live policies and checks that every expected statement is present with the
//! expected principal and actions.

use super::{
    BatchOutcome, CloudApiError, HealthOutcome, ItemOutcome, ShareData, SharingProcessor,
    VerifyOutcome,
};
use crate::directory::DatasetResource;
use async_trait::async_trait;
use metafuse_share_core::{ShareObjectDataPermission, ShareObjectItem, ShareableType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Access point names are limited to 50 characters
const MAX_ACCESS_POINT_NAME_LEN: usize = 50;

/// A policy document that statements can be attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyTarget {
    Bucket {
        account_id: String,
        region: String,
        bucket: String,
    },
    AccessPoint {
        account_id: String,
        region: String,
        access_point: String,
    },
    Role {
        account_id: String,
        role_name: String,
    },
}

impl std::fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyTarget::Bucket { bucket, .. } => write!(f, "bucket policy {}", bucket),
            PolicyTarget::AccessPoint { access_point, .. } => {
                write!(f, "access point policy {}", access_point)
            }
            PolicyTarget::Role { role_name, .. } => write!(f, "role policy {}", role_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub sid: String,
    pub principal: String,
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

/// Policy API of the object store and identity service
#[async_trait]
pub trait ObjectStoragePolicyApi: Send + Sync {
    /// Insert or replace the statement with the same `sid`.
    async fn put_statement(
        &self,
        target: &PolicyTarget,
        statement: &PolicyStatement,
    ) -> Result<(), CloudApiError>;

    async fn remove_statement(&self, target: &PolicyTarget, sid: &str) -> Result<(), CloudApiError>;

    async fn list_statements(&self, target: &PolicyTarget)
        -> Result<Vec<PolicyStatement>, CloudApiError>;
}

/// Processor for folder and bucket items of object storage datasets
pub struct ObjectStorageShareProcessor {
    api: Arc<dyn ObjectStoragePolicyApi>,
}

impl ObjectStorageShareProcessor {
    pub fn new(api: Arc<dyn ObjectStoragePolicyApi>) -> Self {
        Self { api }
    }

    /// Statements an item needs, paired with the policy they belong to.
    fn expected_statements(
        &self,
        data: &ShareData,
        item: &ShareObjectItem,
    ) -> Result<Vec<(PolicyTarget, PolicyStatement)>, String> {
        let bucket = match &data.dataset.resource {
            DatasetResource::ObjectStorage { bucket, .. } => bucket.clone(),
            DatasetResource::Warehouse { .. } => {
                return Err(format!(
                    "Dataset {} is not backed by object storage",
                    data.dataset.dataset_uri
                ))
            }
        };

        let dataset = &data.dataset;
        let target_env = &data.target_environment;
        let role_name = &data.share.principal_role_name;
        let principal = format!("arn:aws:iam::{}:role/{}", target_env.aws_account_id, role_name);
        let sid = statement_id(item);
        let actions = actions_for(item.permission);

        let (resource_target, resources) = match item.item_type {
            ShareableType::S3Bucket => (
                PolicyTarget::Bucket {
                    account_id: dataset.aws_account_id.clone(),
                    region: dataset.region.clone(),
                    bucket: bucket.clone(),
                },
                vec![
                    format!("arn:aws:s3:::{}", bucket),
                    format!("arn:aws:s3:::{}/*", bucket),
                ],
            ),
            ShareableType::StorageLocation => {
                let access_point = access_point_name(&bucket, role_name);
                let prefix = item.item_name.trim_matches('/');
                (
                    PolicyTarget::AccessPoint {
                        account_id: dataset.aws_account_id.clone(),
                        region: dataset.region.clone(),
                        access_point: access_point.clone(),
                    },
                    vec![
                        format!(
                            "arn:aws:s3:{}:{}:accesspoint/{}",
                            dataset.region, dataset.aws_account_id, access_point
                        ),
                        format!(
                            "arn:aws:s3:{}:{}:accesspoint/{}/object/{}/*",
                            dataset.region, dataset.aws_account_id, access_point, prefix
                        ),
                    ],
                )
            }
            other => {
                return Err(format!(
                    "Item type {} is not handled by the object storage processor",
                    other
                ))
            }
        };

        let statement = PolicyStatement {
            sid,
            principal,
            actions,
            resources,
        };
        let role_target = PolicyTarget::Role {
            account_id: target_env.aws_account_id.clone(),
            role_name: role_name.clone(),
        };

        Ok(vec![
            (resource_target, statement.clone()),
            (role_target, statement),
        ])
    }

    async fn grant_item(&self, data: &ShareData, item: &ShareObjectItem) -> ItemOutcome {
        let statements = match self.expected_statements(data, item) {
            Ok(s) => s,
            Err(message) => return ItemOutcome::Failed(message),
        };

        for (target, statement) in &statements {
            if let Err(e) = self.api.put_statement(target, statement).await {
                warn!(
                    share_uri = %data.share.share_uri,
                    item_uri = %item.item_uri,
                    target = %target,
                    error = %e,
                    "Failed to grant object storage access"
                );
                return ItemOutcome::Failed(format!("Failed to update {}: {}", target, e));
            }
        }
        ItemOutcome::Succeeded
    }

    async fn revoke_item(&self, data: &ShareData, item: &ShareObjectItem) -> ItemOutcome {
        let statements = match self.expected_statements(data, item) {
            Ok(s) => s,
            Err(message) => return ItemOutcome::Failed(message),
        };

        for (target, statement) in &statements {
            match self.api.remove_statement(target, &statement.sid).await {
                Ok(()) | Err(CloudApiError::NotFound(_)) => {}
                Err(e) => {
                    warn!(
                        share_uri = %data.share.share_uri,
                        item_uri = %item.item_uri,
                        target = %target,
                        error = %e,
                        "Failed to revoke object storage access"
                    );
                    return ItemOutcome::Failed(format!("Failed to update {}: {}", target, e));
                }
            }
        }
        ItemOutcome::Succeeded
    }
}

#[async_trait]
impl SharingProcessor for ObjectStorageShareProcessor {
    fn name(&self) -> &'static str {
        "object_storage"
    }

    fn shareable_types(&self) -> &'static [ShareableType] {
        &[ShareableType::StorageLocation, ShareableType::S3Bucket]
    }

    async fn grant(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        let mut outcomes = BatchOutcome::new();
        for item in items {
            let outcome = self.grant_item(data, item).await;
            outcomes.insert(item.share_item_uri.clone(), outcome);
        }
        outcomes
    }

    async fn revoke(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        let mut outcomes = BatchOutcome::new();
        for item in items {
            let outcome = self.revoke_item(data, item).await;
            outcomes.insert(item.share_item_uri.clone(), outcome);
        }
        outcomes
    }

    async fn verify(&self, data: &ShareData, items: &[ShareObjectItem]) -> VerifyOutcome {
        // One listing per policy document, shared by all items of the batch
        let mut live: HashMap<PolicyTarget, Result<Vec<PolicyStatement>, CloudApiError>> =
            HashMap::new();
        let mut outcomes = VerifyOutcome::new();

        for item in items {
            let statements = match self.expected_statements(data, item) {
                Ok(s) => s,
                Err(message) => {
                    outcomes.insert(item.share_item_uri.clone(), HealthOutcome::Unhealthy(message));
                    continue;
                }
            };

            let mut problems = Vec::new();
            for (target, expected) in statements {
                if !live.contains_key(&target) {
                    let listed = self.api.list_statements(&target).await;
                    live.insert(target.clone(), listed);
                }
                match live.get(&target) {
                    Some(Ok(current)) => {
                        if !current.iter().any(|s| covers(s, &expected)) {
                            problems.push(format!("missing statement {} on {}", expected.sid, target));
                        }
                    }
                    Some(Err(e)) => problems.push(format!("cannot read {}: {}", target, e)),
                    None => problems.push(format!("cannot read {}", target)),
                }
            }

            let outcome = if problems.is_empty() {
                HealthOutcome::Healthy
            } else {
                HealthOutcome::Unhealthy(problems.join("; "))
            };
            debug!(item_uri = %item.item_uri, outcome = ?outcome, "Verified object storage item");
            outcomes.insert(item.share_item_uri.clone(), outcome);
        }

        outcomes
    }
}

/// Whether a live statement grants at least what `expected` asks for.
fn covers(live: &PolicyStatement, expected: &PolicyStatement) -> bool {
    live.sid == expected.sid
        && live.principal == expected.principal
        && expected.actions.iter().all(|a| live.actions.contains(a))
        && expected.resources.iter().all(|r| live.resources.contains(r))
}

fn statement_id(item: &ShareObjectItem) -> String {
    let compact: String = item
        .share_item_uri
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("MetaFuseShare{}", compact)
}

fn actions_for(permission: ShareObjectDataPermission) -> Vec<String> {
    let mut actions = vec!["s3:GetObject", "s3:ListBucket"];
    if permission >= ShareObjectDataPermission::Write {
        actions.push("s3:PutObject");
    }
    if permission >= ShareObjectDataPermission::Modify {
        actions.push("s3:DeleteObject");
    }
    actions.into_iter().map(str::to_string).collect()
}

fn access_point_name(bucket: &str, role_name: &str) -> String {
    let raw = format!("{}-{}", bucket, role_name).to_lowercase();
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_ACCESS_POINT_NAME_LEN)
        .collect();
    cleaned.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_grow_with_permission() {
        assert_eq!(actions_for(ShareObjectDataPermission::Read).len(), 2);
        assert!(actions_for(ShareObjectDataPermission::Write).contains(&"s3:PutObject".to_string()));
        assert!(actions_for(ShareObjectDataPermission::Modify)
            .contains(&"s3:DeleteObject".to_string()));
    }

    #[test]
    fn test_access_point_name_is_sanitized() {
        let name = access_point_name("Sales_Bucket", "Analysts.Role");
        assert_eq!(name, "sales-bucket-analysts-role");

        let long = access_point_name(&"b".repeat(60), "role");
        assert!(long.len() <= MAX_ACCESS_POINT_NAME_LEN);
    }

    #[test]
    fn test_covers_requires_actions_and_resources() {
        let expected = PolicyStatement {
            sid: "s1".to_string(),
            principal: "role".to_string(),
            actions: vec!["s3:GetObject".to_string()],
            resources: vec!["arn:aws:s3:::b".to_string()],
        };
        let mut live = expected.clone();
        live.actions.push("s3:PutObject".to_string());
        assert!(covers(&live, &expected));

        live.resources.clear();
        assert!(!covers(&live, &expected));
    }
}
