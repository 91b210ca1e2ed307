//! Sharing processors apply grants and revocations for one kind of resource.
//!
//! A processor never fails a batch because of a single item. Every item of
//! the input gets an entry in the returned outcome map, and the service
//! records the outcome item by item. Errors from the external API are
//! captured as [`CloudApiError`] and turned into item outcomes.

use crate::directory::{Dataset, Environment};
use async_trait::async_trait;
use metafuse_share_core::{ShareObject, ShareObjectItem, ShareableType};
use std::collections::HashMap;

pub mod memory;
pub mod object_storage;
pub mod warehouse;

pub use object_storage::{ObjectStoragePolicyApi, ObjectStorageShareProcessor, PolicyStatement, PolicyTarget};
pub use warehouse::{ConsumerRef, DatashareApi, DatashareRef, WarehouseShareProcessor};

/// Everything a processor needs to know about a share.
#[derive(Debug, Clone)]
pub struct ShareData {
    pub share: ShareObject,
    pub dataset: Dataset,
    pub source_environment: Environment,
    pub target_environment: Environment,
}

/// Result of granting or revoking one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded)
    }
}

/// Result of verifying one item against the external state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    Unhealthy(String),
}

/// Outcomes keyed by `share_item_uri`
pub type BatchOutcome = HashMap<String, ItemOutcome>;

/// Health verdicts keyed by `share_item_uri`
pub type VerifyOutcome = HashMap<String, HealthOutcome>;

/// Error reported by an external cloud API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait SharingProcessor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Item kinds this processor handles
    fn shareable_types(&self) -> &'static [ShareableType];

    async fn grant(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome;

    async fn revoke(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome;

    async fn verify(&self, data: &ShareData, items: &[ShareObjectItem]) -> VerifyOutcome;
}

/// Mark every item of a batch as failed with the same message.
pub(crate) fn fail_all(items: &[ShareObjectItem], message: &str) -> BatchOutcome {
    items
        .iter()
        .map(|i| (i.share_item_uri.clone(), ItemOutcome::Failed(message.to_string())))
        .collect()
}

pub(crate) fn unhealthy_all(items: &[ShareObjectItem], message: &str) -> VerifyOutcome {
    items
        .iter()
        .map(|i| (i.share_item_uri.clone(), HealthOutcome::Unhealthy(message.to_string())))
        .collect()
}
