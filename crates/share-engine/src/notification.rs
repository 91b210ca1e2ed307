//! Notifications sent on share transitions and after background sweeps.
//!
//! Notification delivery is best effort. The service logs a failed delivery
//! at `warn` and carries on with the transition.

use async_trait::async_trait;
use metafuse_share_core::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShareNotification {
    ShareObjectSubmitted {
        share_uri: String,
        dataset_uri: String,
        requester: String,
    },
    ShareObjectApproved {
        share_uri: String,
        dataset_uri: String,
        approver: String,
    },
    ShareObjectRejected {
        share_uri: String,
        dataset_uri: String,
        approver: String,
        reason: Option<String>,
    },
    /// Some items of a grant or revoke batch failed
    ShareObjectFailed {
        share_uri: String,
        dataset_uri: String,
        failed_items: Vec<String>,
    },
    ShareItemsUnhealthy {
        share_uri: String,
        dataset_uri: String,
        items: Vec<String>,
    },
    ShareItemsHealthy {
        share_uri: String,
        dataset_uri: String,
        items: Vec<String>,
    },
    /// Digest of errors collected by a background sweep
    AdminErrorDigest {
        process_name: String,
        errors: Vec<String>,
    },
}

impl ShareNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            ShareNotification::ShareObjectSubmitted { .. } => "SHARE_OBJECT_SUBMITTED",
            ShareNotification::ShareObjectApproved { .. } => "SHARE_OBJECT_APPROVED",
            ShareNotification::ShareObjectRejected { .. } => "SHARE_OBJECT_REJECTED",
            ShareNotification::ShareObjectFailed { .. } => "SHARE_OBJECT_FAILED",
            ShareNotification::ShareItemsUnhealthy { .. } => "SHARE_ITEMS_UNHEALTHY",
            ShareNotification::ShareItemsHealthy { .. } => "SHARE_ITEMS_HEALTHY",
            ShareNotification::AdminErrorDigest { .. } => "ADMIN_ERROR_DIGEST",
        }
    }

    pub fn share_uri(&self) -> Option<&str> {
        match self {
            ShareNotification::ShareObjectSubmitted { share_uri, .. }
            | ShareNotification::ShareObjectApproved { share_uri, .. }
            | ShareNotification::ShareObjectRejected { share_uri, .. }
            | ShareNotification::ShareObjectFailed { share_uri, .. }
            | ShareNotification::ShareItemsUnhealthy { share_uri, .. }
            | ShareNotification::ShareItemsHealthy { share_uri, .. } => Some(share_uri),
            ShareNotification::AdminErrorDigest { .. } => None,
        }
    }
}

/// Outbound notification channel
#[async_trait]
pub trait ShareNotifier: Send + Sync {
    async fn notify(&self, notification: ShareNotification) -> Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl ShareNotifier for TracingNotifier {
    async fn notify(&self, notification: ShareNotification) -> Result<()> {
        let payload = serde_json::to_string(&notification)?;
        info!(
            kind = notification.kind(),
            share_uri = notification.share_uri().unwrap_or("-"),
            payload = %payload,
            "Share notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload_is_tagged() {
        let n = ShareNotification::ShareItemsUnhealthy {
            share_uri: "share-1".to_string(),
            dataset_uri: "sales".to_string(),
            items: vec!["orders".to_string()],
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "SHARE_ITEMS_UNHEALTHY");
        assert_eq!(n.kind(), "SHARE_ITEMS_UNHEALTHY");
        assert_eq!(n.share_uri(), Some("share-1"));
    }

    #[tokio::test]
    async fn test_tracing_notifier_never_fails() {
        TracingNotifier
            .notify(ShareNotification::AdminErrorDigest {
                process_name: "share verifier".to_string(),
                errors: vec!["boom".to_string()],
            })
            .await
            .unwrap();
    }
}
