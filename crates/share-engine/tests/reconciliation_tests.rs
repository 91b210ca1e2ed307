//! Reconciliation Integration Tests
//!
//! Covers verification of shared items, reapplying failed and drifted items,
//! and the background verifier and reapplier sweeps.

// This test module requires the test-utils feature
#![cfg(feature = "test-utils")]

use metafuse_share_core::{ShareError, ShareItemHealthStatus, ShareItemStatus, ShareObjectStatus};
use metafuse_share_engine::test_utils::{ShareFixture, TestSharingEnv, CONSUMER_ENV, REQUESTER_GROUP};
use metafuse_share_engine::{
    verifier_task, RequestContext, ShareNotification, ShareReapplier, ShareVerifier, SharingConfig,
    REAPPLIER_PROCESS, VERIFIER_PROCESS,
};
use std::time::Duration;

// ============================================================================
// Verification
// ============================================================================

mod verify {
    use super::*;

    #[tokio::test]
    async fn test_verify_marks_shared_items_healthy() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();

        let report = env
            .service
            .verify_items_share_object(&env.requester(), &share.share_uri, None)
            .await
            .unwrap();

        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(report.healthy, vec![item.share_item_uri.clone()]);
        assert!(report.unhealthy.is_empty());
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Healthy));
        assert!(item.last_verification_time.is_some());
        assert_eq!(item.status, ShareItemStatus::ShareSucceeded);
    }

    #[tokio::test]
    async fn test_verify_records_drift() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .table("customers_table")
            .processed(&env)
            .await
            .unwrap();
        env.processor.break_item("orders_table");

        let report = env
            .service
            .verify_items_share_object(&env.approver(), &share.share_uri, None)
            .await
            .unwrap();

        assert_eq!(report.healthy.len(), 1);
        assert_eq!(report.unhealthy.len(), 1);

        let orders = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(orders.health_status, Some(ShareItemHealthStatus::Unhealthy));
        assert!(orders.health_message.as_deref().unwrap().contains("drift"));
        // Health never changes the lifecycle status
        assert_eq!(orders.status, ShareItemStatus::ShareSucceeded);

        let unhealthy: Vec<_> = env
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                ShareNotification::ShareItemsUnhealthy { items, .. } => Some(items),
                _ => None,
            })
            .collect();
        assert_eq!(unhealthy, vec![vec!["orders_table".to_string()]]);
    }

    #[tokio::test]
    async fn test_verify_only_checks_shared_items() {
        let env = TestSharingEnv::new().await.unwrap();
        env.processor.fail_item("customers_table");
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .table("customers_table")
            .processed(&env)
            .await
            .unwrap();

        let report = env.service.verify_share(&share.share_uri, None).await.unwrap();

        assert_eq!(report.healthy.len(), 1);
        let verified = env.processor.calls_for("verify");
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].item_names, vec!["orders_table".to_string()]);

        let customers = env.item(&share.share_uri, "customers_table").await.unwrap();
        assert!(customers.health_status.is_none());
        assert_eq!(customers.status, ShareItemStatus::ShareFailed);
    }

    #[tokio::test]
    async fn test_verify_subset_of_items() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .table("customers_table")
            .processed(&env)
            .await
            .unwrap();
        let customers = env.item(&share.share_uri, "customers_table").await.unwrap();

        let report = env
            .service
            .verify_items_share_object(
                &env.requester(),
                &share.share_uri,
                Some(vec![customers.share_item_uri.clone()]),
            )
            .await
            .unwrap();

        assert_eq!(report.healthy, vec![customers.share_item_uri]);
        let orders = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert!(orders.health_status.is_none());
    }

    #[tokio::test]
    async fn test_missing_role_makes_every_item_unhealthy() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.identity.remove_role(CONSUMER_ENV, "analysts-role");

        let report = env.service.verify_share(&share.share_uri, None).await.unwrap();

        assert_eq!(report.unhealthy.len(), 1);
        assert!(env.processor.calls_for("verify").is_empty());
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert!(item
            .health_message
            .as_deref()
            .unwrap()
            .contains("no longer exists"));
    }

    #[tokio::test]
    async fn test_verify_ignores_unprocessed_shares() {
        let env = TestSharingEnv::new().await.unwrap();
        let created = ShareFixture::new("sales")
            .table("orders_table")
            .create(&env)
            .await
            .unwrap();

        let report = env
            .service
            .verify_share(&created.share.share_uri, None)
            .await
            .unwrap();

        assert!(report.healthy.is_empty() && report.unhealthy.is_empty());
        assert!(env.processor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dataset_verification_is_for_approvers() {
        let env = TestSharingEnv::new().await.unwrap();
        ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();

        let denied = env
            .service
            .verify_dataset_share_objects(&env.requester(), "sales")
            .await;
        assert!(matches!(denied, Err(ShareError::UnauthorizedOperation { .. })));

        let report = env
            .service
            .verify_dataset_share_objects(&env.approver(), "sales")
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert!(report.is_clean());
    }
}

// ============================================================================
// Reapply
// ============================================================================

mod reapply {
    use super::*;

    #[tokio::test]
    async fn test_reapply_failed_item_after_fix() {
        let env = TestSharingEnv::new().await.unwrap();
        env.processor.fail_item("customers_table");
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .table("customers_table")
            .processed(&env)
            .await
            .unwrap();
        let customers = env.item(&share.share_uri, "customers_table").await.unwrap();

        env.processor.heal("customers_table");
        let report = env
            .service
            .reapply_items_share_object(
                &env.requester(),
                &share.share_uri,
                vec![customers.share_item_uri.clone()],
            )
            .await
            .unwrap();

        assert_eq!(report.succeeded, vec![customers.share_item_uri]);
        assert!(report.failed.is_empty());

        let customers = env.item(&share.share_uri, "customers_table").await.unwrap();
        assert_eq!(customers.status, ShareItemStatus::ShareSucceeded);
        assert_eq!(customers.health_status, Some(ShareItemHealthStatus::Healthy));
        assert!(env
            .policies
            .resource_type(REQUESTER_GROUP, &customers.item_uri)
            .is_some());
        assert_eq!(
            env.share(&share.share_uri).await.unwrap().status,
            ShareObjectStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_reapply_converges_drifted_item() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.processor.break_item("orders_table");
        env.service.verify_share(&share.share_uri, None).await.unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Unhealthy));

        env.processor.heal("orders_table");
        let report = env
            .service
            .reapply_items_share_object(&env.approver(), &share.share_uri, vec![item.share_item_uri])
            .await
            .unwrap();
        assert_eq!(report.succeeded.len(), 1);

        let verified = env.service.verify_share(&share.share_uri, None).await.unwrap();
        assert_eq!(verified.healthy.len(), 1);
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Healthy));
        assert_eq!(item.status, ShareItemStatus::ShareSucceeded);
    }

    #[tokio::test]
    async fn test_failed_reapply_leaves_item_unhealthy() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.processor.break_item("orders_table");
        env.service.verify_share(&share.share_uri, None).await.unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Unhealthy));

        env.processor.fail_item("orders_table");
        let report = env
            .service
            .reapply_items_share_object(&env.requester(), &share.share_uri, vec![item.share_item_uri])
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.status, ShareItemStatus::ShareSucceeded);
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Unhealthy));
        assert!(env.notifier.kinds().contains(&"SHARE_OBJECT_FAILED"));
    }

    #[tokio::test]
    async fn test_reapply_refuses_healthy_item() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.service.verify_share(&share.share_uri, None).await.unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Healthy));

        let result = env
            .service
            .reapply_items_share_object(
                &env.requester(),
                &share.share_uri,
                vec![item.share_item_uri.clone()],
            )
            .await;

        match result {
            Err(ShareError::InvalidInput { param, value, .. }) => {
                assert_eq!(param, "itemUris");
                assert_eq!(value, item.share_item_uri);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(env.processor.calls_for("grant").len(), 1);
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_reapply_refuses_unverified_item() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert!(item.health_status.is_none());

        let result = env
            .service
            .reapply_items_share_object(&env.requester(), &share.share_uri, vec![item.share_item_uri])
            .await;

        assert!(matches!(result, Err(ShareError::InvalidInput { .. })));
        assert_eq!(env.processor.calls_for("grant").len(), 1);
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert!(item.health_status.is_none());
    }

    #[tokio::test]
    async fn test_reapply_under_held_lock_leaves_health_unchanged() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.processor.break_item("orders_table");
        env.service.verify_share(&share.share_uri, None).await.unwrap();
        env.processor.heal("orders_table");
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Unhealthy));

        let locks = env.service.locks().clone();
        assert!(locks.acquire("sales", "maintenance").await.unwrap());

        let result = env
            .service
            .reapply_items_share_object(
                &env.requester(),
                &share.share_uri,
                vec![item.share_item_uri.clone()],
            )
            .await;

        assert!(matches!(result, Err(ShareError::ResourceLockTimeout { .. })));
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.status, ShareItemStatus::ShareSucceeded);
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Unhealthy));
        assert_eq!(env.processor.calls_for("grant").len(), 1);

        // Once the lock is free the same item is still eligible
        assert!(locks.release("sales", "maintenance").await.unwrap());
        let report = env
            .service
            .reapply_items_share_object(&env.requester(), &share.share_uri, vec![item.share_item_uri])
            .await
            .unwrap();
        assert_eq!(report.succeeded.len(), 1);
    }

    #[tokio::test]
    async fn test_reapply_completes_failed_revoke() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();

        env.processor.fail_item("orders_table");
        env.service
            .revoke_items_share_object(
                &env.requester(),
                &share.share_uri,
                vec![item.share_item_uri.clone()],
            )
            .await
            .unwrap();
        assert_eq!(
            env.item(&share.share_uri, "orders_table").await.unwrap().status,
            ShareItemStatus::RevokeFailed
        );

        env.processor.heal("orders_table");
        let report = env
            .service
            .reapply_items_share_object(&env.requester(), &share.share_uri, vec![item.share_item_uri])
            .await
            .unwrap();

        assert_eq!(report.succeeded.len(), 1);
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();
        assert_eq!(item.status, ShareItemStatus::RevokeSucceeded);
        assert_eq!(env.processor.calls_for("revoke").len(), 2);
        assert!(env
            .policies
            .resource_type(REQUESTER_GROUP, &item.item_uri)
            .is_none());
    }

    #[tokio::test]
    async fn test_pending_items_cannot_be_reapplied() {
        let env = TestSharingEnv::new().await.unwrap();
        let created = ShareFixture::new("sales")
            .table("orders_table")
            .create(&env)
            .await
            .unwrap();
        let item = created.item.unwrap();

        let result = env
            .service
            .reapply_items_share_object(&env.requester(), &created.share.share_uri, vec![item.share_item_uri])
            .await;

        assert!(matches!(result, Err(ShareError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_outsiders_cannot_reapply() {
        let env = TestSharingEnv::new().await.unwrap();
        let share = ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        let item = env.item(&share.share_uri, "orders_table").await.unwrap();

        let result = env
            .service
            .reapply_items_share_object(
                &RequestContext::new("mallory", ["finance"]),
                &share.share_uri,
                vec![item.share_item_uri],
            )
            .await;

        assert!(matches!(result, Err(ShareError::UnauthorizedOperation { .. })));
    }
}

// ============================================================================
// Background Sweeps
// ============================================================================

mod sweeps {
    use super::*;

    async fn two_processed_shares(env: &TestSharingEnv) -> (String, String) {
        let sales = ShareFixture::new("sales")
            .table("orders_table")
            .processed(env)
            .await
            .unwrap();
        let warehouse = ShareFixture::warehouse()
            .warehouse_table("daily_revenue")
            .processed(env)
            .await
            .unwrap();
        (sales.share_uri, warehouse.share_uri)
    }

    #[tokio::test]
    async fn test_verifier_sweep_covers_every_active_share() {
        let env = TestSharingEnv::new().await.unwrap();
        let (sales, warehouse) = two_processed_shares(&env).await;
        env.processor.break_item("daily_revenue");

        let report = ShareVerifier::new(env.service.clone()).run_once().await.unwrap();

        assert_eq!(report.processed, 2);
        assert!(report.is_clean());
        assert_eq!(
            env.item(&sales, "orders_table").await.unwrap().health_status,
            Some(ShareItemHealthStatus::Healthy)
        );
        assert_eq!(
            env.item(&warehouse, "daily_revenue").await.unwrap().health_status,
            Some(ShareItemHealthStatus::Unhealthy)
        );
        assert!(!env.notifier.kinds().contains(&"ADMIN_ERROR_DIGEST"));
    }

    #[tokio::test]
    async fn test_reapplier_sweep_heals_unhealthy_items() {
        let env = TestSharingEnv::new().await.unwrap();
        let (_, warehouse) = two_processed_shares(&env).await;
        env.processor.break_item("daily_revenue");
        ShareVerifier::new(env.service.clone()).run_once().await.unwrap();
        env.processor.heal("daily_revenue");

        let report = ShareReapplier::new(env.service.clone())
            .run_once(None)
            .await
            .unwrap();

        assert_eq!(report.processed, 2);
        let item = env.item(&warehouse, "daily_revenue").await.unwrap();
        assert_eq!(item.health_status, Some(ShareItemHealthStatus::Healthy));
        assert_eq!(item.status, ShareItemStatus::ShareSucceeded);
        // Initial grants plus the one reapply
        assert_eq!(env.processor.calls_for("grant").len(), 3);
    }

    #[tokio::test]
    async fn test_reapplier_can_target_one_dataset() {
        let env = TestSharingEnv::new().await.unwrap();
        two_processed_shares(&env).await;

        let report = ShareReapplier::new(env.service.clone())
            .run_once(Some("warehouse-sales"))
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_sweep_errors_are_collected_into_digest() {
        let env = TestSharingEnv::new().await.unwrap();
        let (_, warehouse) = two_processed_shares(&env).await;
        env.directory.remove_dataset("warehouse-sales");

        let report = ShareVerifier::new(env.service.clone()).run_once().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with(&warehouse));

        let digests: Vec<_> = env
            .notifier
            .sent()
            .into_iter()
            .filter_map(|n| match n {
                ShareNotification::AdminErrorDigest {
                    process_name,
                    errors,
                } => Some((process_name, errors.len())),
                _ => None,
            })
            .collect();
        assert_eq!(digests, vec![(VERIFIER_PROCESS.to_string(), 1)]);

        ShareReapplier::new(env.service.clone())
            .run_once(None)
            .await
            .unwrap();
        assert!(env.notifier.sent().iter().any(|n| matches!(
            n,
            ShareNotification::AdminErrorDigest { process_name, .. } if process_name == REAPPLIER_PROCESS
        )));
    }

    #[tokio::test]
    async fn test_verifier_task_runs_on_interval_and_reapplies() {
        let env = TestSharingEnv::new().await.unwrap();
        ShareFixture::new("sales")
            .table("orders_table")
            .processed(&env)
            .await
            .unwrap();
        env.processor.break_item("orders_table");

        let config = SharingConfig {
            verifier_interval: Duration::from_millis(50),
            reapply_after_verify: true,
            ..env.config.clone()
        };
        let task = tokio::spawn(verifier_task(env.service.clone(), config));
        tokio::time::sleep(Duration::from_millis(400)).await;
        task.abort();

        assert!(!env.processor.calls_for("verify").is_empty());
        // The reapplier retried the drifted item after verification
        assert!(env.processor.calls_for("grant").len() >= 2);
    }
}
