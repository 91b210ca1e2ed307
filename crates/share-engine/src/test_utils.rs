//! Test Utilities Module
//!
//! Shared infrastructure for integration testing the share engine.
//! Enable via the `test-utils` feature flag.
//!
//! # Features
//!
//! - `TestDb`: Temporary SQLite database with automatic cleanup
//! - `TestSharingEnv`: Fully wired `ShareService` over in-memory collaborators
//! - `ScriptedProcessor`: Processor with per-item failure injection and call log
//! - `RecordingNotifier`: Notifier that keeps every notification
//! - `ShareFixture`: Builder for shares with items
//!
//! # Usage
//!
//! ```rust,ignore
//! use metafuse_share_engine::test_utils::{ShareFixture, TestSharingEnv};
//!
//! #[tokio::test]
//! async fn test_grant() {
//!     let env = TestSharingEnv::new().await.unwrap();
//!     let share = ShareFixture::new("sales")
//!         .table("orders_table")
//!         .create(&env)
//!         .await
//!         .unwrap();
//!     env.submit(&share.share.share_uri).await.unwrap();
//! }
//! ```

use crate::config::SharingConfig;
use crate::context::RequestContext;
use crate::directory::{
    Dataset, DatasetResource, Environment, InMemoryDirectory, InMemoryIdentityProvider,
};
use crate::notification::{ShareNotification, ShareNotifier};
use crate::policy::InMemoryPolicyStore;
use crate::processor::memory::{InMemoryDatashareApi, InMemoryObjectStorageApi};
use crate::processor::{
    BatchOutcome, HealthOutcome, ItemOutcome, ShareData, SharingProcessor, VerifyOutcome,
};
use crate::registry::SharingRegistry;
use crate::service::{Collaborators, CreateShareRequest, CreatedShare, ShareItemRequest, ShareService};
use crate::validator::{ObjectStorageShareValidator, WarehouseShareValidator};
use crate::directory::DatasetKind;
use async_trait::async_trait;
use dashmap::DashSet;
use metafuse_share_core::{
    PrincipalType, Result, ShareError, ShareObject, ShareObjectDataPermission, ShareObjectItem,
    ShareableType,
};
use metafuse_share_storage::ItemFilter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

pub const PRODUCER_ENV: &str = "env-producer";
pub const CONSUMER_ENV: &str = "env-consumer";
pub const REQUESTER_GROUP: &str = "analysts";
pub const REQUESTER_ROLE: &str = "analysts-role";
pub const ADMIN_GROUP: &str = "sales-admins";
pub const STEWARD_GROUP: &str = "sales-stewards";
pub const WAREHOUSE_NAMESPACE: &str = "consumer-ns";
pub const WAREHOUSE_ROLE: &str = "bi-role";

// ============================================================================
// Test Database Infrastructure
// ============================================================================

/// A temporary share database that is removed when dropped.
pub struct TestDb {
    _temp_dir: TempDir,
    db_path: PathBuf,
}

impl TestDb {
    pub fn new() -> Result<Self> {
        let temp_dir = tempdir()
            .map_err(|e| ShareError::Other(format!("Failed to create temp dir: {}", e)))?;
        let db_path = temp_dir.path().join("test_shares.db");
        Ok(Self {
            _temp_dir: temp_dir,
            db_path,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.db_path
    }
}

// ============================================================================
// Scripted Processor
// ============================================================================

/// One processor invocation, with wall-clock bounds
#[derive(Debug, Clone)]
pub struct ProcessorCall {
    pub operation: &'static str,
    pub share_uri: String,
    pub dataset_uri: String,
    pub item_names: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Processor for every item kind whose outcomes are scripted by item name.
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    failing: DashSet<String>,
    unhealthy: DashSet<String>,
    calls: Mutex<Vec<ProcessorCall>>,
    delay: Mutex<Duration>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants and revokes of this item fail until [`Self::heal`] is called.
    pub fn fail_item(&self, item_name: &str) {
        self.failing.insert(item_name.to_string());
    }

    /// Verification reports this item as unhealthy until healed.
    pub fn break_item(&self, item_name: &str) {
        self.unhealthy.insert(item_name.to_string());
    }

    pub fn heal(&self, item_name: &str) {
        self.failing.remove(item_name);
        self.unhealthy.remove(item_name);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<ProcessorCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    async fn record<T>(
        &self,
        operation: &'static str,
        data: &ShareData,
        items: &[ShareObjectItem],
        outcome: impl Fn(&ShareObjectItem) -> T,
    ) -> HashMap<String, T> {
        let started = Instant::now();
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = items
            .iter()
            .map(|i| (i.share_item_uri.clone(), outcome(i)))
            .collect();

        self.calls.lock().push(ProcessorCall {
            operation,
            share_uri: data.share.share_uri.clone(),
            dataset_uri: data.share.dataset_uri.clone(),
            item_names: items.iter().map(|i| i.item_name.clone()).collect(),
            started,
            finished: Instant::now(),
        });
        result
    }

    fn item_outcome(&self, item: &ShareObjectItem) -> ItemOutcome {
        if self.failing.contains(&item.item_name) {
            ItemOutcome::Failed(format!("scripted failure for {}", item.item_name))
        } else {
            ItemOutcome::Succeeded
        }
    }
}

#[async_trait]
impl SharingProcessor for ScriptedProcessor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn shareable_types(&self) -> &'static [ShareableType] {
        ShareableType::ALL
    }

    async fn grant(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        self.record("grant", data, items, |i| self.item_outcome(i)).await
    }

    async fn revoke(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        self.record("revoke", data, items, |i| self.item_outcome(i)).await
    }

    async fn verify(&self, data: &ShareData, items: &[ShareObjectItem]) -> VerifyOutcome {
        self.record("verify", data, items, |i| {
            if self.unhealthy.contains(&i.item_name) {
                HealthOutcome::Unhealthy(format!("scripted drift on {}", i.item_name))
            } else {
                HealthOutcome::Healthy
            }
        })
        .await
    }
}

// ============================================================================
// Recording Notifier
// ============================================================================

/// Keeps every notification; can be switched to fail every delivery.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<ShareNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ShareNotification> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|n| n.kind()).collect()
    }
}

#[async_trait]
impl ShareNotifier for RecordingNotifier {
    async fn notify(&self, notification: ShareNotification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ShareError::Other("notification channel unavailable".to_string()));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

// ============================================================================
// Test Sharing Environment
// ============================================================================

/// A share service over a temporary database and in-memory collaborators.
///
/// Comes with a producer environment owning two datasets (`sales` on object
/// storage, `warehouse-sales` in the warehouse) and a consumer environment
/// where the `analysts` team requests access.
pub struct TestSharingEnv {
    _test_db: TestDb,
    pub config: SharingConfig,
    pub service: Arc<ShareService>,
    pub directory: Arc<InMemoryDirectory>,
    pub identity: Arc<InMemoryIdentityProvider>,
    pub policies: Arc<InMemoryPolicyStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub processor: Arc<ScriptedProcessor>,
    pub object_storage: Arc<InMemoryObjectStorageApi>,
    pub datashares: Arc<InMemoryDatashareApi>,
}

impl TestSharingEnv {
    /// Every item kind handled by a [`ScriptedProcessor`].
    pub async fn new() -> Result<Self> {
        Self::build(false).await
    }

    /// Object storage and warehouse processors over in-memory cloud APIs.
    pub async fn with_cloud_apis() -> Result<Self> {
        Self::build(true).await
    }

    async fn build(cloud_apis: bool) -> Result<Self> {
        let test_db = TestDb::new()?;
        let config = SharingConfig::builder(test_db.path())
            .lock_max_retries(200)
            .lock_retry_interval(Duration::from_millis(5), Duration::from_millis(25))
            .build()?;

        let producer = producer_environment();
        let consumer = consumer_environment();

        let directory = Arc::new(InMemoryDirectory::new());
        directory.put_environment(producer.clone());
        directory.put_environment(consumer.clone());
        directory.put_dataset(object_storage_dataset());
        directory.put_dataset(warehouse_dataset());

        let identity = Arc::new(InMemoryIdentityProvider::from_environments([
            &producer, &consumer,
        ]));
        identity.add_role(CONSUMER_ENV, WAREHOUSE_ROLE);

        let processor = Arc::new(ScriptedProcessor::new());
        let object_storage = Arc::new(InMemoryObjectStorageApi::new());
        let datashares = Arc::new(InMemoryDatashareApi::new());

        let registry = if cloud_apis {
            SharingRegistry::standard(identity.clone(), object_storage.clone(), datashares.clone())
        } else {
            SharingRegistry::builder()
                .processor(processor.clone())
                .validator(
                    DatasetKind::ObjectStorage,
                    Arc::new(ObjectStorageShareValidator::new(identity.clone())),
                )
                .validator(
                    DatasetKind::Warehouse,
                    Arc::new(WarehouseShareValidator::new(identity.clone())),
                )
                .build()
        };

        let policies = Arc::new(InMemoryPolicyStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = ShareService::new(
            &config,
            registry,
            Collaborators {
                directory: directory.clone(),
                identity: identity.clone(),
                policies: policies.clone(),
                notifier: notifier.clone(),
            },
        );
        service.repository().initialize().await?;

        Ok(Self {
            _test_db: test_db,
            config,
            service: Arc::new(service),
            directory,
            identity,
            policies,
            notifier,
            processor,
            object_storage,
            datashares,
        })
    }

    /// Member of the requesting team
    pub fn requester(&self) -> RequestContext {
        RequestContext::new("alice", [REQUESTER_GROUP])
    }

    /// Member of the dataset admin team
    pub fn approver(&self) -> RequestContext {
        RequestContext::new("bob", [ADMIN_GROUP])
    }

    pub async fn submit(&self, share_uri: &str) -> Result<ShareObject> {
        self.service
            .submit_share_object(&self.requester(), share_uri)
            .await
    }

    pub async fn approve(&self, share_uri: &str) -> Result<ShareObject> {
        self.service
            .approve_share_object(&self.approver(), share_uri)
            .await
    }

    pub async fn share(&self, share_uri: &str) -> Result<ShareObject> {
        self.service
            .repository()
            .get_share(share_uri)
            .await?
            .ok_or_else(|| ShareError::ShareNotFound(share_uri.to_string()))
    }

    pub async fn items(&self, share_uri: &str) -> Result<Vec<ShareObjectItem>> {
        self.service
            .repository()
            .list_items(share_uri, ItemFilter::default())
            .await
    }

    /// The item with this display name.
    pub async fn item(&self, share_uri: &str, item_name: &str) -> Result<ShareObjectItem> {
        self.items(share_uri)
            .await?
            .into_iter()
            .find(|i| i.item_name == item_name)
            .ok_or_else(|| ShareError::ItemNotFound(item_name.to_string()))
    }
}

pub fn producer_environment() -> Environment {
    Environment {
        environment_uri: PRODUCER_ENV.to_string(),
        name: "producer".to_string(),
        aws_account_id: "111111111111".to_string(),
        region: "eu-west-1".to_string(),
        groups: vec![ADMIN_GROUP.to_string()],
        group_roles: HashMap::from([(ADMIN_GROUP.to_string(), "admins-role".to_string())]),
        consumption_roles: HashMap::new(),
    }
}

pub fn consumer_environment() -> Environment {
    Environment {
        environment_uri: CONSUMER_ENV.to_string(),
        name: "consumer".to_string(),
        aws_account_id: "222222222222".to_string(),
        region: "eu-west-1".to_string(),
        groups: vec![REQUESTER_GROUP.to_string(), "finance".to_string()],
        group_roles: HashMap::from([
            (REQUESTER_GROUP.to_string(), REQUESTER_ROLE.to_string()),
            ("finance".to_string(), "finance-role".to_string()),
        ]),
        consumption_roles: HashMap::from([("etl".to_string(), "etl-role".to_string())]),
    }
}

pub fn object_storage_dataset() -> Dataset {
    Dataset {
        dataset_uri: "sales".to_string(),
        name: "Sales".to_string(),
        environment_uri: PRODUCER_ENV.to_string(),
        aws_account_id: "111111111111".to_string(),
        region: "eu-west-1".to_string(),
        admin_group: ADMIN_GROUP.to_string(),
        stewards: Some(STEWARD_GROUP.to_string()),
        auto_approval_enabled: false,
        resource: DatasetResource::ObjectStorage {
            bucket: "sales-bucket".to_string(),
            kms_alias: None,
        },
    }
}

pub fn warehouse_dataset() -> Dataset {
    Dataset {
        dataset_uri: "warehouse-sales".to_string(),
        name: "Warehouse Sales".to_string(),
        environment_uri: PRODUCER_ENV.to_string(),
        aws_account_id: "111111111111".to_string(),
        region: "eu-west-1".to_string(),
        admin_group: ADMIN_GROUP.to_string(),
        stewards: None,
        auto_approval_enabled: false,
        resource: DatasetResource::Warehouse {
            namespace: "producer-ns".to_string(),
            database: "dev".to_string(),
            schema: "public".to_string(),
        },
    }
}

// ============================================================================
// Share Fixture Builder
// ============================================================================

/// Builder for a share with items, created through the service.
///
/// # Example
///
/// ```rust,ignore
/// let created = ShareFixture::new("sales")
///     .table("orders_table")
///     .table("customers_table")
///     .create(&env)
///     .await?;
/// ```
pub struct ShareFixture {
    dataset_uri: String,
    group_uri: String,
    principal_id: String,
    principal_type: PrincipalType,
    principal_role_name: Option<String>,
    permissions: Vec<ShareObjectDataPermission>,
    items: Vec<ShareItemRequest>,
}

impl ShareFixture {
    /// A share for the `analysts` team with Read permission.
    pub fn new(dataset_uri: &str) -> Self {
        Self {
            dataset_uri: dataset_uri.to_string(),
            group_uri: REQUESTER_GROUP.to_string(),
            principal_id: REQUESTER_GROUP.to_string(),
            principal_type: PrincipalType::Group,
            principal_role_name: None,
            permissions: vec![ShareObjectDataPermission::Read],
            items: Vec::new(),
        }
    }

    /// Request the warehouse dataset for the consumer namespace.
    pub fn warehouse() -> Self {
        Self {
            principal_id: WAREHOUSE_NAMESPACE.to_string(),
            principal_type: PrincipalType::WarehouseNamespace,
            principal_role_name: Some(WAREHOUSE_ROLE.to_string()),
            ..Self::new("warehouse-sales")
        }
    }

    pub fn principal(mut self, principal_id: &str, principal_type: PrincipalType) -> Self {
        self.principal_id = principal_id.to_string();
        self.principal_type = principal_type;
        self
    }

    pub fn permissions(mut self, permissions: &[ShareObjectDataPermission]) -> Self {
        self.permissions = permissions.to_vec();
        self
    }

    pub fn item(mut self, item_type: ShareableType, item_name: &str) -> Self {
        self.items.push(ShareItemRequest {
            item_type,
            item_uri: format!("{}-{}", item_type.as_str().to_lowercase(), item_name),
            item_name: item_name.to_string(),
        });
        self
    }

    pub fn table(self, name: &str) -> Self {
        self.item(ShareableType::Table, name)
    }

    pub fn folder(self, prefix: &str) -> Self {
        self.item(ShareableType::StorageLocation, prefix)
    }

    pub fn warehouse_table(self, name: &str) -> Self {
        self.item(ShareableType::WarehouseTable, name)
    }

    /// Create the share as the env's requester and attach every item.
    pub async fn create(self, env: &TestSharingEnv) -> Result<CreatedShare> {
        let ctx = env.requester();
        let mut items = self.items.into_iter();

        let mut created = env
            .service
            .create_share_object(
                &ctx,
                CreateShareRequest {
                    dataset_uri: self.dataset_uri,
                    environment_uri: CONSUMER_ENV.to_string(),
                    group_uri: self.group_uri,
                    principal_id: self.principal_id,
                    principal_type: self.principal_type,
                    principal_role_name: self.principal_role_name,
                    permissions: self.permissions,
                    request_purpose: Some("quarterly reporting".to_string()),
                    item: items.next(),
                },
            )
            .await?;

        for item in items {
            env.service
                .add_shared_item(&ctx, &created.share.share_uri, item)
                .await?;
        }
        created.share = env.share(&created.share.share_uri).await?;
        Ok(created)
    }

    /// Create, submit and approve.
    pub async fn processed(self, env: &TestSharingEnv) -> Result<ShareObject> {
        let created = self.create(env).await?;
        env.submit(&created.share.share_uri).await?;
        env.approve(&created.share.share_uri).await
    }
}
