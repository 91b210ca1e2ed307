//! MetaFuse Share Engine
//!
//! Drives share objects through their lifecycle: request, submission,
//! approval, grant, revocation and deletion. Grants and revocations are
//! delegated to a [`SharingProcessor`] per item kind and run under a
//! per-dataset lock. Background tasks verify shared items and reapply the
//! ones that drifted or failed.
//!
//! # Feature Flags
//!
//! - `metrics`: Prometheus counters for item outcomes, lock waits and sweeps
//! - `test-utils`: Temporary databases, scripted processors and fixtures

pub mod config;
pub mod context;
pub mod directory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod notification;
pub mod policy;
pub mod processor;
pub mod registry;
pub mod service;
pub mod tasks;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validator;

pub use config::{SharingConfig, SharingConfigBuilder};
pub use context::{user_role_for_share, RequestContext, ShareObjectRole};
pub use directory::{
    CatalogDirectory, Dataset, DatasetKind, DatasetResource, DirectorySnapshot, Environment,
    IdentityProvider, InMemoryDirectory, InMemoryIdentityProvider,
};
pub use notification::{ShareNotification, ShareNotifier, TracingNotifier};
pub use policy::{InMemoryPolicyStore, ResourcePolicyService};
pub use processor::{
    BatchOutcome, CloudApiError, HealthOutcome, ItemOutcome, ShareData, SharingProcessor,
    VerifyOutcome,
};
pub use registry::{SharingRegistry, SharingRegistryBuilder};
pub use service::{
    Collaborators, CreateShareRequest, CreatedShare, ReapplyReport, ShareItemRequest,
    ShareService, VerifyReport, AUTO_APPROVER,
};
pub use tasks::{
    reapplier_task, verifier_task, ShareReapplier, ShareVerifier, SweepReport,
    REAPPLIER_PROCESS, VERIFIER_PROCESS,
};
pub use validator::{
    CreateShareCheck, ObjectStorageShareValidator, ShareValidator, WarehouseShareValidator,
};
