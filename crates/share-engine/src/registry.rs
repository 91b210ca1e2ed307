//! Dispatch tables from item kind to processor and from dataset kind to
//! validator, assembled once at startup.

use crate::directory::{DatasetKind, IdentityProvider};
use crate::processor::{
    DatashareApi, ObjectStoragePolicyApi, ObjectStorageShareProcessor, SharingProcessor,
    WarehouseShareProcessor,
};
use crate::validator::{ObjectStorageShareValidator, ShareValidator, WarehouseShareValidator};
use metafuse_share_core::{Result, ShareError, ShareableType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Default)]
pub struct SharingRegistry {
    processors: HashMap<ShareableType, Arc<dyn SharingProcessor>>,
    validators: HashMap<DatasetKind, Arc<dyn ShareValidator>>,
}

impl SharingRegistry {
    pub fn builder() -> SharingRegistryBuilder {
        SharingRegistryBuilder::default()
    }

    /// Object storage and warehouse processors and validators over the given APIs.
    pub fn standard(
        identity: Arc<dyn IdentityProvider>,
        object_storage: Arc<dyn ObjectStoragePolicyApi>,
        datashares: Arc<dyn DatashareApi>,
    ) -> Self {
        Self::builder()
            .processor(Arc::new(ObjectStorageShareProcessor::new(object_storage)))
            .processor(Arc::new(WarehouseShareProcessor::new(datashares)))
            .validator(
                DatasetKind::ObjectStorage,
                Arc::new(ObjectStorageShareValidator::new(identity.clone())),
            )
            .validator(
                DatasetKind::Warehouse,
                Arc::new(WarehouseShareValidator::new(identity)),
            )
            .build()
    }

    pub fn processor(&self, item_type: ShareableType) -> Option<&Arc<dyn SharingProcessor>> {
        self.processors.get(&item_type)
    }

    pub fn validator(&self, kind: DatasetKind) -> Result<&Arc<dyn ShareValidator>> {
        self.validators
            .get(&kind)
            .ok_or_else(|| ShareError::Other(format!("No share validator registered for {} datasets", kind)))
    }

    /// Item kinds with a registered processor.
    pub fn shareable_types(&self) -> Vec<ShareableType> {
        let mut types: Vec<_> = self.processors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl std::fmt::Debug for SharingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharingRegistry")
            .field("processors", &self.shareable_types())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct SharingRegistryBuilder {
    registry: SharingRegistry,
}

impl SharingRegistryBuilder {
    /// Register a processor for every item kind it declares. A later
    /// registration replaces an earlier one for the same kind.
    pub fn processor(mut self, processor: Arc<dyn SharingProcessor>) -> Self {
        for item_type in processor.shareable_types() {
            if let Some(previous) = self
                .registry
                .processors
                .insert(*item_type, processor.clone())
            {
                warn!(
                    item_type = %item_type,
                    previous = previous.name(),
                    replacement = processor.name(),
                    "Replacing sharing processor"
                );
            }
        }
        self
    }

    pub fn validator(mut self, kind: DatasetKind, validator: Arc<dyn ShareValidator>) -> Self {
        self.registry.validators.insert(kind, validator);
        self
    }

    pub fn build(self) -> SharingRegistry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryIdentityProvider;
    use crate::processor::memory::{InMemoryDatashareApi, InMemoryObjectStorageApi};

    #[test]
    fn test_standard_registry_covers_object_storage_and_warehouse() {
        let registry = SharingRegistry::standard(
            Arc::new(InMemoryIdentityProvider::new()),
            Arc::new(InMemoryObjectStorageApi::new()),
            Arc::new(InMemoryDatashareApi::new()),
        );

        assert_eq!(
            registry.processor(ShareableType::S3Bucket).map(|p| p.name()),
            Some("object_storage")
        );
        assert_eq!(
            registry.processor(ShareableType::WarehouseTable).map(|p| p.name()),
            Some("warehouse")
        );
        assert!(registry.processor(ShareableType::Table).is_none());
        assert!(registry.validator(DatasetKind::Warehouse).is_ok());
        assert!(SharingRegistry::default()
            .validator(DatasetKind::ObjectStorage)
            .is_err());
    }
}
