//! Resource policies granting groups permissions on shares and shared items.

use async_trait::async_trait;
use dashmap::DashMap;
use metafuse_share_core::Result;
use std::collections::BTreeSet;

/// Policy storage owned by the identity layer
#[async_trait]
pub trait ResourcePolicyService: Send + Sync {
    /// Add `permissions` for `group` on a resource, keeping existing ones.
    async fn attach_resource_policy(
        &self,
        group: &str,
        permissions: &[&'static str],
        resource_uri: &str,
        resource_type: &str,
    ) -> Result<()>;

    /// Remove the group's policy on a resource. Deleting a missing policy is a no-op.
    async fn delete_resource_policy(
        &self,
        group: &str,
        resource_uri: &str,
        resource_type: &str,
    ) -> Result<()>;
}

/// In-memory [`ResourcePolicyService`]
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: DashMap<(String, String), PolicyEntry>,
}

#[derive(Debug, Clone, Default)]
struct PolicyEntry {
    resource_type: String,
    permissions: BTreeSet<&'static str>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_permission(&self, group: &str, resource_uri: &str, permission: &str) -> bool {
        self.policies
            .get(&(group.to_string(), resource_uri.to_string()))
            .map(|entry| entry.permissions.contains(permission))
            .unwrap_or(false)
    }

    pub fn resource_type(&self, group: &str, resource_uri: &str) -> Option<String> {
        self.policies
            .get(&(group.to_string(), resource_uri.to_string()))
            .map(|entry| entry.resource_type.clone())
    }

    /// Number of (group, resource) policies held.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[async_trait]
impl ResourcePolicyService for InMemoryPolicyStore {
    async fn attach_resource_policy(
        &self,
        group: &str,
        permissions: &[&'static str],
        resource_uri: &str,
        resource_type: &str,
    ) -> Result<()> {
        let mut entry = self
            .policies
            .entry((group.to_string(), resource_uri.to_string()))
            .or_default();
        entry.resource_type = resource_type.to_string();
        entry.permissions.extend(permissions.iter().copied());
        Ok(())
    }

    async fn delete_resource_policy(
        &self,
        group: &str,
        resource_uri: &str,
        _resource_type: &str,
    ) -> Result<()> {
        self.policies
            .remove(&(group.to_string(), resource_uri.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metafuse_share_core::permissions::{GET_SHARE_OBJECT, SUBMIT_SHARE_OBJECT};

    #[tokio::test]
    async fn test_attach_merges_and_delete_removes() {
        let store = InMemoryPolicyStore::new();
        store
            .attach_resource_policy("analysts", &[GET_SHARE_OBJECT], "share-1", "ShareObject")
            .await
            .unwrap();
        store
            .attach_resource_policy("analysts", &[SUBMIT_SHARE_OBJECT], "share-1", "ShareObject")
            .await
            .unwrap();

        assert!(store.has_permission("analysts", "share-1", GET_SHARE_OBJECT));
        assert!(store.has_permission("analysts", "share-1", SUBMIT_SHARE_OBJECT));
        assert_eq!(store.len(), 1);

        store
            .delete_resource_policy("analysts", "share-1", "ShareObject")
            .await
            .unwrap();
        assert!(!store.has_permission("analysts", "share-1", GET_SHARE_OBJECT));

        // Deleting again is harmless
        store
            .delete_resource_policy("analysts", "share-1", "ShareObject")
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
