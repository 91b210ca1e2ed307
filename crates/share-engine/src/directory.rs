//! Read-only views of datasets, environments and principal roles.
//!
//! The share engine does not own datasets or environments. It looks them up
//! through [`CatalogDirectory`] and checks role existence through
//! [`IdentityProvider`]; the in-memory implementations back tests and the
//! CLI's local mode.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use metafuse_share_core::{PrincipalType, Result, ShareError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Physical resource behind a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetResource {
    ObjectStorage {
        bucket: String,
        #[serde(default)]
        kms_alias: Option<String>,
    },
    Warehouse {
        /// Producer namespace owning the datashare
        namespace: String,
        database: String,
        schema: String,
    },
}

/// Dispatch key for validators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    ObjectStorage,
    Warehouse,
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::ObjectStorage => write!(f, "object_storage"),
            DatasetKind::Warehouse => write!(f, "warehouse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_uri: String,
    pub name: String,
    /// Environment owning the dataset
    pub environment_uri: String,
    pub aws_account_id: String,
    pub region: String,
    pub admin_group: String,
    #[serde(default)]
    pub stewards: Option<String>,
    #[serde(default)]
    pub auto_approval_enabled: bool,
    pub resource: DatasetResource,
}

impl Dataset {
    pub fn kind(&self) -> DatasetKind {
        match self.resource {
            DatasetResource::ObjectStorage { .. } => DatasetKind::ObjectStorage,
            DatasetResource::Warehouse { .. } => DatasetKind::Warehouse,
        }
    }

    /// Groups that approve shares on this dataset.
    pub fn approver_groups(&self) -> Vec<&str> {
        let mut groups = vec![self.admin_group.as_str()];
        if let Some(stewards) = self.stewards.as_deref() {
            if stewards != self.admin_group {
                groups.push(stewards);
            }
        }
        groups
    }

    pub fn is_managed_by(&self, group: &str) -> bool {
        self.approver_groups().contains(&group)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub environment_uri: String,
    pub name: String,
    pub aws_account_id: String,
    pub region: String,
    /// Teams invited to the environment
    #[serde(default)]
    pub groups: Vec<String>,
    /// Team name to the role the team acts through
    #[serde(default)]
    pub group_roles: HashMap<String, String>,
    /// Consumption role id to role name
    #[serde(default)]
    pub consumption_roles: HashMap<String, String>,
}

impl Environment {
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Role name a principal acts through in this environment.
    ///
    /// Warehouse namespaces have no environment role; their role is named on
    /// the request.
    pub fn principal_role_name(
        &self,
        principal_type: PrincipalType,
        principal_id: &str,
    ) -> Option<&str> {
        match principal_type {
            PrincipalType::Group => self.group_roles.get(principal_id).map(String::as_str),
            PrincipalType::ConsumptionRole => {
                self.consumption_roles.get(principal_id).map(String::as_str)
            }
            PrincipalType::WarehouseNamespace => None,
        }
    }
}

/// Lookup of datasets and environments owned by the wider catalog
#[async_trait]
pub trait CatalogDirectory: Send + Sync {
    async fn get_dataset(&self, dataset_uri: &str) -> Result<Option<Dataset>>;

    async fn get_environment(&self, environment_uri: &str) -> Result<Option<Environment>>;
}

/// Existence checks for principal roles
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn role_exists(
        &self,
        environment: &Environment,
        principal_type: PrincipalType,
        role_name: &str,
    ) -> Result<bool>;
}

/// Datasets and environments loaded up front
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

impl DirectorySnapshot {
    /// Load a JSON snapshot from disk.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShareError::Other(format!("Failed to read directory file {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// In-memory [`CatalogDirectory`]
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    datasets: DashMap<String, Dataset>,
    environments: DashMap<String, Environment>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        let directory = Self::new();
        for dataset in snapshot.datasets {
            directory.put_dataset(dataset);
        }
        for environment in snapshot.environments {
            directory.put_environment(environment);
        }
        directory
    }

    pub fn put_dataset(&self, dataset: Dataset) {
        self.datasets.insert(dataset.dataset_uri.clone(), dataset);
    }

    pub fn put_environment(&self, environment: Environment) {
        self.environments
            .insert(environment.environment_uri.clone(), environment);
    }

    pub fn remove_dataset(&self, dataset_uri: &str) -> Option<Dataset> {
        self.datasets.remove(dataset_uri).map(|(_, d)| d)
    }
}

#[async_trait]
impl CatalogDirectory for InMemoryDirectory {
    async fn get_dataset(&self, dataset_uri: &str) -> Result<Option<Dataset>> {
        Ok(self.datasets.get(dataset_uri).map(|d| d.value().clone()))
    }

    async fn get_environment(&self, environment_uri: &str) -> Result<Option<Environment>> {
        Ok(self
            .environments
            .get(environment_uri)
            .map(|e| e.value().clone()))
    }
}

/// In-memory [`IdentityProvider`] keyed by (environment, role name)
#[derive(Debug, Default)]
pub struct InMemoryIdentityProvider {
    roles: DashSet<(String, String)>,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every group and consumption role of the environments.
    pub fn from_environments<'a>(environments: impl IntoIterator<Item = &'a Environment>) -> Self {
        let provider = Self::new();
        for env in environments {
            for role in env.group_roles.values().chain(env.consumption_roles.values()) {
                provider.add_role(&env.environment_uri, role);
            }
        }
        provider
    }

    pub fn add_role(&self, environment_uri: &str, role_name: &str) {
        self.roles
            .insert((environment_uri.to_string(), role_name.to_string()));
    }

    pub fn remove_role(&self, environment_uri: &str, role_name: &str) {
        self.roles
            .remove(&(environment_uri.to_string(), role_name.to_string()));
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn role_exists(
        &self,
        environment: &Environment,
        _principal_type: PrincipalType,
        role_name: &str,
    ) -> Result<bool> {
        Ok(self.roles.contains(&(
            environment.environment_uri.clone(),
            role_name.to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn environment() -> Environment {
        Environment {
            environment_uri: "env-consumer".to_string(),
            name: "consumer".to_string(),
            aws_account_id: "222222222222".to_string(),
            region: "eu-west-1".to_string(),
            groups: vec!["analysts".to_string()],
            group_roles: HashMap::from([("analysts".to_string(), "analysts-role".to_string())]),
            consumption_roles: HashMap::from([("cr-1".to_string(), "etl-role".to_string())]),
        }
    }

    #[test]
    fn test_principal_role_resolution() {
        let env = environment();
        assert_eq!(
            env.principal_role_name(PrincipalType::Group, "analysts"),
            Some("analysts-role")
        );
        assert_eq!(
            env.principal_role_name(PrincipalType::ConsumptionRole, "cr-1"),
            Some("etl-role")
        );
        assert_eq!(env.principal_role_name(PrincipalType::Group, "finance"), None);
        assert_eq!(
            env.principal_role_name(PrincipalType::WarehouseNamespace, "ns-1"),
            None
        );
    }

    #[test]
    fn test_snapshot_json_round_trip_through_directory() {
        let json = r#"{
            "datasets": [{
                "dataset_uri": "sales",
                "name": "Sales",
                "environment_uri": "env-producer",
                "aws_account_id": "111111111111",
                "region": "eu-west-1",
                "admin_group": "sales-admins",
                "stewards": "sales-stewards",
                "resource": {"kind": "object_storage", "bucket": "sales-bucket"}
            }],
            "environments": []
        }"#;
        let snapshot: DirectorySnapshot = serde_json::from_str(json).unwrap();
        let directory = InMemoryDirectory::from_snapshot(snapshot);
        let dataset = directory.datasets.get("sales").unwrap().clone();
        assert_eq!(dataset.kind(), DatasetKind::ObjectStorage);
        assert!(dataset.is_managed_by("sales-stewards"));
        assert!(!dataset.is_managed_by("analysts"));
        assert!(!dataset.auto_approval_enabled);
    }

    #[test]
    fn test_snapshot_loads_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("directory.json");
        let snapshot = DirectorySnapshot {
            datasets: vec![],
            environments: vec![environment()],
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let loaded = DirectorySnapshot::from_json_file(&path).unwrap();
        assert_eq!(loaded.environments, vec![environment()]);

        let missing = DirectorySnapshot::from_json_file(&dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ShareError::Other(_))));
    }

    #[tokio::test]
    async fn test_identity_provider_tracks_roles() {
        let env = environment();
        let identity = InMemoryIdentityProvider::from_environments([&env]);
        assert!(identity
            .role_exists(&env, PrincipalType::Group, "analysts-role")
            .await
            .unwrap());

        identity.remove_role(&env.environment_uri, "analysts-role");
        assert!(!identity
            .role_exists(&env, PrincipalType::Group, "analysts-role")
            .await
            .unwrap());
    }
}
