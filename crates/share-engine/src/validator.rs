//! Per-dataset-kind checks run before a share is created, submitted or
//! approved.

use crate::directory::{Dataset, Environment, IdentityProvider};
use async_trait::async_trait;
use metafuse_share_core::{
    PrincipalType, Result, ShareError, ShareObject, ShareObjectDataPermission,
};
use std::sync::Arc;
use tracing::debug;

/// Arguments of a create request, resolved against the directory
#[derive(Debug, Clone)]
pub struct CreateShareCheck<'a> {
    pub dataset: &'a Dataset,
    pub environment: &'a Environment,
    pub group_uri: &'a str,
    pub principal_id: &'a str,
    pub principal_type: PrincipalType,
    pub principal_role_name: &'a str,
    pub permissions: &'a [ShareObjectDataPermission],
}

#[async_trait]
pub trait ShareValidator: Send + Sync {
    async fn validate_share_object_create(&self, check: &CreateShareCheck<'_>) -> Result<()>;

    async fn validate_share_object_submit(
        &self,
        dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()>;

    async fn validate_share_object_approve(
        &self,
        dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()>;
}

/// Validation for object storage datasets
pub struct ObjectStorageShareValidator {
    identity: Arc<dyn IdentityProvider>,
}

impl ObjectStorageShareValidator {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl ShareValidator for ObjectStorageShareValidator {
    async fn validate_share_object_create(&self, check: &CreateShareCheck<'_>) -> Result<()> {
        const ACTION: &str = "create share object";

        if check.principal_type == PrincipalType::WarehouseNamespace {
            return Err(ShareError::invalid_input(
                "principalType",
                check.principal_type.as_str(),
                "object storage datasets are shared with groups or consumption roles",
            ));
        }
        check_not_self_share(ACTION, check)?;
        check_same_region(ACTION, check.dataset, check.environment)?;
        check_role_exists(
            self.identity.as_ref(),
            ACTION,
            check.environment,
            check.principal_type,
            check.principal_role_name,
        )
        .await?;

        let writes = check
            .permissions
            .iter()
            .any(|p| *p != ShareObjectDataPermission::Read);
        if writes && check.environment.aws_account_id != check.dataset.aws_account_id {
            return Err(ShareError::invalid_input(
                "permissions",
                &format_permissions(check.permissions),
                "write or modify access requires the target environment to be in the dataset's account",
            ));
        }

        debug!(dataset_uri = %check.dataset.dataset_uri, "Object storage create checks passed");
        Ok(())
    }

    async fn validate_share_object_submit(
        &self,
        _dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()> {
        check_role_exists(
            self.identity.as_ref(),
            "submit share object",
            environment,
            share.principal_type,
            &share.principal_role_name,
        )
        .await
    }

    async fn validate_share_object_approve(
        &self,
        _dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()> {
        check_role_exists(
            self.identity.as_ref(),
            "approve share object",
            environment,
            share.principal_type,
            &share.principal_role_name,
        )
        .await
    }
}

/// Validation for warehouse datasets. Warehouse shares are read-only and
/// always target a consumer namespace.
pub struct WarehouseShareValidator {
    identity: Arc<dyn IdentityProvider>,
}

impl WarehouseShareValidator {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl ShareValidator for WarehouseShareValidator {
    async fn validate_share_object_create(&self, check: &CreateShareCheck<'_>) -> Result<()> {
        const ACTION: &str = "create share object";

        if check.principal_type != PrincipalType::WarehouseNamespace {
            return Err(ShareError::invalid_input(
                "principalType",
                check.principal_type.as_str(),
                "warehouse datasets are shared with a consumer namespace",
            ));
        }
        check_same_region(ACTION, check.dataset, check.environment)?;

        if check
            .permissions
            .iter()
            .any(|p| *p != ShareObjectDataPermission::Read)
        {
            return Err(ShareError::invalid_input(
                "permissions",
                &format_permissions(check.permissions),
                "warehouse shares only grant Read",
            ));
        }

        check_role_exists(
            self.identity.as_ref(),
            ACTION,
            check.environment,
            check.principal_type,
            check.principal_role_name,
        )
        .await
    }

    async fn validate_share_object_submit(
        &self,
        _dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()> {
        check_role_exists(
            self.identity.as_ref(),
            "submit share object",
            environment,
            share.principal_type,
            &share.principal_role_name,
        )
        .await
    }

    async fn validate_share_object_approve(
        &self,
        _dataset: &Dataset,
        environment: &Environment,
        share: &ShareObject,
    ) -> Result<()> {
        check_role_exists(
            self.identity.as_ref(),
            "approve share object",
            environment,
            share.principal_type,
            &share.principal_role_name,
        )
        .await
    }
}

/// A team managing the dataset already has access in its own environment.
fn check_not_self_share(action: &str, check: &CreateShareCheck<'_>) -> Result<()> {
    if check.principal_type == PrincipalType::Group
        && check.environment.environment_uri == check.dataset.environment_uri
        && check.dataset.is_managed_by(check.group_uri)
    {
        return Err(ShareError::unauthorized(
            action,
            format!(
                "Team {} is managing the dataset {}",
                check.group_uri, check.dataset.name
            ),
        ));
    }
    Ok(())
}

fn check_same_region(action: &str, dataset: &Dataset, environment: &Environment) -> Result<()> {
    if dataset.region != environment.region {
        return Err(ShareError::unauthorized(
            action,
            format!(
                "Requester environment {} is in {} but dataset {} is in {}",
                environment.name, environment.region, dataset.name, dataset.region
            ),
        ));
    }
    Ok(())
}

pub(crate) async fn check_role_exists(
    identity: &dyn IdentityProvider,
    action: &str,
    environment: &Environment,
    principal_type: PrincipalType,
    role_name: &str,
) -> Result<()> {
    if identity
        .role_exists(environment, principal_type, role_name)
        .await?
    {
        Ok(())
    } else {
        Err(ShareError::role_not_found(
            action,
            format!(
                "Principal role {} does not exist in environment {}",
                role_name, environment.name
            ),
        ))
    }
}

fn format_permissions(permissions: &[ShareObjectDataPermission]) -> String {
    permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DatasetResource, InMemoryIdentityProvider};
    use std::collections::HashMap;

    fn dataset(resource: DatasetResource) -> Dataset {
        Dataset {
            dataset_uri: "sales".to_string(),
            name: "Sales".to_string(),
            environment_uri: "env-producer".to_string(),
            aws_account_id: "111111111111".to_string(),
            region: "eu-west-1".to_string(),
            admin_group: "sales-admins".to_string(),
            stewards: None,
            auto_approval_enabled: false,
            resource,
        }
    }

    fn environment(uri: &str, account: &str, region: &str) -> Environment {
        Environment {
            environment_uri: uri.to_string(),
            name: uri.to_string(),
            aws_account_id: account.to_string(),
            region: region.to_string(),
            groups: vec!["analysts".to_string(), "sales-admins".to_string()],
            group_roles: HashMap::from([
                ("analysts".to_string(), "analysts-role".to_string()),
                ("sales-admins".to_string(), "admins-role".to_string()),
            ]),
            consumption_roles: HashMap::new(),
        }
    }

    fn bucket() -> DatasetResource {
        DatasetResource::ObjectStorage {
            bucket: "sales-bucket".to_string(),
            kms_alias: None,
        }
    }

    fn check<'a>(
        dataset: &'a Dataset,
        environment: &'a Environment,
        group: &'a str,
        role: &'a str,
        permissions: &'a [ShareObjectDataPermission],
    ) -> CreateShareCheck<'a> {
        CreateShareCheck {
            dataset,
            environment,
            group_uri: group,
            principal_id: group,
            principal_type: PrincipalType::Group,
            principal_role_name: role,
            permissions,
        }
    }

    #[tokio::test]
    async fn test_object_storage_create_rules() {
        let ds = dataset(bucket());
        let consumer = environment("env-consumer", "222222222222", "eu-west-1");
        let producer = environment("env-producer", "111111111111", "eu-west-1");
        let identity = Arc::new(InMemoryIdentityProvider::from_environments([&consumer, &producer]));
        let validator = ObjectStorageShareValidator::new(identity);
        let read = [ShareObjectDataPermission::Read];
        let write = [ShareObjectDataPermission::Read, ShareObjectDataPermission::Write];

        validator
            .validate_share_object_create(&check(&ds, &consumer, "analysts", "analysts-role", &read))
            .await
            .unwrap();

        // Dataset admins in the dataset's own environment
        let err = validator
            .validate_share_object_create(&check(&ds, &producer, "sales-admins", "admins-role", &read))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::UnauthorizedOperation { .. }));

        let err = validator
            .validate_share_object_create(&check(&ds, &consumer, "analysts", "ghost-role", &read))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::PrincipalRoleNotFound { .. }));

        let err = validator
            .validate_share_object_create(&check(&ds, &consumer, "analysts", "analysts-role", &write))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::InvalidInput { .. }));

        // Same account allows write
        validator
            .validate_share_object_create(&check(&ds, &producer, "analysts", "analysts-role", &write))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_region_mismatch_is_unauthorized() {
        let ds = dataset(bucket());
        let far = environment("env-far", "222222222222", "us-east-1");
        let identity = Arc::new(InMemoryIdentityProvider::from_environments([&far]));
        let validator = ObjectStorageShareValidator::new(identity);
        let read = [ShareObjectDataPermission::Read];

        let err = validator
            .validate_share_object_create(&check(&ds, &far, "analysts", "analysts-role", &read))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::UnauthorizedOperation { .. }));
    }

    #[tokio::test]
    async fn test_warehouse_rules() {
        let ds = dataset(DatasetResource::Warehouse {
            namespace: "producer-ns".to_string(),
            database: "dev".to_string(),
            schema: "public".to_string(),
        });
        let consumer = environment("env-consumer", "222222222222", "eu-west-1");
        let identity = Arc::new(InMemoryIdentityProvider::new());
        identity.add_role("env-consumer", "bi-role");
        let validator = WarehouseShareValidator::new(identity);
        let read = [ShareObjectDataPermission::Read];
        let write = [ShareObjectDataPermission::Write];

        let mut ok = check(&ds, &consumer, "analysts", "bi-role", &read);
        ok.principal_type = PrincipalType::WarehouseNamespace;
        ok.principal_id = "consumer-ns";
        validator.validate_share_object_create(&ok).await.unwrap();

        let mut writes = ok.clone();
        writes.permissions = &write;
        assert!(matches!(
            validator.validate_share_object_create(&writes).await,
            Err(ShareError::InvalidInput { .. })
        ));

        let group = check(&ds, &consumer, "analysts", "bi-role", &read);
        assert!(matches!(
            validator.validate_share_object_create(&group).await,
            Err(ShareError::InvalidInput { .. })
        ));
    }
}
