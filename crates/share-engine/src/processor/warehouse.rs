//! Warehouse table sharing through datashares.
//!
//! The producer namespace publishes a datashare holding the shared tables;
//! the consumer namespace mounts it as a database and the consumer role is
//! granted select on each table. Datashare and consumer database setup runs
//! once per batch, and a setup failure fails every item of the batch.

use super::{
    fail_all, unhealthy_all, BatchOutcome, CloudApiError, HealthOutcome, ItemOutcome,
    ShareData, SharingProcessor, VerifyOutcome,
};
use crate::directory::DatasetResource;
use async_trait::async_trait;
use metafuse_share_core::{ShareObjectItem, ShareableType};
use std::sync::Arc;
use tracing::{info, warn};

/// Producer side of a datashare
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatashareRef {
    pub producer_namespace: String,
    pub datashare: String,
    pub schema: String,
}

/// Consumer side of a datashare
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerRef {
    pub namespace: String,
    pub database: String,
    pub role: String,
}

/// Datashare API of the warehouse
#[async_trait]
pub trait DatashareApi: Send + Sync {
    /// Create the datashare if missing and authorize the consumer namespace.
    async fn ensure_datashare(
        &self,
        datashare: &DatashareRef,
        consumer_namespace: &str,
    ) -> Result<(), CloudApiError>;

    /// Create the consumer database over the datashare if missing.
    async fn ensure_consumer_database(
        &self,
        datashare: &DatashareRef,
        consumer: &ConsumerRef,
    ) -> Result<(), CloudApiError>;

    async fn add_table(&self, datashare: &DatashareRef, table: &str) -> Result<(), CloudApiError>;

    async fn remove_table(&self, datashare: &DatashareRef, table: &str)
        -> Result<(), CloudApiError>;

    async fn grant_select(
        &self,
        consumer: &ConsumerRef,
        schema: &str,
        table: &str,
    ) -> Result<(), CloudApiError>;

    async fn revoke_select(
        &self,
        consumer: &ConsumerRef,
        schema: &str,
        table: &str,
    ) -> Result<(), CloudApiError>;

    /// Tables currently in the datashare
    async fn list_datashare_tables(
        &self,
        datashare: &DatashareRef,
    ) -> Result<Vec<String>, CloudApiError>;

    /// Tables the consumer role can select from, as `schema.table`
    async fn list_select_grants(&self, consumer: &ConsumerRef)
        -> Result<Vec<String>, CloudApiError>;
}

/// Processor for warehouse table items
pub struct WarehouseShareProcessor {
    api: Arc<dyn DatashareApi>,
}

impl WarehouseShareProcessor {
    pub fn new(api: Arc<dyn DatashareApi>) -> Self {
        Self { api }
    }

    fn refs(data: &ShareData) -> Result<(DatashareRef, ConsumerRef), String> {
        let (namespace, schema) = match &data.dataset.resource {
            DatasetResource::Warehouse {
                namespace, schema, ..
            } => (namespace.clone(), schema.clone()),
            DatasetResource::ObjectStorage { .. } => {
                return Err(format!(
                    "Dataset {} is not a warehouse dataset",
                    data.dataset.dataset_uri
                ))
            }
        };

        let datashare = datashare_name(&data.dataset.name, &data.share.share_uri);
        let consumer = ConsumerRef {
            namespace: data.share.principal_id.clone(),
            database: format!("{}_db", datashare),
            role: data.share.principal_role_name.clone(),
        };
        let datashare = DatashareRef {
            producer_namespace: namespace,
            datashare,
            schema,
        };
        Ok((datashare, consumer))
    }

    async fn setup(&self, datashare: &DatashareRef, consumer: &ConsumerRef) -> Result<(), String> {
        self.api
            .ensure_datashare(datashare, &consumer.namespace)
            .await
            .map_err(|e| format!("Failed to set up datashare {}: {}", datashare.datashare, e))?;
        self.api
            .ensure_consumer_database(datashare, consumer)
            .await
            .map_err(|e| format!("Failed to set up consumer database {}: {}", consumer.database, e))?;
        Ok(())
    }
}

#[async_trait]
impl SharingProcessor for WarehouseShareProcessor {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    fn shareable_types(&self) -> &'static [ShareableType] {
        &[ShareableType::WarehouseTable]
    }

    async fn grant(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        let (datashare, consumer) = match Self::refs(data) {
            Ok(refs) => refs,
            Err(message) => return fail_all(items, &message),
        };

        if let Err(message) = self.setup(&datashare, &consumer).await {
            warn!(share_uri = %data.share.share_uri, error = %message, "Datashare setup failed");
            return fail_all(items, &message);
        }

        let mut outcomes = BatchOutcome::new();
        for item in items {
            let table = item.item_name.as_str();
            let result = async {
                self.api.add_table(&datashare, table).await?;
                self.api
                    .grant_select(&consumer, &datashare.schema, table)
                    .await
            }
            .await;

            let outcome = match result {
                Ok(()) => ItemOutcome::Succeeded,
                Err(e) => {
                    warn!(
                        share_uri = %data.share.share_uri,
                        table = %table,
                        error = %e,
                        "Failed to share warehouse table"
                    );
                    ItemOutcome::Failed(format!("Failed to share table {}: {}", table, e))
                }
            };
            outcomes.insert(item.share_item_uri.clone(), outcome);
        }

        info!(
            share_uri = %data.share.share_uri,
            datashare = %datashare.datashare,
            items = items.len(),
            "Warehouse grant batch finished"
        );
        outcomes
    }

    async fn revoke(&self, data: &ShareData, items: &[ShareObjectItem]) -> BatchOutcome {
        let (datashare, consumer) = match Self::refs(data) {
            Ok(refs) => refs,
            Err(message) => return fail_all(items, &message),
        };

        let mut outcomes = BatchOutcome::new();
        for item in items {
            let table = item.item_name.as_str();
            let result = async {
                match self
                    .api
                    .revoke_select(&consumer, &datashare.schema, table)
                    .await
                {
                    Ok(()) | Err(CloudApiError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                match self.api.remove_table(&datashare, table).await {
                    Ok(()) | Err(CloudApiError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            .await;

            let outcome = match result {
                Ok(()) => ItemOutcome::Succeeded,
                Err(e) => ItemOutcome::Failed(format!("Failed to revoke table {}: {}", table, e)),
            };
            outcomes.insert(item.share_item_uri.clone(), outcome);
        }
        outcomes
    }

    async fn verify(&self, data: &ShareData, items: &[ShareObjectItem]) -> VerifyOutcome {
        let (datashare, consumer) = match Self::refs(data) {
            Ok(refs) => refs,
            Err(message) => return unhealthy_all(items, &message),
        };

        let tables = match self.api.list_datashare_tables(&datashare).await {
            Ok(t) => t,
            Err(e) => {
                return unhealthy_all(
                    items,
                    &format!("Cannot read datashare {}: {}", datashare.datashare, e),
                )
            }
        };
        let grants = match self.api.list_select_grants(&consumer).await {
            Ok(g) => g,
            Err(e) => {
                return unhealthy_all(items, &format!("Cannot read grants of {}: {}", consumer.role, e))
            }
        };

        items
            .iter()
            .map(|item| {
                let table = item.item_name.as_str();
                let qualified = format!("{}.{}", datashare.schema, table);
                let outcome = if !tables.iter().any(|t| t == table) {
                    HealthOutcome::Unhealthy(format!(
                        "Table {} missing from datashare {}",
                        table, datashare.datashare
                    ))
                } else if !grants.contains(&qualified) {
                    HealthOutcome::Unhealthy(format!(
                        "Role {} lacks select on {}",
                        consumer.role, qualified
                    ))
                } else {
                    HealthOutcome::Healthy
                };
                (item.share_item_uri.clone(), outcome)
            })
            .collect()
    }
}

/// Datashare names allow lowercase letters, digits and underscores.
fn datashare_name(dataset_name: &str, share_uri: &str) -> String {
    let suffix: String = share_uri
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let base: String = dataset_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datashare_name() {
        assert_eq!(
            datashare_name("Sales Data", "a1b2-c3d4-e5f6"),
            "sales_data_a1b2c3d4"
        );
    }
}
