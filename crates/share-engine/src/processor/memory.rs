//! In-memory cloud APIs used by tests and the CLI's local mode.
//!
//! Both keep the external state in concurrent maps and accept failure
//! injection so callers can exercise partial failures and drift.

use super::object_storage::{ObjectStoragePolicyApi, PolicyStatement, PolicyTarget};
use super::warehouse::{ConsumerRef, DatashareApi, DatashareRef};
use super::CloudApiError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Policy documents held in memory
#[derive(Debug, Default)]
pub struct InMemoryObjectStorageApi {
    policies: DashMap<PolicyTarget, Vec<PolicyStatement>>,
    /// Statements whose resources contain one of these fragments are refused
    failing_fragments: RwLock<Vec<String>>,
}

impl InMemoryObjectStorageApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse writes touching resources that contain `fragment`.
    pub fn fail_resources_containing(&self, fragment: impl Into<String>) {
        self.failing_fragments.write().push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.failing_fragments.write().clear();
    }

    /// Drop every statement with this id, as an out-of-band change would.
    pub fn drop_statement(&self, sid: &str) -> usize {
        let mut dropped = 0;
        for mut entry in self.policies.iter_mut() {
            let before = entry.len();
            entry.retain(|s| s.sid != sid);
            dropped += before - entry.len();
        }
        dropped
    }

    /// Every statement across all policy documents.
    pub fn statements(&self) -> Vec<(PolicyTarget, PolicyStatement)> {
        self.policies
            .iter()
            .flat_map(|entry| {
                let target = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(move |s| (target.clone(), s.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn check_failure(&self, resources: &[String]) -> Result<(), CloudApiError> {
        let failing = self.failing_fragments.read();
        match failing
            .iter()
            .find(|f| resources.iter().any(|r| r.contains(f.as_str())))
        {
            Some(fragment) => Err(CloudApiError::AccessDenied(format!(
                "writes to resources matching {} are denied",
                fragment
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectStoragePolicyApi for InMemoryObjectStorageApi {
    async fn put_statement(
        &self,
        target: &PolicyTarget,
        statement: &PolicyStatement,
    ) -> Result<(), CloudApiError> {
        self.check_failure(&statement.resources)?;
        let mut statements = self.policies.entry(target.clone()).or_default();
        statements.retain(|s| s.sid != statement.sid);
        statements.push(statement.clone());
        Ok(())
    }

    async fn remove_statement(&self, target: &PolicyTarget, sid: &str) -> Result<(), CloudApiError> {
        let resources: Vec<String> = self
            .policies
            .get(target)
            .and_then(|s| s.iter().find(|s| s.sid == sid).map(|s| s.resources.clone()))
            .ok_or_else(|| CloudApiError::NotFound(format!("statement {} on {}", sid, target)))?;
        self.check_failure(&resources)?;
        if let Some(mut statements) = self.policies.get_mut(target) {
            statements.retain(|s| s.sid != sid);
        }
        Ok(())
    }

    async fn list_statements(
        &self,
        target: &PolicyTarget,
    ) -> Result<Vec<PolicyStatement>, CloudApiError> {
        Ok(self
            .policies
            .get(target)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }
}

/// Datashares held in memory
#[derive(Debug, Default)]
pub struct InMemoryDatashareApi {
    datashares: DashSet<(String, String)>,
    consumer_databases: DashSet<(String, String)>,
    /// (producer namespace, datashare, table)
    tables: DashSet<(String, String, String)>,
    /// (consumer namespace, database, role, schema.table)
    grants: DashSet<(String, String, String, String)>,
    failing_tables: DashSet<String>,
    fail_setup: AtomicBool,
}

impl InMemoryDatashareApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every grant on this table fail.
    pub fn fail_table(&self, table: impl Into<String>) {
        self.failing_tables.insert(table.into());
    }

    pub fn clear_failures(&self) {
        self.failing_tables.clear();
        self.fail_setup.store(false, Ordering::SeqCst);
    }

    /// Make datashare setup fail for the next batches.
    pub fn fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    /// Remove a select grant behind the engine's back.
    pub fn drop_grant(&self, table: &str) -> usize {
        let before = self.grants.len();
        self.grants
            .retain(|(_, _, _, qualified)| !qualified.ends_with(&format!(".{}", table)));
        before - self.grants.len()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    fn check_table(&self, table: &str) -> Result<(), CloudApiError> {
        if self.failing_tables.contains(table) {
            return Err(CloudApiError::AccessDenied(format!(
                "permission denied for table {}",
                table
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatashareApi for InMemoryDatashareApi {
    async fn ensure_datashare(
        &self,
        datashare: &DatashareRef,
        _consumer_namespace: &str,
    ) -> Result<(), CloudApiError> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(CloudApiError::Other(format!(
                "cannot create datashare {}",
                datashare.datashare
            )));
        }
        self.datashares.insert((
            datashare.producer_namespace.clone(),
            datashare.datashare.clone(),
        ));
        Ok(())
    }

    async fn ensure_consumer_database(
        &self,
        _datashare: &DatashareRef,
        consumer: &ConsumerRef,
    ) -> Result<(), CloudApiError> {
        self.consumer_databases
            .insert((consumer.namespace.clone(), consumer.database.clone()));
        Ok(())
    }

    async fn add_table(&self, datashare: &DatashareRef, table: &str) -> Result<(), CloudApiError> {
        self.check_table(table)?;
        self.tables.insert((
            datashare.producer_namespace.clone(),
            datashare.datashare.clone(),
            table.to_string(),
        ));
        Ok(())
    }

    async fn remove_table(&self, datashare: &DatashareRef, table: &str) -> Result<(), CloudApiError> {
        self.check_table(table)?;
        let key = (
            datashare.producer_namespace.clone(),
            datashare.datashare.clone(),
            table.to_string(),
        );
        match self.tables.remove(&key) {
            Some(_) => Ok(()),
            None => Err(CloudApiError::NotFound(format!(
                "table {} in {}",
                table, datashare.datashare
            ))),
        }
    }

    async fn grant_select(
        &self,
        consumer: &ConsumerRef,
        schema: &str,
        table: &str,
    ) -> Result<(), CloudApiError> {
        self.check_table(table)?;
        self.grants.insert((
            consumer.namespace.clone(),
            consumer.database.clone(),
            consumer.role.clone(),
            format!("{}.{}", schema, table),
        ));
        Ok(())
    }

    async fn revoke_select(
        &self,
        consumer: &ConsumerRef,
        schema: &str,
        table: &str,
    ) -> Result<(), CloudApiError> {
        self.check_table(table)?;
        let key = (
            consumer.namespace.clone(),
            consumer.database.clone(),
            consumer.role.clone(),
            format!("{}.{}", schema, table),
        );
        match self.grants.remove(&key) {
            Some(_) => Ok(()),
            None => Err(CloudApiError::NotFound(format!(
                "grant on {}.{} for {}",
                schema, table, consumer.role
            ))),
        }
    }

    async fn list_datashare_tables(
        &self,
        datashare: &DatashareRef,
    ) -> Result<Vec<String>, CloudApiError> {
        Ok(self
            .tables
            .iter()
            .filter(|k| k.0 == datashare.producer_namespace && k.1 == datashare.datashare)
            .map(|k| k.2.clone())
            .collect())
    }

    async fn list_select_grants(
        &self,
        consumer: &ConsumerRef,
    ) -> Result<Vec<String>, CloudApiError> {
        Ok(self
            .grants
            .iter()
            .filter(|k| {
                k.0 == consumer.namespace && k.1 == consumer.database && k.2 == consumer.role
            })
            .map(|k| k.3.clone())
            .collect())
    }
}
