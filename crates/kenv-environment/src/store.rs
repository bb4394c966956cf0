//! Record store boundary with compare-and-swap writes

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;

use kenv_common::Error;

use crate::model::{Environment, EnvironmentFilter};

/// Durable store of Environment records keyed by id.
///
/// Every write is conditional: `expected_version` must equal the stored
/// record's version (`None` means the id must not exist yet). The store
/// bumps `version` and returns the record as written.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Record by id, including soft-deleted ones
    async fn get(&self, id: &str) -> Result<Option<Environment>, Error>;

    /// Conditional write; `Error::Conflict` on a version mismatch
    async fn put(
        &self,
        record: &Environment,
        expected_version: Option<u64>,
    ) -> Result<Environment, Error>;

    /// Records passing `filter`
    async fn scan(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>, Error>;
}

/// Process-local store for tests and single-replica deployments
#[derive(Debug, Default)]
pub struct InMemoryEnvironmentStore {
    records: RwLock<HashMap<String, Environment>>,
}

impl InMemoryEnvironmentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, soft-deleted ones included
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when the store holds nothing
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl EnvironmentStore for InMemoryEnvironmentStore {
    async fn get(&self, id: &str) -> Result<Option<Environment>, Error> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn put(
        &self,
        record: &Environment,
        expected_version: Option<u64>,
    ) -> Result<Environment, Error> {
        let mut records = self.records.write();
        let current = records.get(&record.id).map(|r| r.version);

        if current != expected_version {
            return Err(Error::conflict(
                &record.id,
                format!(
                    "expected version {}, found {}",
                    version_label(expected_version),
                    version_label(current)
                ),
            ));
        }

        let mut stored = record.clone();
        stored.version = current.map_or(1, |v| v + 1);
        records.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn scan(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>, Error> {
        let mut matched: Vec<Environment> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }
}

fn version_label(version: Option<u64>) -> String {
    version.map_or_else(|| "none".to_string(), |v| v.to_string())
}
