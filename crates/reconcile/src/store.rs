//! State store interface
//!
//! The store is the only mutable structure shared between concurrently
//! executing nodes. Every write touches exactly one record, and
//! [`StateStore::update`] performs a read-modify-write of one record
//! atomically, so branches of the graph never clobber each other's records.

use crate::error::Result;
use crate::record::ProvisionRecord;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Persistence for [`ProvisionRecord`]s across runs
pub trait StateStore: Send + Sync {
    /// Fetch one record
    fn get(&self, id: &str) -> Result<Option<ProvisionRecord>>;

    /// Insert or replace the record with `record.id`
    fn put(&self, record: ProvisionRecord) -> Result<()>;

    /// Delete one record, returning what was removed
    fn remove(&self, id: &str) -> Result<Option<ProvisionRecord>>;

    /// Every record, ordered by id
    fn list_all(&self) -> Result<Vec<ProvisionRecord>>;

    /// Atomically replace the record for `id` with `f(current)`
    ///
    /// Returning `None` from `f` removes the record. No other write to the same
    /// record can interleave with the update.
    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(Option<ProvisionRecord>) -> Option<ProvisionRecord>,
    ) -> Result<Option<ProvisionRecord>>;
}

/// In-memory store, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, ProvisionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `records`
    pub fn with_records(records: impl IntoIterator<Item = ProvisionRecord>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, ProvisionRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StateStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<ProvisionRecord>> {
        Ok(self.lock().get(id).cloned())
    }

    fn put(&self, record: ProvisionRecord) -> Result<()> {
        self.lock().insert(record.id.clone(), record);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<Option<ProvisionRecord>> {
        Ok(self.lock().remove(id))
    }

    fn list_all(&self) -> Result<Vec<ProvisionRecord>> {
        Ok(self.lock().values().cloned().collect())
    }

    fn update(
        &self,
        id: &str,
        f: &mut dyn FnMut(Option<ProvisionRecord>) -> Option<ProvisionRecord>,
    ) -> Result<Option<ProvisionRecord>> {
        let mut records = self.lock();
        let current = records.remove(id);
        let next = f(current);
        if let Some(record) = &next {
            records.insert(id.to_string(), record.clone());
        }
        Ok(next)
    }
}
