//! Non-durable store backed by [`TableSet`].
//!
//! Implements every collaborator trait; used for dry runs and tests.

use crate::activity::ActivityLog;
use crate::error::StoreError;
use crate::model::{Identity, PublicKey, Snapshot};
use crate::store::{CycleJournal, CycleRecord, IdentityStore, InactivityQuery, SnapshotStore};
use crate::table::{TableSet, Tabled, Violation};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    tables: TableSet,
    activity: ActivityLog,
    cycles: Vec<CycleRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the nodes observed active at `seen_at`.
    pub fn record_activity<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a PublicKey>,
        seen_at: DateTime<Utc>,
    ) {
        let mut state = self.state.write();
        for key in keys {
            state.activity.record(key, seen_at);
        }
    }

    pub fn verify(&self) -> Vec<Violation> {
        self.state.read().tables.verify()
    }

    /// Every snapshot of one identity in start order.
    pub fn history<K: Tabled>(&self, key: &str) -> Vec<Snapshot<K>> {
        let state = self.state.read();
        K::table(&state.tables)
            .timeline(&key.to_string())
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn snapshot_count<K: Tabled>(&self) -> usize {
        K::table(&self.state.read().tables).len()
    }

    /// Insert rows without any validation.
    #[doc(hidden)]
    pub fn insert_unchecked<K: Tabled>(&self, rows: Vec<Snapshot<K>>) {
        K::table_mut(&mut self.state.write().tables).apply(rows);
    }
}

impl<K: Tabled> SnapshotStore<K> for MemoryStore {
    fn find_active(&self) -> Result<Vec<Snapshot<K>>, StoreError> {
        Ok(K::table(&self.state.read().tables).active())
    }

    fn find_active_for_identity(&self, key: &K::Key) -> Result<Option<Snapshot<K>>, StoreError> {
        K::table(&self.state.read().tables).active_for(key)
    }

    fn find_latest_archived_for_identity(
        &self,
        key: &K::Key,
    ) -> Result<Option<Snapshot<K>>, StoreError> {
        Ok(K::table(&self.state.read().tables).latest_archived(key))
    }

    fn find_active_at(&self, time: DateTime<Utc>) -> Result<Vec<Snapshot<K>>, StoreError> {
        Ok(K::table(&self.state.read().tables).active_at(time))
    }

    fn find_for_identity_between(
        &self,
        key: &K::Key,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot<K>>, StoreError> {
        Ok(K::table(&self.state.read().tables).between(key, from, to))
    }

    fn save(&self, batch: &[Snapshot<K>]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        K::check_identities(&state.tables, batch)?;
        K::table_mut(&mut state.tables).save(batch)
    }
}

impl<K: Tabled> IdentityStore<K> for MemoryStore {
    fn find_or_create(
        &self,
        key: &K::Key,
        first_observed_at: DateTime<Utc>,
    ) -> Result<Identity<K>, StoreError> {
        let mut state = self.state.write();
        let identity = K::identities_mut(&mut state.tables)
            .entry(key.clone())
            .or_insert_with(|| Identity {
                key: key.clone(),
                first_observed_at,
            });
        Ok(identity.clone())
    }

    fn find(&self, key: &K::Key) -> Result<Option<Identity<K>>, StoreError> {
        Ok(K::identities(&self.state.read().tables).get(key).cloned())
    }
}

impl InactivityQuery for MemoryStore {
    fn find_identities_inactive_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<PublicKey>, StoreError> {
        Ok(self.state.read().activity.inactive_since(threshold))
    }
}

impl CycleJournal for MemoryStore {
    fn begin_cycle(&self, observed_at: DateTime<Utc>) -> Result<CycleRecord, StoreError> {
        let mut state = self.state.write();
        let record = CycleRecord {
            sequence: state.cycles.len() as u64 + 1,
            observed_at,
            completed: false,
        };
        state.cycles.push(record.clone());
        Ok(record)
    }

    fn complete_cycle(&self, sequence: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(record) = state.cycles.iter_mut().find(|c| c.sequence == sequence) {
            record.completed = true;
        }
        Ok(())
    }

    fn latest_cycle(&self) -> Result<Option<CycleRecord>, StoreError> {
        Ok(self.state.read().cycles.last().cloned())
    }
}
