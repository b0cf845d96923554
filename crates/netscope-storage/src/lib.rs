//! Netscope durable storage
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Database                           │
//! ├───────────────────────────────────────────────────────────┤
//! │                                                           │
//! │   save(batch) ──► check ──► WAL tx (sync) ──► TableSet    │
//! │                                                           │
//! │   open()  ◄── state.bin ◄── replay committed WAL txs      │
//! │                                                           │
//! │   checkpoint() ──► state.bin.tmp ─rename─► state.bin      │
//! │                    └──► truncate WAL                      │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write is validated against the in-memory tables first, logged as a
//! single WAL transaction, and only then applied. A crash can therefore lose
//! at most the transaction being written, never half of one.

pub mod wal;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use netscope_core::{
    ActivityLog, CycleJournal, CycleRecord, Identity, IdentityStore, InactivityQuery, NodeKind,
    OrganizationKind, PublicKey, Snapshot, SnapshotStore, StoreError, TableSet, Tabled, Violation,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use wal::{WalOp, WriteAheadLog};

pub const WAL_FILE: &str = "netscope.wal";
pub const STATE_FILE: &str = "state.bin";

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Default)]
struct DurableState {
    tables: TableSet,
    activity: ActivityLog,
    cycles: Vec<CycleRecord>,
    /// Highest transaction id reflected in `tables`.
    last_tx: u64,
}

impl DurableState {
    fn apply(&mut self, op: WalOp) {
        match op {
            WalOp::PutNodeSnapshot(snapshot) => self.tables.nodes.apply([snapshot]),
            WalOp::PutOrganizationSnapshot(snapshot) => self.tables.organizations.apply([snapshot]),
            WalOp::PutNodeIdentity(identity) => {
                self.tables
                    .node_identities
                    .insert(identity.key.clone(), identity);
            }
            WalOp::PutOrganizationIdentity(identity) => {
                self.tables
                    .organization_identities
                    .insert(identity.key.clone(), identity);
            }
            WalOp::RecordActivity { key, seen_at } => self.activity.record(&key, seen_at),
            WalOp::PutCycle(record) => {
                match self.cycles.iter().position(|c| c.sequence == record.sequence) {
                    Some(pos) => self.cycles[pos] = record,
                    None => self.cycles.push(record),
                }
            }
        }
    }
}

/// On-disk checkpoint.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    last_tx: u64,
    node_snapshots: Vec<Snapshot<NodeKind>>,
    organization_snapshots: Vec<Snapshot<OrganizationKind>>,
    node_identities: Vec<Identity<NodeKind>>,
    organization_identities: Vec<Identity<OrganizationKind>>,
    activity: ActivityLog,
    cycles: Vec<CycleRecord>,
}

impl PersistedState {
    fn capture(state: &DurableState) -> Self {
        let mut node_snapshots: Vec<_> = state.tables.nodes.rows().cloned().collect();
        node_snapshots.sort_by_key(|s| s.start_time);
        let mut organization_snapshots: Vec<_> =
            state.tables.organizations.rows().cloned().collect();
        organization_snapshots.sort_by_key(|s| s.start_time);

        Self {
            last_tx: state.last_tx,
            node_snapshots,
            organization_snapshots,
            node_identities: state.tables.node_identities.values().cloned().collect(),
            organization_identities: state
                .tables
                .organization_identities
                .values()
                .cloned()
                .collect(),
            activity: state.activity.clone(),
            cycles: state.cycles.clone(),
        }
    }

    fn restore(self) -> DurableState {
        let mut tables = TableSet::default();
        tables.nodes.apply(self.node_snapshots);
        tables.organizations.apply(self.organization_snapshots);
        tables.node_identities = self
            .node_identities
            .into_iter()
            .map(|i| (i.key.clone(), i))
            .collect();
        tables.organization_identities = self
            .organization_identities
            .into_iter()
            .map(|i| (i.key.clone(), i))
            .collect();

        DurableState {
            tables,
            activity: self.activity,
            cycles: self.cycles,
            last_tx: self.last_tx,
        }
    }
}

/// Maps an entity kind onto its WAL operations.
pub trait Durable: Tabled {
    fn put_snapshot(snapshot: Snapshot<Self>) -> WalOp;
    fn put_identity(identity: Identity<Self>) -> WalOp;
}

impl Durable for NodeKind {
    fn put_snapshot(snapshot: Snapshot<Self>) -> WalOp {
        WalOp::PutNodeSnapshot(snapshot)
    }
    fn put_identity(identity: Identity<Self>) -> WalOp {
        WalOp::PutNodeIdentity(identity)
    }
}

impl Durable for OrganizationKind {
    fn put_snapshot(snapshot: Snapshot<Self>) -> WalOp {
        WalOp::PutOrganizationSnapshot(snapshot)
    }
    fn put_identity(identity: Identity<Self>) -> WalOp {
        WalOp::PutOrganizationIdentity(identity)
    }
}

fn encoding(err: bincode::Error) -> StoreError {
    StoreError::Encoding(err.to_string())
}

// ============================================================================
// Database
// ============================================================================

/// Row counts and log size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub node_snapshots: usize,
    pub organization_snapshots: usize,
    pub node_identities: usize,
    pub organization_identities: usize,
    pub tracked_nodes: usize,
    pub cycles: usize,
    pub wal_bytes: u64,
}

/// Durable implementation of every store trait.
pub struct Database {
    dir: PathBuf,
    wal: WriteAheadLog,
    state: RwLock<DurableState>,
    next_tx: AtomicU64,
}

impl Database {
    /// Open (or create) a database directory and recover its state.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let state_path = dir.join(STATE_FILE);
        let mut state = if state_path.exists() {
            let bytes = std::fs::read(&state_path)?;
            bincode::deserialize::<PersistedState>(&bytes)
                .map_err(encoding)?
                .restore()
        } else {
            DurableState::default()
        };

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE))?;
        let mut replayed = 0usize;
        for tx in wal.committed()? {
            // already part of the checkpoint
            if tx.tx_id <= state.last_tx {
                continue;
            }
            for op in tx.ops {
                state.apply(op);
            }
            state.last_tx = tx.tx_id;
            replayed += 1;
        }

        tracing::info!(
            path = %dir.display(),
            node_snapshots = state.tables.nodes.len(),
            organization_snapshots = state.tables.organizations.len(),
            replayed,
            "database opened"
        );

        let next_tx = state.last_tx + 1;
        Ok(Self {
            dir,
            wal,
            state: RwLock::new(state),
            next_tx: AtomicU64::new(next_tx),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Log `ops` as one transaction, then apply them. Caller holds the
    /// write lock, so log order matches apply order.
    fn commit(&self, state: &mut DurableState, ops: Vec<WalOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let tx_id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        self.wal.append_tx(tx_id, ops.clone())?;
        for op in ops {
            state.apply(op);
        }
        state.last_tx = tx_id;
        Ok(())
    }

    /// Record the nodes observed active at `seen_at`.
    pub fn record_activity<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a PublicKey>,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ops = keys
            .into_iter()
            .map(|key| WalOp::RecordActivity {
                key: key.clone(),
                seen_at,
            })
            .collect();
        let mut state = self.state.write();
        self.commit(&mut state, ops)
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

    pub fn stats(&self) -> Result<DatabaseStats, StoreError> {
        let state = self.state.read();
        Ok(DatabaseStats {
            node_snapshots: state.tables.nodes.len(),
            organization_snapshots: state.tables.organizations.len(),
            node_identities: state.tables.node_identities.len(),
            organization_identities: state.tables.organization_identities.len(),
            tracked_nodes: state.activity.len(),
            cycles: state.cycles.len(),
            wal_bytes: self.wal.len()?,
        })
    }

    /// Write the full state atomically and truncate the WAL.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        // readers may continue, writers wait
        let state = self.state.read();
        let bytes = bincode::serialize(&PersistedState::capture(&state)).map_err(encoding)?;

        let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        self.wal.truncate()?;

        tracing::info!(
            path = %self.dir.display(),
            last_tx = state.last_tx,
            bytes = bytes.len(),
            "checkpoint written"
        );
        Ok(())
    }
}

// ============================================================================
// Store traits
// ============================================================================

impl<K: Durable> SnapshotStore<K> for Database {
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
        let table = K::table(&state.tables);
        table.check(batch)?;

        // identical re-saves are not logged again
        let ops = batch
            .iter()
            .filter(|row| table.get(&row.id) != Some(*row))
            .cloned()
            .map(K::put_snapshot)
            .collect();
        self.commit(&mut state, ops)
    }
}

impl<K: Durable> IdentityStore<K> for Database {
    fn find_or_create(
        &self,
        key: &K::Key,
        first_observed_at: DateTime<Utc>,
    ) -> Result<Identity<K>, StoreError> {
        let mut state = self.state.write();
        if let Some(existing) = K::identities(&state.tables).get(key) {
            return Ok(existing.clone());
        }
        let identity = Identity {
            key: key.clone(),
            first_observed_at,
        };
        self.commit(&mut state, vec![K::put_identity(identity.clone())])?;
        Ok(identity)
    }

    fn find(&self, key: &K::Key) -> Result<Option<Identity<K>>, StoreError> {
        Ok(K::identities(&self.state.read().tables).get(key).cloned())
    }
}

impl InactivityQuery for Database {
    fn find_identities_inactive_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<PublicKey>, StoreError> {
        Ok(self.state.read().activity.inactive_since(threshold))
    }
}

impl CycleJournal for Database {
    fn begin_cycle(&self, observed_at: DateTime<Utc>) -> Result<CycleRecord, StoreError> {
        let mut state = self.state.write();
        let record = CycleRecord {
            sequence: state.cycles.iter().map(|c| c.sequence).max().unwrap_or(0) + 1,
            observed_at,
            completed: false,
        };
        self.commit(&mut state, vec![WalOp::PutCycle(record.clone())])?;
        Ok(record)
    }

    fn complete_cycle(&self, sequence: u64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let record = state
            .cycles
            .iter()
            .find(|c| c.sequence == sequence)
            .map(|c| CycleRecord {
                completed: true,
                ..c.clone()
            });
        match record {
            Some(record) => self.commit(&mut state, vec![WalOp::PutCycle(record)]),
            None => {
                tracing::warn!(sequence, "completing a cycle that was never started");
                Ok(())
            }
        }
    }

    fn latest_cycle(&self) -> Result<Option<CycleRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .cycles
            .iter()
            .max_by_key(|c| c.sequence)
            .cloned())
    }
}
