//! In-memory versioned snapshot table.
//!
//! Holds every snapshot of one entity kind, indexed per identity in start
//! order. All writes go through [`SnapshotTable::check`] first, which enforces
//! append-only history, a non-overlapping timeline and at most one
//! active snapshot per identity. Both the in-memory store and the durable
//! store keep their state in these tables.

use crate::error::StoreError;
use crate::model::{EntityKind, Identity, NodeKind, OrganizationKind, Snapshot, SnapshotId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct SnapshotTable<K: EntityKind> {
    rows: HashMap<SnapshotId, Snapshot<K>>,
    timelines: BTreeMap<K::Key, Vec<SnapshotId>>,
}

impl<K: EntityKind> Default for SnapshotTable<K> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            timelines: BTreeMap::new(),
        }
    }
}

impl<K: EntityKind> SnapshotTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &SnapshotId) -> Option<&Snapshot<K>> {
        self.rows.get(id)
    }

    /// Snapshots of one identity in start order.
    pub fn timeline(&self, key: &K::Key) -> Vec<&Snapshot<K>> {
        self.timelines
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.rows.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K::Key> {
        self.timelines.keys()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Snapshot<K>> {
        self.rows.values()
    }

    pub fn active(&self) -> Vec<Snapshot<K>> {
        self.rows.values().filter(|s| s.is_active()).cloned().collect()
    }

    pub fn active_for(&self, key: &K::Key) -> Result<Option<Snapshot<K>>, StoreError> {
        let active: Vec<&Snapshot<K>> = self
            .timeline(key)
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        match active.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some((*only).clone())),
            many => Err(StoreError::ActiveConflict {
                kind: K::NAME,
                key: key.to_string(),
                count: many.len(),
            }),
        }
    }

    pub fn latest_archived(&self, key: &K::Key) -> Option<Snapshot<K>> {
        self.timeline(key)
            .into_iter()
            .filter(|s| !s.is_active())
            .max_by_key(|s| (s.end_time, s.start_time))
            .cloned()
    }

    pub fn active_at(&self, time: DateTime<Utc>) -> Vec<Snapshot<K>> {
        self.rows.values().filter(|s| s.covers(time)).cloned().collect()
    }

    pub fn between(
        &self,
        key: &K::Key,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Snapshot<K>> {
        self.timeline(key)
            .into_iter()
            .filter(|s| s.overlaps(from, to))
            .cloned()
            .collect()
    }

    /// Validate a batch against the current contents without applying it.
    pub fn check(&self, batch: &[Snapshot<K>]) -> Result<(), StoreError> {
        let mut touched: BTreeMap<&K::Key, Vec<&Snapshot<K>>> = BTreeMap::new();

        for row in batch {
            if row.end_time < row.start_time {
                return Err(StoreError::InvalidInterval { id: row.id });
            }
            if let Some(existing) = self.rows.get(&row.id) {
                if existing == row {
                    continue;
                }
                let only_closing = existing.is_active()
                    && !row.is_active()
                    && existing.identity == row.identity
                    && existing.start_time == row.start_time
                    && existing.payload == row.payload;
                if !only_closing {
                    return Err(StoreError::AppendOnly { id: row.id });
                }
            }
            touched.entry(&row.identity).or_default().push(row);
        }

        for (key, rows) in touched {
            let mut timeline: Vec<(SnapshotId, DateTime<Utc>, DateTime<Utc>)> = self
                .timeline(key)
                .into_iter()
                .map(|s| (s.id, s.start_time, s.end_time))
                .collect();
            for row in rows {
                match timeline.iter_mut().find(|(id, _, _)| *id == row.id) {
                    Some(slot) => *slot = (row.id, row.start_time, row.end_time),
                    None => timeline.push((row.id, row.start_time, row.end_time)),
                }
            }

            let active = timeline
                .iter()
                .filter(|(_, _, end)| *end == crate::model::max_sentinel())
                .count();
            if active > 1 {
                return Err(StoreError::ActiveConflict {
                    kind: K::NAME,
                    key: key.to_string(),
                    count: active,
                });
            }

            timeline.sort_by_key(|(_, start, end)| (*start, *end));
            let overlapping = timeline
                .windows(2)
                .any(|pair| pair[1].1 < pair[0].2);
            if overlapping {
                return Err(StoreError::Overlap {
                    kind: K::NAME,
                    key: key.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Apply rows without validation. Callers check first.
    pub fn apply(&mut self, batch: impl IntoIterator<Item = Snapshot<K>>) {
        for row in batch {
            let key = row.identity.clone();
            let id = row.id;
            let start = row.start_time;
            let is_new = self.rows.insert(id, row).is_none();
            if is_new {
                let timeline = self.timelines.entry(key).or_default();
                let position = timeline
                    .iter()
                    .position(|other| {
                        self.rows
                            .get(other)
                            .map_or(false, |s| s.start_time > start)
                    })
                    .unwrap_or(timeline.len());
                timeline.insert(position, id);
            }
        }
    }

    /// Check and apply in one step.
    pub fn save(&mut self, batch: &[Snapshot<K>]) -> Result<(), StoreError> {
        self.check(batch)?;
        self.apply(batch.iter().cloned());
        Ok(())
    }

    /// Walk every timeline and report invariant violations.
    pub fn verify(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        for key in self.timelines.keys() {
            let timeline = self.timeline(key);
            let active = timeline.iter().filter(|s| s.is_active()).count();
            if active > 1 {
                violations.push(Violation::new::<K>(
                    key,
                    format!("{} active snapshots", active),
                ));
            }
            for snapshot in &timeline {
                if snapshot.end_time < snapshot.start_time {
                    violations.push(Violation::new::<K>(
                        key,
                        format!("snapshot {} ends before it starts", snapshot.id),
                    ));
                }
            }
            for pair in timeline.windows(2) {
                if pair[1].start_time < pair[0].end_time {
                    violations.push(Violation::new::<K>(
                        key,
                        format!("snapshots {} and {} overlap", pair[0].id, pair[1].id),
                    ));
                }
            }
        }
        violations
    }
}

/// A broken history invariant found by [`SnapshotTable::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: &'static str,
    pub key: String,
    pub problem: String,
}

impl Violation {
    fn new<K: EntityKind>(key: &K::Key, problem: String) -> Self {
        Self {
            kind: K::NAME,
            key: key.to_string(),
            problem,
        }
    }
}

// ============================================================================
// Table set
// ============================================================================

/// Snapshot tables and identity registries for every entity kind.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    pub nodes: SnapshotTable<NodeKind>,
    pub organizations: SnapshotTable<OrganizationKind>,
    pub node_identities: BTreeMap<String, Identity<NodeKind>>,
    pub organization_identities: BTreeMap<String, Identity<OrganizationKind>>,
}

impl TableSet {
    pub fn verify(&self) -> Vec<Violation> {
        let mut violations = self.nodes.verify();
        violations.extend(self.organizations.verify());
        violations
    }
}

/// Selects the table and identity registry of an entity kind.
pub trait Tabled: EntityKind<Key = String> {
    fn table(set: &TableSet) -> &SnapshotTable<Self>;
    fn table_mut(set: &mut TableSet) -> &mut SnapshotTable<Self>;
    fn identities(set: &TableSet) -> &BTreeMap<String, Identity<Self>>;
    fn identities_mut(set: &mut TableSet) -> &mut BTreeMap<String, Identity<Self>>;

    /// Reject rows whose identity has not been created.
    fn check_identities(set: &TableSet, batch: &[Snapshot<Self>]) -> Result<(), StoreError> {
        let identities = Self::identities(set);
        match batch.iter().find(|row| !identities.contains_key(&row.identity)) {
            Some(row) => Err(StoreError::MissingIdentity {
                kind: Self::NAME,
                key: row.identity.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Tabled for NodeKind {
    fn table(set: &TableSet) -> &SnapshotTable<Self> {
        &set.nodes
    }
    fn table_mut(set: &mut TableSet) -> &mut SnapshotTable<Self> {
        &mut set.nodes
    }
    fn identities(set: &TableSet) -> &BTreeMap<String, Identity<Self>> {
        &set.node_identities
    }
    fn identities_mut(set: &mut TableSet) -> &mut BTreeMap<String, Identity<Self>> {
        &mut set.node_identities
    }
}

impl Tabled for OrganizationKind {
    fn table(set: &TableSet) -> &SnapshotTable<Self> {
        &set.organizations
    }
    fn table_mut(set: &mut TableSet) -> &mut SnapshotTable<Self> {
        &mut set.organizations
    }
    fn identities(set: &TableSet) -> &BTreeMap<String, Identity<Self>> {
        &set.organization_identities
    }
    fn identities_mut(set: &mut TableSet) -> &mut BTreeMap<String, Identity<Self>> {
        &mut set.organization_identities
    }
}
