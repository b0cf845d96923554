//! Generic snapshot reconciliation (type-2 slowly changing dimension).
//!
//! ```text
//! active snapshots ──┬── observed? ── changed? ──► close + open successor
//!                    │              └─ same ─────► keep
//!                    └── absent ─── policy ──────► keep | archive
//!
//! observed, no active ── archived history? ──► successor of latest archived
//!                      └─ never seen ────────► new identity + first snapshot
//! ```
//!
//! Entity kinds plug in through [`SnapshotStrategy`]. Planning is pure and
//! runs in parallel; each identity's writes are then applied as one atomic
//! store batch. A failure for one identity is recorded and the batch goes on.
//! Only fatal store errors abort the reconciliation.

use crate::error::{EntityFailure, Phase, StoreError};
use crate::model::{EntityKind, Snapshot};
use crate::store::{FailureReporter, IdentityStore, SnapshotStore};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// Strategy
// ============================================================================

/// Outcome of comparing an active snapshot with a fresh observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    Unchanged,
    Changed,
    /// A change was detected but must not be versioned.
    Suppressed { reason: String },
}

/// What happens to an active snapshot whose identity is not observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsencePolicy {
    /// Keep it active; the archiver decides when to retire it.
    Retain,
    /// Close it in the same cycle.
    ArchiveImmediately,
}

/// Per-kind behaviour plugged into the generic reconciler.
pub trait SnapshotStrategy<K: EntityKind>: Sync {
    type Observed: Sync;

    /// Natural key of an observation.
    fn key(&self, observed: &Self::Observed) -> K::Key;

    /// Reject malformed observations.
    fn validate(&self, _observed: &Self::Observed) -> Result<(), String> {
        Ok(())
    }

    /// Whether the observation counts as observed for this cycle.
    fn is_observed(&self, _observed: &Self::Observed) -> bool {
        true
    }

    /// Payload of the next version. `previous` is the snapshot being
    /// superseded, or the latest archived one on rediscovery.
    fn build(&self, observed: &Self::Observed, previous: Option<&Snapshot<K>>) -> K::Payload;

    /// Change predicate.
    fn detect(
        &self,
        active: &Snapshot<K>,
        observed: &Self::Observed,
        time: DateTime<Utc>,
    ) -> ChangeDecision;

    fn absence_policy(&self) -> AbsencePolicy {
        AbsencePolicy::Retain
    }

    /// Whether an active snapshot should be retired by the archiver.
    fn should_archive(&self, _active: &Snapshot<K>) -> bool {
        false
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Result of reconciling one entity kind.
#[derive(Debug, Clone)]
pub struct Reconciliation<K: EntityKind> {
    /// Active snapshots after the run.
    pub active: Vec<Snapshot<K>>,
    /// Successor and first versions opened during the run.
    pub opened: Vec<Snapshot<K>>,
    /// Predecessors closed because a successor replaced them.
    pub superseded: Vec<Snapshot<K>>,
    /// Snapshots closed with no successor.
    pub archived: Vec<Snapshot<K>>,
    /// Active snapshots of identities skipped after an integrity failure.
    /// They stay active in the store, untouched.
    pub skipped: Vec<Snapshot<K>>,
    pub stats: ReconcileStats,
    pub failures: Vec<EntityFailure>,
}

impl<K: EntityKind> Reconciliation<K> {
    fn empty() -> Self {
        Self {
            active: Vec::new(),
            opened: Vec::new(),
            superseded: Vec::new(),
            archived: Vec::new(),
            skipped: Vec::new(),
            stats: ReconcileStats::default(),
            failures: Vec::new(),
        }
    }

    /// Keys with an active snapshot in the store after the run, skipped
    /// identities included.
    pub fn active_keys(&self) -> HashSet<K::Key> {
        self.active
            .iter()
            .chain(&self.skipped)
            .map(|s| s.identity.clone())
            .collect()
    }

    pub fn active_for(&self, key: &K::Key) -> Option<&Snapshot<K>> {
        self.active.iter().find(|s| &s.identity == key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub observed: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub created: usize,
    pub rediscovered: usize,
    pub suppressed: usize,
    pub retained_absent: usize,
    pub archived: usize,
    pub failed: usize,
}

// ============================================================================
// Planning
// ============================================================================

#[derive(Debug)]
enum Plan<K: EntityKind> {
    Keep(Snapshot<K>),
    Suppress(Snapshot<K>, String),
    RetainAbsent(Snapshot<K>),
    Supersede {
        closed: Snapshot<K>,
        successor: Snapshot<K>,
    },
    Archive(Snapshot<K>),
    Rediscover {
        archived_id: crate::model::SnapshotId,
        successor: Snapshot<K>,
    },
    Create(Snapshot<K>),
    /// Leave the active snapshot untouched.
    Skip(Snapshot<K>, EntityFailure),
    Fail(EntityFailure),
}

// ============================================================================
// Reconciler
// ============================================================================

/// Generic reconciler for one entity kind.
pub struct Reconciler<K: EntityKind> {
    snapshots: Arc<dyn SnapshotStore<K>>,
    identities: Arc<dyn IdentityStore<K>>,
    reporter: Arc<dyn FailureReporter>,
}

impl<K: EntityKind> Reconciler<K> {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore<K>>,
        identities: Arc<dyn IdentityStore<K>>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            snapshots,
            identities,
            reporter,
        }
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore<K>> {
        &self.snapshots
    }

    /// Reconcile `observed` against the active snapshots at `time`.
    pub fn reconcile<S>(
        &self,
        strategy: &S,
        observed: &[S::Observed],
        time: DateTime<Utc>,
    ) -> Result<Reconciliation<K>, StoreError>
    where
        S: SnapshotStrategy<K>,
    {
        let mut outcome = Reconciliation::empty();

        // Active snapshots grouped per identity. Identities with more than
        // one are skipped entirely.
        let mut active_by_key: HashMap<K::Key, Vec<Snapshot<K>>> = HashMap::new();
        for snapshot in self.snapshots.find_active()? {
            active_by_key
                .entry(snapshot.identity.clone())
                .or_default()
                .push(snapshot);
        }
        let mut blocked: HashSet<K::Key> = HashSet::new();
        let mut skipped: Vec<Snapshot<K>> = Vec::new();
        active_by_key.retain(|key, snapshots| {
            if snapshots.len() > 1 {
                tracing::error!(
                    kind = K::NAME,
                    key = %key,
                    count = snapshots.len(),
                    integrity = true,
                    "multiple active snapshots, skipping identity"
                );
                outcome.failures.push(EntityFailure::integrity(
                    K::NAME,
                    key,
                    Phase::Reconcile,
                    format!("{} active snapshots", snapshots.len()),
                ));
                blocked.insert(key.clone());
                skipped.append(snapshots);
                false
            } else {
                true
            }
        });
        let active: HashMap<K::Key, Snapshot<K>> = active_by_key
            .into_iter()
            .filter_map(|(key, mut snapshots)| snapshots.pop().map(|s| (key, s)))
            .collect();
        outcome.skipped = skipped;

        let observed_by_key = self.index_observed(strategy, observed, &blocked, &mut outcome);
        outcome.stats.observed = observed_by_key.len();

        // Existing identities: pure decisions, computed in parallel.
        let mut plans: Vec<Plan<K>> = active
            .par_iter()
            .map(|(key, snapshot)| match observed_by_key.get(key) {
                Some(entity) => plan_observed(strategy, snapshot, *entity, time),
                None => plan_absent(strategy, snapshot, time),
            })
            .collect();

        // New or rediscovered identities need a history lookup each.
        let new_plans: Vec<Result<Plan<K>, StoreError>> = observed_by_key
            .par_iter()
            .filter(|(key, _)| !active.contains_key(*key))
            .map(|(key, entity)| self.plan_new(strategy, key, *entity, time))
            .collect();
        for plan in new_plans {
            plans.push(plan?);
        }

        for plan in plans {
            self.apply(plan, time, &mut outcome)?;
        }

        outcome.active.sort_by(|a, b| a.identity.cmp(&b.identity));
        outcome
            .skipped
            .sort_by(|a, b| a.identity.cmp(&b.identity).then(a.start_time.cmp(&b.start_time)));
        for failure in &outcome.failures {
            self.reporter.report(failure);
        }
        outcome.stats.failed = outcome.failures.len();

        tracing::info!(
            kind = K::NAME,
            observed = outcome.stats.observed,
            unchanged = outcome.stats.unchanged,
            updated = outcome.stats.updated,
            created = outcome.stats.created,
            rediscovered = outcome.stats.rediscovered,
            suppressed = outcome.stats.suppressed,
            archived = outcome.stats.archived,
            failed = outcome.stats.failed,
            "reconciliation finished"
        );

        Ok(outcome)
    }

    /// Validate observations and index them by key. Invalid, duplicated and
    /// blocked keys are left out.
    fn index_observed<'o, S>(
        &self,
        strategy: &S,
        observed: &'o [S::Observed],
        blocked: &HashSet<K::Key>,
        outcome: &mut Reconciliation<K>,
    ) -> HashMap<K::Key, &'o S::Observed>
    where
        S: SnapshotStrategy<K>,
    {
        let mut by_key: HashMap<K::Key, &'o S::Observed> = HashMap::new();
        let mut duplicates: HashSet<K::Key> = HashSet::new();

        for entity in observed {
            let key = strategy.key(entity);
            if let Err(reason) = strategy.validate(entity) {
                outcome.failures.push(EntityFailure::processing(
                    K::NAME,
                    &key,
                    Phase::Reconcile,
                    format!("malformed observation: {}", reason),
                ));
                continue;
            }
            if by_key.insert(key.clone(), entity).is_some() {
                duplicates.insert(key);
            }
        }

        for key in duplicates {
            by_key.remove(&key);
            outcome.failures.push(EntityFailure::processing(
                K::NAME,
                &key,
                Phase::Reconcile,
                "observed more than once in the same cycle",
            ));
        }

        by_key.retain(|key, entity| {
            if blocked.contains(key) {
                return false;
            }
            if !strategy.is_observed(*entity) {
                tracing::debug!(kind = K::NAME, key = %key, "reported but not counted as observed");
                return false;
            }
            true
        });
        by_key
    }

    fn plan_new<S>(
        &self,
        strategy: &S,
        key: &K::Key,
        entity: &S::Observed,
        time: DateTime<Utc>,
    ) -> Result<Plan<K>, StoreError>
    where
        S: SnapshotStrategy<K>,
    {
        let archived = match self.snapshots.find_latest_archived_for_identity(key) {
            Ok(archived) => archived,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                return Ok(Plan::Fail(EntityFailure::from_store(
                    K::NAME,
                    key,
                    Phase::Reconcile,
                    &err,
                )))
            }
        };

        Ok(match archived {
            Some(archived) if archived.end_time > time => Plan::Fail(EntityFailure::integrity(
                K::NAME,
                key,
                Phase::Reconcile,
                format!(
                    "observation at {} predates archival at {}",
                    time, archived.end_time
                ),
            )),
            Some(archived) => Plan::Rediscover {
                archived_id: archived.id,
                successor: Snapshot::open(
                    key.clone(),
                    time,
                    strategy.build(entity, Some(&archived)),
                ),
            },
            None => Plan::Create(Snapshot::open(key.clone(), time, strategy.build(entity, None))),
        })
    }

    fn apply(
        &self,
        plan: Plan<K>,
        time: DateTime<Utc>,
        outcome: &mut Reconciliation<K>,
    ) -> Result<(), StoreError> {
        match plan {
            Plan::Keep(snapshot) => {
                outcome.stats.unchanged += 1;
                outcome.active.push(snapshot);
            }
            Plan::Suppress(snapshot, reason) => {
                tracing::debug!(kind = K::NAME, key = %snapshot.identity, %reason, "change suppressed");
                outcome.stats.suppressed += 1;
                outcome.active.push(snapshot);
            }
            Plan::RetainAbsent(snapshot) => {
                outcome.stats.retained_absent += 1;
                outcome.active.push(snapshot);
            }
            Plan::Supersede { closed, successor } => {
                let batch = [closed, successor];
                match self.write(&batch)? {
                    Ok(()) => {
                        let [closed, successor] = batch;
                        tracing::debug!(kind = K::NAME, key = %successor.identity, "new version");
                        outcome.stats.updated += 1;
                        outcome.superseded.push(closed);
                        outcome.opened.push(successor.clone());
                        outcome.active.push(successor);
                    }
                    Err(err) => {
                        let [closed, _] = batch;
                        outcome.failures.push(EntityFailure::from_store(
                            K::NAME,
                            &closed.identity,
                            Phase::Reconcile,
                            &err,
                        ));
                        // The predecessor stays as the active version.
                        outcome.active.push(Snapshot {
                            end_time: crate::model::max_sentinel(),
                            ..closed
                        });
                    }
                }
            }
            Plan::Archive(closed) => match self.write(std::slice::from_ref(&closed))? {
                Ok(()) => {
                    tracing::debug!(kind = K::NAME, key = %closed.identity, "archived while absent");
                    outcome.stats.archived += 1;
                    outcome.archived.push(closed);
                }
                Err(err) => {
                    outcome.failures.push(EntityFailure::from_store(
                        K::NAME,
                        &closed.identity,
                        Phase::Reconcile,
                        &err,
                    ));
                    outcome.active.push(Snapshot {
                        end_time: crate::model::max_sentinel(),
                        ..closed
                    });
                }
            },
            Plan::Rediscover {
                archived_id,
                successor,
            } => match self.write(std::slice::from_ref(&successor))? {
                Ok(()) => {
                    tracing::info!(
                        kind = K::NAME,
                        key = %successor.identity,
                        previous = %archived_id,
                        "rediscovered archived identity"
                    );
                    outcome.stats.rediscovered += 1;
                    outcome.opened.push(successor.clone());
                    outcome.active.push(successor);
                }
                Err(err) => outcome.failures.push(EntityFailure::from_store(
                    K::NAME,
                    &successor.identity,
                    Phase::Reconcile,
                    &err,
                )),
            },
            Plan::Create(first) => {
                let identity = match self.identities.find_or_create(&first.identity, time) {
                    Ok(identity) => identity,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        outcome.failures.push(EntityFailure::from_store(
                            K::NAME,
                            &first.identity,
                            Phase::Reconcile,
                            &err,
                        ));
                        return Ok(());
                    }
                };
                match self.write(std::slice::from_ref(&first))? {
                    Ok(()) => {
                        tracing::debug!(
                            kind = K::NAME,
                            key = %identity.key,
                            first_observed_at = %identity.first_observed_at,
                            "new identity"
                        );
                        outcome.stats.created += 1;
                        outcome.opened.push(first.clone());
                        outcome.active.push(first);
                    }
                    Err(err) => outcome.failures.push(EntityFailure::from_store(
                        K::NAME,
                        &first.identity,
                        Phase::Reconcile,
                        &err,
                    )),
                }
            }
            Plan::Skip(snapshot, failure) => {
                outcome.failures.push(failure);
                outcome.skipped.push(snapshot);
            }
            Plan::Fail(failure) => outcome.failures.push(failure),
        }
        Ok(())
    }

    /// Save a batch. The outer error is fatal, the inner one entity-level.
    fn write(&self, batch: &[Snapshot<K>]) -> Result<Result<(), StoreError>, StoreError> {
        match self.snapshots.save(batch) {
            Ok(()) => Ok(Ok(())),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(Err(err)),
        }
    }
}

fn plan_observed<K, S>(
    strategy: &S,
    active: &Snapshot<K>,
    entity: &S::Observed,
    time: DateTime<Utc>,
) -> Plan<K>
where
    K: EntityKind,
    S: SnapshotStrategy<K>,
{
    if time < active.start_time {
        return Plan::Skip(
            active.clone(),
            EntityFailure::integrity(
                K::NAME,
                &active.identity,
                Phase::Reconcile,
                format!(
                    "observation at {} predates active snapshot start {}",
                    time, active.start_time
                ),
            ),
        );
    }
    match strategy.detect(active, entity, time) {
        ChangeDecision::Unchanged => Plan::Keep(active.clone()),
        ChangeDecision::Suppressed { reason } => Plan::Suppress(active.clone(), reason),
        ChangeDecision::Changed => Plan::Supersede {
            closed: active.closed_at(time),
            successor: Snapshot::open(
                active.identity.clone(),
                time,
                strategy.build(entity, Some(active)),
            ),
        },
    }
}

fn plan_absent<K, S>(strategy: &S, active: &Snapshot<K>, time: DateTime<Utc>) -> Plan<K>
where
    K: EntityKind,
    S: SnapshotStrategy<K>,
{
    match strategy.absence_policy() {
        AbsencePolicy::Retain => Plan::RetainAbsent(active.clone()),
        AbsencePolicy::ArchiveImmediately if time < active.start_time => {
            Plan::RetainAbsent(active.clone())
        }
        AbsencePolicy::ArchiveImmediately => Plan::Archive(active.closed_at(time)),
    }
}
