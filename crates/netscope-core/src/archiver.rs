//! Archival and demotion of inactive identities.
//!
//! Node lifecycle driven by inactivity:
//!
//! ```text
//! validator-active ──(inactive ≥ demote_after)──► watcher-active
//!        │                                              │
//!        └──────────(inactive ≥ archive_after)──────────┴──► archived
//! ```
//!
//! Steps run in a fixed order: archive, then demote what was not archived,
//! then archive organizations left without active members. Re-entry from
//! `archived` happens in the reconciler on rediscovery.

use crate::config::{ArchivalConfig, OrganizationConfig, SnapshotConfig};
use crate::error::{EntityFailure, Phase, StoreError};
use crate::model::{EntityKind, NodeKind, OrganizationKind, Snapshot};
use crate::organization::OrganizationStrategy;
use crate::reconciler::SnapshotStrategy;
use crate::store::{FailureReporter, InactivityQuery, SnapshotStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ArchivalOutcome {
    /// Node snapshots closed without successor.
    pub archived_nodes: Vec<Snapshot<NodeKind>>,
    /// Watcher successors opened by demotion.
    pub demoted_nodes: Vec<Snapshot<NodeKind>>,
    pub archived_organizations: Vec<Snapshot<OrganizationKind>>,
    pub failures: Vec<EntityFailure>,
}

impl ArchivalOutcome {
    pub fn stats(&self) -> ArchivalStats {
        ArchivalStats {
            archived_nodes: self.archived_nodes.len(),
            demoted_nodes: self.demoted_nodes.len(),
            archived_organizations: self.archived_organizations.len(),
            failed: self.failures.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchivalStats {
    pub archived_nodes: usize,
    pub demoted_nodes: usize,
    pub archived_organizations: usize,
    pub failed: usize,
}

pub struct Archiver {
    archival: ArchivalConfig,
    organization: OrganizationConfig,
    nodes: Arc<dyn SnapshotStore<NodeKind>>,
    organizations: Arc<dyn SnapshotStore<OrganizationKind>>,
    inactivity: Arc<dyn InactivityQuery>,
    reporter: Arc<dyn FailureReporter>,
}

impl Archiver {
    pub fn new(
        config: &SnapshotConfig,
        nodes: Arc<dyn SnapshotStore<NodeKind>>,
        organizations: Arc<dyn SnapshotStore<OrganizationKind>>,
        inactivity: Arc<dyn InactivityQuery>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            archival: config.archival.clone(),
            organization: config.organization.clone(),
            nodes,
            organizations,
            inactivity,
            reporter,
        }
    }

    pub fn run(&self, time: DateTime<Utc>) -> Result<ArchivalOutcome, StoreError> {
        let mut outcome = ArchivalOutcome::default();

        // 1. archive long-inactive nodes regardless of role
        let stale = self
            .inactivity
            .find_identities_inactive_since(time - self.archival.archive_after())?;
        for key in &stale {
            if let Some((closed, _)) = retire(
                self.nodes.as_ref(),
                key,
                time,
                Phase::Archive,
                |_| true,
                |_| None,
                &mut outcome.failures,
            )? {
                outcome.archived_nodes.push(closed);
            }
        }

        // 2. demote validators that are inactive but not yet stale
        let stale: HashSet<_> = stale.into_iter().collect();
        let idle = self
            .inactivity
            .find_identities_inactive_since(time - self.archival.demote_after())?;
        for key in idle.iter().filter(|k| !stale.contains(*k)) {
            if let Some((_, Some(successor))) = retire(
                self.nodes.as_ref(),
                key,
                time,
                Phase::Demote,
                |active| active.payload.quorum_set.is_some(),
                |active| Some(active.payload.demoted()),
                &mut outcome.failures,
            )? {
                outcome.demoted_nodes.push(successor);
            }
        }

        // 3. organizations without any active member node
        let active_nodes = self
            .nodes
            .find_active()?
            .into_iter()
            .map(|s| s.identity)
            .collect();
        let strategy = OrganizationStrategy::new(active_nodes, &self.organization);

        let mut by_key: BTreeMap<String, usize> = BTreeMap::new();
        let organizations = self.organizations.find_active()?;
        for org in &organizations {
            *by_key.entry(org.identity.clone()).or_default() += 1;
        }
        for org in organizations {
            if by_key.get(&org.identity).copied().unwrap_or(0) > 1 {
                // reported once per identity below
                continue;
            }
            if !strategy.should_archive(&org) {
                continue;
            }
            if let Some((closed, _)) = retire(
                self.organizations.as_ref(),
                &org.identity,
                time,
                Phase::Archive,
                |_| true,
                |_| None,
                &mut outcome.failures,
            )? {
                outcome.archived_organizations.push(closed);
            }
        }
        for (key, count) in by_key.into_iter().filter(|(_, count)| *count > 1) {
            outcome.failures.push(EntityFailure::integrity(
                OrganizationKind::NAME,
                key,
                Phase::Archive,
                format!("{} active snapshots", count),
            ));
        }

        for failure in &outcome.failures {
            self.reporter.report(failure);
        }

        let stats = outcome.stats();
        tracing::info!(
            archived_nodes = stats.archived_nodes,
            demoted_nodes = stats.demoted_nodes,
            archived_organizations = stats.archived_organizations,
            failed = stats.failed,
            "archival finished"
        );
        Ok(outcome)
    }
}

/// Close the active snapshot of `key` if `eligible`, optionally opening a
/// successor with the payload from `successor`. Entity-level problems are
/// pushed to `failures`.
fn retire<K, E, P>(
    store: &dyn SnapshotStore<K>,
    key: &K::Key,
    time: DateTime<Utc>,
    phase: Phase,
    eligible: E,
    successor: P,
    failures: &mut Vec<EntityFailure>,
) -> Result<Option<(Snapshot<K>, Option<Snapshot<K>>)>, StoreError>
where
    K: EntityKind,
    E: Fn(&Snapshot<K>) -> bool,
    P: Fn(&Snapshot<K>) -> Option<K::Payload>,
{
    let active = match store.find_active_for_identity(key) {
        Ok(Some(active)) => active,
        Ok(None) => return Ok(None),
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            failures.push(EntityFailure::from_store(K::NAME, key, phase, &err));
            return Ok(None);
        }
    };
    if !eligible(&active) {
        return Ok(None);
    }
    if time < active.start_time {
        failures.push(EntityFailure::integrity(
            K::NAME,
            key,
            phase,
            format!(
                "cycle time {} predates active snapshot start {}",
                time, active.start_time
            ),
        ));
        return Ok(None);
    }

    let closed = active.closed_at(time);
    let next = successor(&active).map(|payload| Snapshot::open(key.clone(), time, payload));
    let mut batch = vec![closed.clone()];
    batch.extend(next.iter().cloned());

    match store.save(&batch) {
        Ok(()) => {
            tracing::debug!(kind = K::NAME, key = %key, ?phase, "snapshot retired");
            Ok(Some((closed, next)))
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            failures.push(EntityFailure::from_store(K::NAME, key, phase, &err));
            Ok(None)
        }
    }
}
