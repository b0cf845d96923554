//! One reconciliation cycle: nodes, then organizations, then archival.

use crate::archiver::{ArchivalStats, Archiver};
use crate::config::SnapshotConfig;
use crate::error::{CycleError, EntityFailure, StoreError};
use crate::model::{EntityKind, NodeKind, OrganizationKind};
use crate::node::NodeSnapshotter;
use crate::organization::OrganizationSnapshotter;
use crate::reconciler::{ReconcileStats, Reconciler};
use crate::store::{
    Clock, CycleJournal, FailureReporter, ObservedNodeSource, ObservedOrganizationSource,
    SnapshotStore, Stores,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Summary of a completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub nodes: ReconcileStats,
    pub organizations: ReconcileStats,
    pub archival: ArchivalStats,
    pub active_nodes: usize,
    pub active_organizations: usize,
    pub failures: Vec<EntityFailure>,
}

pub struct SnapshotOrchestrator {
    nodes: NodeSnapshotter,
    organizations: OrganizationSnapshotter,
    archiver: Archiver,
    node_snapshots: Arc<dyn SnapshotStore<NodeKind>>,
    organization_snapshots: Arc<dyn SnapshotStore<OrganizationKind>>,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn CycleJournal>,
}

impl SnapshotOrchestrator {
    pub fn new(
        config: &SnapshotConfig,
        stores: Stores,
        clock: Arc<dyn Clock>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        let node_reconciler: Reconciler<NodeKind> = Reconciler::new(
            stores.node_snapshots.clone(),
            stores.node_identities,
            reporter.clone(),
        );
        let organization_reconciler: Reconciler<OrganizationKind> = Reconciler::new(
            stores.organization_snapshots.clone(),
            stores.organization_identities,
            reporter.clone(),
        );

        Self {
            nodes: NodeSnapshotter::new(node_reconciler, &config.node),
            organizations: OrganizationSnapshotter::new(
                organization_reconciler,
                &config.organization,
            ),
            archiver: Archiver::new(
                config,
                stores.node_snapshots.clone(),
                stores.organization_snapshots.clone(),
                stores.inactivity,
                reporter,
            ),
            node_snapshots: stores.node_snapshots,
            organization_snapshots: stores.organization_snapshots,
            clock,
            journal: stores.journal,
        }
    }

    /// Run one cycle at the clock's current time.
    ///
    /// Per-entity failures are collected into the report. A fatal store
    /// error aborts the remaining phases; everything written before it stays
    /// consistent and the next cycle picks up from there.
    pub fn run_cycle(
        &self,
        node_source: &dyn ObservedNodeSource,
        organization_source: &dyn ObservedOrganizationSource,
    ) -> Result<CycleReport, CycleError> {
        let time = self.clock.now();
        let observed_nodes = node_source.observe_nodes()?;
        let observed_organizations = organization_source.observe_organizations()?;

        let cycle = self.journal.begin_cycle(time).map_err(CycleError::Journal)?;
        tracing::info!(
            sequence = cycle.sequence,
            observed_at = %time,
            nodes = observed_nodes.len(),
            organizations = observed_organizations.len(),
            "cycle started"
        );

        let nodes = self
            .nodes
            .reconcile(&observed_nodes, time)
            .map_err(CycleError::Nodes)?;
        let organizations = self
            .organizations
            .reconcile(&observed_organizations, &nodes, time)
            .map_err(CycleError::Organizations)?;
        let archival = self.archiver.run(time).map_err(CycleError::Archival)?;
        let active_nodes =
            count_active(self.node_snapshots.as_ref()).map_err(CycleError::Report)?;
        let active_organizations =
            count_active(self.organization_snapshots.as_ref()).map_err(CycleError::Report)?;

        self.journal
            .complete_cycle(cycle.sequence)
            .map_err(CycleError::Journal)?;

        let archival_stats = archival.stats();
        let mut failures = nodes.failures;
        failures.extend(organizations.failures);
        failures.extend(archival.failures);

        let report = CycleReport {
            sequence: cycle.sequence,
            observed_at: time,
            nodes: nodes.stats,
            organizations: organizations.stats,
            archival: archival_stats,
            active_nodes,
            active_organizations,
            failures,
        };

        tracing::info!(
            sequence = report.sequence,
            active_nodes = report.active_nodes,
            active_organizations = report.active_organizations,
            failures = report.failures.len(),
            "cycle completed"
        );
        Ok(report)
    }
}

/// Identities with an active snapshot in the store.
fn count_active<K: EntityKind>(store: &dyn SnapshotStore<K>) -> Result<usize, StoreError> {
    Ok(store
        .find_active()?
        .into_iter()
        .map(|s| s.identity)
        .collect::<HashSet<_>>()
        .len())
}
