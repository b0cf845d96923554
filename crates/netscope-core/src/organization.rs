//! Organization snapshots.
//!
//! An organization only counts as observed while at least one of its
//! declared members has an active node snapshot, so organizations are
//! reconciled against the node outcome of the same cycle.

use crate::config::OrganizationConfig;
use crate::error::StoreError;
use crate::model::{
    NodeKind, ObservedOrganization, OrganizationAttributes, OrganizationId, OrganizationKind,
    PublicKey, Snapshot,
};
use crate::reconciler::{
    AbsencePolicy, ChangeDecision, Reconciler, Reconciliation, SnapshotStrategy,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};

/// Field-by-field comparison. Members compare as sets.
pub fn organization_changed(
    recorded: &OrganizationAttributes,
    candidate: &OrganizationAttributes,
) -> bool {
    recorded.name != candidate.name
        || recorded.url != candidate.url
        || recorded.description != candidate.description
        || recorded.horizon_url != candidate.horizon_url
        || recorded.contact != candidate.contact
        || recorded.members != candidate.members
}

/// Organization behaviour for the generic reconciler, bound to the set of
/// nodes that are active after node reconciliation.
#[derive(Debug, Clone)]
pub struct OrganizationStrategy {
    active_nodes: HashSet<PublicKey>,
    archive_when_absent: bool,
}

impl OrganizationStrategy {
    pub fn new(active_nodes: HashSet<PublicKey>, config: &OrganizationConfig) -> Self {
        Self {
            active_nodes,
            archive_when_absent: config.archive_when_absent,
        }
    }

    /// Declared members that currently have an active node snapshot.
    pub fn active_members<'a>(
        &self,
        members: impl IntoIterator<Item = &'a PublicKey>,
    ) -> BTreeSet<PublicKey> {
        members
            .into_iter()
            .filter(|m| self.active_nodes.contains(*m))
            .cloned()
            .collect()
    }

    fn attributes(&self, observed: &ObservedOrganization) -> OrganizationAttributes {
        OrganizationAttributes {
            name: observed.name.clone(),
            url: observed.url.clone(),
            description: observed.description.clone(),
            horizon_url: observed.horizon_url.clone(),
            contact: observed.contact.clone(),
            members: self.active_members(&observed.members),
        }
    }
}

impl SnapshotStrategy<OrganizationKind> for OrganizationStrategy {
    type Observed = ObservedOrganization;

    fn key(&self, observed: &ObservedOrganization) -> OrganizationId {
        observed.id.clone()
    }

    fn validate(&self, observed: &ObservedOrganization) -> Result<(), String> {
        if observed.id.trim().is_empty() {
            return Err("empty organization id".to_string());
        }
        Ok(())
    }

    fn is_observed(&self, observed: &ObservedOrganization) -> bool {
        observed
            .members
            .iter()
            .any(|member| self.active_nodes.contains(member))
    }

    fn build(
        &self,
        observed: &ObservedOrganization,
        _previous: Option<&Snapshot<OrganizationKind>>,
    ) -> OrganizationAttributes {
        self.attributes(observed)
    }

    fn detect(
        &self,
        active: &Snapshot<OrganizationKind>,
        observed: &ObservedOrganization,
        _time: DateTime<Utc>,
    ) -> ChangeDecision {
        if organization_changed(&active.payload, &self.attributes(observed)) {
            ChangeDecision::Changed
        } else {
            ChangeDecision::Unchanged
        }
    }

    fn absence_policy(&self) -> AbsencePolicy {
        if self.archive_when_absent {
            AbsencePolicy::ArchiveImmediately
        } else {
            AbsencePolicy::Retain
        }
    }

    fn should_archive(&self, active: &Snapshot<OrganizationKind>) -> bool {
        !active
            .payload
            .members
            .iter()
            .any(|member| self.active_nodes.contains(member))
    }
}

/// Reconciles observed organizations after the nodes of the same cycle.
pub struct OrganizationSnapshotter {
    reconciler: Reconciler<OrganizationKind>,
    config: OrganizationConfig,
}

impl OrganizationSnapshotter {
    pub fn new(reconciler: Reconciler<OrganizationKind>, config: &OrganizationConfig) -> Self {
        Self {
            reconciler,
            config: config.clone(),
        }
    }

    pub fn reconcile(
        &self,
        observed: &[ObservedOrganization],
        nodes: &Reconciliation<NodeKind>,
        time: DateTime<Utc>,
    ) -> Result<Reconciliation<OrganizationKind>, StoreError> {
        let strategy = OrganizationStrategy::new(nodes.active_keys(), &self.config);
        self.reconciler.reconcile(&strategy, observed, time)
    }
}
