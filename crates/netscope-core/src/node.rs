//! Node snapshots: change detection and IP-flap damping.

use crate::config::NodeConfig;
use crate::error::StoreError;
use crate::model::{NodeAttributes, NodeKind, ObservedNode, PublicKey, Snapshot};
use crate::reconciler::{ChangeDecision, Reconciler, Reconciliation, SnapshotStrategy};
use chrono::{DateTime, Duration, Utc};

/// Which parts of a node differ between its snapshot and an observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeChanges {
    pub quorum_set: bool,
    pub address: bool,
    /// Descriptive details or the resolved organization.
    pub details: bool,
    pub geo: bool,
}

impl NodeChanges {
    pub fn any(&self) -> bool {
        self.quorum_set || self.address || self.details || self.geo
    }

    /// Only ip and/or port changed.
    pub fn address_only(&self) -> bool {
        self.address && !(self.quorum_set || self.details || self.geo)
    }
}

pub fn node_changes(recorded: &NodeAttributes, observed: &ObservedNode) -> NodeChanges {
    let observed_hash = observed.quorum_set.as_ref().map(|qs| qs.hash());
    let geo = match (&recorded.geo, &observed.geo) {
        (Some(a), Some(b)) => a.latitude != b.latitude || a.longitude != b.longitude,
        (None, None) => false,
        (Some(g), None) | (None, Some(g)) => g.latitude.is_some() || g.longitude.is_some(),
    };

    NodeChanges {
        quorum_set: recorded.quorum_set_hash != observed_hash,
        address: recorded.ip != observed.ip || recorded.port != observed.port,
        details: recorded.details != observed.details
            || recorded.organization != observed.organization_id,
        geo,
    }
}

pub fn has_node_changed(recorded: &NodeAttributes, observed: &ObservedNode) -> bool {
    node_changes(recorded, observed).any()
}

/// Node behaviour for the generic reconciler.
#[derive(Debug, Clone)]
pub struct NodeStrategy {
    flap_window: Duration,
}

impl NodeStrategy {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            flap_window: config.ip_flap_window(),
        }
    }
}

impl SnapshotStrategy<NodeKind> for NodeStrategy {
    type Observed = ObservedNode;

    fn key(&self, observed: &ObservedNode) -> PublicKey {
        observed.public_key.clone()
    }

    fn validate(&self, observed: &ObservedNode) -> Result<(), String> {
        if observed.public_key.trim().is_empty() {
            return Err("empty public key".to_string());
        }
        if observed.port == 0 {
            return Err("port 0".to_string());
        }
        match &observed.quorum_set {
            Some(qs) if !qs.is_well_formed() => Err(format!(
                "quorum set threshold {} is unreachable",
                qs.threshold
            )),
            _ => Ok(()),
        }
    }

    fn build(&self, observed: &ObservedNode, previous: Option<&Snapshot<NodeKind>>) -> NodeAttributes {
        let ip_change = previous
            .map(|p| p.payload.ip != observed.ip || p.payload.port != observed.port)
            .unwrap_or(false);

        NodeAttributes {
            ip: observed.ip.clone(),
            port: observed.port,
            quorum_set_hash: observed.quorum_set.as_ref().map(|qs| qs.hash()),
            quorum_set: observed.quorum_set.clone(),
            details: observed.details.clone(),
            geo: observed.geo.clone(),
            organization: observed.organization_id.clone(),
            ip_change,
        }
    }

    fn detect(
        &self,
        active: &Snapshot<NodeKind>,
        observed: &ObservedNode,
        time: DateTime<Utc>,
    ) -> ChangeDecision {
        let changes = node_changes(&active.payload, observed);
        if !changes.any() {
            return ChangeDecision::Unchanged;
        }
        if changes.address_only() && time - active.start_time < self.flap_window {
            return ChangeDecision::Suppressed {
                reason: format!(
                    "address {}:{} -> {}:{} within flap window",
                    active.payload.ip, active.payload.port, observed.ip, observed.port
                ),
            };
        }
        ChangeDecision::Changed
    }
}

/// Reconciles observed nodes against the node snapshot store.
pub struct NodeSnapshotter {
    reconciler: Reconciler<NodeKind>,
    strategy: NodeStrategy,
}

impl NodeSnapshotter {
    pub fn new(reconciler: Reconciler<NodeKind>, config: &NodeConfig) -> Self {
        Self {
            reconciler,
            strategy: NodeStrategy::new(config),
        }
    }

    pub fn reconcile(
        &self,
        observed: &[ObservedNode],
        time: DateTime<Utc>,
    ) -> Result<Reconciliation<NodeKind>, StoreError> {
        self.reconciler.reconcile(&self.strategy, observed, time)
    }
}
