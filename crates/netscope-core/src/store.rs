//! Collaborator contracts.
//!
//! The reconciliation core only talks to persistence and to the observation
//! pipeline through these traits. `netscope-storage` provides the durable
//! implementation, [`crate::memory::MemoryStore`] an in-process one.

use crate::error::{EntityFailure, ObservationError, StoreError};
use crate::model::{
    EntityKind, Identity, NodeKind, ObservedNode, ObservedOrganization, OrganizationKind,
    PublicKey, Snapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence of versioned snapshots for one entity kind.
pub trait SnapshotStore<K: EntityKind>: Send + Sync {
    /// All snapshots whose end time is the sentinel.
    fn find_active(&self) -> Result<Vec<Snapshot<K>>, StoreError>;

    fn find_active_for_identity(&self, key: &K::Key) -> Result<Option<Snapshot<K>>, StoreError>;

    /// Most recently closed snapshot of an identity, if any.
    fn find_latest_archived_for_identity(
        &self,
        key: &K::Key,
    ) -> Result<Option<Snapshot<K>>, StoreError>;

    /// Snapshots valid at `time`.
    fn find_active_at(&self, time: DateTime<Utc>) -> Result<Vec<Snapshot<K>>, StoreError>;

    /// Snapshots of `key` whose validity interval intersects `[from, to]`.
    fn find_for_identity_between(
        &self,
        key: &K::Key,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot<K>>, StoreError>;

    /// Write a batch atomically: either every row is stored or none is.
    ///
    /// Rows whose id already exists must be identical to the stored row
    /// except for an end time moving from the sentinel to a finite value.
    fn save(&self, batch: &[Snapshot<K>]) -> Result<(), StoreError>;
}

pub trait IdentityStore<K: EntityKind>: Send + Sync {
    fn find_or_create(
        &self,
        key: &K::Key,
        first_observed_at: DateTime<Utc>,
    ) -> Result<Identity<K>, StoreError>;

    fn find(&self, key: &K::Key) -> Result<Option<Identity<K>>, StoreError>;
}

/// Node inactivity, backed by the measurement history.
pub trait InactivityQuery: Send + Sync {
    /// Nodes not seen active after `threshold`.
    fn find_identities_inactive_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<PublicKey>, StoreError>;
}

/// Record of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub completed: bool,
}

/// Tracks which cycles started and which completed.
pub trait CycleJournal: Send + Sync {
    fn begin_cycle(&self, observed_at: DateTime<Utc>) -> Result<CycleRecord, StoreError>;
    fn complete_cycle(&self, sequence: u64) -> Result<(), StoreError>;
    fn latest_cycle(&self) -> Result<Option<CycleRecord>, StoreError>;
}

// ============================================================================
// Observation sources
// ============================================================================

pub trait ObservedNodeSource {
    fn observe_nodes(&self) -> Result<Vec<ObservedNode>, ObservationError>;
}

pub trait ObservedOrganizationSource {
    fn observe_organizations(&self) -> Result<Vec<ObservedOrganization>, ObservationError>;
}

impl ObservedNodeSource for Vec<ObservedNode> {
    fn observe_nodes(&self) -> Result<Vec<ObservedNode>, ObservationError> {
        Ok(self.clone())
    }
}

impl ObservedOrganizationSource for Vec<ObservedOrganization> {
    fn observe_organizations(&self) -> Result<Vec<ObservedOrganization>, ObservationError> {
        Ok(self.clone())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Supplies the single observation timestamp of a cycle.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

// ============================================================================
// Failure reporting
// ============================================================================

/// Sink for per-entity failures.
pub trait FailureReporter: Send + Sync {
    fn report(&self, failure: &EntityFailure);
}

/// Reports failures through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, failure: &EntityFailure) {
        tracing::error!(
            kind = failure.kind,
            key = %failure.key,
            phase = ?failure.phase,
            class = ?failure.class,
            "{}",
            failure.message
        );
    }
}

// ============================================================================
// Store bundle
// ============================================================================

/// Every store the orchestrator depends on.
#[derive(Clone)]
pub struct Stores {
    pub node_snapshots: Arc<dyn SnapshotStore<NodeKind>>,
    pub organization_snapshots: Arc<dyn SnapshotStore<OrganizationKind>>,
    pub node_identities: Arc<dyn IdentityStore<NodeKind>>,
    pub organization_identities: Arc<dyn IdentityStore<OrganizationKind>>,
    pub inactivity: Arc<dyn InactivityQuery>,
    pub journal: Arc<dyn CycleJournal>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: SnapshotStore<NodeKind>
            + SnapshotStore<OrganizationKind>
            + IdentityStore<NodeKind>
            + IdentityStore<OrganizationKind>
            + InactivityQuery
            + CycleJournal
            + 'static,
    {
        Self {
            node_snapshots: backend.clone(),
            organization_snapshots: backend.clone(),
            node_identities: backend.clone(),
            organization_identities: backend.clone(),
            inactivity: backend.clone(),
            journal: backend,
        }
    }
}
