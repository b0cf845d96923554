//! Netscope snapshot engine
//!
//! Keeps a versioned history of network nodes and organizations:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      RECONCILIATION CYCLE                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────┐    ┌──────────────┐    ┌────────────────────┐      │
//! │  │ observed │───►│    Node      │───►│   Organization     │      │
//! │  │  nodes   │    │  Snapshotter │    │   Snapshotter      │      │
//! │  └──────────┘    └──────────────┘    └────────────────────┘      │
//! │                         │                     │                  │
//! │  ┌──────────┐           ▼                     ▼                  │
//! │  │ observed │     ┌──────────────────────────────────┐           │
//! │  │  orgs    │────►│           Archiver               │           │
//! │  └──────────┘     │  (archive ▸ demote ▸ orgs)       │           │
//! │                   └──────────────────────────────────┘           │
//! │                                  │                               │
//! │                                  ▼                               │
//! │                          ┌──────────────┐                        │
//! │                          │ SnapshotStore│                        │
//! │                          └──────────────┘                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Properties
//!
//! - **Append-only**: a closed snapshot is never modified
//! - **One active version**: at most one snapshot per identity has the
//!   sentinel end time
//! - **Idempotent**: reconciling the same observation twice opens nothing
//! - **Isolated failures**: one bad entity never aborts a cycle

pub mod activity;
pub mod archiver;
pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod node;
pub mod orchestrator;
pub mod organization;
pub mod reconciler;
pub mod store;
pub mod table;

#[cfg(test)]
mod tests;

pub use activity::ActivityLog;
pub use archiver::{ArchivalOutcome, ArchivalStats, Archiver};
pub use config::{ArchivalConfig, NodeConfig, OrganizationConfig, SnapshotConfig};
pub use error::{
    ConfigError, CycleError, EntityFailure, FailureClass, ObservationError, Phase, StoreError,
};
pub use memory::MemoryStore;
pub use model::{
    max_sentinel, ContactInfo, EntityKind, GeoLocation, Identity, NodeAttributes, NodeDetails,
    NodeKind, ObservedNode, ObservedOrganization, OrganizationAttributes, OrganizationId,
    OrganizationKind, PublicKey, QuorumSet, Snapshot, SnapshotId, SENTINEL_TIMESTAMP,
};
pub use node::{has_node_changed, node_changes, NodeChanges, NodeSnapshotter, NodeStrategy};
pub use orchestrator::{CycleReport, SnapshotOrchestrator};
pub use organization::{organization_changed, OrganizationSnapshotter, OrganizationStrategy};
pub use reconciler::{
    AbsencePolicy, ChangeDecision, ReconcileStats, Reconciler, Reconciliation, SnapshotStrategy,
};
pub use store::{
    Clock, CycleJournal, CycleRecord, FailureReporter, FixedClock, IdentityStore,
    InactivityQuery, ObservedNodeSource, ObservedOrganizationSource, SnapshotStore, Stores,
    SystemClock, TracingReporter,
};
pub use table::{SnapshotTable, TableSet, Tabled, Violation};
