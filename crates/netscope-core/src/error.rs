//! Error taxonomy.
//!
//! Store errors split into *fatal* ones (the store cannot be trusted for the
//! rest of the cycle) and *entity-level* ones (a single identity's write was
//! rejected). Entity-level problems never abort a cycle; they are recorded as
//! [`EntityFailure`]s.

use crate::model::SnapshotId;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("snapshot {id} is closed and cannot be modified")]
    AppendOnly { id: SnapshotId },
    #[error("{kind} {key} would have {count} active snapshots")]
    ActiveConflict {
        kind: &'static str,
        key: String,
        count: usize,
    },
    #[error("{kind} {key} would have overlapping snapshots")]
    Overlap { kind: &'static str, key: String },
    #[error("snapshot {id} ends before it starts")]
    InvalidInterval { id: SnapshotId },
    #[error("{kind} {key} has no identity")]
    MissingIdentity { kind: &'static str, key: String },
}

impl StoreError {
    /// Fatal errors abort the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Io(_) | StoreError::Encoding(_)
        )
    }

    /// Errors that indicate corrupted history rather than a bad input.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            StoreError::ActiveConflict { .. } | StoreError::Overlap { .. }
        )
    }
}

/// Failure reported by an observation source.
#[derive(Debug, thiserror::Error)]
#[error("observation source failed: {0}")]
pub struct ObservationError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("observation failed: {0}")]
    Observation(#[from] ObservationError),
    #[error("node reconciliation aborted: {0}")]
    Nodes(#[source] StoreError),
    #[error("organization reconciliation aborted: {0}")]
    Organizations(#[source] StoreError),
    #[error("archival aborted: {0}")]
    Archival(#[source] StoreError),
    #[error("reading active snapshots failed: {0}")]
    Report(#[source] StoreError),
    #[error("cycle journal failed: {0}")]
    Journal(#[source] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: i64 },
    #[error("{field} is too large: {value}")]
    TooLarge { field: &'static str, value: i64 },
    #[error("demote_after_hours ({demote}) must not exceed archive_after_hours ({archive})")]
    DemotionAfterArchival { demote: i64, archive: i64 },
}

// ============================================================================
// Per-entity failures
// ============================================================================

/// Where in the cycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Reconcile,
    Archive,
    Demote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Malformed input or a rejected write.
    Processing,
    /// History found in a state that must be repaired out-of-band.
    Integrity,
}

/// A failure isolated to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub kind: &'static str,
    pub key: String,
    pub phase: Phase,
    pub class: FailureClass,
    pub message: String,
}

impl EntityFailure {
    pub fn processing(
        kind: &'static str,
        key: impl ToString,
        phase: Phase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            key: key.to_string(),
            phase,
            class: FailureClass::Processing,
            message: message.into(),
        }
    }

    pub fn integrity(
        kind: &'static str,
        key: impl ToString,
        phase: Phase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            key: key.to_string(),
            phase,
            class: FailureClass::Integrity,
            message: message.into(),
        }
    }

    /// Classify a non-fatal store error raised while writing one identity.
    pub fn from_store(kind: &'static str, key: impl ToString, phase: Phase, err: &StoreError) -> Self {
        if err.is_integrity() {
            Self::integrity(kind, key, phase, err.to_string())
        } else {
            Self::processing(kind, key, phase, err.to_string())
        }
    }
}
