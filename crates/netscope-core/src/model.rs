//! Snapshot data model.
//!
//! Every tracked entity has a stable [`Identity`] and a timeline of
//! [`Snapshot`]s. A snapshot is valid over the half-open interval
//! `[start_time, end_time)`; the active snapshot of an identity carries the
//! [`max_sentinel`] end time.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Node public key (natural key of a node identity)
pub type PublicKey = String;

/// Organization id (natural key of an organization identity)
pub type OrganizationId = String;

/// Unique identifier of a single snapshot row
pub type SnapshotId = Uuid;

/// Unix timestamp of the sentinel end time (9999-12-31T23:59:59Z).
pub const SENTINEL_TIMESTAMP: i64 = 253_402_300_799;

/// End time carried by active snapshots.
pub fn max_sentinel() -> DateTime<Utc> {
    DateTime::from_timestamp(SENTINEL_TIMESTAMP, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Entity kinds
// ============================================================================

/// Marker trait tying a natural key type to a snapshot payload type.
pub trait EntityKind: Copy + Debug + PartialEq + Eq + Send + Sync + 'static {
    type Key: Clone + Debug + Display + Eq + Ord + Hash + Send + Sync + Serialize + DeserializeOwned;
    type Payload: Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned;

    /// Human-readable kind name used in logs and reports.
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeKind;

impl EntityKind for NodeKind {
    type Key = PublicKey;
    type Payload = NodeAttributes;
    const NAME: &'static str = "node";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationKind;

impl EntityKind for OrganizationKind {
    type Key = OrganizationId;
    type Payload = OrganizationAttributes;
    const NAME: &'static str = "organization";
}

// ============================================================================
// Identity & Snapshot
// ============================================================================

/// Stable identity of an entity. Created on first observation, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Identity<K: EntityKind> {
    pub key: K::Key,
    pub first_observed_at: DateTime<Utc>,
}

/// A time-bounded version of one entity's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Snapshot<K: EntityKind> {
    pub id: SnapshotId,
    pub identity: K::Key,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub payload: K::Payload,
}

impl<K: EntityKind> Snapshot<K> {
    /// Open a new active snapshot starting at `start_time`.
    pub fn open(identity: K::Key, start_time: DateTime<Utc>, payload: K::Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            start_time,
            end_time: max_sentinel(),
            payload,
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_time == max_sentinel()
    }

    /// Copy of this snapshot with its end time set to `time`.
    pub fn closed_at(&self, time: DateTime<Utc>) -> Self {
        Self {
            end_time: time,
            ..self.clone()
        }
    }

    /// Whether the snapshot was valid at `time`.
    pub fn covers(&self, time: DateTime<Utc>) -> bool {
        self.start_time <= time && time < self.end_time
    }

    /// Whether `[start_time, end_time)` intersects the closed range `[from, to]`.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start_time <= to && self.end_time > from
    }
}

// ============================================================================
// Node attributes
// ============================================================================

/// Quorum set declared by a validating node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumSet {
    pub threshold: u32,
    #[serde(default)]
    pub validators: Vec<PublicKey>,
    #[serde(default)]
    pub inner_quorum_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    /// Hex SHA-256 of the canonical JSON encoding.
    pub fn hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Threshold must be reachable by the declared members, recursively.
    pub fn is_well_formed(&self) -> bool {
        let members = self.validators.len() + self.inner_quorum_sets.len();
        self.threshold >= 1
            && self.threshold as usize <= members
            && self.inner_quorum_sets.iter().all(QuorumSet::is_well_formed)
    }
}

/// Descriptive node fields. `None` is the single "unset" encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDetails {
    pub host: Option<String>,
    pub name: Option<String>,
    pub home_domain: Option<String>,
    pub alias: Option<String>,
    pub isp: Option<String>,
    pub version_str: Option<String>,
    pub overlay_version: Option<u32>,
    pub overlay_min_version: Option<u32>,
    pub ledger_version: Option<u32>,
    pub history_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Attribute payload of a node snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub ip: String,
    pub port: u16,
    /// `None` means the node is a watcher, not a validator.
    pub quorum_set: Option<QuorumSet>,
    pub quorum_set_hash: Option<String>,
    pub details: NodeDetails,
    pub geo: Option<GeoLocation>,
    pub organization: Option<OrganizationId>,
    /// Set when this version was opened because the address changed.
    /// Informational for readers; flap damping only looks at the age of
    /// the active version.
    pub ip_change: bool,
}

impl NodeAttributes {
    pub fn is_validator(&self) -> bool {
        self.quorum_set_hash.is_some()
    }

    /// Same attributes with the quorum set removed.
    pub fn demoted(&self) -> Self {
        Self {
            quorum_set: None,
            quorum_set_hash: None,
            ip_change: false,
            ..self.clone()
        }
    }
}

// ============================================================================
// Organization attributes
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub dba: Option<String>,
    pub official_email: Option<String>,
    pub phone_number: Option<String>,
    pub physical_address: Option<String>,
    pub twitter: Option<String>,
    pub github: Option<String>,
    pub keybase: Option<String>,
}

/// Attribute payload of an organization snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationAttributes {
    pub name: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub horizon_url: Option<String>,
    pub contact: ContactInfo,
    /// Member nodes with an active snapshot when this version was opened.
    pub members: BTreeSet<PublicKey>,
}

// ============================================================================
// Observations
// ============================================================================

/// A node as reported by the crawler for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedNode {
    pub public_key: PublicKey,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub quorum_set: Option<QuorumSet>,
    #[serde(default)]
    pub details: NodeDetails,
    #[serde(default)]
    pub geo: Option<GeoLocation>,
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
}

/// An organization as declared by its home-domain TOML for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedOrganization {
    pub id: OrganizationId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub horizon_url: Option<String>,
    #[serde(default)]
    pub contact: ContactInfo,
    #[serde(default)]
    pub members: Vec<PublicKey>,
}
