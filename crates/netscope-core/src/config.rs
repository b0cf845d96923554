//! Tunable thresholds for reconciliation and archival.

use crate::error::ConfigError;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Upper bound for any configured window (ten years).
const MAX_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub node: NodeConfig,
    pub organization: OrganizationConfig,
    pub archival: ArchivalConfig,
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_hours("node.ip_flap_window_hours", self.node.ip_flap_window_hours)?;
        check_hours("archival.demote_after_hours", self.archival.demote_after_hours)?;
        check_hours("archival.archive_after_hours", self.archival.archive_after_hours)?;
        if self.archival.demote_after_hours > self.archival.archive_after_hours {
            return Err(ConfigError::DemotionAfterArchival {
                demote: self.archival.demote_after_hours,
                archive: self.archival.archive_after_hours,
            });
        }
        Ok(())
    }
}

fn check_hours(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NotPositive { field, value });
    }
    if value > MAX_HOURS {
        return Err(ConfigError::TooLarge { field, value });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address-only changes within this window of the active snapshot's
    /// start are not versioned.
    pub ip_flap_window_hours: i64,
}

impl NodeConfig {
    pub fn ip_flap_window(&self) -> Duration {
        Duration::hours(self.ip_flap_window_hours)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip_flap_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationConfig {
    /// Close an organization's snapshot as soon as it is not observed,
    /// instead of waiting for the archiver.
    pub archive_when_absent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchivalConfig {
    /// Validators inactive this long are demoted to watchers.
    pub demote_after_hours: i64,
    /// Nodes inactive this long are archived.
    pub archive_after_hours: i64,
}

impl ArchivalConfig {
    pub fn demote_after(&self) -> Duration {
        Duration::hours(self.demote_after_hours)
    }

    pub fn archive_after(&self) -> Duration {
        Duration::hours(self.archive_after_hours)
    }
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            demote_after_hours: 24,
            archive_after_hours: 24 * 7,
        }
    }
}
