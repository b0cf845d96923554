//! Last-seen log for nodes, used to answer inactivity queries.

use crate::model::PublicKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLog {
    last_seen: BTreeMap<PublicKey, DateTime<Utc>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` was observed active at `seen_at`. Older
    /// observations never move the last-seen time backwards.
    pub fn record(&mut self, key: &str, seen_at: DateTime<Utc>) {
        match self.last_seen.get_mut(key) {
            Some(existing) if *existing >= seen_at => {}
            Some(existing) => *existing = seen_at,
            None => {
                self.last_seen.insert(key.to_string(), seen_at);
            }
        }
    }

    pub fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(key).copied()
    }

    /// Keys last observed at or before `threshold`, i.e. inactive for at
    /// least `now - threshold`.
    pub fn inactive_since(&self, threshold: DateTime<Utc>) -> Vec<PublicKey> {
        self.last_seen
            .iter()
            .filter(|(_, seen)| **seen <= threshold)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PublicKey, &DateTime<Utc>)> {
        self.last_seen.iter()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
