//! Packet, message log and once-table encodings
//!
//! Both shared values are plain JSON so any peer implementation can read them.
//! Unparseable values decode as empty: a corrupt log is dropped on the next
//! write instead of wedging every peer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One broadcast message unit persisted in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Application-supplied deduplication key
    #[serde(default)]
    pub id: Option<String>,
    /// Event name
    pub name: String,
    /// Writer's peer identity
    pub origin: String,
    /// Write time (unix ms)
    pub timestamp: i64,
    /// Event payload
    #[serde(default)]
    pub payload: Value,
}

impl Packet {
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        origin: impl Into<String>,
        id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            origin: origin.into(),
            timestamp,
            payload,
        }
    }

    /// The deduplication id, treating an empty id as none
    pub fn dedup_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Ordered packets stored under the log key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageLog {
    packets: Vec<Packet>,
}

impl MessageLog {
    /// Decode a raw stored value; missing or malformed decodes as empty
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        match serde_json::from_str::<Vec<Packet>>(raw) {
            Ok(packets) => Self { packets },
            Err(e) => {
                warn!(error = %e, "MessageLog::parse: malformed log, treating as empty");
                Self::default()
            }
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.packets)
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    /// Drop packets written before `threshold`; returns how many were removed
    pub fn prune_older_than(&mut self, threshold: i64) -> usize {
        let before = self.packets.len();
        self.packets.retain(|packet| packet.timestamp >= threshold);
        before - self.packets.len()
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl IntoIterator for MessageLog {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}

/// Key to first-claim timestamp ledger stored under the once key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnceTable {
    claims: BTreeMap<String, i64>,
}

impl OnceTable {
    /// Decode a raw stored value; missing or malformed decodes as empty
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        match serde_json::from_str::<BTreeMap<String, i64>>(raw) {
            Ok(claims) => Self { claims },
            Err(e) => {
                warn!(error = %e, "OnceTable::parse: malformed table, treating as empty");
                Self::default()
            }
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.claims)
    }

    /// Record `key` as claimed at `now`; false if it was already claimed
    pub fn claim(&mut self, key: &str, now: i64) -> bool {
        if self.claims.contains_key(key) {
            return false;
        }
        self.claims.insert(key.to_string(), now);
        true
    }

    pub fn claimed_at(&self, key: &str) -> Option<i64> {
        self.claims.get(key).copied()
    }

    /// Drop claims made before `threshold`; returns how many were removed
    pub fn prune_older_than(&mut self, threshold: i64) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, claimed_at| *claimed_at >= threshold);
        before - self.claims.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.claims.iter().map(|(key, at)| (key.as_str(), *at))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
