//! Rosters: weighted node lists valid for a range of rounds.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

/// Node identifier within a roster.
pub type NodeId = u64;

/// A single weighted roster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub node_id: NodeId,
    pub weight: u64,
}

/// A versioned, weighted list of participating nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self { entries }
    }

    /// Build a roster from `(node_id, weight)` pairs, keeping their order.
    pub fn from_weights(weights: impl IntoIterator<Item = (NodeId, u64)>) -> Self {
        Self {
            entries: weights
                .into_iter()
                .map(|(node_id, weight)| RosterEntry { node_id, weight })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn weight_of(&self, node_id: NodeId) -> Option<u64> {
        self.entries
            .iter()
            .find(|entry| entry.node_id == node_id)
            .map(|entry| entry.weight)
    }

    pub fn total_weight(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |total, entry| total.saturating_add(entry.weight))
    }

    /// SHA-384 over each entry's big-endian node id and weight, in roster order.
    pub fn hash(&self) -> RosterHash {
        let mut hasher = Sha384::new();
        for entry in &self.entries {
            hasher.update(entry.node_id.to_be_bytes());
            hasher.update(entry.weight.to_be_bytes());
        }
        RosterHash(hasher.finalize().to_vec())
    }
}

/// Hash identifying a roster. Empty means "no roster".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RosterHash(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl RosterHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for RosterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}
