//! TSS protocol types and persisted records.
//!
//! Records are the durable, JSON-serializable form of what nodes gossip to each
//! other (messages, votes, share signatures). In-memory cryptographic values
//! wrap opaque engine-specific byte encodings.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::roster::RosterHash;

/// Share identifier (1-based index in the participant directory).
pub type ShareId = u32;

// =============================================================================
// Cryptographic values
// =============================================================================

/// A threshold message as understood by the crypto engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssMessage {
    /// Share index of the sender in the source directory.
    pub share_id: ShareId,
    /// Engine-specific encoding.
    pub bytes: Vec<u8>,
}

impl TssMessage {
    pub fn new(share_id: ShareId, bytes: Vec<u8>) -> Self {
        Self { share_id, bytes }
    }

    pub fn from_record(record: &TssMessageRecord) -> Self {
        Self {
            share_id: record.share_index,
            bytes: record.message.clone(),
        }
    }
}

/// A decrypted private share. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateShare {
    pub share_id: ShareId,
    key: Vec<u8>,
}

impl PrivateShare {
    pub fn new(share_id: ShareId, key: Vec<u8>) -> Self {
        Self { share_id, key }
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl fmt::Debug for PrivateShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateShare")
            .field("share_id", &self.share_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// A public share, visible to every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicShare {
    pub share_id: ShareId,
    pub key: Vec<u8>,
}

impl PublicShare {
    pub fn new(share_id: ShareId, key: Vec<u8>) -> Self {
        Self { share_id, key }
    }
}

/// The network's aggregate public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPublicKey(Vec<u8>);

impl LedgerPublicKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Aggregate of private shares. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AggregatePrivateKey(Vec<u8>);

impl AggregatePrivateKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AggregatePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AggregatePrivateKey(<redacted>)")
    }
}

/// A signature produced with a single private share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSignature {
    pub share_id: ShareId,
    pub signature: Vec<u8>,
}

impl ShareSignature {
    pub fn new(share_id: ShareId, signature: Vec<u8>) -> Self {
        Self { share_id, signature }
    }
}

/// Signature by this node's long-term gossip key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSignature(Vec<u8>);

impl NodeSignature {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }
}

/// Bit set of contributing share indices.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8` (least significant
/// first); trailing zero bytes are trimmed.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VoteBitSet(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl VoteBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut set = Self(bytes);
        set.trim();
        set
    }

    pub fn set(&mut self, index: ShareId) {
        let byte = index as usize / 8;
        if self.0.len() <= byte {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (index % 8);
    }

    pub fn contains(&self, index: ShareId) -> bool {
        self.0
            .get(index as usize / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn trim(&mut self) {
        while self.0.last() == Some(&0) {
            self.0.pop();
        }
    }
}

impl fmt::Debug for VoteBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VoteBitSet({})", hex::encode(&self.0))
    }
}

/// Candidate ledger id with this node's signature and the vote behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerIdWithSignature {
    pub ledger_id: LedgerPublicKey,
    pub signature: NodeSignature,
    pub vote: VoteBitSet,
}

// =============================================================================
// Persisted records
// =============================================================================

/// A threshold message scoped to a `source -> target` roster transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssMessageRecord {
    pub source_roster_hash: RosterHash,
    pub target_roster_hash: RosterHash,
    pub share_index: ShareId,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub message: Vec<u8>,
}

/// A node's vote for the ledger id of a target roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssVoteRecord {
    pub source_roster_hash: RosterHash,
    pub target_roster_hash: RosterHash,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ledger_id: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub node_signature: Vec<u8>,
    pub vote: VoteBitSet,
}

/// A signature over a message hash by a single share of the active roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssShareSignatureRecord {
    pub roster_hash: RosterHash,
    pub share_index: ShareId,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub message_hash: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub share_signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_bit_set_layout() {
        let mut bits = VoteBitSet::new();
        bits.set(1);
        bits.set(9);
        assert_eq!(bits.as_bytes(), &[0b0000_0010, 0b0000_0010]);
        assert!(bits.contains(1));
        assert!(bits.contains(9));
        assert!(!bits.contains(2));
        assert!(!bits.contains(64));
        assert_eq!(bits.count(), 2);
    }

    #[test]
    fn test_vote_bit_set_trims_trailing_zeros() {
        assert_eq!(VoteBitSet::from_bytes(vec![1, 0, 0]).as_bytes(), &[1]);
        assert!(VoteBitSet::from_bytes(vec![0]).is_empty());
    }

    #[test]
    fn test_private_share_debug_is_redacted() {
        let share = PrivateShare::new(3, vec![0x42; 32]);
        let rendered = format!("{share:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("42"));
    }

    #[test]
    fn test_message_record_json() {
        let record = TssMessageRecord {
            source_roster_hash: RosterHash::new(vec![1; 48]),
            target_roster_hash: RosterHash::new(vec![2; 48]),
            share_index: 4,
            message: vec![9, 9, 9],
        };
        let json = serde_json::to_vec(&record).unwrap();
        let parsed: TssMessageRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(TssMessage::from_record(&parsed), TssMessage::new(4, vec![9, 9, 9]));
    }
}
