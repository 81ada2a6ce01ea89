//! Durable store for TSS protocol state.
//!
//! Messages and votes are keyed by target roster hash; this subsystem only
//! relies on key/value semantics. `redb::Storage` is the embedded backend.

pub mod redb;

pub use self::redb::Storage;

use crate::error::TssResult;
use crate::roster::{NodeId, RosterHash};
use crate::tss::types::{TssMessageRecord, TssVoteRecord};

/// Key/value access to persisted threshold messages, votes and encryption keys.
pub trait TssStore: Send + Sync {
    /// All messages for `target`, in the order they were persisted.
    fn messages_for_target(&self, target: &RosterHash) -> TssResult<Vec<TssMessageRecord>>;

    /// Persist a message under its target roster hash.
    ///
    /// Returns the message's sequence number within that target.
    fn put_message(&self, record: &TssMessageRecord) -> TssResult<u64>;

    /// The vote `node_id` cast for `target`, if any.
    fn vote(&self, node_id: NodeId, target: &RosterHash) -> TssResult<Option<TssVoteRecord>>;

    /// All votes recorded for `target`, by voting node.
    fn votes_for_target(&self, target: &RosterHash) -> TssResult<Vec<(NodeId, TssVoteRecord)>>;

    /// Persist `node_id`'s vote for its target roster.
    fn put_vote(&self, node_id: NodeId, record: &TssVoteRecord) -> TssResult<()>;

    /// The TSS encryption key `node_id` published, if any.
    fn encryption_key(&self, node_id: NodeId) -> TssResult<Option<Vec<u8>>>;

    /// Persist `node_id`'s TSS encryption key.
    fn put_encryption_key(&self, node_id: NodeId, key: &[u8]) -> TssResult<()>;
}
