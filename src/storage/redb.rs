//! ReDB storage implementation for the TSS store.
//!
//! Provides persistent storage for:
//! - Threshold messages, keyed `{target_hex}/{sequence}`
//! - Votes, keyed `{target_hex}/{node_id}`
//! - TSS encryption keys, keyed by node id
//!
//! Record values are JSON-serialized. Composite keys zero-pad their numeric
//! suffix so lexicographic order matches numeric order.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{TssError, TssResult};
use crate::roster::{NodeId, RosterHash};
use crate::storage::TssStore;
use crate::tss::types::{TssMessageRecord, TssVoteRecord};

// Table definitions
const TSS_MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("tss_messages");
const TSS_VOTES: TableDefinition<&str, &[u8]> = TableDefinition::new("tss_votes");
const TSS_ENCRYPTION_KEYS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("tss_encryption_keys");

/// `{target_hex}/`; every key for a target starts with this.
fn target_prefix(target: &RosterHash) -> String {
    format!("{}/", target.to_hex())
}

/// Exclusive upper bound of the prefix range ('0' sorts right after '/').
fn target_prefix_end(target: &RosterHash) -> String {
    format!("{}0", target.to_hex())
}

fn message_key(target: &RosterHash, seq: u64) -> String {
    format!("{}{seq:020}", target_prefix(target))
}

fn vote_key(target: &RosterHash, node_id: NodeId) -> String {
    format!("{}{node_id:020}", target_prefix(target))
}

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> TssResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| TssError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        tracing::info!(path = %path.display(), "Opened TSS store");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory database for testing.
    pub fn open_memory() -> TssResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| TssError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn init_tables(db: &Database) -> TssResult<()> {
        let write_txn = db.begin_write()?;
        {
            // Just opening the tables creates them if they don't exist
            let _ = write_txn.open_table(TSS_MESSAGES)?;
            let _ = write_txn.open_table(TSS_VOTES)?;
            let _ = write_txn.open_table(TSS_ENCRYPTION_KEYS)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl TssStore for Storage {
    fn messages_for_target(&self, target: &RosterHash) -> TssResult<Vec<TssMessageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TSS_MESSAGES)?;

        let start = target_prefix(target);
        let end = target_prefix_end(target);
        let records: TssResult<Vec<TssMessageRecord>> = table
            .range(start.as_str()..end.as_str())?
            .map(|entry| {
                let (_, value) = entry?;
                Ok(serde_json::from_slice(value.value())?)
            })
            .collect();

        records
    }

    fn put_message(&self, record: &TssMessageRecord) -> TssResult<u64> {
        let value = serde_json::to_vec(record)?;
        let target = &record.target_roster_hash;
        let write_txn = self.db.begin_write()?;

        let seq = {
            let mut table = write_txn.open_table(TSS_MESSAGES)?;

            let start = target_prefix(target);
            let end = target_prefix_end(target);
            let seq = table.range(start.as_str()..end.as_str())?.count() as u64;

            let key = message_key(target, seq);
            table.insert(key.as_str(), value.as_slice())?;
            seq
        };

        write_txn.commit()?;
        tracing::debug!(
            target_roster = %target,
            share_index = record.share_index,
            seq,
            "Stored TSS message"
        );
        Ok(seq)
    }

    fn vote(&self, node_id: NodeId, target: &RosterHash) -> TssResult<Option<TssVoteRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TSS_VOTES)?;

        let key = vote_key(target, node_id);
        match table.get(key.as_str())? {
            Some(value) => {
                let record: TssVoteRecord = serde_json::from_slice(value.value())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn votes_for_target(&self, target: &RosterHash) -> TssResult<Vec<(NodeId, TssVoteRecord)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TSS_VOTES)?;

        let start = target_prefix(target);
        let end = target_prefix_end(target);
        let mut votes = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (key, value) = entry?;
            let node_id = key
                .value()
                .rsplit('/')
                .next()
                .and_then(|suffix| suffix.parse::<NodeId>().ok())
                .ok_or_else(|| {
                    TssError::Deserialization(format!("malformed vote key {}", key.value()))
                })?;
            let record: TssVoteRecord = serde_json::from_slice(value.value())?;
            votes.push((node_id, record));
        }
        Ok(votes)
    }

    fn put_vote(&self, node_id: NodeId, record: &TssVoteRecord) -> TssResult<()> {
        let value = serde_json::to_vec(record)?;
        let key = vote_key(&record.target_roster_hash, node_id);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TSS_VOTES)?;
            table.insert(key.as_str(), value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::debug!(node_id, target_roster = %record.target_roster_hash, "Stored TSS vote");
        Ok(())
    }

    fn encryption_key(&self, node_id: NodeId) -> TssResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TSS_ENCRYPTION_KEYS)?;

        Ok(table.get(node_id)?.map(|v| v.value().to_vec()))
    }

    fn put_encryption_key(&self, node_id: NodeId, key: &[u8]) -> TssResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TSS_ENCRYPTION_KEYS)?;
            table.insert(node_id, key)?;
        }
        write_txn.commit()?;
        tracing::debug!(node_id, "Stored TSS encryption key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tss::types::VoteBitSet;

    fn message(target: &RosterHash, share_index: u32) -> TssMessageRecord {
        TssMessageRecord {
            source_roster_hash: RosterHash::new(vec![0xaa; 48]),
            target_roster_hash: target.clone(),
            share_index,
            message: vec![share_index as u8; 4],
        }
    }

    fn vote(target: &RosterHash) -> TssVoteRecord {
        TssVoteRecord {
            source_roster_hash: RosterHash::new(vec![0xaa; 48]),
            target_roster_hash: target.clone(),
            ledger_id: vec![7; 8],
            node_signature: vec![8; 64],
            vote: VoteBitSet::from_bytes(vec![0b0110]),
        }
    }

    #[test]
    fn test_messages_are_scoped_and_ordered() -> TssResult<()> {
        let storage = Storage::open_memory()?;
        let target = RosterHash::new(vec![1; 48]);
        let other = RosterHash::new(vec![2; 48]);

        assert_eq!(storage.put_message(&message(&target, 3))?, 0);
        assert_eq!(storage.put_message(&message(&other, 9))?, 0);
        assert_eq!(storage.put_message(&message(&target, 1))?, 1);

        let records = storage.messages_for_target(&target)?;
        let indices: Vec<u32> = records.iter().map(|r| r.share_index).collect();
        assert_eq!(indices, vec![3, 1]);
        assert_eq!(storage.messages_for_target(&other)?.len(), 1);
        assert!(
            storage
                .messages_for_target(&RosterHash::new(vec![3; 48]))?
                .is_empty()
        );

        Ok(())
    }

    #[test]
    fn test_vote_crud() -> TssResult<()> {
        let storage = Storage::open_memory()?;
        let target = RosterHash::new(vec![1; 48]);

        assert!(storage.vote(4, &target)?.is_none());
        storage.put_vote(4, &vote(&target))?;
        storage.put_vote(11, &vote(&target))?;

        assert_eq!(storage.vote(4, &target)?, Some(vote(&target)));
        assert!(storage.vote(4, &RosterHash::new(vec![2; 48]))?.is_none());

        let votes = storage.votes_for_target(&target)?;
        let voters: Vec<NodeId> = votes.iter().map(|(node_id, _)| *node_id).collect();
        assert_eq!(voters, vec![4, 11]);

        Ok(())
    }

    #[test]
    fn test_encryption_keys() -> TssResult<()> {
        let storage = Storage::open_memory()?;
        assert!(storage.encryption_key(1)?.is_none());
        storage.put_encryption_key(1, b"pairing-key")?;
        assert_eq!(storage.encryption_key(1)?, Some(b"pairing-key".to_vec()));
        Ok(())
    }
}
