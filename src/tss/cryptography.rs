//! Vote production from observed threshold messages.
//!
//! When a message for a target roster arrives, this node checks whether enough
//! valid messages exist to fix the target's ledger id and, if so, signs that
//! ledger id and reports which shares contributed. A node votes at most once
//! per target roster.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::error::{TssError, TssResult};
use crate::gossip::NodeSigner;
use crate::roster::{NodeId, RosterHash};
use crate::storage::TssStore;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::engine::{CryptoEngine, ledger_id_from};
use crate::tss::types::{LedgerIdWithSignature, LedgerPublicKey, TssMessage, TssMessageRecord};
use crate::tss::validation::{is_vote_threshold_met, validate_messages, vote_bit_set};

/// Turns threshold messages into signed ledger id votes.
///
/// Clones share the set of claimed targets, so every path that can vote
/// (message arrival and the per-round status machine) sees the same claims.
#[derive(Clone)]
pub struct TssCryptographyManager {
    engine: Arc<dyn CryptoEngine>,
    store: Arc<dyn TssStore>,
    node_signer: Arc<dyn NodeSigner>,
    self_node_id: NodeId,
    /// Targets this node has voted for, or is voting for right now.
    voted: Arc<Mutex<HashSet<RosterHash>>>,
}

impl TssCryptographyManager {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        store: Arc<dyn TssStore>,
        node_signer: Arc<dyn NodeSigner>,
        self_node_id: NodeId,
    ) -> Self {
        Self {
            engine,
            store,
            node_signer,
            self_node_id,
            voted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim the right to vote for `target`.
    ///
    /// Returns `false` if this node already voted for `target` or another
    /// caller holds the claim. A claim that does not end in a submitted vote
    /// must be given back with [`Self::release_vote`].
    pub fn claim_vote(&self, target: &RosterHash) -> TssResult<bool> {
        Ok(self.voted()?.insert(target.clone()))
    }

    /// Give back a claim whose vote was not produced or not submitted.
    pub fn release_vote(&self, target: &RosterHash) -> TssResult<()> {
        self.voted()?.remove(target);
        Ok(())
    }

    pub fn has_voted(&self, target: &RosterHash) -> TssResult<bool> {
        Ok(self.voted()?.contains(target))
    }

    fn voted(&self) -> TssResult<std::sync::MutexGuard<'_, HashSet<RosterHash>>> {
        self.voted
            .lock()
            .map_err(|e| TssError::Internal(format!("Vote claim mutex poisoned: {e}")))
    }

    /// React to a newly persisted message for `target`.
    ///
    /// Returns `None` when this node already voted for `target`, when the
    /// threshold is not met yet, and when anything fails along the way
    /// (failures are logged; the next observed message retries).
    ///
    /// A returned vote keeps its claim on `target`. If the caller then fails
    /// to submit it, the caller releases the claim.
    pub async fn handle_tss_message(
        &self,
        target: &RosterHash,
        directory: Arc<ParticipantDirectory>,
    ) -> Option<LedgerIdWithSignature> {
        match self.store.vote(self.self_node_id, target) {
            Ok(Some(_)) => {
                tracing::debug!(target_roster = %target, "Already voted for target roster");
                // Persisted votes from before a restart count as claims too.
                let _ = self.claim_vote(target);
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    code = e.error_code(),
                    target_roster = %target,
                    "Failed to read own vote"
                );
                return None;
            }
        }

        match self.claim_vote(target) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target_roster = %target, "Vote for target roster already claimed");
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, code = e.error_code(), "Failed to claim TSS vote");
                return None;
            }
        }

        let manager = self.clone();
        let claimed = target.clone();
        let result = tokio::task::spawn_blocking(move || {
            let records = manager.store.messages_for_target(&claimed)?;
            manager.get_vote(&records, &directory)
        })
        .await;

        let vote = match result {
            Ok(Ok(vote)) => vote,
            Ok(Err(e)) => {
                tracing::error!(error = %e, code = e.error_code(), "Failed to compute TSS vote");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "TSS vote task failed");
                None
            }
        };

        if vote.is_none()
            && let Err(e) = self.release_vote(target)
        {
            tracing::error!(error = %e, code = e.error_code(), "Failed to release TSS vote claim");
        }
        vote
    }

    /// Signed ledger id implied by `records`, if they meet the vote threshold.
    pub fn get_vote(
        &self,
        records: &[TssMessageRecord],
        directory: &ParticipantDirectory,
    ) -> TssResult<Option<LedgerIdWithSignature>> {
        let messages: Vec<TssMessage> = records.iter().map(TssMessage::from_record).collect();
        let valid = validate_messages(&messages, directory, self.engine.as_ref());

        if !is_vote_threshold_met(&valid, directory) {
            tracing::debug!(
                valid = valid.len(),
                threshold = directory.threshold(),
                "Vote threshold not met"
            );
            return Ok(None);
        }

        let ledger_id = ledger_id_from(self.engine.as_ref(), directory, &valid)?;
        let signature = self.node_signer.sign(&ledger_id)?;
        let vote = vote_bit_set(&valid);

        tracing::info!(
            node_id = self.self_node_id,
            ledger_id = %hex::encode(&ledger_id),
            contributing_shares = vote.count(),
            "Computed ledger id vote"
        );

        Ok(Some(LedgerIdWithSignature {
            ledger_id: LedgerPublicKey::new(ledger_id),
            signature,
            vote,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Roster;
    use crate::storage::Storage;
    use crate::test_support::{FakeCryptoEngine, FakeNodeSigner, seed_genesis_messages};
    use crate::tss::types::{TssVoteRecord, VoteBitSet};

    fn manager(storage: &Storage, engine: FakeCryptoEngine) -> TssCryptographyManager {
        TssCryptographyManager::new(
            Arc::new(engine),
            Arc::new(storage.clone()),
            Arc::new(FakeNodeSigner::new(1)),
            1,
        )
    }

    fn directory(roster: &Roster) -> Arc<ParticipantDirectory> {
        Arc::new(ParticipantDirectory::compute(roster, 1, 1).unwrap())
    }

    #[tokio::test]
    async fn test_no_vote_below_threshold() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 1);

        let manager = manager(&storage, FakeCryptoEngine::new());
        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());
    }

    #[tokio::test]
    async fn test_vote_at_threshold() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 2);

        let manager = manager(&storage, FakeCryptoEngine::new());
        let vote = manager
            .handle_tss_message(&roster.hash(), directory(&roster))
            .await
            .unwrap();
        assert!(!vote.ledger_id.as_bytes().is_empty());
        assert_eq!(vote.vote.count(), 2);
        assert_eq!(
            vote.signature,
            FakeNodeSigner::new(1).sign(vote.ledger_id.as_bytes()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_existing_self_vote_short_circuits() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);
        storage
            .put_vote(
                1,
                &TssVoteRecord {
                    source_roster_hash: roster.hash(),
                    target_roster_hash: roster.hash(),
                    ledger_id: vec![1],
                    node_signature: vec![2],
                    vote: VoteBitSet::from_bytes(vec![0b1110]),
                },
            )
            .unwrap();

        let manager = manager(&storage, FakeCryptoEngine::new());
        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());
    }

    #[tokio::test]
    async fn test_vote_claimed_once_across_clones() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);
        let manager = manager(&storage, FakeCryptoEngine::new());
        let other_path = manager.clone();

        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_some());
        assert!(other_path.has_voted(&roster.hash()).unwrap());
        assert!(!other_path.claim_vote(&roster.hash()).unwrap());

        // Nothing was persisted, yet later messages do not produce a second vote.
        assert!(other_path.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());
        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());

        other_path.release_vote(&roster.hash()).unwrap();
        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_some());
    }

    #[tokio::test]
    async fn test_claim_released_below_threshold() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 1);
        let manager = manager(&storage, FakeCryptoEngine::new());

        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());
        assert!(!manager.has_voted(&roster.hash()).unwrap());
    }

    #[tokio::test]
    async fn test_engine_failure_becomes_no_result() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);

        let manager = manager(&storage, FakeCryptoEngine::failing_public_shares());
        assert!(manager.handle_tss_message(&roster.hash(), directory(&roster)).await.is_none());
    }
}
