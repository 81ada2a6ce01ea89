//! Per-node wiring of the TSS components.
//!
//! The host node owns consensus, gossip and persistence ordering; it calls
//! into [`TssService`] at the points where those produce something the TSS
//! layer must react to.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::block_signer::{AggregationSigner, BlockHashSigner, BlockSigningComposer, ProofChainSigner};
use crate::config::Settings;
use crate::error::{TssError, TssResult};
use crate::gossip::{NodeSigner, TssSubmissions};
use crate::roster::{NodeId, Roster};
use crate::storage::{Storage, TssStore};
use crate::tss::cryptography::TssCryptographyManager;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::engine::CryptoEngine;
use crate::tss::keys::TssKeysAccessor;
use crate::tss::signatures::LedgerIdSigner;
use crate::tss::status::{StatusChange, TssStatus, TssStatusManager, choose_roster_for_network};
use crate::tss::types::{TssMessageRecord, TssShareSignatureRecord, TssVoteRecord};

/// TSS layer of a single node.
pub struct TssService {
    self_node_id: NodeId,
    max_shares_per_node: u64,
    key_candidate_roster: bool,
    store: Arc<dyn TssStore>,
    submissions: Arc<dyn TssSubmissions>,
    keys: Arc<TssKeysAccessor>,
    cryptography: TssCryptographyManager,
    status: TssStatusManager,
    ledger_id_signer: Arc<LedgerIdSigner>,
    composer: BlockSigningComposer,
}

impl TssService {
    /// Open the redb store at the configured `TSS_DB_PATH` and wire the
    /// service on top of it.
    pub fn open(
        settings: &Settings,
        engine: Arc<dyn CryptoEngine>,
        node_signer: Arc<dyn NodeSigner>,
        submissions: Arc<dyn TssSubmissions>,
        proof_chain: Option<Arc<dyn ProofChainSigner>>,
    ) -> TssResult<Self> {
        settings.validate().map_err(TssError::InvalidInput)?;
        let store: Arc<dyn TssStore> = Arc::new(Storage::open(settings.db_path())?);
        Self::new(settings, engine, store, node_signer, submissions, proof_chain)
    }

    /// Wire every component from validated `settings`.
    ///
    /// `proof_chain` is only used when the history signer is enabled.
    pub fn new(
        settings: &Settings,
        engine: Arc<dyn CryptoEngine>,
        store: Arc<dyn TssStore>,
        node_signer: Arc<dyn NodeSigner>,
        submissions: Arc<dyn TssSubmissions>,
        proof_chain: Option<Arc<dyn ProofChainSigner>>,
    ) -> TssResult<Self> {
        settings.validate().map_err(TssError::InvalidInput)?;
        let self_node_id = settings
            .node_id()
            .ok_or_else(|| TssError::InvalidInput("node id is required".to_string()))?;
        let max_shares_per_node = settings.max_shares_per_node();

        let keys = Arc::new(TssKeysAccessor::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            self_node_id,
            max_shares_per_node,
        ));
        let cryptography = TssCryptographyManager::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            node_signer,
            self_node_id,
        );
        let status = TssStatusManager::new(
            StatusChange::new(
                Arc::clone(&engine),
                Arc::clone(&keys),
                cryptography.clone(),
                self_node_id,
                max_shares_per_node,
            ),
            Arc::clone(&store),
            Arc::clone(&submissions),
        );
        let ledger_id_signer = Arc::new(LedgerIdSigner::new(
            engine,
            Arc::clone(&keys),
            Arc::clone(&submissions),
            settings.sign_with_ledger_id(),
        ));

        let aggregation: Arc<dyn AggregationSigner> = ledger_id_signer.clone();
        let composer = BlockSigningComposer::from_features(settings.features(), Some(aggregation), proof_chain)?;

        tracing::info!(
            node_id = self_node_id,
            max_shares_per_node,
            hints = settings.features().hints,
            history = settings.features().history,
            sign_with_ledger_id = settings.sign_with_ledger_id(),
            key_candidate_roster = settings.key_candidate_roster(),
            "TSS service initialized"
        );

        Ok(Self {
            self_node_id,
            max_shares_per_node,
            key_candidate_roster: settings.key_candidate_roster(),
            store,
            submissions,
            keys,
            cryptography,
            status,
            ledger_id_signer,
            composer,
        })
    }

    /// Run once per consensus round.
    ///
    /// Advances the status machine, then makes the voted ledger id and the
    /// active roster's key material available for signing.
    pub async fn on_round(
        &self,
        active_roster: &Roster,
        candidate_roster: Option<&Roster>,
        is_stake_period_boundary: bool,
        consensus_now: DateTime<Utc>,
    ) -> TssResult<TssStatus> {
        self.ledger_id_signer.set_last_used_consensus_time(consensus_now)?;

        let status = self
            .status
            .manage_tss_status(active_roster, candidate_roster, is_stake_period_boundary, consensus_now)
            .await?;

        if status.ledger_id.is_empty() {
            return Ok(status);
        }

        if self.ledger_id_signer.ledger_id().as_deref() != Some(status.ledger_id.as_slice()) {
            self.ledger_id_signer.set_ledger_id(status.ledger_id.clone())?;
        }

        if !self.keys.is_populated() {
            match self.keys.generate_for_active_roster(active_roster).await {
                Ok(_) => {}
                Err(e @ TssError::InsufficientShares { .. }) => {
                    tracing::debug!(error = %e, "Key material not derivable yet");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(status)
    }

    /// Roster the network should start with after a restart.
    ///
    /// A candidate roster with a winning vote replaces the active one only on
    /// a software upgrade and only with `TSS_KEY_CANDIDATE_ROSTER` enabled.
    pub fn choose_roster_for_network(
        &self,
        is_upgrade: bool,
        active_roster: &Roster,
        candidate_roster: Option<&Roster>,
    ) -> TssResult<Roster> {
        choose_roster_for_network(
            self.key_candidate_roster,
            is_upgrade,
            active_roster,
            candidate_roster,
            self.store.as_ref(),
        )
    }

    /// Persist a message in consensus order and react to it.
    ///
    /// Submits and returns this node's vote if the message completed the
    /// threshold for its target roster.
    pub async fn on_tss_message(
        &self,
        record: &TssMessageRecord,
        target_roster: &Roster,
        consensus_now: DateTime<Utc>,
    ) -> TssResult<Option<TssVoteRecord>> {
        if record.target_roster_hash != target_roster.hash() {
            return Err(TssError::InvalidInput(format!(
                "message targets roster {} but roster {} was supplied",
                record.target_roster_hash,
                target_roster.hash()
            )));
        }

        let directory = Arc::new(ParticipantDirectory::compute(
            target_roster,
            self.self_node_id,
            self.max_shares_per_node,
        )?);

        let sequence = self.store.put_message(record)?;
        tracing::debug!(
            target_roster = %record.target_roster_hash,
            share_index = record.share_index,
            sequence,
            "Persisted TSS message"
        );

        let Some(vote) = self
            .cryptography
            .handle_tss_message(&record.target_roster_hash, directory)
            .await
        else {
            return Ok(None);
        };

        let vote = TssVoteRecord {
            source_roster_hash: record.source_roster_hash.clone(),
            target_roster_hash: record.target_roster_hash.clone(),
            ledger_id: vote.ledger_id.to_bytes(),
            node_signature: vote.signature.to_bytes(),
            vote: vote.vote,
        };
        if let Err(e) = self.submissions.submit_vote(vote.clone(), consensus_now).await {
            self.cryptography.release_vote(&vote.target_roster_hash)?;
            return Err(e);
        }

        tracing::info!(
            node_id = self.self_node_id,
            target_roster = %vote.target_roster_hash,
            "Submitted TSS vote"
        );
        Ok(Some(vote))
    }

    /// Drop key material and pending share signatures of the previous
    /// active roster.
    pub async fn on_active_roster_change(&self) -> TssResult<()> {
        self.keys.reset().await?;
        self.ledger_id_signer.reset_signatures()
    }

    /// Feed a share signature received from the network.
    pub fn on_share_signature(&self, record: &TssShareSignatureRecord) -> TssResult<Option<Vec<u8>>> {
        self.ledger_id_signer.handle_share_signature(record)
    }

    pub fn block_signer(&self) -> &dyn BlockHashSigner {
        &self.composer
    }

    pub fn keys(&self) -> &Arc<TssKeysAccessor> {
        &self.keys
    }

    pub fn status_manager(&self) -> &TssStatusManager {
        &self.status
    }

    pub fn ledger_id_signer(&self) -> &Arc<LedgerIdSigner> {
        &self.ledger_id_signer
    }

    pub fn store(&self) -> &Arc<dyn TssStore> {
        &self.store
    }
}
