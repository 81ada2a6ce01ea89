//! Keying status state machine.
//!
//! Each consensus round the node collects what the store knows about the
//! roster being keyed, computes its next status and the records it still has
//! to submit, then broadcasts them. A node submits one message per share and
//! one vote per target roster; only submissions that failed are retried.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{TssError, TssResult};
use crate::gossip::TssSubmissions;
use crate::roster::{NodeId, Roster, RosterHash};
use crate::storage::TssStore;
use crate::tss::cryptography::TssCryptographyManager;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::engine::CryptoEngine;
use crate::tss::keys::TssKeysAccessor;
use crate::tss::types::{ShareId, TssMessage, TssMessageRecord, TssVoteRecord};
use crate::tss::validation::{is_vote_threshold_met, validate_messages, winning_vote};

// =============================================================================
// Status types
// =============================================================================

/// Progress of keying the roster selected by [`RosterToKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TssKeyingStatus {
    WaitingForEncryptionKeys,
    WaitingForThresholdTssMessages,
    WaitingForThresholdTssVotes,
    KeyingComplete,
}

/// Which roster is currently being keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterToKey {
    ActiveRoster,
    CandidateRoster,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TssStatus {
    pub keying_status: TssKeyingStatus,
    pub roster_to_key: RosterToKey,
    /// Empty until a ledger id has been voted in.
    pub ledger_id: Vec<u8>,
}

impl TssStatus {
    pub fn new(keying_status: TssKeyingStatus, roster_to_key: RosterToKey, ledger_id: Vec<u8>) -> Self {
        Self {
            keying_status,
            roster_to_key,
            ledger_id,
        }
    }
}

/// Snapshot of the store taken before a status computation.
#[derive(Debug, Clone)]
pub struct RosterAndTssInfo {
    pub active_roster: Roster,
    pub active_roster_hash: RosterHash,
    pub candidate_roster: Option<Roster>,
    /// Empty when no roster is being keyed.
    pub target_roster_hash: RosterHash,
    pub tss_messages: Vec<TssMessageRecord>,
    pub winning_vote: Option<TssVoteRecord>,
    pub encryption_keys_count: usize,
    pub self_vote: Option<TssVoteRecord>,
}

/// Shares whose message this node already handed off for the current target.
///
/// Votes are tracked by [`TssCryptographyManager`] instead, shared with the
/// message-arrival path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SentMessages {
    pub share_ids: BTreeSet<ShareId>,
}

impl SentMessages {
    pub fn contains(&self, share_id: ShareId) -> bool {
        self.share_ids.contains(&share_id)
    }
}

/// A record the node must broadcast as a result of a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSubmission {
    Message(TssMessageRecord),
    Vote(TssVoteRecord),
}

/// Outcome of one status computation.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub status: TssStatus,
    pub submissions: Vec<PendingSubmission>,
    pub sent: SentMessages,
}

// =============================================================================
// Store reads
// =============================================================================

/// Status a node starts from after a restart or reconnect.
pub fn initial_status(
    store: &dyn TssStore,
    active_roster: &Roster,
    candidate_roster: Option<&Roster>,
) -> TssResult<TssStatus> {
    let active_hash = active_roster.hash();

    let Some(active_vote) = winning_vote(active_roster, &active_hash, store)? else {
        return Ok(TssStatus::new(
            TssKeyingStatus::WaitingForThresholdTssMessages,
            RosterToKey::ActiveRoster,
            Vec::new(),
        ));
    };

    if let Some(candidate) = candidate_roster {
        let status = match winning_vote(active_roster, &candidate.hash(), store)? {
            Some(candidate_vote) => TssStatus::new(
                TssKeyingStatus::KeyingComplete,
                RosterToKey::None,
                candidate_vote.ledger_id,
            ),
            None => TssStatus::new(
                TssKeyingStatus::WaitingForThresholdTssMessages,
                RosterToKey::CandidateRoster,
                active_vote.ledger_id,
            ),
        };
        return Ok(status);
    }

    Ok(TssStatus::new(
        TssKeyingStatus::KeyingComplete,
        RosterToKey::ActiveRoster,
        active_vote.ledger_id,
    ))
}

/// Hash of the roster `status` is keying; empty when there is none.
pub fn target_roster_hash(
    active_roster: &Roster,
    candidate_roster: Option<&Roster>,
    status: &TssStatus,
) -> RosterHash {
    match status.roster_to_key {
        RosterToKey::ActiveRoster => active_roster.hash(),
        RosterToKey::CandidateRoster => candidate_roster.map(Roster::hash).unwrap_or_default(),
        RosterToKey::None => RosterHash::empty(),
    }
}

/// Gather everything a status computation reads from the store.
pub fn collect_info(
    store: &dyn TssStore,
    self_node_id: NodeId,
    active_roster: &Roster,
    candidate_roster: Option<&Roster>,
    status: &TssStatus,
) -> TssResult<RosterAndTssInfo> {
    let target = target_roster_hash(active_roster, candidate_roster, status);

    let mut encryption_keys_count = 0;
    for entry in active_roster.entries() {
        if store.encryption_key(entry.node_id)?.is_some() {
            encryption_keys_count += 1;
        }
    }

    let (tss_messages, winning, self_vote) = if target.is_empty() {
        (Vec::new(), None, None)
    } else {
        (
            store.messages_for_target(&target)?,
            winning_vote(active_roster, &target, store)?,
            store.vote(self_node_id, &target)?,
        )
    };

    Ok(RosterAndTssInfo {
        active_roster: active_roster.clone(),
        active_roster_hash: active_roster.hash(),
        candidate_roster: candidate_roster.cloned(),
        target_roster_hash: target,
        tss_messages,
        winning_vote: winning,
        encryption_keys_count,
        self_vote,
    })
}

/// Roster the network should run with after a restart.
///
/// On a software upgrade with candidate keying enabled, a candidate roster
/// that won a vote from the active roster replaces it.
pub fn choose_roster_for_network(
    key_candidate_roster: bool,
    is_upgrade: bool,
    active_roster: &Roster,
    candidate_roster: Option<&Roster>,
    store: &dyn TssStore,
) -> TssResult<Roster> {
    if !key_candidate_roster || !is_upgrade {
        return Ok(active_roster.clone());
    }

    if let Some(candidate) = candidate_roster {
        let candidate_hash = candidate.hash();
        if winning_vote(active_roster, &candidate_hash, store)?.is_some() {
            tracing::info!(roster_hash = %candidate_hash, "Adopting voted candidate roster");
            return Ok(candidate.clone());
        }
    }

    Ok(active_roster.clone())
}

// =============================================================================
// Status computation
// =============================================================================

/// Pure status computation; everything it needs is passed in or shared.
#[derive(Clone)]
pub struct StatusChange {
    engine: Arc<dyn CryptoEngine>,
    keys: Arc<TssKeysAccessor>,
    cryptography: TssCryptographyManager,
    self_node_id: NodeId,
    max_shares_per_node: u64,
}

impl StatusChange {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        keys: Arc<TssKeysAccessor>,
        cryptography: TssCryptographyManager,
        self_node_id: NodeId,
        max_shares_per_node: u64,
    ) -> Self {
        Self {
            engine,
            keys,
            cryptography,
            self_node_id,
            max_shares_per_node,
        }
    }

    /// Next status from `current`, plus the records this node must submit.
    ///
    /// Performs no I/O beyond reading the key material cache and the vote
    /// claims; submission is left to the caller.
    pub fn compute_new_status(
        &self,
        current: &TssStatus,
        sent: SentMessages,
        is_stake_period_boundary: bool,
        info: &RosterAndTssInfo,
    ) -> TssResult<StatusTransition> {
        let mut next = StatusTransition {
            status: current.clone(),
            submissions: Vec::new(),
            sent,
        };

        if current.roster_to_key == RosterToKey::None {
            if is_stake_period_boundary {
                next.status.roster_to_key = RosterToKey::CandidateRoster;
                next.status.keying_status = TssKeyingStatus::WaitingForThresholdTssMessages;
            }
            return Ok(next);
        }

        match current.keying_status {
            TssKeyingStatus::KeyingComplete => {
                next.status.roster_to_key = RosterToKey::None;
                next.sent = SentMessages::default();
            }
            TssKeyingStatus::WaitingForEncryptionKeys => {
                let roster_size = info.active_roster.len() as u64;
                if info.encryption_keys_count as u64 >= 2 * roster_size / 3 {
                    next.status.keying_status = TssKeyingStatus::WaitingForThresholdTssMessages;
                }
            }
            TssKeyingStatus::WaitingForThresholdTssMessages => {
                let Some(directory) = self.target_directory(current.roster_to_key, info)? else {
                    tracing::debug!("No candidate roster to key yet");
                    return Ok(next);
                };
                self.validate_messages_and_submit_if_needed(current, &directory, info, &mut next)?;
            }
            TssKeyingStatus::WaitingForThresholdTssVotes => {
                let Some(directory) = self.target_directory(current.roster_to_key, info)? else {
                    return Ok(next);
                };
                self.validate_votes_and_submit_if_needed(&directory, info, &mut next)?;
            }
        }

        Ok(next)
    }

    fn validate_messages_and_submit_if_needed(
        &self,
        current: &TssStatus,
        directory: &ParticipantDirectory,
        info: &RosterAndTssInfo,
        next: &mut StatusTransition,
    ) -> TssResult<()> {
        let messages: Vec<TssMessage> = info.tss_messages.iter().map(TssMessage::from_record).collect();
        let valid = validate_messages(&messages, directory, self.engine.as_ref());

        if is_vote_threshold_met(&valid, directory) {
            next.status.keying_status = TssKeyingStatus::WaitingForThresholdTssVotes;
            return Ok(());
        }

        // Shares already handed off, or already ordered by consensus.
        let persisted: BTreeSet<ShareId> = info
            .tss_messages
            .iter()
            .filter(|record| record.source_roster_hash == info.active_roster_hash)
            .map(|record| record.share_index)
            .collect();
        let pending = |share_id: ShareId| !next.sent.contains(share_id) && !persisted.contains(&share_id);

        let (owned, generated) = match current.roster_to_key {
            // Genesis: a fresh message for every share this node owns.
            RosterToKey::ActiveRoster => {
                let owned = directory.self_share_ids();
                let generated = owned
                    .iter()
                    .filter(|share_id| pending(**share_id))
                    .map(|&share_id| {
                        let message = self.engine.generate_message(directory, None)?;
                        Ok((share_id, message))
                    })
                    .collect::<TssResult<Vec<_>>>()?;
                (owned.len(), generated)
            }
            // Rekey: re-share every private share held for the active roster.
            RosterToKey::CandidateRoster => {
                let keys = self.keys.keys()?;
                let generated = keys
                    .private_shares()
                    .iter()
                    .filter(|share| pending(share.share_id))
                    .map(|share| {
                        let message = self.engine.generate_message(directory, Some(share))?;
                        Ok((share.share_id, message))
                    })
                    .collect::<TssResult<Vec<_>>>()?;
                (keys.private_shares().len(), generated)
            }
            RosterToKey::None => (0, Vec::new()),
        };

        if owned == 0 {
            tracing::debug!(
                node_id = self.self_node_id,
                "Node owns no shares of the target roster; nothing to submit"
            );
            return Ok(());
        }

        for (share_index, message) in generated {
            next.sent.share_ids.insert(share_index);
            next.submissions.push(PendingSubmission::Message(TssMessageRecord {
                source_roster_hash: info.active_roster_hash.clone(),
                target_roster_hash: info.target_roster_hash.clone(),
                share_index,
                message: message.bytes,
            }));
        }
        Ok(())
    }

    fn validate_votes_and_submit_if_needed(
        &self,
        directory: &ParticipantDirectory,
        info: &RosterAndTssInfo,
        next: &mut StatusTransition,
    ) -> TssResult<()> {
        if let Some(vote) = &info.winning_vote {
            next.status.keying_status = TssKeyingStatus::KeyingComplete;
            next.status.ledger_id = vote.ledger_id.clone();
            return Ok(());
        }
        if info.self_vote.is_some() || self.cryptography.has_voted(&info.target_roster_hash)? {
            return Ok(());
        }

        if let Some(vote) = self.cryptography.get_vote(&info.tss_messages, directory)? {
            next.submissions.push(PendingSubmission::Vote(TssVoteRecord {
                source_roster_hash: info.active_roster_hash.clone(),
                target_roster_hash: info.target_roster_hash.clone(),
                ledger_id: vote.ledger_id.to_bytes(),
                node_signature: vote.signature.to_bytes(),
                vote: vote.vote,
            }));
        }
        Ok(())
    }

    fn target_directory(
        &self,
        roster_to_key: RosterToKey,
        info: &RosterAndTssInfo,
    ) -> TssResult<Option<Arc<ParticipantDirectory>>> {
        let roster = match roster_to_key {
            RosterToKey::ActiveRoster => {
                if let Ok(keys) = self.keys.keys()
                    && keys.active_roster_hash() == &info.active_roster_hash
                {
                    return Ok(Some(Arc::clone(keys.directory())));
                }
                &info.active_roster
            }
            RosterToKey::CandidateRoster => match &info.candidate_roster {
                Some(candidate) => candidate,
                None => return Ok(None),
            },
            RosterToKey::None => return Ok(None),
        };

        let directory = ParticipantDirectory::compute(roster, self.self_node_id, self.max_shares_per_node)?;
        Ok(Some(Arc::new(directory)))
    }
}

// =============================================================================
// Status manager
// =============================================================================

struct StatusState {
    status: Option<TssStatus>,
    sent: SentMessages,
}

/// Drives the status machine once per consensus round.
pub struct TssStatusManager {
    change: StatusChange,
    store: Arc<dyn TssStore>,
    submissions: Arc<dyn TssSubmissions>,
    state: Mutex<StatusState>,
}

impl TssStatusManager {
    pub fn new(change: StatusChange, store: Arc<dyn TssStore>, submissions: Arc<dyn TssSubmissions>) -> Self {
        Self {
            change,
            store,
            submissions,
            state: Mutex::new(StatusState {
                status: None,
                sent: SentMessages::default(),
            }),
        }
    }

    /// Advance the status machine for this round.
    ///
    /// Concurrent calls serialize. Failed submissions are logged and retried
    /// on a later round.
    pub async fn manage_tss_status(
        &self,
        active_roster: &Roster,
        candidate_roster: Option<&Roster>,
        is_stake_period_boundary: bool,
        consensus_now: DateTime<Utc>,
    ) -> TssResult<TssStatus> {
        let mut state = self.state.lock().await;

        let current = match &state.status {
            Some(status) => status.clone(),
            None => {
                let status = initial_status(self.store.as_ref(), active_roster, candidate_roster)?;
                tracing::info!(?status, "Computed initial TSS status");
                state.status = Some(status.clone());
                status
            }
        };

        let info = collect_info(
            self.store.as_ref(),
            self.change.self_node_id,
            active_roster,
            candidate_roster,
            &current,
        )?;

        let change = self.change.clone();
        let sent = state.sent.clone();
        let from = current.clone();
        let transition = tokio::task::spawn_blocking(move || {
            change.compute_new_status(&from, sent, is_stake_period_boundary, &info)
        })
        .await??;

        let cryptography = &self.change.cryptography;
        let mut sent = transition.sent;
        for submission in transition.submissions {
            match submission {
                PendingSubmission::Message(record) => {
                    let share_index = record.share_index;
                    if let Err(e) = self.submissions.submit_message(record, consensus_now).await {
                        tracing::error!(error = %e, share_index, "Failed to submit TSS message");
                        sent.share_ids.remove(&share_index);
                    }
                }
                PendingSubmission::Vote(record) => {
                    let target = record.target_roster_hash.clone();
                    if !cryptography.claim_vote(&target)? {
                        tracing::debug!(target_roster = %target, "Vote already submitted for target roster");
                        continue;
                    }
                    if let Err(e) = self.submissions.submit_vote(record, consensus_now).await {
                        tracing::error!(error = %e, target_roster = %target, "Failed to submit TSS vote");
                        cryptography.release_vote(&target)?;
                    }
                }
            }
        }

        if transition.status != current {
            tracing::info!(from = ?current, to = ?transition.status, "TSS status changed");
        }
        state.status = Some(transition.status.clone());
        state.sent = sent;

        Ok(transition.status)
    }

    /// Last computed status, if any round has run.
    pub async fn status(&self) -> Option<TssStatus> {
        self.state.lock().await.status.clone()
    }

    pub async fn sent_messages(&self) -> SentMessages {
        self.state.lock().await.sent.clone()
    }

    /// Override the status, e.g. when restoring from a saved state.
    pub async fn set_status(&self, status: TssStatus) {
        self.state.lock().await.status = Some(status);
    }

    /// The ledger id once keying completed, else `NotReady`.
    pub async fn ledger_id(&self) -> TssResult<Vec<u8>> {
        match self.status().await {
            Some(status) if !status.ledger_id.is_empty() => Ok(status.ledger_id),
            _ => Err(TssError::NotReady("ledger id has not been voted in".to_string())),
        }
    }
}
