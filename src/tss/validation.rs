//! Message validation and the two threshold rules.
//!
//! Messages count by share: a target roster is keyed once a strict majority of
//! its directory's shares carry a valid message. Votes count by node weight: a
//! ledger id wins once voters holding a strong minority of the voting roster's
//! weight agree on the same vote.

use std::collections::{HashMap, HashSet};

use crate::error::TssResult;
use crate::roster::{NodeId, Roster, RosterHash};
use crate::storage::TssStore;
use crate::tss::directory::{ParticipantDirectory, majority_threshold};
use crate::tss::engine::CryptoEngine;
use crate::tss::types::{TssMessage, TssVoteRecord, VoteBitSet};
use crate::weights::has_met_weight_threshold;

/// Keep the messages the engine accepts for `directory`, in input order.
///
/// Only the first valid message per share index counts; later ones for the
/// same share are dropped.
pub fn validate_messages(
    messages: &[TssMessage],
    directory: &ParticipantDirectory,
    engine: &dyn CryptoEngine,
) -> Vec<TssMessage> {
    let mut seen = HashSet::new();
    let valid: Vec<TssMessage> = messages
        .iter()
        .filter(|message| engine.verify_message(directory, message))
        .filter(|message| seen.insert(message.share_id))
        .cloned()
        .collect();

    if valid.len() < messages.len() {
        tracing::debug!(
            received = messages.len(),
            valid = valid.len(),
            "Dropped invalid or duplicate TSS messages"
        );
    }

    valid
}

/// Whether `valid_messages` cover a strict majority of the directory's shares.
pub fn is_vote_threshold_met(valid_messages: &[TssMessage], directory: &ParticipantDirectory) -> bool {
    let needed = majority_threshold(directory.total_shares()) as usize;
    valid_messages.len() >= needed
}

/// Bit set with one bit per contributing share index.
pub fn vote_bit_set(valid_messages: &[TssMessage]) -> VoteBitSet {
    let mut bits = VoteBitSet::new();
    for message in valid_messages {
        bits.set(message.share_id);
    }
    bits
}

/// First vote backed by a strong minority of `voting_roster`'s weight.
///
/// Voters are visited in roster order; votes are grouped by identical bit
/// set and a group wins as soon as its accumulated weight reaches the
/// threshold.
pub fn tally_votes<'a>(
    voting_roster: &Roster,
    votes: impl IntoIterator<Item = (NodeId, &'a TssVoteRecord)>,
) -> Option<&'a TssVoteRecord> {
    let total_weight = voting_roster.total_weight();
    let mut by_voter: HashMap<NodeId, &'a TssVoteRecord> = votes.into_iter().collect();
    let mut tally: HashMap<&'a VoteBitSet, u64> = HashMap::new();

    for entry in voting_roster.entries() {
        let Some(vote) = by_voter.remove(&entry.node_id) else {
            continue;
        };
        let weight = tally.entry(&vote.vote).or_insert(0);
        *weight = weight.saturating_add(entry.weight);
        if has_met_weight_threshold(*weight, total_weight) {
            return Some(vote);
        }
    }

    None
}

/// Winning vote for `target` among the recorded votes of `voting_roster`'s nodes.
pub fn winning_vote(
    voting_roster: &Roster,
    target: &RosterHash,
    store: &dyn TssStore,
) -> TssResult<Option<TssVoteRecord>> {
    let votes = store.votes_for_target(target)?;
    let winner = tally_votes(voting_roster, votes.iter().map(|(node_id, vote)| (*node_id, vote)));
    Ok(winner.cloned())
}
