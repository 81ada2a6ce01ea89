//! Participant directory: which node owns which share of a roster's key.
//!
//! Computed once per `(roster, self node id, max shares per node)` and immutable
//! afterwards. Share ids are contiguous from 1, assigned in roster order, so
//! every node in the roster owns zero or more consecutive shares.

use std::collections::BTreeMap;

use crate::error::{TssError, TssResult};
use crate::roster::{NodeId, Roster, RosterEntry};
use crate::tss::types::ShareId;

/// Share ownership and signing threshold for one roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantDirectory {
    self_node_id: NodeId,
    share_owners: BTreeMap<ShareId, NodeId>,
    shares_per_node: BTreeMap<NodeId, u32>,
    threshold: u32,
}

impl ParticipantDirectory {
    /// Compute the directory for `roster` as seen by `self_node_id`.
    ///
    /// The heaviest node gets `max_shares_per_node` shares; everyone else
    /// proportionally fewer, rounded up.
    pub fn compute(
        roster: &Roster,
        self_node_id: NodeId,
        max_shares_per_node: u64,
    ) -> TssResult<Self> {
        if max_shares_per_node == 0 {
            return Err(TssError::InvalidInput(
                "max shares per node must be greater than zero".to_string(),
            ));
        }

        let node_shares = compute_node_shares(roster.entries(), max_shares_per_node);

        let mut share_owners = BTreeMap::new();
        let mut shares_per_node = BTreeMap::new();
        let mut next_share_id: ShareId = 1;
        for entry in roster.entries() {
            let num_shares = node_shares.get(&entry.node_id).copied().unwrap_or(0);
            let num_shares = u32::try_from(num_shares).map_err(|_| {
                TssError::InvalidInput(format!(
                    "node {} would own {num_shares} shares",
                    entry.node_id
                ))
            })?;
            for _ in 0..num_shares {
                share_owners.insert(next_share_id, entry.node_id);
                next_share_id = next_share_id.checked_add(1).ok_or_else(|| {
                    TssError::InvalidInput("share id space exhausted".to_string())
                })?;
            }
            shares_per_node.insert(entry.node_id, num_shares);
        }

        let total_shares = u32::try_from(share_owners.len())
            .map_err(|_| TssError::InvalidInput("too many shares".to_string()))?;
        if total_shares == 0 {
            return Err(TssError::InvalidInput(
                "roster has no weighted nodes to own shares".to_string(),
            ));
        }

        let directory = Self {
            self_node_id,
            share_owners,
            shares_per_node,
            threshold: majority_threshold(total_shares),
        };

        tracing::debug!(
            self_node_id,
            total_shares,
            threshold = directory.threshold,
            owned_shares = directory.self_share_ids().len(),
            "Computed participant directory"
        );

        Ok(directory)
    }

    pub fn self_node_id(&self) -> NodeId {
        self.self_node_id
    }

    /// All share ids, ascending.
    pub fn share_ids(&self) -> Vec<ShareId> {
        self.share_owners.keys().copied().collect()
    }

    pub fn owner_of(&self, share_id: ShareId) -> Option<NodeId> {
        self.share_owners.get(&share_id).copied()
    }

    /// Share ids owned by `node_id`, ascending.
    pub fn share_ids_of(&self, node_id: NodeId) -> Vec<ShareId> {
        self.share_owners
            .iter()
            .filter(|(_, owner)| **owner == node_id)
            .map(|(share_id, _)| *share_id)
            .collect()
    }

    pub fn self_share_ids(&self) -> Vec<ShareId> {
        self.share_ids_of(self.self_node_id)
    }

    pub fn shares_of(&self, node_id: NodeId) -> u32 {
        self.shares_per_node.get(&node_id).copied().unwrap_or(0)
    }

    pub fn total_shares(&self) -> u32 {
        // Bounded by the u32 check in `compute`.
        self.share_owners.len() as u32
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// `(total_shares + 2) / 2`: strictly more than half of all shares.
pub fn majority_threshold(total_shares: u32) -> u32 {
    let threshold = (u64::from(total_shares) + 2) / 2;
    // (u32::MAX + 2) / 2 still fits in u32.
    threshold as u32
}

/// Shares per node: `ceil(max_shares * weight / max_weight)`.
pub fn compute_node_shares(entries: &[RosterEntry], max_shares_per_node: u64) -> BTreeMap<NodeId, u64> {
    let max_weight = entries.iter().map(|entry| entry.weight).max().unwrap_or(0);
    entries
        .iter()
        .map(|entry| {
            let shares = if max_weight == 0 {
                0
            } else {
                let numerator = u128::from(max_shares_per_node) * u128::from(entry.weight);
                let shares = numerator.div_ceil(u128::from(max_weight));
                // weight <= max_weight, so shares <= max_shares_per_node.
                shares as u64
            };
            (entry.node_id, shares)
        })
        .collect()
}
