//! Source/target roster weights and strong-minority thresholds.
//!
//! A strong minority is the smallest weight guaranteed to include at least one
//! honest node when less than a third of the total weight is adversarial.

use std::collections::BTreeMap;

use crate::roster::NodeId;

/// Which side of a roster transition a weight lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSide {
    Source,
    Target,
}

/// Weights of the source and target rosters of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterWeights {
    source: BTreeMap<NodeId, u64>,
    target: BTreeMap<NodeId, u64>,
    source_strong_minority_weight: u64,
    target_strong_minority_weight: u64,
}

impl RosterWeights {
    pub fn new(source: BTreeMap<NodeId, u64>, target: BTreeMap<NodeId, u64>) -> Self {
        let source_strong_minority_weight = strong_minority_weight_for(source.values().copied());
        let target_strong_minority_weight = strong_minority_weight_for(target.values().copied());
        Self {
            source,
            target,
            source_strong_minority_weight,
            target_strong_minority_weight,
        }
    }

    /// Weight of `node_id` in the given roster, 0 if absent.
    pub fn weight_of(&self, node_id: NodeId, side: RosterSide) -> u64 {
        let weights = match side {
            RosterSide::Source => &self.source,
            RosterSide::Target => &self.target,
        };
        weights.get(&node_id).copied().unwrap_or(0)
    }

    pub fn source_weight_of(&self, node_id: NodeId) -> u64 {
        self.weight_of(node_id, RosterSide::Source)
    }

    pub fn target_weight_of(&self, node_id: NodeId) -> u64 {
        self.weight_of(node_id, RosterSide::Target)
    }

    /// Whether the target roster lists `node_id`, even with weight 0.
    pub fn has_target_weight_of(&self, node_id: NodeId) -> bool {
        self.target.contains_key(&node_id)
    }

    pub fn source_strong_minority_weight(&self) -> u64 {
        self.source_strong_minority_weight
    }

    pub fn target_strong_minority_weight(&self) -> u64 {
        self.target_strong_minority_weight
    }

    pub fn num_target_nodes(&self) -> usize {
        self.target.len()
    }

    /// Total target weight of `signers`, counting each node once.
    pub fn target_weight_of_signers(&self, signers: impl IntoIterator<Item = NodeId>) -> u64 {
        let mut seen = std::collections::BTreeSet::new();
        signers
            .into_iter()
            .filter(|node_id| seen.insert(*node_id))
            .fold(0u64, |total, node_id| {
                total.saturating_add(self.target_weight_of(node_id))
            })
    }

    /// Whether `signers` carry at least a strong minority of the target weight.
    pub fn is_target_strong_minority(&self, signers: impl IntoIterator<Item = NodeId>) -> bool {
        self.target_weight_of_signers(signers) >= self.target_strong_minority_weight
    }
}

/// `(total + 2) / 3`: the total weight divided by three, rounded up.
pub fn strong_minority_weight_for(weights: impl IntoIterator<Item = u64>) -> u64 {
    let total: u128 = weights.into_iter().map(u128::from).sum();
    u64::try_from((total + 2) / 3).unwrap_or(u64::MAX)
}

/// Whether `weight` reaches a strong minority of `total_weight`.
pub fn has_met_weight_threshold(weight: u64, total_weight: u64) -> bool {
    weight >= strong_minority_weight_for([total_weight])
}
