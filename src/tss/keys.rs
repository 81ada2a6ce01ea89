//! Key material cache for the active roster.
//!
//! Decrypting private shares is expensive and every caller must see the same
//! result, so the snapshot is computed at most once per active roster and
//! swapped in atomically. Until then every accessor reports `NotInitialized`.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use crate::error::{TssError, TssResult};
use crate::roster::{NodeId, Roster, RosterHash};
use crate::storage::TssStore;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::engine::CryptoEngine;
use crate::tss::types::{PrivateShare, PublicShare, TssMessage};
use crate::tss::validation::{is_vote_threshold_met, validate_messages};

/// Immutable key material for one active roster.
#[derive(Debug)]
pub struct TssKeys {
    active_roster_hash: RosterHash,
    directory: Arc<ParticipantDirectory>,
    private_shares: Vec<PrivateShare>,
    public_shares: Vec<PublicShare>,
    total_shares: u32,
}

impl TssKeys {
    pub fn active_roster_hash(&self) -> &RosterHash {
        &self.active_roster_hash
    }

    pub fn directory(&self) -> &Arc<ParticipantDirectory> {
        &self.directory
    }

    /// Private shares this node owns, ascending by share id.
    pub fn private_shares(&self) -> &[PrivateShare] {
        &self.private_shares
    }

    /// Public shares of every participant.
    pub fn public_shares(&self) -> &[PublicShare] {
        &self.public_shares
    }

    pub fn total_shares(&self) -> u32 {
        self.total_shares
    }
}

/// Owner of the single key material slot of a node.
pub struct TssKeysAccessor {
    engine: Arc<dyn CryptoEngine>,
    store: Arc<dyn TssStore>,
    self_node_id: NodeId,
    max_shares_per_node: u64,
    /// Serializes `generate_for_active_roster` and `reset`.
    generation: Mutex<()>,
    current: RwLock<Option<Arc<TssKeys>>>,
}

impl TssKeysAccessor {
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        store: Arc<dyn TssStore>,
        self_node_id: NodeId,
        max_shares_per_node: u64,
    ) -> Self {
        Self {
            engine,
            store,
            self_node_id,
            max_shares_per_node,
            generation: Mutex::new(()),
            current: RwLock::new(None),
        }
    }

    /// Populate the cache for `active_roster`.
    ///
    /// A no-op returning the existing snapshot if already populated; concurrent
    /// callers wait for the first one and share its result.
    pub async fn generate_for_active_roster(&self, active_roster: &Roster) -> TssResult<Arc<TssKeys>> {
        let _guard = self.generation.lock().await;

        if let Some(keys) = self.snapshot()? {
            let requested = active_roster.hash();
            if keys.active_roster_hash != requested {
                tracing::warn!(
                    cached_roster = %keys.active_roster_hash,
                    requested_roster = %requested,
                    "Key material cached for a different roster; reset() was not called"
                );
            }
            return Ok(keys);
        }

        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let roster = active_roster.clone();
        let self_node_id = self.self_node_id;
        let max_shares_per_node = self.max_shares_per_node;

        let keys = tokio::task::spawn_blocking(move || {
            compute_keys(
                engine.as_ref(),
                store.as_ref(),
                &roster,
                self_node_id,
                max_shares_per_node,
            )
        })
        .await??;

        let keys = Arc::new(keys);
        {
            let mut current = self
                .current
                .write()
                .map_err(|e| TssError::Internal(format!("Key material lock poisoned: {e}")))?;
            *current = Some(Arc::clone(&keys));
        }

        tracing::info!(
            node_id = self.self_node_id,
            roster_hash = %keys.active_roster_hash,
            private_shares = keys.private_shares.len(),
            total_shares = keys.total_shares,
            "Generated key material for active roster"
        );

        Ok(keys)
    }

    /// Drop the cached key material. Call whenever the active roster changes.
    pub async fn reset(&self) -> TssResult<()> {
        let _guard = self.generation.lock().await;
        let previous = self
            .current
            .write()
            .map_err(|e| TssError::Internal(format!("Key material lock poisoned: {e}")))?
            .take();

        if let Some(previous) = previous {
            tracing::info!(roster_hash = %previous.active_roster_hash, "Reset key material");
        }
        Ok(())
    }

    /// The current snapshot.
    pub fn keys(&self) -> TssResult<Arc<TssKeys>> {
        self.snapshot()?
            .ok_or_else(|| TssError::NotInitialized("key material has not been generated".to_string()))
    }

    pub fn directory(&self) -> TssResult<Arc<ParticipantDirectory>> {
        Ok(Arc::clone(&self.keys()?.directory))
    }

    pub fn active_roster_hash(&self) -> TssResult<RosterHash> {
        Ok(self.keys()?.active_roster_hash.clone())
    }

    pub fn is_populated(&self) -> bool {
        matches!(self.snapshot(), Ok(Some(_)))
    }

    fn snapshot(&self) -> TssResult<Option<Arc<TssKeys>>> {
        let current = self
            .current
            .read()
            .map_err(|e| TssError::Internal(format!("Key material lock poisoned: {e}")))?;
        Ok(current.clone())
    }
}

/// Build key material for `roster` from the messages persisted for it.
///
/// Refuses to build from fewer valid messages than the directory threshold,
/// since the shares decrypted from them would be meaningless.
pub fn compute_keys(
    engine: &dyn CryptoEngine,
    store: &dyn TssStore,
    roster: &Roster,
    self_node_id: NodeId,
    max_shares_per_node: u64,
) -> TssResult<TssKeys> {
    let roster_hash = roster.hash();
    let directory = ParticipantDirectory::compute(roster, self_node_id, max_shares_per_node)?;

    let messages: Vec<TssMessage> = store
        .messages_for_target(&roster_hash)?
        .iter()
        .map(TssMessage::from_record)
        .collect();
    let valid = validate_messages(&messages, &directory, engine);

    if !is_vote_threshold_met(&valid, &directory) {
        return Err(TssError::InsufficientShares {
            needed: directory.threshold() as usize,
            have: valid.len(),
        });
    }

    let mut private_shares = engine.decrypt_private_shares(&directory, &valid)?;
    private_shares.sort_by_key(|share| share.share_id);
    let public_shares = engine.compute_public_shares(&directory, &valid)?;

    Ok(TssKeys {
        active_roster_hash: roster_hash,
        total_shares: directory.total_shares(),
        directory: Arc::new(directory),
        private_shares,
        public_shares,
    })
}
