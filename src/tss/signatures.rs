//! Ledger signatures from private shares.
//!
//! Every node signs a message hash with each share it owns and broadcasts the
//! share signatures. Once a threshold of verified share signatures for the
//! active roster is collected, they aggregate into the ledger signature.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha384};
use tokio::sync::oneshot;

use crate::block_signer::AggregationSigner;
use crate::error::{TssError, TssResult};
use crate::gossip::TssSubmissions;
use crate::roster::RosterHash;
use crate::tss::engine::CryptoEngine;
use crate::tss::keys::{TssKeys, TssKeysAccessor};
use crate::tss::types::{ShareId, ShareSignature, TssShareSignatureRecord};

/// Aggregated signatures kept around to answer late waiters.
const MAX_COMPLETED: usize = 256;

/// Sign `message_hash` with every private share this node owns.
pub fn sign_with_shares(
    engine: &dyn CryptoEngine,
    keys: &TssKeys,
    message_hash: &[u8],
) -> TssResult<Vec<ShareSignature>> {
    keys.private_shares()
        .iter()
        .map(|share| engine.sign(share, message_hash))
        .collect()
}

// =============================================================================
// Collector
// =============================================================================

/// Roster the shares belong to, and the signed message hash.
type AggregationKey = (RosterHash, Vec<u8>);

#[derive(Default)]
struct PendingAggregation {
    signatures: BTreeMap<ShareId, ShareSignature>,
    waiters: Vec<oneshot::Sender<Vec<u8>>>,
}

#[derive(Default)]
struct CollectorState {
    pending: HashMap<AggregationKey, PendingAggregation>,
    completed: HashMap<AggregationKey, Vec<u8>>,
    completed_order: VecDeque<AggregationKey>,
}

impl CollectorState {
    fn complete(&mut self, key: AggregationKey, signature: Vec<u8>) {
        if self.completed_order.len() >= MAX_COMPLETED
            && let Some(oldest) = self.completed_order.pop_front()
        {
            self.completed.remove(&oldest);
        }
        self.completed_order.push_back(key.clone());
        self.completed.insert(key, signature);
    }

    /// Drop waiters whose receiver is gone, then entries left with nothing.
    fn prune_abandoned(&mut self) {
        self.pending.retain(|_, pending| {
            pending.waiters.retain(|waiter| !waiter.is_closed());
            !pending.waiters.is_empty() || !pending.signatures.is_empty()
        });
    }
}

/// Collects share signatures per `(roster, message hash)` and aggregates each
/// pair once.
pub struct ShareSignatureCollector {
    engine: Arc<dyn CryptoEngine>,
    state: Mutex<CollectorState>,
}

impl ShareSignatureCollector {
    pub fn new(engine: Arc<dyn CryptoEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Add a share signature observed on the network.
    ///
    /// Returns the ledger signature if this record completed the threshold.
    /// Records for another roster, unknown shares, duplicates and signatures
    /// that fail verification are ignored.
    pub fn add(&self, keys: &TssKeys, record: &TssShareSignatureRecord) -> TssResult<Option<Vec<u8>>> {
        if &record.roster_hash != keys.active_roster_hash() {
            tracing::debug!(roster_hash = %record.roster_hash, "Ignoring share signature for inactive roster");
            return Ok(None);
        }

        let directory = keys.directory();
        if directory.owner_of(record.share_index).is_none() {
            tracing::debug!(share_index = record.share_index, "Ignoring share signature for unknown share");
            return Ok(None);
        }

        let signature = ShareSignature::new(record.share_index, record.share_signature.clone());
        if !self
            .engine
            .verify_signature(directory, keys.public_shares(), &signature, &record.message_hash)
        {
            tracing::warn!(
                share_index = record.share_index,
                message_hash = %hex::encode(&record.message_hash),
                "Rejected invalid share signature"
            );
            return Ok(None);
        }

        let mut state = self.state()?;
        let key = (record.roster_hash.clone(), record.message_hash.clone());

        if state.completed.contains_key(&key) {
            return Ok(None);
        }

        let pending = state.pending.entry(key.clone()).or_default();
        if pending.signatures.contains_key(&record.share_index) {
            return Ok(None);
        }
        pending.signatures.insert(record.share_index, signature);

        if pending.signatures.len() < directory.threshold() as usize {
            return Ok(None);
        }

        let signatures: Vec<ShareSignature> = pending.signatures.values().cloned().collect();
        let aggregated = self.engine.aggregate_signatures(&signatures)?;

        if let Some(pending) = state.pending.remove(&key) {
            for waiter in pending.waiters {
                // A dropped receiver just means nobody is waiting anymore.
                let _ = waiter.send(aggregated.clone());
            }
        }
        state.complete(key, aggregated.clone());

        tracing::info!(
            message_hash = %hex::encode(&record.message_hash),
            shares = signatures.len(),
            "Aggregated ledger signature"
        );

        Ok(Some(aggregated))
    }

    /// Receiver resolving with the ledger signature for `message_hash`
    /// under `roster_hash`.
    ///
    /// Dropping the receiver abandons the wait; the next registration prunes
    /// it.
    pub fn wait_for(&self, roster_hash: &RosterHash, message_hash: &[u8]) -> TssResult<oneshot::Receiver<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let key = (roster_hash.clone(), message_hash.to_vec());
        let mut state = self.state()?;
        state.prune_abandoned();

        if let Some(signature) = state.completed.get(&key) {
            let _ = tx.send(signature.clone());
        } else {
            state.pending.entry(key).or_default().waiters.push(tx);
        }
        Ok(rx)
    }

    /// Forget abandoned waiters right away instead of at the next
    /// registration.
    pub fn discard_abandoned(&self) -> TssResult<()> {
        self.state()?.prune_abandoned();
        Ok(())
    }

    /// Drop everything collected so far. Pending waiters resolve with an
    /// error.
    pub fn clear(&self) -> TssResult<()> {
        let mut state = self.state()?;
        let abandoned = state.pending.len();
        *state = CollectorState::default();
        if abandoned > 0 {
            tracing::info!(abandoned, "Cleared pending share signature aggregations");
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    fn state(&self) -> TssResult<std::sync::MutexGuard<'_, CollectorState>> {
        self.state
            .lock()
            .map_err(|e| TssError::Internal(format!("Share signature mutex poisoned: {e}")))
    }
}

// =============================================================================
// Ledger id signer
// =============================================================================

/// Share-aggregation signer backed by this node's TSS key material.
///
/// Ready once key material exists and a ledger id has been voted in; the
/// ledger id is its verification key.
pub struct LedgerIdSigner {
    engine: Arc<dyn CryptoEngine>,
    keys: Arc<TssKeysAccessor>,
    submissions: Arc<dyn TssSubmissions>,
    collector: Arc<ShareSignatureCollector>,
    ledger_id: Mutex<Option<Vec<u8>>>,
    last_used_consensus_time: Mutex<DateTime<Utc>>,
    sign_with_ledger_id: bool,
}

impl LedgerIdSigner {
    /// With `sign_with_ledger_id` off, signatures are SHA-384 digests of the
    /// message instead of aggregated share signatures.
    pub fn new(
        engine: Arc<dyn CryptoEngine>,
        keys: Arc<TssKeysAccessor>,
        submissions: Arc<dyn TssSubmissions>,
        sign_with_ledger_id: bool,
    ) -> Self {
        Self {
            collector: Arc::new(ShareSignatureCollector::new(Arc::clone(&engine))),
            engine,
            keys,
            submissions,
            ledger_id: Mutex::new(None),
            last_used_consensus_time: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
            sign_with_ledger_id,
        }
    }

    pub fn set_ledger_id(&self, ledger_id: Vec<u8>) -> TssResult<()> {
        let mut current = self
            .ledger_id
            .lock()
            .map_err(|e| TssError::Internal(format!("Ledger id mutex poisoned: {e}")))?;
        tracing::info!(ledger_id = %hex::encode(&ledger_id), "Ledger id set");
        *current = Some(ledger_id);
        Ok(())
    }

    pub fn ledger_id(&self) -> Option<Vec<u8>> {
        self.ledger_id.lock().ok().and_then(|id| id.clone())
    }

    /// Consensus time share signatures are submitted after.
    pub fn set_last_used_consensus_time(&self, time: DateTime<Utc>) -> TssResult<()> {
        let mut last = self
            .last_used_consensus_time
            .lock()
            .map_err(|e| TssError::Internal(format!("Consensus time mutex poisoned: {e}")))?;
        if time > *last {
            *last = time;
        }
        Ok(())
    }

    /// Feed a share signature received from the network.
    pub fn handle_share_signature(&self, record: &TssShareSignatureRecord) -> TssResult<Option<Vec<u8>>> {
        let keys = self.keys.keys()?;
        self.collector.add(&keys, record)
    }

    /// Abandon every in-flight aggregation, e.g. when the active roster
    /// changes.
    pub fn reset_signatures(&self) -> TssResult<()> {
        self.collector.clear()
    }

    /// Reserve `count` consecutive nanosecond slots after the last used time.
    fn reserve_consensus_times(&self, count: usize) -> TssResult<Vec<DateTime<Utc>>> {
        let mut last = self
            .last_used_consensus_time
            .lock()
            .map_err(|e| TssError::Internal(format!("Consensus time mutex poisoned: {e}")))?;
        let times: Vec<DateTime<Utc>> = (1..=count as i64)
            .map(|offset| *last + Duration::nanoseconds(offset))
            .collect();
        if let Some(latest) = times.last() {
            *last = *latest;
        }
        Ok(times)
    }

    fn share_signature_future(&self, message_hash: Vec<u8>) -> TssResult<BoxFuture<'static, TssResult<Vec<u8>>>> {
        let keys = self.keys.keys()?;
        let times = self.reserve_consensus_times(keys.private_shares().len())?;
        let roster_hash = keys.active_roster_hash().clone();
        // Registered before any share signature can come back.
        let receiver = self.collector.wait_for(&roster_hash, &message_hash)?;
        let engine = Arc::clone(&self.engine);
        let submissions = Arc::clone(&self.submissions);
        let collector = Arc::clone(&self.collector);

        Ok(Box::pin(async move {
            let submitted = async {
                let hash = message_hash.clone();
                let signatures =
                    tokio::task::spawn_blocking(move || sign_with_shares(engine.as_ref(), &keys, &hash)).await??;

                for (signature, time) in signatures.into_iter().zip(times) {
                    let record = TssShareSignatureRecord {
                        roster_hash: roster_hash.clone(),
                        share_index: signature.share_id,
                        message_hash: message_hash.clone(),
                        share_signature: signature.signature,
                    };
                    submissions.submit_share_signature(record, time).await?;
                }
                Ok::<(), TssError>(())
            }
            .await;

            if let Err(e) = submitted {
                drop(receiver);
                collector.discard_abandoned()?;
                return Err(e);
            }

            receiver
                .await
                .map_err(|_| TssError::Internal("Share signature aggregation abandoned".to_string()))
        }))
    }
}

impl AggregationSigner for LedgerIdSigner {
    fn genesis_verification_key(&self) -> Option<Vec<u8>> {
        if !self.keys.is_populated() {
            return None;
        }
        self.ledger_id()
    }

    fn sign_future(&self, message_hash: &[u8]) -> BoxFuture<'static, TssResult<Vec<u8>>> {
        if !self.sign_with_ledger_id {
            let digest = Sha384::digest(message_hash).to_vec();
            return Box::pin(async move { Ok(digest) });
        }

        match self.share_signature_future(message_hash.to_vec()) {
            Ok(future) => future,
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Roster;
    use crate::storage::Storage;
    use crate::test_support::{FakeCryptoEngine, RecordingSubmissions, seed_genesis_messages};

    async fn keys_for(storage: &Storage, roster: &Roster, node_id: u64) -> Arc<TssKeysAccessor> {
        let accessor = Arc::new(TssKeysAccessor::new(
            Arc::new(FakeCryptoEngine::new()),
            Arc::new(storage.clone()),
            node_id,
            1,
        ));
        accessor.generate_for_active_roster(roster).await.unwrap();
        accessor
    }

    fn record(keys: &TssKeys, signature: ShareSignature, hash: &[u8]) -> TssShareSignatureRecord {
        TssShareSignatureRecord {
            roster_hash: keys.active_roster_hash().clone(),
            share_index: signature.share_id,
            message_hash: hash.to_vec(),
            share_signature: signature.signature,
        }
    }

    #[tokio::test]
    async fn test_collector_aggregates_once_at_threshold() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);
        let engine = FakeCryptoEngine::new();

        // Each node signs with its own share.
        let mut records = Vec::new();
        for node_id in 1..=3 {
            let keys = keys_for(&storage, &roster, node_id).await.keys().unwrap();
            for signature in sign_with_shares(&engine, &keys, b"block").unwrap() {
                records.push(record(&keys, signature, b"block"));
            }
        }

        let keys = keys_for(&storage, &roster, 1).await.keys().unwrap();
        let collector = ShareSignatureCollector::new(Arc::new(engine));
        let waiter = collector.wait_for(&roster.hash(), b"block").unwrap();

        assert!(collector.add(&keys, &records[0]).unwrap().is_none());
        assert!(collector.add(&keys, &records[0]).unwrap().is_none());
        let aggregated = collector.add(&keys, &records[1]).unwrap().unwrap();
        assert!(collector.add(&keys, &records[2]).unwrap().is_none());

        assert_eq!(waiter.await.unwrap(), aggregated);
        let late = collector.wait_for(&roster.hash(), b"block").unwrap();
        assert_eq!(late.await.unwrap(), aggregated);
    }

    #[tokio::test]
    async fn test_collector_prunes_and_clears_waiters() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);
        let engine = FakeCryptoEngine::new();
        let keys = keys_for(&storage, &roster, 1).await.keys().unwrap();
        let collector = ShareSignatureCollector::new(Arc::new(FakeCryptoEngine::new()));

        // A dropped waiter is forgotten.
        drop(collector.wait_for(&roster.hash(), b"dropped").unwrap());
        collector.discard_abandoned().unwrap();
        assert_eq!(collector.pending_count(), 0);

        // The same hash under another roster is a separate aggregation.
        let other_roster = Roster::from_weights([(9, 1)]).hash();
        let stale = collector.wait_for(&other_roster, b"block").unwrap();
        let current = collector.wait_for(&roster.hash(), b"block").unwrap();
        assert_eq!(collector.pending_count(), 2);

        let signature = sign_with_shares(&engine, &keys, b"block").unwrap().remove(0);
        collector.add(&keys, &record(&keys, signature, b"block")).unwrap();
        assert_eq!(collector.pending_count(), 2);

        collector.clear().unwrap();
        assert_eq!(collector.pending_count(), 0);
        assert!(stale.await.is_err());
        assert!(current.await.is_err());
    }

    #[tokio::test]
    async fn test_failed_submission_abandons_wait() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 1);
        let keys = keys_for(&storage, &roster, 1).await;
        let (submissions, _) = RecordingSubmissions::failing();
        let signer = LedgerIdSigner::new(Arc::new(FakeCryptoEngine::new()), keys, Arc::new(submissions), true);

        let result = signer.sign_future(b"block").await;
        assert!(matches!(result, Err(TssError::Submission(_))));
        assert_eq!(signer.collector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_collector_rejects_bad_signatures() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1), (2, 1), (3, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 3);
        let keys = keys_for(&storage, &roster, 1).await.keys().unwrap();
        let collector = ShareSignatureCollector::new(Arc::new(FakeCryptoEngine::new()));

        let forged = record(&keys, ShareSignature::new(2, vec![0; 32]), b"block");
        assert!(collector.add(&keys, &forged).unwrap().is_none());

        let mut unknown = forged.clone();
        unknown.share_index = 99;
        assert!(collector.add(&keys, &unknown).unwrap().is_none());

        let mut stale = forged;
        stale.roster_hash = Roster::from_weights([(9, 1)]).hash();
        assert!(collector.add(&keys, &stale).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_digest_mode_ignores_shares() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1)]);
        seed_genesis_messages(&storage, &roster, 1, 1);
        let keys = keys_for(&storage, &roster, 1).await;
        let (submissions, _) = RecordingSubmissions::new();
        let signer = LedgerIdSigner::new(
            Arc::new(FakeCryptoEngine::new()),
            keys,
            Arc::new(submissions),
            false,
        );

        assert!(signer.genesis_verification_key().is_none());
        signer.set_ledger_id(vec![7; 32]).unwrap();
        assert_eq!(signer.genesis_verification_key(), Some(vec![7; 32]));

        let signature = signer.sign_future(b"block").await.unwrap();
        assert_eq!(signature, Sha384::digest(b"block").to_vec());
    }

    #[tokio::test]
    async fn test_share_signatures_use_consecutive_consensus_times() {
        let storage = Storage::open_memory().unwrap();
        let roster = Roster::from_weights([(1, 1)]);
        seed_genesis_messages(&storage, &roster, 3, 3);
        let accessor = Arc::new(TssKeysAccessor::new(
            Arc::new(FakeCryptoEngine::new()),
            Arc::new(storage.clone()),
            1,
            3,
        ));
        accessor.generate_for_active_roster(&roster).await.unwrap();

        let (submissions, mut share_signatures) = RecordingSubmissions::new();
        let submissions = Arc::new(submissions);
        let signer = Arc::new(LedgerIdSigner::new(
            Arc::new(FakeCryptoEngine::new()),
            accessor,
            submissions.clone(),
            true,
        ));
        let start = DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(100);
        signer.set_last_used_consensus_time(start).unwrap();

        let pending = tokio::spawn(signer.sign_future(b"block"));
        let mut aggregated = None;
        for _ in 0..3 {
            let record = share_signatures.recv().await.unwrap();
            aggregated = aggregated.or(signer.handle_share_signature(&record).unwrap());
        }

        let signature = pending.await.unwrap().unwrap();
        assert_eq!(Some(signature), aggregated);

        let times = submissions.share_signature_times();
        assert_eq!(
            times,
            vec![
                start + Duration::nanoseconds(1),
                start + Duration::nanoseconds(2),
                start + Duration::nanoseconds(3),
            ]
        );
    }
}
