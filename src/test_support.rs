//! Test-only helpers: a deterministic crypto engine, recording submissions and
//! fake sub-signers.
//!
//! The fake engine hashes instead of doing pairing arithmetic. It keeps the
//! properties the TSS flow relies on: messages bind to a directory, every
//! node derives the same public shares and ledger id from the same messages,
//! and share signatures verify only against the matching public share.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::block_signer::{AggregationSigner, ProofChainSigner};
use crate::error::{TssError, TssResult};
use crate::gossip::{NodeSigner, TssSubmissions};
use crate::roster::{NodeId, Roster};
use crate::storage::TssStore;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::engine::CryptoEngine;
use crate::tss::types::{
    AggregatePrivateKey, LedgerPublicKey, NodeSignature, PrivateShare, PublicShare, ShareId,
    ShareSignature, TssMessage, TssMessageRecord, TssShareSignatureRecord, TssVoteRecord,
};

const MESSAGE_TAG: &[u8; 4] = b"tss:";
const MESSAGE_LEN: usize = 4 + 4 + 32;

fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

// =============================================================================
// Crypto engine
// =============================================================================

/// Hash-based stand-in for the pairing engine.
///
/// Message layout: `"tss:" || total_shares (u32 BE) || 32-byte payload`.
#[derive(Default)]
pub struct FakeCryptoEngine {
    counter: AtomicU64,
    fail_public_shares: bool,
}

impl FakeCryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose public share computation always fails.
    pub fn failing_public_shares() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_public_shares: true,
        }
    }

    fn payloads(messages: &[TssMessage]) -> Vec<&[u8]> {
        let mut payloads: Vec<&[u8]> = messages.iter().map(|m| &m.bytes[8..]).collect();
        payloads.sort_unstable();
        payloads
    }

    fn private_key(share_id: ShareId, messages: &[TssMessage]) -> Vec<u8> {
        let id = share_id.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![b"private".as_slice(), id.as_slice()];
        parts.extend(Self::payloads(messages));
        sha256(&parts)
    }

    fn public_key(private_key: &[u8]) -> Vec<u8> {
        sha256(&[b"public".as_slice(), private_key])
    }

    fn require_messages(messages: &[TssMessage]) -> TssResult<()> {
        if messages.is_empty() || messages.iter().any(|m| m.bytes.len() != MESSAGE_LEN) {
            return Err(TssError::Crypto("messages are missing or malformed".to_string()));
        }
        Ok(())
    }
}

impl CryptoEngine for FakeCryptoEngine {
    fn generate_message(
        &self,
        directory: &ParticipantDirectory,
        private_share: Option<&PrivateShare>,
    ) -> TssResult<TssMessage> {
        let nonce = self.counter.fetch_add(1, Ordering::Relaxed).to_be_bytes();
        let payload = match private_share {
            Some(share) => sha256(&[b"reshare".as_slice(), share.key_bytes(), nonce.as_slice()]),
            None => sha256(&[b"genesis".as_slice(), nonce.as_slice()]),
        };

        let mut bytes = Vec::with_capacity(MESSAGE_LEN);
        bytes.extend_from_slice(MESSAGE_TAG);
        bytes.extend_from_slice(&directory.total_shares().to_be_bytes());
        bytes.extend_from_slice(&payload);
        Ok(TssMessage::new(private_share.map_or(0, |s| s.share_id), bytes))
    }

    fn verify_message(&self, directory: &ParticipantDirectory, message: &TssMessage) -> bool {
        message.bytes.len() == MESSAGE_LEN
            && message.bytes.starts_with(MESSAGE_TAG)
            && message.bytes[4..8] == directory.total_shares().to_be_bytes()
    }

    fn decrypt_private_shares(
        &self,
        directory: &ParticipantDirectory,
        messages: &[TssMessage],
    ) -> TssResult<Vec<PrivateShare>> {
        Self::require_messages(messages)?;
        Ok(directory
            .self_share_ids()
            .into_iter()
            .map(|share_id| PrivateShare::new(share_id, Self::private_key(share_id, messages)))
            .collect())
    }

    fn aggregate_private_shares(&self, shares: &[PrivateShare]) -> TssResult<AggregatePrivateKey> {
        let mut sorted: Vec<&PrivateShare> = shares.iter().collect();
        sorted.sort_by_key(|share| share.share_id);
        let mut parts: Vec<&[u8]> = vec![b"aggregate-private".as_slice()];
        parts.extend(sorted.iter().map(|share| share.key_bytes()));
        Ok(AggregatePrivateKey::new(sha256(&parts)))
    }

    fn compute_public_shares(
        &self,
        directory: &ParticipantDirectory,
        messages: &[TssMessage],
    ) -> TssResult<Vec<PublicShare>> {
        if self.fail_public_shares {
            return Err(TssError::Crypto("public share computation failed".to_string()));
        }
        Self::require_messages(messages)?;
        Ok(directory
            .share_ids()
            .into_iter()
            .map(|share_id| {
                PublicShare::new(share_id, Self::public_key(&Self::private_key(share_id, messages)))
            })
            .collect())
    }

    fn aggregate_public_shares(&self, shares: &[PublicShare]) -> TssResult<LedgerPublicKey> {
        let mut sorted: Vec<&PublicShare> = shares.iter().collect();
        sorted.sort_by_key(|share| share.share_id);
        let mut parts: Vec<&[u8]> = vec![b"ledger".as_slice()];
        parts.extend(sorted.iter().map(|share| share.key.as_slice()));
        Ok(LedgerPublicKey::new(sha256(&parts)))
    }

    fn sign(&self, share: &PrivateShare, message: &[u8]) -> TssResult<ShareSignature> {
        let public_key = Self::public_key(share.key_bytes());
        Ok(ShareSignature::new(share.share_id, sha256(&[b"sign".as_slice(), public_key.as_slice(), message])))
    }

    fn verify_signature(
        &self,
        _directory: &ParticipantDirectory,
        public_shares: &[PublicShare],
        signature: &ShareSignature,
        message: &[u8],
    ) -> bool {
        public_shares
            .iter()
            .find(|share| share.share_id == signature.share_id)
            .is_some_and(|share| sha256(&[b"sign".as_slice(), share.key.as_slice(), message]) == signature.signature)
    }

    fn aggregate_signatures(&self, signatures: &[ShareSignature]) -> TssResult<Vec<u8>> {
        let mut sorted: Vec<&ShareSignature> = signatures.iter().collect();
        sorted.sort_by_key(|signature| signature.share_id);
        let mut parts: Vec<&[u8]> = vec![b"aggregate".as_slice()];
        parts.extend(sorted.iter().map(|signature| signature.signature.as_slice()));
        Ok(sha256(&parts))
    }
}

/// Persist `count` genesis messages for `roster`, with share indices `1..=count`.
pub fn seed_genesis_messages(
    store: &dyn TssStore,
    roster: &Roster,
    max_shares_per_node: u64,
    count: u32,
) -> Vec<TssMessageRecord> {
    let self_node_id = roster.entries().first().map_or(0, |entry| entry.node_id);
    let directory = ParticipantDirectory::compute(roster, self_node_id, max_shares_per_node)
        .expect("roster must own shares");
    let engine = FakeCryptoEngine::new();
    let roster_hash = roster.hash();

    (1..=count)
        .map(|share_index| {
            let message = engine
                .generate_message(&directory, None)
                .expect("fake engine never fails to generate");
            let record = TssMessageRecord {
                source_roster_hash: roster_hash.clone(),
                target_roster_hash: roster_hash.clone(),
                share_index,
                message: message.bytes,
            };
            store.put_message(&record).expect("failed to seed message");
            record
        })
        .collect()
}

// =============================================================================
// Node signing and submissions
// =============================================================================

/// Node signer that hashes the node id with the message.
pub struct FakeNodeSigner {
    node_id: NodeId,
}

impl FakeNodeSigner {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

impl NodeSigner for FakeNodeSigner {
    fn sign(&self, message: &[u8]) -> TssResult<NodeSignature> {
        Ok(NodeSignature::new(sha256(&[self.node_id.to_be_bytes().as_slice(), message])))
    }
}

/// Records every submission. Share signatures are also forwarded to a channel
/// so tests can feed them back into a signer.
pub struct RecordingSubmissions {
    messages: Mutex<Vec<(TssMessageRecord, DateTime<Utc>)>>,
    votes: Mutex<Vec<(TssVoteRecord, DateTime<Utc>)>>,
    share_signatures: Mutex<Vec<(TssShareSignatureRecord, DateTime<Utc>)>>,
    share_signature_tx: mpsc::UnboundedSender<TssShareSignatureRecord>,
    fail: bool,
    fail_share_once: Mutex<Option<ShareId>>,
}

impl RecordingSubmissions {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TssShareSignatureRecord>) {
        Self::build(false, None)
    }

    /// Submissions that record nothing and always fail.
    pub fn failing() -> (Self, mpsc::UnboundedReceiver<TssShareSignatureRecord>) {
        Self::build(true, None)
    }

    /// The first message submitted for `share_index` fails; everything else
    /// is recorded.
    pub fn failing_once_for_share(share_index: ShareId) -> (Self, mpsc::UnboundedReceiver<TssShareSignatureRecord>) {
        Self::build(false, Some(share_index))
    }

    fn build(
        fail: bool,
        fail_share_once: Option<ShareId>,
    ) -> (Self, mpsc::UnboundedReceiver<TssShareSignatureRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let submissions = Self {
            messages: Mutex::new(Vec::new()),
            votes: Mutex::new(Vec::new()),
            share_signatures: Mutex::new(Vec::new()),
            share_signature_tx: tx,
            fail,
            fail_share_once: Mutex::new(fail_share_once),
        };
        (submissions, rx)
    }

    pub fn messages(&self) -> Vec<TssMessageRecord> {
        self.messages.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn votes(&self) -> Vec<TssVoteRecord> {
        self.votes.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn share_signature_times(&self) -> Vec<DateTime<Utc>> {
        self.share_signatures.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    fn result(&self) -> BoxFuture<'static, TssResult<()>> {
        let result = if self.fail {
            Err(TssError::Submission("gossip unavailable".to_string()))
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn take_share_failure(&self, share_index: ShareId) -> bool {
        let mut fail_share = self.fail_share_once.lock().unwrap();
        if *fail_share == Some(share_index) {
            *fail_share = None;
            return true;
        }
        false
    }
}

impl TssSubmissions for RecordingSubmissions {
    fn submit_message(
        &self,
        record: TssMessageRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        if self.take_share_failure(record.share_index) {
            let share_index = record.share_index;
            return Box::pin(async move {
                Err(TssError::Submission(format!("message for share {share_index} dropped")))
            });
        }
        if !self.fail {
            self.messages.lock().unwrap().push((record, consensus_time));
        }
        self.result()
    }

    fn submit_vote(
        &self,
        record: TssVoteRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        if !self.fail {
            self.votes.lock().unwrap().push((record, consensus_time));
        }
        self.result()
    }

    fn submit_share_signature(
        &self,
        record: TssShareSignatureRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        if !self.fail {
            let _ = self.share_signature_tx.send(record.clone());
            self.share_signatures.lock().unwrap().push((record, consensus_time));
        }
        self.result()
    }
}

/// Submissions that land straight in a shared store, as if consensus had
/// already ordered them.
pub struct StoreSubmissions {
    store: Arc<dyn TssStore>,
    node_id: NodeId,
    share_signature_tx: mpsc::UnboundedSender<TssShareSignatureRecord>,
}

impl StoreSubmissions {
    pub fn new(
        store: Arc<dyn TssStore>,
        node_id: NodeId,
        share_signature_tx: mpsc::UnboundedSender<TssShareSignatureRecord>,
    ) -> Self {
        Self {
            store,
            node_id,
            share_signature_tx,
        }
    }
}

impl TssSubmissions for StoreSubmissions {
    fn submit_message(
        &self,
        record: TssMessageRecord,
        _consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        let result = self.store.put_message(&record).map(|_| ());
        Box::pin(async move { result })
    }

    fn submit_vote(
        &self,
        record: TssVoteRecord,
        _consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        let result = self.store.put_vote(self.node_id, &record);
        Box::pin(async move { result })
    }

    fn submit_share_signature(
        &self,
        record: TssShareSignatureRecord,
        _consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>> {
        let result = self
            .share_signature_tx
            .send(record)
            .map_err(|e| TssError::Submission(format!("share signature channel closed: {e}")));
        Box::pin(async move { result })
    }
}

// =============================================================================
// Sub-signers
// =============================================================================

/// Aggregation signer with a fixed verification key and signature.
pub struct FakeAggregationSigner {
    verification_key: Mutex<Option<Vec<u8>>>,
    signature: Vec<u8>,
}

impl FakeAggregationSigner {
    pub fn new(verification_key: Option<Vec<u8>>, signature: Vec<u8>) -> Self {
        Self {
            verification_key: Mutex::new(verification_key),
            signature,
        }
    }

    pub fn set_verification_key(&self, verification_key: Option<Vec<u8>>) {
        *self.verification_key.lock().unwrap() = verification_key;
    }
}

impl AggregationSigner for FakeAggregationSigner {
    fn genesis_verification_key(&self) -> Option<Vec<u8>> {
        self.verification_key.lock().unwrap().clone()
    }

    fn sign_future(&self, _message: &[u8]) -> BoxFuture<'static, TssResult<Vec<u8>>> {
        let signature = self.signature.clone();
        Box::pin(async move { Ok(signature) })
    }
}

/// Proof-chain signer over a fixed genesis address book.
///
/// Signers are recorded per metadata; the proof for some metadata exists once
/// anyone signed with it.
pub struct FakeProofChainSigner {
    has_verification_keys: bool,
    address_book: BTreeMap<NodeId, u64>,
    signers: Mutex<BTreeMap<Vec<u8>, BTreeSet<NodeId>>>,
    proof: Vec<u8>,
}

impl FakeProofChainSigner {
    pub fn new(has_verification_keys: bool, address_book: BTreeMap<NodeId, u64>, proof: Vec<u8>) -> Self {
        Self {
            has_verification_keys,
            address_book,
            signers: Mutex::new(BTreeMap::new()),
            proof,
        }
    }

    pub fn add_signer(&self, metadata: &[u8], node_id: NodeId) {
        self.signers
            .lock()
            .unwrap()
            .entry(metadata.to_vec())
            .or_default()
            .insert(node_id);
    }
}

impl ProofChainSigner for FakeProofChainSigner {
    fn has_genesis_verification_keys(&self) -> bool {
        self.has_verification_keys
    }

    fn genesis_address_book_weights(&self) -> BTreeMap<NodeId, u64> {
        self.address_book.clone()
    }

    fn genesis_signers(&self, metadata: &[u8]) -> BTreeSet<NodeId> {
        self.signers.lock().unwrap().get(metadata).cloned().unwrap_or_default()
    }

    fn genesis_proof(&self, metadata: &[u8]) -> Option<Vec<u8>> {
        self.signers
            .lock()
            .unwrap()
            .contains_key(metadata)
            .then(|| self.proof.clone())
    }
}
