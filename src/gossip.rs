//! Node signing and transaction submission capabilities.
//!
//! The gossip transport itself lives outside this crate. The TSS subsystem
//! only needs to sign bytes with the node's long-term key and hand records to
//! something that broadcasts them at a given consensus time.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use futures_util::future::BoxFuture;

use crate::error::{TssError, TssResult};
use crate::tss::types::{NodeSignature, TssMessageRecord, TssShareSignatureRecord, TssVoteRecord};

/// Signs with this node's long-term gossip key.
pub trait NodeSigner: Send + Sync {
    fn sign(&self, message: &[u8]) -> TssResult<NodeSignature>;
}

/// Ed25519 node signer.
pub struct Ed25519NodeSigner {
    signing_key: SigningKey,
}

impl Ed25519NodeSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl NodeSigner for Ed25519NodeSigner {
    fn sign(&self, message: &[u8]) -> TssResult<NodeSignature> {
        let signature = self.signing_key.sign(message);
        Ok(NodeSignature::new(signature.to_bytes().to_vec()))
    }
}

/// Verify an Ed25519 node signature.
pub fn verify_node_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &NodeSignature,
) -> TssResult<()> {
    let bytes: [u8; 64] = signature
        .as_bytes()
        .try_into()
        .map_err(|_| TssError::Crypto(format!("Invalid signature length: {}", signature.as_bytes().len())))?;
    let signature = ed25519_dalek::Signature::from_bytes(&bytes);
    verifying_key
        .verify(message, &signature)
        .map_err(|e| TssError::Crypto(format!("Node signature verification failed: {e}")))
}

/// Broadcasts TSS records to the network.
///
/// Each call resolves once the record has been handed off; delivery and
/// retries are the transport's concern.
pub trait TssSubmissions: Send + Sync {
    fn submit_message(
        &self,
        record: TssMessageRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>>;

    fn submit_vote(
        &self,
        record: TssVoteRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>>;

    fn submit_share_signature(
        &self,
        record: TssShareSignatureRecord,
        consensus_time: DateTime<Utc>,
    ) -> BoxFuture<'static, TssResult<()>>;
}
