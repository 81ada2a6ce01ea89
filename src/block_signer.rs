//! Block hash signing policy.
//!
//! Two optional sub-protocols contribute to a block signature: a
//! share-aggregation signer (produces the signature and owns the verification
//! key) and a proof-chain signer (proves the verification key descends from
//! the genesis address book). Which of them are enabled decides both
//! readiness and the signature layout.
//!
//! Layout when both are enabled: `signature || verification_key || proof`,
//! with no delimiters. Readers split by known segment lengths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha384};

use crate::config::SignerFeatures;
use crate::error::{TssError, TssResult};
use crate::roster::NodeId;
use crate::weights::RosterWeights;

/// Length of the placeholder signature used when no signer produces one.
pub const DIGEST_SIGNATURE_LEN: usize = 48;

/// Block-hash signing interface exposed to the rest of the node.
pub trait BlockHashSigner: Send + Sync {
    /// Side-effect free; may be polled freely.
    fn is_ready(&self) -> bool;

    /// Start signing `block_hash`. Fails with `NotReady` before readiness.
    fn sign_future(&self, block_hash: &[u8]) -> TssResult<BoxFuture<'static, TssResult<Vec<u8>>>>;
}

/// Share-aggregation sub-protocol.
pub trait AggregationSigner: Send + Sync {
    /// Verification key of the completed genesis construction, if any.
    fn genesis_verification_key(&self) -> Option<Vec<u8>>;

    /// Aggregated signature over `message`.
    fn sign_future(&self, message: &[u8]) -> BoxFuture<'static, TssResult<Vec<u8>>>;
}

/// Proof-chain sub-protocol.
pub trait ProofChainSigner: Send + Sync {
    /// Whether verification keys for the whole genesis address book are collated.
    fn has_genesis_verification_keys(&self) -> bool;

    /// Node weights of the genesis address book.
    fn genesis_address_book_weights(&self) -> BTreeMap<NodeId, u64>;

    /// Nodes that signed the genesis address book hash with `metadata`.
    fn genesis_signers(&self, metadata: &[u8]) -> BTreeSet<NodeId>;

    /// Genesis proof over `metadata`, once derivable.
    fn genesis_proof(&self, metadata: &[u8]) -> Option<Vec<u8>>;
}

/// SHA-384 placeholder signature of `block_hash`.
pub fn digest_signature(block_hash: &[u8]) -> Vec<u8> {
    Sha384::digest(block_hash).to_vec()
}

/// `signature || verification_key || proof`.
pub fn assemble_block_signature(signature: &[u8], verification_key: &[u8], proof: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(signature.len() + verification_key.len() + proof.len());
    bytes.extend_from_slice(signature);
    bytes.extend_from_slice(verification_key);
    bytes.extend_from_slice(proof);
    bytes
}

/// Segments of an assembled block signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignatureParts<'a> {
    pub signature: &'a [u8],
    pub verification_key: &'a [u8],
    pub proof: &'a [u8],
}

/// Split an assembled signature given the first two segment lengths.
pub fn split_block_signature(
    bytes: &[u8],
    signature_len: usize,
    verification_key_len: usize,
) -> TssResult<BlockSignatureParts<'_>> {
    let header_len = signature_len
        .checked_add(verification_key_len)
        .filter(|len| *len <= bytes.len())
        .ok_or_else(|| {
            TssError::InvalidInput(format!(
                "Block signature of {} bytes is shorter than {signature_len} + {verification_key_len}",
                bytes.len()
            ))
        })?;

    let (signature, rest) = bytes.split_at(signature_len);
    let (verification_key, proof) = rest.split_at(verification_key_len);
    debug_assert_eq!(signature.len() + verification_key.len(), header_len);

    Ok(BlockSignatureParts {
        signature,
        verification_key,
        proof,
    })
}

/// Chooses how block hashes are signed from the enabled sub-protocols.
pub struct BlockSigningComposer {
    aggregation: Option<Arc<dyn AggregationSigner>>,
    proof_chain: Option<Arc<dyn ProofChainSigner>>,
}

impl BlockSigningComposer {
    pub fn new(
        aggregation: Option<Arc<dyn AggregationSigner>>,
        proof_chain: Option<Arc<dyn ProofChainSigner>>,
    ) -> Self {
        Self {
            aggregation,
            proof_chain,
        }
    }

    /// Keep only the sub-signers `features` enables.
    pub fn from_features(
        features: SignerFeatures,
        aggregation: Option<Arc<dyn AggregationSigner>>,
        proof_chain: Option<Arc<dyn ProofChainSigner>>,
    ) -> TssResult<Self> {
        if features.hints && aggregation.is_none() {
            return Err(TssError::InvalidInput(
                "hints enabled but no aggregation signer supplied".to_string(),
            ));
        }
        if features.history && proof_chain.is_none() {
            return Err(TssError::InvalidInput(
                "history enabled but no proof-chain signer supplied".to_string(),
            ));
        }
        Ok(Self::new(
            aggregation.filter(|_| features.hints),
            proof_chain.filter(|_| features.history),
        ))
    }

    pub fn features(&self) -> SignerFeatures {
        SignerFeatures {
            hints: self.aggregation.is_some(),
            history: self.proof_chain.is_some(),
        }
    }

    /// Genesis proof if `signer` has one backed by a strong minority of the
    /// genesis address book.
    fn proof_if_ready(signer: &dyn ProofChainSigner, metadata: &[u8]) -> Option<Vec<u8>> {
        if !signer.has_genesis_verification_keys() {
            return None;
        }
        let book = signer.genesis_address_book_weights();
        let weights = RosterWeights::new(book.clone(), book);
        if !weights.is_target_strong_minority(signer.genesis_signers(metadata)) {
            return None;
        }
        signer.genesis_proof(metadata)
    }
}

impl BlockHashSigner for BlockSigningComposer {
    fn is_ready(&self) -> bool {
        match (&self.aggregation, &self.proof_chain) {
            (None, None) => true,
            (Some(aggregation), None) => aggregation.genesis_verification_key().is_some(),
            (None, Some(proof_chain)) => Self::proof_if_ready(proof_chain.as_ref(), &[]).is_some(),
            (Some(aggregation), Some(proof_chain)) => aggregation
                .genesis_verification_key()
                .is_some_and(|vk| Self::proof_if_ready(proof_chain.as_ref(), &vk).is_some()),
        }
    }

    fn sign_future(&self, block_hash: &[u8]) -> TssResult<BoxFuture<'static, TssResult<Vec<u8>>>> {
        let not_ready = || TssError::NotReady("block signer is not ready".to_string());

        match (&self.aggregation, &self.proof_chain) {
            (None, None) => {
                let block_hash = block_hash.to_vec();
                Ok(Box::pin(async move { Ok(digest_signature(&block_hash)) }))
            }
            (Some(aggregation), None) => {
                if aggregation.genesis_verification_key().is_none() {
                    return Err(not_ready());
                }
                Ok(aggregation.sign_future(block_hash))
            }
            (None, Some(proof_chain)) => {
                let proof = Self::proof_if_ready(proof_chain.as_ref(), &[]).ok_or_else(not_ready)?;
                let block_hash = block_hash.to_vec();
                Ok(Box::pin(async move {
                    let digest = digest_signature(&block_hash);
                    Ok(assemble_block_signature(&digest, &[], &proof))
                }))
            }
            (Some(aggregation), Some(proof_chain)) => {
                let verification_key = aggregation.genesis_verification_key().ok_or_else(not_ready)?;
                let proof =
                    Self::proof_if_ready(proof_chain.as_ref(), &verification_key).ok_or_else(not_ready)?;
                let signature = aggregation.sign_future(block_hash);
                Ok(Box::pin(async move {
                    let signature = signature.await?;
                    Ok(assemble_block_signature(&signature, &verification_key, &proof))
                }))
            }
        }
    }
}
