//! Integration tests for block-hash signing across sub-signer configurations.
//!
//! Run with: cargo test --test `block_signer`

use std::collections::BTreeMap;
use std::sync::Arc;

use ledger_tss::TssError;
use ledger_tss::block_signer::{
    AggregationSigner, BlockHashSigner, BlockSigningComposer, DIGEST_SIGNATURE_LEN, ProofChainSigner,
    digest_signature, split_block_signature,
};
use ledger_tss::config::SignerFeatures;
use ledger_tss::test_support::{FakeAggregationSigner, FakeProofChainSigner};

const SIGNATURE: [u8; 96] = [7; 96];
const PROOF: [u8; 32] = [9; 32];

/// Genesis address book of total weight 10: strong minority is 4.
fn address_book() -> BTreeMap<u64, u64> {
    BTreeMap::from([(1, 3), (2, 3), (3, 4)])
}

fn aggregation(verification_key: Option<Vec<u8>>) -> Arc<FakeAggregationSigner> {
    Arc::new(FakeAggregationSigner::new(verification_key, SIGNATURE.to_vec()))
}

fn proof_chain(has_verification_keys: bool) -> Arc<FakeProofChainSigner> {
    Arc::new(FakeProofChainSigner::new(
        has_verification_keys,
        address_book(),
        PROOF.to_vec(),
    ))
}

fn composer(
    aggregation: Option<Arc<FakeAggregationSigner>>,
    proof_chain: Option<Arc<FakeProofChainSigner>>,
) -> BlockSigningComposer {
    BlockSigningComposer::new(
        aggregation.map(|signer| signer as Arc<dyn AggregationSigner>),
        proof_chain.map(|signer| signer as Arc<dyn ProofChainSigner>),
    )
}

fn assert_not_ready(composer: &BlockSigningComposer) {
    assert!(!composer.is_ready());
    assert!(matches!(
        composer.sign_future(b"block"),
        Err(TssError::NotReady(_))
    ));
}

#[tokio::test]
async fn test_neither_signer_produces_digest() {
    let composer = composer(None, None);
    assert!(composer.is_ready());

    let signature = composer.sign_future(b"block").unwrap().await.unwrap();
    assert_eq!(signature.len(), DIGEST_SIGNATURE_LEN);
    assert_eq!(signature, digest_signature(b"block"));
}

#[tokio::test]
async fn test_aggregation_only_waits_for_verification_key() {
    let signer = aggregation(None);
    let composer = composer(Some(Arc::clone(&signer)), None);
    assert_not_ready(&composer);

    signer.set_verification_key(Some(vec![1; 48]));
    assert!(composer.is_ready());
    let signature = composer.sign_future(b"block").unwrap().await.unwrap();
    assert_eq!(signature, SIGNATURE.to_vec());
}

#[tokio::test]
async fn test_proof_chain_only_requires_strong_minority() {
    let signer = proof_chain(true);
    let composer = composer(None, Some(Arc::clone(&signer)));
    assert_not_ready(&composer);

    signer.add_signer(&[], 1);
    assert_not_ready(&composer);

    signer.add_signer(&[], 2);
    assert!(composer.is_ready());

    let signature = composer.sign_future(b"block").unwrap().await.unwrap();
    let parts = split_block_signature(&signature, DIGEST_SIGNATURE_LEN, 0).unwrap();
    assert_eq!(parts.signature, digest_signature(b"block").as_slice());
    assert!(parts.verification_key.is_empty());
    assert_eq!(parts.proof, PROOF.as_slice());
}

#[tokio::test]
async fn test_proof_chain_without_verification_keys_is_never_ready() {
    let signer = proof_chain(false);
    signer.add_signer(&[], 3);
    let composer = composer(None, Some(signer));
    assert_not_ready(&composer);
}

#[tokio::test]
async fn test_both_signers_concatenate_segments() {
    let verification_key = vec![5u8; 1280];
    let aggregation_signer = aggregation(Some(verification_key.clone()));
    let proof_signer = proof_chain(true);
    let composer = composer(Some(aggregation_signer), Some(Arc::clone(&proof_signer)));

    // Signers over other metadata do not count.
    proof_signer.add_signer(&[], 3);
    assert_not_ready(&composer);

    proof_signer.add_signer(&verification_key, 3);
    assert!(composer.is_ready());

    let signature = composer.sign_future(b"block").unwrap().await.unwrap();
    assert_eq!(signature.len(), SIGNATURE.len() + verification_key.len() + PROOF.len());

    let parts = split_block_signature(&signature, SIGNATURE.len(), verification_key.len()).unwrap();
    assert_eq!(parts.signature, SIGNATURE.as_slice());
    assert_eq!(parts.verification_key, verification_key.as_slice());
    assert_eq!(parts.proof, PROOF.as_slice());
}

#[tokio::test]
async fn test_features_select_sub_signers() {
    let features = SignerFeatures {
        hints: false,
        history: true,
    };
    let proof_signer = proof_chain(true);
    proof_signer.add_signer(&[], 3);

    let composer = BlockSigningComposer::from_features(
        features,
        Some(aggregation(Some(vec![1; 48])) as Arc<dyn AggregationSigner>),
        Some(proof_signer as Arc<dyn ProofChainSigner>),
    )
    .unwrap();
    assert_eq!(composer.features(), features);

    let signature = composer.sign_future(b"block").unwrap().await.unwrap();
    assert_eq!(signature.len(), DIGEST_SIGNATURE_LEN + PROOF.len());
}
