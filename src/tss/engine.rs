//! Crypto engine capability.
//!
//! The pairing-based primitives (share generation, encryption, signing,
//! aggregation) live behind this trait. Every method is a pure function of its
//! inputs except message generation, which consumes entropy. Methods are
//! blocking; callers dispatch them to the blocking pool.

use crate::error::TssResult;
use crate::tss::directory::ParticipantDirectory;
use crate::tss::types::{
    AggregatePrivateKey, LedgerPublicKey, PrivateShare, PublicShare, ShareSignature, TssMessage,
};

/// Threshold cryptography operations consumed by the TSS subsystem.
pub trait CryptoEngine: Send + Sync {
    /// Generate a threshold message for `directory`.
    ///
    /// With no share this starts a fresh (genesis) key; with a share it
    /// re-shares that share to the directory's participants.
    fn generate_message(
        &self,
        directory: &ParticipantDirectory,
        private_share: Option<&PrivateShare>,
    ) -> TssResult<TssMessage>;

    /// Whether `message` is well-formed for `directory`.
    fn verify_message(&self, directory: &ParticipantDirectory, message: &TssMessage) -> bool;

    /// Decrypt the shares this node owns from validated messages.
    fn decrypt_private_shares(
        &self,
        directory: &ParticipantDirectory,
        messages: &[TssMessage],
    ) -> TssResult<Vec<PrivateShare>>;

    /// Combine private shares into the aggregate private key.
    ///
    /// Meaningless below the directory threshold; callers check first.
    fn aggregate_private_shares(&self, shares: &[PrivateShare]) -> TssResult<AggregatePrivateKey>;

    /// Compute every participant's public share from validated messages.
    fn compute_public_shares(
        &self,
        directory: &ParticipantDirectory,
        messages: &[TssMessage],
    ) -> TssResult<Vec<PublicShare>>;

    /// Combine public shares into the ledger public key.
    fn aggregate_public_shares(&self, shares: &[PublicShare]) -> TssResult<LedgerPublicKey>;

    /// Sign `message` with a single private share.
    fn sign(&self, share: &PrivateShare, message: &[u8]) -> TssResult<ShareSignature>;

    /// Verify a share signature against the matching public share.
    fn verify_signature(
        &self,
        directory: &ParticipantDirectory,
        public_shares: &[PublicShare],
        signature: &ShareSignature,
        message: &[u8],
    ) -> bool;

    /// Combine share signatures into a ledger signature.
    fn aggregate_signatures(&self, signatures: &[ShareSignature]) -> TssResult<Vec<u8>>;
}

/// Ledger id (aggregate public key bytes) implied by a set of validated messages.
pub fn ledger_id_from(
    engine: &dyn CryptoEngine,
    directory: &ParticipantDirectory,
    messages: &[TssMessage],
) -> TssResult<Vec<u8>> {
    let public_shares = engine.compute_public_shares(directory, messages)?;
    let public_key = engine.aggregate_public_shares(&public_shares)?;
    Ok(public_key.to_bytes())
}
