//! Threshold key material lifecycle.
//!
//! This module contains:
//! - `types`: Shares, messages, votes and persisted records
//! - `directory`: Share ownership and threshold per roster
//! - `engine`: Pluggable threshold cryptography
//! - `validation`: Message validation and vote tallying
//! - `keys`: Key material cache for the active roster
//! - `cryptography`: Vote production from threshold messages
//! - `status`: Keying status state machine
//! - `signatures`: Share signing and aggregation under the ledger id

pub mod cryptography;
pub mod directory;
pub mod engine;
pub mod keys;
pub mod signatures;
pub mod status;
pub mod types;
pub mod validation;

// Re-export key types
pub use cryptography::TssCryptographyManager;
pub use directory::ParticipantDirectory;
pub use engine::CryptoEngine;
pub use keys::{TssKeys, TssKeysAccessor};
pub use signatures::{LedgerIdSigner, ShareSignatureCollector};
pub use status::{RosterToKey, TssKeyingStatus, TssStatus, TssStatusManager};
pub use types::*;
