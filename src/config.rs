//! Node configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before any key
//! material is touched.
//!
//! ## Environment Variables
//!
//! - `TSS_NODE_ID`: This node's id in the roster (required)
//! - `TSS_DB_PATH`: Path to the ReDB file backing the TSS store
//! - `TSS_KEYS_PATH`: Base directory of the sequence-scoped key store
//! - `TSS_KEY_FILE_NAME`: Private key file name inside each sequence directory
//! - `TSS_MAX_SHARES_PER_NODE`: Shares assigned to the heaviest node
//! - `TSS_HINTS_ENABLED`: Enable the share-aggregation block signer
//! - `TSS_HISTORY_ENABLED`: Enable the proof-chain block signer
//! - `TSS_KEY_CANDIDATE_ROSTER`: Adopt a voted candidate roster on upgrade
//! - `TSS_SIGN_WITH_LEDGER_ID`: Sign ledger messages with TSS shares
//! - `RUST_LOG`: Log level filter

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::roster::NodeId;

const DEFAULT_DB_PATH: &str = "./.data/tss.redb";
const DEFAULT_KEYS_PATH: &str = "./.data/keys";
const DEFAULT_KEY_FILE_NAME: &str = "private.key";
const DEFAULT_MAX_SHARES_PER_NODE: u64 = 10;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Check if a string value is truthy.
fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Which optional block-signing sub-protocols are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignerFeatures {
    /// Share-aggregation signer.
    pub hints: bool,
    /// Proof-chain signer.
    pub history: bool,
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    node_id: Option<NodeId>,
    db_path: PathBuf,
    keys_path: PathBuf,
    key_file_name: String,
    max_shares_per_node: u64,
    features: SignerFeatures,
    key_candidate_roster: bool,
    sign_with_ledger_id: bool,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Unparseable values fall back to defaults; `validate` reports what is
    /// still missing.
    pub fn from_env() -> Self {
        let node_id = env_trim("TSS_NODE_ID").parse::<NodeId>().ok();

        let db_path = Some(env_trim("TSS_DB_PATH"))
            .filter(|s| !s.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from);

        let keys_path = Some(env_trim("TSS_KEYS_PATH"))
            .filter(|s| !s.is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_KEYS_PATH), PathBuf::from);

        let key_file_name = Some(env_trim("TSS_KEY_FILE_NAME"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_KEY_FILE_NAME.to_string());

        let max_shares_per_node = env_trim("TSS_MAX_SHARES_PER_NODE")
            .parse::<u64>()
            .unwrap_or(DEFAULT_MAX_SHARES_PER_NODE);

        let features = SignerFeatures {
            hints: is_truthy(&env_trim("TSS_HINTS_ENABLED")),
            history: is_truthy(&env_trim("TSS_HISTORY_ENABLED")),
        };

        Self {
            node_id,
            db_path,
            keys_path,
            key_file_name,
            max_shares_per_node,
            features,
            key_candidate_roster: is_truthy(&env_trim("TSS_KEY_CANDIDATE_ROSTER")),
            sign_with_ledger_id: is_truthy(&env_trim("TSS_SIGN_WITH_LEDGER_ID")),
        }
    }

    /// Create settings for tests, rooted in `dir`.
    pub fn for_tests(node_id: NodeId, dir: &Path) -> Self {
        Self {
            node_id: Some(node_id),
            db_path: dir.join("tss.redb"),
            keys_path: dir.join("keys"),
            key_file_name: DEFAULT_KEY_FILE_NAME.to_string(),
            max_shares_per_node: DEFAULT_MAX_SHARES_PER_NODE,
            features: SignerFeatures::default(),
            key_candidate_roster: false,
            sign_with_ledger_id: false,
        }
    }

    /// Builder-style override of the enabled sub-signers.
    #[must_use]
    pub fn with_features(mut self, features: SignerFeatures) -> Self {
        self.features = features;
        self
    }

    /// Builder-style override of the per-node share cap.
    #[must_use]
    pub fn with_max_shares_per_node(mut self, max_shares_per_node: u64) -> Self {
        self.max_shares_per_node = max_shares_per_node;
        self
    }

    /// Builder-style override of ledger-id share signing.
    #[must_use]
    pub fn with_sign_with_ledger_id(mut self, sign_with_ledger_id: bool) -> Self {
        self.sign_with_ledger_id = sign_with_ledger_id;
        self
    }

    /// Builder-style override of candidate roster adoption.
    #[must_use]
    pub fn with_key_candidate_roster(mut self, key_candidate_roster: bool) -> Self {
        self.key_candidate_roster = key_candidate_roster;
        self
    }

    /// Validate settings.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_none() {
            return Err("TSS_NODE_ID is required. \
                 Provide this node's numeric id in the roster."
                .to_string());
        }

        if self.max_shares_per_node == 0 {
            return Err("TSS_MAX_SHARES_PER_NODE must be greater than zero.".to_string());
        }

        if self.key_file_name.is_empty() || self.key_file_name.contains(['/', '\\']) || self.key_file_name == ".." {
            return Err(format!(
                "TSS_KEY_FILE_NAME must be a plain file name, got '{}'.",
                self.key_file_name
            ));
        }

        Ok(())
    }

    // Getters

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn keys_path(&self) -> &PathBuf {
        &self.keys_path
    }

    pub fn key_file_name(&self) -> &str {
        &self.key_file_name
    }

    pub fn max_shares_per_node(&self) -> u64 {
        self.max_shares_per_node
    }

    pub fn features(&self) -> SignerFeatures {
        self.features
    }

    pub fn key_candidate_roster(&self) -> bool {
        self.key_candidate_roster
    }

    pub fn sign_with_ledger_id(&self) -> bool {
        self.sign_with_ledger_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_settings_validation() {
        let settings = Settings::for_tests(3, Path::new("/tmp/tss"));
        assert!(settings.validate().is_ok());
        assert_eq!(settings.node_id(), Some(3));
        assert_eq!(settings.key_file_name(), "private.key");
        assert_eq!(settings.keys_path(), &PathBuf::from("/tmp/tss/keys"));
    }

    #[test]
    fn test_rejects_zero_share_cap() {
        let settings = Settings::for_tests(1, Path::new("/tmp/tss")).with_max_shares_per_node(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_nested_key_file_name() {
        let mut settings = Settings::for_tests(1, Path::new("/tmp/tss"));
        settings.key_file_name = "../escape.key".to_string();
        assert!(settings.validate().is_err());
    }
}
