//! Scoped key provisioning.
//!
//! Ensures this node has a long-term signing key for the given sequence id
//! and removes keys older than the one in use.
//!
//! ## Usage
//!
//! ```text
//! TSS_NODE_ID=3 tss-keys <sequence-id>
//! ```

use anyhow::{Context, bail};
use ledger_tss::{
    Settings,
    key_store::{Ed25519ScopedKey, SequenceScopedKeyStore},
    telemetry,
};

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let result = run();
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "tss-keys failed");
    }

    telemetry::shutdown_tracing();
    result
}

fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    if let Err(message) = settings.validate() {
        bail!(message);
    }

    let Some(arg) = std::env::args().nth(1) else {
        bail!("usage: tss-keys <sequence-id>");
    };
    let sequence_id: u64 = arg
        .parse()
        .with_context(|| format!("sequence id must be a non-negative integer, got '{arg}'"))?;

    let store = SequenceScopedKeyStore::<Ed25519ScopedKey>::new(settings.keys_path(), settings.key_file_name());

    let pair = store
        .get_or_create(sequence_id)
        .with_context(|| format!("failed to load or create key for sequence {sequence_id}"))?;
    let purged = store
        .purge_before(pair.id)
        .context("failed to purge old key material")?;

    tracing::info!(
        node_id = settings.node_id(),
        requested = sequence_id,
        sequence_id = pair.id,
        purged,
        public_key = %hex::encode(pair.public_key.as_bytes()),
        keys_path = %settings.keys_path().display(),
        "Scoped key ready"
    );

    Ok(())
}
