//! Sequence-scoped key pair storage.
//!
//! Layout: `<base_dir>/<sequence id>/<file name>`, one private key per
//! directory named by the canonical decimal id. Entries are never
//! overwritten, also across processes sharing `base_dir`. A key file that is
//! missing or fails to parse counts as absent and gets regenerated.
//!
//! All operations touch the filesystem synchronously; async callers should
//! run them on the blocking pool.

use std::fs;
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::error::{TssError, TssResult};

/// A private key that can live in a [`SequenceScopedKeyStore`].
pub trait ScopedPrivateKey: Sized + Send + Sync {
    type PublicKey: Clone + Send + Sync;

    /// Fresh key from OS entropy.
    fn generate() -> TssResult<Self>;

    fn public_key(&self) -> Self::PublicKey;

    /// File contents for this key.
    fn to_file_bytes(&self) -> Zeroizing<Vec<u8>>;

    /// Parse file contents; `CorruptKey` if they are not a valid key.
    fn from_file_bytes(bytes: &[u8]) -> TssResult<Self>;
}

/// A private key, its public key and the sequence id it is stored under.
pub struct ScopedKeyPair<K: ScopedPrivateKey> {
    pub id: u64,
    pub private_key: K,
    pub public_key: K::PublicKey,
}

impl<K: ScopedPrivateKey> ScopedKeyPair<K> {
    fn new(id: u64, private_key: K) -> Self {
        let public_key = private_key.public_key();
        Self {
            id,
            private_key,
            public_key,
        }
    }
}

/// On-disk store of one key pair per sequence id.
pub struct SequenceScopedKeyStore<K> {
    base_dir: PathBuf,
    file_name: String,
    /// Serializes create/purge within this process.
    lock: Mutex<()>,
    _key: PhantomData<fn() -> K>,
}

impl<K: ScopedPrivateKey> SequenceScopedKeyStore<K> {
    pub fn new(base_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            file_name: file_name.into(),
            lock: Mutex::new(()),
            _key: PhantomData,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/<id>/<file name>`.
    pub fn key_path(&self, id: u64) -> PathBuf {
        self.base_dir.join(id.to_string()).join(&self.file_name)
    }

    /// Key pair of the largest stored id `<= id`, or a new one under `id`.
    ///
    /// A missing or corrupt file under the chosen id is logged and replaced
    /// by a fresh key under `id`.
    pub fn get_or_create(&self, id: u64) -> TssResult<ScopedKeyPair<K>> {
        let _guard = self.lock()?;

        let latest = self
            .sequence_dirs()?
            .into_iter()
            .filter(|(existing, _)| *existing <= id)
            .max_by_key(|(existing, _)| *existing);

        if let Some((existing, dir)) = latest {
            match Self::load(&dir.join(&self.file_name)) {
                Ok(private_key) => {
                    tracing::debug!(requested = id, found = existing, "Loaded scoped key pair");
                    return Ok(ScopedKeyPair::new(existing, private_key));
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        found = existing,
                        requested = id,
                        "Unusable key file, generating a new key"
                    );
                }
            }
        }

        self.create_locked(id)
    }

    /// Create a new key pair under `id`.
    ///
    /// Fails with `AlreadyExists` if a readable key is already stored there.
    pub fn create(&self, id: u64) -> TssResult<ScopedKeyPair<K>> {
        let _guard = self.lock()?;
        self.create_locked(id)
    }

    /// Delete every entry with id `< id`. Returns how many were removed.
    ///
    /// Best effort: failures are logged and the remaining entries are still
    /// purged. A missing base directory is a no-op.
    pub fn purge_before(&self, id: u64) -> TssResult<usize> {
        let _guard = self.lock()?;

        let mut purged = 0;
        for (existing, dir) in self.sequence_dirs()? {
            if existing >= id {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => purged += 1,
                Err(e) => {
                    tracing::warn!(error = %e, path = %dir.display(), "Failed to purge key directory");
                }
            }
        }

        if purged > 0 {
            tracing::info!(before = id, purged, "Purged scoped key directories");
        }
        Ok(purged)
    }

    /// Ids of all sequence directories, ascending.
    pub fn sequence_ids(&self) -> TssResult<Vec<u64>> {
        Ok(self.sequence_dirs()?.into_iter().map(|(id, _)| id).collect())
    }

    /// Sequence directories with their parsed ids, ascending by id.
    fn sequence_dirs(&self) -> TssResult<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable key store entry");
                    continue;
                }
            };
            if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(parse_sequence_id) {
                dirs.push((id, entry.path()));
            }
        }

        dirs.sort_by_key(|(id, _)| *id);
        Ok(dirs)
    }

    fn load(path: &Path) -> TssResult<K> {
        let bytes = Zeroizing::new(fs::read(path).map_err(|e| {
            TssError::CorruptKey(format!("Cannot read {}: {e}", path.display()))
        })?);
        K::from_file_bytes(&bytes)
    }

    fn create_locked(&self, id: u64) -> TssResult<ScopedKeyPair<K>> {
        let path = self.key_path(id);
        let dir = self.base_dir.join(id.to_string());
        fs::create_dir_all(&dir)?;

        if path.exists() {
            match Self::load(&path) {
                Ok(_) => return Err(already_exists(id, &path)),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Replacing corrupt key file");
                    Self::quarantine_corrupt(id, &dir, &path)?;
                }
            }
        }

        // Written under a unique temporary name, then linked into place. The
        // link fails if `path` exists, so readers never see a partial key and
        // a key stored by another process is never replaced.
        let private_key = K::generate()?;
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(&private_key.to_file_bytes())?;
        file.as_file().sync_all()?;
        file.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                already_exists(id, &path)
            } else {
                TssError::from(e.error)
            }
        })?;

        tracing::info!(id, path = %path.display(), "Created scoped key pair");
        Ok(ScopedKeyPair::new(id, private_key))
    }

    /// Move the corrupt file at `path` aside.
    ///
    /// Another process may have stored a valid key there since it was read.
    /// In that case the key is put back and `AlreadyExists` returned.
    fn quarantine_corrupt(id: u64, dir: &Path, path: &Path) -> TssResult<()> {
        let quarantine = tempfile::Builder::new()
            .prefix(".corrupt")
            .tempfile_in(dir)?
            .into_temp_path();

        match fs::rename(path, &quarantine) {
            Ok(()) => {}
            // Already moved aside by someone else.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if Self::load(&quarantine).is_ok() {
            return match fs::hard_link(&quarantine, path) {
                Ok(()) => Err(already_exists(id, path)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(already_exists(id, path)),
                Err(e) => Err(e.into()),
            };
        }
        Ok(())
    }

    fn lock(&self) -> TssResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|e| TssError::Internal(format!("Key store mutex poisoned: {e}")))
    }
}

fn already_exists(id: u64, path: &Path) -> TssError {
    TssError::AlreadyExists {
        id,
        path: path.display().to_string(),
    }
}

/// Canonical decimal directory names only, so each id has exactly one
/// directory. Zero-padded or signed names are not sequence entries.
fn parse_sequence_id(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if name.len() > 1 && name.starts_with('0') {
        return None;
    }
    name.parse().ok()
}

// =============================================================================
// Ed25519 keys
// =============================================================================

/// Ed25519 private key stored as hex text.
#[derive(Clone)]
pub struct Ed25519ScopedKey(SigningKey);

impl Ed25519ScopedKey {
    pub fn signing_key(&self) -> &SigningKey {
        &self.0
    }
}

impl ScopedPrivateKey for Ed25519ScopedKey {
    type PublicKey = VerifyingKey;

    fn generate() -> TssResult<Self> {
        Ok(Self(SigningKey::generate(&mut OsRng)))
    }

    fn public_key(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    fn to_file_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut encoded = Zeroizing::new(hex::encode(self.0.to_bytes()).into_bytes());
        encoded.push(b'\n');
        encoded
    }

    fn from_file_bytes(bytes: &[u8]) -> TssResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| TssError::CorruptKey("Key file is not UTF-8".to_string()))?;
        let decoded = Zeroizing::new(
            hex::decode(text.trim())
                .map_err(|e| TssError::CorruptKey(format!("Key file is not hex: {e}")))?,
        );
        let secret: &[u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            TssError::CorruptKey(format!("Expected 32 key bytes, found {}", decoded.len()))
        })?;
        Ok(Self(SigningKey::from_bytes(secret)))
    }
}
