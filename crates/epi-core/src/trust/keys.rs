// crates/epi-core/src/trust/keys.rs
// ============================================================================
// Module: EPI Key Manager
// Description: Named Ed25519 key pairs stored in a local key directory.
// Purpose: Generate, load, and list signing keys with race-free creation.
// Dependencies: crate::{audit, core, trust::signing}, base64, ed25519-dalek, rand, tempfile
// ============================================================================

//! ## Overview
//! Each key pair lives in the key directory as `<name>.key` (base64 seed) and
//! `<name>.pub` (base64 public key). Generation writes into a temporary file
//! in the same directory and claims the final name with a no-clobber link, so
//! concurrent generators for one name produce exactly one winner.
//!
//! Both files of a pair are written while holding `<name>.lock`, claimed the
//! same no-clobber way, so overwriting generators never interleave halves of
//! different pairs. [`KeyManager::load_public`] checks a stored `.pub` against
//! the private key when both exist.
//!
//! Private keys are read only from this directory; they never leave it except
//! as in-memory [`SigningKey`] values handed to the signer.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::SigningKey;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::audit::AuditEvent;
use crate::audit::AuditEventParams;
use crate::audit::AuditSink;
use crate::audit::EVENT_KEY_GENERATED;
use crate::audit::NoopAuditSink;
use crate::core::identifiers::IdentifierError;
use crate::core::identifiers::KeyName;
use crate::trust::signing::Signer;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable overriding the EPI home directory.
pub const EPI_HOME_ENV: &str = "EPI_HOME";
/// Private key file extension.
pub const PRIVATE_KEY_EXTENSION: &str = "key";
/// Public key file extension.
pub const PUBLIC_KEY_EXTENSION: &str = "pub";
/// Generation lock file extension.
const LOCK_EXTENSION: &str = "lock";
/// Maximum size of a key file on disk.
const MAX_KEY_FILE_BYTES: u64 = 4096;
/// How long a generator waits for another generator of the same name.
const GENERATION_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for the generation lock.
const GENERATION_LOCK_POLL: Duration = Duration::from_millis(2);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyError {
    /// No key exists under the name.
    #[error("key not found: {0}")]
    NotFound(String),
    /// A key already exists under the name.
    #[error("key already exists: {0}")]
    Exists(String),
    /// Key name failed validation.
    #[error(transparent)]
    InvalidName(#[from] IdentifierError),
    /// Key directory I/O failed.
    #[error("key store io error: {0}")]
    Io(String),
    /// Key file content is not a valid key.
    #[error("invalid key file {path}: {message}")]
    Invalid {
        /// Offending file.
        path: String,
        /// Decoder message.
        message: String,
    },
}

// ============================================================================
// SECTION: Key Manager
// ============================================================================

/// File-backed store of named Ed25519 key pairs.
#[derive(Clone)]
pub struct KeyManager {
    /// Directory holding `<name>.key` / `<name>.pub` files.
    dir: PathBuf,
    /// Audit sink for key generation events.
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Creates a key manager rooted at `dir` without auditing.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            audit: Arc::new(NoopAuditSink),
        }
    }

    /// Creates a key manager rooted at the resolved default directory.
    #[must_use]
    pub fn with_default_dir() -> Self {
        Self::new(Self::default_dir())
    }

    /// Replaces the audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Resolves the default key directory.
    ///
    /// `EPI_HOME/keys`, else `~/.epi/keys`, else `.epi/keys`.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        if let Some(home) = env::var_os(EPI_HOME_ENV).filter(|value| !value.is_empty()) {
            return PathBuf::from(home).join("keys");
        }
        let user_home = env::var_os("HOME")
            .filter(|value| !value.is_empty())
            .or_else(|| env::var_os("USERPROFILE").filter(|value| !value.is_empty()));
        user_home.map_or_else(|| PathBuf::from(".epi").join("keys"), |home| {
            PathBuf::from(home).join(".epi").join("keys")
        })
    }

    /// Returns the key directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns true when a private key exists under `name`.
    #[must_use]
    pub fn has_key(&self, name: &KeyName) -> bool {
        self.private_path(name).is_file()
    }

    /// Generates and stores a new key pair.
    ///
    /// Generators for one name are serialized through `<name>.lock`; the
    /// stored `.key` and `.pub` always belong to the same generation.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Exists`] when the name is taken and `overwrite` is
    /// false (including when a concurrent generation won), or
    /// [`KeyError::Io`] when the key files cannot be written or the lock is
    /// not released in time.
    pub fn generate(&self, name: &KeyName, overwrite: bool) -> Result<VerifyingKey, KeyError> {
        let private_path = self.private_path(name);
        if !overwrite && private_path.exists() {
            return Err(KeyError::Exists(name.to_string()));
        }
        fs::create_dir_all(&self.dir).map_err(|err| KeyError::Io(err.to_string()))?;
        let _lock = GenerationLock::acquire(self, name)?;
        if !overwrite && private_path.exists() {
            return Err(KeyError::Exists(name.to_string()));
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let staged = self.stage_file(&BASE64.encode(signing_key.to_bytes()))?;
        if overwrite {
            staged.persist(&private_path).map_err(|err| KeyError::Io(err.error.to_string()))?;
        } else {
            staged.persist_noclobber(&private_path).map_err(|err| {
                if err.error.kind() == io::ErrorKind::AlreadyExists {
                    KeyError::Exists(name.to_string())
                } else {
                    KeyError::Io(err.error.to_string())
                }
            })?;
        }
        let staged_pub = self.stage_file(&BASE64.encode(verifying_key.as_bytes()))?;
        staged_pub
            .persist(self.public_path(name))
            .map_err(|err| KeyError::Io(err.error.to_string()))?;

        self.audit.record(&AuditEvent::new(EVENT_KEY_GENERATED, AuditEventParams {
            key_name: Some(name.to_string()),
            message: Some(self.dir.display().to_string()),
            ..AuditEventParams::default()
        }));
        Ok(verifying_key)
    }

    /// Loads the private key stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] when absent or [`KeyError::Invalid`] when malformed.
    pub fn load_private(&self, name: &KeyName) -> Result<SigningKey, KeyError> {
        let path = self.private_path(name);
        let bytes = read_key_file(&path, name)?;
        let seed = decode_key_bytes(&bytes).ok_or_else(|| KeyError::Invalid {
            path: path.display().to_string(),
            message: "expected 32 raw bytes or base64".to_string(),
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Loads the public key stored under `name`.
    ///
    /// Falls back to deriving it from the private key when `<name>.pub` is
    /// absent. When both files exist they must describe the same pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::NotFound`] when neither file exists or
    /// [`KeyError::Invalid`] when a stored key is malformed or the `.pub`
    /// does not match the private key.
    pub fn load_public(&self, name: &KeyName) -> Result<VerifyingKey, KeyError> {
        let path = self.public_path(name);
        let stored = match read_key_file(&path, name) {
            Ok(bytes) => {
                let invalid = |message: &str| KeyError::Invalid {
                    path: path.display().to_string(),
                    message: message.to_string(),
                };
                let raw = decode_key_bytes(&bytes)
                    .ok_or_else(|| invalid("expected 32 raw bytes or base64"))?;
                VerifyingKey::from_bytes(&raw)
                    .map_err(|_| invalid("not a valid ed25519 public key"))?
            }
            Err(KeyError::NotFound(_)) => return Ok(self.load_private(name)?.verifying_key()),
            Err(err) => return Err(err),
        };
        match self.load_private(name) {
            Ok(private) if private.verifying_key() != stored => Err(KeyError::Invalid {
                path: path.display().to_string(),
                message: "public key does not match the private key".to_string(),
            }),
            Ok(_) | Err(KeyError::NotFound(_)) => Ok(stored),
            Err(err) => Err(err),
        }
    }

    /// Lists key names in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Io`] when the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<KeyName>, KeyError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(KeyError::Io(err.to_string())),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| KeyError::Io(err.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PRIVATE_KEY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
                && let Ok(name) = KeyName::new(stem)
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Loads the key under `name`, generating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when the key can be neither loaded nor generated.
    pub fn ensure_key(&self, name: &KeyName) -> Result<SigningKey, KeyError> {
        match self.load_private(name) {
            Err(KeyError::NotFound(_)) => match self.generate(name, false) {
                Ok(_) | Err(KeyError::Exists(_)) => self.load_private(name),
                Err(err) => Err(err),
            },
            other => other,
        }
    }

    /// Returns a signer for `name`, generating the key when `auto_generate` is set.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when the key is missing or unreadable.
    pub fn signer(&self, name: &KeyName, auto_generate: bool) -> Result<Signer, KeyError> {
        let key = if auto_generate { self.ensure_key(name)? } else { self.load_private(name)? };
        Ok(Signer::new(name.clone(), key))
    }

    /// Returns the private key path for `name`.
    #[must_use]
    pub fn private_path(&self, name: &KeyName) -> PathBuf {
        self.dir.join(format!("{name}.{PRIVATE_KEY_EXTENSION}"))
    }

    /// Returns the public key path for `name`.
    #[must_use]
    pub fn public_path(&self, name: &KeyName) -> PathBuf {
        self.dir.join(format!("{name}.{PUBLIC_KEY_EXTENSION}"))
    }

    /// Returns the generation lock path for `name`.
    fn lock_path(&self, name: &KeyName) -> PathBuf {
        self.dir.join(format!("{name}.{LOCK_EXTENSION}"))
    }

    /// Writes `contents` into a fresh temporary file inside the key directory.
    fn stage_file(&self, contents: &str) -> Result<NamedTempFile, KeyError> {
        let mut staged =
            NamedTempFile::new_in(&self.dir).map_err(|err| KeyError::Io(err.to_string()))?;
        staged.write_all(contents.as_bytes()).map_err(|err| KeyError::Io(err.to_string()))?;
        staged.as_file().sync_all().map_err(|err| KeyError::Io(err.to_string()))?;
        Ok(staged)
    }
}

// ============================================================================
// SECTION: Generation Lock
// ============================================================================

/// Exclusive claim on `<name>.lock`, released on drop.
struct GenerationLock {
    /// Claimed lock file.
    path: PathBuf,
}

impl GenerationLock {
    /// Claims the lock for `name`, waiting for a concurrent generator.
    fn acquire(keys: &KeyManager, name: &KeyName) -> Result<Self, KeyError> {
        let path = keys.lock_path(name);
        let deadline = Instant::now() + GENERATION_LOCK_TIMEOUT;
        loop {
            let staged = keys.stage_file(&std::process::id().to_string())?;
            match staged.persist_noclobber(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(KeyError::Io(format!(
                            "key generation lock {} is held; remove it if no generator is running",
                            path.display()
                        )));
                    }
                    thread::sleep(GENERATION_LOCK_POLL);
                }
                Err(err) => return Err(KeyError::Io(err.error.to_string())),
            }
        }
    }
}

impl Drop for GenerationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// SECTION: Key File Helpers
// ============================================================================

/// Reads a key file with a size cap, mapping a missing file to `NotFound`.
fn read_key_file(path: &Path, name: &KeyName) -> Result<Vec<u8>, KeyError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(KeyError::NotFound(name.to_string()));
        }
        Err(err) => return Err(KeyError::Io(err.to_string())),
    };
    let mut bytes = Vec::new();
    file.take(MAX_KEY_FILE_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| KeyError::Io(err.to_string()))?;
    if bytes.len() as u64 > MAX_KEY_FILE_BYTES {
        return Err(KeyError::Invalid {
            path: path.display().to_string(),
            message: "key file too large".to_string(),
        });
    }
    Ok(bytes)
}

/// Decodes 32 key bytes stored raw or as base64 text.
fn decode_key_bytes(bytes: &[u8]) -> Option<[u8; 32]> {
    if let Ok(raw) = <[u8; 32]>::try_from(bytes) {
        return Some(raw);
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let decoded = BASE64.decode(text.trim().as_bytes()).ok()?;
    <[u8; 32]>::try_from(decoded.as_slice()).ok()
}
