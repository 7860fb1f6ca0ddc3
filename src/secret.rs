//! # Secrets
//!
//! Canonical in-memory representation of a secret flowing through the
//! controller, regardless of whether it came from the Kubernetes API or
//! from the generator engine.
//!
//! Secret bytes are wrapped in [`SecretValue`], which zeroizes on drop and
//! never prints its content.
//!
//! Value digests are HMAC-SHA256 under a per-install [`DigestKey`], so the
//! digests kept in the state file cannot be matched against a dictionary
//! of likely values without the key.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const DIGEST_KEY_LEN: usize = 32;

static DIGEST_KEY: OnceLock<DigestKey> = OnceLock::new();

/// Identity of a secret: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretId {
    pub namespace: String,
    pub name: String,
}

impl SecretId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque secret bytes
///
/// `Debug` is redacted and there is no `Display` or `Serialize` impl, so a
/// value can only leave the process through an explicit [`SecretValue::as_bytes`].
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Zeroizing<Vec<u8>>);

impl SecretValue {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// UTF-8 view of the value, if it is valid UTF-8
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex HMAC-SHA256 of the value under the installed [`DigestKey`]
    #[must_use]
    pub fn digest(&self) -> String {
        let mut mac = digest_key().mac();
        mac.update(self.as_bytes());
        hex_digest(&mac.finalize().into_bytes())
    }
}

#[derive(Debug, Error)]
pub enum DigestKeyError {
    #[error("failed to read digest key {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write digest key {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("digest key {path} must hold at least 32 hex-encoded bytes")]
    Invalid { path: PathBuf },
}

/// Key of the value digests recorded in sync records
pub struct DigestKey(Zeroizing<Vec<u8>>);

impl DigestKey {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; DIGEST_KEY_LEN]);
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Read a hex key file, creating one (mode 0600) when it does not exist
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or written, or holds
    /// fewer than 32 bytes of hex.
    pub fn load_or_create(path: &Path) -> Result<Self, DigestKeyError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                let bytes = hex::decode(raw.trim())
                    .ok()
                    .filter(|bytes| bytes.len() >= DIGEST_KEY_LEN)
                    .ok_or_else(|| DigestKeyError::Invalid {
                        path: path.to_path_buf(),
                    })?;
                Ok(Self(Zeroizing::new(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                key.write(path)?;
                info!("Created digest key {}", path.display());
                Ok(key)
            }
            Err(source) => Err(DigestKeyError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write(&self, path: &Path) -> Result<(), DigestKeyError> {
        let write_error = |source| DigestKeyError::Write {
            path: path.to_path_buf(),
            source,
        };
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        // Temp files are created with mode 0600
        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
        let encoded = Zeroizing::new(hex::encode(self.0.as_slice()));
        temp.write_all(encoded.as_bytes()).map_err(write_error)?;
        temp.as_file().sync_all().map_err(write_error)?;
        temp.persist_noclobber(path).map_err(|e| write_error(e.error))?;
        Ok(())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC takes keys of any length
        HmacSha256::new_from_slice(&self.0)
            .unwrap_or_else(|_| unreachable!("HMAC rejected a {} byte key", self.0.len()))
    }
}

impl fmt::Debug for DigestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DigestKey(<redacted>)")
    }
}

/// Install the process-wide digest key
///
/// Must run before any value is digested. Returns `false` when a key was
/// already in use; without an installed key a random one is generated, so
/// digests then only compare within one process.
pub fn install_digest_key(key: DigestKey) -> bool {
    DIGEST_KEY.set(key).is_ok()
}

fn digest_key() -> &'static DigestKey {
    DIGEST_KEY.get_or_init(DigestKey::generate)
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes().to_vec())
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(<redacted>, {} bytes)", self.0.len())
    }
}

/// Where a secret came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretOrigin {
    /// Created by an operator in the cluster
    OperatorProvided,
    /// Produced by the generator engine
    Generated,
}

/// A secret as tracked by the controller
#[derive(Debug, Clone)]
pub struct Secret {
    pub id: SecretId,
    pub data: BTreeMap<String, SecretValue>,
    /// Monotonic revision, bumped only when the content hash changes
    pub version: u64,
    pub origin: SecretOrigin,
    pub labels: BTreeMap<String, String>,
}

impl Secret {
    /// Hash over every key and value, independent of insertion order
    #[must_use]
    pub fn content_hash(&self) -> String {
        content_hash(&self.data)
    }

    /// True when every `key=value` pair of `selector` is present in the labels
    #[must_use]
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Order-independent hash of a secret's data map
///
/// Keys and values are length-prefixed so that `{"ab": "c"}` and
/// `{"a": "bc"}` never collide.
#[must_use]
pub fn content_hash(data: &BTreeMap<String, SecretValue>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        update_framed(&mut hasher, key.as_bytes());
        update_framed(&mut hasher, value.as_bytes());
    }
    hex_digest(&hasher.finalize())
}

pub(crate) fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

pub(crate) fn hex_digest(digest: &[u8]) -> String {
    hex::encode(digest)
}
