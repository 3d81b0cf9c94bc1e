//! Signed repository metadata
//!
//! The signature/rollback protocol lives behind [`MetadataClient`]; this
//! module defines that capability together with the local store used to
//! detect first run and the HTTP transport a client fetches through.

pub mod hash;
pub mod remote;
pub mod store;

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use hash::{HashError, check_file_hash};
pub use remote::{HttpRemoteStore, RemoteError, RemoteFile, RemoteStore};
pub use store::{FileLocalStore, LocalStore, MemoryLocalStore, StoreError};

/// Name of the root metadata document in the local store.
pub const ROOT_METADATA: &str = "root.json";

/// Root version the trust chain is bootstrapped at on first run.
pub const INITIAL_ROOT_VERSION: u32 = 1;

/// A public key of the repository's root role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(rename = "keytype")]
    pub key_type: String,
    pub scheme: String,
    #[serde(
        rename = "keyid_hash_algorithms",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub key_id_hash_algorithms: Vec<String>,
    #[serde(rename = "keyval")]
    pub value: KeyValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub public: String,
}

/// Parse a JSON array of root keys.
pub fn parse_root_keys(json: &str) -> Result<Vec<PublicKey>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Raw digest bytes, hex encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexBytes(#[serde(with = "hex::serde")] pub Vec<u8>);

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Verified metadata of a single repository file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFileMeta {
    pub length: u64,
    /// Digests keyed by algorithm name (`sha256`, `sha512`).
    pub hashes: BTreeMap<String, HexBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

/// All files known to the verified repository, keyed by repository path.
pub type TargetFiles = BTreeMap<String, TargetFileMeta>;

/// Errors reported by a [`MetadataClient`].
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The local metadata is already current. Not a failure.
    #[error("already at the latest snapshot")]
    LatestSnapshot,

    #[error("file not found in repository: {0}")]
    NotFound(String),

    #[error("wrong length for {path}: expected {expected}, got {actual}")]
    WrongLength {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("wrong hash for {0}")]
    WrongHash(String),

    #[error("metadata verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("write download: {0}")]
    Io(#[from] io::Error),
}

impl MetadataError {
    pub fn is_latest_snapshot(&self) -> bool {
        matches!(self, Self::LatestSnapshot)
    }
}

/// Sink a verified download is streamed into.
pub trait Destination: Write {
    /// Discard everything written so far; called when verification fails.
    fn delete(&mut self) -> io::Result<()>;
}

/// Verified metadata and download capability.
///
/// Implementations own the signature, expiry and rollback checks of the
/// update protocol. `download` must check the transferred bytes against the
/// signed length and hashes before returning `Ok`.
pub trait MetadataClient: Send {
    /// Bootstrap trust from `root_keys` at root `version`.
    fn init(&mut self, root_keys: &[PublicKey], version: u32) -> Result<(), MetadataError>;

    /// Fetch and verify the latest metadata. Returns
    /// [`MetadataError::LatestSnapshot`] when nothing changed.
    fn update(&mut self) -> Result<(), MetadataError>;

    /// Verified metadata of one repository path.
    fn target(&self, path: &str) -> Result<TargetFileMeta, MetadataError>;

    /// Every file in the verified repository.
    fn targets(&self) -> Result<TargetFiles, MetadataError>;

    /// Stream a repository file into `dest`, verifying it.
    fn download(&mut self, path: &str, dest: &mut dyn Destination) -> Result<(), MetadataError>;
}
