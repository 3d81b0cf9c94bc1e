//! Error kinds surfaced by the updater.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::metadata::{HashError, MetadataError};

/// Errors returned by [`crate::updater::Updater`] and the components it drives.
///
/// Every I/O failure carries the operation that failed and the path it
/// touched. Nothing is swallowed except "already at the latest snapshot"
/// during a metadata refresh.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("target is required")]
    EmptyTarget,

    /// The name is not present in the configured targets.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// Network operations on an updater created with `Updater::new_disabled`.
    #[error("updater is disabled")]
    Disabled,

    #[error("unmarshal root keys: {0}")]
    RootKeys(#[source] serde_json::Error),

    #[error("init metadata client: {0}")]
    Init(#[source] MetadataError),

    /// Retry with backoff. Never returned for "already latest".
    #[error("update metadata: {0}")]
    MetadataRefresh(#[source] MetadataError),

    #[error("lookup {target}: {source}")]
    Lookup {
        target: String,
        #[source]
        source: MetadataError,
    },

    #[error("get targets: {0}")]
    ListTargets(#[source] MetadataError),

    /// Transport failure or length/hash mismatch against signed metadata.
    /// The staged file is discarded, so retrying is safe.
    #[error("download target {repo_path}: {source}")]
    Download {
        repo_path: String,
        #[source]
        source: MetadataError,
    },

    /// The installed artifact could not be compared against its metadata.
    #[error("check hash of {path}: {source}")]
    HashCheck {
        path: PathBuf,
        #[source]
        source: HashError,
    },

    #[error("download of {0} was cancelled")]
    Cancelled(String),

    /// Covers path traversal and unsupported entries. The archive must not
    /// be retried as-is.
    #[error("extract {path}: {source}")]
    Extraction {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("exec check failed {path}: {output}")]
    ExecVerification { path: PathBuf, output: String },

    #[error("expected {0} to be a regular file")]
    LocalPathConflict(PathBuf),

    #[error("expected a regular file: {0}")]
    CorruptArtifact(PathBuf),

    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UpdateError {
    /// Adapter for `map_err` on filesystem calls.
    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }
}
