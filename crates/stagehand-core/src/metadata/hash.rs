//! Compare a local file against verified metadata.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use super::TargetFileMeta;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("wrong length: expected {expected}, got {actual}")]
    WrongLength { expected: u64, actual: u64 },

    #[error("wrong {algorithm} hash: expected {expected}, got {actual}")]
    WrongHash {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("no supported hash algorithm in metadata")]
    NoSupportedHash,

    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl HashError {
    /// The file was read fine but does not match the metadata.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::WrongLength { .. } | Self::WrongHash { .. })
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn for_algorithm(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256(Sha256::new())),
            "sha512" => Some(Self::Sha512(Sha512::new())),
            _ => None,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Check that the file at `path` matches `meta` in length and in every
/// supported digest. Unknown algorithms are skipped.
pub fn check_file_hash(meta: &TargetFileMeta, path: &Path) -> Result<(), HashError> {
    let io_err = |source| HashError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut hashers: Vec<(&str, &[u8], Hasher)> = meta
        .hashes
        .iter()
        .filter_map(|(name, expected)| {
            Hasher::for_algorithm(name).map(|h| (name.as_str(), expected.0.as_slice(), h))
        })
        .collect();
    if hashers.is_empty() {
        return Err(HashError::NoSupportedHash);
    }

    let mut file = File::open(path).map_err(io_err)?;
    let mut buf = [0u8; 64 * 1024];
    let mut length = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        length += n as u64;
        for (_, _, hasher) in hashers.iter_mut() {
            hasher.update(&buf[..n]);
        }
    }

    if length != meta.length {
        return Err(HashError::WrongLength {
            expected: meta.length,
            actual: length,
        });
    }

    for (name, expected, hasher) in hashers {
        let actual = hasher.finalize();
        if actual != expected {
            return Err(HashError::WrongHash {
                algorithm: name.to_string(),
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
    }

    Ok(())
}
