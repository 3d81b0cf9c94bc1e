//! Local metadata persistence
//!
//! The updater only reads the store to find out whether trust has been
//! bootstrapped already (a `root.json` entry exists). The metadata client
//! shares the same handle to persist what it verifies.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Default file name of the on-disk metadata cache.
pub const METADATA_FILE: &str = "tuf-metadata.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse metadata store {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("metadata {name} is not valid JSON: {source}")]
    InvalidMeta {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("metadata store lock poisoned")]
    Poisoned,
}

/// Persistent storage of verified metadata documents, keyed by name.
pub trait LocalStore: Send + Sync {
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError>;
    fn set_meta(&self, name: &str, meta: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store, mostly useful for tests and disabled updaters.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    meta: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        Ok(self.meta.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn set_meta(&self, name: &str, meta: &[u8]) -> Result<(), StoreError> {
        self.meta
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(name.to_string(), meta.to_vec());
        Ok(())
    }
}

/// Store backed by a single JSON document mapping names to metadata.
///
/// Writes go through a temporary file and a rename so a crash never leaves
/// a truncated cache behind.
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileLocalStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Store at `<root>/tuf-metadata.json`.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(METADATA_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    context: "read metadata store",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, doc: &BTreeMap<String, serde_json::Value>) -> Result<(), StoreError> {
        let io_err = |context, path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io {
                context,
                path,
                source,
            }
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err("create metadata store dir", parent))?;
        }

        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp_path = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp_path, bytes).map_err(io_err("write metadata store", &tmp_path))?;
        fs::rename(&tmp_path, &self.path).map_err(io_err("replace metadata store", &self.path))
    }
}

impl LocalStore for FileLocalStore {
    fn get_meta(&self) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.load()?
            .into_iter()
            .map(|(name, value)| match serde_json::to_vec(&value) {
                Ok(bytes) => Ok((name, bytes)),
                Err(source) => Err(StoreError::InvalidMeta { name, source }),
            })
            .collect()
    }

    fn set_meta(&self, name: &str, meta: &[u8]) -> Result<(), StoreError> {
        let value: serde_json::Value =
            serde_json::from_slice(meta).map_err(|source| StoreError::InvalidMeta {
                name: name.to_string(),
                source,
            })?;

        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut doc = self.load()?;
        doc.insert(name.to_string(), value);
        self.save(&doc)
    }
}
