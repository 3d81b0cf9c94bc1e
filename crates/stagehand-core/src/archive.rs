//! `.tar.gz` bundle extraction
//!
//! Bundles are extracted next to the archive itself. Entries that would
//! land outside that directory are rejected before anything is written.

use std::fs::OpenOptions;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;
use thiserror::Error;

use crate::fs::secure;
use crate::fs::{DEFAULT_DIR_MODE, DEFAULT_EXECUTABLE_MODE};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("tar reader {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Entry escapes the extraction directory. The archive is untrustworthy.
    #[error("invalid path in tar.gz: {0:?}")]
    PathTraversal(String),

    #[error("unknown flag type {name:?}: {kind}")]
    UnsupportedEntry { name: String, kind: String },

    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }
}

/// Extract the gzip compressed tarball at `path` into its parent directory.
///
/// Directories are created with a fixed mode, regular files keep the mode
/// recorded in the archive. Anything else (links, devices, fifos) aborts the
/// extraction. A failed extraction is not resumable: remove the output and
/// start over from the download.
pub fn extract_tar_gz(path: &Path) -> Result<(), ArchiveError> {
    let dest = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let read_err = |source| ArchiveError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = secure::open_file(path, OpenOptions::new().read(true), DEFAULT_EXECUTABLE_MODE)
        .map_err(ArchiveError::io("open", path))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let name = entry.path().map_err(read_err)?.into_owned();
        let display = name.to_string_lossy().into_owned();
        let kind = entry.header().entry_type();

        let Some(relative) = enclosed_path(&name) else {
            return Err(ArchiveError::PathTraversal(display));
        };
        if relative.as_os_str().is_empty() {
            // "./" entries name the extraction directory itself.
            if kind == EntryType::Directory {
                continue;
            }
            return Err(ArchiveError::PathTraversal(display));
        }
        let target = dest.join(relative);

        match kind {
            EntryType::Directory => {
                secure::mkdir_all(&target, DEFAULT_DIR_MODE)
                    .map_err(ArchiveError::io("mkdir", &target))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                let mode = entry.header().mode().map_err(read_err)? & 0o7777;
                if let Some(parent) = target.parent() {
                    secure::mkdir_all(parent, DEFAULT_DIR_MODE)
                        .map_err(ArchiveError::io("mkdir", parent))?;
                }

                let mut out = secure::open_file(
                    &target,
                    OpenOptions::new().create(true).write(true).truncate(true),
                    mode,
                )
                .map_err(ArchiveError::io("failed to create", &target))?;
                io::copy(&mut entry, &mut out)
                    .map_err(ArchiveError::io("failed to copy", &target))?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    out.set_permissions(std::fs::Permissions::from_mode(mode))
                        .map_err(ArchiveError::io("chmod", &target))?;
                }
            }
            other => {
                return Err(ArchiveError::UnsupportedEntry {
                    name: display,
                    kind: format!("{other:?}"),
                });
            }
        }
    }

    Ok(())
}

/// The entry path relative to the extraction directory, or `None` if it
/// has a `..` component or is absolute.
fn enclosed_path(name: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}
