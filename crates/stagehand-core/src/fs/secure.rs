//! Directory creation and file opening that refuse to follow symlinks.
//!
//! Installed executables are written under directories that may be
//! writable by other local users on misconfigured hosts, so the final path
//! component is never resolved through a symlink.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

/// Mode for directories created by the updater.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Mode for executables written by the updater.
pub const DEFAULT_EXECUTABLE_MODE: u32 = 0o755;

/// Create `path` and any missing parents with `mode`.
///
/// Fails if `path` already exists as a symlink or as a non-directory.
pub fn mkdir_all(path: &Path, mode: u32) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(symlink_error(path)),
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => create_missing(path, mode),
        Err(err) => Err(err),
    }
}

fn create_missing(path: &Path, mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_missing(parent, mode)?;
        }
    }

    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    match builder.create(path) {
        Ok(()) => Ok(()),
        // Lost a race with another creator; fine as long as it is a real directory.
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(err),
        },
        Err(err) => Err(err),
    }
}

/// Open `path` with `options`, refusing to open it through a symlink.
///
/// `mode` applies when the file is created.
pub fn open_file(path: &Path, options: &mut OpenOptions, mode: u32) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode).custom_flags(libc::O_NOFOLLOW);
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        if let Ok(meta) = fs::symlink_metadata(path) {
            if meta.file_type().is_symlink() {
                return Err(symlink_error(path));
            }
        }
    }

    options.open(path)
}

fn symlink_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("refusing to follow symlink: {}", path.display()),
    )
}
