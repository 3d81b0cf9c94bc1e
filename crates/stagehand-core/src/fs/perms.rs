//! Executable permission fix-ups.
//!
//! Unix gets its execute bits from the mode passed at creation time. On
//! Windows freshly created files can inherit a read-only attribute from the
//! staging directory, which breaks the later rename over the live file.

use std::io;
use std::path::Path;

/// Make a downloaded file executable.
#[cfg(unix)]
pub fn chmod_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(super::DEFAULT_EXECUTABLE_MODE),
    )
}

#[cfg(windows)]
pub fn chmod_executable(path: &Path) -> io::Result<()> {
    clear_readonly(path)
}

#[cfg(not(any(unix, windows)))]
pub fn chmod_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Make a directory usable for holding executables. No-op outside Windows.
#[cfg(windows)]
pub fn chmod_executable_directory(path: &Path) -> io::Result<()> {
    clear_readonly(path)
}

#[cfg(not(windows))]
pub fn chmod_executable_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(windows)]
#[allow(clippy::permissions_set_readonly_false)]
fn clear_readonly(path: &Path) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}
