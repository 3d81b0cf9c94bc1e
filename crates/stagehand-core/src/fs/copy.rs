use std::fs;
use std::io;
use std::path::Path;

/// Copy `src` to `dst`, giving `dst` the same permissions as `src`.
///
/// A missing `src` surfaces as [`io::ErrorKind::NotFound`] so callers can
/// treat optional files leniently.
pub fn copy_with_perms(src: &Path, dst: &Path) -> io::Result<()> {
    let perms = fs::metadata(src)?.permissions();
    fs::copy(src, dst)?;
    fs::set_permissions(dst, perms)
}
