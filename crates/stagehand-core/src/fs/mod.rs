//! Filesystem primitives shared across features.

pub mod copy;
pub mod perms;
pub mod remove;
pub mod secure;

pub use copy::copy_with_perms;
pub use remove::remove_all;
pub use secure::{DEFAULT_DIR_MODE, DEFAULT_EXECUTABLE_MODE};
