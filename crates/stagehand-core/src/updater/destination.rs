//! Download sinks and cancellation.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::metadata::Destination;

/// Cooperative cancellation shared between the caller and an updater.
///
/// Checked on every write of a transfer and once more right before the
/// downloaded file is promoted. The promotion itself always runs to
/// completion once started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Staged download file.
#[derive(Debug)]
pub struct FileDestination {
    file: File,
    cancel: CancelToken,
}

impl FileDestination {
    pub fn new(file: File, cancel: CancelToken) -> Self {
        Self { file, cancel }
    }

    /// Flush to disk and close.
    pub fn finish(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Write for FileDestination {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            // Not `Interrupted`: write_all would retry it forever.
            return Err(io::Error::other("download cancelled"));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Destination for FileDestination {
    fn delete(&mut self) -> io::Result<()> {
        self.file.set_len(0)
    }
}
