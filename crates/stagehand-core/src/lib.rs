//! Stagehand Core Library
//!
//! Keeps a set of named update targets (plain executables or `.tar.gz`
//! bundles) in sync with a signed remote repository, installs them
//! atomically, and migrates legacy installations to the current layout.

pub mod archive;
pub mod config;
pub mod error;
pub mod exec;
pub mod fs;
pub mod metadata;
pub mod migrate;
pub mod target;
pub mod updater;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ConfigStore, StagehandConfig};

    // Errors
    pub use crate::error::UpdateError;

    // Targets
    pub use crate::target::{LocalTarget, TargetInfo, Targets};

    // Metadata
    pub use crate::metadata::{
        FileLocalStore, LocalStore, MemoryLocalStore, MetadataClient, MetadataError,
        TargetFileMeta, TargetFiles,
    };

    // Execution
    pub use crate::exec::{CommandRunner, HostEnv, HostOs, SystemRunner};

    // Updater
    pub use crate::updater::{CancelToken, Options, Updater};

    // Migration
    pub use crate::migrate::{FileMigration, MigrateError, migrate_root};
}
