//! Legacy install root migration
//!
//! Older installs kept every target under
//! `<old_root>/bin/<name>/<platform>/<channel>/<file>`. [`migrate_root`]
//! copies such an install to the flat layout under the configured root,
//! points the OS service at the new executable and removes the old tree.
//! The old install stays fully usable until the service definition has
//! been rewritten, so a failed migration can simply be retried.

pub mod platform;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::exec::{CommandRunner, HostEnv};
use crate::fs::{DEFAULT_DIR_MODE, copy_with_perms, remove_all, secure};
use crate::target::BIN_DIR;
use crate::updater::Options;

pub use platform::{
    LaunchdStrategy, NoServiceStrategy, PlatformMigration, ScServiceStrategy, SystemdStrategy,
    for_host,
};

/// Target whose executable the OS service launches.
pub const SERVICE_TARGET: &str = "orbit";

/// Files kept at the top of the install root.
pub const SUPPORT_FILES: [&str; 4] = [
    "certs.pem",
    "osquery.flags",
    "tuf-metadata.json",
    "fleet.pem",
];

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("get executable path: {0}")]
    Executable(#[source] io::Error),

    #[error("old root dir not found above {0}")]
    LegacyRootNotFound(PathBuf),

    #[error("move {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("update service definition: {0}")]
    Service(String),

    #[error("service file pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl MigrateError {
    pub(crate) fn io(context: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }
}

/// One file copied from the old install to the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMigration {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

impl FileMigration {
    pub fn new(old_path: impl Into<PathBuf>, new_path: impl Into<PathBuf>) -> Self {
        Self {
            old_path: old_path.into(),
            new_path: new_path.into(),
        }
    }

    /// Copy the file, keeping its permissions. A missing source is skipped.
    fn apply(&self) -> Result<(), MigrateError> {
        if let Some(parent) = self.new_path.parent() {
            secure::mkdir_all(parent, DEFAULT_DIR_MODE)
                .map_err(MigrateError::io("create dir", parent))?;
        }
        match copy_with_perms(&self.old_path, &self.new_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.old_path.display(), "nothing to migrate");
                Ok(())
            }
            Err(source) => Err(MigrateError::Copy {
                from: self.old_path.clone(),
                to: self.new_path.clone(),
                source,
            }),
        }
    }
}

/// The install root the running executable was started from: the parent
/// of the closest `bin` directory above `host.executable`.
pub fn find_legacy_root(host: &HostEnv) -> Result<PathBuf, MigrateError> {
    let not_found = || MigrateError::LegacyRootNotFound(host.executable.clone());
    let mut path = host.executable.as_path();
    loop {
        if path == host.system_root {
            return Err(not_found());
        }
        if path.file_name().is_some_and(|name| name == BIN_DIR) {
            return path.parent().map(Path::to_path_buf).ok_or_else(not_found);
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => path = parent,
            _ => return Err(not_found()),
        }
    }
}

/// Every file to copy from `old_root` to `opt.root_directory`.
pub fn plan_migrations(
    opt: &Options,
    old_root: &Path,
    strategy: &dyn PlatformMigration,
) -> Vec<FileMigration> {
    let new_root = &opt.root_directory;

    let binaries = opt.targets.iter().map(|(name, info)| {
        FileMigration::new(
            old_root
                .join(BIN_DIR)
                .join(name)
                .join(info.platform())
                .join(info.channel())
                .join(info.target_file()),
            new_root.join(BIN_DIR).join(info.target_file()),
        )
    });
    let support = SUPPORT_FILES
        .iter()
        .map(|file| FileMigration::new(old_root.join(file), new_root.join(file)));

    binaries
        .chain(support)
        .chain(strategy.extra_migrations(old_root, new_root))
        .collect()
}

/// Executable the service should launch after the migration.
pub fn service_exec_path(opt: &Options) -> PathBuf {
    opt.targets
        .local_target(SERVICE_TARGET, &opt.root_directory)
        .map(|local| local.exec_path)
        .unwrap_or_else(|_| opt.root_directory.join(BIN_DIR).join(SERVICE_TARGET))
}

/// Migrate a legacy install to `opt.root_directory`.
///
/// Returns `Ok(true)` when a migration happened (the caller should exit so
/// the service restarts from the new root) and `Ok(false)` when the running
/// executable already lives under the configured root.
pub fn migrate_root(
    opt: &Options,
    host: &HostEnv,
    runner: &dyn CommandRunner,
) -> Result<bool, MigrateError> {
    let strategy = for_host(host, runner);
    migrate_root_with(opt, host, strategy.as_ref())
}

/// [`migrate_root`] for the running process.
pub fn migrate_current_root(
    opt: &Options,
    runner: &dyn CommandRunner,
) -> Result<bool, MigrateError> {
    let host = HostEnv::current().map_err(MigrateError::Executable)?;
    migrate_root(opt, &host, runner)
}

/// [`migrate_root`] with an explicit platform strategy.
pub fn migrate_root_with(
    opt: &Options,
    host: &HostEnv,
    strategy: &dyn PlatformMigration,
) -> Result<bool, MigrateError> {
    let old_root = find_legacy_root(host)?;
    if old_root == opt.root_directory {
        // Fresh install, or already migrated.
        return Ok(false);
    }

    tracing::info!(
        from = %old_root.display(),
        to = %opt.root_directory.display(),
        "migrating to new root directory"
    );

    for migration in plan_migrations(opt, &old_root, strategy) {
        tracing::info!(
            from = %migration.old_path.display(),
            to = %migration.new_path.display(),
            "moving file"
        );
        migration.apply()?;
    }

    strategy.update_service_definition(&opt.root_directory, &service_exec_path(opt))?;

    let stale = [
        old_root,
        host.system_root.join("etc/default/orbit"),
        host.system_root.join("usr/local/bin/orbit"),
    ];
    for path in &stale {
        tracing::debug!(path = %path.display(), "removing");
        if let Err(err) = remove_all(path) {
            // Everything needed now lives under the new root.
            tracing::error!(path = %path.display(), error = %err, "failed to remove");
        }
    }

    Ok(true)
}
