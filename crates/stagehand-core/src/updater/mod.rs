//! Download, verify and install pipeline
//!
//! [`Updater::get`] is the entry point: it compares the installed artifact
//! of a target against the verified repository metadata, downloads a fresh
//! copy into `<root>/staging` when needed, smoke-tests it and renames it over
//! `<root>/bin/<file>`. The live artifact is only ever replaced by a rename.
//!
//! An `Updater` assumes it is the only writer under its root directory.
//! Callers running several processes against the same root must serialize
//! them externally.

mod destination;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::extract_tar_gz;
use crate::config::{DEFAULT_ROOT_KEYS, DEFAULT_URL};
use crate::error::UpdateError;
use crate::exec::{CommandRunner, ExecVerifier, HostEnv, HostOs, SystemRunner};
use crate::fs::{DEFAULT_DIR_MODE, DEFAULT_EXECUTABLE_MODE, perms, remove_all, secure};
use crate::metadata::{
    INITIAL_ROOT_VERSION, LocalStore, MetadataClient, ROOT_METADATA, TargetFileMeta,
    TargetFiles, check_file_hash, parse_root_keys,
};
use crate::target::{BIN_DIR, LocalTarget, STAGING_DIR, TargetInfo, Targets};

pub use destination::{CancelToken, FileDestination};

/// Updater configuration.
#[derive(Clone)]
pub struct Options {
    /// Directory holding `bin/`, `staging/` and the metadata cache.
    pub root_directory: PathBuf,
    pub server_url: String,
    /// Skip TLS certificate verification. Downloads are still checked
    /// against the signed hashes.
    pub insecure_transport: bool,
    /// JSON encoded root key set, used only on first run.
    pub root_keys: String,
    pub local_store: Arc<dyn LocalStore>,
    pub targets: Targets,
}

impl Options {
    /// Options for the default server with no targets.
    pub fn new(root_directory: impl Into<PathBuf>, local_store: Arc<dyn LocalStore>) -> Self {
        Self {
            root_directory: root_directory.into(),
            server_url: DEFAULT_URL.to_string(),
            insecure_transport: false,
            root_keys: DEFAULT_ROOT_KEYS.to_string(),
            local_store,
            targets: Targets::new(),
        }
    }

    pub fn with_target(mut self, name: impl Into<String>, info: TargetInfo) -> Self {
        self.targets.insert(name, info);
        self
    }

    pub fn with_root_keys(mut self, root_keys: impl Into<String>) -> Self {
        self.root_keys = root_keys.into();
        self
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("root_directory", &self.root_directory)
            .field("server_url", &self.server_url)
            .field("insecure_transport", &self.insecure_transport)
            .field("targets", &self.targets)
            .finish_non_exhaustive()
    }
}

/// Keeps the configured targets in sync with the remote repository.
pub struct Updater {
    opt: Options,
    client: Option<Box<dyn MetadataClient>>,
    host: HostEnv,
    runner: Arc<dyn CommandRunner>,
    cancel: CancelToken,
}

impl Updater {
    /// Create an updater driving `client`.
    ///
    /// Trust is bootstrapped from `opt.root_keys` only when the local store
    /// holds no root metadata yet. Once it does, the stored root is
    /// authoritative and the configured keys are ignored.
    pub fn new(opt: Options, mut client: Box<dyn MetadataClient>) -> Result<Self, UpdateError> {
        opt.targets.validate()?;
        let keys = parse_root_keys(&opt.root_keys).map_err(UpdateError::RootKeys)?;

        let bootstrapped = match opt.local_store.get_meta() {
            Ok(meta) => meta.contains_key(ROOT_METADATA),
            Err(err) => {
                tracing::warn!(error = %err, "read local metadata, bootstrapping trust");
                false
            }
        };
        if bootstrapped {
            tracing::debug!("root metadata present, skipping trust bootstrap");
        } else {
            client
                .init(&keys, INITIAL_ROOT_VERSION)
                .map_err(UpdateError::Init)?;
        }

        let bin = opt.root_directory.join(BIN_DIR);
        secure::mkdir_all(&bin, DEFAULT_DIR_MODE).map_err(UpdateError::io("create bin dir", &bin))?;

        Ok(Self {
            opt,
            client: Some(client),
            host: current_host()?,
            runner: Arc::new(SystemRunner),
            cancel: CancelToken::new(),
        })
    }

    /// Create an updater without a metadata client.
    ///
    /// Path accessors and [`Updater::copy_dev_build`] work; every operation
    /// that needs the repository fails with [`UpdateError::Disabled`].
    pub fn new_disabled(opt: Options) -> Result<Self, UpdateError> {
        opt.targets.validate()?;
        Ok(Self {
            opt,
            client: None,
            host: current_host()?,
            runner: Arc::new(SystemRunner),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_host(mut self, host: HostEnv) -> Self {
        self.host = host;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts in-flight downloads of this updater.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &Options {
        &self.opt
    }

    pub fn host(&self) -> &HostEnv {
        &self.host
    }

    pub fn is_disabled(&self) -> bool {
        self.client.is_none()
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Pull the latest signed metadata. Already being current is success.
    pub fn update_metadata(&mut self) -> Result<(), UpdateError> {
        let client = self.client.as_mut().ok_or(UpdateError::Disabled)?;
        match client.update() {
            Ok(()) => {
                tracing::debug!("metadata updated");
                Ok(())
            }
            Err(err) if err.is_latest_snapshot() => {
                tracing::debug!("metadata already at latest snapshot");
                Ok(())
            }
            Err(err) => Err(UpdateError::MetadataRefresh(err)),
        }
    }

    /// Verified metadata of a configured target.
    pub fn lookup(&self, target: &str) -> Result<TargetFileMeta, UpdateError> {
        let client = self.client.as_ref().ok_or(UpdateError::Disabled)?;
        let repo_path = self.opt.targets.repo_path(target)?;
        client
            .target(&repo_path)
            .map_err(|source| UpdateError::Lookup {
                target: target.to_string(),
                source,
            })
    }

    /// Every file in the verified repository, keyed by repository path.
    pub fn targets(&self) -> Result<TargetFiles, UpdateError> {
        let client = self.client.as_ref().ok_or(UpdateError::Disabled)?;
        client.targets().map_err(UpdateError::ListTargets)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    pub fn repo_path(&self, target: &str) -> Result<String, UpdateError> {
        self.opt.targets.repo_path(target)
    }

    pub fn local_target(&self, target: &str) -> Result<LocalTarget, UpdateError> {
        self.opt
            .targets
            .local_target(target, &self.opt.root_directory)
    }

    /// Where the runnable executable of `target` lives once installed.
    pub fn executable_local_path(&self, target: &str) -> Result<PathBuf, UpdateError> {
        Ok(self.local_target(target)?.exec_path)
    }

    /// Root of the extracted bundle, `None` for plain executables.
    pub fn dir_local_path(&self, target: &str) -> Result<Option<PathBuf>, UpdateError> {
        Ok(self.local_target(target)?.dir_path)
    }

    /// Switch `target` to another update channel for subsequent calls.
    pub fn set_target_channel(&mut self, target: &str, channel: &str) -> Result<(), UpdateError> {
        self.opt.targets.set_channel(target, channel)
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Make sure the latest verified version of `target` is installed and
    /// return its local paths.
    ///
    /// Nothing is downloaded when the installed artifact already matches
    /// the metadata. On any error the previously installed artifact is left
    /// in place.
    pub fn get(&mut self, target: &str) -> Result<LocalTarget, UpdateError> {
        if target.is_empty() {
            return Err(UpdateError::EmptyTarget);
        }
        let local = self.local_target(target)?;
        let repo_path = self.opt.targets.repo_path(target)?;

        match fs::symlink_metadata(&local.path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(name = target, path = %local.path.display(), "target not installed, downloading");
                self.download(&repo_path, &local)?;
            }
            Err(source) => {
                return Err(UpdateError::Io {
                    context: "stat local target",
                    path: local.path.clone(),
                    source,
                });
            }
            Ok(meta) if !meta.is_file() => {
                return Err(UpdateError::LocalPathConflict(local.path.clone()));
            }
            Ok(_) => {
                let meta = self.lookup(target)?;
                match check_file_hash(&meta, &local.path) {
                    Ok(()) => {
                        tracing::debug!(name = target, "installed target is current");
                    }
                    Err(err) if err.is_mismatch() => {
                        tracing::info!(name = target, reason = %err, "installed target is stale, downloading");
                        self.download(&repo_path, &local)?;
                    }
                    Err(source) => {
                        return Err(UpdateError::HashCheck {
                            path: local.path.clone(),
                            source,
                        });
                    }
                }
            }
        }

        if local.dir_path.is_some() {
            self.ensure_extracted(&local)?;
        }
        Ok(local)
    }

    fn ensure_extracted(&self, local: &LocalTarget) -> Result<(), UpdateError> {
        match fs::symlink_metadata(&local.exec_path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %local.path.display(), "extracting bundle");
                extract_tar_gz(&local.path).map_err(|source| UpdateError::Extraction {
                    path: local.path.clone(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(UpdateError::Io {
                    context: "stat executable",
                    path: local.exec_path.clone(),
                    source,
                });
            }
        }

        match fs::symlink_metadata(&local.exec_path) {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(UpdateError::CorruptArtifact(local.exec_path.clone())),
            // The bundle did not contain the executable.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(UpdateError::CorruptArtifact(local.exec_path.clone()))
            }
            Err(source) => Err(UpdateError::Io {
                context: "stat executable",
                path: local.exec_path.clone(),
                source,
            }),
        }
    }

    /// Download `repo_path` into staging, verify it and rename it into place.
    ///
    /// Any extraction of the previous version is discarded before the new
    /// artifact is renamed into place. If that fails, the old artifact stays
    /// live and the old tree is never paired with the new bytes.
    ///
    /// On Windows the live executable is first renamed to `<file>.old`. A
    /// leftover `.old` from an earlier update is removed first. If the old
    /// image is still running, that removal fails, and so does the update,
    /// until the process restarts.
    fn download(&mut self, repo_path: &str, local: &LocalTarget) -> Result<(), UpdateError> {
        let Self {
            opt,
            client,
            host,
            runner,
            cancel,
        } = self;
        let client = client.as_mut().ok_or(UpdateError::Disabled)?;

        let staging = opt.root_directory.join(STAGING_DIR);
        secure::mkdir_all(&staging, DEFAULT_DIR_MODE)
            .map_err(UpdateError::io("create staging dir", &staging))?;
        perms::chmod_executable_directory(&staging)
            .map_err(UpdateError::io("chmod staging dir", &staging))?;

        let file_name = local
            .path
            .file_name()
            .ok_or_else(|| UpdateError::InvalidTarget {
                target: repo_path.to_string(),
                reason: "target path has no file name".to_string(),
            })?;
        let tmp_path = staging.join(file_name);
        let file = secure::open_file(
            &tmp_path,
            OpenOptions::new().create(true).write(true).truncate(true),
            DEFAULT_EXECUTABLE_MODE,
        )
        .map_err(UpdateError::io("open temp file for download", &tmp_path))?;
        let staged = RemoveFileOnDrop::new(tmp_path.clone());
        perms::chmod_executable(&tmp_path)
            .map_err(UpdateError::io("chmod temp download", &tmp_path))?;

        if let Some(dir) = local.path.parent() {
            secure::mkdir_all(dir, DEFAULT_DIR_MODE)
                .map_err(UpdateError::io("create dir for target", dir))?;
            perms::chmod_executable_directory(dir)
                .map_err(UpdateError::io("chmod dir for target", dir))?;
        }

        let mut dest = FileDestination::new(file, cancel.clone());
        if let Err(source) = client.download(repo_path, &mut dest) {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled(repo_path.to_string()));
            }
            return Err(UpdateError::Download {
                repo_path: repo_path.to_string(),
                source,
            });
        }
        dest.finish()
            .map_err(UpdateError::io("close temp download", &tmp_path))?;

        ExecVerifier::new(host, runner.as_ref()).check(&local.info, &tmp_path)?;

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled(repo_path.to_string()));
        }

        if let Some(dir) = &local.dir_path {
            remove_stale_extraction(dir)?;
        }

        if host.os == HostOs::Windows {
            // A running executable cannot be replaced, but it can be renamed.
            let old = old_path(&local.path);
            remove_all(&old).map_err(UpdateError::io("remove previous old", &old))?;
            match fs::rename(&local.path, &old) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(UpdateError::Io {
                        context: "rename old",
                        path: local.path.clone(),
                        source,
                    });
                }
            }
        }
        fs::rename(&tmp_path, &local.path)
            .map_err(UpdateError::io("move download", &local.path))?;
        staged.disarm();

        tracing::info!(repo_path, path = %local.path.display(), "installed target");
        Ok(())
    }

    // =========================================================================
    // Development
    // =========================================================================

    /// Replace the executable of `target` with a local build.
    ///
    /// Only meant for development: the copied file is not verified against
    /// any metadata.
    pub fn copy_dev_build(
        &mut self,
        target: &str,
        dev_build_path: &Path,
    ) -> Result<LocalTarget, UpdateError> {
        let local = self.local_target(target)?;
        let dst = &local.exec_path;

        if let Some(dir) = dst.parent() {
            secure::mkdir_all(dir, DEFAULT_DIR_MODE)
                .map_err(UpdateError::io("create dir for dev build", dir))?;
        }

        let mut src = secure::open_file(
            dev_build_path,
            OpenOptions::new().read(true),
            DEFAULT_EXECUTABLE_MODE,
        )
        .map_err(UpdateError::io("open dev build", dev_build_path))?;
        let mut out = secure::open_file(
            dst,
            OpenOptions::new().create(true).write(true).truncate(true),
            DEFAULT_EXECUTABLE_MODE,
        )
        .map_err(UpdateError::io("open dev build target", dst))?;
        io::copy(&mut src, &mut out).map_err(UpdateError::io("copy dev build", dst))?;
        drop(out);
        perms::chmod_executable(dst).map_err(UpdateError::io("chmod dev build", dst))?;

        tracing::warn!(name = target, from = %dev_build_path.display(), "installed unverified dev build");
        Ok(local)
    }
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("opt", &self.opt)
            .field("disabled", &self.client.is_none())
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

fn current_host() -> Result<HostEnv, UpdateError> {
    HostEnv::current().map_err(UpdateError::io("resolve current executable", PathBuf::new()))
}

fn old_path(path: &Path) -> PathBuf {
    let mut old = path.as_os_str().to_owned();
    old.push(".old");
    PathBuf::from(old)
}

fn remove_stale_extraction(path: &Path) -> Result<(), UpdateError> {
    remove_all(path).map_err(UpdateError::io("remove stale extraction", path))?;
    tracing::debug!(path = %path.display(), "removed stale extraction");
    Ok(())
}

/// Removes a staged file unless disarmed.
struct RemoveFileOnDrop {
    path: PathBuf,
    armed: bool,
}

impl RemoveFileOnDrop {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RemoveFileOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "remove staged download");
            }
        }
    }
}
