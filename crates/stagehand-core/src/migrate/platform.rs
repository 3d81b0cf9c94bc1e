//! OS specific parts of the root migration.

use std::fs;
use std::path::{Path, PathBuf};

use regex::{Captures, Regex};

use super::{FileMigration, MigrateError};
use crate::exec::{CommandRunner, HostEnv, HostOs};

/// Windows service running the agent.
pub const WINDOWS_SERVICE_NAME: &str = "Fleet osquery";

/// How the host's service manager is pointed at the migrated install.
pub trait PlatformMigration {
    /// Files outside the shared support set that move with the install.
    fn extra_migrations(&self, old_root: &Path, new_root: &Path) -> Vec<FileMigration>;

    /// Rewrite the service definition to start `exec_path` from `new_root`.
    fn update_service_definition(&self, new_root: &Path, exec_path: &Path)
    -> Result<(), MigrateError>;
}

/// Pick the strategy for `host`.
pub fn for_host<'a>(
    host: &HostEnv,
    runner: &'a dyn CommandRunner,
) -> Box<dyn PlatformMigration + 'a> {
    match host.os {
        HostOs::Windows => Box::new(ScServiceStrategy { runner }),
        HostOs::Linux => Box::new(SystemdStrategy::new(&host.system_root, runner)),
        HostOs::MacOs => Box::new(LaunchdStrategy::new(&host.system_root, runner)),
        HostOs::Other => Box::new(NoServiceStrategy),
    }
}

fn secret_migration(old_root: &Path, new_root: &Path) -> FileMigration {
    FileMigration::new(old_root.join("secret.txt"), new_root.join("secret.txt"))
}

fn command_failed(what: &str, output: &str) -> MigrateError {
    MigrateError::Service(format!("{what}: {}", output.trim()))
}

// =============================================================================
// Windows
// =============================================================================

/// Edits the Windows service through `sc.exe`.
pub struct ScServiceStrategy<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ScServiceStrategy<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl PlatformMigration for ScServiceStrategy<'_> {
    fn extra_migrations(&self, old_root: &Path, new_root: &Path) -> Vec<FileMigration> {
        vec![secret_migration(old_root, new_root)]
    }

    fn update_service_definition(
        &self,
        _new_root: &Path,
        exec_path: &Path,
    ) -> Result<(), MigrateError> {
        let sc = self
            .runner
            .lookup("sc.exe")
            .ok_or_else(|| MigrateError::Service("find sc.exe in path".to_string()))?;

        // The configured arguments may have changed since install, so keep them.
        let query = self
            .runner
            .run(&sc, &["qc", WINDOWS_SERVICE_NAME])
            .map_err(|err| MigrateError::Service(format!("get service config: {err}")))?;
        if !query.success {
            return Err(command_failed("get service config", &query.output));
        }
        let bin_path = replace_binary_path(&query.output, exec_path)
            .ok_or_else(|| MigrateError::Service("get binary path".to_string()))?;

        tracing::debug!(service = WINDOWS_SERVICE_NAME, %bin_path, "updating service binary path");
        let edit = self
            .runner
            .run(&sc, &["config", WINDOWS_SERVICE_NAME, "binpath=", &bin_path])
            .map_err(|err| MigrateError::Service(format!("edit service: {err}")))?;
        if !edit.success {
            return Err(command_failed("edit service", &edit.output));
        }
        Ok(())
    }
}

/// Take the `BINARY_PATH_NAME` line of `sc qc` output and swap its
/// executable for `exec_path`, keeping the arguments.
fn replace_binary_path(sc_output: &str, exec_path: &Path) -> Option<String> {
    let exec = exec_path.display().to_string();
    let exec = if exec.contains(char::is_whitespace) {
        format!("\"{exec}\"")
    } else {
        exec
    };

    sc_output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["BINARY_PATH_NAME", _, _old, args @ ..] => {
                let mut parts = vec![exec.as_str()];
                parts.extend_from_slice(args);
                Some(parts.join(" "))
            }
            _ => None,
        }
    })
}

// =============================================================================
// Linux
// =============================================================================

/// Rewrites the systemd unit of the agent.
pub struct SystemdStrategy<'a> {
    runner: &'a dyn CommandRunner,
    system_root: PathBuf,
    unit_path: PathBuf,
}

impl<'a> SystemdStrategy<'a> {
    pub fn new(system_root: &Path, runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            system_root: system_root.to_path_buf(),
            unit_path: system_root.join("usr/lib/systemd/system/orbit.service"),
        }
    }

    pub fn with_unit_path(mut self, unit_path: PathBuf) -> Self {
        self.unit_path = unit_path;
        self
    }

    pub fn unit_path(&self) -> &Path {
        &self.unit_path
    }
}

impl PlatformMigration for SystemdStrategy<'_> {
    fn extra_migrations(&self, _old_root: &Path, new_root: &Path) -> Vec<FileMigration> {
        vec![FileMigration::new(
            self.system_root.join("etc/default/orbit"),
            new_root.join("env").join("orbit"),
        )]
    }

    fn update_service_definition(
        &self,
        new_root: &Path,
        exec_path: &Path,
    ) -> Result<(), MigrateError> {
        let unit_path = &self.unit_path;
        tracing::debug!(path = %unit_path.display(), "updating paths in unit file");

        let unit = fs::read_to_string(unit_path)
            .map_err(MigrateError::io("read unit file", unit_path))?;
        let env_file = new_root.join("env").join("orbit");
        let unit = rewrite_unit(&unit, &env_file, exec_path)?;
        // Writing through the existing file keeps its permissions.
        fs::write(unit_path, unit).map_err(MigrateError::io("write unit file", unit_path))?;

        let Some(systemctl) = self.runner.lookup("systemctl") else {
            tracing::debug!("systemctl not found, skipping daemon-reload");
            return Ok(());
        };
        tracing::debug!("reloading unit files");
        let reload = self
            .runner
            .run(&systemctl, &["daemon-reload"])
            .map_err(|err| MigrateError::Service(format!("systemctl daemon-reload: {err}")))?;
        if !reload.success {
            // The service is not restarted from the new root unless this succeeds.
            tracing::error!(output = %reload.output, "systemctl daemon-reload failed");
            return Err(command_failed("systemctl daemon-reload", &reload.output));
        }
        Ok(())
    }
}

fn rewrite_unit(unit: &str, env_file: &Path, exec_path: &Path) -> Result<String, MigrateError> {
    let env_file = env_file.display().to_string();
    let exec = exec_path.display().to_string();

    let env_re = Regex::new(r"(?m)^(EnvironmentFile=).*$")?;
    let exec_re = Regex::new(r"(?m)^(ExecStart=).*$")?;

    let unit = env_re.replace_all(unit, |caps: &Captures<'_>| format!("{}{}", &caps[1], env_file));
    let unit = exec_re.replace_all(&unit, |caps: &Captures<'_>| format!("{}{}", &caps[1], exec));
    Ok(unit.into_owned())
}

// =============================================================================
// macOS
// =============================================================================

/// Points the launchd daemon at the new executable.
pub struct LaunchdStrategy<'a> {
    runner: &'a dyn CommandRunner,
    plist_path: PathBuf,
}

impl<'a> LaunchdStrategy<'a> {
    pub fn new(system_root: &Path, runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            plist_path: system_root.join("Library/LaunchDaemons/com.fleetdm.orbit.plist"),
        }
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }
}

impl PlatformMigration for LaunchdStrategy<'_> {
    fn extra_migrations(&self, old_root: &Path, new_root: &Path) -> Vec<FileMigration> {
        vec![secret_migration(old_root, new_root)]
    }

    fn update_service_definition(
        &self,
        _new_root: &Path,
        exec_path: &Path,
    ) -> Result<(), MigrateError> {
        let plist = self.plist_path.display().to_string();
        let exec = exec_path.display().to_string();
        tracing::debug!(path = %plist, "updating paths in plist");

        let output = self
            .runner
            .run(
                Path::new("defaults"),
                &["write", &plist, "ProgramArguments", "-array", "-string", &exec],
            )
            .map_err(|err| MigrateError::Service(format!("defaults write {plist}: {err}")))?;
        if !output.success {
            return Err(command_failed(&format!("defaults write {plist}"), &output.output));
        }
        Ok(())
    }
}

// =============================================================================
// Other
// =============================================================================

/// Hosts without a known service manager; only files are moved.
pub struct NoServiceStrategy;

impl PlatformMigration for NoServiceStrategy {
    fn extra_migrations(&self, _old_root: &Path, _new_root: &Path) -> Vec<FileMigration> {
        Vec::new()
    }

    fn update_service_definition(
        &self,
        _new_root: &Path,
        _exec_path: &Path,
    ) -> Result<(), MigrateError> {
        Ok(())
    }
}
