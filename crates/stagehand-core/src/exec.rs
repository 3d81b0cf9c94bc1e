//! Host environment, subprocess execution and executable verification.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::archive::extract_tar_gz;
use crate::error::UpdateError;
use crate::fs::remove_all;
use crate::target::{TargetInfo, is_archive_path};

/// Operating system family, as far as the updater cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }

    /// Map a target platform tag to the OS it runs on.
    pub fn from_platform(platform: &str) -> Result<Self, UpdateError> {
        match platform {
            "macos" | "macos-app" => Ok(Self::MacOs),
            "windows" => Ok(Self::Windows),
            "linux" => Ok(Self::Linux),
            other => Err(UpdateError::UnknownPlatform(other.to_string())),
        }
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Process-wide facts the updater and the migration depend on.
///
/// Passed explicitly so tests can simulate other platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnv {
    pub os: HostOs,
    /// `/` on Unix, `%SystemDrive%\` on Windows.
    pub system_root: PathBuf,
    /// Path of the running executable.
    pub executable: PathBuf,
}

impl HostEnv {
    pub fn current() -> io::Result<Self> {
        let os = HostOs::current();
        let system_root = match os {
            HostOs::Windows => {
                let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".to_string());
                PathBuf::from(format!("{drive}{}", std::path::MAIN_SEPARATOR))
            }
            _ => PathBuf::from("/"),
        };
        Ok(Self {
            os,
            system_root,
            executable: std::env::current_exe()?,
        })
    }
}

/// Outcome of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            output: output.into(),
        }
    }
}

/// Subprocess capability.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion. `Err` means the process
    /// could not be started; a non-zero exit is reported in the output.
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<CommandOutput>;

    /// Locate `program` on `PATH`.
    fn lookup(&self, program: &str) -> Option<PathBuf>;
}

/// Runs real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Smoke test for freshly downloaded executables.
///
/// Runs the candidate with `--help` and requires a zero exit. This catches
/// truncated or wrong-architecture binaries; the signed hash remains the
/// actual trust boundary.
pub struct ExecVerifier<'a> {
    host: &'a HostEnv,
    runner: &'a dyn CommandRunner,
}

impl<'a> ExecVerifier<'a> {
    pub fn new(host: &'a HostEnv, runner: &'a dyn CommandRunner) -> Self {
        Self { host, runner }
    }

    /// Verify `candidate`, a downloaded artifact for `info`.
    ///
    /// Archives are extracted next to the candidate and the extracted tree
    /// is removed again whatever the outcome. Candidates for another OS are
    /// not executed.
    pub fn check(&self, info: &TargetInfo, candidate: &Path) -> Result<(), UpdateError> {
        let target_os = HostOs::from_platform(info.platform())?;
        if target_os != self.host.os {
            // Packaging for another platform (e.g. an MSI built on macOS).
            tracing::debug!(
                platform = info.platform(),
                host = %self.host.os,
                "skipping exec check for cross-platform target"
            );
            return Ok(());
        }

        if !is_archive_path(candidate) {
            return self.run_help(candidate);
        }

        let staging = candidate.parent().unwrap_or_else(|| Path::new("."));
        let sub_path = info.extracted_exec_sub_path();
        let first = sub_path.first().ok_or_else(|| UpdateError::InvalidTarget {
            target: info.target_file().to_string(),
            reason: "archive targets need an extracted executable sub path".to_string(),
        })?;
        let _cleanup = RemoveOnDrop(staging.join(first));

        extract_tar_gz(candidate).map_err(|source| UpdateError::Extraction {
            path: candidate.to_path_buf(),
            source,
        })?;
        let exec_path = sub_path
            .iter()
            .fold(staging.to_path_buf(), |acc, segment| acc.join(segment));
        self.run_help(&exec_path)
    }

    fn run_help(&self, exec_path: &Path) -> Result<(), UpdateError> {
        // Note that this fails for any binary returning non-zero for --help.
        let output = self
            .runner
            .run(exec_path, &["--help"])
            .map_err(UpdateError::io("exec new version", exec_path))?;
        if !output.success {
            return Err(UpdateError::ExecVerification {
                path: exec_path.to_path_buf(),
                output: output.output,
            });
        }
        Ok(())
    }
}

/// Removes the extracted check output, file or directory.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(err) = remove_all(&self.0) {
            tracing::warn!(
                path = %self.0.display(),
                error = %err,
                "failed to remove extracted check output"
            );
        }
    }
}
