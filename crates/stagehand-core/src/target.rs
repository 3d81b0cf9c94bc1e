//! Target naming and local path resolution.
//!
//! A target is identified by its logical name (e.g. `osqueryd`) and tracked
//! through a [`TargetInfo`]. Everything in this module is pure path
//! composition; no filesystem access happens here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Suffix identifying compressed bundle targets.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Directory under the root holding installed artifacts.
pub const BIN_DIR: &str = "bin";

/// Directory under the root holding in-flight downloads.
pub const STAGING_DIR: &str = "staging";

/// Tracking information for one update target.
///
/// ```
/// use stagehand_core::target::TargetInfo;
///
/// let info = TargetInfo::new("macos-app", "stable", "osqueryd.app.tar.gz")
///     .with_exec_sub_path(["osquery.app", "Contents", "MacOS", "osqueryd"]);
/// assert!(info.is_archive());
/// assert_eq!(info.with_channel("edge").channel(), "edge");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    platform: String,
    channel: String,
    target_file: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extracted_exec_sub_path: Vec<String>,
}

impl TargetInfo {
    pub fn new(
        platform: impl Into<String>,
        channel: impl Into<String>,
        target_file: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel: channel.into(),
            target_file: target_file.into(),
            extracted_exec_sub_path: Vec::new(),
        }
    }

    /// Location of the executable inside the extracted bundle.
    pub fn with_exec_sub_path<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extracted_exec_sub_path = segments.into_iter().map(Into::into).collect();
        self
    }

    /// Copy of this target tracking a different update channel.
    pub fn with_channel(&self, channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..self.clone()
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn target_file(&self) -> &str {
        &self.target_file
    }

    pub fn extracted_exec_sub_path(&self) -> &[String] {
        &self.extracted_exec_sub_path
    }

    pub fn is_archive(&self) -> bool {
        self.target_file.ends_with(ARCHIVE_SUFFIX)
    }

    fn validate(&self, name: &str) -> Result<(), UpdateError> {
        let invalid = |reason: &str| UpdateError::InvalidTarget {
            target: name.to_string(),
            reason: reason.to_string(),
        };

        if self.target_file.is_empty() {
            return Err(invalid("target file is empty"));
        }
        if self.target_file.contains(['/', '\\']) {
            return Err(invalid("target file must be a bare file name"));
        }
        if self.is_archive() && self.extracted_exec_sub_path.is_empty() {
            return Err(invalid("archive targets need an extracted executable sub path"));
        }
        if self
            .extracted_exec_sub_path
            .iter()
            .any(|s| s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']))
        {
            return Err(invalid("extracted executable sub path has an invalid segment"));
        }
        Ok(())
    }
}

/// Local paths of a target.
///
/// For an `osqueryd` target with file `osqueryd.app.tar.gz` and sub path
/// `osquery.app/Contents/MacOS/osqueryd`:
///
/// - `path`: `<root>/bin/osqueryd.app.tar.gz`
/// - `dir_path`: `<root>/bin/osquery.app`
/// - `exec_path`: `<root>/bin/osquery.app/Contents/MacOS/osqueryd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub info: TargetInfo,
    /// The artifact as downloaded from the repository.
    pub path: PathBuf,
    /// Root of the extracted bundle; `None` for plain executables.
    pub dir_path: Option<PathBuf>,
    /// The runnable executable.
    pub exec_path: PathBuf,
}

/// Targets tracked by an updater, keyed by logical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Targets(BTreeMap<String, TargetInfo>);

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, info: TargetInfo) -> Self {
        self.insert(name, info);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, info: TargetInfo) {
        self.0.insert(name.into(), info);
    }

    pub fn get(&self, name: &str) -> Option<&TargetInfo> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TargetInfo)> {
        self.0.iter().map(|(name, info)| (name.as_str(), info))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Switch a target to another update channel.
    pub fn set_channel(&mut self, name: &str, channel: &str) -> Result<(), UpdateError> {
        let info = self.info(name)?.with_channel(channel);
        self.0.insert(name.to_string(), info);
        Ok(())
    }

    /// Check every target for configuration errors.
    pub fn validate(&self) -> Result<(), UpdateError> {
        self.iter().try_for_each(|(name, info)| info.validate(name))
    }

    /// Path of the target in the remote repository:
    /// `<name>/<platform>/<channel>/<target_file>`.
    pub fn repo_path(&self, name: &str) -> Result<String, UpdateError> {
        let info = self.info(name)?;
        Ok([
            name,
            info.platform.as_str(),
            info.channel.as_str(),
            info.target_file.as_str(),
        ]
        .join("/"))
    }

    /// Resolve the local paths of a target under `root`.
    pub fn local_target(&self, name: &str, root: &Path) -> Result<LocalTarget, UpdateError> {
        let info = self.info(name)?;
        let bin = root.join(BIN_DIR);
        let path = bin.join(&info.target_file);

        if !info.is_archive() {
            return Ok(LocalTarget {
                info: info.clone(),
                exec_path: path.clone(),
                path,
                dir_path: None,
            });
        }

        let first = info
            .extracted_exec_sub_path
            .first()
            .ok_or_else(|| UpdateError::InvalidTarget {
                target: name.to_string(),
                reason: "archive targets need an extracted executable sub path".to_string(),
            })?;
        let exec_path = info
            .extracted_exec_sub_path
            .iter()
            .fold(bin.clone(), |acc, segment| acc.join(segment));

        Ok(LocalTarget {
            info: info.clone(),
            dir_path: Some(bin.join(first)),
            exec_path,
            path,
        })
    }

    fn info(&self, name: &str) -> Result<&TargetInfo, UpdateError> {
        self.0
            .get(name)
            .ok_or_else(|| UpdateError::UnknownTarget(name.to_string()))
    }
}

impl FromIterator<(String, TargetInfo)> for Targets {
    fn from_iter<T: IntoIterator<Item = (String, TargetInfo)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Whether a path names a compressed bundle.
pub fn is_archive_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(ARCHIVE_SUFFIX))
}
