//! Configuration schema for stagehand.toml

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::metadata::{LocalStore, parse_root_keys};
use crate::target::Targets;
use crate::updater::Options;

/// Default update server.
pub const DEFAULT_URL: &str = "https://tuf.fleetctl.com";

/// Root key set of the default update server.
pub const DEFAULT_ROOT_KEYS: &str = r#"[{"keytype":"ed25519","scheme":"ed25519","keyid_hash_algorithms":["sha256","sha512"],"keyval":{"public":"6d71d3beac3b830be929f2b10d513448d49ec6bb62a680176b89ffdfca180eb4"}}]"#;

/// Install root used when none is configured.
pub fn default_root_directory() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\Stagehand")
    } else {
        PathBuf::from("/opt/stagehand")
    }
}

fn default_server_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_root_keys() -> String {
    DEFAULT_ROOT_KEYS.to_string()
}

/// Root configuration structure for stagehand.toml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagehandConfig {
    /// Directory holding `bin/`, `staging/` and the support files
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,

    /// Base URL of the update repository
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_transport: bool,

    /// JSON encoded root key set used on first run
    #[serde(default = "default_root_keys")]
    pub root_keys: String,

    /// Tracked targets, keyed by name
    #[serde(default)]
    pub targets: Targets,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            root_directory: default_root_directory(),
            server_url: default_server_url(),
            insecure_transport: false,
            root_keys: default_root_keys(),
            targets: Targets::default(),
        }
    }
}

impl StagehandConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server_url: {}", self.server_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "Invalid server_url: {} (expected an http or https URL)",
                self.server_url
            );
        }

        parse_root_keys(&self.root_keys).context("Invalid root_keys")?;

        if self.root_directory.as_os_str().is_empty() {
            anyhow::bail!("root_directory must not be empty");
        }

        self.targets.validate().context("Invalid targets")?;
        Ok(())
    }

    /// Updater options for this configuration.
    pub fn to_options(&self, local_store: Arc<dyn LocalStore>) -> Options {
        Options {
            root_directory: self.root_directory.clone(),
            server_url: self.server_url.clone(),
            insecure_transport: self.insecure_transport,
            root_keys: self.root_keys.clone(),
            local_store,
            targets: self.targets.clone(),
        }
    }
}
