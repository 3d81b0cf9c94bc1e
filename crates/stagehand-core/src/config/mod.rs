//! Configuration management
//!
//! A single `stagehand.toml` describes where artifacts are installed, which
//! repository they come from and which targets are tracked:
//!
//! ```toml
//! root_directory = "/opt/stagehand"
//! server_url = "https://tuf.fleetctl.com"
//!
//! [targets.orbit]
//! platform = "linux"
//! channel = "stable"
//! target_file = "orbit"
//! ```

pub mod parser;
pub mod schema;
pub mod store;

pub use parser::{parse_stagehand_toml, parse_stagehand_toml_str, to_toml};
pub use schema::{DEFAULT_ROOT_KEYS, DEFAULT_URL, StagehandConfig, default_root_directory};
pub use store::{CONFIG_FILE, ConfigStore};
