//! Stagehand - secure target updater
//!
//! Usage:
//!   stagehand path orbit                # Show where a target is installed
//!   stagehand extract desktop.tar.gz    # Extract a bundle next to itself
//!   stagehand dev-build orbit ./orbit   # Override a target with a local build
//!   stagehand migrate-root              # Move a legacy install to the configured root
//!   stagehand channel orbit edge        # Track another update channel
//!   stagehand metadata timestamp.json   # Fetch a raw role document

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand_core::archive::extract_tar_gz;
use stagehand_core::metadata::remote::{HttpRemoteStore, RemoteStore};
use stagehand_core::migrate::migrate_current_root;
use stagehand_core::prelude::*;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Secure target updater", long_about = None)]
struct Cli {
    /// Path to stagehand.toml (defaults to the user config directory)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local paths of a target
    Path {
        /// Target name from stagehand.toml
        target: String,
    },

    /// Extract a .tar.gz bundle into its parent directory
    Extract {
        /// Archive to extract
        archive: PathBuf,
    },

    /// Replace a target's executable with a local build
    DevBuild {
        /// Target name from stagehand.toml
        target: String,
        /// Local build to install
        path: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Move a legacy install to the configured root directory
    MigrateRoot,

    /// Switch the update channel of a target
    Channel {
        /// Target name from stagehand.toml
        target: String,
        /// New channel (e.g. stable, edge)
        channel: String,
    },

    /// Print a role document from the update server without verifying it
    Metadata {
        /// Role file name (e.g. timestamp.json)
        name: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagehand=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store = match cli.config {
        Some(path) => ConfigStore::from_path(path),
        None => ConfigStore::from_default()?,
    };

    match cli.command {
        Commands::Path { target } => run_path(&store, &target),
        Commands::Extract { archive } => run_extract(&archive),
        Commands::DevBuild { target, path, yes } => run_dev_build(&store, &target, &path, yes),
        Commands::MigrateRoot => run_migrate_root(&store),
        Commands::Channel { target, channel } => run_channel(&store, &target, &channel),
        Commands::Metadata { name } => run_metadata(&store, &name),
    }
}

/// Updater over the configured targets that never touches the network.
fn offline_updater(config: &StagehandConfig) -> Result<Updater> {
    let local_store = Arc::new(FileLocalStore::in_root(&config.root_directory));
    Updater::new_disabled(config.to_options(local_store)).context("Invalid updater options")
}

fn run_path(store: &ConfigStore, target: &str) -> Result<()> {
    let config = store.load()?;
    let updater = offline_updater(&config)?;
    let local = updater.local_target(target)?;

    println!("{}", style(target).bold());
    println!("  Repository: {}", updater.repo_path(target)?);
    println!("  Artifact:   {}", local.path.display());
    if let Some(dir) = &local.dir_path {
        println!("  Extracted:  {}", dir.display());
    }
    println!("  Executable: {}", local.exec_path.display());

    let state = match local.exec_path.try_exists() {
        Ok(true) => style("installed").green(),
        Ok(false) => style("missing").yellow(),
        Err(_) => style("unknown").red(),
    };
    println!("  State:      {state}");
    Ok(())
}

fn run_extract(archive: &Path) -> Result<()> {
    extract_tar_gz(archive)
        .with_context(|| format!("Failed to extract {}", archive.display()))?;
    println!(
        "{} Extracted {}",
        style("✓").green(),
        style(archive.display()).cyan()
    );
    Ok(())
}

fn run_dev_build(store: &ConfigStore, target: &str, path: &Path, yes: bool) -> Result<()> {
    let config = store.load()?;
    let mut updater = offline_updater(&config)?;
    let exec_path = updater.executable_local_path(target)?;

    println!();
    println!(
        "{}",
        style("!! Development build override !!").bold().yellow()
    );
    println!(
        "  {} will replace {}",
        style(path.display()).cyan(),
        style(exec_path.display()).cyan()
    );
    println!("  The next update overwrites it again.");
    println!();

    if !yes {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Install the development build?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let local = updater.copy_dev_build(target, path)?;
    println!(
        "{} Installed {} at {}",
        style("✓").green(),
        style(target).bold(),
        local.exec_path.display()
    );
    Ok(())
}

fn run_migrate_root(store: &ConfigStore) -> Result<()> {
    let config = store.load()?;
    config.validate()?;
    let opt = config.to_options(Arc::new(MemoryLocalStore::new()));

    if migrate_current_root(&opt, &SystemRunner)? {
        println!(
            "{} Migrated install to {}. Restart the service to run from the new root.",
            style("✓").green(),
            config.root_directory.display()
        );
    } else {
        println!("Already running from {}", config.root_directory.display());
    }
    Ok(())
}

fn run_channel(store: &ConfigStore, target: &str, channel: &str) -> Result<()> {
    let mut config = store.load()?;
    let previous = config
        .targets
        .get(target)
        .map(|info| info.channel().to_string())
        .ok_or_else(|| anyhow::anyhow!("Unknown target: {}", target))?;

    config.targets.set_channel(target, channel)?;
    store.save(&config)?;

    println!(
        "{}: {} -> {}",
        style(target).bold(),
        previous,
        style(channel).green()
    );
    println!("  Repository: {}", config.targets.repo_path(target)?);
    Ok(())
}

fn run_metadata(store: &ConfigStore, name: &str) -> Result<()> {
    let config = store.load()?;
    let remote = HttpRemoteStore::new(&config.server_url, config.insecure_transport)?;

    let url = remote.meta_url(name)?;
    tracing::debug!(%url, "fetching role document");
    let mut file = remote.get_meta(name)?;
    let mut body = Vec::new();
    file.reader
        .read_to_end(&mut body)
        .with_context(|| format!("Failed to read {}", name))?;

    io::stdout().write_all(&body)?;
    Ok(())
}
