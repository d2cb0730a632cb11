use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use kiln::config::Config;
use kiln::plugins::{LoadMode, PluginDescriptor, PluginRegistry, RegistryOptions};

/// Kiln - discover, deploy and manage host plugins
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Plugin root directory
    #[arg(short, long)]
    plugins_dir: Option<PathBuf>,

    /// Host version plugins must declare support for
    #[arg(long)]
    host_version: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loaded and incompatible plugins
    List {
        /// Only show installed plugins
        #[arg(long)]
        installed: bool,

        /// Only show plugins in this group
        #[arg(long)]
        group: Option<String>,
    },
    /// Mark a plugin as installed
    Install { name: String },
    /// Mark a plugin as uninstalled
    Uninstall { name: String },
    /// Mark every plugin as uninstalled
    UninstallAll,
    /// Delete an uninstalled plugin's folder
    Delete { name: String },
    /// Delete reserve shadow-copy folders left by earlier runs
    PurgeReserve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr) // Keep stdout for command output
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    // Load configuration
    let mut config = if let Some(config_path) = args.config {
        Config::load_from_file(&config_path)?
    } else {
        Config::load_default()?
    };

    if let Some(dir) = args.plugins_dir {
        config.plugins.directory = dir;
    }
    if let Some(version) = args.host_version {
        config.plugins.host_version = version;
    }

    let registry = Arc::new(PluginRegistry::from_config(&config.plugins));
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling plugin initialization");
            interrupt.cancel();
        }
    });

    registry
        .initialize_in_background(RegistryOptions::from_config(&config.plugins), cancel)
        .await
        .context("Plugin loader task panicked")?
        .context("Failed to initialize plugins")?;

    match args.command.unwrap_or(Command::List {
        installed: false,
        group: None,
    }) {
        Command::List { installed, group } => {
            let mode = if installed {
                LoadMode::InstalledOnly
            } else {
                LoadMode::All
            };
            print_plugins(&registry.descriptors(mode, group.as_deref()));

            let incompatible = registry.all_incompatible();
            if !incompatible.is_empty() {
                println!("\nIncompatible: {}", incompatible.join(", "));
            }
        }
        Command::Install { name } => {
            require_plugin(&registry, &name)?;
            registry.mark_installed(&name)?;
            println!("Installed {name}");
        }
        Command::Uninstall { name } => {
            require_plugin(&registry, &name)?;
            registry.mark_uninstalled(&name)?;
            println!("Uninstalled {name}");
        }
        Command::UninstallAll => {
            registry.mark_all_uninstalled()?;
            println!("Uninstalled all plugins");
        }
        Command::Delete { name } => {
            if !registry.delete_artifacts(&name) {
                bail!("Could not delete {name}; make sure it exists and is uninstalled");
            }
            println!("Deleted {name}");
        }
        Command::PurgeReserve => {
            let removed = registry.purge_reserve_directories()?;
            println!("Removed {removed} reserve folder(s)");
        }
    }

    Ok(())
}

fn require_plugin(registry: &PluginRegistry, name: &str) -> Result<()> {
    if registry.find_by_system_name(name).is_none() {
        bail!("No loaded plugin named {name}");
    }
    Ok(())
}

fn print_plugins(plugins: &[PluginDescriptor]) {
    println!(
        "{:<32} {:<24} {:<10} {:<16} {}",
        "SYSTEM NAME", "NAME", "VERSION", "GROUP", "INSTALLED"
    );
    for plugin in plugins {
        println!(
            "{:<32} {:<24} {:<10} {:<16} {}",
            plugin.system_name,
            plugin.friendly_name,
            plugin.version,
            plugin.group,
            if plugin.installed { "yes" } else { "no" }
        );
    }
}
