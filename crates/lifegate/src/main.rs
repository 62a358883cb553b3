//! lg - lifegate CLI
//!
//! Lists lifecycle states, validates configuration files and boots a
//! simulated engine against a real lifecycle to show when parked calls are
//! delivered.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lifegate_core::config::LogFormat;
use lifegate_core::logging::{LogConfig, LogLevel, init_logging};
use lifegate_core::{Config, LifecycleState, ProfileSelection};
use serde::Serialize;

mod simulate;

/// lg - lifecycle-gated deferred calls
#[derive(Parser, Debug)]
#[command(name = "lg")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "LG_LOG_LEVEL")]
    log_level: LogLevel,

    /// Log format (pretty, json)
    #[arg(long, global = true, default_value = "pretty", env = "LG_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List lifecycle states in order
    States {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Boot a simulated engine and report every delivery
    Simulate(simulate::SimulateArgs),

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Load and validate a configuration file
    Check {
        /// Path to the TOML file
        path: PathBuf,
    },
}

#[derive(Serialize)]
struct StateRow {
    rank: u8,
    name: &'static str,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::at(cli.log_level, cli.log_format))
        .context("failed to initialize logging")?;

    match cli.command {
        Commands::States { json } => list_states(json),
        Commands::Simulate(args) => simulate::run(&args),
        Commands::Config(ConfigCommands::Check { path }) => check_config(&path),
    }
}

fn list_states(json: bool) -> Result<()> {
    if json {
        let rows: Vec<StateRow> = LifecycleState::ALL
            .iter()
            .map(|state| StateRow {
                rank: state.rank(),
                name: state.as_str(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for state in LifecycleState::ALL {
            println!("{} {}", state.rank(), state);
        }
    }
    Ok(())
}

fn check_config(path: &std::path::Path) -> Result<()> {
    let config = Config::load(path)
        .with_context(|| format!("invalid configuration: {}", path.display()))?;

    let profile = match &config.launch.profile {
        ProfileSelection::Default { name } => format!("default ({name})"),
        ProfileSelection::Guest { dir } => format!("guest ({})", dir.display()),
        ProfileSelection::Custom => "custom".to_string(),
    };
    println!("config ok: {}", path.display());
    println!(
        "  buffer: initial_capacity={} pending_warn_threshold={}",
        config.buffer.initial_capacity, config.buffer.pending_warn_threshold
    );
    println!(
        "  launch: thread_name={} profile={profile} debugging={}",
        config.launch.thread_name, config.launch.debugging
    );
    println!(
        "  logging: level={} format={}",
        config.logging.level, config.logging.format
    );
    Ok(())
}
