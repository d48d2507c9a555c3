//! # Duchy CLI Module
//!
//! This module implements the CLI interface for the duchy daemon.
//!
//! ## Available Commands
//!
//! - `run` - Run the herald and the mills until Ctrl-C
//! - `status` - List local computations
//! - `stages` - Print the stage table and legal transitions
//! - `init` - Create an empty database

mod commands;

use crate::config::ConfigError;
use crate::mill::MillError;
use clap::{Parser, Subcommand};
use duchy_core::DuchyError;
use std::path::PathBuf;
use thiserror::Error;

pub use commands::*;

/// Errors surfaced to the operator.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] DuchyError),

    #[error(transparent)]
    Mill(#[from] MillError),

    #[error("IO error: {0}")]
    Io(String),
}

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Duchy - Liquid Legions sketch aggregation worker
///
/// Runs the mills and the herald of one duchy against its local
/// computation database.
#[derive(Parser, Debug)]
#[command(name = "duchy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "duchy.toml")]
    pub config: PathBuf,

    /// Path to the computation database (overrides the config file)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the herald and the mills until Ctrl-C
    Run,

    /// List local computations
    Status,

    /// Print the stage table and legal transitions
    Stages,

    /// Create an empty computation database
    Init {
        /// Recreate the database even if it exists
        #[arg(short, long)]
        force: bool,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let database = cli.database.as_deref();

    match cli.command {
        Some(Commands::Run) => cmd_run(&cli.config, database, cli.quiet).await,
        Some(Commands::Status) => cmd_status(&cli.config, database, cli.json),
        Some(Commands::Stages) => cmd_stages(cli.json),
        Some(Commands::Init { force }) => cmd_init(&cli.config, database, force),
        None => {
            // No subcommand - show status by default
            cmd_status(&cli.config, database, cli.json)
        }
    }
}
