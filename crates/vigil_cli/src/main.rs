//! Vigil CLI
//!
//! Command-line tools for inspecting a persisted sync store.
//!
//! # Commands
//!
//! - `inspect` - Display cached conversations and queued actions
//! - `verify` - Check the persisted cache and queue for consistency
//! - `dump-queue` - List pending actions
//! - `simulate` - Run an offline send scenario against mock services

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Vigil sync store tools.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display cached conversations and queued actions
    Inspect {
        /// List every cached message
        #[arg(short, long)]
        messages: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check ordering, uniqueness and budgets of the persisted cache
    Verify,

    /// List pending actions
    DumpQueue {
        /// Maximum number of actions to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Send messages offline, reconnect, and report what reached the server
    Simulate {
        /// Number of messages to send
        #[arg(short, long, default_value = "3")]
        messages: usize,

        /// Network failures injected before sends succeed
        #[arg(short, long, default_value = "0")]
        failures: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { messages, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, messages, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpQueue { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump-queue")?;
            commands::dump_queue::run(&path, limit, &format)?;
        }
        Commands::Simulate { messages, failures } => {
            commands::simulate::run(cli.path.as_deref(), messages, failures)?;
        }
        Commands::Version => {
            println!("Vigil CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Snapshot formats: cache v{}, queue v{}",
                vigil_protocol::CACHE_SNAPSHOT_VERSION,
                vigil_protocol::QUEUE_SNAPSHOT_VERSION
            );
        }
    }

    Ok(())
}
