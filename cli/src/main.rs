// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # NFSv3 Gateway CLI
//!
//! The `nfs3gw` binary inspects gateway configuration and file handles.
//!
//! ## Commands
//!
//! - `nfs3gw config show|validate|generate` - Configuration management
//! - `nfs3gw exports list` - Configured exports and their root handles
//! - `nfs3gw handle decode <HEX>` - Pick apart a file handle seen on the wire

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;

use commands::{ConfigCommand, ExportsCommand, HandleCommand};

/// NFSv3 Gateway - handle resolution and NLM4 lock coordination
#[derive(Parser)]
#[command(name = "nfs3gw")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "NFS3GW_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "NFS3GW_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Export inspection
    #[command(name = "exports")]
    Exports {
        #[command(subcommand)]
        command: ExportsCommand,
    },

    /// File handle inspection
    #[command(name = "handle")]
    Handle {
        #[command(subcommand)]
        command: HandleCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Exports { command }) => {
            commands::exports::handle_command(command, cli.config).await
        }
        Some(Commands::Handle { command }) => commands::handle::handle_command(command),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
