// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File handle inspection commands

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use thiserror::Error;

use nfs3_gateway_core::domain::file_handle::{FileHandle, HandleFlags};
use nfs3_gateway_core::infrastructure::nfs::{decode_file_handle, FileHandleError};

#[derive(Subcommand)]
pub enum HandleCommand {
    /// Decode a hex-encoded file handle
    Decode {
        /// Handle bytes as hex, e.g. copied from a packet capture
        #[arg(value_name = "HEX")]
        hex: String,
    },
}

#[derive(Debug, Error)]
pub enum HandleInputError {
    #[error("Handle is not valid hex: {0}")]
    NotHex(#[from] hex::FromHexError),

    #[error("Handle rejected: {0}")]
    Rejected(#[from] FileHandleError),
}

pub fn handle_command(command: HandleCommand) -> Result<()> {
    match command {
        HandleCommand::Decode { hex } => decode(&hex),
    }
}

/// Parse hex input, tolerating whitespace, `:` separators and a `0x` prefix
pub fn parse_handle(input: &str) -> Result<FileHandle, HandleInputError> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let bytes = hex::decode(cleaned)?;
    Ok(decode_file_handle(&bytes)?)
}

fn describe_flags(flags: HandleFlags) -> String {
    let mut names = Vec::new();
    if flags.contains(HandleFlags::ROOT) {
        names.push("ROOT");
    }
    if flags.contains(HandleFlags::DIRECTORY) {
        names.push("DIRECTORY");
    }
    if names.is_empty() {
        format!("0x{:02x}", flags.bits())
    } else {
        format!("0x{:02x} ({})", flags.bits(), names.join(" | "))
    }
}

fn decode(input: &str) -> Result<()> {
    let fh = parse_handle(input)?;

    println!("{}", "File handle:".bold());
    println!("  Export ID: {}", fh.export_id);
    println!("  Object ID: {}", fh.object_id);
    println!("  Flags: {}", describe_flags(fh.flags));
    println!(
        "  Root: {}",
        if fh.is_root() {
            "yes".green()
        } else {
            "no".normal()
        }
    );

    Ok(())
}
