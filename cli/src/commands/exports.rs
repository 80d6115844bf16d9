// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Export inspection commands

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use nfs3_gateway_core::application::ExportTable;
use nfs3_gateway_core::domain::config::GatewayConfigManifest;
use nfs3_gateway_core::infrastructure::nfs::encode_file_handle;

#[derive(Subcommand)]
pub enum ExportsCommand {
    /// List configured exports with their root handles
    List,
}

pub async fn handle_command(
    command: ExportsCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ExportsCommand::List => list(config_override).await,
    }
}

/// One line per export: name, id and root handle in hex
pub fn export_rows(table: &ExportTable) -> Result<Vec<(String, String, String)>> {
    table
        .list()
        .into_iter()
        .map(|export| {
            let fh = encode_file_handle(&export.root_handle())
                .with_context(|| format!("Failed to encode root handle of {}", export.name))?;
            Ok((export.name.clone(), export.id.to_string(), hex::encode(fh)))
        })
        .collect()
}

async fn list(config_override: Option<PathBuf>) -> Result<()> {
    let config = GatewayConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let table = ExportTable::from_config(&config.spec).context("Failed to build export table")?;
    let rows = export_rows(&table)?;

    if rows.is_empty() {
        println!("{}", "No exports configured".yellow());
        return Ok(());
    }

    println!("{:<16} {:<38} {}", "NAME".bold(), "EXPORT ID".bold(), "ROOT HANDLE".bold());
    for (name, id, handle) in rows {
        println!("{:<16} {:<38} {}", name, id, handle.dimmed());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfs3_gateway_core::infrastructure::nfs::{decode_file_handle, FILE_HANDLE_SIZE};

    #[test]
    fn test_rows_carry_decodable_root_handles() {
        let yaml = r#"
apiVersion: nfs3gw/v1
kind: GatewayConfig
metadata:
  name: test-gw
spec:
  exports:
    - name: scratch
    - name: archive
      access: read-only
"#;
        let manifest = GatewayConfigManifest::from_yaml_str(yaml).unwrap();
        let table = ExportTable::from_config(&manifest.spec).unwrap();
        let rows = export_rows(&table).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "archive");
        for (name, id, handle) in rows {
            let bytes = hex::decode(&handle).unwrap();
            assert_eq!(bytes.len(), FILE_HANDLE_SIZE);
            let fh = decode_file_handle(&bytes).unwrap();
            assert!(fh.is_root());
            assert_eq!(fh.export_id.to_string(), id);
            assert_eq!(table.find_by_name(&name).unwrap().id, fh.export_id);
        }
    }
}
