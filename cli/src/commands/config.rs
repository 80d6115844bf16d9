// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use nfs3_gateway_core::domain::config::{BackendConfig, GatewayConfigManifest};
use nfs3_gateway_core::domain::export::ExportAccess;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./nfs3gw-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(&output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = GatewayConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. NFS3GW_CONFIG_PATH: {}",
            std::env::var("NFS3GW_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./nfs3gw-config.yaml");
        println!("  4. ~/.nfs3gw/config.yaml");
        println!("  5. /etc/nfs3gw/config.yaml");
        println!();
    }

    println!("{} {}", "Gateway:".bold(), config.metadata.name);
    println!();

    let spec = &config.spec;
    println!("{}", "Exports:".bold());
    for export in &spec.exports {
        let id = export
            .export_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|e| format!("{}", e).red().to_string());
        let access = match export.access {
            ExportAccess::ReadWrite => "read-write",
            ExportAccess::ReadOnly => "read-only",
        };
        let backend = match export.backend {
            BackendConfig::Memory => "memory",
        };
        println!("  {} ({})", export.name.bold(), id);
        println!("    Access: {}", access);
        println!("    Backend: {}", backend);
        if export.trusted_sync {
            println!("    Trusted sync: {}", "on".yellow());
        }
        if export.trusted_write {
            println!("    Trusted write: {}", "on".yellow());
        }
    }
    println!();

    println!("{}", "Lock manager:".bold());
    println!(
        "  NLM: {}",
        if spec.nlm.enabled { "enabled" } else { "disabled" }
    );
    println!("  Grace period: {}s", spec.nlm.grace_period_secs);
    println!();

    println!("{}", "Caches:".bold());
    println!("  Entry timeout: {}ms", spec.cache.entry_timeout_ms);
    println!("  Max cached objects per export: {}", spec.cache.max_objects);
    println!("  Call pool capacity: {}", spec.call_pool.capacity);

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = GatewayConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Sample configuration shipped with the binary
pub fn sample_config(with_examples: bool) -> &'static str {
    if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    }
}

async fn generate(output: &Path, with_examples: bool) -> Result<()> {
    std::fs::write(output, sample_config(with_examples))
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_valid() {
        for with_examples in [false, true] {
            let manifest = GatewayConfigManifest::from_yaml_str(sample_config(with_examples))
                .expect("template parses");
            assert!(manifest.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.yaml");

        generate(&path, true).await.unwrap();
        assert!(path.exists());
        validate(Some(path)).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejects_explicit_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(validate(Some(missing)).await.is_err());
    }
}
