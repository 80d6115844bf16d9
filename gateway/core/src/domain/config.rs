// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Defines the configuration schema for an NFSv3 gateway node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Exported backend mounts and their access policy
// - NLM lock manager settings (grace period)
// - Name cache and call-context pool tuning

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::export::{ExportAccess, ExportPolicy};
use crate::domain::file_handle::ExportId;

pub const API_VERSION: &str = "nfs3gw/v1";
pub const KIND: &str = "GatewayConfig";

/// Top-level gateway configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigManifest {
    /// API version (must be "nfs3gw/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GatewayConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Gateway settings (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigSpec {
    /// Exported backend mounts
    #[serde(default)]
    pub exports: Vec<ExportConfig>,

    /// Network Lock Manager settings
    #[serde(default)]
    pub nlm: NlmConfig,

    /// Name cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Call-context pool settings
    #[serde(default)]
    pub call_pool: CallPoolConfig,
}

impl Default for GatewayConfigSpec {
    fn default() -> Self {
        Self {
            exports: vec![ExportConfig {
                name: "scratch".to_string(),
                id: None,
                access: ExportAccess::ReadWrite,
                trusted_sync: false,
                trusted_write: false,
                backend: BackendConfig::Memory,
            }],
            nlm: NlmConfig::default(),
            cache: CacheConfig::default(),
            call_pool: CallPoolConfig::default(),
        }
    }
}

/// One exported backend mount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub name: String,

    /// Pinned export id. Derived from `name` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub access: ExportAccess,

    #[serde(default)]
    pub trusted_sync: bool,

    #[serde(default)]
    pub trusted_write: bool,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl ExportConfig {
    /// Resolve the effective export id
    pub fn export_id(&self) -> anyhow::Result<ExportId> {
        match &self.id {
            Some(id) => ExportId::from_string(id).map_err(|e| {
                anyhow::anyhow!("Invalid export id '{}' for {}: {}", id, self.name, e)
            }),
            None => Ok(ExportId::from_name(&self.name)),
        }
    }

    pub fn policy(&self) -> ExportPolicy {
        ExportPolicy {
            access: self.access,
            trusted_sync: self.trusted_sync,
            trusted_write: self.trusted_write,
        }
    }
}

/// Backend serving an export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
    /// Volatile in-process namespace
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds after startup during which only reclaims are honoured (0 disables)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl NlmConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for NlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a cached name link is trusted before LOOKUP revalidates it
    #[serde(default = "default_entry_timeout_ms")]
    pub entry_timeout_ms: u64,

    /// Objects cached per export before idle ones are evicted
    #[serde(default = "default_max_objects")]
    pub max_objects: usize,
}

impl CacheConfig {
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_timeout_ms: default_entry_timeout_ms(),
            max_objects: default_max_objects(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPoolConfig {
    /// Idle call contexts retained for reuse
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

impl Default for CallPoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_period_secs() -> u64 {
    50
}

fn default_entry_timeout_ms() -> u64 {
    1000
}

fn default_max_objects() -> usize {
    65_536
}

fn default_pool_capacity() -> usize {
    512
}

impl Default for GatewayConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "nfs3-gateway".to_string(),
                labels: None,
            },
            spec: GatewayConfigSpec::default(),
        }
    }
}

impl GatewayConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. NFS3GW_CONFIG_PATH environment variable
    /// 2. ./nfs3gw-config.yaml (working directory)
    /// 3. ~/.nfs3gw/config.yaml (user home)
    /// 4. /etc/nfs3gw/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("NFS3GW_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./nfs3gw-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".nfs3gw").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/nfs3gw/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NFS3GW_GRACE_PERIOD_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Environment override: NFS3GW_GRACE_PERIOD_SECS={}", secs);
                    self.spec.nlm.grace_period_secs = secs;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for NFS3GW_GRACE_PERIOD_SECS: '{}'. Expected seconds. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("NFS3GW_NLM_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: NFS3GW_NLM_ENABLED=true");
                    self.spec.nlm.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: NFS3GW_NLM_ENABLED=false");
                    self.spec.nlm.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for NFS3GW_NLM_ENABLED: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.exports.is_empty() {
            anyhow::bail!("spec.exports must declare at least one export");
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for export in &self.spec.exports {
            if export.name.is_empty() {
                anyhow::bail!("Export name cannot be empty");
            }
            if !names.insert(export.name.as_str()) {
                anyhow::bail!("Duplicate export name: {}", export.name);
            }
            let id = export.export_id()?;
            if !ids.insert(id) {
                anyhow::bail!("Duplicate export id {} (export {})", id, export.name);
            }
        }

        if self.spec.cache.max_objects == 0 {
            anyhow::bail!("spec.cache.max_objects must be greater than zero");
        }

        if self.spec.call_pool.capacity == 0 {
            anyhow::bail!("spec.call_pool.capacity must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = GatewayConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.exports.len(), 1);
        assert_eq!(manifest.spec.nlm.grace_period_secs, 50);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
apiVersion: nfs3gw/v1
kind: GatewayConfig
metadata:
  name: edge-gw
spec:
  exports:
    - name: vol0
      access: read-only
      trusted_sync: true
    - name: vol1
      id: 550e8400-e29b-41d4-a716-446655440000
  nlm:
    grace_period_secs: 5
  cache:
    entry_timeout_ms: 0
    max_objects: 1024
"#;
        let manifest = GatewayConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "edge-gw");
        assert_eq!(manifest.spec.exports.len(), 2);
        assert_eq!(manifest.spec.exports[0].access, ExportAccess::ReadOnly);
        assert!(manifest.spec.exports[0].trusted_sync);
        assert_eq!(manifest.spec.exports[1].backend, BackendConfig::Memory);
        assert_eq!(manifest.spec.nlm.grace_period(), Duration::from_secs(5));
        assert!(manifest.spec.nlm.enabled);
        assert_eq!(manifest.spec.cache.entry_timeout(), Duration::ZERO);
        assert_eq!(manifest.spec.cache.max_objects, 1024);
        assert_eq!(manifest.spec.call_pool.capacity, 512);
        assert_eq!(
            manifest.spec.exports[1].export_id().unwrap().to_string(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut manifest = GatewayConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        let duplicate = manifest.spec.exports[0].clone();
        manifest.spec.exports.push(duplicate);
        assert!(manifest.validate().is_err());
        manifest.spec.exports.pop();

        manifest.spec.exports[0].id = Some("not-a-uuid".to_string());
        assert!(manifest.validate().is_err());
        manifest.spec.exports[0].id = None;

        manifest.spec.cache.max_objects = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.cache.max_objects = 4096;
        assert!(manifest.validate().is_ok());

        manifest.spec.exports.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let manifest = GatewayConfigManifest::default();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = GatewayConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, manifest.metadata.name);
        assert_eq!(loaded.spec.exports[0].name, "scratch");
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = GatewayConfigManifest::load_or_default(Some(dir.path().join("absent.yaml")));
        assert!(result.is_err());
    }
}
