// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

// Broker Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) for a controller
// running the session core:
// - Lifecycle vocabulary (statuses, termination reasons)
// - Envelope encryption backend (local keyring or transit engine)
// - Crypto call deadlines
// - Storage and observability settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::lifecycle::{LifecyclePolicy, PolicyError};

pub const API_VERSION: &str = "gatehouse.dev/v1";
pub const KIND: &str = "BrokerConfig";
pub const CONFIG_PATH_ENV: &str = "GATEHOUSE_CONFIG_PATH";

/// Top-level broker configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfigManifest {
    /// API version (must be "gatehouse.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BrokerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: BrokerConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Controller name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfigSpec {
    pub lifecycle: LifecycleConfig,

    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Lifecycle vocabulary owned by the deployment, not by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Status of the first state row written at creation
    pub initial_status: String,

    /// Status appended once a worker is assigned
    pub active_status: String,

    /// Status appended when a termination reason is set
    pub terminal_status: String,

    pub statuses: Vec<String>,

    pub termination_reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum EncryptionConfig {
    /// In-process AES-256-GCM keyring
    Local {
        key_name: String,
        keys: Vec<KeyVersionConfig>,
    },
    /// Vault / OpenBao transit engine
    Transit {
        address: String,
        /// Supports "env:VAR_NAME"
        token: String,
        #[serde(default = "default_transit_mount")]
        mount: String,
        key_name: String,
        /// Base64 32-byte secret session keys are derived from; the transit
        /// engine only wraps. Supports "env:VAR_NAME".
        derivation_key: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyVersionConfig {
    pub version: u32,

    /// Base64 key material (32 bytes). Supports "env:VAR_NAME".
    pub material: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Deadline for a single wrap/unwrap/issue call
    #[serde(default = "default_crypto_timeout_ms")]
    pub timeout_ms: u64,
}

impl CryptoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Supports "env:VAR_NAME"
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_transit_mount() -> String {
    "transit".to_string()
}

fn default_crypto_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_crypto_timeout_ms(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl BrokerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. GATEHOUSE_CONFIG_PATH environment variable
    /// 2. ./gatehouse-config.yaml (working directory)
    /// 3. ~/.gatehouse/config.yaml (user home)
    /// 4. /etc/gatehouse/config.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./gatehouse-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".gatehouse").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/gatehouse/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration from an explicit path or by discovery.
    ///
    /// There is no built-in default: the lifecycle vocabulary and key
    /// material must come from the deployment.
    pub fn load(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = match cli_path {
            Some(path) => {
                tracing::info!("Loading configuration from explicit path: {:?}", path);
                path
            }
            None => {
                let path = Self::discover_config().ok_or_else(|| {
                    anyhow::anyhow!(
                        "No configuration file found; set {} or create ./gatehouse-config.yaml",
                        CONFIG_PATH_ENV
                    )
                })?;
                tracing::info!("Loading configuration from discovered path: {:?}", path);
                path
            }
        };

        let mut config = Self::from_yaml_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("GATEHOUSE_LOG_LEVEL") {
            tracing::info!("Environment override: GATEHOUSE_LOG_LEVEL={}", level);
            self.spec.observability.log_level = level;
        }

        if let Ok(url) = std::env::var("GATEHOUSE_DATABASE_URL") {
            tracing::info!("Environment override: GATEHOUSE_DATABASE_URL=<set>");
            match self.spec.database.as_mut() {
                Some(database) => database.url = url,
                None => {
                    self.spec.database = Some(DatabaseConfig {
                        url,
                        max_connections: default_max_connections(),
                    })
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

        self.lifecycle_policy()?;

        match &self.spec.encryption {
            EncryptionConfig::Local { key_name, keys } => {
                if key_name.is_empty() {
                    anyhow::bail!("encryption.key_name must not be empty");
                }
                if keys.is_empty() {
                    anyhow::bail!("encryption.keys must declare at least one key version");
                }
                let mut seen = HashSet::new();
                for key in keys {
                    if key.version == 0 {
                        anyhow::bail!("encryption key versions start at 1");
                    }
                    if !seen.insert(key.version) {
                        anyhow::bail!("encryption key version {} declared twice", key.version);
                    }
                }
            }
            EncryptionConfig::Transit {
                address,
                key_name,
                derivation_key,
                ..
            } => {
                if address.is_empty() || key_name.is_empty() || derivation_key.is_empty() {
                    anyhow::bail!("transit encryption requires address, key_name and derivation_key");
                }
            }
        }

        if self.spec.crypto.timeout_ms == 0 {
            anyhow::bail!("crypto.timeout_ms must be greater than zero");
        }

        Ok(())
    }

    pub fn lifecycle_policy(&self) -> Result<LifecyclePolicy, PolicyError> {
        LifecyclePolicy::from_config(&self.spec.lifecycle)
    }
}

/// Resolve "env:VAR_NAME" indirection; any other value is returned as-is.
pub fn resolve_secret_value(raw: &str) -> anyhow::Result<String> {
    match raw.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("environment variable '{}' is not set", var)),
        None => Ok(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
apiVersion: gatehouse.dev/v1
kind: BrokerConfig
metadata:
  name: controller-1
spec:
  lifecycle:
    initial_status: pending
    active_status: active
    terminal_status: terminated
    statuses: [pending, active, canceling, terminated]
    termination_reasons: [timed out, closed by user, connection limit, canceled]
  encryption:
    provider: local
    key_name: sessions
    keys:
      - version: 1
        material: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="
"#;

    #[test]
    fn test_parse_sample_manifest() {
        let config = BrokerConfigManifest::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.metadata.name, "controller-1");
        assert_eq!(config.spec.crypto.timeout(), Duration::from_secs(5));
        assert_eq!(config.spec.observability.log_level, "info");
        assert!(config.spec.database.is_none());
        assert!(matches!(
            config.spec.encryption,
            EncryptionConfig::Local { ref key_name, ref keys } if key_name == "sessions" && keys.len() == 1
        ));
        config.validate().unwrap();

        let policy = config.lifecycle_policy().unwrap();
        assert!(policy.is_legal_termination_reason("connection limit"));
        assert_eq!(policy.terminal_status().as_str(), "terminated");
    }

    #[test]
    fn test_parse_transit_encryption() {
        let yaml = SAMPLE.replace(
            "    provider: local\n    key_name: sessions\n    keys:\n      - version: 1\n        material: \"AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=\"\n",
            "    provider: transit\n    address: https://vault.internal:8200\n    token: env:VAULT_TOKEN\n    key_name: sessions\n    derivation_key: env:GATEHOUSE_DERIVATION_KEY\n",
        );
        let config = BrokerConfigManifest::from_yaml_str(&yaml).unwrap();
        match &config.spec.encryption {
            EncryptionConfig::Transit { mount, token, .. } => {
                assert_eq!(mount, "transit");
                assert_eq!(token, "env:VAULT_TOKEN");
            }
            other => panic!("expected transit, got {other:?}"),
        }
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let mut config = BrokerConfigManifest::from_yaml_str(SAMPLE).unwrap();
        config.kind = "NodeConfig".to_string();
        assert!(config.validate().is_err());

        let mut config = BrokerConfigManifest::from_yaml_str(SAMPLE).unwrap();
        config.spec.lifecycle.active_status = "running".to_string();
        assert!(config.validate().is_err());

        let mut config = BrokerConfigManifest::from_yaml_str(SAMPLE).unwrap();
        if let EncryptionConfig::Local { keys, .. } = &mut config.spec.encryption {
            keys.push(keys[0].clone());
        }
        assert!(config.validate().is_err());

        let mut config = BrokerConfigManifest::from_yaml_str(SAMPLE).unwrap();
        config.spec.crypto.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BrokerConfigManifest::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.api_version, API_VERSION);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(BrokerConfigManifest::load(Some(missing)).is_err());
    }

    #[test]
    fn test_resolve_secret_value() {
        assert_eq!(resolve_secret_value("literal").unwrap(), "literal");
        std::env::set_var("GATEHOUSE_TEST_SECRET_RESOLVE", "from-env");
        assert_eq!(
            resolve_secret_value("env:GATEHOUSE_TEST_SECRET_RESOLVE").unwrap(),
            "from-env"
        );
        assert!(resolve_secret_value("env:GATEHOUSE_TEST_SECRET_DEFINITELY_UNSET").is_err());
    }
}
