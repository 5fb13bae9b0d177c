// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Connector Configuration Types
//
// Defines the configuration schema for a connector node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Connector identity
// - Orchestrator tuning (workers, batch size, leases, retry backoff)
// - Data plane registry settings and statically declared data planes
// - Usage policies bound to agreements
// - Storage backend selection

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::data_plane::{DataPlaneInstance, TransferTypeCapability};
use crate::domain::policy::Policy;
use crate::domain::repository::{PostgresConfig, StorageBackend};

pub const API_VERSION: &str = "dataspace.io/v1";
pub const KIND: &str = "ConnectorConfig";

/// Top-level Kubernetes-style connector configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfigManifest {
    /// API version (must be "dataspace.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ConnectorConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ConnectorConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfigSpec {
    pub connector: ConnectorIdentity,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub data_planes: DataPlaneRegistryConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyBindingConfig>,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorIdentity {
    /// Stable connector identifier, used as requesting party and lease holder prefix
    pub id: String,

    /// Address where data planes push completion reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_address: Option<String>,
}

impl Default for ConnectorIdentity {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "connector".to_string());
        Self {
            id: format!("urn:connector:{}", hostname),
            callback_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of independent claim loops in this process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum records claimed per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle wait between claim cycles
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Bound on a single gateway or data plane call
    #[serde(default = "default_dispatch_timeout", with = "humantime_serde")]
    pub dispatch_timeout: Duration,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Wait between status polls of a started flow
    #[serde(default = "default_status_poll_interval", with = "humantime_serde")]
    pub status_poll_interval: Duration,

    /// A started flow without completion is terminated after this long
    #[serde(default = "default_transfer_timeout", with = "humantime_serde")]
    pub transfer_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            lease_duration: default_lease_duration(),
            dispatch_timeout: default_dispatch_timeout(),
            retry: RetryPolicy::default(),
            status_poll_interval: default_status_poll_interval(),
            transfer_timeout: default_transfer_timeout(),
        }
    }
}

/// Bounded exponential backoff keyed on `state_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per retryable state, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following a failure at `state_count`.
    pub fn delay_for(&self, state_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(state_count.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether the attempt just made at `state_count` was the last one allowed.
    pub fn is_exhausted(&self, state_count: u32) -> bool {
        state_count.saturating_add(1) >= self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneRegistryConfig {
    /// Instances not seen for this long are neither selected nor kept
    #[serde(default = "default_liveness_timeout", with = "humantime_serde::option")]
    pub liveness_timeout: Option<Duration>,

    /// How often stale instances are evicted
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Data planes registered at startup
    #[serde(default)]
    pub instances: Vec<DataPlaneInstanceConfig>,
}

impl Default for DataPlaneRegistryConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: default_liveness_timeout(),
            sweep_interval: default_sweep_interval(),
            instances: Vec::new(),
        }
    }
}

impl DataPlaneRegistryConfig {
    pub fn liveness_timeout_chrono(&self) -> Option<ChronoDuration> {
        self.liveness_timeout.and_then(|d| ChronoDuration::from_std(d).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneInstanceConfig {
    pub id: String,
    pub url: String,
    /// `source->destination` pairs, e.g. `blob->http`, `*->http`
    pub transfer_types: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataPlaneInstanceConfig {
    pub fn to_instance(&self) -> anyhow::Result<DataPlaneInstance> {
        let capabilities = self
            .transfer_types
            .iter()
            .map(|pair| {
                pair.split_once("->")
                    .map(|(s, d)| TransferTypeCapability::new(s.trim(), d.trim()))
                    .ok_or_else(|| anyhow::anyhow!("Invalid transfer type '{}' for data plane {}", pair, self.id))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(DataPlaneInstance::new(&self.id, &self.url, capabilities, self.properties.clone())?)
    }
}

/// Policy document governing one agreement, plus the context attributes
/// evaluated against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBindingConfig {
    pub agreement_id: String,
    pub policy: serde_json::Value,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackendKind,

    /// PostgreSQL URL (supports "env:VAR_NAME")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection_string: None,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    pub fn to_backend(&self) -> anyhow::Result<StorageBackend> {
        match self.backend {
            StorageBackendKind::Memory => Ok(StorageBackend::InMemory),
            StorageBackendKind::Postgres => {
                let connection_string = resolve_secret(self.connection_string.as_deref())?
                    .ok_or_else(|| anyhow::anyhow!("storage.connection_string is required for the postgres backend"))?;
                Ok(StorageBackend::PostgreSQL(PostgresConfig {
                    connection_string,
                    max_connections: self.max_connections,
                }))
            }
        }
    }
}

/// Resolve a value from config (supports "env:VAR_NAME" syntax)
pub fn resolve_secret(value: Option<&str>) -> anyhow::Result<Option<String>> {
    match value {
        Some(v) => match v.strip_prefix("env:") {
            Some(var_name) => std::env::var(var_name)
                .map(Some)
                .map_err(|_| anyhow::anyhow!("Environment variable not set: {}", var_name)),
            None => Ok(Some(v.to_string())),
        },
        None => Ok(None),
    }
}

// Default value functions
fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_dispatch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_status_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_transfer_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_liveness_timeout() -> Option<Duration> {
    Some(Duration::from_secs(300))
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_backend() -> StorageBackendKind {
    StorageBackendKind::Memory
}

fn default_max_connections() -> u32 {
    5
}

impl Default for ConnectorConfigManifest {
    fn default() -> Self {
        let spec = ConnectorConfigSpec::default();
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: spec.connector.id.clone(),
                labels: None,
            },
            spec,
        }
    }
}

impl ConnectorConfigManifest {
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

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. DSC_CONFIG_PATH environment variable
    /// 2. ./connector-config.yaml (working directory)
    /// 3. ~/.dsconnector/config.yaml (user home)
    /// 4. /etc/dsconnector/config.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("DSC_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./connector-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".dsconnector").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/dsconnector/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
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
        if let Ok(url) = std::env::var("DSC_DATABASE_URL") {
            tracing::info!("Environment override: DSC_DATABASE_URL (postgres backend)");
            self.spec.storage.backend = StorageBackendKind::Postgres;
            self.spec.storage.connection_string = Some(url);
        }

        if let Ok(val) = std::env::var("DSC_ORCHESTRATOR_WORKERS") {
            match val.parse::<usize>() {
                Ok(workers) => {
                    tracing::info!("Environment override: DSC_ORCHESTRATOR_WORKERS={}", workers);
                    self.spec.orchestrator.workers = workers;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for DSC_ORCHESTRATOR_WORKERS: '{}'. Expected a number. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.spec.connector.id.trim().is_empty() {
            anyhow::bail!("spec.connector.id cannot be empty");
        }

        let orchestrator = &self.spec.orchestrator;
        if orchestrator.workers == 0 {
            anyhow::bail!("spec.orchestrator.workers must be at least 1");
        }
        if orchestrator.batch_size == 0 {
            anyhow::bail!("spec.orchestrator.batch_size must be at least 1");
        }
        if orchestrator.retry.max_attempts == 0 {
            anyhow::bail!("spec.orchestrator.retry.max_attempts must be at least 1");
        }
        if orchestrator.lease_duration <= orchestrator.dispatch_timeout {
            anyhow::bail!(
                "spec.orchestrator.lease_duration ({:?}) must exceed dispatch_timeout ({:?})",
                orchestrator.lease_duration,
                orchestrator.dispatch_timeout
            );
        }

        for instance in &self.spec.data_planes.instances {
            instance.to_instance()?;
        }

        for binding in &self.spec.policies {
            if binding.agreement_id.trim().is_empty() {
                anyhow::bail!("spec.policies[].agreement_id cannot be empty");
            }
            if Policy::parse(&binding.policy).is_none() {
                anyhow::bail!("Malformed policy bound to agreement {}", binding.agreement_id);
            }
        }

        if self.spec.storage.backend == StorageBackendKind::Postgres && self.spec.storage.connection_string.is_none() {
            anyhow::bail!("spec.storage.connection_string is required for the postgres backend");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: dataspace.io/v1
kind: ConnectorConfig
metadata:
  name: provider-connector
spec:
  connector:
    id: urn:connector:provider
  orchestrator:
    workers: 4
    batch_size: 25
    lease_duration: 2m
    retry:
      max_attempts: 3
      base_delay: 500ms
  data_planes:
    instances:
      - id: dp-blob
        url: http://dataplane:8181
        transfer_types: ["blob->http", "*->s3"]
        properties:
          region: eu-west
  policies:
    - agreement_id: agreement-1
      policy:
        permissions:
          - action: use
            constraints:
              - leftOperand: region
                operator: eq
                rightOperand: eu-west
      attributes:
        region: eu-west
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = ConnectorConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(manifest.spec.connector.id.starts_with("urn:connector:"));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let manifest = ConnectorConfigManifest::from_yaml_str(SAMPLE).unwrap();
        assert!(manifest.validate().is_ok());

        let orchestrator = &manifest.spec.orchestrator;
        assert_eq!(orchestrator.workers, 4);
        assert_eq!(orchestrator.batch_size, 25);
        assert_eq!(orchestrator.lease_duration, Duration::from_secs(120));
        assert_eq!(orchestrator.poll_interval, Duration::from_secs(1));
        assert_eq!(orchestrator.retry.max_attempts, 3);
        assert_eq!(orchestrator.retry.base_delay, Duration::from_millis(500));

        let instance = manifest.spec.data_planes.instances[0].to_instance().unwrap();
        assert_eq!(instance.capabilities().len(), 2);
        assert_eq!(instance.capabilities()[1].source_type, "*");
        assert_eq!(instance.properties.get("region").map(String::as_str), Some("eu-west"));

        let binding = &manifest.spec.policies[0];
        assert_eq!(binding.agreement_id, "agreement-1");
        assert!(Policy::parse(&binding.policy).is_some());
        assert_eq!(binding.attributes.get("region"), Some(&serde_json::json!("eu-west")));
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let manifest = ConnectorConfigManifest::from_yaml_str(SAMPLE).unwrap();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = ConnectorConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(loaded.metadata.name, "provider-connector");
        assert_eq!(loaded.spec.orchestrator.lease_duration, Duration::from_secs(120));
        assert_eq!(loaded.spec.data_planes.instances.len(), 1);
    }

    #[test]
    fn test_retry_backoff_curve() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(retry.delay_for(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for(3), Duration::from_secs(5));
        assert_eq!(retry.delay_for(40), Duration::from_secs(5));

        assert!(!retry.is_exhausted(0));
        assert!(!retry.is_exhausted(1));
        assert!(retry.is_exhausted(2));
    }

    #[test]
    fn test_validation() {
        let mut manifest = ConnectorConfigManifest::default();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.orchestrator.batch_size = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.orchestrator.batch_size = 10;

        manifest.spec.orchestrator.lease_duration = Duration::from_secs(10);
        assert!(manifest.validate().is_err());
        manifest.spec.orchestrator.lease_duration = Duration::from_secs(60);

        manifest.spec.data_planes.instances.push(DataPlaneInstanceConfig {
            id: "dp".to_string(),
            url: "http://dp".to_string(),
            transfer_types: vec!["blob-http".to_string()],
            properties: HashMap::new(),
        });
        assert!(manifest.validate().is_err());
        manifest.spec.data_planes.instances.clear();

        manifest.spec.policies.push(PolicyBindingConfig {
            agreement_id: "agreement-1".to_string(),
            policy: serde_json::json!({"permissions": [{"action": ""}]}),
            attributes: HashMap::new(),
        });
        assert!(manifest.validate().is_err());
        manifest.spec.policies.clear();

        manifest.spec.storage.backend = StorageBackendKind::Postgres;
        assert!(manifest.validate().is_err());
    }
}
