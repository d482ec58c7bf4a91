// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Relay Node Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing one
// relay node:
// - Local agent identity and tenant/project scope
// - Token, signing and replay-window settings
// - Registry lease timings
// - Transport partitions, backpressure and redelivery limits
// - Executor retry/timeout/depth limits and redaction keys
// - Policy evaluator, context service and PostgreSQL endpoints
//
// Each section doubles as the configuration struct of the component it
// configures, so the YAML and the runtime defaults cannot drift apart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::execution::{RetryPolicy, MAX_RECURSIVE_DEPTH};

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "RelayNodeConfig";

/// Top-level node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RelayNodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    pub node: NodeIdentity,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

/// Identity of the agent hosted by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub agent_type: String,
    pub agent_id: String,
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
    pub tenant: String,
    pub project: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            agent_type: "orchestrator".to_string(),
            agent_id: "relay-node".to_string(),
            agent_version: default_agent_version(),
            tenant: "default".to_string(),
            project: "default".to_string(),
            capabilities: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenAlgorithm {
    #[default]
    Hs256,
    Rs256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Expected `iss` claim of bearer and capability tokens.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    #[serde(default)]
    pub token_algorithm: TokenAlgorithm,

    /// HS256 shared secret, literal or `env:VAR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    /// RS256 public key (PEM file) used for verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_public_key_path: Option<PathBuf>,

    /// HMAC key for envelope signatures, literal or `env:VAR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    #[serde(default = "default_freshness_window", with = "humantime_serde")]
    pub freshness_window: Duration,

    #[serde(default = "default_true")]
    pub require_auth_token: bool,

    #[serde(default = "default_true")]
    pub require_signatures: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            token_algorithm: TokenAlgorithm::default(),
            token_secret: None,
            token_public_key_path: None,
            signing_key: None,
            freshness_window: default_freshness_window(),
            require_auth_token: true,
            require_signatures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,

    /// How long an `UNAVAILABLE` registration is kept before hard deletion.
    #[serde(default = "default_unavailable_retention", with = "humantime_serde")]
    pub unavailable_retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            heartbeat_interval: default_heartbeat_interval(),
            expiry_check_interval: default_expiry_check_interval(),
            unavailable_retention: default_unavailable_retention(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Pending (unacknowledged) messages per consumer group that pause publishers.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,

    /// Publishers resume once pending drops to `threshold * resume_ratio`.
    #[serde(default = "default_resume_ratio")]
    pub resume_ratio: f64,

    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,

    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// How long `publish` waits for a paused topic before failing.
    #[serde(default = "default_publish_pause_timeout", with = "humantime_serde")]
    pub publish_pause_timeout: Duration,

    #[serde(default = "default_true")]
    pub validate_on_publish: bool,

    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    #[serde(default = "default_publish_backoff", with = "humantime_serde")]
    pub publish_backoff: Duration,

    /// Records kept per partition once every subscribed group has moved past them.
    #[serde(default = "default_retained_records")]
    pub retained_records: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            backpressure_threshold: default_backpressure_threshold(),
            resume_ratio: default_resume_ratio(),
            max_redeliveries: default_max_redeliveries(),
            ack_timeout: default_ack_timeout(),
            publish_pause_timeout: default_publish_pause_timeout(),
            validate_on_publish: true,
            publish_retries: default_publish_retries(),
            publish_backoff: default_publish_backoff(),
            retained_records: default_retained_records(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Hard ceiling on a single step attempt.
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub step_timeout: Duration,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Delegations a single step may issue.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: u32,

    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Object keys whose values are masked in step spans.
    #[serde(default = "default_redaction_keys")]
    pub redaction_keys: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: default_step_timeout(),
            max_depth: default_max_depth(),
            max_fan_out: default_max_fan_out(),
            max_steps: default_max_steps(),
            redaction_keys: default_redaction_keys(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// HTTP evaluator; when absent every envelope is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_policy_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Allow traffic when the evaluator is unreachable or slow.
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: default_policy_timeout(),
            fail_open: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub endpoint: String,

    #[serde(default = "default_context_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL, literal or `env:VAR`.
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_checkpoint_retention", with = "humantime_serde")]
    pub checkpoint_retention: Duration,
}

fn default_true() -> bool {
    true
}

fn default_agent_version() -> String {
    "0.1.0".to_string()
}

fn default_issuer() -> String {
    "aegis-relay".to_string()
}

fn default_freshness_window() -> Duration {
    Duration::from_secs(300)
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_unavailable_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_partitions() -> usize {
    8
}

fn default_backpressure_threshold() -> usize {
    1000
}

fn default_resume_ratio() -> f64 {
    0.8
}

fn default_max_redeliveries() -> u32 {
    5
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_pause_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_retries() -> u32 {
    3
}

fn default_publish_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_retained_records() -> usize {
    1_024
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_depth() -> u32 {
    MAX_RECURSIVE_DEPTH
}

fn default_max_fan_out() -> u32 {
    8
}

fn default_max_steps() -> u32 {
    1000
}

fn default_redaction_keys() -> Vec<String> {
    ["password", "secret", "token", "api_key", "authorization", "auth_token", "capability_token"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_policy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_context_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_connections() -> u32 {
    5
}

fn default_checkpoint_retention() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "relay-node".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

/// Resolve a configured secret. `env:NAME` reads the environment variable
/// `NAME`; anything else is returned as-is.
pub fn resolve_secret(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map_err(|_| anyhow::anyhow!("environment variable '{}' referenced by configuration is not set", var)),
        None => Ok(value.to_string()),
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml_string()?)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. RELAY_CONFIG_PATH environment variable
    /// 2. ./relay-config.yaml (working directory)
    /// 3. ~/.relay/config.yaml (user home)
    /// 4. /etc/relay/config.yaml (system, Unix) or C:\ProgramData\Relay\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RELAY_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./relay-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".relay").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/relay/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Relay\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides so container deployments can
    /// inject endpoints and secrets without editing the manifest.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RELAY_DATABASE_URL") {
            tracing::info!("Environment override: RELAY_DATABASE_URL");
            match self.spec.database.as_mut() {
                Some(db) => db.url = url,
                None => {
                    self.spec.database = Some(DatabaseConfig {
                        url,
                        max_connections: default_max_connections(),
                        checkpoint_retention: default_checkpoint_retention(),
                    })
                }
            }
        }

        if let Ok(key) = std::env::var("RELAY_SIGNING_KEY") {
            tracing::info!("Environment override: RELAY_SIGNING_KEY");
            self.spec.security.signing_key = Some(key);
        }

        if let Ok(endpoint) = std::env::var("RELAY_POLICY_ENDPOINT") {
            tracing::info!("Environment override: RELAY_POLICY_ENDPOINT={}", endpoint);
            self.spec.policy.endpoint = Some(endpoint);
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

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let node = &self.spec.node;
        if node.agent_id.is_empty() || node.agent_type.is_empty() {
            anyhow::bail!("spec.node.agent_id and spec.node.agent_type cannot be empty");
        }
        if node.tenant.is_empty() || node.project.is_empty() {
            anyhow::bail!("spec.node.tenant and spec.node.project cannot be empty");
        }

        let registry = &self.spec.registry;
        if registry.lease_duration.is_zero() {
            anyhow::bail!("spec.registry.lease_duration must be greater than zero");
        }
        if registry.heartbeat_interval >= registry.lease_duration {
            anyhow::bail!(
                "spec.registry.heartbeat_interval ({:?}) must be shorter than lease_duration ({:?})",
                registry.heartbeat_interval,
                registry.lease_duration
            );
        }

        let transport = &self.spec.transport;
        if transport.partitions == 0 {
            anyhow::bail!("spec.transport.partitions must be at least 1");
        }
        if transport.backpressure_threshold == 0 {
            anyhow::bail!("spec.transport.backpressure_threshold must be greater than zero");
        }
        if !(transport.resume_ratio > 0.0 && transport.resume_ratio < 1.0) {
            anyhow::bail!("spec.transport.resume_ratio must be between 0 and 1 (exclusive)");
        }

        let runtime = &self.spec.runtime;
        if runtime.retry.max_attempts == 0 {
            anyhow::bail!("spec.runtime.retry.max_attempts must be at least 1");
        }
        if runtime.step_timeout.is_zero() {
            anyhow::bail!("spec.runtime.step_timeout must be greater than zero");
        }
        if runtime.max_fan_out == 0 {
            anyhow::bail!("spec.runtime.max_fan_out must be at least 1");
        }

        if self.spec.security.issuer.is_empty() {
            anyhow::bail!("spec.security.issuer cannot be empty");
        }
        if self.spec.security.freshness_window.is_zero() {
            anyhow::bail!("spec.security.freshness_window must be greater than zero");
        }

        if let Some(db) = &self.spec.database {
            if db.url.is_empty() {
                anyhow::bail!("spec.database.url cannot be empty");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
apiVersion: 100monkeys.ai/v1
kind: RelayNodeConfig
metadata:
  name: cmo-node
spec:
  node:
    agent_type: orchestrator
    agent_id: cmo-1
    tenant: acme
    project: checkout
    capabilities: [planning]
  security:
    issuer: acme-idp
    token_secret: env:RELAY_TEST_TOKEN_SECRET
    freshness_window: 2m
  registry:
    lease_duration: 30s
    heartbeat_interval: 10s
  transport:
    backpressure_threshold: 50
  policy:
    endpoint: http://policy.local/evaluate
    timeout: 2s
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfigManifest::default();
        assert_eq!(manifest.api_version, "100monkeys.ai/v1");
        assert_eq!(manifest.kind, "RelayNodeConfig");
        assert_eq!(manifest.spec.registry.lease_duration, Duration::from_secs(60));
        assert_eq!(manifest.spec.registry.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(manifest.spec.runtime.retry.max_attempts, 3);
        assert_eq!(manifest.spec.policy.timeout, Duration::from_secs(5));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_sample_fills_defaults() {
        let manifest = NodeConfigManifest::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(manifest.spec.node.agent_id, "cmo-1");
        assert_eq!(manifest.spec.security.freshness_window, Duration::from_secs(120));
        assert_eq!(manifest.spec.registry.lease_duration, Duration::from_secs(30));
        assert_eq!(manifest.spec.transport.backpressure_threshold, 50);
        assert_eq!(manifest.spec.transport.resume_ratio, 0.8);
        assert_eq!(manifest.spec.runtime.step_timeout, Duration::from_secs(60));
        assert!(!manifest.spec.policy.fail_open);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay-config.yaml");
        let manifest = NodeConfigManifest::from_yaml_str(SAMPLE).unwrap();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = NodeConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "cmo-node");
        assert_eq!(loaded.spec.registry, manifest.spec.registry);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let result = NodeConfigManifest::load_or_default(Some(PathBuf::from("/nonexistent/relay.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = NodeConfigManifest::default();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.registry.heartbeat_interval = Duration::from_secs(60);
        assert!(manifest.validate().is_err());
        manifest.spec.registry.heartbeat_interval = Duration::from_secs(20);

        manifest.spec.transport.resume_ratio = 1.0;
        assert!(manifest.validate().is_err());
        manifest.spec.transport.resume_ratio = 0.8;

        manifest.spec.transport.backpressure_threshold = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.transport.backpressure_threshold = 10;

        manifest.spec.node.tenant = String::new();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_resolve_secret() {
        assert_eq!(resolve_secret("literal").unwrap(), "literal");
        assert!(resolve_secret("env:RELAY_TEST_SURELY_UNSET_VARIABLE").is_err());
    }
}
