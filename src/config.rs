//! Provider configuration loading
//!
//! Two externally supplied files govern an agent instance:
//!
//! - `config.toml` in the provider repo directory: API endpoints, durable
//!   store location, marketplace coordinator URL and token, registry
//!   credentials.
//! - `resource_policy.json` in the working directory: quota thresholds the
//!   accountant evaluates on every admission pass. When the file is absent
//!   the policy defaults to fully closed (zero quotas), so an unconfigured
//!   provider never falsely advertises availability.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level provider configuration, loaded from `config.toml`
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    /// Local API and durable-store settings
    pub api: ApiConfig,
    /// Marketplace coordinator settings
    pub marketplace: MarketplaceConfig,
    /// Container registry settings (optional; empty means local images only)
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Local API and durable-store settings
#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    /// Port the (external) request-intake layer listens on
    pub port: u16,
    /// Public multiaddress advertised to the marketplace
    #[serde(default)]
    pub multi_address: String,
    /// Durable record store URL (`redis://...`)
    pub redis_url: String,
    /// Durable record store password, if any
    #[serde(default)]
    pub redis_password: String,
    /// DNS domain under which workload hostnames are allocated
    pub domain: String,
    /// Provider node identifier reported upstream
    pub node_id: String,
    /// Human-readable provider name; hostname is used when empty
    #[serde(default)]
    pub node_name: String,
}

/// Marketplace coordinator settings
#[derive(Clone, Debug, Deserialize)]
pub struct MarketplaceConfig {
    /// Coordinator base URL for summary/status/heartbeat posts
    pub server_url: String,
    /// Bearer token for coordinator requests
    pub access_token: String,
    /// Model-introspection service base URL; coordinator URL when empty
    #[serde(default)]
    pub introspection_url: String,
}

/// Container registry settings
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistryConfig {
    /// Registry server address; empty disables image pushes
    #[serde(default)]
    pub server_address: String,
    /// Registry user name
    #[serde(default)]
    pub username: String,
    /// Registry password
    #[serde(default)]
    pub password: String,
}

impl ProviderConfig {
    /// Load the configuration from `<repo>/config.toml`
    pub fn load(repo_path: &Path) -> Result<Self> {
        let config_file = repo_path.join("config.toml");
        let raw = std::fs::read_to_string(&config_file).map_err(|e| {
            Error::config(format!(
                "failed to read config file {}: {}",
                config_file.display(),
                e
            ))
        })?;
        let config: ProviderConfig = toml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse config.toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.api.redis_url.is_empty() {
            return Err(Error::config("api.redis_url must be set"));
        }
        if self.api.domain.is_empty() {
            return Err(Error::config("api.domain must be set"));
        }
        if self.api.node_id.is_empty() {
            return Err(Error::config("api.node_id must be set"));
        }
        if self.marketplace.server_url.is_empty() {
            return Err(Error::config("marketplace.server_url must be set"));
        }
        Ok(())
    }

    /// The provider name reported upstream: configured name or hostname
    pub fn provider_name(&self) -> String {
        if !self.api.node_name.is_empty() {
            return self.api.node_name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "stratos-provider".to_string())
    }
}

// =============================================================================
// Resource Policy
// =============================================================================

/// Quota thresholds the admission evaluation compares free capacity against.
///
/// A zero quota closes the corresponding resource: a GPU model with quota 0
/// never makes the provider eligible, which is what keeps the unconfigured
/// default policy reporting Inactive regardless of actual cluster capacity.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourcePolicy {
    /// Minimum free CPU cores
    pub cpu: CpuQuota,
    /// Minimum free memory
    pub memory: SizedQuota,
    /// Minimum free ephemeral storage
    pub storage: SizedQuota,
    /// Per-GPU-model minimum free unit counts
    #[serde(default)]
    pub gpu: Vec<GpuQuota>,
}

/// CPU quota in whole cores
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CpuQuota {
    /// Free cores required
    pub quota: i64,
}

/// Memory or storage quota with a unit
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SizedQuota {
    /// Free amount required, in `unit`s
    pub quota: i64,
    /// Unit of the quota (only `GiB` is in use)
    pub unit: String,
}

impl Default for SizedQuota {
    fn default() -> Self {
        Self {
            quota: 0,
            unit: "GiB".to_string(),
        }
    }
}

impl SizedQuota {
    /// The quota expressed in bytes
    pub fn bytes(&self) -> i64 {
        self.quota.saturating_mul(1024 * 1024 * 1024)
    }
}

/// Minimum free unit count for one GPU model
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GpuQuota {
    /// GPU model name, e.g. `NVIDIA-3080`
    pub name: String,
    /// Free units required
    pub quota: i64,
}

impl ResourcePolicy {
    /// Load `resource_policy.json` from `dir`.
    ///
    /// A missing file yields the fully-closed default; a file that exists but
    /// fails to parse is a configuration error (silently ignoring a broken
    /// policy could advertise capacity the operator meant to withhold).
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("resource_policy.json");
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => return Ok(Self::default()),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            Error::config(format!(
                "failed to parse resource policy {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[api]
port = 8085
multi_address = "/ip4/1.2.3.4/tcp/8085"
redis_url = "redis://127.0.0.1:6379"
domain = "cp.example.dev"
node_id = "node-1"

[marketplace]
server_url = "https://market.example.dev/api/v1"
access_token = "token"
"#;

    #[test]
    fn loads_config_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), CONFIG).unwrap();

        let config = ProviderConfig::load(dir.path()).unwrap();
        assert_eq!(config.api.port, 8085);
        assert_eq!(config.api.domain, "cp.example.dev");
        assert_eq!(config.marketplace.access_token, "token");
        // registry section is optional
        assert!(config.registry.server_address.is_empty());
    }

    #[test]
    fn missing_config_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_config_without_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let broken = CONFIG.replace("node_id = \"node-1\"", "node_id = \"\"");
        std::fs::write(dir.path().join("config.toml"), broken).unwrap();
        let err = ProviderConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("node_id"));
    }

    #[test]
    fn missing_policy_defaults_to_fully_closed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = ResourcePolicy::load(dir.path()).unwrap();
        assert_eq!(policy, ResourcePolicy::default());
        assert_eq!(policy.cpu.quota, 0);
        assert_eq!(policy.memory.quota, 0);
        assert!(policy.gpu.is_empty());
    }

    #[test]
    fn parses_policy_json() {
        let dir = tempfile::tempdir().unwrap();
        let raw = r#"{
            "cpu": {"quota": 4},
            "memory": {"quota": 16, "unit": "GiB"},
            "storage": {"quota": 20, "unit": "GiB"},
            "gpu": [{"name": "NVIDIA-3080", "quota": 1}]
        }"#;
        std::fs::write(dir.path().join("resource_policy.json"), raw).unwrap();

        let policy = ResourcePolicy::load(dir.path()).unwrap();
        assert_eq!(policy.cpu.quota, 4);
        assert_eq!(policy.memory.bytes(), 16 * 1024 * 1024 * 1024);
        assert_eq!(policy.gpu[0].name, "NVIDIA-3080");
    }

    #[test]
    fn broken_policy_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("resource_policy.json"), "{not json").unwrap();
        assert!(ResourcePolicy::load(dir.path()).is_err());
    }
}
