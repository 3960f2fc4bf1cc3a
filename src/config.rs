//! Control plane configuration file
//!
//! YAML document layered under the CLI flags. Every section has defaults, so
//! an empty file (or no file) is a valid configuration.

use crate::domain::ports::providers;
use crate::error::{Error, Result};
use crate::quota::{QuotaLedger, QuotaLedgerRef, QuotaResource, QuotaScope};
use crate::task::engine::EngineConfig;
use crate::task::retry::StageRetry;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    /// REST API bind address
    pub api_addr: String,
    /// Health server bind address
    pub health_addr: String,
    /// Metrics server bind address
    pub metrics_addr: String,
    /// Directory of the file-backed task store; in-memory when unset
    pub state_dir: Option<PathBuf>,
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub quota: QuotaSection,
    pub providers: ProvidersSection,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:8090".into(),
            health_addr: "0.0.0.0:8081".into(),
            metrics_addr: "0.0.0.0:8080".into(),
            state_dir: None,
            engine: EngineSection::default(),
            retry: RetrySection::default(),
            quota: QuotaSection::default(),
            providers: ProvidersSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSection {
    /// Capacity of the task event channel
    pub event_capacity: usize,
    /// Continue unfinished tasks at startup
    pub resume_on_start: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            event_capacity: defaults.event_capacity,
            resume_on_start: defaults.resume_on_start,
        }
    }
}

/// Backend call retry applied by the managed drivers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = StageRetry::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_interval_ms: defaults.initial_interval.as_millis() as u64,
            max_interval_ms: defaults.max_interval.as_millis() as u64,
        }
    }
}

/// Limits per resource; unset means unlimited
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaLimits {
    pub cpu: Option<i64>,
    pub memory_mb: Option<i64>,
    pub storage_mb: Option<i64>,
    pub guests: Option<i64>,
}

impl QuotaLimits {
    fn entries(&self) -> BTreeMap<QuotaResource, i64> {
        [
            (QuotaResource::Cpu, self.cpu),
            (QuotaResource::MemoryMb, self.memory_mb),
            (QuotaResource::StorageMb, self.storage_mb),
            (QuotaResource::Guests, self.guests),
        ]
        .into_iter()
        .filter_map(|(r, limit)| limit.map(|l| (r, l)))
        .collect()
    }
}

/// Limits for one (domain, project)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLimits {
    pub domain_id: String,
    pub project_id: String,
    #[serde(flatten)]
    pub limits: QuotaLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaSection {
    /// Reserve quota for billable changes
    pub enabled: bool,
    /// Limits every scope starts with
    pub defaults: QuotaLimits,
    /// Per-scope overrides
    pub scopes: Vec<ScopeLimits>,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            enabled: true,
            defaults: QuotaLimits::default(),
            scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvidersSection {
    /// Plug-ins to register, by provider name
    pub enabled: Vec<String>,
    /// Latency of every simulated backend call
    pub simulated_latency_ms: u64,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            enabled: vec![
                providers::ALIYUN.to_string(),
                providers::AZURE.to_string(),
                providers::QCLOUD.to_string(),
            ],
            simulated_latency_ms: 50,
        }
    }
}

impl ControlPlaneConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&yaml)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// JSON schema of the configuration document
    pub fn schema_json() -> Result<String> {
        let schema = schemars::schema_for!(ControlPlaneConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("apiAddr", &self.api_addr),
            ("healthAddr", &self.health_addr),
            ("metricsAddr", &self.metrics_addr),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                Error::Configuration(format!("invalid {} {}: {}", name, addr, e))
            })?;
        }
        if self.engine.event_capacity == 0 {
            return Err(Error::Configuration(
                "engine.eventCapacity must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry.maxAttempts must be positive".into(),
            ));
        }
        for provider in &self.providers.enabled {
            if ![providers::ALIYUN, providers::AZURE, providers::QCLOUD].contains(&provider.as_str()) {
                return Err(Error::Configuration(format!(
                    "unknown provider {}",
                    provider
                )));
            }
        }
        Ok(())
    }

    pub fn socket_addr(addr: &str) -> Result<SocketAddr> {
        addr.parse()
            .map_err(|e| Error::Configuration(format!("invalid address {}: {}", addr, e)))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            event_capacity: self.engine.event_capacity,
            resume_on_start: self.engine.resume_on_start,
        }
    }

    pub fn stage_retry(&self) -> StageRetry {
        StageRetry {
            max_attempts: self.retry.max_attempts,
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            ..StageRetry::default()
        }
    }

    pub fn simulated_latency(&self) -> Duration {
        Duration::from_millis(self.providers.simulated_latency_ms)
    }

    /// Ledger seeded with the configured limits
    pub fn quota_ledger(&self) -> QuotaLedgerRef {
        let ledger = QuotaLedger::with_default_limits(self.quota.defaults.entries());
        for scope in &self.quota.scopes {
            let key = QuotaScope::new(&scope.domain_id, &scope.project_id);
            for (resource, limit) in scope.limits.entries() {
                ledger.set_limit(&key, resource, limit);
            }
        }
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaDeltas;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ControlPlaneConfig::from_yaml("{}").unwrap();
        assert_eq!(config.api_addr, "0.0.0.0:8090");
        assert_eq!(config.providers.enabled.len(), 3);
        assert!(config.quota.enabled);
        assert_eq!(config.stage_retry().max_attempts, 3);
    }

    #[test]
    fn test_scope_limits_reach_the_ledger() {
        let yaml = r#"
quota:
  defaults:
    guests: 10
  scopes:
    - domainId: default
      projectId: p1
      cpu: 4
retry:
  maxAttempts: 5
"#;
        let config = ControlPlaneConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.stage_retry().max_attempts, 5);

        let ledger = config.quota_ledger();
        let scope = QuotaScope::new("default", "p1");
        let err = ledger
            .reserve(&scope, QuotaDeltas::for_guest(8, 1024, 0))
            .unwrap_err();
        assert_matches!(err, Error::QuotaExceeded { .. });
        assert!(ledger
            .reserve(&QuotaScope::new("default", "p2"), QuotaDeltas::for_guest(8, 1024, 0))
            .is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert_matches!(
            ControlPlaneConfig::from_yaml("apiAddr: nowhere"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml("providers:\n  enabled: [vmware]"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControlPlaneConfig::from_yaml("engine: [1, 2]"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_schema_names_sections() {
        let schema = ControlPlaneConfig::schema_json().unwrap();
        assert!(schema.contains("providers"));
        assert!(schema.contains("resumeOnStart"));
    }
}
