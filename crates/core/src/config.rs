//! Configuration for the Ontos core
//!
//! Every recognized option has a default matching the service's documented
//! behavior; `OntosConfig::validate` rejects inconsistent settings at
//! startup rather than at first use.
//!
//! Durations are plain integer fields (seconds or milliseconds, named in
//! the field) so the TOML surface stays obvious.

use crate::error::{OntosError, OntosResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OntosConfig {
    /// Lock manager settings
    pub lock: LockConfig,
    /// Merge engine settings
    pub merge: MergeSettings,
    /// Outbox and dispatcher settings
    pub outbox: OutboxConfig,
    /// Audit store settings
    pub audit: AuditConfig,
    /// Engine-level settings (deadlines, shutdown)
    pub engine: EngineConfig,
}

impl OntosConfig {
    /// Parse from a TOML string. Unknown keys are ignored; missing keys
    /// take their defaults.
    pub fn from_toml_str(s: &str) -> OntosResult<Self> {
        let config: OntosConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on inconsistent settings.
    pub fn validate(&self) -> OntosResult<()> {
        if self.lock.heartbeat_grace == 0 {
            return Err(OntosError::config("lock.heartbeat_grace must be >= 1"));
        }
        if self.lock.heartbeat_check_interval_secs == 0 {
            return Err(OntosError::config(
                "lock.heartbeat_check_interval must be > 0",
            ));
        }
        if self.lock.ttl_check_interval_secs == 0 {
            return Err(OntosError::config("lock.ttl_check_interval must be > 0"));
        }
        if self.outbox.batch_size == 0 {
            return Err(OntosError::config("outbox.batch_size must be > 0"));
        }
        if self.outbox.retry_cap_ms < self.outbox.retry_base_delay_ms {
            return Err(OntosError::config(
                "outbox.retry_cap must be >= outbox.retry_base_delay",
            ));
        }
        self.merge.validate()?;
        Ok(())
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lease for kinds without a specific TTL (seconds)
    pub default_ttl_secs: u64,
    /// Default lease for INDEXING locks (seconds)
    pub indexing_ttl_secs: u64,
    /// Default lease for MAINTENANCE locks (seconds)
    pub maintenance_ttl_secs: u64,
    /// Default lease for MIGRATION locks (seconds)
    pub migration_ttl_secs: u64,
    /// Default lease for BACKUP locks (seconds)
    pub backup_ttl_secs: u64,
    /// Default lease for MANUAL locks (seconds)
    pub manual_ttl_secs: u64,
    /// Grace multiplier: a lock is dead after
    /// `heartbeat_interval * heartbeat_grace` without a heartbeat
    pub heartbeat_grace: u32,
    /// Heartbeat sweeper period (seconds)
    pub heartbeat_check_interval_secs: u64,
    /// TTL sweeper period (seconds)
    pub ttl_check_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            default_ttl_secs: 2 * 3600,
            indexing_ttl_secs: 4 * 3600,
            maintenance_ttl_secs: 3600,
            migration_ttl_secs: 6 * 3600,
            backup_ttl_secs: 2 * 3600,
            manual_ttl_secs: 24 * 3600,
            heartbeat_grace: 3,
            heartbeat_check_interval_secs: 30,
            ttl_check_interval_secs: 300,
        }
    }
}

impl LockConfig {
    /// Heartbeat sweeper period as a `Duration`
    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    /// TTL sweeper period as a `Duration`
    pub fn ttl_check_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_check_interval_secs)
    }
}

/// Merge engine settings.
///
/// The merge crate converts these primitive fields into its typed config;
/// the threshold is a severity name so it can live in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Max severity auto-resolved: "info", "warn", "error", or "block"
    pub auto_resolve_threshold: String,
    /// Fail on any conflict
    pub strict_mode: bool,
    /// Id fields tried, in order, for array-by-id diffing
    pub id_fields: Vec<String>,
    /// Fields excluded from diffing entirely
    pub ignore_fields: BTreeSet<String>,
    /// Allow safe primitive/cardinality widening
    pub enable_type_widening: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        MergeSettings {
            auto_resolve_threshold: "warn".to_string(),
            strict_mode: false,
            id_fields: vec!["@id".to_string(), "name".to_string(), "id".to_string()],
            ignore_fields: ["@timestamp", "@version"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enable_type_widening: true,
        }
    }
}

impl MergeSettings {
    fn validate(&self) -> OntosResult<()> {
        match self.auto_resolve_threshold.as_str() {
            "info" | "warn" | "error" | "block" => Ok(()),
            other => Err(OntosError::config(format!(
                "merge.auto_resolve_threshold must be one of info/warn/error/block, got '{}'",
                other
            ))),
        }
    }
}

/// Outbox and dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Max records picked per dispatcher iteration
    pub batch_size: usize,
    /// Idle sleep between dispatcher iterations (milliseconds)
    pub process_interval_ms: u64,
    /// Retries before dead-lettering
    pub max_retries: u32,
    /// Exponential backoff base (milliseconds)
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub retry_cap_ms: u64,
    /// Deadline for a single bus publish (seconds)
    pub bus_timeout_secs: u64,
    /// Completed records older than this are deleted (hours)
    pub cleanup_retention_hours: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        OutboxConfig {
            batch_size: 100,
            process_interval_ms: 1000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            retry_cap_ms: 5 * 60 * 1000,
            bus_timeout_secs: 10,
            cleanup_retention_hours: 24,
        }
    }
}

impl OutboxConfig {
    /// Idle sleep as a `Duration`
    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms)
    }

    /// Bus publish deadline as a `Duration`
    pub fn bus_timeout(&self) -> Duration {
        Duration::from_secs(self.bus_timeout_secs)
    }
}

/// Audit store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Fallback retention for unclassified actions (days)
    pub default_retention_days: i64,
    /// Compute per-batch integrity hashes
    pub batch_hash_enabled: bool,
    /// Archival sweep period (seconds)
    pub cleanup_interval_secs: u64,
    /// Deadline for a SIEM send (seconds)
    pub siem_timeout_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            default_retention_days: 2555,
            batch_hash_enabled: true,
            cleanup_interval_secs: 24 * 3600,
            siem_timeout_secs: 5,
        }
    }
}

impl AuditConfig {
    /// SIEM send deadline as a `Duration`
    pub fn siem_timeout(&self) -> Duration {
        Duration::from_secs(self.siem_timeout_secs)
    }
}

/// Engine-level deadlines and shutdown behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for a DocStore call (seconds)
    pub docstore_timeout_secs: u64,
    /// Budget for in-flight work during graceful shutdown (seconds)
    pub shutdown_budget_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            docstore_timeout_secs: 30,
            shutdown_budget_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Shutdown budget as a `Duration`
    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_secs(self.shutdown_budget_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = OntosConfig::default();

        assert_eq!(config.lock.default_ttl_secs, 7200);
        assert_eq!(config.lock.indexing_ttl_secs, 14400);
        assert_eq!(config.lock.heartbeat_grace, 3);
        assert_eq!(config.lock.heartbeat_check_interval_secs, 30);
        assert_eq!(config.lock.ttl_check_interval_secs, 300);

        assert_eq!(config.merge.auto_resolve_threshold, "warn");
        assert!(!config.merge.strict_mode);
        assert_eq!(config.merge.id_fields, vec!["@id", "name", "id"]);
        assert!(config.merge.ignore_fields.contains("@timestamp"));
        assert!(config.merge.enable_type_widening);

        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.outbox.process_interval_ms, 1000);
        assert_eq!(config.outbox.max_retries, 3);
        assert_eq!(config.outbox.retry_base_delay_ms, 1000);
        assert_eq!(config.outbox.retry_cap_ms, 300_000);

        assert_eq!(config.audit.default_retention_days, 2555);
        assert!(config.audit.batch_hash_enabled);

        assert_eq!(config.engine.docstore_timeout_secs, 30);
        assert_eq!(config.engine.shutdown_budget_secs, 30);

        config.validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = OntosConfig::from_toml_str(
            r#"
            [outbox]
            batch_size = 10
            max_retries = 5

            [lock]
            heartbeat_grace = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.outbox.batch_size, 10);
        assert_eq!(config.outbox.max_retries, 5);
        // Untouched keys keep their defaults
        assert_eq!(config.outbox.process_interval_ms, 1000);
        assert_eq!(config.lock.heartbeat_grace, 2);
        assert_eq!(config.lock.default_ttl_secs, 7200);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = OntosConfig::from_toml_str(
            r#"
            [merge]
            auto_resolve_threshold = "everything"
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("auto_resolve_threshold"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = OntosConfig::default();
        config.outbox.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_cap_below_base_rejected() {
        let mut config = OntosConfig::default();
        config.outbox.retry_base_delay_ms = 10_000;
        config.outbox.retry_cap_ms = 1_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry_cap"));
    }

    #[test]
    fn test_zero_heartbeat_grace_rejected() {
        let mut config = OntosConfig::default();
        config.lock.heartbeat_grace = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = OntosConfig::from_toml_str("not [ valid toml").unwrap_err();
        assert!(matches!(err, OntosError::Config { .. }));
    }
}
