use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `~/.fleetq/config.toml` by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub processor: ProcessorConfig,
    pub retry: RetryConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.fleetq/queue.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18900".to_string(),
        }
    }
}

/// Knobs for the background driver and its batch caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub cycle_interval_ms: u64,
    /// IN_PROGRESS inbound rows older than this are reset to PENDING.
    pub stuck_threshold_secs: u64,
    pub inbound_hosts_per_cycle: usize,
    pub inbound_messages_per_host: usize,
    pub null_host_batch: usize,
    pub outbound_batch: usize,
    pub broadcast_batch: usize,
    /// SENT rows without an ack for this long are requeued.
    pub unacknowledged_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 1000,
            stuck_threshold_secs: 30,
            inbound_hosts_per_cycle: 10,
            inbound_messages_per_host: 50,
            null_host_batch: 50,
            outbound_batch: 20,
            broadcast_batch: 10,
            unacknowledged_timeout_secs: 300,
        }
    }
}

impl ProcessorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }
}

/// Capped exponential backoff applied by `mark_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_max_retries: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base_secs: 60,
            backoff_cap_secs: 3600,
        }
    }
}

/// Longest retry delay accepted from config (30 days).
pub const MAX_BACKOFF_SECS: i64 = 30 * 86_400;
/// Longest age window accepted from config (10 years).
pub const MAX_WINDOW_SECS: i64 = 10 * 365 * 86_400;
pub const MAX_RETENTION_DAYS: i64 = MAX_WINDOW_SECS / 86_400;

impl RetryConfig {
    /// Delay before attempt `retry_count + 1`: `min(base * 2^(retry_count-1), cap)`.
    pub fn backoff_for(&self, retry_count: i64) -> chrono::Duration {
        let exponent = (retry_count.max(1) - 1).min(30) as u32;
        let secs = self
            .backoff_base_secs
            .saturating_mul(1i64 << exponent)
            .min(self.backoff_cap_secs)
            .clamp(0, MAX_BACKOFF_SECS);
        chrono::Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// PENDING inbound rows older than this are marked expired.
    pub inbound_expiry_secs: i64,
    pub cleanup_after_days: i64,
    pub keep_failed: bool,
    pub cleanup_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            inbound_expiry_secs: 86_400,
            cleanup_after_days: 30,
            keep_failed: true,
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `~/.fleetq`, falling back to `./.fleetq` when no home directory is known.
pub fn home_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".fleetq"))
        .unwrap_or_else(|| PathBuf::from(".fleetq"))
}

pub fn default_config_path() -> PathBuf {
    home_dir().join("config.toml")
}

impl Config {
    /// Load from `path` (or the default location). A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let parsed: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            tracing::debug!("Loaded config from {}", path.display());
            parsed
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.processor;
        if p.cycle_interval_ms == 0 {
            anyhow::bail!("processor.cycle_interval_ms must be greater than 0");
        }
        for (name, value) in [
            ("inbound_hosts_per_cycle", p.inbound_hosts_per_cycle),
            ("inbound_messages_per_host", p.inbound_messages_per_host),
            ("null_host_batch", p.null_host_batch),
            ("outbound_batch", p.outbound_batch),
            ("broadcast_batch", p.broadcast_batch),
        ] {
            if value == 0 {
                anyhow::bail!("processor.{name} must be greater than 0");
            }
        }
        if p.stuck_threshold_secs.saturating_mul(1000) <= p.cycle_interval_ms {
            anyhow::bail!(
                "processor.stuck_threshold_secs ({}s) must exceed the cycle interval ({}ms)",
                p.stuck_threshold_secs,
                p.cycle_interval_ms
            );
        }

        let r = &self.retry;
        if r.default_max_retries < 0 {
            anyhow::bail!("retry.default_max_retries must not be negative");
        }
        if r.backoff_base_secs <= 0 || r.backoff_cap_secs < r.backoff_base_secs {
            anyhow::bail!("retry backoff requires 0 < backoff_base_secs <= backoff_cap_secs");
        }

        if r.backoff_cap_secs > MAX_BACKOFF_SECS {
            anyhow::bail!("retry.backoff_cap_secs must not exceed {MAX_BACKOFF_SECS}");
        }

        let ret = &self.retention;
        if ret.inbound_expiry_secs <= 0 || ret.cleanup_after_days <= 0 {
            anyhow::bail!("retention windows must be greater than 0");
        }
        if ret.inbound_expiry_secs > MAX_WINDOW_SECS || ret.cleanup_after_days > MAX_RETENTION_DAYS {
            anyhow::bail!(
                "retention windows must not exceed {MAX_WINDOW_SECS}s / {MAX_RETENTION_DAYS} days"
            );
        }
        for (name, value) in [
            ("processor.stuck_threshold_secs", p.stuck_threshold_secs),
            ("processor.unacknowledged_timeout_secs", p.unacknowledged_timeout_secs),
            ("retention.cleanup_interval_secs", ret.cleanup_interval_secs),
        ] {
            if value > MAX_WINDOW_SECS as u64 {
                anyhow::bail!("{name} must not exceed {MAX_WINDOW_SECS}");
            }
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.database.path)
            .with_context(|| format!("Failed to expand database path '{}'", self.database.path))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for(1).num_seconds(), 60);
        assert_eq!(retry.backoff_for(2).num_seconds(), 120);
        assert_eq!(retry.backoff_for(3).num_seconds(), 240);
        assert_eq!(retry.backoff_for(7).num_seconds(), 3600);
        assert_eq!(retry.backoff_for(500).num_seconds(), 3600);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.processor.stuck_threshold_secs, 30);
        assert_eq!(config.processor.outbound_batch, 20);
        assert_eq!(config.retry.default_max_retries, 3);
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[processor]
inbound_hosts_per_cycle = 4

[retry]
backoff_base_secs = 5
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.processor.inbound_hosts_per_cycle, 4);
        assert_eq!(config.processor.outbound_batch, 20);
        assert_eq!(config.retry.backoff_base_secs, 5);
        assert_eq!(config.retry.backoff_cap_secs, 3600);
    }

    #[test]
    fn stuck_threshold_must_exceed_cycle_interval() {
        let mut config = Config::default();
        config.processor.cycle_interval_ms = 5000;
        config.processor.stuck_threshold_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_is_rejected() {
        let mut config = Config::default();
        config.processor.outbound_batch = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("outbound_batch"), "got: {err}");
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let mut config = Config::default();
        config.retention.cleanup_after_days = 100_000_000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retention windows"), "got: {err}");

        let mut config = Config::default();
        config.processor.unacknowledged_timeout_secs = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unacknowledged_timeout_secs"), "got: {err}");

        let mut config = Config::default();
        config.retry.backoff_cap_secs = i64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_never_exceeds_the_hard_ceiling() {
        let retry = RetryConfig {
            default_max_retries: 3,
            backoff_base_secs: i64::MAX,
            backoff_cap_secs: i64::MAX,
        };
        assert_eq!(retry.backoff_for(40).num_seconds(), MAX_BACKOFF_SECS);
    }

    #[test]
    fn database_path_expands_tilde() {
        let config = Config::default();
        let path = config.database_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
    }
}
