use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

/// Guarded output must fit one wire frame even after JSON escaping.
pub const MAX_GUARDED_OUTPUT_BYTES: usize = protocol::framing::MAX_FRAME_LENGTH / 8;

impl BrokerConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: BrokerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency.capacity == 0 {
            anyhow::bail!("concurrency.capacity must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.guard.max_output_bytes > MAX_GUARDED_OUTPUT_BYTES {
            anyhow::bail!("guard.max_output_bytes must be at most {MAX_GUARDED_OUTPUT_BYTES}");
        }
        if !(0.0..=1.0).contains(&self.guard.min_overlap_ratio) {
            anyhow::bail!("guard.min_overlap_ratio must be within 0.0..=1.0");
        }
        Ok(())
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            limits: LimitsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            guard: GuardConfig::default(),
            policy: PolicyConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub timeout_secs: u64,
    pub capture_bytes: u64,
}

impl LimitsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn capture_bytes(&self) -> usize {
        usize::try_from(self.capture_bytes).unwrap_or(usize::MAX)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            capture_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
}

impl ConcurrencyConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            acquire_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            max_entries: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub lookback_secs: u64,
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 600,
            lookback_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_output_bytes: usize,
    pub min_summary_source_bytes: usize,
    pub min_overlap_ratio: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 12_000,
            min_summary_source_bytes: 64,
            min_overlap_ratio: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub denied_patterns: Vec<String>,
    pub escalation_prefix: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            denied_patterns: Vec::new(),
            escalation_prefix: "sudo -n".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub ssh_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            user: None,
            port: None,
            ssh_args: Vec::new(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("config/commands.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: BrokerConfig = toml::from_str("").expect("parse");
        assert_eq!(config.concurrency.capacity, 4);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.cache.ttl(), Duration::from_secs(30));
        assert_eq!(config.policy.escalation_prefix, "sudo -n");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let raw = r#"
            registry_path = "/etc/fleetgate/commands.json"

            [breaker]
            failure_threshold = 3

            [guard]
            max_output_bytes = 4096
        "#;
        let config: BrokerConfig = toml::from_str(raw).expect("parse");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_secs, 600);
        assert_eq!(config.guard.max_output_bytes, 4096);
        assert_eq!(config.guard.min_overlap_ratio, 0.3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_capacity() {
        let config: BrokerConfig = toml::from_str("[concurrency]\ncapacity = 0").expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_guard_cap_larger_than_a_frame() {
        let raw = format!("[guard]\nmax_output_bytes = {}", MAX_GUARDED_OUTPUT_BYTES + 1);
        let config: BrokerConfig = toml::from_str(&raw).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn bundled_config_is_valid() {
        let config: BrokerConfig =
            toml::from_str(include_str!("../config/config.toml")).expect("parse");
        assert!(config.validate().is_ok());
        assert_eq!(config.ssh.user.as_deref(), Some("ops"));
        assert_eq!(config.policy.denied_patterns.len(), 1);
    }
}
