use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sluice_core::{BalancerStrategy, QueueConfig};
use tracing::debug;

/// CLI configuration loaded from TOML. Everything except the workload
/// knobs is the queue configuration itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub workload: WorkloadConfig,

    #[serde(flatten)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Upper bound on the simulated work of a "sleep" request
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,

    /// Distinct payloads cycled through, so repeated requests hit the cache
    #[serde(default = "default_distinct_payloads")]
    pub distinct_payloads: usize,
}

fn default_max_sleep_ms() -> u64 {
    50
}

fn default_distinct_payloads() -> usize {
    20
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            max_sleep_ms: default_max_sleep_ms(),
            distinct_payloads: default_distinct_payloads(),
        }
    }
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/sluice/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("sluice");
        Ok(config_dir)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path or the default path, apply
    /// `SLUICE_*` environment overrides (after `.env`), then validate.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };
        let mut config = Self::from_file(&config_path)?;
        config.apply_overrides(|key| env::var(key).ok().filter(|v| !v.is_empty()))?;
        config.queue.validate().context("invalid queue configuration")?;
        Ok(config)
    }

    fn from_file(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            debug!(?config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }
        debug!(?config_path, "Loading config");
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config: {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config: {}", config_path.display()))
    }

    /// Apply overrides from `lookup` (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let q = &mut self.queue;
        if let Some(v) = parsed(&lookup, "SLUICE_MAX_QUEUE_SIZE")? {
            q.queue.max_queue_size = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_DISPATCH_INTERVAL_MS")? {
            q.queue.dispatch_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_DEFAULT_TIMEOUT_SECS")? {
            q.queue.default_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_DEFAULT_MAX_RETRIES")? {
            q.queue.default_max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_CACHE_MAX_ENTRIES")? {
            q.cache.max_entries = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_CACHE_TTL_SECS")? {
            q.cache.default_ttl_secs = v;
        }
        if let Some(v) = parsed(&lookup, "SLUICE_SCALING_ENABLED")? {
            q.scaling.enabled = v;
        }
        if let Some(v) = lookup("SLUICE_BALANCER") {
            q.balancer.strategy = match v.to_ascii_lowercase().as_str() {
                "round_robin" | "round-robin" => BalancerStrategy::RoundRobin,
                "least_loaded" | "least-loaded" => BalancerStrategy::LeastLoaded,
                "weighted" => BalancerStrategy::Weighted,
                other => bail!("SLUICE_BALANCER: unknown strategy '{other}'"),
            };
        }
        Ok(())
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}: cannot parse '{raw}': {e}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CliConfig::default();
        assert!(config.queue.validate().is_ok());
        assert_eq!(config.workload.distinct_payloads, 20);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CliConfig::default();
        config
            .apply_overrides(lookup(&[
                ("SLUICE_MAX_QUEUE_SIZE", "42"),
                ("SLUICE_SCALING_ENABLED", "false"),
                ("SLUICE_BALANCER", "weighted"),
            ]))
            .unwrap();
        assert_eq!(config.queue.queue.max_queue_size, 42);
        assert!(!config.queue.scaling.enabled);
        assert_eq!(config.queue.balancer.strategy, BalancerStrategy::Weighted);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = CliConfig::default();
        let err = config
            .apply_overrides(lookup(&[("SLUICE_MAX_QUEUE_SIZE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SLUICE_MAX_QUEUE_SIZE"));
        assert!(config
            .apply_overrides(lookup(&[("SLUICE_BALANCER", "random")]))
            .is_err());
    }

    #[test]
    fn test_toml_sections() {
        let parsed: CliConfig = toml::from_str(
            r#"
            [workload]
            max_sleep_ms = 5

            [queue]
            max_queue_size = 10

            [[pools]]
            name = "io"
            max_workers = 2
            request_types = ["sleep"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.workload.max_sleep_ms, 5);
        assert_eq!(parsed.queue.queue.max_queue_size, 10);
        assert_eq!(parsed.queue.pools.len(), 1);
        assert_eq!(parsed.queue.pools[0].name, "io");
        assert!(parsed.queue.pools[0].accepts("sleep"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CliConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: CliConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.queue, config.queue);
    }
}
