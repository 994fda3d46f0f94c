use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheKeyStrategy;
use crate::catalog::{ModelCatalog, ModelInfo};

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SWITCHBOARD_CONFIG", default_value = "config.yaml")]
    pub config: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub router: RouterSettings,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
    pub webhooks: WebhookSettings,
    pub analytics: AnalyticsSettings,
    /// Extra catalog entries merged over the built-in catalog
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Bound on each health probe and upstream dispatch
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries per failed health probe
    pub probe_retries: u32,
    /// Base for the probe retry backoff (`base * 2^(attempt-1)` plus jitter)
    #[serde(with = "humantime_serde")]
    pub probe_backoff: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            probe_retries: 3,
            probe_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Cadence of the background expiry sweeper
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub key_strategy: CacheKeyStrategy,
    pub ignore_temperature: bool,
    pub ignore_top_p: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            key_strategy: CacheKeyStrategy::Exact,
            ignore_temperature: false,
            ignore_top_p: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Child dispatches in flight across the whole process
    pub max_concurrent_requests: usize,
    /// How long the scheduler sleeps when the queue is empty
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Per-delivery HTTP timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries for webhooks created without an explicit retry count
    pub default_retries: u32,
    /// Base of the delivery retry backoff (`base * 2^attempt`)
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            default_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    /// USD per 1e6 input tokens for models missing from the catalog
    pub default_input_price: f64,
    /// USD per 1e6 output tokens for models missing from the catalog
    pub default_output_price: f64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            default_input_price: 1.0,
            default_output_price: 2.0,
        }
    }
}

impl Config {
    /// Load configuration from the YAML file named by `args`, overlaid with
    /// `SWITCHBOARD_`-prefixed environment variables. A missing file yields
    /// the defaults.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut figment = Figment::new();
        if Path::new(&args.config).exists() {
            figment = figment.merge(Yaml::file(&args.config));
        }
        let config: Config = figment
            .merge(Env::prefixed("SWITCHBOARD_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Built-in catalog with any configured extra models merged on top.
    pub fn build_catalog(&self) -> ModelCatalog {
        let builtin = ModelCatalog::builtin();
        if self.models.is_empty() {
            return builtin;
        }
        ModelCatalog::from_models(builtin.iter().cloned().chain(self.models.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.router.timeout, Duration::from_millis(5000));
        assert_eq!(config.router.probe_retries, 3);
        assert_eq!(config.batch.max_concurrent_requests, 5);
        assert_eq!(config.webhooks.timeout, Duration::from_secs(10));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(300));
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
router:
  timeout: 2s
  probe_retries: 1
cache:
  ttl: 10m
  key_strategy: semantic
batch:
  max_concurrent_requests: 8
"#;
        let config: Config = figment::Figment::new()
            .merge(figment::providers::Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.router.timeout, Duration::from_secs(2));
        assert_eq!(config.router.probe_retries, 1);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.cache.key_strategy, CacheKeyStrategy::Semantic);
        assert_eq!(config.batch.max_concurrent_requests, 8);
        // Unspecified sections keep their defaults
        assert_eq!(config.webhooks.default_retries, 3);
    }

    #[test]
    fn test_extra_models_merge_into_catalog() {
        let mut config = Config::default();
        config.models.push(ModelInfo {
            id: "acme/raven-1".to_string(),
            provider: "acme".to_string(),
            name: "raven-1".to_string(),
            context_window: 32_000,
            input_price: 0.1,
            output_price: 0.2,
            strengths: Default::default(),
            features: Default::default(),
            max_output_tokens: 2048,
            fallbacks: vec![],
        });
        let catalog = config.build_catalog();
        assert!(catalog.contains("acme/raven-1"));
        assert!(catalog.contains("anthropic/claude-3-opus"));
    }
}
