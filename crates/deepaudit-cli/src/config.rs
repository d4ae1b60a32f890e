//! Control-plane configuration (C18 ambient stack): TOML file layered with
//! `DEEPAUDIT_`-prefixed environment variables via `figment`, matching the
//! teacher's config-loading conventions.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use deepaudit_core::Error;

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
}

fn default_rate() -> f64 {
    2.0
}

fn default_burst() -> f64 {
    4.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate(),
            burst: default_burst(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Load from (in ascending priority) a default empty figment, the
    /// config file at `path` if it exists, then `DEEPAUDIT_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Config::default()));

        let config_path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);
        if config_path.exists() {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(Env::prefixed("DEEPAUDIT_"));

        figment
            .extract()
            .map_err(|e| Error::Config(format!("failed to load configuration: {e}")))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deepaudit")
            .join("config.toml")
    }

    /// Resolve the API key: config file value, else `<PROVIDER>_API_KEY` env var.
    pub fn resolve_api_key(&self) -> Result<String, Error> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(format!("{}_API_KEY", self.provider.to_uppercase())).ok())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no API key configured for provider '{}': set it in the config file or the \
                     {}_API_KEY environment variable",
                    self.provider,
                    self.provider.to_uppercase()
                ))
            })
    }
}
