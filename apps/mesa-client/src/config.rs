use std::env;

use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";

/// Mesa client configuration.
///
/// One base address covers both the resource API and the push endpoint; the
/// channel module derives its streaming address from it.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: Url,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MESA_BASE_URL: {0}")]
    InvalidBaseUrl(String),
}

impl Config {
    /// Load configuration from environment variables. An unset or blank
    /// `MESA_BASE_URL` falls back to the local development server.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env::var("MESA_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(raw.trim())
            .map_err(|err| ConfigError::InvalidBaseUrl(format!("{raw}: {err}")))?;
        Ok(Self { base_url })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url parses"),
        }
    }
}
