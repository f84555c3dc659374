//! Configuration Management
//!
//! Loads armctl settings from the user config directory.

use armcore::client::{ClientOptions, DEFAULT_ENDPOINT};
use armcore::http::RetryOptions;
use armcore::registration::RegistrationOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default delay between LRO polls
const DEFAULT_POLL_FREQUENCY_SECS: u64 = 30;

/// Provider registration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_polling_delay_secs")]
    pub polling_delay_secs: u64,
    #[serde(default = "default_polling_duration_secs")]
    pub polling_duration_secs: u64,
}

fn default_max_attempts() -> u32 {
    RegistrationOptions::default().max_attempts
}

fn default_polling_delay_secs() -> u64 {
    RegistrationOptions::default().polling_delay.as_secs()
}

fn default_polling_duration_secs() -> u64 {
    RegistrationOptions::default().polling_duration.as_secs()
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            polling_delay_secs: default_polling_delay_secs(),
            polling_duration_secs: default_polling_duration_secs(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    RetryOptions::default().max_retries
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Resource manager endpoint
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Tenants that also receive a token
    #[serde(default)]
    pub auxiliary_tenants: Vec<String>,
    /// Delay between LRO polls when the service sends no Retry-After
    #[serde(default)]
    pub poll_frequency_secs: Option<u64>,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("armctl").join("config.json"))
    }

    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Malformed content falls back to defaults
    fn parse(content: &str) -> Self {
        serde_json::from_str(content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed config: {}", e);
            Self::default()
        })
    }

    /// Get effective endpoint (CLI > config > environment > public cloud)
    pub fn effective_endpoint(&self, cli: Option<&str>) -> String {
        cli.map(str::to_string)
            .or_else(|| self.endpoint.clone())
            .or_else(|| {
                std::env::var("AZURE_RESOURCE_MANAGER_ENDPOINT")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
            })
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    }

    /// Poll frequency; zero is bumped to one second
    pub fn poll_frequency(&self) -> Duration {
        let secs = self
            .poll_frequency_secs
            .unwrap_or(DEFAULT_POLL_FREQUENCY_SECS)
            .max(1);
        Duration::from_secs(secs)
    }

    pub fn registration_options(&self) -> RegistrationOptions {
        RegistrationOptions {
            max_attempts: self.registration.max_attempts,
            polling_delay: Duration::from_secs(self.registration.polling_delay_secs),
            polling_duration: Duration::from_secs(self.registration.polling_duration_secs),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            scopes: None,
            auxiliary_tenants: self.auxiliary_tenants.clone(),
            retry: RetryOptions {
                max_retries: self.retry.max_retries,
                ..RetryOptions::default()
            },
            registration: self.registration_options(),
        }
    }
}
