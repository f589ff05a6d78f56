// Configuration for the transit integration layer.
// Built once by the process wiring and handed to constructors; nothing here is global.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://apitransporte.buenosaires.gob.ar";
pub const DEFAULT_ROUTES_FILE: &str = "static/routesinfo/routes.txt";
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_SEARCH_RADIUS_M: u32 = 100;

pub const ROUTES_FILE_KEY: &str = "ROUTES_FILE";
pub const CLIENT_ID_KEY: &str = "CABA_CLIENT_ID";
pub const CLIENT_SECRET_KEY: &str = "CABA_CLIENT_SECRET";
pub const BASE_URL_KEY: &str = "CABA_API_BASE_URL";
pub const RETRIES_KEY: &str = "CABA_API_RETRIES";
pub const TIMEOUT_KEY: &str = "CABA_API_TIMEOUT_MS";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration error: {0}")]
    Invalid(String),
}

// Retry configuration for the parking rules client.
// An initial backoff of zero disables the delay between attempts entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRIES,
            initial_backoff_ms: 0,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before the given retry (1 for the first retry, 2 for the second...).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.initial_backoff_ms == 0 || retry == 0 {
            return Duration::ZERO;
        }

        let base_backoff_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powf((retry - 1) as f64))
        .min(self.max_backoff_ms as f64);

        let jitter = rand::random::<f64>() * self.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - self.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParkingRulesConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout_ms: u64,
    pub search_radius_m: u32,
    pub retry_config: RetryConfig,
}

impl Default for ParkingRulesConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            search_radius_m: DEFAULT_SEARCH_RADIUS_M,
            retry_config: RetryConfig::default(),
        }
    }
}

impl ParkingRulesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_config.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitConfig {
    pub routes_file: PathBuf,
    pub parking: ParkingRulesConfig,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            routes_file: PathBuf::from(DEFAULT_ROUTES_FILE),
            parking: ParkingRulesConfig::default(),
        }
    }
}

impl TransitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // Empty values count as unset, the same way the default routes path kicks in.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let mut config = Self::default();

        if let Some(path) = get(ROUTES_FILE_KEY) {
            config.routes_file = PathBuf::from(path);
        }
        if let Some(client_id) = get(CLIENT_ID_KEY) {
            config.parking.client_id = client_id;
        }
        if let Some(client_secret) = get(CLIENT_SECRET_KEY) {
            config.parking.client_secret = client_secret;
        }
        if let Some(base_url) = get(BASE_URL_KEY) {
            config.parking.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(retries) = get(RETRIES_KEY) {
            config.parking.retry_config.max_attempts = parse_value(RETRIES_KEY, &retries)?;
        }
        if let Some(timeout) = get(TIMEOUT_KEY) {
            config.parking.timeout_ms = parse_value(TIMEOUT_KEY, &timeout)?;
        }

        config.parking.validate()?;
        Ok(config)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
