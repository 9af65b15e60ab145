use std::time::Duration;

use anyhow::Result;
use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Default reaper tick for the pending request store.
const DEFAULT_REAPER_INTERVAL_MS: u64 = 500;

/// Default request timeout when a `send` carries no explicit timeout.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 20_000;

/// Bus configuration
/// Defines requester-side timing; topology is declared on the builder.
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct BusConfig {
    /// Pending request reaper tick in milliseconds. Bounded at one second.
    /// Set this at runtime with environment variable OMNIBUS_REAPER_INTERVAL_MS.
    #[validate(range(min = 1, max = 1000))]
    #[builder(default = "DEFAULT_REAPER_INTERVAL_MS")]
    pub reaper_interval_ms: u64,

    /// Request timeout in milliseconds applied when `send` options carry
    /// none. Set this at runtime with environment variable
    /// OMNIBUS_DEFAULT_REQUEST_TIMEOUT_MS.
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_REQUEST_TIMEOUT_MS")]
    pub default_request_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
            default_request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }

    /// Instantiates and reads bus configuration from the environment.
    pub fn from_settings() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("OMNIBUS_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.min(1_000))
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

impl BusConfigBuilder {
    pub fn build(self) -> Result<BusConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reaper_interval(), Duration::from_millis(500));
        assert_eq!(config.default_request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_reaper_interval_bounded_at_one_second() {
        let config = BusConfig::builder().reaper_interval_ms(2_000).build();
        // The range validation rejects intervals above one second.
        assert!(config.is_err());
    }

    #[test]
    fn test_from_settings_reads_env_overrides() {
        // One test owns these variables; set_var is unsafe in edition 2024
        // and nothing else in this process reads them concurrently.
        unsafe {
            std::env::set_var("OMNIBUS_REAPER_INTERVAL_MS", "250");
            std::env::set_var("OMNIBUS_DEFAULT_REQUEST_TIMEOUT_MS", "5000");
        }
        let config = BusConfig::from_settings().unwrap();
        assert_eq!(config.reaper_interval(), Duration::from_millis(250));
        assert_eq!(config.default_request_timeout(), Duration::from_secs(5));

        // Intervals above one second fail the range validation.
        unsafe {
            std::env::set_var("OMNIBUS_REAPER_INTERVAL_MS", "5000");
        }
        let result = BusConfig::from_settings();
        unsafe {
            std::env::remove_var("OMNIBUS_REAPER_INTERVAL_MS");
            std::env::remove_var("OMNIBUS_DEFAULT_REQUEST_TIMEOUT_MS");
        }
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = BusConfig::builder()
            .reaper_interval_ms(100)
            .default_request_timeout_ms(1_000)
            .build()
            .unwrap();
        assert_eq!(config.reaper_interval(), Duration::from_millis(100));
        assert_eq!(config.default_request_timeout(), Duration::from_secs(1));
    }
}
