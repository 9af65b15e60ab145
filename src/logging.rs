//! Bus logging setup.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `OMNIBUS_LOGGING_CONFIG_PATH`
//!      environment variable.
//!
//! Filters are comma-separated key-value pairs where the key is the crate
//! or module name and the value is the log level. The default log level is
//! `info`.
//!
//! Example:
//! ```toml
//! log_level = "error"
//!
//! [log_filters]
//! "omnibus" = "info"
//! "omnibus::consumer" = "trace"
//! ```

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    fn from_settings() -> Self {
        let mut figment =
            Figment::new().merge(Serialized::defaults(LoggingConfig::default()));
        if let Ok(path) = std::env::var("OMNIBUS_LOGGING_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("OMNIBUS_LOGGING_"))
            .extract()
            .unwrap_or_default()
    }

    fn directives(&self) -> String {
        let mut directives = vec![self.log_level.clone()];
        for (target, level) in &self.log_filters {
            directives.push(format!("{target}={level}"));
        }
        directives.join(",")
    }
}

/// Initialize logging. Idempotent; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        let config = LoggingConfig::from_settings();
        let filter = EnvFilter::try_new(config.directives())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directives_include_filters() {
        let config = LoggingConfig {
            log_level: "warn".to_string(),
            log_filters: HashMap::from([("omnibus".to_string(), "debug".to_string())]),
        };
        let directives = config.directives();
        assert!(directives.starts_with("warn"));
        assert!(directives.contains("omnibus=debug"));
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
