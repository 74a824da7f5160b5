//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use activerow_core::{ActiveRowResult, ConfigError};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `activerow=debug`.
    pub default_filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_filter: std::env::var("ACTIVEROW_LOG").unwrap_or_else(|_| "activerow=info".to_string()),
            json: std::env::var("ACTIVEROW_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

impl TelemetryConfig {
    /// `RUST_LOG` wins over the configured default.
    pub fn env_filter(&self) -> ActiveRowResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.default_filter).map_err(|e| {
            ConfigError::InvalidValue {
                field: "default_filter".to_string(),
                value: self.default_filter.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_tracing(config: &TelemetryConfig) -> ActiveRowResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "tracing".to_string(),
        value: "global subscriber".to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(filter = %config.default_filter, json = config.json, "tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = TelemetryConfig {
            default_filter: "activerow=verbose".to_string(),
            json: false,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(config.env_filter().is_err());
        }
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            default_filter: "activerow=debug".to_string(),
            json: true,
        };
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
