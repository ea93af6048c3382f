//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables.
//!
//! Library-level settings ([`SessionLimits`], [`NatsConfig`],
//! [`DispatcherConfig`]) are composed here so one environment pass
//! configures the whole process.

use gatepass_access::SessionLimits;
use gatepass_notify::{DispatcherConfig, NatsConfig};
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// HTTP listener configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// NATS broker connection configuration.
    #[serde(default)]
    pub nats: NatsConfig,

    /// Notification dispatch configuration.
    #[serde(default)]
    pub notifications: DispatcherConfig,

    /// Access session configuration.
    #[serde(default)]
    pub access: AccessConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address the listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Access session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// Bounds on requested access durations.
    #[serde(default)]
    pub limits: SessionLimits,

    /// Interval between overdue-session sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_config_has_correct_defaults() {
        let config = AccessConfig::default();
        assert_eq!(config.limits.min_duration_secs, 3600);
        assert_eq!(config.limits.max_duration_secs, 43200);
        assert_eq!(config.sweep_interval_secs, 30);
    }

    #[test]
    fn only_database_url_is_required() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"database_url": "postgres://localhost/gatepass"}"#)
                .expect("should deserialize");

        assert_eq!(config.http.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.notifications.grant_topic_prefix, "access.grant");
        assert_eq!(config.access.sweep_interval_secs, 30);
    }
}
