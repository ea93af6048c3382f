//! NATS JetStream-backed broker publisher.
//!
//! Retained grants map onto a stream with one message per subject: the
//! newest publish for an address is the durable last value, and an
//! empty publish is the removal record late subscribers see. Event
//! records go to a second, limits-retention stream. The underlying
//! client reconnects on its own, so the connection is long-lived.

use crate::publisher::{BrokerPublisher, PublishError, QoS};
use async_nats::jetstream;
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::Deserialize;

/// Stream name for retained access grants.
const GRANTS_STREAM_NAME: &str = "ACCESS_GRANTS";

/// Stream name for access event records.
const EVENTS_STREAM_NAME: &str = "ACCESS_EVENTS";

/// Subject filter for the grants stream.
const GRANT_SUBJECTS: &str = "access.grant.>";

/// Subject filter for the events stream.
const EVENT_SUBJECTS: &str = "access.event.>";

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

/// Configuration for the NATS publisher.
///
/// The subject filters must cover the dispatcher's topic prefixes;
/// the defaults of both line up.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub url: String,
    /// Stream name for grants (defaults to ACCESS_GRANTS).
    pub grants_stream_name: Option<String>,
    /// Stream name for event records (defaults to ACCESS_EVENTS).
    pub events_stream_name: Option<String>,
    /// Subject filter for the grants stream (defaults to access.grant.>).
    pub grant_subjects: Option<String>,
    /// Subject filter for the events stream (defaults to access.event.>).
    pub event_subjects: Option<String>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            grants_stream_name: None,
            events_stream_name: None,
            grant_subjects: None,
            event_subjects: None,
        }
    }

    fn grants_stream(&self) -> &str {
        self.grants_stream_name
            .as_deref()
            .unwrap_or(GRANTS_STREAM_NAME)
    }

    fn events_stream(&self) -> &str {
        self.events_stream_name
            .as_deref()
            .unwrap_or(EVENTS_STREAM_NAME)
    }

    fn grant_subject_filter(&self) -> &str {
        self.grant_subjects.as_deref().unwrap_or(GRANT_SUBJECTS)
    }

    fn event_subject_filter(&self) -> &str {
        self.event_subjects.as_deref().unwrap_or(EVENT_SUBJECTS)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self::new(default_nats_url())
    }
}

/// Errors from NATS publisher setup.
#[derive(Debug)]
pub enum NatsSetupError {
    /// Connecting to the server failed.
    Connect { message: String },
    /// Creating or fetching a stream failed.
    Stream { message: String },
}

impl std::fmt::Display for NatsSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { message } => write!(f, "NATS connection failed: {message}"),
            Self::Stream { message } => write!(f, "NATS stream setup failed: {message}"),
        }
    }
}

impl std::error::Error for NatsSetupError {}

/// JetStream-backed implementation of [`BrokerPublisher`].
pub struct NatsPublisher {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsPublisher {
    /// Connects to NATS and ensures the grant and event streams exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or stream setup fails.
    pub async fn connect(config: &NatsConfig) -> Result<Self, Report<NatsSetupError>> {
        let client =
            async_nats::connect(&config.url)
                .await
                .map_err(|e| NatsSetupError::Connect {
                    message: e.to_string(),
                })?;

        let jetstream = jetstream::new(client.clone());
        Self::ensure_streams(&jetstream, config).await?;

        Ok(Self { client, jetstream })
    }

    /// Ensures the required streams exist.
    async fn ensure_streams(
        jetstream: &jetstream::Context,
        config: &NatsConfig,
    ) -> Result<(), Report<NatsSetupError>> {
        // Grants: keep only the newest message per address subject, so
        // the stream behaves like a retained last-value cache.
        let grants_stream_config = jetstream::stream::Config {
            name: config.grants_stream().to_string(),
            subjects: vec![config.grant_subject_filter().to_string()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            max_messages_per_subject: 1,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(grants_stream_config)
            .await
            .map_err(|e| NatsSetupError::Stream {
                message: format!("failed to create grants stream: {e}"),
            })?;

        // Event records: append-only feed under normal limits.
        let events_stream_config = jetstream::stream::Config {
            name: config.events_stream().to_string(),
            subjects: vec![config.event_subject_filter().to_string()],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(events_stream_config)
            .await
            .map_err(|e| NatsSetupError::Stream {
                message: format!("failed to create events stream: {e}"),
            })?;

        Ok(())
    }
}

#[async_trait]
impl BrokerPublisher for NatsPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        _retain: bool,
        qos: QoS,
    ) -> Result<(), PublishError> {
        // Retention is a property of the grants stream, not of the
        // publish call, so the retain flag needs no per-message work.
        match qos {
            QoS::AtMostOnce => self
                .client
                .publish(topic.to_string(), payload.to_vec().into())
                .await
                .map_err(|e| PublishError::PublishFailed {
                    message: e.to_string(),
                }),
            QoS::AtLeastOnce => {
                self.jetstream
                    .publish(topic.to_string(), payload.to_vec().into())
                    .await
                    .map_err(|e| PublishError::PublishFailed {
                        message: e.to_string(),
                    })?
                    .await
                    .map_err(|e| PublishError::PublishFailed {
                        message: e.to_string(),
                    })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_config_defaults() {
        let config = NatsConfig::new("nats://localhost:4222");

        assert_eq!(config.grants_stream(), GRANTS_STREAM_NAME);
        assert_eq!(config.events_stream(), EVENTS_STREAM_NAME);
        assert_eq!(config.grant_subject_filter(), GRANT_SUBJECTS);
        assert_eq!(config.event_subject_filter(), EVENT_SUBJECTS);
    }

    #[test]
    fn nats_config_custom() {
        let config = NatsConfig {
            url: "nats://localhost:4222".to_string(),
            grants_stream_name: Some("CUSTOM_GRANTS".to_string()),
            events_stream_name: Some("CUSTOM_EVENTS".to_string()),
            grant_subjects: Some("custom.grant.>".to_string()),
            event_subjects: Some("custom.event.>".to_string()),
        };

        assert_eq!(config.grants_stream(), "CUSTOM_GRANTS");
        assert_eq!(config.events_stream(), "CUSTOM_EVENTS");
        assert_eq!(config.grant_subject_filter(), "custom.grant.>");
        assert_eq!(config.event_subject_filter(), "custom.event.>");
    }

    #[test]
    fn nats_config_from_empty_input() {
        let config: NatsConfig = serde_json::from_str("{}").expect("should deserialize");

        assert_eq!(config.url, "nats://localhost:4222");
        assert!(config.grants_stream_name.is_none());
    }
}
