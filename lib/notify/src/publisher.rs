//! Broker publishing capability.
//!
//! The dispatcher needs only a narrow surface from the broker: publish
//! a payload to a topic with a retention flag and a delivery guarantee.
//! Concrete broker wiring lives behind [`BrokerPublisher`], so the
//! session machinery can be exercised against [`RecordingPublisher`]
//! without a broker running.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire-and-forget. Loss is acceptable.
    AtMostOnce,
    /// The broker must acknowledge the publish.
    AtLeastOnce,
}

/// Errors from broker publish operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker connection is unavailable.
    ConnectionFailed { message: String },
    /// The publish was rejected or never acknowledged.
    PublishFailed { message: String },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "broker connection failed: {message}"),
            Self::PublishFailed { message } => write!(f, "broker publish failed: {message}"),
        }
    }
}

impl std::error::Error for PublishError {}

/// Capability to publish messages to the outbound broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publishes `payload` to `topic`.
    ///
    /// A retained publish becomes the topic's durable last value;
    /// publishing an empty retained payload removes the previous one
    /// for late subscribers.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        qos: QoS,
    ) -> Result<(), PublishError>;
}

/// A message captured by [`RecordingPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub qos: QoS,
}

/// Publisher that records messages in memory.
///
/// Used in tests and for running the service without a broker. Can be
/// configured to fail a fixed number of publishes before succeeding,
/// which exercises the dispatcher's retry path.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
    failures_remaining: Arc<Mutex<u32>>,
}

impl RecordingPublisher {
    /// Creates a publisher that accepts every publish.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a publisher whose next `count` publishes fail.
    #[must_use]
    pub fn failing_times(count: u32) -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            failures_remaining: Arc::new(Mutex::new(count)),
        }
    }

    /// Returns every captured message in publish order.
    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    /// Returns the current retained payload per topic.
    ///
    /// Mirrors what a late subscriber would observe: the last retained
    /// publish wins, and an empty retained payload is a clear.
    pub async fn retained(&self) -> HashMap<String, Vec<u8>> {
        let mut retained = HashMap::new();
        for message in self.messages.lock().await.iter() {
            if message.retain {
                retained.insert(message.topic.clone(), message.payload.clone());
            }
        }
        retained
    }
}

#[async_trait]
impl BrokerPublisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        qos: QoS,
    ) -> Result<(), PublishError> {
        let mut failures = self.failures_remaining.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(PublishError::PublishFailed {
                message: "scripted failure".to_string(),
            });
        }
        drop(failures);

        self.messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
            qos,
        });
        Ok(())
    }
}
