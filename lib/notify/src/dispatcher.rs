//! Notification dispatch for session transitions.
//!
//! The dispatcher sits between the session state machine and the
//! broker. `dispatch` is synchronous and infallible from the caller's
//! point of view: the event is audit-logged, then handed to a bounded
//! queue consumed by a background worker. The worker translates each
//! event into broker messages and retries failed publishes with
//! exponential backoff. A full queue or a dead broker degrades to the
//! local log, never to a blocked or rolled-back transition.

use crate::publisher::{BrokerPublisher, PublishError, QoS};
use chrono::{DateTime, Utc};
use gatepass_core::{EventId, SessionId};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccessEventKind {
    /// Access was granted for `duration_secs` seconds.
    Opened { duration_secs: i64 },
    /// Access was closed before its expiry.
    Closed,
    /// Access lapsed at its expiry time.
    Expired,
}

impl AccessEventKind {
    /// Returns the kind as a log-friendly string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "opened",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }
}

/// A session transition to announce to the outside world.
///
/// Serialized as-is onto the event topic, so consumers see the same
/// record the audit log carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    /// Unique identifier for this event.
    pub id: EventId,
    /// The session that transitioned.
    pub session_id: SessionId,
    /// Address the session grants access to.
    pub subject_address: String,
    /// Identity the session was issued to.
    pub identity: String,
    #[serde(flatten)]
    pub kind: AccessEventKind,
    /// When the transition was committed.
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    /// Creates an event for a session that just opened.
    #[must_use]
    pub fn opened(
        session_id: SessionId,
        subject_address: impl Into<String>,
        identity: impl Into<String>,
        duration_secs: i64,
    ) -> Self {
        Self::new(
            session_id,
            subject_address,
            identity,
            AccessEventKind::Opened { duration_secs },
        )
    }

    /// Creates an event for a session closed by a caller.
    #[must_use]
    pub fn closed(
        session_id: SessionId,
        subject_address: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self::new(session_id, subject_address, identity, AccessEventKind::Closed)
    }

    /// Creates an event for a session that lapsed at its expiry.
    #[must_use]
    pub fn expired(
        session_id: SessionId,
        subject_address: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self::new(session_id, subject_address, identity, AccessEventKind::Expired)
    }

    fn new(
        session_id: SessionId,
        subject_address: impl Into<String>,
        identity: impl Into<String>,
        kind: AccessEventKind,
    ) -> Self {
        Self {
            id: EventId::new(),
            session_id,
            subject_address: subject_address.into(),
            identity: identity.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Configuration for the notification dispatcher.
///
/// Fields with defaults can be omitted when loading from environment
/// variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Topic prefix for retained grant messages. The subject address
    /// is appended as the final segment.
    #[serde(default = "default_grant_topic_prefix")]
    pub grant_topic_prefix: String,
    /// Topic prefix for event records.
    #[serde(default = "default_event_topic_prefix")]
    pub event_topic_prefix: String,
    /// Topic for the periodic alive signal.
    #[serde(default = "default_alive_topic")]
    pub alive_topic: String,
    /// Seconds between alive publishes. Zero disables the signal.
    #[serde(default = "default_alive_interval_secs")]
    pub alive_interval_secs: u64,
    /// Capacity of the local event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Publish attempts per message before giving up.
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,
    /// Whether grants for loopback/private/link-local addresses are
    /// published to the broker. They are audit-logged either way.
    #[serde(default)]
    pub publish_private_addresses: bool,
}

fn default_grant_topic_prefix() -> String {
    "access.grant".to_string()
}

fn default_event_topic_prefix() -> String {
    "access.event".to_string()
}

fn default_alive_topic() -> String {
    "access.alive".to_string()
}

fn default_alive_interval_secs() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_publish_attempts() -> u32 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            grant_topic_prefix: default_grant_topic_prefix(),
            event_topic_prefix: default_event_topic_prefix(),
            alive_topic: default_alive_topic(),
            alive_interval_secs: default_alive_interval_secs(),
            queue_capacity: default_queue_capacity(),
            max_publish_attempts: default_max_publish_attempts(),
            publish_private_addresses: false,
        }
    }
}

/// Handle for enqueueing access events.
///
/// Cheap to clone; every clone feeds the same background worker.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<AccessEvent>,
}

/// Join/abort handle for the dispatcher's background tasks.
pub struct DispatcherHandle {
    worker: JoinHandle<()>,
    alive: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    /// Starts the dispatcher worker (and alive task, if enabled) and
    /// returns the dispatch handle plus the task handle.
    pub fn start(
        publisher: Arc<dyn BrokerPublisher>,
        config: DispatcherConfig,
    ) -> (Self, DispatcherHandle) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));

        let worker = tokio::spawn(run_worker(receiver, Arc::clone(&publisher), config.clone()));
        let alive = if config.alive_interval_secs > 0 {
            Some(tokio::spawn(run_alive_loop(publisher, config)))
        } else {
            None
        };

        (Self { sender }, DispatcherHandle { worker, alive })
    }

    /// Records an event and queues it for broker delivery.
    ///
    /// The audit log entry is written before the event touches the
    /// queue, so the local record survives broker and queue failures.
    /// Never blocks: when the queue is full the event is dropped from
    /// broker delivery and kept in the log only.
    pub fn dispatch(&self, event: AccessEvent) {
        info!(
            target: "audit",
            event_id = %event.id,
            session_id = %event.session_id,
            address = %event.subject_address,
            identity = %event.identity,
            kind = event.kind.as_str(),
            timestamp = %event.timestamp,
            "access event",
        );

        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    session_id = %event.session_id,
                    kind = event.kind.as_str(),
                    "notification queue full, event kept in local log only",
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    session_id = %event.session_id,
                    kind = event.kind.as_str(),
                    "notification worker stopped, event kept in local log only",
                );
            }
        }
    }
}

impl DispatcherHandle {
    /// Aborts the background tasks without draining the queue.
    pub fn abort(&self) {
        self.worker.abort();
        if let Some(alive) = &self.alive {
            alive.abort();
        }
    }

    /// Waits for the worker to drain its queue and exit.
    ///
    /// The worker exits once every [`NotificationDispatcher`] clone has
    /// been dropped.
    pub async fn join(self) {
        if let Some(alive) = self.alive {
            alive.abort();
        }
        let _ = self.worker.await;
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<AccessEvent>,
    publisher: Arc<dyn BrokerPublisher>,
    config: DispatcherConfig,
) {
    while let Some(event) = receiver.recv().await {
        deliver(publisher.as_ref(), &config, &event).await;
    }
    debug!("notification worker exiting");
}

/// Translates one event into its broker messages.
///
/// Opens produce a retained grant carrying the TTL; closes and expiries
/// produce a retained empty payload that clears the grant for late
/// subscribers. Duplicate clears overwrite an already-empty value, so
/// redelivery is harmless. Every kind also emits a JSON event record.
async fn deliver(publisher: &dyn BrokerPublisher, config: &DispatcherConfig, event: &AccessEvent) {
    if !config.publish_private_addresses && is_private_address(&event.subject_address) {
        debug!(
            address = %event.subject_address,
            kind = event.kind.as_str(),
            "private address, skipping broker publish",
        );
        return;
    }

    let grant_topic = format!("{}.{}", config.grant_topic_prefix, event.subject_address);
    match event.kind {
        AccessEventKind::Opened { duration_secs } => {
            let grant = serde_json::json!({ "ttl": duration_secs }).to_string();
            publish_with_retry(
                publisher,
                config,
                &grant_topic,
                grant.as_bytes(),
                true,
                QoS::AtLeastOnce,
            )
            .await;
        }
        AccessEventKind::Closed | AccessEventKind::Expired => {
            publish_with_retry(publisher, config, &grant_topic, &[], true, QoS::AtLeastOnce).await;
        }
    }

    let event_topic = format!("{}.{}", config.event_topic_prefix, event.subject_address);
    match serde_json::to_vec(event) {
        Ok(record) => {
            publish_with_retry(
                publisher,
                config,
                &event_topic,
                &record,
                false,
                QoS::AtLeastOnce,
            )
            .await;
        }
        Err(e) => {
            error!(event_id = %event.id, error = %e, "failed to serialize event record");
        }
    }
}

/// Publishes with exponential backoff: 1s doubling to a 30s cap.
async fn publish_with_retry(
    publisher: &dyn BrokerPublisher,
    config: &DispatcherConfig,
    topic: &str,
    payload: &[u8],
    retain: bool,
    qos: QoS,
) {
    let mut delay = Duration::from_secs(1);

    for attempt in 1..=config.max_publish_attempts.max(1) {
        match publisher.publish(topic, payload, retain, qos).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(topic, attempt, "publish succeeded after retry");
                } else {
                    debug!(topic, "published");
                }
                return;
            }
            Err(e) if attempt < config.max_publish_attempts.max(1) => {
                warn!(topic, attempt, error = %e, "publish failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => {
                error!(
                    topic,
                    attempts = config.max_publish_attempts.max(1),
                    error = %e,
                    "publish failed, giving up; event remains in local log",
                );
            }
        }
    }
}

async fn run_alive_loop(publisher: Arc<dyn BrokerPublisher>, config: DispatcherConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.alive_interval_secs));

    loop {
        ticker.tick().await;
        let payload = serde_json::json!({ "alive_at": Utc::now() }).to_string();
        if let Err(e) = publisher
            .publish(&config.alive_topic, payload.as_bytes(), false, QoS::AtMostOnce)
            .await
        {
            debug!(error = %e, "alive publish failed");
        }
    }
}

/// Whether an address stays off the broker by default.
///
/// Covers loopback, RFC1918, link-local, documentation ranges, and
/// their IPv6 equivalents. Non-IP strings (hostnames) are publishable.
fn is_private_address(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_documentation()
                || v4.is_unspecified()
        }
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
        Err(_) => false,
    }
}
