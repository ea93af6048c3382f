//! Outbound notifications for access sessions.
//!
//! This crate turns session transitions into broker messages:
//!
//! - A retained grant message when access opens
//! - A retained empty clear when access closes or expires
//! - A JSON event record for every transition
//! - A periodic alive signal so consumers can detect outages
//!
//! Publishing is decoupled from the session state machine. Events are
//! queued to a background worker and audit-logged locally before any
//! broker I/O happens, so a broker outage never blocks a transition or
//! loses its record.

pub mod dispatcher;
pub mod nats;
pub mod publisher;

pub use dispatcher::{
    AccessEvent, AccessEventKind, DispatcherConfig, DispatcherHandle, NotificationDispatcher,
};
pub use nats::{NatsConfig, NatsPublisher, NatsSetupError};
pub use publisher::{BrokerPublisher, PublishError, PublishedMessage, QoS, RecordingPublisher};
