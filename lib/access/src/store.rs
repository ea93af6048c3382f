//! Session persistence contract.
//!
//! Every state change goes through `transition`, a compare-and-set:
//! the write commits only if the session is still in the expected
//! state, and concurrent callers observe `StateConflict`. That single
//! primitive gives the lifecycle its guarantees: tokens are consumed
//! exactly once, terminal states are immutable, and a close racing an
//! expiry commits exactly one winner.

use crate::session::{AccessSession, ClosedBy, SessionState};
use crate::token::AccessToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatepass_core::SessionId;
use std::fmt;

/// Field changes applied by a state transition.
///
/// `None` leaves the field untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    /// Target state of the transition.
    pub state: SessionState,
    pub subject_address: Option<String>,
    pub requested_secs: Option<i64>,
    pub opened_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<ClosedBy>,
}

impl SessionUpdate {
    /// Update for pending to open: binds the address and duration and
    /// sets the expiry.
    #[must_use]
    pub fn open(
        subject_address: impl Into<String>,
        requested_secs: i64,
        opened_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: SessionState::Open,
            subject_address: Some(subject_address.into()),
            requested_secs: Some(requested_secs),
            opened_at: Some(opened_at),
            expires_at: Some(expires_at),
            closed_at: None,
            closed_by: None,
        }
    }

    /// Update for open to closed.
    #[must_use]
    pub fn closed(closed_by: ClosedBy, closed_at: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::Closed,
            subject_address: None,
            requested_secs: None,
            opened_at: None,
            expires_at: None,
            closed_at: Some(closed_at),
            closed_by: Some(closed_by),
        }
    }

    /// Update for open to expired.
    #[must_use]
    pub fn expired(closed_at: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::Expired,
            subject_address: None,
            requested_secs: None,
            opened_at: None,
            expires_at: None,
            closed_at: Some(closed_at),
            closed_by: Some(ClosedBy::Expiry),
        }
    }
}

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    /// No session with the given ID.
    SessionNotFound { id: SessionId },
    /// The session was not in the state the transition expected.
    StateConflict {
        id: SessionId,
        expected: SessionState,
        actual: SessionState,
    },
    /// Another open session already holds the address.
    AddressInUse { address: String },
    /// The backing store failed.
    Backend { message: String },
}

impl fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound { id } => write!(f, "session not found: {id}"),
            Self::StateConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "session {id} state conflict: expected {expected}, found {actual}"
            ),
            Self::AddressInUse { address } => {
                write!(f, "address already has an open session: {address}")
            }
            Self::Backend { message } => write!(f, "session store backend error: {message}"),
        }
    }
}

impl std::error::Error for SessionStoreError {}

/// Trait for durable session persistence.
///
/// Implementations must make `transition` atomic with respect to both
/// the expected-state check and the one-open-session-per-address rule,
/// and every write must be durable before the call returns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists a freshly issued token together with its pending
    /// session, as one durable step.
    async fn create_pending(
        &self,
        token: &AccessToken,
        session: &AccessSession,
    ) -> Result<(), SessionStoreError>;

    /// Fetches a session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<AccessSession>, SessionStoreError>;

    /// Fetches the session bound to a token value.
    async fn get_by_token(
        &self,
        token_value: &str,
    ) -> Result<Option<AccessSession>, SessionStoreError>;

    /// Atomically moves a session from `expected` to `update.state`,
    /// applying the update's fields, and returns the stored result.
    ///
    /// Fails with `StateConflict` when the session is not in
    /// `expected` (or is already terminal), and with `AddressInUse`
    /// when opening would violate address uniqueness.
    async fn transition(
        &self,
        id: SessionId,
        expected: SessionState,
        update: SessionUpdate,
    ) -> Result<AccessSession, SessionStoreError>;

    /// Lists all currently open sessions.
    async fn list_open(&self) -> Result<Vec<AccessSession>, SessionStoreError>;

    /// Lists open sessions granting access to `subject_address`.
    async fn list_open_by_address(
        &self,
        subject_address: &str,
    ) -> Result<Vec<AccessSession>, SessionStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_update_sets_binding_fields() {
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(60);
        let update = SessionUpdate::open("8.8.8.8", 60, now, expires);

        assert_eq!(update.state, SessionState::Open);
        assert_eq!(update.subject_address.as_deref(), Some("8.8.8.8"));
        assert_eq!(update.requested_secs, Some(60));
        assert_eq!(update.expires_at, Some(expires));
        assert!(update.closed_at.is_none());
        assert!(update.closed_by.is_none());
    }

    #[test]
    fn expired_update_records_the_expiry_closer() {
        let now = Utc::now();
        let update = SessionUpdate::expired(now);

        assert_eq!(update.state, SessionState::Expired);
        assert_eq!(update.closed_by, Some(ClosedBy::Expiry));
        assert_eq!(update.closed_at, Some(now));
    }

    #[test]
    fn error_display_names_the_conflict() {
        let id = SessionId::new();
        let err = SessionStoreError::StateConflict {
            id,
            expected: SessionState::Open,
            actual: SessionState::Closed,
        };

        let rendered = err.to_string();
        assert!(rendered.contains("expected open"));
        assert!(rendered.contains("found closed"));
    }
}
