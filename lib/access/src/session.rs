//! Access session records and their state machine.
//!
//! A session is created `pending` when its token is issued, becomes
//! `open` when the token is consumed, and settles in exactly one of
//! the terminal states `closed` or `expired`. Terminal sessions never
//! change again.

use chrono::{DateTime, Utc};
use gatepass_core::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an access session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Token issued, access not yet opened.
    Pending,
    /// Access is granted until `expires_at`.
    Open,
    /// Access was ended by a caller.
    Closed,
    /// Access lapsed at its expiry time.
    Expired,
}

impl SessionState {
    /// Returns the state as a stable string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }

    /// Parses a state from its string value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether this state is terminal. Terminal sessions never
    /// transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Expired)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedBy {
    /// The token holder closed it.
    User,
    /// The expiry timer closed it.
    Expiry,
    /// An operator closed it.
    Admin,
}

impl ClosedBy {
    /// Returns the closer as a stable string value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Expiry => "expiry",
            Self::Admin => "admin",
        }
    }

    /// Parses a closer from its string value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "expiry" => Some(Self::Expiry),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for ClosedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single access session.
///
/// The subject address and requested duration are bound when the
/// session opens, not when the token is issued, so both start empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSession {
    /// Unique identifier.
    pub id: SessionId,
    /// Token value the session is bound to.
    pub token_value: String,
    /// Identity the token was issued to.
    pub identity: String,
    /// Address access is granted to. Set when the session opens.
    pub subject_address: Option<String>,
    /// Granted duration in seconds. Set when the session opens.
    pub requested_secs: Option<i64>,
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the token was issued.
    pub created_at: DateTime<Utc>,
    /// When the session opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When access lapses. Set iff the session reached the open state.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state.
    pub closed_at: Option<DateTime<Utc>>,
    /// Who ended the session.
    pub closed_by: Option<ClosedBy>,
}

impl AccessSession {
    /// Creates the pending session backing a freshly issued token.
    #[must_use]
    pub fn pending(token_value: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            token_value: token_value.into(),
            identity: identity.into(),
            subject_address: None,
            requested_secs: None,
            state: SessionState::Pending,
            created_at: Utc::now(),
            opened_at: None,
            expires_at: None,
            closed_at: None,
            closed_by: None,
        }
    }

    /// Whether the session's expiry time has passed at `now`.
    ///
    /// Purely time-based: a pending session has no expiry and is never
    /// expired, while a closed session past its original expiry still
    /// reports true here.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// The state a caller observes at `now`.
    ///
    /// An open session whose expiry has passed reads as expired even
    /// before the expiry timer commits that transition.
    #[must_use]
    pub fn effective_state(&self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Open && self.is_expired_at(now) {
            SessionState::Expired
        } else {
            self.state
        }
    }
}
