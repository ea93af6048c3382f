//! High-level access session operations.
//!
//! [`SessionManager`] ties the token issuer, the session store, the
//! expiry scheduler, and the notification dispatcher together behind
//! the handful of operations callers actually perform: issue a token,
//! open access with it, close access, and ask for status. State
//! transitions commit in the store first; notifications follow and can
//! fail without undoing anything.

use crate::expiry::ExpiryScheduler;
use crate::session::{AccessSession, ClosedBy, SessionState};
use crate::store::{SessionStore, SessionStoreError, SessionUpdate};
use crate::token::{AccessToken, TokenError, TokenIssuer};
use chrono::{DateTime, Utc};
use gatepass_core::SessionId;
use gatepass_notify::{AccessEvent, NotificationDispatcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Bounds on the access duration a caller may request.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SessionLimits {
    /// Shortest allowed duration, in seconds.
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: i64,
    /// Longest allowed duration, in seconds.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: i64,
}

fn default_min_duration_secs() -> i64 {
    3600
}

fn default_max_duration_secs() -> i64 {
    43200
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration_secs(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

/// Result of opening access with a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedAccess {
    /// The session the token belonged to.
    pub session_id: SessionId,
    /// When the granted access lapses.
    pub expires_at: DateTime<Utc>,
}

/// Point-in-time view of a session.
///
/// `state` is derived from the wall clock, so an open session past its
/// expiry reads as expired here even before the expiry transition has
/// committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Effective state at the time of the query.
    pub state: SessionState,
    /// When the session lapses, if it has opened.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the expiry time has passed.
    pub is_expired: bool,
}

/// Errors from the session operations.
#[derive(Debug)]
pub enum AccessError {
    /// The presented token does not exist.
    TokenNotFound,
    /// The presented token was already used.
    TokenAlreadyConsumed { state: SessionState },
    /// The address already has an open session.
    AlreadyOpen { address: String },
    /// The requested duration falls outside the configured bounds.
    DurationOutOfRange {
        requested: i64,
        min: i64,
        max: i64,
    },
    /// No session matches the given ID or token.
    SessionNotFound,
    /// The session is not in a state the operation applies to.
    StateConflict { current: SessionState },
    /// The store failed.
    Store(SessionStoreError),
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenNotFound => write!(f, "token not found"),
            Self::TokenAlreadyConsumed { state } => {
                write!(f, "token already consumed (session is {state})")
            }
            Self::AlreadyOpen { address } => {
                write!(f, "address {address} already has an open session")
            }
            Self::DurationOutOfRange {
                requested,
                min,
                max,
            } => {
                write!(
                    f,
                    "requested duration {requested}s is outside the allowed range {min}s to {max}s"
                )
            }
            Self::SessionNotFound => write!(f, "session not found"),
            Self::StateConflict { current } => match current {
                SessionState::Pending => write!(f, "session has not been opened"),
                current => write!(f, "session already closed (state {current})"),
            },
            Self::Store(e) => write!(f, "session store error: {e}"),
        }
    }
}

impl std::error::Error for AccessError {}

impl From<SessionStoreError> for AccessError {
    fn from(e: SessionStoreError) -> Self {
        match e {
            SessionStoreError::AddressInUse { address } => Self::AlreadyOpen { address },
            other => Self::Store(other),
        }
    }
}

/// Coordinates tokens, sessions, expiry timers, and notifications.
pub struct SessionManager<S: SessionStore + 'static> {
    store: Arc<S>,
    issuer: TokenIssuer<S>,
    scheduler: ExpiryScheduler<S>,
    dispatcher: NotificationDispatcher,
    limits: SessionLimits,
}

impl<S: SessionStore + 'static> SessionManager<S> {
    /// Creates a manager over the given store and dispatcher.
    pub fn new(store: Arc<S>, dispatcher: NotificationDispatcher, limits: SessionLimits) -> Self {
        Self {
            issuer: TokenIssuer::new(Arc::clone(&store)),
            scheduler: ExpiryScheduler::new(Arc::clone(&store), dispatcher.clone()),
            store,
            dispatcher,
            limits,
        }
    }

    /// Issues a fresh single-use token and its pending session.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the new session.
    pub async fn issue_token(&self, identity: &str) -> Result<AccessToken, AccessError> {
        let token = self.issuer.issue(identity).await?;
        info!(identity, "access token issued");
        Ok(token)
    }

    /// Consumes a token to open access to `subject_address` for
    /// `duration_secs` seconds.
    ///
    /// The open commits in the store, which enforces single use of the
    /// token and at most one open session per address. Only then does
    /// the expiry timer get registered and the grant announced.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::DurationOutOfRange`] for a duration
    /// outside the configured bounds, [`AccessError::TokenNotFound`]
    /// or [`AccessError::TokenAlreadyConsumed`] for a bad token, and
    /// [`AccessError::AlreadyOpen`] when the address is taken.
    pub async fn open_access(
        &self,
        token_value: &str,
        duration_secs: i64,
        subject_address: &str,
    ) -> Result<OpenedAccess, AccessError> {
        if duration_secs < self.limits.min_duration_secs
            || duration_secs > self.limits.max_duration_secs
        {
            return Err(AccessError::DurationOutOfRange {
                requested: duration_secs,
                min: self.limits.min_duration_secs,
                max: self.limits.max_duration_secs,
            });
        }

        // Friendly pre-check; the store's transition is the authority
        // when opens race.
        if !self
            .store
            .list_open_by_address(subject_address)
            .await?
            .is_empty()
        {
            return Err(AccessError::AlreadyOpen {
                address: subject_address.to_string(),
            });
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(duration_secs);
        let update = SessionUpdate::open(subject_address, duration_secs, now, expires_at);

        let session = match self.issuer.consume(token_value, update).await {
            Ok(session) => session,
            Err(TokenError::NotFound) => return Err(AccessError::TokenNotFound),
            Err(TokenError::AlreadyConsumed {
                state: SessionState::Open,
            }) => {
                // The token's own session is still open, so presenting
                // it again reads as a duplicate open.
                return Err(AccessError::AlreadyOpen {
                    address: subject_address.to_string(),
                });
            }
            Err(TokenError::AlreadyConsumed { state }) => {
                return Err(AccessError::TokenAlreadyConsumed { state });
            }
            Err(TokenError::Store(e)) => return Err(e.into()),
        };

        info!(
            session_id = %session.id,
            address = subject_address,
            duration_secs,
            "access opened",
        );

        self.scheduler.schedule(session.id, expires_at).await;
        self.dispatcher.dispatch(AccessEvent::opened(
            session.id,
            subject_address,
            session.identity.clone(),
            duration_secs,
        ));

        Ok(OpenedAccess {
            session_id: session.id,
            expires_at,
        })
    }

    /// Closes an open session, looked up by ID or by token value.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::SessionNotFound`] when the selector
    /// matches nothing and [`AccessError::StateConflict`] when the
    /// session is not open.
    pub async fn close_access(
        &self,
        selector: &str,
        closed_by: ClosedBy,
    ) -> Result<AccessSession, AccessError> {
        let Some(session) = self.resolve(selector).await? else {
            return Err(AccessError::SessionNotFound);
        };

        let update = SessionUpdate::closed(closed_by, Utc::now());
        let closed = match self
            .store
            .transition(session.id, SessionState::Open, update)
            .await
        {
            Ok(closed) => closed,
            Err(SessionStoreError::StateConflict { actual, .. }) => {
                return Err(AccessError::StateConflict { current: actual });
            }
            Err(e) => return Err(e.into()),
        };

        info!(session_id = %closed.id, closed_by = closed_by.as_str(), "access closed");

        self.scheduler.cancel(closed.id).await;
        if let Some(address) = &closed.subject_address {
            self.dispatcher.dispatch(AccessEvent::closed(
                closed.id,
                address.clone(),
                closed.identity.clone(),
            ));
        }

        Ok(closed)
    }

    /// Reports a session's effective state at the current time.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::SessionNotFound`] for an unknown ID.
    pub async fn status(&self, id: SessionId) -> Result<SessionStatus, AccessError> {
        let Some(session) = self.store.get(id).await? else {
            return Err(AccessError::SessionNotFound);
        };

        let now = Utc::now();
        Ok(SessionStatus {
            state: session.effective_state(now),
            expires_at: session.expires_at,
            is_expired: session.is_expired_at(now),
        })
    }

    /// Re-registers expiry timers for every open session.
    ///
    /// Called once at startup so sessions opened before a restart
    /// still lapse on time.
    ///
    /// # Errors
    ///
    /// Returns an error if the open-session scan fails.
    pub async fn restore(&self) -> Result<usize, AccessError> {
        Ok(self.scheduler.restore().await?)
    }

    /// Expires overdue open sessions inline.
    ///
    /// # Errors
    ///
    /// Returns an error if the open-session scan fails.
    pub async fn expire_overdue(&self) -> Result<usize, AccessError> {
        Ok(self.scheduler.expire_overdue().await?)
    }

    /// Looks a session up by ID first, falling back to token value.
    async fn resolve(&self, selector: &str) -> Result<Option<AccessSession>, SessionStoreError> {
        if let Ok(id) = selector.parse::<SessionId>()
            && let Some(session) = self.store.get(id).await?
        {
            return Ok(Some(session));
        }
        self.store.get_by_token(selector).await
    }
}
