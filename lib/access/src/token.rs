//! Single-use access tokens.
//!
//! A token is an opaque URL-safe value backed by 256 bits from the OS
//! RNG. Issuing one also creates its pending session; consuming one is
//! the compare-and-set that moves that session out of pending, so a
//! token can be redeemed at most once no matter how many callers race.
//!
//! Token values never appear in errors or logs.

use crate::session::{AccessSession, SessionState};
use crate::store::{SessionStore, SessionStoreError, SessionUpdate};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Random bytes behind each token value.
const TOKEN_ENTROPY_BYTES: usize = 32;

/// A single-use bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque URL-safe token value.
    pub value: String,
    /// Identity the token was issued to.
    pub identity: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
}

impl AccessToken {
    /// Generates a fresh token for `identity`.
    #[must_use]
    pub fn generate(identity: impl Into<String>) -> Self {
        let mut seed = [0u8; TOKEN_ENTROPY_BYTES];
        OsRng.fill_bytes(&mut seed);

        Self {
            value: URL_SAFE_NO_PAD.encode(seed),
            identity: identity.into(),
            issued_at: Utc::now(),
        }
    }
}

/// Errors from token operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// No session is bound to the presented value.
    NotFound,
    /// The bound session has already left the pending state.
    AlreadyConsumed { state: SessionState },
    /// The session store failed.
    Store(SessionStoreError),
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "access token not found"),
            Self::AlreadyConsumed { state } => {
                write!(f, "access token already consumed (session {state})")
            }
            Self::Store(e) => write!(f, "session store error: {e}"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<SessionStoreError> for TokenError {
    fn from(e: SessionStoreError) -> Self {
        Self::Store(e)
    }
}

/// Issues and consumes single-use access tokens.
pub struct TokenIssuer<S: SessionStore> {
    store: Arc<S>,
}

impl<S: SessionStore> TokenIssuer<S> {
    /// Creates an issuer over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Issues a token and persists its pending session in one durable
    /// step.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn issue(&self, identity: &str) -> Result<AccessToken, SessionStoreError> {
        let token = AccessToken::generate(identity);
        let session = AccessSession::pending(&token.value, identity);

        self.store.create_pending(&token, &session).await?;
        Ok(token)
    }

    /// Consumes a token by transitioning its pending session with
    /// `update`.
    ///
    /// The store's compare-and-set makes this atomic: when callers
    /// race on the same value, exactly one consumption commits and the
    /// rest observe `AlreadyConsumed`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no session is bound to the value,
    /// `AlreadyConsumed` when the session has left pending, and
    /// `Store` for other store failures (including address conflicts).
    pub async fn consume(
        &self,
        value: &str,
        update: SessionUpdate,
    ) -> Result<AccessSession, TokenError> {
        let session = self
            .store
            .get_by_token(value)
            .await?
            .ok_or(TokenError::NotFound)?;

        if session.state != SessionState::Pending {
            return Err(TokenError::AlreadyConsumed {
                state: session.state,
            });
        }

        match self
            .store
            .transition(session.id, SessionState::Pending, update)
            .await
        {
            Ok(consumed) => Ok(consumed),
            Err(SessionStoreError::StateConflict { actual, .. }) => {
                // Another caller consumed it between our read and the CAS.
                Err(TokenError::AlreadyConsumed { state: actual })
            }
            Err(e) => Err(e.into()),
        }
    }
}
