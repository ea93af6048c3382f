//! In-memory session store.
//!
//! A single mutex guards both the session map and the token index, so
//! the compare-and-set transition and the one-open-per-address check
//! commit in one step. Used by tests and for running the service
//! without a database.

use crate::session::{AccessSession, SessionState};
use crate::store::{SessionStore, SessionStoreError, SessionUpdate};
use crate::token::AccessToken;
use async_trait::async_trait;
use gatepass_core::SessionId;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<SessionId, AccessSession>,
    token_index: HashMap<String, SessionId>,
}

/// Mutex-guarded map-backed implementation of [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<StoreInner>,
}

impl InMemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_pending(
        &self,
        token: &AccessToken,
        session: &AccessSession,
    ) -> Result<(), SessionStoreError> {
        let mut inner = self.inner.lock().await;
        inner.token_index.insert(token.value.clone(), session.id);
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<AccessSession>, SessionStoreError> {
        Ok(self.inner.lock().await.sessions.get(&id).cloned())
    }

    async fn get_by_token(
        &self,
        token_value: &str,
    ) -> Result<Option<AccessSession>, SessionStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .token_index
            .get(token_value)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn transition(
        &self,
        id: SessionId,
        expected: SessionState,
        update: SessionUpdate,
    ) -> Result<AccessSession, SessionStoreError> {
        let mut inner = self.inner.lock().await;

        if update.state == SessionState::Open
            && let Some(address) = &update.subject_address
        {
            let in_use = inner.sessions.values().any(|s| {
                s.id != id
                    && s.state == SessionState::Open
                    && s.subject_address.as_deref() == Some(address.as_str())
            });
            if in_use {
                return Err(SessionStoreError::AddressInUse {
                    address: address.clone(),
                });
            }
        }

        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(SessionStoreError::SessionNotFound { id })?;

        // Terminal sessions never transition again.
        if session.state.is_terminal() || session.state != expected {
            return Err(SessionStoreError::StateConflict {
                id,
                expected,
                actual: session.state,
            });
        }

        session.state = update.state;
        if let Some(address) = update.subject_address {
            session.subject_address = Some(address);
        }
        if let Some(secs) = update.requested_secs {
            session.requested_secs = Some(secs);
        }
        if let Some(at) = update.opened_at {
            session.opened_at = Some(at);
        }
        if let Some(at) = update.expires_at {
            session.expires_at = Some(at);
        }
        if let Some(at) = update.closed_at {
            session.closed_at = Some(at);
        }
        if let Some(by) = update.closed_by {
            session.closed_by = Some(by);
        }

        Ok(session.clone())
    }

    async fn list_open(&self) -> Result<Vec<AccessSession>, SessionStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.state == SessionState::Open)
            .cloned()
            .collect())
    }

    async fn list_open_by_address(
        &self,
        subject_address: &str,
    ) -> Result<Vec<AccessSession>, SessionStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| {
                s.state == SessionState::Open
                    && s.subject_address.as_deref() == Some(subject_address)
            })
            .cloned()
            .collect())
    }
}
