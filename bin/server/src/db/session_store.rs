//! PostgreSQL implementation of the session store.
//!
//! The compare-and-set transition maps to an `UPDATE ... WHERE id = $1
//! AND state = $2` guarded to non-terminal states. The
//! one-open-session-per-address rule is a partial unique index on
//! `access_sessions (subject_address) WHERE state = 'open'`, so racing
//! opens settle inside PostgreSQL and the loser surfaces as
//! `AddressInUse`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatepass_access::{
    AccessSession, AccessToken, ClosedBy, SessionState, SessionStore, SessionStoreError,
    SessionUpdate,
};
use gatepass_core::SessionId;
use sqlx::{FromRow, PgPool};

/// Row type for session queries.
#[derive(FromRow)]
struct SessionRow {
    id: String,
    token_value: String,
    identity: String,
    subject_address: Option<String>,
    requested_secs: Option<i64>,
    state: String,
    created_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    closed_by: Option<String>,
}

impl SessionRow {
    fn try_into_session(self) -> Result<AccessSession, sqlx::Error> {
        let id = self.id.parse::<SessionId>().map_err(|e| {
            sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid session id '{}': {}", self.id, e),
            )))
        })?;
        let state = SessionState::parse(&self.state).ok_or_else(|| {
            sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid session state '{}'", self.state),
            )))
        })?;
        let closed_by = self
            .closed_by
            .map(|value| {
                ClosedBy::parse(&value).ok_or_else(|| {
                    sqlx::Error::Decode(Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid closer '{value}'"),
                    )))
                })
            })
            .transpose()?;

        Ok(AccessSession {
            id,
            token_value: self.token_value,
            identity: self.identity,
            subject_address: self.subject_address,
            requested_secs: self.requested_secs,
            state,
            created_at: self.created_at,
            opened_at: self.opened_at,
            expires_at: self.expires_at,
            closed_at: self.closed_at,
            closed_by,
        })
    }
}

fn backend(e: sqlx::Error) -> SessionStoreError {
    SessionStoreError::Backend {
        message: e.to_string(),
    }
}

/// PostgreSQL-backed session store.
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    /// Creates a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_pending(
        &self,
        token: &AccessToken,
        session: &AccessSession,
    ) -> Result<(), SessionStoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO access_tokens (value, identity, issued_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&token.value)
        .bind(&token.identity)
        .bind(token.issued_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO access_sessions
                (id, token_value, identity, subject_address, requested_secs, state,
                 created_at, opened_at, expires_at, closed_at, closed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.token_value)
        .bind(&session.identity)
        .bind(session.subject_address.as_deref())
        .bind(session.requested_secs)
        .bind(session.state.as_str())
        .bind(session.created_at)
        .bind(session.opened_at)
        .bind(session.expires_at)
        .bind(session.closed_at)
        .bind(session.closed_by.map(|c| c.as_str()))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<AccessSession>, SessionStoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, token_value, identity, subject_address, requested_secs, state,
                   created_at, opened_at, expires_at, closed_at, closed_by
            FROM access_sessions
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(r) => Ok(Some(r.try_into_session().map_err(backend)?)),
            None => Ok(None),
        }
    }

    async fn get_by_token(
        &self,
        token_value: &str,
    ) -> Result<Option<AccessSession>, SessionStoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, token_value, identity, subject_address, requested_secs, state,
                   created_at, opened_at, expires_at, closed_at, closed_by
            FROM access_sessions
            WHERE token_value = $1
            "#,
        )
        .bind(token_value)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(r) => Ok(Some(r.try_into_session().map_err(backend)?)),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: SessionId,
        expected: SessionState,
        update: SessionUpdate,
    ) -> Result<AccessSession, SessionStoreError> {
        // The state IN ('pending', 'open') guard keeps terminal rows
        // immutable even when a caller names the terminal state as
        // expected.
        let result: Result<Option<SessionRow>, sqlx::Error> = sqlx::query_as(
            r#"
            UPDATE access_sessions
            SET state = $3,
                subject_address = COALESCE($4, subject_address),
                requested_secs = COALESCE($5, requested_secs),
                opened_at = COALESCE($6, opened_at),
                expires_at = COALESCE($7, expires_at),
                closed_at = COALESCE($8, closed_at),
                closed_by = COALESCE($9, closed_by)
            WHERE id = $1 AND state = $2 AND state IN ('pending', 'open')
            RETURNING id, token_value, identity, subject_address, requested_secs, state,
                      created_at, opened_at, expires_at, closed_at, closed_by
            "#,
        )
        .bind(id.to_string())
        .bind(expected.as_str())
        .bind(update.state.as_str())
        .bind(update.subject_address.as_deref())
        .bind(update.requested_secs)
        .bind(update.opened_at)
        .bind(update.expires_at)
        .bind(update.closed_at)
        .bind(update.closed_by.map(|c| c.as_str()))
        .fetch_optional(&self.pool)
        .await;

        let row = match result {
            Ok(row) => row,
            Err(e) => {
                if e.as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    return Err(SessionStoreError::AddressInUse {
                        address: update.subject_address.unwrap_or_default(),
                    });
                }
                return Err(backend(e));
            }
        };

        match row {
            Some(r) => r.try_into_session().map_err(backend),
            None => {
                // Zero rows updated: either the session is gone or it
                // sits in another state. A follow-up read tells which.
                match self.get(id).await? {
                    Some(session) => Err(SessionStoreError::StateConflict {
                        id,
                        expected,
                        actual: session.state,
                    }),
                    None => Err(SessionStoreError::SessionNotFound { id }),
                }
            }
        }
    }

    async fn list_open(&self) -> Result<Vec<AccessSession>, SessionStoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, token_value, identity, subject_address, requested_secs, state,
                   created_at, opened_at, expires_at, closed_at, closed_by
            FROM access_sessions
            WHERE state = 'open'
            ORDER BY opened_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|r| r.try_into_session().map_err(backend))
            .collect()
    }

    async fn list_open_by_address(
        &self,
        subject_address: &str,
    ) -> Result<Vec<AccessSession>, SessionStoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, token_value, identity, subject_address, requested_secs, state,
                   created_at, opened_at, expires_at, closed_at, closed_by
            FROM access_sessions
            WHERE state = 'open' AND subject_address = $1
            "#,
        )
        .bind(subject_address)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|r| r.try_into_session().map_err(backend))
            .collect()
    }
}
