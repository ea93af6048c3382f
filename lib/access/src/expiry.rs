//! One-shot expiry timers for open sessions.
//!
//! Each open session gets a timer keyed by its ID. Firing runs the
//! same compare-and-set as a user close, so a timer racing a close
//! commits at most one terminal transition and the loser's conflict is
//! an expected no-op. Timers live in-process only: `restore`
//! re-registers them from the store after a restart, and the periodic
//! `expire_overdue` sweep catches anything a timer missed.

use crate::session::SessionState;
use crate::store::{SessionStore, SessionStoreError, SessionUpdate};
use chrono::{DateTime, Utc};
use gatepass_core::SessionId;
use gatepass_notify::{AccessEvent, NotificationDispatcher};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SchedulerInner<S> {
    store: Arc<S>,
    dispatcher: NotificationDispatcher,
    timers: Mutex<HashMap<SessionId, JoinHandle<()>>>,
}

/// Schedules the open-to-expired transition for each open session.
pub struct ExpiryScheduler<S: SessionStore> {
    inner: Arc<SchedulerInner<S>>,
}

impl<S: SessionStore> Clone for ExpiryScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SessionStore + 'static> ExpiryScheduler<S> {
    /// Creates a scheduler over the given store and dispatcher.
    pub fn new(store: Arc<S>, dispatcher: NotificationDispatcher) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers (or replaces) the one-shot timer for a session.
    ///
    /// An expiry time in the past yields a zero-delay timer that fires
    /// immediately.
    pub async fn schedule(&self, id: SessionId, expires_at: DateTime<Utc>) {
        let delay = (expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.inner.timers.lock().await.remove(&id);
            scheduler.fire(id).await;
        });

        if let Some(previous) = self.inner.timers.lock().await.insert(id, handle) {
            previous.abort();
        }
    }

    /// Cancels a session's timer.
    ///
    /// Best effort: a timer that already fired resolves through the
    /// transition conflict instead.
    pub async fn cancel(&self, id: SessionId) {
        if let Some(handle) = self.inner.timers.lock().await.remove(&id) {
            handle.abort();
        }
    }

    /// Re-registers timers for every open session in the store.
    ///
    /// Sessions already past their expiry fire immediately. Returns
    /// how many sessions were scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the open-session scan fails.
    pub async fn restore(&self) -> Result<usize, SessionStoreError> {
        let open = self.inner.store.list_open().await?;

        let mut scheduled = 0;
        for session in open {
            if let Some(expires_at) = session.expires_at {
                self.schedule(session.id, expires_at).await;
                scheduled += 1;
            }
        }

        Ok(scheduled)
    }

    /// Expires every overdue open session inline and returns how many
    /// were processed.
    ///
    /// Each one goes through the same conflict-safe fire path as a
    /// timer, so sessions settled in the meantime are skipped
    /// harmlessly.
    ///
    /// # Errors
    ///
    /// Returns an error if the open-session scan fails.
    pub async fn expire_overdue(&self) -> Result<usize, SessionStoreError> {
        let now = Utc::now();
        let open = self.inner.store.list_open().await?;

        let mut processed = 0;
        for session in open {
            if session.is_expired_at(now) {
                self.fire(session.id).await;
                processed += 1;
            }
        }

        Ok(processed)
    }

    /// Number of timers currently registered.
    pub async fn scheduled_count(&self) -> usize {
        self.inner.timers.lock().await.len()
    }

    /// Aborts every registered timer.
    pub async fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Commits open to expired for one session and announces it.
    async fn fire(&self, id: SessionId) {
        let now = Utc::now();
        let result = self
            .inner
            .store
            .transition(id, SessionState::Open, SessionUpdate::expired(now))
            .await;

        match result {
            Ok(session) => {
                info!(session_id = %id, "session expired");
                if let Some(address) = &session.subject_address {
                    self.inner.dispatcher.dispatch(AccessEvent::expired(
                        id,
                        address.clone(),
                        session.identity.clone(),
                    ));
                }
            }
            Err(SessionStoreError::StateConflict { actual, .. }) => {
                // Lost the race to a close; nothing left to do.
                debug!(
                    session_id = %id,
                    state = actual.as_str(),
                    "expiry fired on an already-settled session",
                );
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "expiry transition failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;
    use crate::session::{AccessSession, ClosedBy};
    use crate::token::AccessToken;
    use gatepass_notify::{AccessEventKind, DispatcherConfig, DispatcherHandle, RecordingPublisher};

    fn test_dispatcher(
        publisher: &RecordingPublisher,
    ) -> (NotificationDispatcher, DispatcherHandle) {
        NotificationDispatcher::start(
            Arc::new(publisher.clone()),
            DispatcherConfig {
                alive_interval_secs: 0,
                ..DispatcherConfig::default()
            },
        )
    }

    async fn seed_open(
        store: &InMemorySessionStore,
        address: &str,
        expires_at: DateTime<Utc>,
    ) -> SessionId {
        let token = AccessToken::generate("user@example.com");
        let session = AccessSession::pending(&token.value, "user@example.com");
        store
            .create_pending(&token, &session)
            .await
            .expect("create");
        store
            .transition(
                session.id,
                SessionState::Pending,
                SessionUpdate::open(address, 60, Utc::now(), expires_at),
            )
            .await
            .expect("open");
        session.id
    }

    async fn session_state(store: &InMemorySessionStore, id: SessionId) -> SessionState {
        store
            .get(id)
            .await
            .expect("get")
            .expect("session should exist")
            .state
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_an_open_session() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let id = seed_open(&store, "8.8.8.8", Utc::now() + chrono::Duration::seconds(5)).await;
        scheduler.schedule(id, Utc::now() + chrono::Duration::seconds(5)).await;

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(session_state(&store, id).await, SessionState::Expired);
        let stored = store.get(id).await.expect("get").expect("session");
        assert_eq!(stored.closed_by, Some(ClosedBy::Expiry));

        // Dropping the scheduler releases its dispatcher so the worker
        // can drain and exit.
        drop(scheduler);
        handle.join().await;
        let retained = publisher.retained().await;
        assert_eq!(retained.get("access.grant.8.8.8.8"), Some(&Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn fire_after_close_is_a_noop() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let id = seed_open(&store, "8.8.8.8", Utc::now() + chrono::Duration::seconds(60)).await;
        scheduler.schedule(id, Utc::now() + chrono::Duration::seconds(60)).await;

        // Close well before the timer fires.
        tokio::time::sleep(Duration::from_secs(10)).await;
        store
            .transition(
                id,
                SessionState::Open,
                SessionUpdate::closed(ClosedBy::User, Utc::now()),
            )
            .await
            .expect("close");

        tokio::time::sleep(Duration::from_secs(60)).await;

        let stored = store.get(id).await.expect("get").expect("session");
        assert_eq!(stored.state, SessionState::Closed);
        assert_eq!(stored.closed_by, Some(ClosedBy::User));

        drop(scheduler);
        handle.join().await;

        // The settled session produced no expired event.
        let expired_records = publisher
            .messages()
            .await
            .into_iter()
            .filter(|m| m.topic.starts_with("access.event."))
            .filter_map(|m| serde_json::from_slice::<AccessEvent>(&m.payload).ok())
            .filter(|e| e.kind == AccessEventKind::Expired)
            .count();
        assert_eq!(expired_records, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_the_timer() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, _handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let id = seed_open(&store, "8.8.8.8", Utc::now() + chrono::Duration::seconds(5)).await;
        scheduler.schedule(id, Utc::now() + chrono::Duration::seconds(5)).await;
        assert_eq!(scheduler.scheduled_count().await, 1);

        scheduler.cancel(id).await;
        assert_eq!(scheduler.scheduled_count().await, 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(session_state(&store, id).await, SessionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_fires_already_elapsed_sessions_immediately() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, _handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let lapsed = seed_open(&store, "8.8.8.8", Utc::now() - chrono::Duration::seconds(30)).await;
        let current =
            seed_open(&store, "9.9.9.9", Utc::now() + chrono::Duration::seconds(3600)).await;

        let scheduled = scheduler.restore().await.expect("restore");
        assert_eq!(scheduled, 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session_state(&store, lapsed).await, SessionState::Expired);
        assert_eq!(session_state(&store, current).await, SessionState::Open);

        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert_eq!(session_state(&store, current).await, SessionState::Expired);
    }

    #[tokio::test]
    async fn expire_overdue_processes_only_lapsed_sessions() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, _handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let lapsed = seed_open(&store, "8.8.8.8", Utc::now() - chrono::Duration::seconds(5)).await;
        let current =
            seed_open(&store, "9.9.9.9", Utc::now() + chrono::Duration::seconds(3600)).await;

        let processed = scheduler.expire_overdue().await.expect("sweep");
        assert_eq!(processed, 1);
        assert_eq!(session_state(&store, lapsed).await, SessionState::Expired);
        assert_eq!(session_state(&store, current).await, SessionState::Open);

        // A second sweep finds nothing new.
        let processed = scheduler.expire_overdue().await.expect("sweep");
        assert_eq!(processed, 0);
    }

    #[tokio::test]
    async fn sweep_racing_a_close_commits_exactly_one_winner() {
        let store = Arc::new(InMemorySessionStore::new());
        let publisher = RecordingPublisher::new();
        let (dispatcher, _handle) = test_dispatcher(&publisher);
        let scheduler = ExpiryScheduler::new(Arc::clone(&store), dispatcher);

        let id = seed_open(&store, "8.8.8.8", Utc::now() - chrono::Duration::seconds(5)).await;

        let (sweep, close) = tokio::join!(
            scheduler.expire_overdue(),
            store.transition(
                id,
                SessionState::Open,
                SessionUpdate::closed(ClosedBy::User, Utc::now()),
            ),
        );

        assert!(sweep.is_ok());
        let stored = store.get(id).await.expect("get").expect("session");
        assert!(stored.state.is_terminal());
        match stored.state {
            SessionState::Expired => {
                assert_eq!(stored.closed_by, Some(ClosedBy::Expiry));
                assert!(close.is_err());
            }
            SessionState::Closed => assert_eq!(stored.closed_by, Some(ClosedBy::User)),
            other => panic!("expected a terminal state, got {other}"),
        }
    }
}
