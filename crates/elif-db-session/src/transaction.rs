//! Request Transaction Management
//!
//! Every request gets its own [`TransactionManager`]. Sessions created for
//! the request join it, and when the response is ready the manager either
//! commits all of them or rolls all of them back.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::HeaderName;
use axum::response::Response;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::session::Session;

/// Response header that overrides the commit decision
pub const TM_HEADER: HeaderName = HeaderName::from_static("x-tm");

/// Decides from the response whether the request transaction must abort
pub type CommitVeto = Arc<dyn Fn(&Response) -> bool + Send + Sync>;

/// Default commit veto.
///
/// An `x-tm` response header wins: anything but `commit` aborts. Without
/// the header, 4xx and 5xx responses abort.
pub fn default_commit_veto(response: &Response) -> bool {
    if let Some(value) = response.headers().get(&TM_HEADER) {
        return value.to_str().map(|v| v != "commit").unwrap_or(true);
    }
    let status = response.status();
    status.is_client_error() || status.is_server_error()
}

/// Request transaction settings
#[derive(Clone)]
pub struct TmConfig {
    pub commit_veto: CommitVeto,
}

impl Default for TmConfig {
    fn default() -> Self {
        Self {
            commit_veto: Arc::new(default_commit_veto),
        }
    }
}

impl TmConfig {
    pub fn with_commit_veto<F>(mut self, veto: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        self.commit_veto = Arc::new(veto);
        self
    }

    pub fn should_abort(&self, response: &Response) -> bool {
        (self.commit_veto)(response)
    }
}

impl fmt::Debug for TmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TmConfig").finish_non_exhaustive()
    }
}

/// How a request transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// No session joined the request
    Empty,
    Committed,
    Aborted,
}

/// Per-request transaction manager
#[derive(Default)]
pub struct TransactionManager {
    sessions: Mutex<Vec<Arc<Session>>>,
    doomed: AtomicBool,
    finished: AtomicBool,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a session; it will be ended together with the request
    pub fn join(&self, session: Arc<Session>) -> SessionResult<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(SessionError::Transaction(
                "request transaction has already finished".to_string(),
            ));
        }
        debug!(
            session = session.id(),
            engine = session.name(),
            "Session joined request transaction"
        );
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
        Ok(())
    }

    /// Force the request transaction to abort regardless of the response
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_sessions(&self) -> Vec<Arc<Session>> {
        self.finished.store(true, Ordering::Release);
        std::mem::take(&mut *self.sessions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Commit joined sessions in join order.
    ///
    /// A doomed transaction is aborted instead. When a commit fails, the
    /// remaining sessions are rolled back and the error is returned.
    pub async fn commit(&self) -> SessionResult<TransactionOutcome> {
        if self.is_doomed() {
            debug!("Request transaction doomed; aborting");
            return self.abort().await;
        }

        let sessions = self.take_sessions();
        if sessions.is_empty() {
            return Ok(TransactionOutcome::Empty);
        }

        for (index, session) in sessions.iter().enumerate() {
            if let Err(e) = session.commit().await {
                warn!(
                    "Commit failed for session {} on '{}': {}; rolling back remaining sessions",
                    session.id(),
                    session.name(),
                    e
                );
                for session in &sessions[index..] {
                    close_quietly(session).await;
                }
                return Err(e);
            }
            close_quietly(session).await;
        }

        debug!("Request transaction committed");
        Ok(TransactionOutcome::Committed)
    }

    /// Roll back every joined session
    pub async fn abort(&self) -> SessionResult<TransactionOutcome> {
        let sessions = self.take_sessions();
        if sessions.is_empty() {
            return Ok(TransactionOutcome::Empty);
        }

        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!(
                    "Rollback failed for session {} on '{}': {}",
                    session.id(),
                    session.name(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Request transaction aborted");
                Ok(TransactionOutcome::Aborted)
            }
        }
    }
}

async fn close_quietly(session: &Session) {
    if let Err(e) = session.close().await {
        warn!("Failed to close session {} on '{}': {}", session.id(), session.name(), e);
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("sessions", &self.len())
            .field("doomed", &self.is_doomed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig};
    use crate::engine::Engine;
    use crate::session::{SessionFactory, SessionStatus};
    use axum::http::{HeaderValue, StatusCode};
    use axum::response::IntoResponse;

    async fn memory_factory(name: &str) -> SessionFactory {
        let config = EngineConfig::new(name, "sqlite::memory:").with_pool(PoolConfig {
            max_connections: 1,
            idle_timeout: None,
            max_lifetime: None,
            ..Default::default()
        });
        SessionFactory::new(Engine::connect(&config).await.unwrap())
    }

    async fn count_rows(factory: &SessionFactory) -> i64 {
        let session = factory.create();
        let mut conn = session.connection().await.unwrap();
        sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    async fn create_table(factory: &SessionFactory) {
        let session = factory.create();
        {
            let mut conn = session.connection().await.unwrap();
            sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY)")
                .execute(&mut *conn)
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
    }

    async fn insert_row(session: &Session) {
        let mut conn = session.connection().await.unwrap();
        sqlx::query("INSERT INTO items DEFAULT VALUES")
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    fn response_with(status: StatusCode, tm: Option<&'static str>) -> Response {
        let mut response = status.into_response();
        if let Some(value) = tm {
            response.headers_mut().insert(TM_HEADER, HeaderValue::from_static(value));
        }
        response
    }

    #[test]
    fn test_default_commit_veto() {
        assert!(!default_commit_veto(&response_with(StatusCode::OK, None)));
        assert!(!default_commit_veto(&response_with(StatusCode::FOUND, None)));
        assert!(default_commit_veto(&response_with(StatusCode::NOT_FOUND, None)));
        assert!(default_commit_veto(&response_with(StatusCode::INTERNAL_SERVER_ERROR, None)));

        assert!(default_commit_veto(&response_with(StatusCode::OK, Some("abort"))));
        assert!(!default_commit_veto(&response_with(StatusCode::BAD_REQUEST, Some("commit"))));
    }

    #[test]
    fn test_custom_commit_veto() {
        let config = TmConfig::default().with_commit_veto(|_| true);
        assert!(config.should_abort(&response_with(StatusCode::OK, None)));
    }

    #[tokio::test]
    async fn test_empty_manager() {
        let tm = TransactionManager::new();
        assert!(tm.is_empty());
        assert_eq!(tm.commit().await.unwrap(), TransactionOutcome::Empty);
        assert!(tm.is_finished());
    }

    #[tokio::test]
    async fn test_commit_persists_and_closes() {
        let factory = memory_factory("commit").await;
        create_table(&factory).await;

        let tm = TransactionManager::new();
        let session = factory.create();
        tm.join(session.clone()).unwrap();
        insert_row(&session).await;

        assert_eq!(tm.commit().await.unwrap(), TransactionOutcome::Committed);
        assert_eq!(session.status().await, SessionStatus::Closed);
        assert_eq!(count_rows(&factory).await, 1);
    }

    #[tokio::test]
    async fn test_abort_discards() {
        let factory = memory_factory("abort").await;
        create_table(&factory).await;

        let tm = TransactionManager::new();
        let session = factory.create();
        tm.join(session.clone()).unwrap();
        insert_row(&session).await;

        assert_eq!(tm.abort().await.unwrap(), TransactionOutcome::Aborted);
        assert_eq!(session.status().await, SessionStatus::Closed);
        assert_eq!(count_rows(&factory).await, 0);
    }

    #[tokio::test]
    async fn test_doomed_commit_aborts() {
        let factory = memory_factory("doomed").await;
        create_table(&factory).await;

        let tm = TransactionManager::new();
        let session = factory.create();
        tm.join(session.clone()).unwrap();
        insert_row(&session).await;
        tm.doom();

        assert_eq!(tm.commit().await.unwrap(), TransactionOutcome::Aborted);
        assert_eq!(count_rows(&factory).await, 0);
    }

    #[tokio::test]
    async fn test_join_after_finish_fails() {
        let factory = memory_factory("late").await;
        let tm = TransactionManager::new();
        tm.commit().await.unwrap();

        assert!(matches!(tm.join(factory.create()), Err(SessionError::Transaction(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_remaining() {
        let first = memory_factory("first").await;
        let second = memory_factory("second").await;
        create_table(&second).await;

        let tm = TransactionManager::new();
        let closed = first.create();
        closed.close().await.unwrap();
        tm.join(closed).unwrap();

        let pending = second.create();
        tm.join(pending.clone()).unwrap();
        insert_row(&pending).await;

        assert!(matches!(tm.commit().await, Err(SessionError::SessionClosed { .. })));
        assert_eq!(pending.status().await, SessionStatus::Closed);
        assert_eq!(count_rows(&second).await, 0);
    }
}
