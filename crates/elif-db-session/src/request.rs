//! Request-scoped session lookup
//!
//! [`RequestSessions`] lives in the request extensions for the duration of
//! one request. It hands out at most one session per engine name, joins
//! each new session to the request's [`TransactionManager`] and publishes a
//! [`SessionCreated`] event for it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::Extensions;
use tokio::sync::OnceCell;

use crate::config::DEFAULT_ENGINE;
use crate::engine::Engine;
use crate::error::{EventError, SessionError, SessionResult};
use crate::events::{SessionCreated, SessionEvents};
use crate::registry::EngineRegistry;
use crate::session::{Session, SessionFactory};
use crate::transaction::TransactionManager;

/// Outcome of creating a session; listener failures stick to the name
type Created = Result<Arc<Session>, EventError>;

struct RequestSessionsInner {
    registry: Arc<EngineRegistry>,
    events: Arc<SessionEvents>,
    tm: Arc<TransactionManager>,
    sessions: Mutex<HashMap<String, Arc<OnceCell<Created>>>>,
}

/// Sessions of the current request
#[derive(Clone)]
pub struct RequestSessions {
    inner: Arc<RequestSessionsInner>,
}

impl RequestSessions {
    pub fn new(
        registry: Arc<EngineRegistry>,
        events: Arc<SessionEvents>,
        tm: Arc<TransactionManager>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestSessionsInner {
                registry,
                events,
                tm,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the request's session for `name`, creating it on first use
    ///
    /// Concurrent callers for the same name wait until the first caller has
    /// finished publishing [`SessionCreated`]. A listener failure is kept and
    /// returned to every later caller.
    pub async fn get(&self, name: &str) -> SessionResult<Arc<Session>> {
        let factory = self.inner.registry.session_factory(name)?;

        let slot = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            sessions.entry(name.to_string()).or_default().clone()
        };

        let created = slot
            .get_or_try_init(|| self.create(name, &factory))
            .await?;

        match created {
            Ok(session) => Ok(session.clone()),
            Err(e) => Err(e.clone().into()),
        }
    }

    async fn create(&self, name: &str, factory: &SessionFactory) -> SessionResult<Created> {
        let session = factory.create();
        self.inner.tm.join(session.clone())?;

        tracing::debug!("Created request session {} on '{}'", session.id(), name);

        let event = SessionCreated {
            name: name.to_string(),
            session: session.clone(),
        };
        match self.inner.events.publish(&event).await {
            Ok(()) => Ok(Ok(session)),
            Err(SessionError::Event(e)) => {
                self.inner.tm.doom();
                Ok(Err(e))
            }
            Err(e) => {
                self.inner.tm.doom();
                Err(e)
            }
        }
    }

    /// Session bound to the default engine
    pub async fn default_session(&self) -> SessionResult<Arc<Session>> {
        self.get(DEFAULT_ENGINE).await
    }

    pub fn engine(&self, name: &str) -> SessionResult<Engine> {
        self.inner.registry.engine(name)
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.inner.registry
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.inner.tm
    }

    /// Names of the engines this request has opened sessions on
    pub fn active_names(&self) -> Vec<String> {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions
            .iter()
            .filter(|(_, slot)| matches!(slot.get(), Some(Ok(_))))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl fmt::Debug for RequestSessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSessions")
            .field("active", &self.active_names())
            .field("tm", &self.inner.tm)
            .finish()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestSessions
where
    S: Send + Sync,
{
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestSessions>()
            .cloned()
            .ok_or(SessionError::NotInstalled)
    }
}

/// Extractor for the request session on the default engine
#[derive(Debug, Clone)]
pub struct DbSession(pub Arc<Session>);

#[async_trait]
impl<S> FromRequestParts<S> for DbSession
where
    S: Send + Sync,
{
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let sessions = RequestSessions::from_request_parts(parts, state).await?;
        sessions.default_session().await.map(DbSession)
    }
}

impl std::ops::Deref for DbSession {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Get the request-managed session for `name` from request extensions
pub async fn get_tm_session(extensions: &Extensions, name: &str) -> SessionResult<Arc<Session>> {
    let sessions = extensions
        .get::<RequestSessions>()
        .ok_or(SessionError::NotInstalled)?;
    sessions.get(name).await
}
