//! Session events
//!
//! A [`SessionCreated`] event is published whenever a request-managed
//! session is created, so other components can prepare it (set search
//! paths, attach audit data, ...) before the handler uses it.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EventError, SessionResult};
use crate::session::Session;

/// Published when a request-managed session is created
#[derive(Debug, Clone)]
pub struct SessionCreated {
    /// Engine name the session is bound to (`""` for the default engine)
    pub name: String,
    pub session: Arc<Session>,
}

#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn session_created(&self, event: &SessionCreated) -> Result<(), EventError>;
}

/// Listener backed by an async closure, see [`listener_fn`]
pub struct FnListener<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`SessionListener`]
///
/// ```rust,ignore
/// let listener = listener_fn(|event: SessionCreated| async move {
///     tracing::info!("session {} created", event.session.id());
///     Ok(())
/// });
/// ```
pub fn listener_fn<F, Fut>(f: F) -> FnListener<F, Fut>
where
    F: Fn(SessionCreated) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    FnListener {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> SessionListener for FnListener<F, Fut>
where
    F: Fn(SessionCreated) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), EventError>> + Send,
{
    async fn session_created(&self, event: &SessionCreated) -> Result<(), EventError> {
        (self.f)(event.clone()).await
    }
}

/// Ordered set of session listeners
#[derive(Clone, Default)]
pub struct SessionEvents {
    listeners: Vec<Arc<dyn SessionListener>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L: SessionListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn subscribe_arc(&mut self, listener: Arc<dyn SessionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Notify listeners in subscription order, stopping at the first error
    pub async fn publish(&self, event: &SessionCreated) -> SessionResult<()> {
        for listener in &self.listeners {
            if let Err(e) = listener.session_created(event).await {
                tracing::error!(
                    "Session listener failed for session {} on '{}': {}",
                    event.session.id(),
                    event.name,
                    e
                );
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEvents")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, PoolConfig};
    use crate::engine::Engine;
    use crate::error::SessionError;
    use crate::session::SessionFactory;
    use std::sync::Mutex;

    async fn created_event(name: &str) -> SessionCreated {
        let config = EngineConfig::new(name, "sqlite::memory:").with_pool(PoolConfig {
            max_connections: 1,
            idle_timeout: None,
            max_lifetime: None,
            ..Default::default()
        });
        let engine = Engine::connect(&config).await.unwrap();
        SessionCreated {
            name: name.to_string(),
            session: SessionFactory::new(engine).create(),
        }
    }

    #[derive(Clone, Default)]
    struct RecordingListener {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SessionListener for RecordingListener {
        async fn session_created(&self, event: &SessionCreated) -> Result<(), EventError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.label, event.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listeners_run_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut bus = SessionEvents::new();
        bus.subscribe(RecordingListener { label: "first", events: events.clone() });
        bus.subscribe(RecordingListener { label: "second", events: events.clone() });
        assert_eq!(bus.len(), 2);

        bus.publish(&created_event("main").await).await.unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["first:main", "second:main"]);
    }

    #[tokio::test]
    async fn test_failing_listener_stops_dispatch() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut bus = SessionEvents::new();
        bus.subscribe(listener_fn(|_event: SessionCreated| async {
            Err(EventError::HandlerFailed("refused".to_string()))
        }));
        bus.subscribe(RecordingListener { label: "never", events: events.clone() });

        let err = bus.publish(&created_event("main").await).await.unwrap_err();
        assert!(matches!(err, SessionError::Event(EventError::HandlerFailed(_))));
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closure_listener_sees_session() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut bus = SessionEvents::new();
        bus.subscribe(listener_fn(move |event: SessionCreated| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some(event.session.id());
                Ok(())
            }
        }));

        let event = created_event("reports").await;
        bus.publish(&event).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(event.session.id()));
    }

    #[tokio::test]
    async fn test_empty_bus_is_noop() {
        let bus = SessionEvents::new();
        assert!(bus.is_empty());
        bus.publish(&created_event("main").await).await.unwrap();
    }
}
