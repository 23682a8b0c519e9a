//! Request transaction middleware
//!
//! [`SessionLayer`] gives every request its own [`RequestSessions`] and
//! ends the request transaction once the inner service has produced a
//! response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};

use crate::events::SessionEvents;
use crate::registry::EngineRegistry;
use crate::request::RequestSessions;
use crate::transaction::{TmConfig, TransactionManager, TransactionOutcome};

/// Tower layer installing request-managed database sessions
#[derive(Clone, Debug)]
pub struct SessionLayer {
    registry: Arc<EngineRegistry>,
    events: Arc<SessionEvents>,
    config: TmConfig,
}

impl SessionLayer {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            registry,
            events: Arc::new(SessionEvents::new()),
            config: TmConfig::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<SessionEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: TmConfig) -> Self {
        self.config = config;
        self
    }
}

impl<S> Layer<S> for SessionLayer {
    type Service = SessionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SessionService {
            inner,
            registry: self.registry.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

/// Service created by [`SessionLayer`]
#[derive(Clone, Debug)]
pub struct SessionService<S> {
    inner: S,
    registry: Arc<EngineRegistry>,
    events: Arc<SessionEvents>,
    config: TmConfig,
}

impl<S> Service<Request<Body>> for SessionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // the clone may not be ready; swap so the ready service handles this request
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let tm = Arc::new(TransactionManager::new());
        let sessions = RequestSessions::new(self.registry.clone(), self.events.clone(), tm.clone());
        req.extensions_mut().insert(sessions);

        let config = self.config.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            let response = inner.call(req).await?;

            if tm.is_empty() {
                tm.abort().await.ok();
                return Ok(response);
            }

            let result = if config.should_abort(&response) || tm.is_doomed() {
                tm.abort().await
            } else {
                tm.commit().await
            };

            match result {
                Ok(TransactionOutcome::Committed) => {
                    tracing::debug!("{} {} - request transaction committed", method, path);
                    Ok(response)
                }
                Ok(outcome) => {
                    tracing::debug!("{} {} - request transaction {:?}", method, path, outcome);
                    Ok(response)
                }
                Err(e) => {
                    tracing::error!("{} {} - request transaction failed: {}", method, path, e);
                    Ok(e.into_response())
                }
            }
        })
    }
}
