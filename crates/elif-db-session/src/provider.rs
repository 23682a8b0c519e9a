//! Database session provider
//!
//! [`DatabaseSessions`] is what an application includes to get database
//! sessions: it connects the configured engines, collects session listeners
//! and produces the layer that manages per-request transactions.
//!
//! ```rust,ignore
//! let sessions = DatabaseSessions::builder()
//!     .settings(Settings::from_env())
//!     .subscribe(listener_fn(|event: SessionCreated| async move {
//!         tracing::info!("session {} opened on '{}'", event.session.id(), event.name);
//!         Ok(())
//!     }))
//!     .build()
//!     .await?;
//!
//! let app = sessions.install(Router::new().route("/", get(handler)));
//! ```

use std::sync::Arc;

use axum::response::Response;
use axum::Router;

use crate::config::{DatabaseSettings, Settings, DEFAULT_PREFIX};
use crate::engine::Engine;
use crate::error::SessionResult;
use crate::events::{SessionEvents, SessionListener};
use crate::middleware::SessionLayer;
use crate::registry::{self, EngineRegistry};
use crate::session::Session;
use crate::transaction::TmConfig;

/// Builder for [`DatabaseSessions`]
#[derive(Debug)]
pub struct DatabaseSessionsBuilder {
    settings: Settings,
    prefix: String,
    events: SessionEvents,
    tm_config: TmConfig,
}

impl Default for DatabaseSessionsBuilder {
    fn default() -> Self {
        Self {
            settings: Settings::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            events: SessionEvents::new(),
            tm_config: TmConfig::default(),
        }
    }
}

impl DatabaseSessionsBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Settings key prefix, `database` by default
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Listen for sessions created during requests
    pub fn subscribe<L: SessionListener + 'static>(mut self, listener: L) -> Self {
        self.events.subscribe(listener);
        self
    }

    /// Replace the default commit veto
    pub fn commit_veto<F>(mut self, veto: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        self.tm_config = self.tm_config.with_commit_veto(veto);
        self
    }

    /// Connect every configured engine
    pub async fn build(self) -> SessionResult<DatabaseSessions> {
        let database = DatabaseSettings::with_prefix(self.prefix);
        let registry = EngineRegistry::from_database_settings(&database, &self.settings).await?;

        tracing::info!(
            "Database sessions ready: {} engine(s), {} listener(s)",
            registry.len(),
            self.events.len()
        );

        Ok(DatabaseSessions {
            registry: Arc::new(registry),
            events: Arc::new(self.events),
            tm_config: self.tm_config,
        })
    }
}

/// Engines, listeners and request transaction settings of an application
#[derive(Debug, Clone)]
pub struct DatabaseSessions {
    registry: Arc<EngineRegistry>,
    events: Arc<SessionEvents>,
    tm_config: TmConfig,
}

impl DatabaseSessions {
    pub fn builder() -> DatabaseSessionsBuilder {
        DatabaseSessionsBuilder::default()
    }

    /// Build from settings with default listeners and commit veto
    pub async fn from_settings(settings: Settings) -> SessionResult<Self> {
        Self::builder().settings(settings).build().await
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<SessionEvents> {
        &self.events
    }

    pub fn get_engine(&self, name: &str) -> SessionResult<Engine> {
        registry::get_engine(&self.registry, name)
    }

    pub fn create_unmanaged_session(&self, name: &str) -> SessionResult<Arc<Session>> {
        registry::create_unmanaged_session(&self.registry, name)
    }

    /// Layer managing one transaction per request
    pub fn layer(&self) -> SessionLayer {
        SessionLayer::new(self.registry.clone())
            .with_events(self.events.clone())
            .with_config(self.tm_config.clone())
    }

    /// Attach request-managed sessions to every route of `router`
    pub fn install<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(self.layer())
    }

    /// Close every engine pool
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}
