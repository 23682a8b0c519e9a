//! Engine registry
//!
//! Process-wide table of `name -> (engine, session factory)`, built once at
//! startup from settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DatabaseSettings, EngineConfig, Settings, DEFAULT_ENGINE};
use crate::engine::{Engine, PoolStats};
use crate::error::{ConfigError, PoolError, SessionError, SessionResult};
use crate::session::{Session, SessionFactory};

/// An engine together with the factory producing its sessions
#[derive(Debug, Clone)]
pub struct RegisteredEngine {
    pub engine: Engine,
    pub factory: SessionFactory,
}

/// Named engines available to the application
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, RegisteredEngine>,
    order: Vec<String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every engine configured under the default `database` prefix
    pub async fn from_settings(settings: &Settings) -> SessionResult<Self> {
        Self::from_database_settings(&DatabaseSettings::new(), settings).await
    }

    pub async fn from_database_settings(
        database: &DatabaseSettings,
        settings: &Settings,
    ) -> SessionResult<Self> {
        let configs = database.parse(settings)?;
        Self::from_configs(configs).await
    }

    pub async fn from_configs(configs: Vec<EngineConfig>) -> SessionResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            let engine = Engine::connect(&config).await?;
            let factory =
                SessionFactory::new(engine.clone()).with_config(config.transaction.clone());
            registry.register(engine, factory)?;
        }

        tracing::info!("Created engine registry with {} engines", registry.len());
        Ok(registry)
    }

    /// Register an engine under its own name
    pub fn register(&mut self, engine: Engine, factory: SessionFactory) -> SessionResult<()> {
        let name = engine.name().to_string();
        if self.engines.contains_key(&name) {
            return Err(ConfigError::DuplicateEngine { name }.into());
        }

        tracing::info!("Registering database engine '{}' ({})", name, engine.url());
        self.order.push(name.clone());
        self.engines.insert(name, RegisteredEngine { engine, factory });
        Ok(())
    }

    pub fn get(&self, name: &str) -> SessionResult<&RegisteredEngine> {
        self.engines.get(name).ok_or_else(|| SessionError::UnknownEngine {
            name: name.to_string(),
        })
    }

    pub fn engine(&self, name: &str) -> SessionResult<Engine> {
        self.get(name).map(|registered| registered.engine.clone())
    }

    pub fn session_factory(&self, name: &str) -> SessionResult<SessionFactory> {
        self.get(name).map(|registered| registered.factory.clone())
    }

    /// The engine named `""`, configured when no names are listed
    pub fn default_engine(&self) -> SessionResult<Engine> {
        self.engine(DEFAULT_ENGINE)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Engine names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Pool statistics for every engine
    pub fn get_all_stats(&self) -> HashMap<String, PoolStats> {
        self.engines
            .iter()
            .map(|(name, registered)| (name.clone(), registered.engine.stats()))
            .collect()
    }

    /// Health check every engine
    pub async fn health_check_all(&self) -> HashMap<String, Result<Duration, PoolError>> {
        let mut results = HashMap::new();
        for name in &self.order {
            if let Some(registered) = self.engines.get(name) {
                results.insert(name.clone(), registered.engine.health_check().await);
            }
        }
        results
    }

    pub async fn close_all(&self) {
        for name in &self.order {
            if let Some(registered) = self.engines.get(name) {
                registered.engine.close().await;
            }
        }
    }
}

/// Look up the engine registered under `name`
pub fn get_engine(registry: &EngineRegistry, name: &str) -> SessionResult<Engine> {
    registry.engine(name)
}

/// Create a session that is not tied to any request.
///
/// The caller is responsible for committing or rolling it back.
pub fn create_unmanaged_session(
    registry: &EngineRegistry,
    name: &str,
) -> SessionResult<Arc<Session>> {
    let session = registry.session_factory(name)?.create();
    tracing::debug!("Created unmanaged session {} on '{}'", session.id(), name);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_settings() -> Settings {
        Settings::new()
            .with("database.names", "a b")
            .with("database.a.url", "sqlite::memory:")
            .with("database.a.max_connections", "1")
            .with("database.a.idle_timeout", "none")
            .with("database.a.max_lifetime", "none")
            .with("database.b.url", "sqlite::memory:")
            .with("database.b.max_connections", "1")
            .with("database.b.idle_timeout", "none")
            .with("database.b.max_lifetime", "none")
    }

    #[test]
    fn test_registry_creation() {
        let registry = EngineRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.default_engine().is_err());
        assert!(registry.get_all_stats().is_empty());
    }

    #[tokio::test]
    async fn test_from_settings_multiple() {
        let registry = EngineRegistry::from_settings(&memory_settings()).await.unwrap();
        assert_eq!(registry.names(), &["a".to_string(), "b".to_string()]);

        let a = get_engine(&registry, "a").unwrap();
        let b = get_engine(&registry, "b").unwrap();
        assert_eq!(a.name(), "a");
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&get_engine(&registry, "a").unwrap()));
    }

    #[tokio::test]
    async fn test_from_settings_single() {
        let settings = Settings::new()
            .with("database.url", "sqlite::memory:")
            .with("database.max_connections", "1");
        let registry = EngineRegistry::from_settings(&settings).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.default_engine().unwrap().name(), DEFAULT_ENGINE);
    }

    #[tokio::test]
    async fn test_unknown_engine() {
        let registry = EngineRegistry::from_settings(&memory_settings()).await.unwrap();
        assert!(matches!(
            get_engine(&registry, "c"),
            Err(SessionError::UnknownEngine { ref name }) if name == "c"
        ));
        assert!(create_unmanaged_session(&registry, "").is_err());
    }

    #[tokio::test]
    async fn test_unmanaged_sessions() {
        let registry = EngineRegistry::from_settings(&memory_settings()).await.unwrap();
        let a = create_unmanaged_session(&registry, "a").unwrap();
        let b = create_unmanaged_session(&registry, "b").unwrap();

        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "b");
        assert!(!Arc::ptr_eq(&a, &b));

        let mut conn = a.connection().await.unwrap();
        sqlx::query("SELECT 1").execute(&mut *conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let settings = Settings::new().with("database.url", "sqlite::memory:");
        let registry = EngineRegistry::from_settings(&settings).await.unwrap();
        let registered = registry.get(DEFAULT_ENGINE).unwrap().clone();

        let mut other = EngineRegistry::new();
        other.register(registered.engine.clone(), registered.factory.clone()).unwrap();
        assert!(other.register(registered.engine, registered.factory).is_err());
    }

    #[tokio::test]
    async fn test_health_and_close_all() {
        let registry = EngineRegistry::from_settings(&memory_settings()).await.unwrap();
        let health = registry.health_check_all().await;
        assert_eq!(health.len(), 2);
        assert!(health.values().all(|result| result.is_ok()));

        registry.close_all().await;
        assert!(registry.engine("a").unwrap().is_closed());
    }
}
