//! Database engines
//!
//! An [`Engine`] is a named connection pool with statistics and health
//! monitoring. PostgreSQL and SQLite urls are supported through sqlx's
//! `Any` driver.
//!
//! Applications can attach typed data to an engine at startup with
//! [`Engine::insert_data`]; every session bound to the engine reads it back
//! through [`Session::engine`](crate::session::Session::engine).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::http::Extensions;
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyPool, Transaction as SqlxTransaction};

use crate::config::{redact_database_url, EngineConfig, PoolConfig};
use crate::error::{PoolError, SessionError, SessionResult};

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub acquire_count: u64,
    pub acquire_errors: u64,
    pub created_at: Instant,
}

struct EngineInner {
    name: String,
    pool: AnyPool,
    config: PoolConfig,
    redacted_url: String,
    acquire_count: AtomicU64,
    acquire_errors: AtomicU64,
    created_at: Instant,
    data: RwLock<Extensions>,
}

/// Named connection pool shared by every session bound to it
///
/// Cloning an engine is cheap; clones share the same pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connect a new pool from the engine configuration
    pub async fn connect(config: &EngineConfig) -> SessionResult<Self> {
        sqlx::any::install_default_drivers();

        let redacted_url = redact_database_url(&config.url);
        let pool_config = &config.pool;
        tracing::debug!(
            "Creating database pool '{}' for {}: max={}, min={}, timeout={}s, \
             idle_timeout={:?}s, max_lifetime={:?}s, test_before_acquire={}",
            config.name, redacted_url, pool_config.max_connections, pool_config.min_connections,
            pool_config.acquire_timeout, pool_config.idle_timeout, pool_config.max_lifetime,
            pool_config.test_before_acquire
        );

        let options = AnyPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .acquire_timeout(Duration::from_secs(pool_config.acquire_timeout))
            .test_before_acquire(pool_config.test_before_acquire)
            .idle_timeout(pool_config.idle_timeout.map(Duration::from_secs))
            .max_lifetime(pool_config.max_lifetime.map(Duration::from_secs));

        let pool = options.connect(&config.url).await.map_err(|e| {
            tracing::error!("Failed to create database pool '{}': {}", config.name, e);
            SessionError::Connect {
                name: config.name.clone(),
                source: e,
            }
        })?;

        tracing::info!(
            "Database pool '{}' created with {} max connections",
            config.name,
            pool_config.max_connections
        );

        Ok(Self::from_pool(config.name.clone(), pool, config.pool.clone(), redacted_url))
    }

    fn from_pool(name: String, pool: AnyPool, config: PoolConfig, redacted_url: String) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name,
                pool,
                config,
                redacted_url,
                acquire_count: AtomicU64::new(0),
                acquire_errors: AtomicU64::new(0),
                created_at: Instant::now(),
                data: RwLock::new(Extensions::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connection url with the password masked
    pub fn url(&self) -> &str {
        &self.inner.redacted_url
    }

    pub fn pool(&self) -> &AnyPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether both handles share the same pool
    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Attach a value to the engine, replacing any previous value of type `T`
    pub fn insert_data<T>(&self, value: T) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value)
    }

    /// Value of type `T` previously attached with [`Engine::insert_data`]
    pub fn data<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get::<T>()
            .cloned()
    }

    pub fn remove_data<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove::<T>()
    }

    /// Begin a database transaction with statistics tracking
    pub async fn begin(&self) -> Result<SqlxTransaction<'static, Any>, PoolError> {
        let pool = &self.inner.pool;
        if pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        self.inner.acquire_count.fetch_add(1, Ordering::Relaxed);

        match pool.begin().await {
            Ok(tx) => {
                tracing::debug!(
                    "Transaction started on '{}' (total: {}, idle: {})",
                    self.name(),
                    pool.size(),
                    pool.num_idle()
                );
                Ok(tx)
            }
            Err(e) => {
                self.inner.acquire_errors.fetch_add(1, Ordering::Relaxed);
                let pool_error = self.classify_error(e);
                tracing::error!("Failed to begin transaction on '{}': {}", self.name(), pool_error);
                Err(pool_error)
            }
        }
    }

    fn classify_error(&self, error: sqlx::Error) -> PoolError {
        match &error {
            sqlx::Error::PoolTimedOut => PoolError::ConnectionTimeout {
                timeout: self.inner.config.acquire_timeout,
            },
            sqlx::Error::PoolClosed => PoolError::PoolClosed,
            _ => PoolError::AcquisitionFailed(error),
        }
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let total = self.inner.pool.size();
        let idle = self.inner.pool.num_idle() as u32;

        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            acquire_count: self.inner.acquire_count.load(Ordering::Relaxed),
            acquire_errors: self.inner.acquire_errors.load(Ordering::Relaxed),
            created_at: self.inner.created_at,
        }
    }

    /// Acquire a connection and run `SELECT 1`
    pub async fn health_check(&self) -> Result<Duration, PoolError> {
        let pool = &self.inner.pool;
        if pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let start = Instant::now();

        let mut conn = pool.acquire().await.map_err(|e| PoolError::HealthCheckFailed {
            reason: format!("Could not acquire connection: {}", e),
        })?;

        sqlx::query("SELECT 1").execute(&mut *conn).await.map_err(|e| {
            PoolError::HealthCheckFailed {
                reason: format!("Health check query failed: {}", e),
            }
        })?;

        let duration = start.elapsed();
        tracing::debug!("Database health check for '{}' passed in {:?}", self.name(), duration);
        Ok(duration)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Close the pool, waiting for checked out connections to be returned
    pub async fn close(&self) {
        tracing::info!("Closing database pool '{}'", self.name());
        self.inner.pool.close().await;
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("url", &self.inner.redacted_url)
            .field("config", &self.inner.config)
            .finish()
    }
}
