//! Sessions and session factories
//!
//! A [`Session`] is a unit of work over one engine. It holds at most one
//! open transaction, begun lazily the first time a connection is requested.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::{Any, AnyConnection, Transaction as SqlxTransaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::{SessionError, SessionResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

/// Options applied to every transaction a session begins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Isolation level; `None` keeps the database default
    pub isolation_level: Option<IsolationLevel>,
    /// Whether transactions are read-only
    pub read_only: bool,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No transaction open
    Idle,
    /// A transaction is open
    Active,
    /// Closed; no further work is possible
    Closed,
}

struct SessionState {
    tx: Option<SqlxTransaction<'static, Any>>,
    closed: bool,
}

/// Connection guard returned by [`Session::connection`]
///
/// Dereferences to the connection running the session's transaction, so it
/// can be passed to sqlx as `&mut *conn`.
pub type SessionConnection<'a> = MappedMutexGuard<'a, AnyConnection>;

/// A unit of work bound to one engine
pub struct Session {
    id: u64,
    engine: Engine,
    config: TransactionConfig,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(engine: Engine, config: TransactionConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            config,
            state: Mutex::new(SessionState {
                tx: None,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the engine this session is bound to
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn transaction_config(&self) -> &TransactionConfig {
        &self.config
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        if state.closed {
            SessionStatus::Closed
        } else if state.tx.is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::Idle
        }
    }

    /// Whether a transaction is currently open
    pub async fn in_transaction(&self) -> bool {
        self.status().await == SessionStatus::Active
    }

    /// Get the session's connection, beginning a transaction if none is open
    pub async fn connection(&self) -> SessionResult<SessionConnection<'_>> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        if state.tx.is_none() {
            state.tx = Some(self.begin().await?);
        }

        MutexGuard::try_map(state, |state| state.tx.as_deref_mut())
            .map_err(|_| SessionError::Transaction("session transaction is not open".to_string()))
    }

    async fn begin(&self) -> SessionResult<SqlxTransaction<'static, Any>> {
        let mut tx = self.engine.begin().await?;

        let postgres = tx.backend_name() == "PostgreSQL";
        if let Some(isolation_level) = self.config.isolation_level {
            if postgres {
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation_level.as_sql());
                sqlx::query(&sql).execute(&mut *tx).await.map_err(|e| {
                    SessionError::Transaction(format!("Failed to set isolation level: {}", e))
                })?;
            } else {
                debug!(
                    "Isolation level {:?} not applied on {} backend",
                    isolation_level,
                    tx.backend_name()
                );
            }
        }

        if self.config.read_only {
            if postgres {
                sqlx::query("SET TRANSACTION READ ONLY")
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        SessionError::Transaction(format!("Failed to set read-only mode: {}", e))
                    })?;
            } else {
                debug!("Read-only mode not applied on {} backend", tx.backend_name());
            }
        }

        debug!(session = self.id, engine = self.name(), "Session transaction started");
        Ok(tx)
    }

    /// Commit the open transaction, if any
    pub async fn commit(&self) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;

        if let Some(tx) = state.tx.take() {
            tx.commit().await.map_err(|e| {
                SessionError::Transaction(format!("Failed to commit transaction: {}", e))
            })?;
            debug!(session = self.id, engine = self.name(), "Session transaction committed");
        }
        Ok(())
    }

    /// Roll back the open transaction, if any
    pub async fn rollback(&self) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_open(&state)?;
        self.rollback_open(&mut state).await
    }

    /// Roll back any open transaction and refuse further work
    pub async fn close(&self) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.rollback_open(&mut state).await
    }

    async fn rollback_open(&self, state: &mut SessionState) -> SessionResult<()> {
        if let Some(tx) = state.tx.take() {
            tx.rollback().await.map_err(|e| {
                SessionError::Transaction(format!("Failed to rollback transaction: {}", e))
            })?;
            debug!(session = self.id, engine = self.name(), "Session transaction rolled back");
        }
        Ok(())
    }

    fn ensure_open(&self, state: &SessionState) -> SessionResult<()> {
        if state.closed {
            return Err(SessionError::SessionClosed {
                id: self.id,
                name: self.name().to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if state.tx.is_some() {
                // sqlx rolls the transaction back when it is dropped
                warn!(
                    session = self.id,
                    engine = self.engine.name(),
                    "Session dropped with an open transaction; rolling back"
                );
            }
        }
    }
}

/// Creates sessions bound to one engine
#[derive(Clone)]
pub struct SessionFactory {
    engine: Engine,
    config: TransactionConfig,
}

impl SessionFactory {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            config: TransactionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Create a new session. No connection is taken until the session is used.
    pub fn create(&self) -> Arc<Session> {
        let session = Session::new(self.engine.clone(), self.config.clone());
        debug!(session = session.id, engine = self.engine.name(), "Session created");
        Arc::new(session)
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}
