//! # elif-db-session: Request-scoped database sessions for elif.rs
//!
//! Builds named database engines from prefixed settings, hands out one
//! session per engine per request, and commits or rolls back every
//! request's sessions when the response is ready.
//!
//! ```rust,ignore
//! use axum::{routing::post, Router};
//! use elif_db_session::{DatabaseSessions, DbSession, RequestSessions, SessionResult, Settings};
//!
//! async fn create_note(db: DbSession) -> SessionResult<&'static str> {
//!     let mut conn = db.connection().await?;
//!     sqlx::query("INSERT INTO notes (body) VALUES ('hello')")
//!         .execute(&mut *conn)
//!         .await?;
//!     Ok("created")
//! }
//!
//! async fn report(sessions: RequestSessions) -> SessionResult<String> {
//!     let reports = sessions.get("reports").await?;
//!     Ok(reports.name().to_string())
//! }
//!
//! let sessions = DatabaseSessions::from_settings(Settings::from_env()).await?;
//! let app = sessions.install(
//!     Router::new()
//!         .route("/notes", post(create_note))
//!         .route("/report", post(report)),
//! );
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod middleware;
pub mod provider;
pub mod registry;
pub mod request;
pub mod session;
pub mod transaction;

pub use config::{
    redact_database_url, DatabaseSettings, EngineConfig, PoolConfig, Settings, DEFAULT_ENGINE,
    DEFAULT_PREFIX,
};
pub use engine::{Engine, PoolStats};
pub use error::{ConfigError, EventError, PoolError, SessionError, SessionResult};
pub use events::{listener_fn, FnListener, SessionCreated, SessionEvents, SessionListener};
pub use middleware::{SessionLayer, SessionService};
pub use provider::{DatabaseSessions, DatabaseSessionsBuilder};
pub use registry::{create_unmanaged_session, get_engine, EngineRegistry, RegisteredEngine};
pub use request::{get_tm_session, DbSession, RequestSessions};
pub use session::{
    IsolationLevel, Session, SessionConnection, SessionFactory, SessionStatus, TransactionConfig,
};
pub use transaction::{
    default_commit_veto, CommitVeto, TmConfig, TransactionManager, TransactionOutcome, TM_HEADER,
};
