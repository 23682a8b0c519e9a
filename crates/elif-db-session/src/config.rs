//! Database settings
//!
//! Engines are configured from a flat `key -> value` settings map using
//! prefixed keys:
//!
//! ```text
//! database.url = postgres://localhost/app        # single default engine ""
//! database.max_connections = 20
//!
//! database.names = main reports                  # or several named engines
//! database.main.url = postgres://localhost/app
//! database.reports.url = postgres://replica/app
//! database.reports.read_only = true
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigError;
use crate::session::{IsolationLevel, TransactionConfig};

/// Default settings prefix
pub const DEFAULT_PREFIX: &str = "database";

/// Name of the engine configured when no `names` key is present
pub const DEFAULT_ENGINE: &str = "";

const REDACTED: &str = "***";

// Connection parameters whose values are never displayed
const SECRET_PARAMS: &[&str] = &["password", "sslpassword"];

const ENGINE_OPTIONS: &[&str] = &[
    "url",
    "max_connections",
    "min_connections",
    "acquire_timeout",
    "idle_timeout",
    "max_lifetime",
    "test_before_acquire",
    "isolation_level",
    "read_only",
];

/// Flat application settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a setting, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Load database settings from the process environment.
    ///
    /// See [`Settings::from_vars`] for the variable names.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build `database.*` settings from environment style variables.
    ///
    /// - `DATABASE_URL` and `DATABASE_<OPTION>` configure the default engine
    /// - `DATABASE_NAMES` lists named engines
    /// - `DATABASE_<NAME>_URL` and `DATABASE_<NAME>_<OPTION>` configure each named engine
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut settings = Settings::new();

        for option in ENGINE_OPTIONS {
            let var = format!("DATABASE_{}", option.to_uppercase());
            if let Some(value) = vars.get(&var) {
                settings.insert(format!("{}.{}", DEFAULT_PREFIX, option), value.clone());
            }
        }

        if let Some(names) = vars.get("DATABASE_NAMES") {
            settings.insert(format!("{}.names", DEFAULT_PREFIX), names.clone());

            for name in split_names(names) {
                let env_name = name.to_uppercase().replace('-', "_");
                for option in ENGINE_OPTIONS {
                    let var = format!("DATABASE_{}_{}", env_name, option.to_uppercase());
                    if let Some(value) = vars.get(&var) {
                        settings.insert(
                            format!("{}.{}.{}", DEFAULT_PREFIX, name, option),
                            value.clone(),
                        );
                    }
                }
            }
        }

        tracing::debug!("Loaded {} database settings from environment", settings.len());
        settings
    }
}

impl<K, V> FromIterator<(K, V)> for Settings
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (key, value) in iter {
            settings.insert(key, value);
        }
        settings
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
    pub idle_timeout: Option<u64>,
    pub max_lifetime: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: 30,
            idle_timeout: Some(600), // 10 minutes
            max_lifetime: Some(1800), // 30 minutes
            test_before_acquire: true,
        }
    }
}

/// Everything needed to build one engine and its session factory
#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub name: String,
    pub url: String,
    pub pool: PoolConfig,
    pub transaction: TransactionConfig,
}

impl EngineConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            pool: PoolConfig::default(),
            transaction: TransactionConfig::default(),
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("name", &self.name)
            .field("url", &redact_database_url(&self.url))
            .field("pool", &self.pool)
            .field("transaction", &self.transaction)
            .finish()
    }
}

/// Reads engine configurations from prefixed settings
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    prefix: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseSettings {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Use a different key prefix, e.g. `sqlalchemy` for `sqlalchemy.url`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Engine names listed under `<prefix>.names`, or the default engine
    pub fn engine_names(&self, settings: &Settings) -> Result<Vec<String>, ConfigError> {
        let key = format!("{}.names", self.prefix);
        let names = settings.get(&key).map(split_names).unwrap_or_default();

        if names.is_empty() {
            return Ok(vec![DEFAULT_ENGINE.to_string()]);
        }

        let mut seen = Vec::with_capacity(names.len());
        for name in names {
            if name.contains('.') {
                return Err(ConfigError::InvalidEngineName {
                    name,
                    reason: "engine names cannot contain '.'".to_string(),
                });
            }
            if seen.contains(&name) {
                return Err(ConfigError::DuplicateEngine { name });
            }
            seen.push(name);
        }
        Ok(seen)
    }

    /// Parse every configured engine
    pub fn parse(&self, settings: &Settings) -> Result<Vec<EngineConfig>, ConfigError> {
        self.engine_names(settings)?
            .into_iter()
            .map(|name| self.parse_engine(settings, &name))
            .collect()
    }

    /// Parse the engine named `name` (`""` for the default engine)
    pub fn parse_engine(
        &self,
        settings: &Settings,
        name: &str,
    ) -> Result<EngineConfig, ConfigError> {
        let scope = if name.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}.{}", self.prefix, name)
        };
        let key = |option: &str| format!("{}.{}", scope, option);

        let url_key = key("url");
        let url = match settings.get(&url_key).map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return Err(ConfigError::MissingRequired { key: url_key }),
        };

        warn_unknown_options(settings, &scope);

        let defaults = PoolConfig::default();
        let option = |name: &str, default| parse_or(settings, &key(name), parse_u32, default);
        let seconds = |name: &str, default| parse_or(settings, &key(name), parse_seconds, default);
        let pool = PoolConfig {
            max_connections: option("max_connections", defaults.max_connections)?,
            min_connections: option("min_connections", defaults.min_connections)?,
            acquire_timeout: parse_or(
                settings,
                &key("acquire_timeout"),
                parse_u64,
                defaults.acquire_timeout,
            )?,
            idle_timeout: seconds("idle_timeout", defaults.idle_timeout)?,
            max_lifetime: seconds("max_lifetime", defaults.max_lifetime)?,
            test_before_acquire: parse_or(
                settings,
                &key("test_before_acquire"),
                parse_bool,
                defaults.test_before_acquire,
            )?,
        };

        if pool.max_connections == 0 {
            return Err(ConfigError::invalid(
                &key("max_connections"),
                "0",
                "at least 1 connection",
            ));
        }

        if pool.min_connections > pool.max_connections {
            return Err(ConfigError::invalid(
                &key("min_connections"),
                &pool.min_connections.to_string(),
                &format!("at most max_connections ({})", pool.max_connections),
            ));
        }

        let transaction = TransactionConfig {
            isolation_level: parse_or(settings, &key("isolation_level"), parse_isolation, None)?,
            read_only: parse_or(settings, &key("read_only"), parse_bool, false)?,
        };

        Ok(EngineConfig {
            name: name.to_string(),
            url,
            pool,
            transaction,
        })
    }
}

/// Mask passwords in a database url with `***`
///
/// Covers the userinfo password and `password`/`sslpassword` query
/// parameters. Unparseable urls that may carry credentials are replaced
/// entirely.
pub fn redact_database_url(raw: &str) -> String {
    let mut parsed = match url::Url::parse(raw) {
        Ok(parsed) => parsed,
        Err(_) if raw.contains('@') || raw.to_lowercase().contains("password=") => {
            return REDACTED.to_string();
        }
        Err(_) => return raw.to_string(),
    };

    let mut redacted = false;
    if parsed.password().is_some() {
        redacted |= parsed.set_password(Some(REDACTED)).is_ok();
    }

    if parsed.query_pairs().any(|(key, _)| is_secret_param(&key)) {
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(key, value)| {
                let value = if is_secret_param(&key) {
                    REDACTED.to_string()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
        redacted = true;
    }

    if redacted {
        parsed.to_string()
    } else {
        raw.to_string()
    }
}

fn is_secret_param(key: &str) -> bool {
    SECRET_PARAMS.iter().any(|param| key.eq_ignore_ascii_case(param))
}

fn warn_unknown_options(settings: &Settings, scope: &str) {
    let prefix = format!("{}.", scope);
    for key in settings.keys() {
        let Some(option) = key.strip_prefix(&prefix) else {
            continue;
        };
        if option.contains('.') || option == "names" || ENGINE_OPTIONS.contains(&option) {
            continue;
        }
        tracing::warn!("Ignoring unknown database setting '{}'", key);
    }
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T>(
    settings: &Settings,
    key: &str,
    parse: fn(&str, &str) -> Result<T, ConfigError>,
    default: T,
) -> Result<T, ConfigError> {
    match settings.get(key) {
        Some(value) => parse(key, value.trim()),
        None => Ok(default),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(key, value, "an unsigned integer"))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(key, value, "a number of seconds"))
}

// `none`, `off` and `0` disable the timeout
fn parse_seconds(key: &str, value: &str) -> Result<Option<u64>, ConfigError> {
    match value.to_lowercase().as_str() {
        "none" | "off" | "0" => Ok(None),
        _ => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, value, "a number of seconds or 'none'")),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::invalid(key, value, "a boolean")),
    }
}

fn parse_isolation(key: &str, value: &str) -> Result<Option<IsolationLevel>, ConfigError> {
    value
        .parse::<IsolationLevel>()
        .map(Some)
        .map_err(|_| {
            ConfigError::invalid(
                key,
                value,
                "read_uncommitted, read_committed, repeatable_read or serializable",
            )
        })
}
