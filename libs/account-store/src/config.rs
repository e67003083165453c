use crate::StoreError;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://accounts.db";

/// Connection and retry settings for the store.
///
/// Every field has a default; `from_env` only overrides what is set.
#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Per-attempt wait inside SQLite before it reports BUSY.
    pub busy_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    /// Cap on the summed backoff sleeps of one call.
    pub retry_max_total_backoff: Duration,
    pub verify_attempts: u32,
    pub verify_delay: Duration,
    pub plan_cache_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 8,
            acquire_timeout: Duration::from_millis(5_000),
            busy_timeout: Duration::from_millis(100),
            retry_max_attempts: 5,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_total_backoff: Duration::from_millis(2_000),
            verify_attempts: 3,
            verify_delay: Duration::from_millis(100),
            plan_cache_ttl: Duration::from_secs(300),
        }
    }
}

// Hide credentials that may be embedded in the URL query string.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = self
            .database_url
            .split_once('?')
            .map(|(path, _)| format!("{path}?..."))
            .unwrap_or_else(|| self.database_url.clone());
        f.debug_struct("StoreConfig")
            .field("database_url", &url)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("busy_timeout", &self.busy_timeout)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_initial_delay", &self.retry_initial_delay)
            .field("retry_max_total_backoff", &self.retry_max_total_backoff)
            .field("verify_attempts", &self.verify_attempts)
            .field("verify_delay", &self.verify_delay)
            .field("plan_cache_ttl", &self.plan_cache_ttl)
            .finish()
    }
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Reads `DATABASE_URL` and the `STORE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            config.database_url = url;
        }
        if let Some(n) = parse_count(&lookup, "STORE_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(ms) = parse_number(&lookup, "STORE_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, "STORE_BUSY_TIMEOUT_MS")? {
            config.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_count(&lookup, "STORE_RETRY_MAX_ATTEMPTS")? {
            config.retry_max_attempts = n;
        }
        if let Some(ms) = parse_number(&lookup, "STORE_RETRY_INITIAL_DELAY_MS")? {
            config.retry_initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number(&lookup, "STORE_RETRY_MAX_TOTAL_BACKOFF_MS")? {
            config.retry_max_total_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = parse_count(&lookup, "STORE_VERIFY_ATTEMPTS")? {
            config.verify_attempts = n;
        }
        if let Some(ms) = parse_number(&lookup, "STORE_VERIFY_DELAY_MS")? {
            config.verify_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_number(&lookup, "STORE_PLAN_CACHE_TTL_SECS")? {
            config.plan_cache_ttl = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_connections == 0 {
            return Err(StoreError::Configuration(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(StoreError::Configuration(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        if self.verify_attempts == 0 {
            return Err(StoreError::Configuration(
                "verify_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn retry(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_initial_delay = initial_delay;
        self
    }

    pub fn retry_max_total_backoff(mut self, budget: Duration) -> Self {
        self.retry_max_total_backoff = budget;
        self
    }

    pub fn verify(mut self, attempts: u32, delay: Duration) -> Self {
        self.verify_attempts = attempts;
        self.verify_delay = delay;
        self
    }

    pub fn plan_cache_ttl(mut self, ttl: Duration) -> Self {
        self.plan_cache_ttl = ttl;
        self
    }
}

fn parse_number<F>(lookup: &F, key: &str) -> Result<Option<u64>, StoreError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            StoreError::Configuration(format!("{key} must be a non-negative integer, got {raw:?}"))
        }),
    }
}

fn parse_count<F>(lookup: &F, key: &str) -> Result<Option<u32>, StoreError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_number(lookup, key)?
        .map(|n| {
            u32::try_from(n).map_err(|_| {
                StoreError::Configuration(format!("{key} is too large, got {n}"))
            })
        })
        .transpose()
}
