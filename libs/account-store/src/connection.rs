//! Pool handling, contention retry and durability for the SQLite store.

use crate::{StoreConfig, StoreError};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Sqlite;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

// SQLite primary result codes
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Bounded exponential backoff applied to contended units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_total_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_total_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Sleep taken after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Sum of every sleep a fully contended call would take.
    pub fn worst_case_backoff(&self) -> Duration {
        let mut total = Duration::ZERO;
        for attempt in 1..self.max_attempts {
            let next = total + self.delay_after(attempt);
            if next > self.max_total_backoff {
                break;
            }
            total = next;
        }
        total
    }
}

/// Result of `PRAGMA wal_checkpoint(FULL)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    /// True when the checkpoint could not run to completion because of readers or writers.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Owns the pool and routes every unit of work through the contention retry loop.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    pool: SqlitePool,
    retry: RetryPolicy,
    database_path: Option<PathBuf>,
    schema_ready: Arc<OnceCell<()>>,
}

impl ConnectionManager {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let in_memory = is_in_memory_url(&config.database_url);

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| {
                StoreError::Configuration(format!("invalid database url: {e}"))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);
        let database_path = (!in_memory).then(|| options.get_filename().to_path_buf());

        // Each in-memory connection would otherwise open its own empty database.
        let max_connections = if in_memory { 1 } else { config.max_connections };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::query("connect", e))?;

        info!(
            path = ?database_path,
            max_connections,
            "Store connection pool established."
        );

        Ok(Self {
            pool,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                initial_delay: config.retry_initial_delay,
                max_total_backoff: config.retry_max_total_backoff,
            },
            database_path,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    /// Applies the embedded migrations once per manager (and its clones).
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_ready
            .get_or_try_init(|| async {
                info!("Applying store migrations...");
                MIGRATOR.run(&self.pool).await?;
                info!(
                    migrations = MIGRATOR.iter().count(),
                    "Store schema is up to date."
                );
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    /// Acquires a raw connection, retrying while the pool or store is contended.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        let pool = &self.pool;
        self.run("acquire", move || pool.acquire()).await
    }

    /// Runs `unit` and re-runs it from scratch while the store reports BUSY/LOCKED.
    ///
    /// `unit` must be a complete unit of work (typically one transaction) so a
    /// failed attempt leaves nothing behind. Any other error is returned as
    /// `QueryFailure` without retrying.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut unit: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        let mut waited = Duration::ZERO;
        loop {
            match unit().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_contention(&e) => {
                    let delay = self.retry.delay_after(attempt);
                    if attempt >= self.retry.max_attempts
                        || waited + delay > self.retry.max_total_backoff
                    {
                        warn!(
                            operation,
                            attempts = attempt,
                            waited_ms = waited.as_millis() as u64,
                            "Store still busy, giving up"
                        );
                        return Err(StoreError::TransientContention {
                            operation,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Store busy, retrying: {}",
                        e
                    );
                    sleep(delay).await;
                    waited += delay;
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::query(operation, e)),
            }
        }
    }

    /// Forces committed WAL content into the main database file.
    ///
    /// Used after writes that an upstream system will act on immediately.
    pub async fn force_durability_sync(&self) -> Result<CheckpointReport, StoreError> {
        let pool = &self.pool;
        let (busy, log_frames, checkpointed_frames): (i64, i64, i64) = self
            .run("force_durability_sync", move || {
                sqlx::query_as("PRAGMA wal_checkpoint(FULL)").fetch_one(pool)
            })
            .await?;
        let report = CheckpointReport {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        };
        if report.busy {
            warn!(?report, "WAL checkpoint could not complete");
        } else {
            info!(?report, "WAL checkpoint completed");
        }
        Ok(report)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn is_in_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// BUSY/LOCKED from SQLite (including extended codes) or a pool that could not hand out a connection in time.
pub(crate) fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_foreign_key_violation())
}
