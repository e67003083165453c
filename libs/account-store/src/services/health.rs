use crate::domain::user::RECOVERY_SENTINEL_CREDENTIAL;
use crate::{ConnectionManager, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const REQUIRED_TABLES: [&str; 4] = ["users", "tokens", "usage_events", "subscription_plans"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub integrity: String,
    pub user_count: i64,
    pub recovered_users: i64,
    pub unconverged_mirrors: i64,
    pub database_bytes: Option<u64>,
    pub wal_bytes: Option<u64>,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn worst(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }

    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.issues.push(HealthIssue {
            severity,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub backup: PathBuf,
    pub after: HealthReport,
}

/// Read-only health checks plus backup and repair of the store file.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    conn: ConnectionManager,
}

impl HealthMonitor {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn scalar(&self, operation: &'static str, sql: &'static str) -> Result<i64, StoreError> {
        let pool = self.conn.pool();
        self.conn
            .run(operation, move || sqlx::query_scalar(sql).fetch_one(pool))
            .await
    }

    pub async fn check(&self) -> Result<HealthReport, StoreError> {
        let pool = self.conn.pool();
        let mut report = HealthReport {
            checked_at: Utc::now(),
            integrity: String::new(),
            user_count: 0,
            recovered_users: 0,
            unconverged_mirrors: 0,
            database_bytes: None,
            wal_bytes: None,
            issues: Vec::new(),
        };

        let integrity: Vec<String> = self
            .conn
            .run("integrity_check", move || {
                sqlx::query_scalar("PRAGMA integrity_check").fetch_all(pool)
            })
            .await?;
        report.integrity = integrity.join("; ");
        if report.integrity != "ok" {
            report.push(
                Severity::Critical,
                format!("integrity check failed: {}", report.integrity),
            );
        }

        let tables: Vec<String> = self
            .conn
            .run("list_tables", move || {
                sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                    .fetch_all(pool)
            })
            .await?;
        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|t| !tables.iter().any(|name| name == t))
            .collect();
        if !missing.is_empty() {
            report.push(
                Severity::Critical,
                format!("missing tables: {}", missing.join(", ")),
            );
            // The remaining checks query those tables.
            return Ok(self.finish(report).await);
        }

        report.user_count = self.scalar("count_users", "SELECT COUNT(*) FROM users").await?;
        if report.user_count == 0 {
            report.push(Severity::Critical, "no users in store, possible data loss");
        }

        let blank = self
            .scalar(
                "count_blank_users",
                "SELECT COUNT(*) FROM users WHERE TRIM(email) = '' OR TRIM(credential) = ''",
            )
            .await?;
        if blank > 0 {
            report.push(
                Severity::Critical,
                format!("{blank} users with blank email or credential"),
            );
        }

        let sentinel = RECOVERY_SENTINEL_CREDENTIAL;
        report.recovered_users = self
            .conn
            .run("count_recovered_users", move || {
                sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE credential = ?")
                    .bind(sentinel)
                    .fetch_one(pool)
            })
            .await?;
        if report.recovered_users > 0 {
            report.push(
                Severity::Warning,
                format!(
                    "{} users were reconstructed and need a password reset",
                    report.recovered_users
                ),
            );
        }

        report.unconverged_mirrors = self
            .scalar(
                "count_unconverged_mirrors",
                "SELECT COUNT(*) FROM tokens t JOIN users u ON u.id = t.user_id \
                 WHERE t.is_active = 1 AND (u.legacy_token IS NULL OR u.legacy_token <> t.token_data)",
            )
            .await?;
        if report.unconverged_mirrors > 0 {
            report.push(
                Severity::Warning,
                format!(
                    "{} legacy credential mirrors differ from canonical storage",
                    report.unconverged_mirrors
                ),
            );
        }

        Ok(self.finish(report).await)
    }

    async fn finish(&self, mut report: HealthReport) -> HealthReport {
        if let Some(path) = self.conn.database_path() {
            report.database_bytes = file_len(path).await;
            report.wal_bytes = file_len(&wal_path(path)).await;
            if let (Some(db), Some(wal)) = (report.database_bytes, report.wal_bytes) {
                if wal > db.saturating_mul(2) {
                    report.push(
                        Severity::Warning,
                        format!("WAL file ({wal} bytes) exceeds twice the database size ({db} bytes)"),
                    );
                }
            }
        }

        match report.worst() {
            None => info!(users = report.user_count, "Store health check passed"),
            Some(Severity::Warning) => {
                warn!(issues = ?report.issues, "Store health check found warnings")
            }
            Some(Severity::Critical) => {
                error!(issues = ?report.issues, "Store health check found critical issues")
            }
        }
        report
    }

    /// Writes a consistent copy of the database with `VACUUM INTO`.
    pub async fn backup(&self, destination: Option<&Path>) -> Result<PathBuf, StoreError> {
        let source = self.conn.database_path().ok_or_else(|| {
            StoreError::Configuration("in-memory stores cannot be backed up".into())
        })?;
        let destination = match destination {
            Some(path) => path.to_path_buf(),
            None => default_backup_path(source, Utc::now()),
        };
        if tokio::fs::try_exists(&destination).await? {
            return Err(StoreError::Validation(format!(
                "backup destination already exists: {}",
                destination.display()
            )));
        }

        let pool = self.conn.pool();
        let target = destination.to_string_lossy().into_owned();
        let target = target.as_str();
        self.conn
            .run("backup", move || {
                sqlx::query("VACUUM INTO ?").bind(target).execute(pool)
            })
            .await?;
        info!(backup = %destination.display(), "Store backup written");
        Ok(destination)
    }

    /// Backs up, then rebuilds the file and its indexes, then re-checks.
    pub async fn repair(&self) -> Result<RepairReport, StoreError> {
        let backup = self.backup(None).await?;
        warn!(backup = %backup.display(), "Repairing store");

        let pool = self.conn.pool();
        self.conn
            .run("vacuum", move || sqlx::query("VACUUM").execute(pool))
            .await?;
        self.conn
            .run("reindex", move || sqlx::query("REINDEX").execute(pool))
            .await?;
        // VACUUM goes through the WAL; fold it back and shrink the log.
        self.conn
            .run("truncate_wal", move || {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool)
            })
            .await?;

        let after = self.check().await?;
        Ok(RepairReport { backup, after })
    }
}

fn wal_path(database: &Path) -> PathBuf {
    let mut name = database.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

fn default_backup_path(database: &Path, at: DateTime<Utc>) -> PathBuf {
    let mut name = database.as_os_str().to_owned();
    name.push(format!(".backup_{}", at.format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}
