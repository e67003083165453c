use crate::domain::usage::{ActionCount, ActionType, PeriodKey};
use crate::domain::user::UserId;
use crate::{ConnectionManager, StoreError, UsageLedger};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

#[derive(sqlx::FromRow, Debug)]
struct ActionCountRow {
    action_type: String,
    distinct_resources: i64,
}

/// Usage ledger backed by `usage_events`. Duplicates are absorbed by the
/// table's UNIQUE(user_id, resource_id, period_key, action_type) constraint.
#[derive(Debug, Clone)]
pub struct SqliteUsageLedger {
    conn: ConnectionManager,
}

impl SqliteUsageLedger {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UsageLedger for SqliteUsageLedger {
    async fn record_usage_in(
        &self,
        user_id: UserId,
        period: &PeriodKey,
        resource_ids: &[String],
        action: &ActionType,
    ) -> Result<u64, StoreError> {
        let ids: Vec<&str> = resource_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let pool = self.conn.pool();
        let ids = &ids;
        let result = self
            .conn
            .run("record_usage", move || async move {
                let now = Utc::now();
                let mut tx = pool.begin().await?;
                let mut inserted = 0u64;
                for id in ids {
                    inserted += sqlx::query(
                        "INSERT INTO usage_events (user_id, resource_id, period_key, action_type, recorded_at) \
                         VALUES (?, ?, ?, ?, ?) \
                         ON CONFLICT(user_id, resource_id, period_key, action_type) DO NOTHING",
                    )
                    .bind(user_id.0)
                    .bind(*id)
                    .bind(period.as_str())
                    .bind(action.as_str())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                }
                // Legacy per-user counter, bumped only by what was newly counted.
                if inserted > 0 {
                    sqlx::query("UPDATE users SET api_usage_count = api_usage_count + ? WHERE id = ?")
                        .bind(inserted as i64)
                        .bind(user_id.0)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok::<_, sqlx::Error>(inserted)
            })
            .await;

        match result {
            Ok(inserted) => {
                info!(
                    user_id = %user_id,
                    period = %period,
                    action = %action,
                    submitted = ids.len(),
                    newly_counted = inserted,
                    "Recorded usage"
                );
                Ok(inserted)
            }
            Err(e) if e.is_foreign_key_violation() => Err(StoreError::DefiniteAbsence(user_id)),
            Err(e) => Err(e),
        }
    }

    async fn count_usage(
        &self,
        user_id: UserId,
        period: &PeriodKey,
        action: Option<&ActionType>,
    ) -> Result<u64, StoreError> {
        let pool = self.conn.pool();
        let action = action.map(ActionType::as_str);
        let count: i64 = self
            .conn
            .run("count_usage", || {
                sqlx::query_scalar(
                    "SELECT COUNT(DISTINCT resource_id) FROM usage_events \
                     WHERE user_id = ? AND period_key = ? AND (? IS NULL OR action_type = ?)",
                )
                .bind(user_id.0)
                .bind(period.as_str())
                .bind(action)
                .bind(action)
                .fetch_one(pool)
            })
            .await?;
        debug!(user_id = %user_id, period = %period, ?action, count, "Counted usage");
        Ok(count.max(0) as u64)
    }

    async fn usage_breakdown(
        &self,
        user_id: UserId,
        period: &PeriodKey,
    ) -> Result<Vec<ActionCount>, StoreError> {
        let pool = self.conn.pool();
        let rows = self
            .conn
            .run("usage_breakdown", || {
                sqlx::query_as::<_, ActionCountRow>(
                    "SELECT action_type, COUNT(DISTINCT resource_id) AS distinct_resources \
                     FROM usage_events WHERE user_id = ? AND period_key = ? \
                     GROUP BY action_type ORDER BY action_type",
                )
                .bind(user_id.0)
                .bind(period.as_str())
                .fetch_all(pool)
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ActionCount {
                    action_type: ActionType::new(row.action_type)?,
                    distinct_resources: row.distinct_resources.max(0) as u64,
                })
            })
            .collect()
    }
}
