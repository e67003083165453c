use crate::domain::plan::{Plan, split_features};
use crate::{ConnectionManager, PlanCatalog, StoreError};
use async_trait::async_trait;

const PLAN_COLUMNS: &str =
    "name, monthly_resource_limit, price_monthly_cents, price_yearly_cents, features, is_active";

#[derive(sqlx::FromRow, Debug)]
struct PlanRow {
    name: String,
    monthly_resource_limit: i64,
    price_monthly_cents: i64,
    price_yearly_cents: i64,
    features: String,
    is_active: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            name: row.name,
            monthly_resource_limit: row.monthly_resource_limit,
            price_monthly_cents: row.price_monthly_cents,
            price_yearly_cents: row.price_yearly_cents,
            features: split_features(&row.features),
            is_active: row.is_active,
        }
    }
}

/// Reads the `subscription_plans` table. Inactive plans are not returned.
#[derive(Debug, Clone)]
pub struct SqlitePlanCatalog {
    conn: ConnectionManager,
}

impl SqlitePlanCatalog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PlanCatalog for SqlitePlanCatalog {
    async fn find_plan(&self, name: &str) -> Result<Option<Plan>, StoreError> {
        let pool = self.conn.pool();
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE name = ? AND is_active = 1"
        );
        let name = name.trim().to_ascii_lowercase();
        let row = self
            .conn
            .run("find_plan", || {
                sqlx::query_as::<_, PlanRow>(&sql)
                    .bind(name.as_str())
                    .fetch_optional(pool)
            })
            .await?;
        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let pool = self.conn.pool();
        let sql = format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE is_active = 1 \
             ORDER BY monthly_resource_limit"
        );
        let rows = self
            .conn
            .run("list_plans", || {
                sqlx::query_as::<_, PlanRow>(&sql).fetch_all(pool)
            })
            .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }
}
