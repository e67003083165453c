use crate::domain::usage::{ActionType, PeriodKey};
use crate::domain::user::UserId;
use crate::services::plans::resolve_plan_limit;
use crate::{PlanCatalog, StoreError, UsageLedger, UserRepository};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub user_id: UserId,
    pub period: PeriodKey,
    /// The user's plan as stored, even when its limit fell back.
    pub plan: String,
    pub usage_count: u64,
    pub limit: u64,
    pub remaining: u64,
    pub exceeded: bool,
}

impl QuotaStatus {
    fn compute(user_id: UserId, period: PeriodKey, plan: String, usage_count: u64, limit: u64) -> Self {
        QuotaStatus {
            user_id,
            period,
            plan,
            usage_count,
            limit,
            remaining: limit.saturating_sub(usage_count),
            exceeded: usage_count >= limit,
        }
    }
}

/// Read-only view of usage against the plan limit. Enforcement is up to the caller.
#[derive(Clone)]
pub struct QuotaEvaluator {
    users: Arc<dyn UserRepository>,
    ledger: Arc<dyn UsageLedger>,
    plans: Arc<dyn PlanCatalog>,
    action: Option<ActionType>,
}

impl QuotaEvaluator {
    pub fn new(
        users: Arc<dyn UserRepository>,
        ledger: Arc<dyn UsageLedger>,
        plans: Arc<dyn PlanCatalog>,
    ) -> Self {
        Self {
            users,
            ledger,
            plans,
            action: None,
        }
    }

    /// Counts only events of this action (default: every action).
    pub fn counting_action(mut self, action: ActionType) -> Self {
        self.action = Some(action);
        self
    }

    pub async fn check_quota(&self, user_id: UserId) -> Result<QuotaStatus, StoreError> {
        self.check_quota_in(user_id, PeriodKey::current()).await
    }

    pub async fn check_quota_in(
        &self,
        user_id: UserId,
        period: PeriodKey,
    ) -> Result<QuotaStatus, StoreError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(StoreError::DefiniteAbsence(user_id))?;

        let resolved = resolve_plan_limit(self.plans.as_ref(), &user.subscription_plan).await?;
        let usage_count = self
            .ledger
            .count_usage(user_id, &period, self.action.as_ref())
            .await?;

        let status = QuotaStatus::compute(
            user_id,
            period,
            user.subscription_plan,
            usage_count,
            resolved.monthly_resource_limit.max(0) as u64,
        );
        debug!(
            user_id = %user_id,
            usage = status.usage_count,
            limit = status.limit,
            exceeded = status.exceeded,
            "Checked quota"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryPlanCatalog, SqliteUsageLedger, SqliteUserRepository};
    use crate::domain::user::{NewUser, SubscriptionStatus, SubscriptionUpdate};
    use crate::test_support;

    #[test]
    fn test_compute_saturates() {
        let period = PeriodKey::parse("2024-01").unwrap();
        let over = QuotaStatus::compute(UserId(1), period.clone(), "free".into(), 130, 100);
        assert_eq!((over.remaining, over.exceeded), (0, true));
        let at = QuotaStatus::compute(UserId(1), period.clone(), "free".into(), 100, 100);
        assert_eq!((at.remaining, at.exceeded), (0, true));
        let under = QuotaStatus::compute(UserId(1), period, "free".into(), 40, 100);
        assert_eq!((under.remaining, under.exceeded), (60, false));
    }

    #[tokio::test]
    async fn test_unknown_plan_falls_back_to_free_limit() {
        let (_dir, conn) = test_support::open_store().await;
        let users = Arc::new(SqliteUserRepository::new(conn.clone()));
        let user = users
            .create_user(&NewUser::new("gold@example.com", "hash").plan("legacy-gold", 9_999))
            .await
            .unwrap();
        let ledger = Arc::new(SqliteUsageLedger::new(conn.clone()));
        let quota = QuotaEvaluator::new(
            users.clone(),
            ledger.clone(),
            Arc::new(InMemoryPlanCatalog::with_defaults()),
        );

        let ids: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
        ledger.record_usage(user.id, &ids, &ActionType::processed()).await.unwrap();

        let status = quota.check_quota(user.id).await.unwrap();
        assert_eq!(status.plan, "legacy-gold");
        assert_eq!(status.limit, 100);
        assert_eq!(status.usage_count, 10);
        assert_eq!(status.remaining, 90);

        // Upgrading to a known plan raises the limit.
        users
            .update_subscription(
                user.id,
                &SubscriptionUpdate {
                    plan: "pro".into(),
                    status: SubscriptionStatus::Active,
                    expires: None,
                    monthly_usage_limit: 500,
                },
            )
            .await
            .unwrap();
        assert_eq!(quota.check_quota(user.id).await.unwrap().limit, 500);
    }

    #[tokio::test]
    async fn test_missing_user_is_definite_absence() {
        let (_dir, conn) = test_support::open_store().await;
        let quota = QuotaEvaluator::new(
            Arc::new(SqliteUserRepository::new(conn.clone())),
            Arc::new(SqliteUsageLedger::new(conn)),
            Arc::new(InMemoryPlanCatalog::with_defaults()),
        );
        assert!(matches!(
            quota.check_quota(UserId(5)).await,
            Err(StoreError::DefiniteAbsence(UserId(5)))
        ));
    }

    #[tokio::test]
    async fn test_counting_single_action() {
        let (_dir, conn) = test_support::open_store().await;
        let user_id = test_support::create_user(&conn, "actions@example.com").await;
        let ledger = Arc::new(SqliteUsageLedger::new(conn.clone()));
        let summarized = ActionType::new("summarized").unwrap();
        let ids: Vec<String> = (0..4).map(|i| format!("r{i}")).collect();
        ledger.record_usage(user_id, &ids, &ActionType::processed()).await.unwrap();
        ledger.record_usage(user_id, &ids[..1], &summarized).await.unwrap();

        let quota = QuotaEvaluator::new(
            Arc::new(SqliteUserRepository::new(conn)),
            ledger,
            Arc::new(InMemoryPlanCatalog::with_defaults()),
        )
        .counting_action(summarized);
        assert_eq!(quota.check_quota(user_id).await.unwrap().usage_count, 1);
    }
}
