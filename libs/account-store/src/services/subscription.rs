use crate::domain::user::{SubscriptionStatus, SubscriptionUpdate, UserId, UserRecord};
use crate::{PlanCatalog, StoreError, UserRepository};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Applies billing outcomes to the account row.
#[derive(Clone)]
pub struct SubscriptionManager {
    users: Arc<dyn UserRepository>,
    plans: Arc<dyn PlanCatalog>,
}

impl SubscriptionManager {
    pub fn new(users: Arc<dyn UserRepository>, plans: Arc<dyn PlanCatalog>) -> Self {
        Self { users, plans }
    }

    /// Moves the user onto `plan_name` and copies the plan's limit onto the row.
    /// Unlike quota checks, an unknown plan is rejected here.
    pub async fn apply_plan(
        &self,
        user_id: UserId,
        plan_name: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<UserRecord, StoreError> {
        let plan = self
            .plans
            .find_plan(plan_name)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown plan: {plan_name}")))?;

        let update = SubscriptionUpdate {
            plan: plan.name,
            status: SubscriptionStatus::Active,
            expires,
            monthly_usage_limit: plan.monthly_resource_limit,
        };
        self.users.update_subscription(user_id, &update).await?;
        info!(user_id = %user_id, plan = %update.plan, "Subscription applied");

        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(StoreError::DefiniteAbsence(user_id))
    }

    /// Keeps the plan and its limit until expiry, only the status changes.
    pub async fn cancel(&self, user_id: UserId) -> Result<UserRecord, StoreError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(StoreError::DefiniteAbsence(user_id))?;
        let update = SubscriptionUpdate {
            plan: user.subscription_plan,
            status: SubscriptionStatus::Cancelled,
            expires: user.subscription_expires,
            monthly_usage_limit: user.monthly_usage_limit,
        };
        self.users.update_subscription(user_id, &update).await?;
        info!(user_id = %user_id, "Subscription cancelled");

        self.users
            .find_by_id(user_id)
            .await?
            .ok_or(StoreError::DefiniteAbsence(user_id))
    }
}
