use crate::domain::plan::Plan;
use crate::{PlanCatalog, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory implementation of the PlanCatalog port for tests and single-executable mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPlanCatalog {
    // Plan name (lowercase) -> Plan
    plans: Arc<DashMap<String, Plan>>,
}

impl InMemoryPlanCatalog {
    /// Catalog holding the default free/pro/enterprise plans.
    pub fn with_defaults() -> Self {
        let catalog = Self::default();
        for plan in Plan::defaults() {
            catalog.upsert(plan);
        }
        catalog
    }

    pub fn upsert(&self, plan: Plan) {
        self.plans.insert(plan.name.to_ascii_lowercase(), plan);
    }

    pub fn remove(&self, name: &str) -> Option<Plan> {
        self.plans
            .remove(&name.to_ascii_lowercase())
            .map(|(_, plan)| plan)
    }
}

#[async_trait]
impl PlanCatalog for InMemoryPlanCatalog {
    async fn find_plan(&self, name: &str) -> Result<Option<Plan>, StoreError> {
        Ok(self
            .plans
            .get(&name.trim().to_ascii_lowercase())
            .map(|entry| entry.value().clone())
            .filter(|plan| plan.is_active))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let mut plans: Vec<Plan> = self
            .plans
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|plan| plan.is_active)
            .collect();
        plans.sort_by_key(|plan| plan.monthly_resource_limit);
        Ok(plans)
    }
}
