use crate::domain::plan::{FREE_PLAN_FALLBACK_LIMIT, FREE_PLAN_NAME};
use crate::{PlanCatalog, StoreError};
use tracing::warn;

/// The limit a plan name resolves to, and whether a fallback was needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLimit {
    pub plan: String,
    pub monthly_resource_limit: i64,
    pub fell_back: bool,
}

/// Named plan, else the free plan, else the built-in free limit.
///
/// Catalog errors are returned as-is; only a plan that is genuinely missing
/// falls back.
pub async fn resolve_plan_limit(
    catalog: &dyn PlanCatalog,
    plan_name: &str,
) -> Result<ResolvedLimit, StoreError> {
    if let Some(plan) = catalog.find_plan(plan_name).await? {
        return Ok(ResolvedLimit {
            plan: plan.name,
            monthly_resource_limit: plan.monthly_resource_limit,
            fell_back: false,
        });
    }

    let monthly_resource_limit = match catalog.find_plan(FREE_PLAN_NAME).await? {
        Some(free) => free.monthly_resource_limit,
        None => {
            warn!("Free plan missing from catalog, using built-in limit");
            FREE_PLAN_FALLBACK_LIMIT
        }
    };
    warn!(
        plan = plan_name,
        fallback_limit = monthly_resource_limit,
        "Unknown plan, falling back to free plan limit"
    );
    Ok(ResolvedLimit {
        plan: FREE_PLAN_NAME.to_string(),
        monthly_resource_limit,
        fell_back: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_plan_catalog::InMemoryPlanCatalog;

    #[tokio::test]
    async fn test_known_unknown_and_empty_catalog() {
        let catalog = InMemoryPlanCatalog::with_defaults();

        let pro = resolve_plan_limit(&catalog, "pro").await.unwrap();
        assert_eq!((pro.monthly_resource_limit, pro.fell_back), (500, false));

        let unknown = resolve_plan_limit(&catalog, "legacy-gold").await.unwrap();
        assert_eq!(unknown.plan, "free");
        assert_eq!((unknown.monthly_resource_limit, unknown.fell_back), (100, true));

        let empty = InMemoryPlanCatalog::default();
        let builtin = resolve_plan_limit(&empty, "pro").await.unwrap();
        assert_eq!(builtin.monthly_resource_limit, FREE_PLAN_FALLBACK_LIMIT);
        assert!(builtin.fell_back);
    }
}
