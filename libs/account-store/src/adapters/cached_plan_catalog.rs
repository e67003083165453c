use crate::domain::plan::Plan;
use crate::{PlanCatalog, StoreError};
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Read-through TTL cache in front of another PlanCatalog, using Moka.
/// Misses and errors are not cached.
#[derive(Clone)]
pub struct CachedPlanCatalog {
    inner: Arc<dyn PlanCatalog>,
    cache: MokaCache<String, Plan>,
}

impl CachedPlanCatalog {
    pub fn new(inner: Arc<dyn PlanCatalog>, ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(256)
            .time_to_live(ttl)
            .build();
        Self { inner, cache }
    }

    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl PlanCatalog for CachedPlanCatalog {
    async fn find_plan(&self, name: &str) -> Result<Option<Plan>, StoreError> {
        let key = name.trim().to_ascii_lowercase();
        if let Some(plan) = self.cache.get(&key).await {
            debug!(plan = %key, "Plan served from cache");
            return Ok(Some(plan));
        }
        let found = self.inner.find_plan(&key).await?;
        if let Some(plan) = &found {
            self.cache.insert(key, plan.clone()).await;
        }
        Ok(found)
    }

    // Listing always goes to the source.
    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        self.inner.list_plans().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::in_memory_plan_catalog::InMemoryPlanCatalog;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_serves_cached_value_until_ttl() {
        let source = InMemoryPlanCatalog::with_defaults();
        let cached = CachedPlanCatalog::new(Arc::new(source.clone()), Duration::from_millis(300));

        assert_eq!(
            cached.find_plan("pro").await.unwrap().map(|p| p.monthly_resource_limit),
            Some(500)
        );

        // Source changes are hidden until the entry expires.
        source.remove("pro");
        assert!(cached.find_plan("pro").await.unwrap().is_some());

        sleep(Duration::from_millis(400)).await;
        assert!(cached.find_plan("pro").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let source = InMemoryPlanCatalog::default();
        let cached = CachedPlanCatalog::new(Arc::new(source.clone()), Duration::from_secs(60));
        assert!(cached.find_plan("free").await.unwrap().is_none());

        source.upsert(Plan::defaults().remove(0));
        assert!(cached.find_plan("free").await.unwrap().is_some());

        source.remove("free");
        cached.invalidate_all().await;
        assert!(cached.find_plan("free").await.unwrap().is_none());
    }
}
