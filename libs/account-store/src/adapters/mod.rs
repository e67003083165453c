// Declare modules within the adapters directory
pub mod cached_plan_catalog;
pub mod in_memory_plan_catalog;
pub mod sqlite_plan_catalog;
pub mod sqlite_token_store;
pub mod sqlite_usage_ledger;
pub mod sqlite_user_repository;

pub use cached_plan_catalog::CachedPlanCatalog;
pub use in_memory_plan_catalog::InMemoryPlanCatalog;
pub use sqlite_plan_catalog::SqlitePlanCatalog;
pub use sqlite_token_store::SqliteTokenStore;
pub use sqlite_usage_ledger::SqliteUsageLedger;
pub use sqlite_user_repository::SqliteUserRepository;
