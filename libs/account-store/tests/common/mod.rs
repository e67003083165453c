#![allow(dead_code)]

use account_store::adapters::{
    InMemoryPlanCatalog, SqliteTokenStore, SqliteUsageLedger, SqliteUserRepository,
};
use account_store::domain::user::{NewUser, UserId};
use account_store::services::{IntegrityChecker, QuotaEvaluator, RecoveryAgent};
use account_store::{ConnectionManager, StoreConfig, UserRepository};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Every handle a request handler would be given, wired to one temp database.
pub struct Harness {
    pub dir: TempDir,
    pub conn: ConnectionManager,
    pub users: Arc<SqliteUserRepository>,
    pub tokens: Arc<SqliteTokenStore>,
    pub ledger: Arc<SqliteUsageLedger>,
    pub quota: QuotaEvaluator,
    pub recovery: RecoveryAgent,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", dir.path().join("accounts.db").display());
        let config = StoreConfig::new(url).verify(3, Duration::from_millis(10));
        let conn = ConnectionManager::connect(&config)
            .await
            .expect("Failed to open store");
        conn.ensure_schema().await.expect("Failed to apply schema");

        let users = Arc::new(SqliteUserRepository::new(conn.clone()));
        let tokens = Arc::new(SqliteTokenStore::from_config(conn.clone(), &config));
        let ledger = Arc::new(SqliteUsageLedger::new(conn.clone()));
        let plans = Arc::new(InMemoryPlanCatalog::with_defaults());

        let quota = QuotaEvaluator::new(users.clone(), ledger.clone(), plans.clone());
        let checker = IntegrityChecker::new(users.clone(), tokens.clone())
            .confirmation_reads(2, Duration::from_millis(5));
        let recovery = RecoveryAgent::new(checker, users.clone(), plans);

        Self {
            dir,
            conn,
            users,
            tokens,
            ledger,
            quota,
            recovery,
        }
    }

    pub async fn user(&self, email: &str) -> UserId {
        self.users
            .create_user(&NewUser::new(email, "argon2-hash"))
            .await
            .expect("Failed to create user")
            .id
    }

    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("accounts.db").display())
    }
}

pub fn resource_ids(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("{prefix}-{i}")).collect()
}

pub fn credential(access_token: &str) -> String {
    format!(
        r#"{{"accessToken":"{access_token}","refreshToken":"r","tokenEndpoint":"https://oauth2.example.com/token","clientId":"c","clientSecret":"s","scopes":["mail.read"]}}"#
    )
}
