// Shared setup for the unit tests in this crate.

use crate::adapters::sqlite_user_repository::SqliteUserRepository;
use crate::domain::user::{NewUser, UserId};
use crate::{ConnectionManager, StoreConfig, UserRepository};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, SqliteConnection};
use std::str::FromStr;
use tempfile::TempDir;

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("store.db").display())
}

pub async fn open_store() -> (TempDir, ConnectionManager) {
    open_store_with(|c| c).await
}

pub async fn open_store_with<F>(tweak: F) -> (TempDir, ConnectionManager)
where
    F: FnOnce(StoreConfig) -> StoreConfig,
{
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = tweak(StoreConfig::new(database_url(&dir)));
    let conn = ConnectionManager::connect(&config)
        .await
        .expect("Failed to open store");
    conn.ensure_schema().await.expect("Failed to apply schema");
    (dir, conn)
}

pub async fn create_user(conn: &ConnectionManager, email: &str) -> UserId {
    SqliteUserRepository::new(conn.clone())
        .create_user(&NewUser::new(email, "hashed-password"))
        .await
        .expect("Failed to create user")
        .id
}

/// Opens an independent connection that holds the write lock until it is rolled back or committed.
pub async fn lock_exclusively(dir: &TempDir) -> SqliteConnection {
    let mut conn = SqliteConnectOptions::from_str(&database_url(dir))
        .expect("Invalid url")
        .connect()
        .await
        .expect("Failed to open blocking connection");
    sqlx::query("BEGIN EXCLUSIVE")
        .execute(&mut conn)
        .await
        .expect("Failed to take write lock");
    conn
}

/// Token payload shaped like an OAuth credential bundle.
pub fn credential_json(access_token: &str) -> String {
    serde_json::json!({
        "accessToken": access_token,
        "refreshToken": "refresh-1",
        "tokenEndpoint": "https://oauth2.example.com/token",
        "clientId": "client-id",
        "clientSecret": "client-secret",
        "scopes": ["mail.read", "mail.modify"],
    })
    .to_string()
}
