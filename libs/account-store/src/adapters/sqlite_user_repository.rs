use crate::domain::user::{
    NewUser, RECOVERY_SENTINEL_CREDENTIAL, RecoveredUser, SubscriptionStatus, SubscriptionUpdate,
    UserId, UserRecord,
};
use crate::{ConnectionManager, StoreError, UserRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

const USER_COLUMNS: &str = "id, email, credential, display_name, subscription_plan, \
    subscription_status, subscription_expires, monthly_usage_limit, api_usage_count, \
    linked_account_email, is_active, created_at, last_login";

// Matches the users table
#[derive(sqlx::FromRow, Debug)]
struct UserRow {
    id: i64,
    email: String,
    credential: String,
    display_name: Option<String>,
    subscription_plan: String,
    subscription_status: String,
    subscription_expires: Option<DateTime<Utc>>,
    monthly_usage_limit: i64,
    api_usage_count: i64,
    linked_account_email: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_login: Option<DateTime<Utc>>,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        UserRecord {
            id: UserId(row.id),
            email: row.email,
            credential: row.credential,
            display_name: row.display_name,
            subscription_plan: row.subscription_plan,
            subscription_status: SubscriptionStatus::from(row.subscription_status.as_str()),
            subscription_expires: row.subscription_expires,
            monthly_usage_limit: row.monthly_usage_limit,
            api_usage_count: row.api_usage_count,
            linked_account_email: row.linked_account_email,
            is_active: row.is_active,
            created_at: row.created_at,
            last_login: row.last_login,
        }
    }
}

/// SQLite implementation of the UserRepository port.
#[derive(Debug, Clone)]
pub struct SqliteUserRepository {
    conn: ConnectionManager,
}

impl SqliteUserRepository {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl UserRepository for SqliteUserRepository {
    async fn create_user(&self, new_user: &NewUser) -> Result<UserRecord, StoreError> {
        new_user.validate()?;
        let pool = self.conn.pool();
        let sql = format!(
            "INSERT INTO users (email, credential, display_name, subscription_plan, \
             subscription_status, monthly_usage_limit, created_at) \
             VALUES (?, ?, ?, ?, 'active', ?, ?) RETURNING {USER_COLUMNS}"
        );
        let email = new_user.email.trim();
        let now = Utc::now();

        let result = self
            .conn
            .run("create_user", || {
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(email)
                    .bind(&new_user.credential)
                    .bind(&new_user.display_name)
                    .bind(&new_user.subscription_plan)
                    .bind(new_user.monthly_usage_limit)
                    .bind(now)
                    .fetch_one(pool)
            })
            .await;

        match result {
            Ok(row) => {
                info!(user_id = row.id, plan = %row.subscription_plan, "Created user");
                Ok(row.into())
            }
            Err(e) if e.is_unique_violation() => Err(StoreError::Conflict(format!(
                "email already registered: {email}"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        let pool = self.conn.pool();
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let row = self
            .conn
            .run("find_user_by_id", || {
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(id.0)
                    .fetch_optional(pool)
            })
            .await?;
        debug!(user_id = %id, found = row.is_some(), "Looked up user");
        Ok(row.map(UserRecord::from))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let pool = self.conn.pool();
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        let email = email.trim();
        let row = self
            .conn
            .run("find_user_by_email", || {
                sqlx::query_as::<_, UserRow>(&sql)
                    .bind(email)
                    .fetch_optional(pool)
            })
            .await?;
        Ok(row.map(UserRecord::from))
    }

    async fn update_subscription(
        &self,
        id: UserId,
        update: &SubscriptionUpdate,
    ) -> Result<(), StoreError> {
        let pool = self.conn.pool();
        let updated = self
            .conn
            .run("update_subscription", || {
                sqlx::query(
                    "UPDATE users SET subscription_plan = ?, subscription_status = ?, \
                     subscription_expires = ?, monthly_usage_limit = ? WHERE id = ?",
                )
                .bind(&update.plan)
                .bind(update.status.as_str())
                .bind(update.expires)
                .bind(update.monthly_usage_limit)
                .bind(id.0)
                .execute(pool)
            })
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::DefiniteAbsence(id));
        }
        info!(
            user_id = %id,
            plan = %update.plan,
            status = %update.status,
            limit = update.monthly_usage_limit,
            "Updated subscription"
        );
        Ok(())
    }

    async fn record_login(&self, id: UserId) -> Result<(), StoreError> {
        let pool = self.conn.pool();
        let now = Utc::now();
        let updated = self
            .conn
            .run("record_login", || {
                sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
                    .bind(now)
                    .bind(id.0)
                    .execute(pool)
            })
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::DefiniteAbsence(id));
        }
        Ok(())
    }

    async fn insert_recovered(&self, user: &RecoveredUser) -> Result<bool, StoreError> {
        let pool = self.conn.pool();
        let now = Utc::now();
        let result = self
            .conn
            .run("insert_recovered_user", || {
                sqlx::query(
                    "INSERT INTO users (id, email, credential, display_name, subscription_plan, \
                     subscription_status, monthly_usage_limit, is_active, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?) ON CONFLICT(id) DO NOTHING",
                )
                .bind(user.id.0)
                .bind(user.email.trim())
                .bind(RECOVERY_SENTINEL_CREDENTIAL)
                .bind(&user.display_name)
                .bind(&user.subscription_plan)
                .bind(user.subscription_status.as_str())
                .bind(user.monthly_usage_limit)
                .bind(now)
                .execute(pool)
            })
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            // The id is free but another account already owns the email.
            Err(e) if e.is_unique_violation() => Err(StoreError::Conflict(format!(
                "email {} belongs to another account",
                user.email.trim()
            ))),
            Err(e) => Err(e),
        }
    }

    async fn delete_user(&self, id: UserId) -> Result<bool, StoreError> {
        let pool = self.conn.pool();
        let deleted = self
            .conn
            .run("delete_user", || {
                sqlx::query("DELETE FROM users WHERE id = ?")
                    .bind(id.0)
                    .execute(pool)
            })
            .await?
            .rows_affected();
        if deleted > 0 {
            info!(user_id = %id, "Deleted user and dependent records");
        }
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn test_create_and_find_user() {
        let (_dir, conn) = test_support::open_store().await;
        let repo = SqliteUserRepository::new(conn);

        let created = repo
            .create_user(&NewUser::new(" alice@example.com ", "hash").display_name("Alice"))
            .await
            .expect("Failed to create user");
        assert_eq!(created.email, "alice@example.com");
        assert_eq!(created.subscription_plan, "free");
        assert_eq!(created.subscription_status, SubscriptionStatus::Active);
        assert_eq!(created.monthly_usage_limit, 100);
        assert!(created.is_active);
        assert!(!created.requires_password_reset());

        let by_id = repo.find_by_id(created.id).await.unwrap();
        assert_eq!(by_id.as_ref(), Some(&created));
        let by_email = repo.find_by_email("alice@example.com").await.unwrap();
        assert_eq!(by_email.map(|u| u.id), Some(created.id));

        assert!(repo.find_by_id(UserId(9_999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let (_dir, conn) = test_support::open_store().await;
        let repo = SqliteUserRepository::new(conn);
        repo.create_user(&NewUser::new("dup@example.com", "hash"))
            .await
            .unwrap();

        let result = repo.create_user(&NewUser::new("dup@example.com", "other")).await;
        match result.err().unwrap() {
            StoreError::Conflict(msg) => assert!(msg.contains("dup@example.com")),
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_subscription_and_missing_user() {
        let (_dir, conn) = test_support::open_store().await;
        let repo = SqliteUserRepository::new(conn.clone());
        let user_id = test_support::create_user(&conn, "sub@example.com").await;

        let expires = Utc::now() + chrono::Duration::days(30);
        let update = SubscriptionUpdate {
            plan: "pro".into(),
            status: SubscriptionStatus::Active,
            expires: Some(expires),
            monthly_usage_limit: 500,
        };
        repo.update_subscription(user_id, &update).await.unwrap();

        let user = repo.find_by_id(user_id).await.unwrap().unwrap();
        assert_eq!(user.subscription_plan, "pro");
        assert_eq!(user.monthly_usage_limit, 500);
        assert_eq!(
            user.subscription_expires.map(|e| e.timestamp()),
            Some(expires.timestamp())
        );

        let missing = repo.update_subscription(UserId(4242), &update).await;
        assert!(matches!(missing, Err(StoreError::DefiniteAbsence(UserId(4242)))));
        let missing_login = repo.record_login(UserId(4242)).await;
        assert!(matches!(missing_login, Err(StoreError::DefiniteAbsence(_))));
    }

    #[tokio::test]
    async fn test_insert_recovered_is_insert_or_ignore() {
        let (_dir, conn) = test_support::open_store().await;
        let repo = SqliteUserRepository::new(conn);
        let recovered = RecoveredUser {
            id: UserId(77),
            email: "lost@example.com".into(),
            display_name: Some("Lost User".into()),
            subscription_plan: "pro".into(),
            subscription_status: SubscriptionStatus::Active,
            monthly_usage_limit: 500,
        };

        assert!(repo.insert_recovered(&recovered).await.unwrap());
        assert!(!repo.insert_recovered(&recovered).await.unwrap());

        let user = repo.find_by_id(UserId(77)).await.unwrap().unwrap();
        assert!(user.requires_password_reset());
        assert_eq!(user.subscription_plan, "pro");

        // Same email under a different id must not create a second account.
        let clash = RecoveredUser {
            id: UserId(78),
            ..recovered
        };
        assert!(matches!(
            repo.insert_recovered(&clash).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_user() {
        let (_dir, conn) = test_support::open_store().await;
        let repo = SqliteUserRepository::new(conn.clone());
        let user_id = test_support::create_user(&conn, "gone@example.com").await;

        assert!(repo.delete_user(user_id).await.unwrap());
        assert!(!repo.delete_user(user_id).await.unwrap());
        assert!(repo.find_by_id(user_id).await.unwrap().is_none());
    }
}
