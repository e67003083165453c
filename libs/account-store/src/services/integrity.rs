use crate::domain::token::CredentialState;
use crate::domain::user::{SubscriptionStatus, UserId, UserRecord};
use crate::{StoreError, TokenStore, UserRepository};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Outcome of an existence check.
#[derive(Debug)]
pub enum UserPresence {
    Exists(UserRecord),
    /// Every confirmation read completed and returned no row. Eligible for recovery.
    DefinitelyAbsent,
    /// At least one read failed and none found the row. Only retrying is safe.
    QueryFailed(StoreError),
}

impl UserPresence {
    pub fn exists(&self) -> bool {
        matches!(self, UserPresence::Exists(_))
    }
}

/// Diagnostic summary logged for operators.
#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    pub user_id: UserId,
    pub email: String,
    pub plan: String,
    pub status: SubscriptionStatus,
    /// `None` when the credential lookup itself failed.
    pub credential: Option<CredentialState>,
    pub requires_password_reset: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub subscription_expires: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct IntegrityChecker {
    users: Arc<dyn UserRepository>,
    tokens: Arc<dyn TokenStore>,
    confirmation_reads: u32,
    confirmation_delay: Duration,
}

impl IntegrityChecker {
    pub fn new(users: Arc<dyn UserRepository>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            users,
            tokens,
            confirmation_reads: 2,
            confirmation_delay: Duration::from_millis(50),
        }
    }

    pub fn confirmation_reads(mut self, reads: u32, delay: Duration) -> Self {
        self.confirmation_reads = reads.max(1);
        self.confirmation_delay = delay;
        self
    }

    pub async fn ensure_user_exists(&self, user_id: UserId) -> UserPresence {
        let mut last_error = None;

        for read in 1..=self.confirmation_reads {
            if read > 1 {
                sleep(self.confirmation_delay).await;
            }
            match self.users.find_by_id(user_id).await {
                Ok(Some(user)) => {
                    let snapshot = self.snapshot(&user).await;
                    info!(?snapshot, "User integrity confirmed");
                    return UserPresence::Exists(user);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %user_id, read, "Integrity read failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => {
                warn!(user_id = %user_id, "User existence unknown, not eligible for recovery");
                UserPresence::QueryFailed(e)
            }
            None => {
                warn!(
                    user_id = %user_id,
                    reads = self.confirmation_reads,
                    "User definitely absent"
                );
                UserPresence::DefinitelyAbsent
            }
        }
    }

    pub async fn snapshot(&self, user: &UserRecord) -> UserSnapshot {
        let credential = match self.tokens.credential_state(user.id).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(user_id = %user.id, "Could not read credential state: {}", e);
                None
            }
        };
        UserSnapshot {
            user_id: user.id,
            email: user.email.clone(),
            plan: user.subscription_plan.clone(),
            status: user.subscription_status.clone(),
            credential,
            requires_password_reset: user.requires_password_reset(),
            created_at: user.created_at,
            last_login: user.last_login,
            subscription_expires: user.subscription_expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SqliteTokenStore, SqliteUserRepository};
    use crate::domain::user::{NewUser, RecoveredUser, SubscriptionUpdate};
    use crate::test_support;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` reads, then delegates.
    struct FlakyUsers {
        inner: SqliteUserRepository,
        failures: AtomicU32,
    }

    #[async_trait]
    impl UserRepository for FlakyUsers {
        async fn create_user(&self, new_user: &NewUser) -> Result<UserRecord, StoreError> {
            self.inner.create_user(new_user).await
        }
        async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::query("find_user_by_id", sqlx::Error::PoolClosed));
            }
            self.inner.find_by_id(id).await
        }
        async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
            self.inner.find_by_email(email).await
        }
        async fn update_subscription(
            &self,
            id: UserId,
            update: &SubscriptionUpdate,
        ) -> Result<(), StoreError> {
            self.inner.update_subscription(id, update).await
        }
        async fn record_login(&self, id: UserId) -> Result<(), StoreError> {
            self.inner.record_login(id).await
        }
        async fn insert_recovered(&self, user: &RecoveredUser) -> Result<bool, StoreError> {
            self.inner.insert_recovered(user).await
        }
        async fn delete_user(&self, id: UserId) -> Result<bool, StoreError> {
            self.inner.delete_user(id).await
        }
    }

    fn checker_with(conn: &crate::ConnectionManager, failures: u32) -> IntegrityChecker {
        let users = FlakyUsers {
            inner: SqliteUserRepository::new(conn.clone()),
            failures: AtomicU32::new(failures),
        };
        IntegrityChecker::new(Arc::new(users), Arc::new(SqliteTokenStore::new(conn.clone())))
            .confirmation_reads(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_existing_user() {
        let (_dir, conn) = test_support::open_store().await;
        let user_id = test_support::create_user(&conn, "here@example.com").await;

        let presence = checker_with(&conn, 0).ensure_user_exists(user_id).await;
        match presence {
            UserPresence::Exists(user) => assert_eq!(user.id, user_id),
            other => panic!("Expected Exists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_absent_user() {
        let (_dir, conn) = test_support::open_store().await;
        let presence = checker_with(&conn, 0).ensure_user_exists(UserId(404)).await;
        assert!(matches!(presence, UserPresence::DefinitelyAbsent));
    }

    #[tokio::test]
    async fn test_failed_reads_are_not_absence() {
        let (_dir, conn) = test_support::open_store().await;
        let presence = checker_with(&conn, 1).ensure_user_exists(UserId(404)).await;
        assert!(matches!(presence, UserPresence::QueryFailed(_)));
    }

    #[tokio::test]
    async fn test_one_failed_read_then_found() {
        let (_dir, conn) = test_support::open_store().await;
        let user_id = test_support::create_user(&conn, "flaky@example.com").await;
        let presence = checker_with(&conn, 1).ensure_user_exists(user_id).await;
        assert!(presence.exists());
    }

    #[tokio::test]
    async fn test_snapshot_reports_credential() {
        let (_dir, conn) = test_support::open_store().await;
        let user_id = test_support::create_user(&conn, "snap@example.com").await;
        let checker = checker_with(&conn, 0);
        let user = SqliteUserRepository::new(conn.clone())
            .find_by_id(user_id)
            .await
            .unwrap()
            .unwrap();

        let snapshot = checker.snapshot(&user).await;
        assert_eq!(snapshot.credential, Some(CredentialState::Absent));
        assert_eq!(snapshot.plan, "free");
        assert!(!snapshot.requires_password_reset);
    }
}
