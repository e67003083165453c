use async_trait::async_trait;

// Declare modules
pub mod adapters;
pub mod config;
pub mod connection;
pub mod domain;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::StoreConfig;
pub use connection::{CheckpointReport, ConnectionManager, RetryPolicy};

use domain::plan::Plan;
use domain::token::{CredentialState, StoredToken, TokenPayload};
use domain::usage::{ActionCount, ActionType, PeriodKey};
use domain::user::{NewUser, RecoveredUser, SubscriptionUpdate, UserId, UserRecord};

/// Common error type for the store layer.
///
/// Callers are expected to branch on the variant rather than the message; see
/// [`StoreError::caller_action`] for the mapping used by request handlers.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Store busy: {operation} gave up after {attempts} attempts")]
    TransientContention {
        operation: &'static str,
        attempts: u32,
    },
    #[error("User not found (ID: {0})")]
    DefiniteAbsence(UserId),
    #[error("Query failed during {operation}: {source}")]
    QueryFailure {
        operation: &'static str,
        source: sqlx::Error,
    },
    #[error("Malformed credential payload: {0}")]
    MalformedPayload(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a request handler should do with a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerAction {
    /// Contention or a failed query; the same call may succeed shortly.
    RetryShortly,
    /// Ask the user to log in (again).
    Reauthenticate,
    /// Run recovery once, then retry the original operation.
    AttemptRecovery,
    Fail,
}

impl StoreError {
    pub(crate) fn query(operation: &'static str, source: sqlx::Error) -> Self {
        StoreError::QueryFailure { operation, source }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TransientContention { .. } | StoreError::QueryFailure { .. }
        )
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::QueryFailure { source, .. } => connection::is_unique_violation(source),
            _ => false,
        }
    }

    pub(crate) fn is_foreign_key_violation(&self) -> bool {
        match self {
            StoreError::QueryFailure { source, .. } => connection::is_foreign_key_violation(source),
            _ => false,
        }
    }

    pub fn caller_action(&self, has_trusted_session: bool) -> CallerAction {
        match self {
            StoreError::TransientContention { .. } | StoreError::QueryFailure { .. } => {
                CallerAction::RetryShortly
            }
            StoreError::DefiniteAbsence(_) if has_trusted_session => CallerAction::AttemptRecovery,
            StoreError::DefiniteAbsence(_) | StoreError::MalformedPayload(_) => {
                CallerAction::Reauthenticate
            }
            _ => CallerAction::Fail,
        }
    }
}

impl From<services::recovery::RecoveryError> for StoreError {
    fn from(err: services::recovery::RecoveryError) -> Self {
        use services::recovery::RecoveryError;
        match err {
            RecoveryError::Store(e) | RecoveryError::IntegrityUnknown(e) => e,
            RecoveryError::NoTrustedSession(id) | RecoveryError::VerificationFailed(id) => {
                StoreError::DefiniteAbsence(id)
            }
            RecoveryError::ClaimMismatch { .. } | RecoveryError::MissingEmail => {
                StoreError::Validation(err.to_string())
            }
        }
    }
}

// Port for account records
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create_user(&self, new_user: &NewUser) -> Result<UserRecord, StoreError>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Fails with `DefiniteAbsence` when no row was updated.
    async fn update_subscription(
        &self,
        id: UserId,
        update: &SubscriptionUpdate,
    ) -> Result<(), StoreError>;

    async fn record_login(&self, id: UserId) -> Result<(), StoreError>;

    /// Insert-or-ignore keyed by the user id. Returns `true` if this call created the row.
    async fn insert_recovered(&self, user: &RecoveredUser) -> Result<bool, StoreError>;

    /// Removes the account together with its credential and usage history.
    async fn delete_user(&self, id: UserId) -> Result<bool, StoreError>;
}

// Port for the OAuth credential
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Writes the canonical record and the legacy mirror in one transaction.
    async fn set_token(
        &self,
        user_id: UserId,
        payload: &TokenPayload,
        linked_account_email: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Reads the credential along with the location that served it.
    async fn fetch_token(&self, user_id: UserId) -> Result<Option<StoredToken>, StoreError>;

    async fn get_token(&self, user_id: UserId) -> Result<Option<TokenPayload>, StoreError> {
        Ok(self.fetch_token(user_id).await?.map(|t| t.payload))
    }

    /// Re-reads until `expected` is observed or the attempts run out.
    async fn verify_persistence(
        &self,
        user_id: UserId,
        expected: &TokenPayload,
    ) -> Result<bool, StoreError>;

    /// Deletes both copies of the credential.
    async fn invalidate(&self, user_id: UserId) -> Result<(), StoreError>;

    /// Flags the credential as rejected downstream without deleting it.
    async fn mark_unusable(&self, user_id: UserId) -> Result<(), StoreError>;

    async fn credential_state(&self, user_id: UserId) -> Result<CredentialState, StoreError>;
}

// Port for usage accounting. Recording never checks the plan limit; callers
// decide on enforcement with `QuotaEvaluator`.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Returns how many of `resource_ids` were newly counted by this call.
    async fn record_usage_in(
        &self,
        user_id: UserId,
        period: &PeriodKey,
        resource_ids: &[String],
        action: &ActionType,
    ) -> Result<u64, StoreError>;

    async fn record_usage(
        &self,
        user_id: UserId,
        resource_ids: &[String],
        action: &ActionType,
    ) -> Result<u64, StoreError> {
        self.record_usage_in(user_id, &PeriodKey::current(), resource_ids, action)
            .await
    }

    async fn count_usage(
        &self,
        user_id: UserId,
        period: &PeriodKey,
        action: Option<&ActionType>,
    ) -> Result<u64, StoreError>;

    async fn usage_breakdown(
        &self,
        user_id: UserId,
        period: &PeriodKey,
    ) -> Result<Vec<ActionCount>, StoreError>;
}

// Port for the billing collaborator's plan table
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn find_plan(&self, name: &str) -> Result<Option<Plan>, StoreError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_action_mapping() {
        let busy = StoreError::TransientContention {
            operation: "set_token",
            attempts: 5,
        };
        assert_eq!(busy.caller_action(false), CallerAction::RetryShortly);
        assert!(busy.is_retryable());

        let absent = StoreError::DefiniteAbsence(UserId(7));
        assert_eq!(absent.caller_action(false), CallerAction::Reauthenticate);
        assert_eq!(absent.caller_action(true), CallerAction::AttemptRecovery);
        assert!(!absent.is_retryable());

        let failed = StoreError::query("find_by_id", sqlx::Error::PoolClosed);
        assert_eq!(failed.caller_action(true), CallerAction::RetryShortly);

        let malformed = StoreError::MalformedPayload("not an object".into());
        assert_eq!(malformed.caller_action(true), CallerAction::Reauthenticate);

        let conflict = StoreError::Conflict("email taken".into());
        assert_eq!(conflict.caller_action(true), CallerAction::Fail);
    }
}
