use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential value written for reconstructed accounts. No password hash can
/// ever equal it, so the account has to go through a password reset.
pub const RECOVERY_SENTINEL_CREDENTIAL: &str = "EMERGENCY_RECOVERY_NO_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
    PastDue,
    /// Anything else found in the store, kept verbatim.
    Other(String),
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Other(s) => s,
        }
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "cancelled" | "canceled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            "past_due" => SubscriptionStatus::PastDue,
            _ => SubscriptionStatus::Other(value.to_string()),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account row as the rest of the crate sees it.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub credential: String,
    pub display_name: Option<String>,
    pub subscription_plan: String,
    pub subscription_status: SubscriptionStatus,
    pub subscription_expires: Option<DateTime<Utc>>,
    pub monthly_usage_limit: i64,
    pub api_usage_count: i64,
    pub linked_account_email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// True for accounts rebuilt from a session; their credential is the sentinel.
    pub fn requires_password_reset(&self) -> bool {
        self.credential == RECOVERY_SENTINEL_CREDENTIAL
    }
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("credential", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("subscription_plan", &self.subscription_plan)
            .field("subscription_status", &self.subscription_status)
            .field("subscription_expires", &self.subscription_expires)
            .field("monthly_usage_limit", &self.monthly_usage_limit)
            .field("api_usage_count", &self.api_usage_count)
            .field("linked_account_email", &self.linked_account_email)
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("last_login", &self.last_login)
            .finish()
    }
}

/// Input for signup. `credential` is the already-hashed password.
#[derive(Clone)]
pub struct NewUser {
    pub email: String,
    pub credential: String,
    pub display_name: Option<String>,
    pub subscription_plan: String,
    pub monthly_usage_limit: i64,
}

impl NewUser {
    pub fn new(email: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            credential: credential.into(),
            display_name: None,
            subscription_plan: crate::domain::plan::FREE_PLAN_NAME.to_string(),
            monthly_usage_limit: crate::domain::plan::FREE_PLAN_FALLBACK_LIMIT,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn plan(mut self, name: impl Into<String>, monthly_usage_limit: i64) -> Self {
        self.subscription_plan = name.into();
        self.monthly_usage_limit = monthly_usage_limit;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_email(&self.email)?;
        if self.credential.is_empty() {
            return Err(StoreError::Validation("credential must not be empty".into()));
        }
        if self.credential == RECOVERY_SENTINEL_CREDENTIAL {
            return Err(StoreError::Validation(
                "credential must not be the recovery sentinel".into(),
            ));
        }
        if self.monthly_usage_limit < 0 {
            return Err(StoreError::Validation(
                "monthly usage limit must not be negative".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("subscription_plan", &self.subscription_plan)
            .field("monthly_usage_limit", &self.monthly_usage_limit)
            .finish_non_exhaustive()
    }
}

/// Minimal account rebuilt from trusted session claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredUser {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub subscription_plan: String,
    pub subscription_status: SubscriptionStatus,
    pub monthly_usage_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub plan: String,
    pub status: SubscriptionStatus,
    pub expires: Option<DateTime<Utc>>,
    pub monthly_usage_limit: i64,
}

pub(crate) fn validate_email(email: &str) -> Result<(), StoreError> {
    let trimmed = email.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(StoreError::Validation(format!(
            "invalid email address: {email:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_keeps_unknown_values() {
        assert_eq!(SubscriptionStatus::from("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from("Canceled"), SubscriptionStatus::Cancelled);
        assert_eq!(SubscriptionStatus::from("past_due"), SubscriptionStatus::PastDue);
        let other = SubscriptionStatus::from("trialing");
        assert_eq!(other, SubscriptionStatus::Other("trialing".into()));
        assert_eq!(other.as_str(), "trialing");
    }

    #[test]
    fn test_new_user_validation() {
        assert!(NewUser::new("a@example.com", "hash").validate().is_ok());
        assert!(NewUser::new("not-an-email", "hash").validate().is_err());
        assert!(NewUser::new("a@example.com", "").validate().is_err());
        assert!(NewUser::new("a@example.com", RECOVERY_SENTINEL_CREDENTIAL)
            .validate()
            .is_err());
        assert!(NewUser::new("a@example.com", "hash")
            .plan("pro", -1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let user = NewUser::new("a@example.com", "super-secret-hash");
        assert!(!format!("{:?}", user).contains("super-secret-hash"));
    }
}
