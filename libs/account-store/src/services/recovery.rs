use crate::domain::plan::FREE_PLAN_NAME;
use crate::domain::user::{RecoveredUser, SubscriptionStatus, UserId, UserRecord};
use crate::services::integrity::{IntegrityChecker, UserPresence};
use crate::services::plans::resolve_plan_limit;
use crate::{PlanCatalog, StoreError, UserRepository};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Claims taken from an independently authenticated session. The session is
/// the trust source; nothing here may come from request input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrustedSessionClaims {
    pub user_id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub plan: Option<String>,
    pub status: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum RecoveryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Session claims are for user {claimed}, not {requested}")]
    ClaimMismatch { requested: UserId, claimed: UserId },
    #[error("Session claims carry no email")]
    MissingEmail,
    #[error("Existence of user could not be determined: {0}")]
    IntegrityUnknown(StoreError),
    #[error("User {0} is absent and there is no trusted session; log in again")]
    NoTrustedSession(UserId),
    #[error("User {0} still absent after reconstruction")]
    VerificationFailed(UserId),
}

/// Rebuilds a minimal account for a user whose row is definitely gone.
///
/// Lossy: credentials, payments and usage tied to the old row are not restored.
#[derive(Clone)]
pub struct RecoveryAgent {
    checker: IntegrityChecker,
    users: Arc<dyn UserRepository>,
    plans: Arc<dyn PlanCatalog>,
}

impl RecoveryAgent {
    pub fn new(
        checker: IntegrityChecker,
        users: Arc<dyn UserRepository>,
        plans: Arc<dyn PlanCatalog>,
    ) -> Self {
        Self {
            checker,
            users,
            plans,
        }
    }

    /// Existence check plus the recovery policy used by request handlers:
    /// absent users are rebuilt once if a trusted session is available.
    pub async fn ensure_present(
        &self,
        user_id: UserId,
        claims: Option<&TrustedSessionClaims>,
    ) -> Result<UserRecord, RecoveryError> {
        match self.checker.ensure_user_exists(user_id).await {
            UserPresence::Exists(user) => Ok(user),
            UserPresence::QueryFailed(e) => Err(RecoveryError::IntegrityUnknown(e)),
            UserPresence::DefinitelyAbsent => match claims {
                Some(claims) => self.reconstruct_absent(user_id, claims).await,
                None => Err(RecoveryError::NoTrustedSession(user_id)),
            },
        }
    }

    pub async fn emergency_reconstruct(
        &self,
        user_id: UserId,
        claims: &TrustedSessionClaims,
    ) -> Result<UserRecord, RecoveryError> {
        check_claims(user_id, claims)?;
        match self.checker.ensure_user_exists(user_id).await {
            UserPresence::Exists(user) => {
                info!(user_id = %user_id, "User present, no reconstruction needed");
                Ok(user)
            }
            UserPresence::QueryFailed(e) => Err(RecoveryError::IntegrityUnknown(e)),
            UserPresence::DefinitelyAbsent => self.reconstruct_absent(user_id, claims).await,
        }
    }

    async fn reconstruct_absent(
        &self,
        user_id: UserId,
        claims: &TrustedSessionClaims,
    ) -> Result<UserRecord, RecoveryError> {
        check_claims(user_id, claims)?;

        let plan = claims
            .plan
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(FREE_PLAN_NAME);
        let resolved = resolve_plan_limit(self.plans.as_ref(), plan).await?;
        let status = claims
            .status
            .as_deref()
            .map(SubscriptionStatus::from)
            .unwrap_or(SubscriptionStatus::Active);

        error!(
            user_id = %user_id,
            email = %claims.email,
            plan,
            "Reconstructing missing user from session claims; prior tokens and usage are lost"
        );

        // Keep the claimed plan name so a paying user is not silently downgraded.
        let recovered = RecoveredUser {
            id: user_id,
            email: claims.email.trim().to_string(),
            display_name: claims.display_name.clone(),
            subscription_plan: plan.to_string(),
            subscription_status: status,
            monthly_usage_limit: resolved.monthly_resource_limit,
        };
        let inserted = self.users.insert_recovered(&recovered).await?;
        if !inserted {
            info!(user_id = %user_id, "Concurrent reconstruction won, reading its record");
        }

        match self.users.find_by_id(user_id).await? {
            Some(user) => {
                info!(user_id = %user_id, inserted, "Emergency reconstruction complete");
                Ok(user)
            }
            None => {
                error!(user_id = %user_id, "Reconstructed user not visible on re-read");
                Err(RecoveryError::VerificationFailed(user_id))
            }
        }
    }
}

fn check_claims(user_id: UserId, claims: &TrustedSessionClaims) -> Result<(), RecoveryError> {
    if claims.user_id != user_id {
        warn!(
            requested = %user_id,
            claimed = %claims.user_id,
            "Refusing reconstruction for mismatched session"
        );
        return Err(RecoveryError::ClaimMismatch {
            requested: user_id,
            claimed: claims.user_id,
        });
    }
    if claims.email.trim().is_empty() {
        return Err(RecoveryError::MissingEmail);
    }
    Ok(())
}
