pub mod health;
pub mod integrity;
pub mod plans;
pub mod quota;
pub mod recovery;
pub mod subscription;

pub use health::HealthMonitor;
pub use integrity::{IntegrityChecker, UserPresence};
pub use quota::{QuotaEvaluator, QuotaStatus};
pub use recovery::{RecoveryAgent, RecoveryError, TrustedSessionClaims};
pub use subscription::SubscriptionManager;
