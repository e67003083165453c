mod common;

use account_store::domain::user::UserId;
use account_store::services::{RecoveryError, TrustedSessionClaims, UserPresence};
use account_store::services::IntegrityChecker;
use account_store::{CallerAction, StoreError, UserRepository};
use common::Harness;
use std::time::Duration;
use tokio::task::JoinSet;

fn session(user_id: i64) -> TrustedSessionClaims {
    TrustedSessionClaims {
        user_id: UserId(user_id),
        email: "returning@example.com".into(),
        display_name: Some("Returning User".into()),
        plan: Some("enterprise".into()),
        status: Some("active".into()),
    }
}

#[tokio::test]
async fn test_concurrent_reconstruction_yields_one_record() {
    let h = Harness::new().await;
    let user_id = UserId(4_001);

    let mut tasks = JoinSet::new();
    for _ in 0..2 {
        let recovery = h.recovery.clone();
        tasks.spawn(async move {
            recovery
                .emergency_reconstruct(user_id, &session(user_id.0))
                .await
        });
    }
    let mut recovered = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        recovered.push(joined.unwrap().expect("both callers succeed"));
    }

    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0], recovered[1]);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
        .bind(user_id.0)
        .fetch_one(h.conn.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert!(recovered[0].requires_password_reset());
    assert_eq!(recovered[0].monthly_usage_limit, 2000);
}

#[tokio::test]
async fn test_reconstructed_account_starts_without_history() {
    use account_store::domain::token::CredentialState;
    use account_store::domain::usage::{ActionType, PeriodKey};
    use account_store::{TokenStore, UsageLedger};

    let h = Harness::new().await;
    let user = h
        .recovery
        .emergency_reconstruct(UserId(77), &session(77))
        .await
        .unwrap();

    assert_eq!(
        h.tokens.credential_state(user.id).await.unwrap(),
        CredentialState::Absent
    );
    assert_eq!(
        h.ledger
            .count_usage(user.id, &PeriodKey::current(), None)
            .await
            .unwrap(),
        0
    );
    // Usage recording works normally afterwards.
    assert_eq!(
        h.ledger
            .record_usage(user.id, &["m-1".to_string()], &ActionType::processed())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_absent_user_without_session_must_log_in() {
    let h = Harness::new().await;
    let err = h.recovery.ensure_present(UserId(90), None).await.err().unwrap();
    assert!(matches!(err, RecoveryError::NoTrustedSession(UserId(90))));

    let store_err: StoreError = err.into();
    assert_eq!(store_err.caller_action(false), CallerAction::Reauthenticate);
    assert!(h.users.find_by_id(UserId(90)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_query_failure_is_never_grounds_for_recovery() {
    let h = Harness::new().await;
    h.conn.close().await;

    let checker = IntegrityChecker::new(h.users.clone(), h.tokens.clone())
        .confirmation_reads(2, Duration::from_millis(1));
    assert!(matches!(
        checker.ensure_user_exists(UserId(5)).await,
        UserPresence::QueryFailed(_)
    ));

    let result = h.recovery.emergency_reconstruct(UserId(5), &session(5)).await;
    match result {
        Err(RecoveryError::IntegrityUnknown(e)) => {
            assert_eq!(e.caller_action(true), CallerAction::RetryShortly)
        }
        other => panic!("Expected IntegrityUnknown, got {:?}", other),
    }
}
