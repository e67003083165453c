use crate::domain::token::{CredentialState, StoredToken, TokenPayload, TokenSource};
use crate::domain::user::UserId;
use crate::{ConnectionManager, StoreConfig, StoreError, TokenStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// Canonical row and legacy mirror in one read.
const LOOKUP_SQL: &str = "SELECT u.legacy_token, t.token_data, t.is_active AS token_active, \
    COALESCE(t.linked_account_email, u.linked_account_email) AS linked_account_email, t.updated_at \
    FROM users u LEFT JOIN tokens t ON t.user_id = u.id WHERE u.id = ?";

#[derive(sqlx::FromRow, Debug)]
struct TokenLookupRow {
    legacy_token: Option<String>,
    token_data: Option<String>,
    token_active: Option<bool>,
    linked_account_email: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Dual-location credential store: `tokens` is canonical, `users.legacy_token` is the mirror.
#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    conn: ConnectionManager,
    verify_attempts: u32,
    verify_delay: Duration,
}

impl SqliteTokenStore {
    pub fn new(conn: ConnectionManager) -> Self {
        let defaults = StoreConfig::default();
        Self {
            conn,
            verify_attempts: defaults.verify_attempts,
            verify_delay: defaults.verify_delay,
        }
    }

    pub fn from_config(conn: ConnectionManager, config: &StoreConfig) -> Self {
        Self {
            conn,
            verify_attempts: config.verify_attempts.max(1),
            verify_delay: config.verify_delay,
        }
    }

    async fn lookup(&self, user_id: UserId) -> Result<Option<TokenLookupRow>, StoreError> {
        let pool = self.conn.pool();
        self.conn
            .run("fetch_token", || {
                sqlx::query_as::<_, TokenLookupRow>(LOOKUP_SQL)
                    .bind(user_id.0)
                    .fetch_optional(pool)
            })
            .await
    }

    /// Copies the legacy credential into the canonical table. A canonical row
    /// is only overwritten while it still holds the unreadable value that was
    /// seen, so a concurrent write always wins.
    async fn repair_canonical(&self, user_id: UserId, unreadable: Option<&str>) {
        let pool = self.conn.pool();
        let now = Utc::now();
        let result = self
            .conn
            .run("repair_canonical_token", || {
                sqlx::query(
                    "INSERT INTO tokens (user_id, token_data, linked_account_email, created_at, updated_at, is_active) \
                     SELECT id, legacy_token, linked_account_email, ?, ?, 1 FROM users \
                     WHERE id = ? AND legacy_token IS NOT NULL AND legacy_token <> '' \
                     ON CONFLICT(user_id) DO UPDATE SET \
                     token_data = excluded.token_data, updated_at = excluded.updated_at \
                     WHERE tokens.is_active = 1 AND tokens.token_data IS ?",
                )
                .bind(now)
                .bind(now)
                .bind(user_id.0)
                .bind(unreadable)
                .execute(pool)
            })
            .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                info!(user_id = %user_id, "Migrated legacy credential into canonical storage")
            }
            Ok(_) => debug!(user_id = %user_id, "Canonical credential changed concurrently, repair skipped"),
            Err(e) => warn!(user_id = %user_id, "Read-repair of credential failed: {}", e),
        }
    }

    /// Brings the legacy mirror back in line with the active canonical row.
    async fn converge_mirror(&self, user_id: UserId) {
        let pool = self.conn.pool();
        let result = self
            .conn
            .run("converge_legacy_token", || {
                sqlx::query(
                    "UPDATE users SET legacy_token = \
                     (SELECT token_data FROM tokens WHERE tokens.user_id = users.id AND tokens.is_active = 1) \
                     WHERE id = ? AND EXISTS \
                     (SELECT 1 FROM tokens WHERE tokens.user_id = users.id AND tokens.is_active = 1)",
                )
                .bind(user_id.0)
                .execute(pool)
            })
            .await;

        match result {
            Ok(_) => debug!(user_id = %user_id, "Legacy credential mirror converged"),
            Err(e) => warn!(user_id = %user_id, "Could not converge legacy credential mirror: {}", e),
        }
    }
}

fn well_formed(user_id: UserId, raw: String, location: &str) -> Option<TokenPayload> {
    let payload = TokenPayload::new(raw);
    match payload.validate() {
        Ok(()) => Some(payload),
        Err(e) => {
            warn!(user_id = %user_id, location, "Ignoring stored credential: {}", e);
            None
        }
    }
}

fn parses(raw: &str) -> bool {
    TokenPayload::new(raw).validate().is_ok()
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn set_token(
        &self,
        user_id: UserId,
        payload: &TokenPayload,
        linked_account_email: Option<&str>,
    ) -> Result<(), StoreError> {
        payload.validate()?;
        let pool = self.conn.pool();
        let data = payload.as_str();

        let user_found = self
            .conn
            .run("set_token", move || async move {
                let now = Utc::now();
                let mut tx = pool.begin().await?;

                // The mirror write goes first so a missing user aborts before anything else.
                let mirrored = sqlx::query(
                    "UPDATE users SET legacy_token = ?, \
                     linked_account_email = COALESCE(?, linked_account_email) WHERE id = ?",
                )
                .bind(data)
                .bind(linked_account_email)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if mirrored == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                sqlx::query(
                    "INSERT INTO tokens (user_id, token_data, linked_account_email, created_at, updated_at, is_active) \
                     VALUES (?, ?, ?, ?, ?, 1) \
                     ON CONFLICT(user_id) DO UPDATE SET \
                     token_data = excluded.token_data, \
                     linked_account_email = COALESCE(excluded.linked_account_email, tokens.linked_account_email), \
                     updated_at = excluded.updated_at, \
                     is_active = 1",
                )
                .bind(user_id.0)
                .bind(data)
                .bind(linked_account_email)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok::<_, sqlx::Error>(true)
            })
            .await?;

        if !user_found {
            warn!(user_id = %user_id, "Refusing to store credential for unknown user");
            return Err(StoreError::DefiniteAbsence(user_id));
        }
        info!(user_id = %user_id, "Stored credential in canonical and legacy locations");
        Ok(())
    }

    async fn fetch_token(&self, user_id: UserId) -> Result<Option<StoredToken>, StoreError> {
        let Some(row) = self.lookup(user_id).await? else {
            debug!(user_id = %user_id, "No user row, credential absent");
            return Ok(None);
        };

        // An unreadable canonical value is treated as missing and the mirror gets a chance.
        let unreadable = match (row.token_data, row.token_active) {
            (Some(data), Some(true)) => {
                let mirror_differs = row.legacy_token.as_deref() != Some(data.as_str());
                match well_formed(user_id, data.clone(), "canonical") {
                    Some(payload) => {
                        if mirror_differs {
                            self.converge_mirror(user_id).await;
                        }
                        return Ok(Some(StoredToken {
                            payload,
                            source: TokenSource::Canonical,
                            linked_account_email: row.linked_account_email,
                            updated_at: row.updated_at,
                        }));
                    }
                    None => Some(data),
                }
            }
            (Some(_), _) => {
                // Rejected downstream; the legacy mirror must not bring it back.
                debug!(user_id = %user_id, "Credential invalidated by downstream API");
                return Ok(None);
            }
            (None, _) => None,
        };

        let Some(legacy) = row.legacy_token.filter(|t| !t.is_empty()) else {
            return Ok(None);
        };
        let Some(payload) = well_formed(user_id, legacy, "legacy") else {
            return Ok(None);
        };
        warn!(user_id = %user_id, "Credential readable only in legacy location, repairing");
        self.repair_canonical(user_id, unreadable.as_deref()).await;
        Ok(Some(StoredToken {
            payload,
            source: TokenSource::LegacyMirror,
            linked_account_email: row.linked_account_email,
            updated_at: None,
        }))
    }

    async fn verify_persistence(
        &self,
        user_id: UserId,
        expected: &TokenPayload,
    ) -> Result<bool, StoreError> {
        let mut last_error = None;
        let mut any_read_completed = false;

        for attempt in 1..=self.verify_attempts {
            sleep(self.verify_delay).await;
            match self.fetch_token(user_id).await {
                Ok(Some(found)) if found.payload == *expected => {
                    debug!(user_id = %user_id, attempt, "Credential persistence verified");
                    return Ok(true);
                }
                Ok(_) => {
                    any_read_completed = true;
                    debug!(user_id = %user_id, attempt, "Credential not visible yet");
                }
                Err(e) => {
                    warn!(user_id = %user_id, attempt, "Verification read failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_read_completed => Err(e),
            _ => {
                warn!(
                    user_id = %user_id,
                    attempts = self.verify_attempts,
                    "Credential could not be verified after write"
                );
                Ok(false)
            }
        }
    }

    async fn invalidate(&self, user_id: UserId) -> Result<(), StoreError> {
        let pool = self.conn.pool();
        self.conn
            .run("invalidate_token", move || async move {
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM tokens WHERE user_id = ?")
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE users SET legacy_token = NULL WHERE id = ?")
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await
            })
            .await?;
        info!(user_id = %user_id, "Invalidated credential in both locations");
        Ok(())
    }

    async fn mark_unusable(&self, user_id: UserId) -> Result<(), StoreError> {
        let pool = self.conn.pool();
        let flagged = self
            .conn
            .run("mark_token_unusable", move || async move {
                let now = Utc::now();
                let mut tx = pool.begin().await?;
                let flagged = sqlx::query(
                    "UPDATE tokens SET is_active = 0, updated_at = ? WHERE user_id = ?",
                )
                .bind(now)
                .bind(user_id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                sqlx::query("UPDATE users SET legacy_token = NULL WHERE id = ?")
                    .bind(user_id.0)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(flagged)
            })
            .await?;
        info!(user_id = %user_id, flagged, "Marked credential unusable");
        Ok(())
    }

    async fn credential_state(&self, user_id: UserId) -> Result<CredentialState, StoreError> {
        let Some(row) = self.lookup(user_id).await? else {
            return Ok(CredentialState::Absent);
        };
        let state = match (row.token_data.as_deref(), row.token_active) {
            (Some(data), Some(true)) if parses(data) => CredentialState::Present,
            (Some(_), Some(false)) => CredentialState::InvalidatedByDownstream,
            _ => match row.legacy_token.as_deref() {
                Some(legacy) if parses(legacy) => CredentialState::Present,
                _ => CredentialState::Absent,
            },
        };
        Ok(state)
    }
}
