//! RFC 6238 TOTP: enrollment, verification with ±1-step drift tolerance,
//! and replay prevention via the last successfully used step.
//!
//! Seeds are encrypted at rest with the process master key. The verify path
//! matches the presented code against each candidate step explicitly so the
//! *matched* step is known and can be persisted; `check_current`-style
//! helpers would lose that information.

use anyhow::{anyhow, Context};
use chrono::Utc;
use sqlx::{postgres::PgRow, FromRow, PgPool, Row, Transaction};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::Instrument;

use crate::error::{AuthError, Result};
use crate::token::{constant_time_eq, MasterKey};

const STEP_SECONDS: i64 = 30;
const DIGITS: usize = 6;
const SKEW_STEPS: i64 = 1;

/// Result of checking a code against the candidate steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotpCheck {
    /// Code matches a fresh step; record it as the new high-water mark.
    Valid { step: i64 },
    /// Code matches a step that was already consumed.
    Replayed,
    Invalid,
}

fn build_totp(secret: Vec<u8>, issuer: &str, account: &str) -> Result<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        1,
        STEP_SECONDS as u64,
        secret,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|err| AuthError::Internal(anyhow!("TOTP init: {err}")))
}

/// Check `code` against steps now-1, now, now+1, newest first. The matched
/// step must be strictly greater than `last_used_step`.
pub fn check_with_skew(
    secret: &[u8],
    code: &str,
    now_unix: i64,
    last_used_step: Option<i64>,
) -> Result<TotpCheck> {
    let totp = build_totp(secret.to_vec(), "identeco", "check")?;

    let mut matched_step = None;
    for offset in [SKEW_STEPS, 0, -SKEW_STEPS] {
        let ts = now_unix + offset * STEP_SECONDS;
        if ts < 0 {
            continue;
        }
        let candidate = totp.generate(ts as u64);
        // Constant-time per candidate; all three are always evaluated.
        if constant_time_eq(candidate.as_bytes(), code.as_bytes()) && matched_step.is_none() {
            matched_step = Some(ts / STEP_SECONDS);
        }
    }

    Ok(match matched_step {
        None => TotpCheck::Invalid,
        Some(step) => {
            if last_used_step.is_some_and(|last| step <= last) {
                TotpCheck::Replayed
            } else {
                TotpCheck::Valid { step }
            }
        }
    })
}

/// A stored TOTP secret row.
#[derive(Debug, Clone)]
pub struct TotpSecretRow {
    pub user_id: i64,
    pub secret_enc: String,
    pub enabled: bool,
    pub last_used_step: Option<i64>,
}

impl<'r> FromRow<'r, PgRow> for TotpSecretRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            user_id: row.try_get("user_id")?,
            secret_enc: row.try_get("secret_enc")?,
            enabled: row.try_get("enabled")?,
            last_used_step: row.try_get("last_used_step")?,
        })
    }
}

/// Values handed back to the user at enrollment start.
#[derive(Debug, Clone)]
pub struct TotpEnrollment {
    pub secret_base32: String,
    pub otpauth_uri: String,
}

/// TOTP engine over the shared pool and master key.
#[derive(Clone)]
pub struct TotpEngine {
    pool: PgPool,
    master_key: MasterKey,
    issuer: String,
}

impl TotpEngine {
    #[must_use]
    pub fn new(pool: PgPool, master_key: MasterKey, issuer: String) -> Self {
        Self {
            pool,
            master_key,
            issuer,
        }
    }

    /// Begin enrollment: generate a seed, store it encrypted and disabled,
    /// and hand the base32 + otpauth URI back for the authenticator app.
    ///
    /// # Errors
    /// Fails on seed generation, encryption, or storage errors.
    pub async fn enroll_begin(&self, user_id: i64, email: &str) -> Result<TotpEnrollment> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|err| AuthError::Internal(anyhow!("secret bytes: {err}")))?;

        let secret_enc = self.master_key.encrypt(&secret_bytes)?;

        let query = r"
            INSERT INTO mfa_secrets (user_id, secret_enc, enabled, last_used_step)
            VALUES ($1, $2, FALSE, NULL)
            ON CONFLICT (user_id) DO UPDATE SET
                secret_enc = EXCLUDED.secret_enc,
                enabled = FALSE,
                last_used_step = NULL,
                created_at = NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(&secret_enc)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store totp secret")?;

        let totp = build_totp(secret_bytes, &self.issuer, email)?;
        Ok(TotpEnrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_uri: totp.get_url(),
        })
    }

    /// Confirm enrollment with the first code; flips `enabled` only on a
    /// valid code, upholding the "enabled means verified" invariant.
    pub async fn enroll_confirm(&self, user_id: i64, code: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let Some(row) = Self::fetch_for_update(&mut tx, user_id).await? else {
            return Err(AuthError::NotFound);
        };

        if row.enabled {
            return Ok(true);
        }

        let secret = self.master_key.decrypt(&row.secret_enc)?;
        let check = check_with_skew(&secret, code, Utc::now().timestamp(), row.last_used_step)?;

        if let TotpCheck::Valid { step } = check {
            let query = r"
                UPDATE mfa_secrets
                SET enabled = TRUE,
                    last_used_step = $2
                WHERE user_id = $1
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(user_id)
                .bind(step)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to enable totp secret")?;
            tx.commit().await.map_err(AuthError::from)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Verify a code against the enabled secret. Returns `Ok(false)` for a
    /// wrong or replayed code; the caller owns failure accounting.
    pub async fn verify(&self, user_id: i64, code: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let Some(row) = Self::fetch_for_update(&mut tx, user_id).await? else {
            return Ok(false);
        };
        if !row.enabled {
            return Ok(false);
        }

        let secret = self.master_key.decrypt(&row.secret_enc)?;
        let check = check_with_skew(&secret, code, Utc::now().timestamp(), row.last_used_step)?;

        match check {
            TotpCheck::Valid { step } => {
                let query = r"
                    UPDATE mfa_secrets
                    SET last_used_step = $2
                    WHERE user_id = $1
                ";
                let span = tracing::info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(user_id)
                    .bind(step)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to record totp step")?;
                tx.commit().await.map_err(AuthError::from)?;
                Ok(true)
            }
            TotpCheck::Replayed | TotpCheck::Invalid => Ok(false),
        }
    }

    /// Whether the user has a setup-verified TOTP secret.
    pub async fn has_enabled(&self, user_id: i64) -> Result<bool> {
        let query = "SELECT enabled FROM mfa_secrets WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to check totp enrollment")?;
        Ok(row.is_some_and(|row| row.get::<bool, _>("enabled")))
    }

    /// Remove the user's secret entirely (disable TOTP).
    pub async fn remove(&self, user_id: i64) -> Result<bool> {
        let query = "DELETE FROM mfa_secrets WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to remove totp secret")?;
        Ok(result.rows_affected() > 0)
    }

    /// Row lock serializes verification so two requests cannot both consume
    /// the same step.
    async fn fetch_for_update(
        tx: &mut Transaction<'_, sqlx::Postgres>,
        user_id: i64,
    ) -> Result<Option<TotpSecretRow>> {
        let query = r"
            SELECT user_id, secret_enc, enabled, last_used_step
            FROM mfa_secrets
            WHERE user_id = $1
            FOR UPDATE
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_as::<_, TotpSecretRow>(query)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("failed to fetch totp secret")
            .map_err(Into::into)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn secret() -> Vec<u8> {
        Secret::generate_secret().to_bytes().unwrap()
    }

    fn code_at(secret: &[u8], ts: i64) -> String {
        build_totp(secret.to_vec(), "identeco", "test")
            .unwrap()
            .generate(ts as u64)
    }

    #[test]
    fn current_step_code_is_valid() {
        let secret = secret();
        let now = 1_700_000_000;
        let code = code_at(&secret, now);
        let check = check_with_skew(&secret, &code, now, None).unwrap();
        assert_eq!(
            check,
            TotpCheck::Valid {
                step: now / STEP_SECONDS
            }
        );
    }

    #[test]
    fn previous_and_next_steps_tolerated() {
        let secret = secret();
        let now = 1_700_000_000;

        let behind = code_at(&secret, now - STEP_SECONDS);
        assert!(matches!(
            check_with_skew(&secret, &behind, now, None).unwrap(),
            TotpCheck::Valid { .. }
        ));

        let ahead = code_at(&secret, now + STEP_SECONDS);
        assert!(matches!(
            check_with_skew(&secret, &ahead, now, None).unwrap(),
            TotpCheck::Valid { .. }
        ));
    }

    #[test]
    fn two_steps_of_drift_rejected() {
        let secret = secret();
        let now = 1_700_000_000;
        let stale = code_at(&secret, now - 2 * STEP_SECONDS);
        assert_eq!(
            check_with_skew(&secret, &stale, now, None).unwrap(),
            TotpCheck::Invalid
        );
    }

    #[test]
    fn same_step_replay_rejected() {
        let secret = secret();
        let now = 1_700_000_000;
        let code = code_at(&secret, now);

        let first = check_with_skew(&secret, &code, now, None).unwrap();
        let TotpCheck::Valid { step } = first else {
            panic!("expected valid, got {first:?}");
        };

        // Replaying the same code at the same step must fail.
        assert_eq!(
            check_with_skew(&secret, &code, now, Some(step)).unwrap(),
            TotpCheck::Replayed
        );
    }

    #[test]
    fn replay_guard_does_not_block_future_steps() {
        let secret = secret();
        let now = 1_700_000_000;
        let step = now / STEP_SECONDS;

        let next_ts = now + STEP_SECONDS;
        let next_code = code_at(&secret, next_ts);
        assert_eq!(
            check_with_skew(&secret, &next_code, next_ts, Some(step)).unwrap(),
            TotpCheck::Valid { step: step + 1 }
        );
    }

    #[test]
    fn wrong_code_invalid() {
        let secret = secret();
        let now = 1_700_000_000;
        assert_eq!(
            check_with_skew(&secret, "000000", now, None).unwrap(),
            TotpCheck::Invalid
        );
    }
}
