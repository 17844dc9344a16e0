//! MFA challenge tokens: the short-lived bridge between a successful
//! password step and a session.
//!
//! Tokens carry the `mfa_challenge_` prefix so logs and clients can tell
//! them apart from session credentials; the server still validates against
//! the stored hash before trusting anything. A challenge row accumulates the
//! verified-method set (required-both mode), the consecutive TOTP failure
//! counter (fallback mode), and is consumed exactly once.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row, Transaction};
use tracing::Instrument;

use crate::error::Result;
use crate::policy::MfaMethod;
use crate::token::{generate_opaque_token, hash_token};

pub(crate) const CHALLENGE_PREFIX: &str = "mfa_challenge_";
pub(crate) const CHALLENGE_TTL_SECONDS: i64 = 10 * 60;

/// One pending challenge.
#[derive(Debug, Clone)]
pub struct ChallengeRow {
    pub id: i64,
    pub user_id: i64,
    pub required_methods: Vec<MfaMethod>,
    pub verified_methods: Vec<MfaMethod>,
    pub totp_attempts: i32,
    pub email_fallback_engaged: bool,
    pub remember_me: bool,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ChallengeRow {
    /// Methods currently accepted: the required set, widened by email once
    /// fallback has engaged.
    #[must_use]
    pub fn allowed_methods(&self) -> Vec<MfaMethod> {
        let mut methods = self.required_methods.clone();
        if self.email_fallback_engaged && !methods.contains(&MfaMethod::Email) {
            methods.push(MfaMethod::Email);
        }
        methods
    }

    /// Whether the verified set covers the requirement. Fallback substitutes
    /// email for TOTP; a backup code substitutes for any single factor.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        if self.verified_methods.contains(&MfaMethod::BackupCode) {
            return true;
        }
        self.required_methods.iter().all(|required| {
            self.verified_methods.contains(required)
                || (self.email_fallback_engaged
                    && *required == MfaMethod::Totp
                    && self.verified_methods.contains(&MfaMethod::Email))
        })
    }

    /// Methods still missing for a partial response.
    #[must_use]
    pub fn pending_methods(&self) -> Vec<MfaMethod> {
        self.required_methods
            .iter()
            .copied()
            .filter(|required| !self.verified_methods.contains(required))
            .collect()
    }
}

fn parse_methods(values: &[String], column: &str) -> Result<Vec<MfaMethod>, sqlx::Error> {
    values
        .iter()
        .map(|value| {
            MfaMethod::parse(value).ok_or_else(|| {
                sqlx::Error::Decode(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid {column} value: {value}"),
                )))
            })
        })
        .collect()
}

impl<'r> FromRow<'r, PgRow> for ChallengeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let required: Vec<String> = row.try_get("required_methods")?;
        let verified: Vec<String> = row.try_get("verified_methods")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            required_methods: parse_methods(&required, "mfa_challenges.required_methods")?,
            verified_methods: parse_methods(&verified, "mfa_challenges.verified_methods")?,
            totp_attempts: row.try_get("totp_attempts")?,
            email_fallback_engaged: row.try_get("email_fallback_engaged")?,
            remember_me: row.try_get("remember_me")?,
            expires_at: row.try_get("expires_at")?,
            consumed_at: row.try_get("consumed_at")?,
        })
    }
}

/// Create a challenge bound to the user and required methods. Returns the
/// prefixed plaintext token; only its hash is stored.
pub async fn create(
    pool: &PgPool,
    user_id: i64,
    required_methods: &[MfaMethod],
    remember_me: bool,
) -> Result<(String, DateTime<Utc>)> {
    let token = format!("{CHALLENGE_PREFIX}{}", generate_opaque_token()?);
    let token_hash = hash_token(&token);
    let expires_at = Utc::now() + Duration::seconds(CHALLENGE_TTL_SECONDS);
    let methods: Vec<String> = required_methods
        .iter()
        .map(|m| m.as_str().to_string())
        .collect();

    let query = r"
        INSERT INTO mfa_challenges
            (user_id, token_hash, required_methods, remember_me, expires_at)
        VALUES ($1, $2, $3, $4, $5)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(token_hash)
        .bind(&methods)
        .bind(remember_me)
        .bind(expires_at)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to create mfa challenge")?;

    Ok((token, expires_at))
}

/// Resolve a presented token to its live challenge row, locked for update.
/// Expired or consumed challenges resolve to `None`.
pub async fn fetch_live_for_update(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    token: &str,
) -> Result<Option<ChallengeRow>> {
    let token_hash = hash_token(token);
    let query = r"
        SELECT id, user_id, required_methods, verified_methods, totp_attempts,
               email_fallback_engaged, remember_me, expires_at, consumed_at
        FROM mfa_challenges
        WHERE token_hash = $1
          AND consumed_at IS NULL
          AND expires_at > NOW()
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, ChallengeRow>(query)
        .bind(token_hash)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch mfa challenge")
        .map_err(Into::into)
}

/// Append a verified method to the challenge's set.
pub async fn record_method_verified(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    challenge_id: i64,
    method: MfaMethod,
) -> Result<()> {
    let query = r"
        UPDATE mfa_challenges
        SET verified_methods = array_append(verified_methods, $2),
            totp_attempts = 0
        WHERE id = $1
          AND NOT ($2 = ANY(verified_methods))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(challenge_id)
        .bind(method.as_str())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to record verified method")?;
    Ok(())
}

/// Bump the consecutive TOTP failure counter; returns the new value.
pub async fn increment_totp_attempts(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    challenge_id: i64,
) -> Result<i32> {
    let query = r"
        UPDATE mfa_challenges
        SET totp_attempts = totp_attempts + 1
        WHERE id = $1
        RETURNING totp_attempts
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(challenge_id)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to increment totp attempts")?;
    Ok(row.get("totp_attempts"))
}

/// Widen the challenge to accept email after the TOTP threshold.
pub async fn engage_email_fallback(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    challenge_id: i64,
) -> Result<()> {
    let query = r"
        UPDATE mfa_challenges
        SET email_fallback_engaged = TRUE
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(challenge_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to engage email fallback")?;
    Ok(())
}

/// Consume the challenge. Guarded on `consumed_at IS NULL` so a raced
/// duplicate verification loses.
pub async fn consume(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    challenge_id: i64,
) -> Result<bool> {
    let query = r"
        UPDATE mfa_challenges
        SET consumed_at = NOW()
        WHERE id = $1
          AND consumed_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(challenge_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to consume mfa challenge")?;
    Ok(result.rows_affected() > 0)
}

/// Drop expired and consumed challenges; run by maintenance.
pub async fn delete_stale(pool: &PgPool) -> Result<u64> {
    let query = r"
        DELETE FROM mfa_challenges
        WHERE expires_at <= NOW()
           OR consumed_at IS NOT NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete stale challenges")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(required: Vec<MfaMethod>, verified: Vec<MfaMethod>) -> ChallengeRow {
        ChallengeRow {
            id: 1,
            user_id: 42,
            required_methods: required,
            verified_methods: verified,
            totp_attempts: 0,
            email_fallback_engaged: false,
            remember_me: false,
            expires_at: Utc::now() + Duration::minutes(10),
            consumed_at: None,
        }
    }

    #[test]
    fn single_method_satisfied_when_verified() {
        let row = challenge(vec![MfaMethod::Totp], vec![MfaMethod::Totp]);
        assert!(row.is_satisfied());
        assert!(row.pending_methods().is_empty());
    }

    #[test]
    fn required_both_partial_until_both_verify() {
        let row = challenge(
            vec![MfaMethod::Totp, MfaMethod::Email],
            vec![MfaMethod::Totp],
        );
        assert!(!row.is_satisfied());
        assert_eq!(row.pending_methods(), vec![MfaMethod::Email]);

        let row = challenge(
            vec![MfaMethod::Totp, MfaMethod::Email],
            vec![MfaMethod::Totp, MfaMethod::Email],
        );
        assert!(row.is_satisfied());
    }

    #[test]
    fn backup_code_satisfies_any_requirement() {
        let row = challenge(
            vec![MfaMethod::Totp, MfaMethod::Email],
            vec![MfaMethod::BackupCode],
        );
        assert!(row.is_satisfied());
    }

    #[test]
    fn fallback_lets_email_stand_in_for_totp() {
        let mut row = challenge(vec![MfaMethod::Totp], vec![MfaMethod::Email]);
        assert!(!row.is_satisfied());
        row.email_fallback_engaged = true;
        assert!(row.is_satisfied());
    }

    #[test]
    fn fallback_widens_allowed_methods_once() {
        let mut row = challenge(vec![MfaMethod::Totp], vec![]);
        assert_eq!(row.allowed_methods(), vec![MfaMethod::Totp]);
        row.email_fallback_engaged = true;
        assert_eq!(
            row.allowed_methods(),
            vec![MfaMethod::Totp, MfaMethod::Email]
        );
        // Email already present: no duplicate.
        let mut row = challenge(vec![MfaMethod::Totp, MfaMethod::Email], vec![]);
        row.email_fallback_engaged = true;
        assert_eq!(
            row.allowed_methods(),
            vec![MfaMethod::Totp, MfaMethod::Email]
        );
    }
}
