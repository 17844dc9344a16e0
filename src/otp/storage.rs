//! Database helpers for email OTP rows.
//!
//! Issuance, verification and resend all lock the user's newest code row
//! (`FOR UPDATE`) so concurrent requests for one user serialize and the
//! single-active-code invariant holds.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Row, Transaction};
use tracing::Instrument;

use crate::error::Result;

/// One `email_2fa_codes` row.
#[derive(Debug, Clone)]
pub struct StoredOtp {
    pub id: i64,
    pub user_id: i64,
    pub code_hash: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub admin_locked: bool,
    pub resend_count: i32,
    pub last_resend_at: Option<DateTime<Utc>>,
    pub used: bool,
}

impl<'r> FromRow<'r, PgRow> for StoredOtp {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            code_hash: row.try_get("code_hash")?,
            expires_at: row.try_get("expires_at")?,
            attempts: row.try_get("attempts")?,
            locked_until: row.try_get("locked_until")?,
            admin_locked: row.try_get("admin_locked")?,
            resend_count: row.try_get("resend_count")?,
            last_resend_at: row.try_get("last_resend_at")?,
            used: row.try_get("used")?,
        })
    }
}

const OTP_COLUMNS: &str = r"
    id, user_id, code_hash, expires_at, attempts, locked_until, admin_locked,
    resend_count, last_resend_at, used
";

/// Newest code row for the user (used or not), locked for update.
///
/// Lockout state must survive code invalidation, so callers inspect the
/// newest row regardless of `used`.
pub async fn latest_code_for_update(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<Option<StoredOtp>> {
    let query = format!(
        "SELECT {OTP_COLUMNS} FROM email_2fa_codes
         WHERE user_id = $1
         ORDER BY created_at DESC, id DESC
         LIMIT 1
         FOR UPDATE"
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, StoredOtp>(&query)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch latest otp code")
        .map_err(Into::into)
}

/// Invalidate every unused code the user still has.
pub async fn invalidate_unused(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<u64> {
    let query = r"
        UPDATE email_2fa_codes
        SET used = TRUE,
            used_at = NOW()
        WHERE user_id = $1
          AND used = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to invalidate unused otp codes")?;
    Ok(result.rows_affected())
}

/// Insert the newly issued code. `resend_count` carries over the counter
/// from the replaced code on resend, or zero on a fresh issue.
pub async fn insert_code(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
    code_hash: &[u8],
    expires_at: DateTime<Utc>,
    resend_count: i32,
    last_resend_at: Option<DateTime<Utc>>,
) -> Result<i64> {
    let query = r"
        INSERT INTO email_2fa_codes
            (user_id, code_hash, expires_at, resend_count, last_resend_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(code_hash)
        .bind(expires_at)
        .bind(resend_count)
        .bind(last_resend_at)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert otp code")?;
    Ok(row.get("id"))
}

pub async fn mark_used(tx: &mut Transaction<'_, sqlx::Postgres>, code_id: i64) -> Result<()> {
    let query = r"
        UPDATE email_2fa_codes
        SET used = TRUE,
            used_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(code_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to mark otp code used")?;
    Ok(())
}

/// Persist a failed attempt: the new counter and, once exhausted, the lock.
pub async fn record_failure(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    code_id: i64,
    attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    admin_locked: bool,
) -> Result<()> {
    let query = r"
        UPDATE email_2fa_codes
        SET attempts = $2,
            locked_until = $3,
            admin_locked = $4
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(code_id)
        .bind(attempts)
        .bind(locked_until)
        .bind(admin_locked)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to record otp failure")?;
    Ok(())
}

/// Administrative unlock: clears timed and admin locks on the user's codes.
pub async fn clear_locks(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<u64> {
    let query = r"
        UPDATE email_2fa_codes
        SET locked_until = NULL,
            admin_locked = FALSE,
            attempts = 0
        WHERE user_id = $1
          AND (locked_until IS NOT NULL OR admin_locked OR attempts > 0)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to clear otp locks")?;
    Ok(result.rows_affected())
}
