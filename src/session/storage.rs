//! Database helpers for session rows and trusted devices.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row, Transaction};
use tracing::Instrument;

use super::DeviceMeta;
use crate::error::{is_unique_violation, AuthError, Result};
use crate::token::hash_token;

/// Columns the manager needs to drive refresh and revocation.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: i64,
    pub active: bool,
    pub expires_at: DateTime<Utc>,
    pub absolute_expires_at: Option<DateTime<Utc>>,
    pub remember_me: bool,
}

impl<'r> FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            active: row.try_get("active")?,
            expires_at: row.try_get("expires_at")?,
            absolute_expires_at: row.try_get("absolute_expires_at")?,
            remember_me: row.try_get("remember_me")?,
        })
    }
}

/// Insert a session row. Retries on the astronomically unlikely hash
/// collision rather than surfacing it to the user.
#[allow(clippy::too_many_arguments)]
pub async fn insert_session(
    pool: &PgPool,
    user_id: i64,
    refresh_hash: &[u8],
    device: &DeviceMeta,
    expires_at: DateTime<Utc>,
    absolute_expires_at: Option<DateTime<Utc>>,
    remember_me: bool,
) -> Result<i64> {
    let query = r"
        INSERT INTO sessions
            (user_id, refresh_hash, device_fingerprint, browser, os,
             device_type, ip_address, location, expires_at,
             absolute_expires_at, remember_me)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
    ";
    for _ in 0..3 {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(refresh_hash)
            .bind(device.fingerprint.as_deref())
            .bind(device.browser.as_deref())
            .bind(device.os.as_deref())
            .bind(device.device_type.as_deref())
            .bind(device.ip.as_deref())
            .bind(device.location.as_deref())
            .bind(expires_at)
            .bind(absolute_expires_at)
            .bind(remember_me)
            .fetch_one(pool)
            .instrument(span)
            .await;

        match result {
            Ok(row) => return Ok(row.get("id")),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => {
                return Err(AuthError::Internal(
                    anyhow::Error::from(err).context("failed to insert session"),
                ))
            }
        }
    }
    Err(AuthError::Internal(anyhow!(
        "failed to insert session after retries"
    )))
}

/// Load the session holding this refresh hash, locked for update.
pub async fn fetch_session_for_update(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    refresh_hash: &[u8],
) -> Result<Option<SessionRow>> {
    let query = r"
        SELECT id, user_id, active, expires_at, absolute_expires_at, remember_me
        FROM sessions
        WHERE refresh_hash = $1
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, SessionRow>(query)
        .bind(refresh_hash)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch session")
        .map_err(Into::into)
}

/// Advance the sliding deadline and stamp activity.
pub async fn touch_session(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    session_id: i64,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let query = r"
        UPDATE sessions
        SET expires_at = $2,
            last_activity_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(expires_at)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to touch session")?;
    Ok(())
}

/// Revocation is monotonic: only ever sets `active = FALSE`.
pub async fn revoke_by_hash(pool: &PgPool, refresh_hash: &[u8]) -> Result<bool> {
    let query = r"
        UPDATE sessions
        SET active = FALSE,
            revoked_at = NOW()
        WHERE refresh_hash = $1
          AND active = TRUE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(refresh_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke session")?;
    Ok(result.rows_affected() > 0)
}

/// Revoke every active session for a user, inside the caller's transaction.
pub async fn revoke_all_for_user(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<u64> {
    let query = r"
        UPDATE sessions
        SET active = FALSE,
            revoked_at = NOW()
        WHERE user_id = $1
          AND active = TRUE
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
        .context("failed to revoke user sessions")?;
    Ok(result.rows_affected())
}

/// Register (or refresh) a trusted device for the user.
pub async fn upsert_trusted_device(
    pool: &PgPool,
    user_id: i64,
    fingerprint: &str,
    trust_days: i32,
) -> Result<()> {
    let fingerprint_hash = hash_token(fingerprint);
    let query = r"
        INSERT INTO trusted_devices (user_id, device_fingerprint_hash, trusted_until)
        VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 day'))
        ON CONFLICT (user_id, device_fingerprint_hash) DO UPDATE SET
            trusted_until = EXCLUDED.trusted_until
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(fingerprint_hash)
        .bind(trust_days)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to upsert trusted device")?;
    Ok(())
}

/// Whether the device is currently trusted for the user.
pub async fn is_device_trusted(pool: &PgPool, user_id: i64, fingerprint: &str) -> Result<bool> {
    let fingerprint_hash = hash_token(fingerprint);
    let query = r"
        SELECT 1 AS trusted
        FROM trusted_devices
        WHERE user_id = $1
          AND device_fingerprint_hash = $2
          AND trusted_until > NOW()
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(fingerprint_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to check trusted device")?;
    Ok(row.is_some())
}

/// Drop expired trust rows; run opportunistically by maintenance.
pub async fn delete_expired_trusted_devices(pool: &PgPool) -> Result<u64> {
    let query = "DELETE FROM trusted_devices WHERE trusted_until <= NOW()";
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
        .context("failed to delete expired trusted devices")?;
    Ok(result.rows_affected())
}
