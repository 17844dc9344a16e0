//! Database helpers for user records.
//!
//! Email and username comparisons are case-insensitive; the stored values
//! keep their original casing.

use anyhow::Context;
use sqlx::{postgres::PgRow, FromRow, PgPool, Row, Transaction};
use tracing::Instrument;

use super::{Role, User, ANONYMIZED_PASSWORD_SENTINEL};
use crate::error::{is_unique_violation, AuthError, Result};

const USER_COLUMNS: &str = r"
    id, username, email, password_hash, role, is_active, email_verified,
    mfa_setup_required, mfa_grace_start, mfa_grace_end, mfa_setup_completed_at,
    archived_at, anonymized_at, created_at
";

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            role: Role::parse(&role).ok_or_else(|| {
                sqlx::Error::Decode(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid users.role value: {role}"),
                )))
            })?,
            is_active: row.try_get("is_active")?,
            email_verified: row.try_get("email_verified")?,
            mfa_setup_required: row.try_get("mfa_setup_required")?,
            mfa_grace_start: row.try_get("mfa_grace_start")?,
            mfa_grace_end: row.try_get("mfa_grace_end")?,
            mfa_setup_completed_at: row.try_get("mfa_setup_completed_at")?,
            archived_at: row.try_get("archived_at")?,
            anonymized_at: row.try_get("anonymized_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Look up a user by email, case-insensitively.
pub async fn fetch_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, User>(&query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch user by email")
        .map_err(AuthError::from)
}

pub async fn fetch_user_by_id(pool: &PgPool, user_id: i64) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, User>(&query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to fetch user by id")
        .map_err(AuthError::from)
}

/// Fetch a user with a row lock, serializing concurrent admin mutations.
pub async fn fetch_user_for_update(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    sqlx::query_as::<_, User>(&query)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to fetch user for update")
        .map_err(AuthError::from)
}

/// Insert a user together with the hash of their email-verification token.
///
/// Returns `Conflict` when the email or username is already taken
/// (case-insensitive unique indexes).
pub async fn insert_user(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    username: &str,
    email: &str,
    password_hash: &str,
    verification_token_hash: &[u8],
    verification_ttl_seconds: i64,
) -> Result<i64> {
    let query = r"
        INSERT INTO users
            (username, email, password_hash, verification_token_hash,
             verification_token_expires_at)
        VALUES ($1, $2, $3, $4, NOW() + ($5 * INTERVAL '1 second'))
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(verification_token_hash)
        .bind(verification_ttl_seconds)
        .fetch_one(&mut **tx)
        .instrument(span)
        .await;

    match row {
        Ok(row) => Ok(row.get("id")),
        Err(err) if is_unique_violation(&err) => Err(AuthError::Conflict),
        Err(err) => Err(AuthError::Internal(
            anyhow::Error::from(err).context("failed to insert user"),
        )),
    }
}

/// Consume an email-verification token: single-use and expiry-checked.
pub async fn consume_verification_token(pool: &PgPool, token_hash: &[u8]) -> Result<bool> {
    let query = r"
        UPDATE users
        SET email_verified = TRUE,
            verification_token_hash = NULL,
            verification_token_expires_at = NULL,
            updated_at = NOW()
        WHERE verification_token_hash = $1
          AND verification_token_expires_at > NOW()
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to consume verification token")?;
    Ok(row.is_some())
}

/// Store a password-reset token hash for the user.
pub async fn set_reset_token(
    pool: &PgPool,
    user_id: i64,
    token_hash: &[u8],
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET reset_token_hash = $2,
            reset_token_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(token_hash)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set reset token")?;
    Ok(())
}

/// Consume a reset token and install the new password hash, revoking the
/// token in the same statement. Returns the user id when the token was valid.
pub async fn consume_reset_token(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    token_hash: &[u8],
    new_password_hash: &str,
) -> Result<Option<i64>> {
    let query = r"
        UPDATE users
        SET password_hash = $2,
            reset_token_hash = NULL,
            reset_token_expires_at = NULL,
            updated_at = NOW()
        WHERE reset_token_hash = $1
          AND reset_token_expires_at > NOW()
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(new_password_hash)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to consume reset token")?;
    Ok(row.map(|row| row.get("id")))
}

pub async fn set_role(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
    role: Role,
) -> Result<()> {
    let query = "UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to set role")?;
    Ok(())
}

pub async fn set_active(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
    active: bool,
) -> Result<()> {
    let query = "UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(active)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to set active flag")?;
    Ok(())
}

pub async fn archive_user(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET is_active = FALSE,
            archived_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND archived_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to archive user")?;
    Ok(())
}

/// Scrub identifying content but keep the row. The username and email are
/// replaced with placeholders derived from the id so unique indexes hold.
pub async fn anonymize_user(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET username = 'anonymized_' || id,
            email = 'anonymized+' || id || '@invalid.local',
            password_hash = $2,
            is_active = FALSE,
            email_verified = FALSE,
            verification_token_hash = NULL,
            verification_token_expires_at = NULL,
            reset_token_hash = NULL,
            reset_token_expires_at = NULL,
            archived_at = COALESCE(archived_at, NOW()),
            anonymized_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
          AND anonymized_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(ANONYMIZED_PASSWORD_SENTINEL)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to anonymize user")?;
    Ok(())
}

/// Install a new password hash for an authenticated self-service change.
pub async fn set_password_hash(pool: &PgPool, user_id: i64, password_hash: &str) -> Result<()> {
    let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(password_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to set password hash")?;
    Ok(())
}
