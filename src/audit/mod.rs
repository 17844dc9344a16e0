//! Append-only audit trail: `audit_logs`, `security_events`, and
//! `login_attempts`.
//!
//! Audit writes take the caller's transaction so the record commits with the
//! action it describes. The configured logging level decides which classes
//! are persisted; filtering happens here so call sites stay unconditional.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, PgPool, Row, Transaction};
use tracing::Instrument;

use crate::error::{AuthError, Result};
use crate::policy::LoggingLevel;

/// Who performed the action.
#[derive(Debug, Clone)]
pub enum Actor {
    Admin { id: i64, email: String },
    User { id: i64 },
    System,
}

impl Actor {
    fn admin_id(&self) -> Option<i64> {
        match self {
            Self::Admin { id, .. } | Self::User { id } => Some(*id),
            Self::System => None,
        }
    }

    fn admin_email(&self) -> Option<&str> {
        match self {
            Self::Admin { email, .. } => Some(email),
            _ => None,
        }
    }
}

/// Classification used by the level filter: `security_only` keeps failures
/// and state changes, `comprehensive` keeps everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditClass {
    StateChange,
    SecurityFailure,
    Informational,
}

impl AuditClass {
    #[must_use]
    pub fn recorded_at(self, level: LoggingLevel) -> bool {
        match level {
            LoggingLevel::Comprehensive => true,
            LoggingLevel::SecurityOnly => {
                matches!(self, Self::StateChange | Self::SecurityFailure)
            }
            LoggingLevel::None => false,
        }
    }
}

/// Transport facts attached to every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMeta<'a> {
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// One audit record, borrowed from the call site.
#[derive(Debug)]
pub struct Record<'a> {
    pub actor: Actor,
    pub action: &'a str,
    pub target_type: &'a str,
    pub target_id: Option<i64>,
    pub details: serde_json::Value,
    pub meta: &'a RequestMeta<'a>,
}

/// Append a record inside the caller's transaction, subject to the level.
pub async fn append(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    level: LoggingLevel,
    class: AuditClass,
    record: &Record<'_>,
) -> Result<()> {
    if !class.recorded_at(level) {
        return Ok(());
    }

    let query = r"
        INSERT INTO audit_logs
            (admin_id, admin_email, action, target_type, target_id, details,
             ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7, $8)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let details =
        serde_json::to_string(&record.details).context("failed to serialize audit details")?;
    sqlx::query(query)
        .bind(record.actor.admin_id())
        .bind(record.actor.admin_email())
        .bind(record.action)
        .bind(record.target_type)
        .bind(record.target_id)
        .bind(details)
        .bind(record.meta.ip)
        .bind(record.meta.user_agent)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to append audit log")?;
    Ok(())
}

/// Convenience wrapper for call sites that have no open transaction.
pub async fn append_pool(
    pool: &PgPool,
    level: LoggingLevel,
    class: AuditClass,
    record: &Record<'_>,
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    append(&mut tx, level, class, record).await?;
    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

/// Delete audit rows older than the retention window.
pub async fn delete_older_than(pool: &PgPool, days: i32) -> Result<u64> {
    let query = r"
        DELETE FROM audit_logs
        WHERE created_at < NOW() - ($1 * INTERVAL '1 day')
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(days)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete expired audit logs")?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    fn from_db(value: &str) -> Result<Self, sqlx::Error> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid security_events.severity value: {other}"),
            )))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: i64,
    pub user_id: i64,
    pub event_type: String,
    pub severity: Severity,
    pub metadata: serde_json::Value,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SecurityEvent {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let severity: String = row.try_get("severity")?;
        let metadata: String = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            severity: Severity::from_db(&severity)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            acknowledged: row.try_get("acknowledged")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Record a security-relevant event for a user.
pub async fn record_security_event(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    user_id: i64,
    event_type: &str,
    severity: Severity,
    metadata: serde_json::Value,
) -> Result<()> {
    let query = r"
        INSERT INTO security_events (user_id, event_type, severity, metadata)
        VALUES ($1, $2, $3, $4::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let metadata =
        serde_json::to_string(&metadata).context("failed to serialize event metadata")?;
    sqlx::query(query)
        .bind(user_id)
        .bind(event_type)
        .bind(severity.as_str())
        .bind(metadata)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to record security event")?;
    Ok(())
}

/// List a user's security events, newest first.
pub async fn list_security_events(
    pool: &PgPool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<SecurityEvent>> {
    let query = r"
        SELECT id, user_id, event_type, severity, metadata::text AS metadata,
               acknowledged, acknowledged_at, created_at
        FROM security_events
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, SecurityEvent>(query)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list security events")
        .map_err(AuthError::from)
}

/// Acknowledge events by id. Acknowledgement is the only permitted mutation
/// and only applies to the given user's own events.
pub async fn acknowledge_security_events(
    pool: &PgPool,
    user_id: i64,
    event_ids: &[i64],
) -> Result<u64> {
    let query = r"
        UPDATE security_events
        SET acknowledged = TRUE,
            acknowledged_at = NOW()
        WHERE user_id = $1
          AND id = ANY($2)
          AND acknowledged = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .bind(event_ids)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to acknowledge security events")?;
    Ok(result.rows_affected())
}

/// One row per login attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct LoginAttempt {
    pub id: i64,
    pub user_id: Option<i64>,
    pub email_attempted: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub ip_address: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub location: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LoginAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            email_attempted: row.try_get("email_attempted")?,
            success: row.try_get("success")?,
            failure_reason: row.try_get("failure_reason")?,
            ip_address: row.try_get("ip_address")?,
            browser: row.try_get("browser")?,
            os: row.try_get("os")?,
            device_type: row.try_get("device_type")?,
            location: row.try_get("location")?,
            attempted_at: row.try_get("attempted_at")?,
        })
    }
}

/// Fields captured when recording a login attempt.
#[derive(Debug, Clone, Default)]
pub struct NewLoginAttempt<'a> {
    pub user_id: Option<i64>,
    pub email_attempted: &'a str,
    pub success: bool,
    pub failure_reason: Option<&'a str>,
    pub ip: Option<&'a str>,
    pub browser: Option<&'a str>,
    pub os: Option<&'a str>,
    pub device_type: Option<&'a str>,
    pub location: Option<&'a str>,
}

/// Append a login attempt. Runs outside the login transaction on purpose:
/// the attempt row must survive even when the login itself errors.
pub async fn record_login_attempt(pool: &PgPool, attempt: &NewLoginAttempt<'_>) -> Result<()> {
    let query = r"
        INSERT INTO login_attempts
            (user_id, email_attempted, success, failure_reason, ip_address,
             browser, os, device_type, location)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(attempt.user_id)
        .bind(attempt.email_attempted)
        .bind(attempt.success)
        .bind(attempt.failure_reason)
        .bind(attempt.ip)
        .bind(attempt.browser)
        .bind(attempt.os)
        .bind(attempt.device_type)
        .bind(attempt.location)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record login attempt")?;
    Ok(())
}

/// List a user's login attempts, newest first.
pub async fn list_login_attempts(
    pool: &PgPool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<LoginAttempt>> {
    let query = r"
        SELECT id, user_id, email_attempted, success, failure_reason,
               ip_address, browser, os, device_type, location, attempted_at
        FROM login_attempts
        WHERE user_id = $1
        ORDER BY attempted_at DESC
        LIMIT $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    sqlx::query_as::<_, LoginAttempt>(query)
        .bind(user_id)
        .bind(limit)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list login attempts")
        .map_err(AuthError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comprehensive_records_everything() {
        for class in [
            AuditClass::StateChange,
            AuditClass::SecurityFailure,
            AuditClass::Informational,
        ] {
            assert!(class.recorded_at(LoggingLevel::Comprehensive));
        }
    }

    #[test]
    fn security_only_drops_informational() {
        assert!(AuditClass::StateChange.recorded_at(LoggingLevel::SecurityOnly));
        assert!(AuditClass::SecurityFailure.recorded_at(LoggingLevel::SecurityOnly));
        assert!(!AuditClass::Informational.recorded_at(LoggingLevel::SecurityOnly));
    }

    #[test]
    fn none_records_nothing() {
        for class in [
            AuditClass::StateChange,
            AuditClass::SecurityFailure,
            AuditClass::Informational,
        ] {
            assert!(!class.recorded_at(LoggingLevel::None));
        }
    }

    #[test]
    fn actor_columns() {
        let admin = Actor::Admin {
            id: 7,
            email: "root@x.com".to_string(),
        };
        assert_eq!(admin.admin_id(), Some(7));
        assert_eq!(admin.admin_email(), Some("root@x.com"));

        let user = Actor::User { id: 9 };
        assert_eq!(user.admin_id(), Some(9));
        assert_eq!(user.admin_email(), None);

        assert_eq!(Actor::System.admin_id(), None);
    }

    #[test]
    fn severity_round_trips() {
        for severity in [Severity::Info, Severity::Warning, Severity::Critical] {
            assert_eq!(Severity::from_db(severity.as_str()).unwrap(), severity);
        }
        assert!(Severity::from_db("fatal").is_err());
    }
}
