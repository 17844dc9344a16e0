//! MFA enforcement: grace-period windows layered on top of policy
//! resolution.
//!
//! The decision is a pure function; the bulk grace-window assignment is a
//! single idempotent statement so rerunning it never shrinks an open window
//! and never touches users who already completed setup.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, Instrument};

use crate::error::{AuthError, Result};
use crate::policy::SystemMfaConfig;
use crate::users::User;

/// Enforcement verdict for one user at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementStatus {
    pub enforcement_enabled: bool,
    pub required: bool,
    pub is_exempt: bool,
    pub fully_configured: bool,
    pub setup_required: bool,
    pub grace_active: bool,
    pub days_remaining: Option<i64>,
    pub reason: &'static str,
}

impl EnforcementStatus {
    fn off() -> Self {
        Self {
            enforcement_enabled: false,
            required: false,
            is_exempt: false,
            fully_configured: false,
            setup_required: false,
            grace_active: false,
            days_remaining: None,
            reason: "enforcement_disabled",
        }
    }
}

/// Evaluate enforcement for a user.
///
/// `role_exempt` comes from the role config; `has_mfa_configured` means the
/// user satisfies the active mode (enabled TOTP or email 2FA as required).
#[must_use]
pub fn evaluate(
    system: &SystemMfaConfig,
    user: &User,
    role_exempt: bool,
    has_mfa_configured: bool,
    now: DateTime<Utc>,
) -> EnforcementStatus {
    if !system.enforcement_enabled {
        return EnforcementStatus::off();
    }

    if role_exempt {
        return EnforcementStatus {
            enforcement_enabled: true,
            required: false,
            is_exempt: true,
            fully_configured: has_mfa_configured,
            setup_required: false,
            grace_active: false,
            days_remaining: None,
            reason: "role_exempt",
        };
    }

    if has_mfa_configured {
        return EnforcementStatus {
            enforcement_enabled: true,
            required: true,
            is_exempt: false,
            fully_configured: true,
            setup_required: false,
            grace_active: false,
            days_remaining: None,
            reason: "fully_configured",
        };
    }

    match user.mfa_grace_end {
        Some(grace_end) if grace_end > now => {
            let days_remaining = (grace_end - now).num_days();
            EnforcementStatus {
                enforcement_enabled: true,
                required: true,
                is_exempt: false,
                fully_configured: false,
                setup_required: false,
                grace_active: true,
                days_remaining: Some(days_remaining),
                reason: "grace_period",
            }
        }
        _ => EnforcementStatus {
            enforcement_enabled: true,
            required: true,
            is_exempt: false,
            fully_configured: false,
            setup_required: true,
            grace_active: false,
            days_remaining: None,
            reason: "setup_required",
        },
    }
}

/// Open a grace window for every active user who still lacks MFA.
///
/// Skips role-exempt users and anyone who already has a window or finished
/// setup, which makes reruns no-ops for them. Returns the number of users
/// that received a window.
pub async fn apply_to_existing_users(pool: &PgPool, grace_days: i32) -> Result<u64> {
    let query = r"
        UPDATE users
        SET mfa_setup_required = TRUE,
            mfa_grace_start = NOW(),
            mfa_grace_end = NOW() + ($1 * INTERVAL '1 day'),
            updated_at = NOW()
        WHERE is_active = TRUE
          AND archived_at IS NULL
          AND anonymized_at IS NULL
          AND mfa_setup_completed_at IS NULL
          AND mfa_grace_start IS NULL
          AND role NOT IN (
              SELECT role FROM mfa_role_config WHERE exempt_from_enforcement
          )
          AND NOT EXISTS (
              SELECT 1 FROM mfa_secrets
              WHERE mfa_secrets.user_id = users.id AND mfa_secrets.enabled
          )
          AND NOT EXISTS (
              SELECT 1 FROM user_mfa_preferences
              WHERE user_mfa_preferences.user_id = users.id
                AND user_mfa_preferences.email_2fa_enabled
          )
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(grace_days)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to apply enforcement grace windows")?;

    info!(
        affected = result.rows_affected(),
        grace_days, "enforcement grace windows applied"
    );
    Ok(result.rows_affected())
}

/// Require setup immediately, with no grace window. Applied to new users
/// created while enforcement is active.
pub async fn mark_requires_setup(pool: &PgPool, user_id: i64) -> Result<()> {
    let query = r"
        UPDATE users
        SET mfa_setup_required = TRUE,
            mfa_grace_start = NULL,
            mfa_grace_end = NULL,
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
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark mfa setup required")?;
    Ok(())
}

/// Record completed setup: clears the requirement and the grace window.
pub async fn mark_completed(pool: &PgPool, user_id: i64) -> Result<()> {
    let query = r"
        UPDATE users
        SET mfa_setup_required = FALSE,
            mfa_setup_completed_at = NOW(),
            mfa_grace_start = NULL,
            mfa_grace_end = NULL,
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
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark mfa setup completed")?;
    Ok(())
}

/// Reopen the requirement for a user (administrative force transition).
pub async fn force_transition(pool: &PgPool, user_id: i64, grace_days: Option<i32>) -> Result<()> {
    let query = r"
        UPDATE users
        SET mfa_setup_required = TRUE,
            mfa_setup_completed_at = NULL,
            mfa_grace_start = CASE WHEN $2::int IS NULL THEN NULL ELSE NOW() END,
            mfa_grace_end = CASE WHEN $2::int IS NULL THEN NULL
                                 ELSE NOW() + ($2 * INTERVAL '1 day') END,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .bind(grace_days)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to force enforcement transition")?;
    if result.rows_affected() == 0 {
        return Err(AuthError::NotFound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::Role;
    use chrono::Duration;

    fn system(enabled: bool) -> SystemMfaConfig {
        SystemMfaConfig {
            enforcement_enabled: enabled,
            ..SystemMfaConfig::default()
        }
    }

    fn user(grace_end: Option<DateTime<Utc>>) -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: None,
            role: Role::User,
            is_active: true,
            email_verified: true,
            mfa_setup_required: grace_end.is_some(),
            mfa_grace_start: grace_end.map(|end| end - Duration::days(14)),
            mfa_grace_end: grace_end,
            mfa_setup_completed_at: None,
            archived_at: None,
            anonymized_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn disabled_enforcement_reports_off() {
        let status = evaluate(&system(false), &user(None), false, false, Utc::now());
        assert!(!status.enforcement_enabled);
        assert!(!status.required);
        assert!(!status.setup_required);
    }

    #[test]
    fn exempt_role_is_not_required() {
        let status = evaluate(&system(true), &user(None), true, false, Utc::now());
        assert!(status.enforcement_enabled);
        assert!(status.is_exempt);
        assert!(!status.required);
    }

    #[test]
    fn configured_user_is_compliant() {
        let status = evaluate(&system(true), &user(None), false, true, Utc::now());
        assert!(status.fully_configured);
        assert!(!status.setup_required);
        assert!(!status.grace_active);
    }

    #[test]
    fn open_grace_window_reports_days_remaining() {
        let now = Utc::now();
        let status = evaluate(
            &system(true),
            &user(Some(now + Duration::days(14))),
            false,
            false,
            now,
        );
        assert!(status.grace_active);
        assert!(!status.setup_required);
        assert_eq!(status.days_remaining, Some(14));
        assert_eq!(status.reason, "grace_period");
    }

    #[test]
    fn expired_grace_window_requires_setup() {
        let now = Utc::now();
        // Day 15 of a 14-day window.
        let status = evaluate(
            &system(true),
            &user(Some(now - Duration::days(1))),
            false,
            false,
            now,
        );
        assert!(status.setup_required);
        assert!(!status.grace_active);
        assert_eq!(status.reason, "setup_required");
    }

    #[test]
    fn missing_window_requires_setup_immediately() {
        let status = evaluate(&system(true), &user(None), false, false, Utc::now());
        assert!(status.setup_required);
        assert_eq!(status.days_remaining, None);
    }
}
