//! Self-service MFA management: TOTP enrollment, email 2FA, backup codes,
//! and the alternate delivery address.
//!
//! When the system runs `admin_controlled`, these mutations are refused and
//! only administrators may change a user's factors.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;
use utoipa::ToSchema;

use super::super::{require_user, transport_meta, ApiResult};
use crate::api::email;
use crate::audit::{self, Actor, AuditClass, Severity};
use crate::auth::{valid_email, Orchestrator};
use crate::enforcement;
use crate::error::AuthError;
use crate::otp::backup::{self, BackupCodeBatch};
use crate::policy::{self, SystemMfaConfig, UserControl};
use crate::users::User;

const ALTERNATE_EMAIL_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpEnrollStartResponse {
    pub secret: String,
    pub otpauth_uri: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TotpEnrollFinishRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct BackupCodesResponse {
    pub codes: Vec<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AlternateEmailRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct AlternateEmailVerifyRequest {
    pub token: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct MfaStatusResponse {
    pub mode: String,
    pub totp_enabled: bool,
    pub email_2fa_enabled: bool,
    pub backup_codes_remaining: u32,
    #[schema(value_type = Object)]
    pub enforcement: crate::enforcement::EnforcementStatus,
}

fn require_self_managed(system: &SystemMfaConfig) -> Result<(), AuthError> {
    if system.user_control == UserControl::AdminControlled {
        return Err(AuthError::NotAllowed);
    }
    Ok(())
}

async fn security_event(pool: &PgPool, user: &User, event_type: &str, severity: Severity) {
    let result = async {
        let mut tx = pool.begin().await?;
        audit::record_security_event(&mut tx, user.id, event_type, severity, serde_json::json!({}))
            .await?;
        tx.commit().await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    if let Err(err) = result {
        warn!("failed to record security event: {err}");
    }
}

async fn audit_self(
    pool: &PgPool,
    system: &SystemMfaConfig,
    user: &User,
    action: &str,
    headers: &HeaderMap,
) {
    let meta = transport_meta(headers);
    let record = audit::Record {
        actor: Actor::User { id: user.id },
        action,
        target_type: "user",
        target_id: Some(user.id),
        details: serde_json::json!({}),
        meta: &audit::RequestMeta {
            ip: meta.ip.as_deref(),
            user_agent: meta.user_agent.as_deref(),
        },
    };
    if let Err(err) =
        audit::append_pool(pool, system.logging_level, AuditClass::StateChange, &record).await
    {
        warn!("failed to append audit record: {err}");
    }
}

#[utoipa::path(
    post,
    path = "/v1/mfa/totp/enroll/start",
    responses(
        (status = 200, description = "Enrollment started", body = TotpEnrollStartResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin-controlled MFA")
    ),
    tag = "mfa"
)]
pub async fn totp_enroll_start(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    let enrollment = orchestrator.totp().enroll_begin(user.id, &user.email).await?;
    Ok(Json(TotpEnrollStartResponse {
        secret: enrollment.secret_base32,
        otpauth_uri: enrollment.otpauth_uri,
    })
    .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/totp/enroll/finish",
    request_body = TotpEnrollFinishRequest,
    responses(
        (status = 200, description = "TOTP enabled; backup codes returned", body = BackupCodesResponse),
        (status = 400, description = "Invalid code"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn totp_enroll_finish(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<TotpEnrollFinishRequest>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    if !orchestrator.totp().enroll_confirm(user.id, &request.code).await? {
        return Err(AuthError::InvalidCode {
            remaining_attempts: 0,
        }
        .into());
    }

    enforcement::mark_completed(&pool, user.id).await?;
    audit_self(&pool, &system, &user, "mfa_totp_enabled", &headers).await;
    security_event(&pool, &user, "mfa_totp_enabled", Severity::Info).await;

    // Backup codes accompany TOTP when the policy allows them.
    let codes = if system.backup_codes_for_totp {
        let batch = BackupCodeBatch::generate()?;
        backup::replace_batch(&pool, user.id, &batch).await?;
        batch.codes
    } else {
        Vec::new()
    };

    Ok(Json(BackupCodesResponse { codes }).into_response())
}

#[utoipa::path(
    delete,
    path = "/v1/mfa/totp",
    responses(
        (status = 204, description = "TOTP disabled"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Admin-controlled MFA")
    ),
    tag = "mfa"
)]
pub async fn totp_disable(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    if !orchestrator.totp().remove(user.id).await? {
        return Err(AuthError::NotFound.into());
    }
    audit_self(&pool, &system, &user, "mfa_totp_disabled", &headers).await;
    security_event(&pool, &user, "mfa_totp_disabled", Severity::Warning).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/email/enable",
    responses(
        (status = 200, description = "Email 2FA enabled; backup codes when the policy grants them", body = BackupCodesResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn email_2fa_enable(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    policy::set_email_2fa_enabled(&pool, user.id, true).await?;
    enforcement::mark_completed(&pool, user.id).await?;
    audit_self(&pool, &system, &user, "mfa_email_enabled", &headers).await;
    security_event(&pool, &user, "mfa_email_enabled", Severity::Info).await;

    let codes = if system.backup_codes_for_email {
        let batch = BackupCodeBatch::generate()?;
        backup::replace_batch(&pool, user.id, &batch).await?;
        batch.codes
    } else {
        Vec::new()
    };

    Ok(Json(BackupCodesResponse { codes }).into_response())
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct PreferredMethodRequest {
    /// `totp`, `email`, or null to clear.
    pub method: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/mfa/preferred-method",
    request_body = PreferredMethodRequest,
    responses(
        (status = 204, description = "Preference stored"),
        (status = 400, description = "Unknown method")
    ),
    tag = "mfa"
)]
pub async fn preferred_method_set(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<PreferredMethodRequest>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    let method = match request.method.as_deref() {
        None => None,
        Some(value) => Some(crate::policy::MfaMethod::parse(value).ok_or_else(|| {
            AuthError::InvalidInput(format!("unknown method: {value}"))
        })?),
    };

    policy::set_preferred_method(&pool, user.id, method).await?;
    audit_self(&pool, &system, &user, "mfa_preferred_method_set", &headers).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/email/disable",
    responses(
        (status = 204, description = "Email 2FA disabled"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn email_2fa_disable(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    policy::set_email_2fa_enabled(&pool, user.id, false).await?;
    audit_self(&pool, &system, &user, "mfa_email_disabled", &headers).await;
    security_event(&pool, &user, "mfa_email_disabled", Severity::Warning).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/backup-codes/regenerate",
    responses(
        (status = 200, description = "Fresh batch; previous codes are dead", body = BackupCodesResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn backup_codes_regenerate(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    let batch = BackupCodeBatch::generate()?;
    backup::replace_batch(&pool, user.id, &batch).await?;
    audit_self(&pool, &system, &user, "backup_codes_regenerated", &headers).await;
    security_event(&pool, &user, "backup_codes_regenerated", Severity::Info).await;
    Ok(Json(BackupCodesResponse { codes: batch.codes }).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/alternate-email",
    request_body = AlternateEmailRequest,
    responses(
        (status = 204, description = "Verification email queued"),
        (status = 400, description = "Invalid address"),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn alternate_email_set(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<AlternateEmailRequest>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    require_self_managed(&system)?;

    let email_normalized = request.email.trim().to_lowercase();
    if !valid_email(&email_normalized) {
        return Err(AuthError::InvalidInput("invalid email address".to_string()).into());
    }

    let token = crate::token::generate_hex_token()?;
    let token_hash = crate::token::hash_token(&token);
    policy::set_alternate_email(
        &pool,
        user.id,
        &email_normalized,
        &token_hash,
        ALTERNATE_EMAIL_TOKEN_TTL_SECONDS,
    )
    .await?;

    let payload = serde_json::json!({ "verification_token": token });
    if let Err(err) = email::enqueue_pool(
        &pool,
        &email_normalized,
        email::TEMPLATE_VERIFY_EMAIL,
        &payload,
    )
    .await
    {
        warn!("failed to enqueue alternate email verification: {err}");
    }

    audit_self(&pool, &system, &user, "alternate_email_set", &headers).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/mfa/alternate-email/verify",
    request_body = AlternateEmailVerifyRequest,
    responses(
        (status = 204, description = "Alternate email verified"),
        (status = 400, description = "Unknown or expired token")
    ),
    tag = "mfa"
)]
pub async fn alternate_email_verify(
    pool: Extension<PgPool>,
    Json(request): Json<AlternateEmailVerifyRequest>,
) -> ApiResult<Response> {
    let token_hash = crate::token::hash_token(&request.token);
    if policy::verify_alternate_email(&pool, &token_hash).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(AuthError::InvalidInput("invalid or expired verification token".to_string()).into())
    }
}

#[utoipa::path(
    get,
    path = "/v1/mfa/status",
    responses(
        (status = 200, description = "Current MFA state", body = MfaStatusResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn mfa_status(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
) -> ApiResult<Response> {
    let user = require_user(&headers, orchestrator.sessions(), &pool).await?;
    let system = policy::fetch_system_config(&pool).await?;
    let role_config = policy::fetch_role_config(&pool, user.role).await?;
    let prefs = policy::fetch_user_preferences(&pool, user.id).await?;
    let has_totp = orchestrator.totp().has_enabled(user.id).await?;
    let remaining = backup::remaining(&pool, user.id).await?;

    let status = enforcement::evaluate(
        &system,
        &user,
        role_config
            .as_ref()
            .is_some_and(|r| r.exempt_from_enforcement),
        has_totp || prefs.email_2fa_enabled,
        Utc::now(),
    );

    Ok(Json(MfaStatusResponse {
        mode: system.mode.as_str().to_string(),
        totp_enabled: has_totp,
        email_2fa_enabled: prefs.email_2fa_enabled,
        backup_codes_remaining: remaining,
        enforcement: status,
    })
    .into_response())
}
