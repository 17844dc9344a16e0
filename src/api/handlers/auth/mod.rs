//! Login, registration, MFA verification, and session endpoints.

pub mod mfa;
pub mod types;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;

use super::{transport_meta, ApiError, ApiResult};
use crate::api::email;
use crate::auth::{challenge, LoginOutcome, Orchestrator, VerifyMfaOutcome};
use crate::error::AuthError;
use crate::otp::IssuedOtp;
use crate::policy::{self, EffectiveOtpSettings, MfaMethod};
use crate::users::storage as user_storage;
use self::types::{
    LoginRequest, LogoutRequest, MfaFallbackResponse, MfaPartialResponse, MfaRequiredResponse,
    PasswordChangeRequest, PasswordResetConfirmRequest, PasswordResetRequest, RefreshRequest,
    RefreshResponse, RegisterRequest, RegisterResponse, ResendCodeRequest, ResendCodeResponse,
    SessionResponse, UserInfo, VerifyEmailRequest, VerifyMfaRequest,
};

fn method_names(methods: &[MfaMethod]) -> Vec<String> {
    methods.iter().map(|m| m.as_str().to_string()).collect()
}

/// Queue an OTP email; delivery failure never fails the request.
async fn enqueue_otp_email(pool: &PgPool, to_email: &str, otp: &IssuedOtp) {
    let payload = serde_json::json!({
        "code": &otp.code,
        "expires_at": otp.expires_at,
    });
    if let Err(err) = email::enqueue_pool(pool, to_email, email::TEMPLATE_OTP_CODE, &payload).await
    {
        warn!("failed to enqueue otp email: {err}");
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created", body = RegisterResponse),
        (status = 400, description = "Validation error"),
        (status = 409, description = "Email or username taken")
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let meta = transport_meta(&headers);
    let registration = orchestrator
        .register(&request.username, &request.email, &request.password, &meta)
        .await?;

    let payload = serde_json::json!({
        "username": &registration.username,
        "verification_token": &registration.verification_token,
    });
    if let Err(err) = email::enqueue_pool(
        &pool,
        &registration.email,
        email::TEMPLATE_VERIFY_EMAIL,
        &payload,
    )
    .await
    {
        warn!("failed to enqueue verification email: {err}");
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: registration.user_id,
            username: registration.username,
            email: registration.email,
        }),
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session issued or MFA challenge opened", body = SessionResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account disabled or MFA setup required")
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Response> {
    let meta = transport_meta(&headers);
    let outcome = orchestrator
        .login(&request.email, &request.password, request.remember_me, &meta)
        .await?;

    match outcome {
        LoginOutcome::Session { credentials, user } => Ok(Json(SessionResponse {
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token,
            token_type: "Bearer".to_string(),
            access_expires_at: credentials.access_expires_at,
            user: UserInfo::from(&user),
        })
        .into_response()),
        LoginOutcome::MfaChallenge {
            challenge_token,
            allowed_methods,
            expires_at,
            email_otp,
            user_email,
        } => {
            if let Some(otp) = email_otp {
                enqueue_otp_email(&pool, &user_email, &otp).await;
            }
            Ok(Json(MfaRequiredResponse {
                mfa_required: true,
                challenge_token,
                allowed_methods: method_names(&allowed_methods),
                expires_at,
            })
            .into_response())
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/verify",
    request_body = VerifyMfaRequest,
    responses(
        (status = 200, description = "Session issued, or partial progress", body = SessionResponse),
        (status = 401, description = "Invalid code or challenge"),
        (status = 423, description = "Locked out")
    ),
    tag = "auth"
)]
pub async fn verify_mfa(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<VerifyMfaRequest>,
) -> ApiResult<Response> {
    let Some(method) = MfaMethod::parse(&request.method) else {
        return Err(AuthError::InvalidInput(format!("unknown method: {}", request.method)).into());
    };

    let meta = transport_meta(&headers);
    let outcome = orchestrator
        .verify_mfa(
            &request.challenge_token,
            method,
            &request.code,
            request.trust_device,
            &meta,
        )
        .await?;

    match outcome {
        VerifyMfaOutcome::Complete { credentials, user } => Ok(Json(SessionResponse {
            access_token: credentials.access_token,
            refresh_token: credentials.refresh_token,
            token_type: "Bearer".to_string(),
            access_expires_at: credentials.access_expires_at,
            user: UserInfo::from(&user),
        })
        .into_response()),
        VerifyMfaOutcome::Partial { verified, pending } => Ok(Json(MfaPartialResponse {
            mfa_required: true,
            verified_methods: method_names(&verified),
            pending_methods: method_names(&pending),
        })
        .into_response()),
        VerifyMfaOutcome::FallbackEngaged {
            allowed_methods,
            email_otp,
            user_email,
        } => {
            if let Some(otp) = email_otp {
                enqueue_otp_email(&pool, &user_email, &otp).await;
            }
            Ok((
                StatusCode::UNAUTHORIZED,
                Json(MfaFallbackResponse {
                    mfa_required: true,
                    fallback_engaged: true,
                    allowed_methods: method_names(&allowed_methods),
                }),
            )
                .into_response())
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/mfa/resend",
    request_body = ResendCodeRequest,
    responses(
        (status = 200, description = "Code resent", body = ResendCodeResponse),
        (status = 429, description = "Rate limited or cooling down")
    ),
    tag = "auth"
)]
pub async fn resend_code(
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<ResendCodeRequest>,
) -> ApiResult<Response> {
    // The challenge token authenticates the resend; no session exists yet.
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    let Some(row) = challenge::fetch_live_for_update(&mut tx, &request.challenge_token).await?
    else {
        return Err(AuthError::InvalidCredentials.into());
    };
    tx.commit().await.map_err(AuthError::from)?;

    if !row.allowed_methods().contains(&MfaMethod::Email) {
        return Err(AuthError::NotAllowed.into());
    }

    let user = user_storage::fetch_user_by_id(&pool, row.user_id)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;
    let system = policy::fetch_system_config(&pool).await?;
    let role_config = policy::fetch_role_config(&pool, user.role).await?;
    let prefs = policy::fetch_user_preferences(&pool, user.id).await?;
    let settings = EffectiveOtpSettings::derive(&system, role_config.as_ref());

    let issued = orchestrator.otp().resend(user.id, &settings).await?;

    let to_email = if prefs.alternate_email_verified {
        prefs.alternate_email.clone().unwrap_or(user.email.clone())
    } else {
        user.email.clone()
    };
    enqueue_otp_email(&pool, &to_email, &issued).await;

    Ok(Json(ResendCodeResponse {
        expires_at: issued.expires_at,
        can_resend_at: issued.can_resend_at,
    })
    .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New access token", body = RefreshResponse),
        (status = 401, description = "Invalid or expired refresh token")
    ),
    tag = "auth"
)]
pub async fn refresh(
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Response> {
    let credentials = orchestrator.sessions().refresh(&request.refresh_token).await?;
    Ok(Json(RefreshResponse {
        access_token: credentials.access_token,
        token_type: "Bearer".to_string(),
        access_expires_at: credentials.access_expires_at,
        refresh_expires_at: credentials.refresh_expires_at,
    })
    .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session revoked")
    ),
    tag = "auth"
)]
pub async fn logout(
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<LogoutRequest>,
) -> ApiResult<Response> {
    // Idempotent: revoking an unknown token still returns 204.
    orchestrator.sessions().revoke(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified"),
        (status = 400, description = "Unknown or expired token")
    ),
    tag = "auth"
)]
pub async fn verify_email(
    pool: Extension<PgPool>,
    Json(request): Json<VerifyEmailRequest>,
) -> ApiResult<Response> {
    let token_hash = crate::token::hash_token(&request.token);
    if user_storage::consume_verification_token(&pool, &token_hash).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError(AuthError::InvalidInput(
            "invalid or expired verification token".to_string(),
        )))
    }
}

const RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[utoipa::path(
    post,
    path = "/v1/auth/password-reset/request",
    request_body = PasswordResetRequest,
    responses(
        (status = 204, description = "Reset email queued when the account exists")
    ),
    tag = "auth"
)]
pub async fn password_reset_request(
    pool: Extension<PgPool>,
    Json(request): Json<PasswordResetRequest>,
) -> ApiResult<Response> {
    // Always 204: the response must not reveal whether the account exists.
    let Some(user) = user_storage::fetch_user_by_email(&pool, &request.email).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    if !user.can_login() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let token = crate::token::generate_hex_token()?;
    let token_hash = crate::token::hash_token(&token);
    user_storage::set_reset_token(&pool, user.id, &token_hash, RESET_TOKEN_TTL_SECONDS).await?;

    let payload = serde_json::json!({ "reset_token": &token });
    if let Err(err) =
        email::enqueue_pool(&pool, &user.email, email::TEMPLATE_PASSWORD_RESET, &payload).await
    {
        warn!("failed to enqueue password reset email: {err}");
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/password-reset/confirm",
    request_body = PasswordResetConfirmRequest,
    responses(
        (status = 204, description = "Password replaced, all sessions revoked"),
        (status = 400, description = "Weak password or bad token")
    ),
    tag = "auth"
)]
pub async fn password_reset_confirm(
    pool: Extension<PgPool>,
    Json(request): Json<PasswordResetConfirmRequest>,
) -> ApiResult<Response> {
    let new_hash = crate::password::hash(&request.new_password, crate::password::HashCost::default())?;
    let token_hash = crate::token::hash_token(&request.token);

    // Token consumption, password swap, and session revocation commit
    // together.
    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    let Some(user_id) = user_storage::consume_reset_token(&mut tx, &token_hash, &new_hash).await?
    else {
        return Err(AuthError::InvalidInput("invalid or expired reset token".to_string()).into());
    };
    crate::session::storage::revoke_all_for_user(&mut tx, user_id).await?;
    crate::audit::record_security_event(
        &mut tx,
        user_id,
        "password_reset",
        crate::audit::Severity::Warning,
        serde_json::json!({}),
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[utoipa::path(
    post,
    path = "/v1/me/password",
    request_body = PasswordChangeRequest,
    responses(
        (status = 204, description = "Password changed"),
        (status = 401, description = "Current password wrong")
    ),
    tag = "auth"
)]
pub async fn change_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    orchestrator: Extension<Arc<Orchestrator>>,
    Json(request): Json<PasswordChangeRequest>,
) -> ApiResult<Response> {
    let user = super::require_user(&headers, orchestrator.sessions(), &pool).await?;

    let Some(digest) = user.password_hash.as_deref() else {
        return Err(AuthError::NotAllowed.into());
    };
    if !crate::password::verify(&request.current_password, digest) {
        return Err(AuthError::InvalidCredentials.into());
    }

    let new_hash = crate::password::hash(&request.new_password, crate::password::HashCost::default())?;
    user_storage::set_password_hash(&pool, user.id, &new_hash).await?;

    let mut tx = pool.begin().await.map_err(AuthError::from)?;
    crate::audit::record_security_event(
        &mut tx,
        user.id,
        "password_changed",
        crate::audit::Severity::Info,
        serde_json::json!({}),
    )
    .await?;
    tx.commit().await.map_err(AuthError::from)?;

    Ok(StatusCode::NO_CONTENT.into_response())
}
