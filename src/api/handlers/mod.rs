//! HTTP handlers: thin translation between DTOs and the core engines.

pub mod admin;
pub mod auth;
pub mod health;
pub mod security;

pub use self::health::health;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use sqlx::PgPool;
use tracing::error;

use crate::auth::TransportMeta;
use crate::error::AuthError;
use crate::session::SessionManager;
use crate::users::{storage as user_storage, Role, User};

/// Wrapper mapping core errors onto HTTP responses. Structured fields ride
/// along in the body; `INTERNAL` is the only kind that logs its cause.
pub(crate) struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(AuthError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AuthError::InvalidInput(_) | AuthError::NoCode | AuthError::ExpiredCode => {
                StatusCode::BAD_REQUEST
            }
            AuthError::InvalidCredentials
            | AuthError::MfaRequired
            | AuthError::InvalidCode { .. } => StatusCode::UNAUTHORIZED,
            AuthError::AccountDisabled
            | AuthError::EmailNotVerified
            | AuthError::MfaSetupRequired
            | AuthError::NotAllowed => StatusCode::FORBIDDEN,
            AuthError::LockedOut { .. } => StatusCode::LOCKED,
            AuthError::RateLimited | AuthError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::Conflict => StatusCode::CONFLICT,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        match &self.0 {
            AuthError::InvalidCode { remaining_attempts } => {
                body["remaining_attempts"] = json!(remaining_attempts);
            }
            AuthError::Cooldown { wait_seconds } => {
                body["wait_seconds"] = json!(wait_seconds);
            }
            AuthError::LockedOut { locked_until } => {
                body["locked_until"] = json!(locked_until);
            }
            AuthError::Internal(err) => {
                error!("internal error: {err:?}");
                body["message"] = json!("internal error");
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract a client IP from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Transport facts the orchestrator records on every attempt.
pub(crate) fn transport_meta(headers: &HeaderMap) -> TransportMeta {
    TransportMeta {
        ip: extract_client_ip(headers),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        device_fingerprint: headers
            .get("x-device-fingerprint")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        location: None,
    }
}

/// Resolve the bearer access token to an active user.
pub(crate) async fn require_user(
    headers: &HeaderMap,
    sessions: &SessionManager,
    pool: &PgPool,
) -> ApiResult<User> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(AuthError::InvalidCredentials.into());
    };
    let claims = sessions.validate_access(&token)?;
    let user_id: i64 = claims
        .sub
        .parse()
        .map_err(|_| ApiError(AuthError::InvalidCredentials))?;
    let user = user_storage::fetch_user_by_id(pool, user_id)
        .await?
        .filter(User::can_login)
        .ok_or(AuthError::InvalidCredentials)?;
    Ok(user)
}

/// Like [`require_user`], but demands at least the admin role.
pub(crate) async fn require_admin(
    headers: &HeaderMap,
    sessions: &SessionManager,
    pool: &PgPool,
) -> ApiResult<User> {
    let user = require_user(headers, sessions, pool).await?;
    if user.role < Role::Admin {
        return Err(AuthError::NotAllowed.into());
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction_trims_and_requires_value() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn transport_meta_collects_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_static("curl/8.0"),
        );
        headers.insert("x-device-fingerprint", HeaderValue::from_static("fp-1"));
        let meta = transport_meta(&headers);
        assert_eq!(meta.ip.as_deref(), Some("9.9.9.9"));
        assert_eq!(meta.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(meta.device_fingerprint.as_deref(), Some("fp-1"));
    }
}
