//! Session manager: short-lived JWT access tokens plus opaque refresh
//! tokens with sliding and absolute expiry.
//!
//! The refresh token is the session handle: 32 random bytes whose SHA-256 is
//! the lookup key. Refresh advances the sliding deadline but never past the
//! absolute one; revocation flips `active` and is never undone.

pub mod storage;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::error::{AuthError, Result};
use crate::token::{generate_opaque_token, hash_token};
use crate::users::{Role, User};

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_ABSOLUTE_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Signing and lifetime configuration for session credentials.
#[derive(Clone)]
pub struct SessionConfig {
    jwt_secret: SecretString,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    absolute_ttl_seconds: i64,
    issuer: String,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("access_ttl_seconds", &self.access_ttl_seconds)
            .field("refresh_ttl_seconds", &self.refresh_ttl_seconds)
            .field("absolute_ttl_seconds", &self.absolute_ttl_seconds)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new(jwt_secret: SecretString) -> Self {
        Self {
            jwt_secret,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            absolute_ttl_seconds: DEFAULT_ABSOLUTE_TTL_SECONDS,
            issuer: "identeco".to_string(),
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_absolute_ttl_seconds(mut self, seconds: i64) -> Self {
        self.absolute_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.issuer = issuer;
        self
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }
}

/// Parse a lifetime like `900`, `15m`, `12h`, or `7d` into seconds.
pub fn parse_lifetime(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AuthError::InvalidInput("empty lifetime".to_string()));
    }
    let (number, unit) = match trimmed.chars().last() {
        Some(ch) if ch.is_ascii_alphabetic() => {
            let mut parts = trimmed.char_indices();
            let split = parts
                .next_back()
                .map(|(idx, _)| idx)
                .unwrap_or(trimmed.len());
            (&trimmed[..split], Some(ch.to_ascii_lowercase()))
        }
        _ => (trimmed, None),
    };
    let amount: i64 = number
        .parse()
        .map_err(|_| AuthError::InvalidInput(format!("invalid lifetime: {value}")))?;
    if amount <= 0 {
        return Err(AuthError::InvalidInput(format!(
            "lifetime must be positive: {value}"
        )));
    }
    let seconds = match unit {
        None | Some('s') => amount,
        Some('m') => amount * 60,
        Some('h') => amount * 60 * 60,
        Some('d') => amount * 24 * 60 * 60,
        Some(other) => {
            return Err(AuthError::InvalidInput(format!(
                "unknown lifetime unit: {other}"
            )))
        }
    };
    Ok(seconds)
}

/// JWT claims embedded in every access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: Role,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

fn issue_access_token(user: &User, config: &SessionConfig, now: DateTime<Utc>) -> Result<String> {
    let claims = AccessClaims {
        sub: user.id.to_string(),
        role: user.role,
        iss: config.issuer.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(config.access_ttl_seconds)).timestamp(),
        jti: uuid::Uuid::new_v4().to_string(),
    };
    let key = EncodingKey::from_secret(config.jwt_secret.expose_secret().as_bytes());
    jsonwebtoken::encode(&Header::default(), &claims, &key)
        .map_err(|err| AuthError::Internal(anyhow!("JWT encode: {err}")))
}

/// Validate an access token's signature, expiry, and issuer.
pub fn decode_access_token(token: &str, config: &SessionConfig) -> Result<AccessClaims> {
    let key = DecodingKey::from_secret(config.jwt_secret.expose_secret().as_bytes());
    let mut validation = Validation::default();
    validation.set_issuer(&[&config.issuer]);
    validation.set_required_spec_claims(&["sub", "exp", "iss"]);
    jsonwebtoken::decode::<AccessClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidCredentials)
}

/// Sliding expiry advance, capped by the absolute deadline when present.
#[must_use]
pub fn next_sliding_expiry(
    now: DateTime<Utc>,
    refresh_ttl_seconds: i64,
    absolute_expires_at: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let candidate = now + Duration::seconds(refresh_ttl_seconds);
    match absolute_expires_at {
        Some(absolute) if candidate > absolute => absolute,
        _ => candidate,
    }
}

/// Device facts recorded on the session row.
#[derive(Debug, Clone, Default)]
pub struct DeviceMeta {
    pub fingerprint: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub ip: Option<String>,
    pub location: Option<String>,
}

/// Credentials handed back after authentication or refresh.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionManager {
    pool: PgPool,
    config: SessionConfig,
}

impl SessionManager {
    #[must_use]
    pub fn new(pool: PgPool, config: SessionConfig) -> Self {
        Self { pool, config }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mint a session: access JWT plus a refresh token whose hash anchors
    /// the row. `remember_me` pins the immovable absolute deadline.
    pub async fn issue(
        &self,
        user: &User,
        device: &DeviceMeta,
        remember_me: bool,
    ) -> Result<SessionCredentials> {
        let now = Utc::now();
        let refresh_token = generate_opaque_token()?;
        let refresh_hash = hash_token(&refresh_token);
        let expires_at = now + Duration::seconds(self.config.refresh_ttl_seconds);
        let absolute_expires_at =
            remember_me.then(|| now + Duration::seconds(self.config.absolute_ttl_seconds));

        let session_id = storage::insert_session(
            &self.pool,
            user.id,
            &refresh_hash,
            device,
            expires_at,
            absolute_expires_at,
            remember_me,
        )
        .await?;

        let access_token = issue_access_token(user, &self.config, now)?;
        info!(user_id = user.id, session_id, "session issued");

        Ok(SessionCredentials {
            session_id,
            access_token,
            refresh_token,
            access_expires_at: now + Duration::seconds(self.config.access_ttl_seconds),
            refresh_expires_at: expires_at,
        })
    }

    /// Exchange a refresh token for a new access token, advancing the
    /// sliding deadline but never past the absolute one.
    pub async fn refresh(&self, refresh_token: &str) -> Result<SessionCredentials> {
        let now = Utc::now();
        let refresh_hash = hash_token(refresh_token);

        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let Some(session) = storage::fetch_session_for_update(&mut tx, &refresh_hash).await?
        else {
            return Err(AuthError::InvalidCredentials);
        };

        if !session.active || session.expires_at <= now {
            return Err(AuthError::InvalidCredentials);
        }
        if session
            .absolute_expires_at
            .is_some_and(|absolute| absolute <= now)
        {
            return Err(AuthError::InvalidCredentials);
        }

        let user = crate::users::storage::fetch_user_by_id(&self.pool, session.user_id)
            .await?
            .filter(User::can_login)
            .ok_or(AuthError::AccountDisabled)?;

        let next_expiry = next_sliding_expiry(
            now,
            self.config.refresh_ttl_seconds,
            session.absolute_expires_at,
        );
        storage::touch_session(&mut tx, session.id, next_expiry).await?;
        tx.commit().await.map_err(AuthError::from)?;

        let access_token = issue_access_token(&user, &self.config, now)?;
        Ok(SessionCredentials {
            session_id: session.id,
            access_token,
            refresh_token: refresh_token.to_string(),
            access_expires_at: now + Duration::seconds(self.config.access_ttl_seconds),
            refresh_expires_at: next_expiry,
        })
    }

    /// Revoke the session holding this refresh token. Idempotent.
    pub async fn revoke(&self, refresh_token: &str) -> Result<bool> {
        let refresh_hash = hash_token(refresh_token);
        storage::revoke_by_hash(&self.pool, &refresh_hash).await
    }

    /// Revoke every session a user holds (admin unlock / account actions).
    pub async fn revoke_all(&self, user_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let revoked = storage::revoke_all_for_user(&mut tx, user_id).await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(revoked)
    }

    /// Stateless access-token validation.
    pub fn validate_access(&self, token: &str) -> Result<AccessClaims> {
        decode_access_token(token, &self.config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new(SecretString::from("test-secret-test-secret-test-secr"))
    }

    fn user() -> User {
        User {
            id: 7,
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: None,
            role: Role::User,
            is_active: true,
            email_verified: true,
            mfa_setup_required: false,
            mfa_grace_start: None,
            mfa_grace_end: None,
            mfa_setup_completed_at: None,
            archived_at: None,
            anonymized_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn access_token_round_trips() {
        let config = config();
        let token = issue_access_token(&user(), &config, Utc::now()).unwrap();
        let claims = decode_access_token(&token, &config).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.iss, "identeco");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_access_token(&user(), &config(), Utc::now()).unwrap();
        let other = SessionConfig::new(SecretString::from("other-secret-other-secret-other-s"));
        assert!(decode_access_token(&token, &other).is_err());
    }

    #[test]
    fn expired_access_token_rejected() {
        let config = config();
        let issued_at = Utc::now() - Duration::seconds(config.access_ttl_seconds + 120);
        let token = issue_access_token(&user(), &config, issued_at).unwrap();
        assert!(decode_access_token(&token, &config).is_err());
    }

    #[test]
    fn token_ids_are_unique() {
        let config = config();
        let now = Utc::now();
        let first = issue_access_token(&user(), &config, now).unwrap();
        let second = issue_access_token(&user(), &config, now).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn sliding_expiry_capped_by_absolute() {
        let now = Utc::now();
        let absolute = now + Duration::hours(1);

        // Uncapped: full refresh TTL.
        let next = next_sliding_expiry(now, 7 * 24 * 3600, None);
        assert_eq!(next, now + Duration::days(7));

        // Capped: never beyond the absolute deadline.
        let next = next_sliding_expiry(now, 7 * 24 * 3600, Some(absolute));
        assert_eq!(next, absolute);

        // Under the cap the full TTL applies.
        let far_absolute = now + Duration::days(30);
        let next = next_sliding_expiry(now, 3600, Some(far_absolute));
        assert_eq!(next, now + Duration::hours(1));
    }

    #[test]
    fn parse_lifetime_units() {
        assert_eq!(parse_lifetime("900").unwrap(), 900);
        assert_eq!(parse_lifetime("900s").unwrap(), 900);
        assert_eq!(parse_lifetime("15m").unwrap(), 900);
        assert_eq!(parse_lifetime("12h").unwrap(), 43_200);
        assert_eq!(parse_lifetime("7d").unwrap(), 604_800);
    }

    #[test]
    fn parse_lifetime_rejects_garbage() {
        assert!(parse_lifetime("").is_err());
        assert!(parse_lifetime("-5m").is_err());
        assert!(parse_lifetime("5w").is_err());
        assert!(parse_lifetime("abc").is_err());
    }
}
