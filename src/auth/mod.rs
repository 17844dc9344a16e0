//! Authentication orchestrator: password login, the MFA challenge protocol,
//! and registration.
//!
//! Flow Overview:
//! 1) `login` verifies the password, asks policy + enforcement whether a
//!    second factor is due, and either mints a session or opens a challenge.
//! 2) `verify_mfa` drives the challenge: each passing method joins the
//!    verified set; the session is issued once the set covers the
//!    requirement, and the challenge token dies with it.
//! 3) In fallback mode, consecutive TOTP failures within one challenge widen
//!    it to accept email; the switch is audited.
//!
//! Security boundaries:
//! - A login attempt row is written for every call, success or not.
//! - Password verification runs against a dummy digest when the account does
//!   not exist, keeping timing uniform.
//! - Challenge tokens are single-use and expire after ten minutes.

pub mod challenge;
pub mod ua;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::audit::{self, Actor, AuditClass, NewLoginAttempt, RequestMeta, Severity};
use crate::enforcement;
use crate::error::{AuthError, Result};
use crate::otp::{totp::TotpEngine, IssuedOtp, OtpEngine};
use crate::password;
use crate::policy::{
    self, EffectiveOtpSettings, MfaMethod, MfaMode, SystemMfaConfig, UserMfaPreferences,
};
use crate::session::{DeviceMeta, SessionCredentials, SessionManager};
use crate::token;
use crate::users::{storage as user_storage, User};
use self::challenge::ChallengeRow;

/// Transport facts delivered by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct TransportMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub location: Option<String>,
}

impl TransportMeta {
    fn device_meta(&self) -> DeviceMeta {
        let parsed = ua::parse(self.user_agent.as_deref());
        DeviceMeta {
            fingerprint: self.device_fingerprint.clone(),
            browser: parsed.browser,
            os: parsed.os,
            device_type: parsed.device_type,
            ip: self.ip.clone(),
            location: self.location.clone(),
        }
    }

    fn request_meta(&self) -> RequestMeta<'_> {
        RequestMeta {
            ip: self.ip.as_deref(),
            user_agent: self.user_agent.as_deref(),
        }
    }
}

/// Outcome of the password step.
#[derive(Debug)]
pub enum LoginOutcome {
    /// No MFA due: full credentials.
    Session {
        credentials: SessionCredentials,
        user: User,
    },
    /// MFA due: a challenge was opened. `email_otp` carries the plaintext
    /// for the external transport when an email code was issued.
    MfaChallenge {
        challenge_token: String,
        allowed_methods: Vec<MfaMethod>,
        expires_at: DateTime<Utc>,
        email_otp: Option<IssuedOtp>,
        user_email: String,
    },
}

/// Outcome of one verification step against a challenge.
#[derive(Debug)]
pub enum VerifyMfaOutcome {
    /// Requirement covered: session issued, challenge consumed.
    Complete {
        credentials: SessionCredentials,
        user: User,
    },
    /// One of several required methods passed; more remain.
    Partial {
        verified: Vec<MfaMethod>,
        pending: Vec<MfaMethod>,
    },
    /// TOTP failures crossed the fallback threshold: email is now allowed
    /// on this same challenge. Carries the issued code for delivery.
    FallbackEngaged {
        allowed_methods: Vec<MfaMethod>,
        email_otp: Option<IssuedOtp>,
        user_email: String,
    },
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub user_id: i64,
    pub email: String,
    pub username: String,
    /// Hex verification token for the external email transport.
    pub verification_token: String,
}

const VERIFICATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

/// A throwaway Argon2id digest of an unguessable value; verifying against it
/// costs the same as a real mismatch.
const DUMMY_DIGEST: &str = "$argon2id$v=19$m=19456,t=2,p=1$\
    c29tZXNhbHRzb21lc2FsdA$RdescudvJCsgt3ub+b+dWRWJTmaaJObG";

#[derive(Clone)]
pub struct Orchestrator {
    pool: PgPool,
    sessions: SessionManager,
    otp: OtpEngine,
    totp: TotpEngine,
}

impl Orchestrator {
    #[must_use]
    pub fn new(pool: PgPool, sessions: SessionManager, otp: OtpEngine, totp: TotpEngine) -> Self {
        Self {
            pool,
            sessions,
            otp,
            totp,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn otp(&self) -> &OtpEngine {
        &self.otp
    }

    #[must_use]
    pub fn totp(&self) -> &TotpEngine {
        &self.totp
    }

    /// Password + MFA login entry point.
    pub async fn login(
        &self,
        email: &str,
        password_input: &str,
        remember_me: bool,
        transport: &TransportMeta,
    ) -> Result<LoginOutcome> {
        let system = policy::fetch_system_config(&self.pool).await?;
        let user = user_storage::fetch_user_by_email(&self.pool, email).await?;

        let Some(user) = user else {
            // Burn the same hashing cost as a real mismatch.
            let _ = password::verify(password_input, DUMMY_DIGEST);
            self.record_attempt(None, email, false, Some("INVALID_CREDENTIALS"), transport)
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        if !user.can_login() {
            self.record_attempt(
                Some(user.id),
                email,
                false,
                Some("ACCOUNT_DISABLED"),
                transport,
            )
            .await;
            return Err(AuthError::AccountDisabled);
        }

        let digest = user.password_hash.as_deref().unwrap_or(DUMMY_DIGEST);
        if !password::verify(password_input, digest) {
            self.record_attempt(
                Some(user.id),
                email,
                false,
                Some("INVALID_CREDENTIALS"),
                transport,
            )
            .await;
            return Err(AuthError::InvalidCredentials);
        }

        let role_config = policy::fetch_role_config(&self.pool, user.role).await?;
        let prefs = policy::fetch_user_preferences(&self.pool, user.id).await?;
        let has_totp = self.totp.has_enabled(user.id).await?;
        let has_configured = has_totp || prefs.email_2fa_enabled;

        let status = enforcement::evaluate(
            &system,
            &user,
            role_config
                .as_ref()
                .is_some_and(|r| r.exempt_from_enforcement),
            has_configured,
            Utc::now(),
        );
        if status.setup_required {
            self.record_attempt(
                Some(user.id),
                email,
                false,
                Some("MFA_SETUP_REQUIRED"),
                transport,
            )
            .await;
            return Err(AuthError::MfaSetupRequired);
        }

        let requirement = policy::resolve(
            &system,
            role_config.as_ref(),
            Some(&prefs),
            has_totp,
            prefs.email_2fa_enabled,
        );

        if !requirement.required {
            return self
                .issue_session_after_login(&system, user, email, remember_me, transport)
                .await;
        }

        // A valid trusted device stands in for the second factor.
        if system.device_trust_enabled {
            if let Some(fingerprint) = transport.device_fingerprint.as_deref() {
                if crate::session::storage::is_device_trusted(&self.pool, user.id, fingerprint)
                    .await?
                {
                    info!(user_id = user.id, "mfa suppressed by trusted device");
                    self.security_event(
                        user.id,
                        "mfa_suppressed_trusted_device",
                        Severity::Info,
                        serde_json::json!({}),
                    )
                    .await;
                    return self
                        .issue_session_after_login(&system, user, email, remember_me, transport)
                        .await;
                }
            }
        }

        let (challenge_token, expires_at) =
            challenge::create(&self.pool, user.id, &requirement.methods, remember_me).await?;

        // Issue an email code up front when email is among the duties and no
        // usable code is already outstanding.
        let mut email_otp = None;
        if requirement.allows(MfaMethod::Email) && !self.otp.active_code_exists(user.id).await? {
            let settings = EffectiveOtpSettings::derive(&system, role_config.as_ref());
            email_otp = Some(self.otp.issue(user.id, &settings).await?);
        }

        self.record_attempt(Some(user.id), email, false, Some("MFA_REQUIRED"), transport)
            .await;
        self.audit_security(
            &system,
            user.id,
            "mfa_challenge_issued",
            AuditClass::Informational,
            serde_json::json!({ "methods": &requirement.methods }),
            transport,
        )
        .await;

        Ok(LoginOutcome::MfaChallenge {
            challenge_token,
            allowed_methods: requirement.methods,
            expires_at,
            email_otp,
            user_email: otp_delivery_email(&user, &prefs),
        })
    }

    /// Verify one factor against a live challenge.
    pub async fn verify_mfa(
        &self,
        challenge_token: &str,
        method: MfaMethod,
        code: &str,
        trust_device: bool,
        transport: &TransportMeta,
    ) -> Result<VerifyMfaOutcome> {
        let system = policy::fetch_system_config(&self.pool).await?;

        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let Some(row) = challenge::fetch_live_for_update(&mut tx, challenge_token).await? else {
            return Err(AuthError::InvalidCredentials);
        };
        tx.commit().await.map_err(AuthError::from)?;

        if !row.allowed_methods().contains(&method) && method != MfaMethod::BackupCode {
            return Err(AuthError::NotAllowed);
        }

        let user = user_storage::fetch_user_by_id(&self.pool, row.user_id)
            .await?
            .filter(User::can_login)
            .ok_or(AuthError::AccountDisabled)?;

        let role_config = policy::fetch_role_config(&self.pool, user.role).await?;
        let settings = EffectiveOtpSettings::derive(&system, role_config.as_ref());

        match method {
            MfaMethod::Totp => {
                self.verify_totp_step(&system, &row, &user, code, trust_device, transport)
                    .await
            }
            MfaMethod::Email => {
                self.otp.verify(user.id, code, &settings).await?;
                self.complete_method(&system, &row, &user, MfaMethod::Email, trust_device, transport)
                    .await
            }
            MfaMethod::BackupCode => {
                let Some(remaining) = crate::otp::backup::consume(&self.pool, user.id, code).await?
                else {
                    self.audit_security(
                        &system,
                        user.id,
                        "backup_code_rejected",
                        AuditClass::SecurityFailure,
                        serde_json::json!({}),
                        transport,
                    )
                    .await;
                    return Err(AuthError::InvalidCode {
                        remaining_attempts: 0,
                    });
                };
                self.security_event(
                    user.id,
                    "backup_code_used",
                    Severity::Warning,
                    serde_json::json!({ "remaining": remaining }),
                )
                .await;
                self.complete_method(
                    &system,
                    &row,
                    &user,
                    MfaMethod::BackupCode,
                    trust_device,
                    transport,
                )
                .await
            }
        }
    }

    async fn verify_totp_step(
        &self,
        system: &SystemMfaConfig,
        row: &ChallengeRow,
        user: &User,
        code: &str,
        trust_device: bool,
        transport: &TransportMeta,
    ) -> Result<VerifyMfaOutcome> {
        if self.totp.verify(user.id, code).await? {
            return self
                .complete_method(system, row, user, MfaMethod::Totp, trust_device, transport)
                .await;
        }

        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let attempts = challenge::increment_totp_attempts(&mut tx, row.id).await?;

        let fallback_due = system.mode == MfaMode::TotpEmailFallback
            && !row.email_fallback_engaged
            && attempts >= system.fallback_totp_attempts;

        if fallback_due {
            challenge::engage_email_fallback(&mut tx, row.id).await?;
            audit::append(
                &mut tx,
                system.logging_level,
                AuditClass::StateChange,
                &audit::Record {
                    actor: Actor::User { id: user.id },
                    action: "mfa_fallback_engaged",
                    target_type: "user",
                    target_id: Some(user.id),
                    details: serde_json::json!({ "totp_attempts": attempts }),
                    meta: &transport.request_meta(),
                },
            )
            .await?;
            tx.commit().await.map_err(AuthError::from)?;

            warn!(user_id = user.id, attempts, "totp fallback engaged");

            let role_config = policy::fetch_role_config(&self.pool, user.role).await?;
            let settings = EffectiveOtpSettings::derive(system, role_config.as_ref());
            let email_otp = if self.otp.active_code_exists(user.id).await? {
                None
            } else {
                Some(self.otp.issue(user.id, &settings).await?)
            };

            let prefs = policy::fetch_user_preferences(&self.pool, user.id).await?;
            let mut allowed = row.allowed_methods();
            if !allowed.contains(&MfaMethod::Email) {
                allowed.push(MfaMethod::Email);
            }
            return Ok(VerifyMfaOutcome::FallbackEngaged {
                allowed_methods: allowed,
                email_otp,
                user_email: otp_delivery_email(user, &prefs),
            });
        }

        tx.commit().await.map_err(AuthError::from)?;
        self.audit_security(
            system,
            user.id,
            "mfa_totp_failed",
            AuditClass::SecurityFailure,
            serde_json::json!({ "attempts": attempts }),
            transport,
        )
        .await;

        let remaining = if system.mode == MfaMode::TotpEmailFallback {
            (system.fallback_totp_attempts - attempts).max(0)
        } else {
            0
        };
        Err(AuthError::InvalidCode {
            remaining_attempts: u32::try_from(remaining).unwrap_or(0),
        })
    }

    /// Record a verified method; issue the session once the set covers the
    /// requirement.
    async fn complete_method(
        &self,
        system: &SystemMfaConfig,
        row: &ChallengeRow,
        user: &User,
        method: MfaMethod,
        trust_device: bool,
        transport: &TransportMeta,
    ) -> Result<VerifyMfaOutcome> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        challenge::record_method_verified(&mut tx, row.id, method).await?;

        let mut updated = row.clone();
        if !updated.verified_methods.contains(&method) {
            updated.verified_methods.push(method);
        }

        if !updated.is_satisfied() {
            tx.commit().await.map_err(AuthError::from)?;
            self.audit_security(
                system,
                user.id,
                "mfa_method_verified",
                AuditClass::Informational,
                serde_json::json!({ "method": method }),
                transport,
            )
            .await;
            return Ok(VerifyMfaOutcome::Partial {
                pending: updated.pending_methods(),
                verified: updated.verified_methods,
            });
        }

        // Single-use: a raced duplicate loses here and gets a rejection.
        if !challenge::consume(&mut tx, row.id).await? {
            return Err(AuthError::InvalidCredentials);
        }
        audit::append(
            &mut tx,
            system.logging_level,
            AuditClass::StateChange,
            &audit::Record {
                actor: Actor::User { id: user.id },
                action: "mfa_verified",
                target_type: "user",
                target_id: Some(user.id),
                details: serde_json::json!({ "method": method }),
                meta: &transport.request_meta(),
            },
        )
        .await?;
        tx.commit().await.map_err(AuthError::from)?;

        if trust_device && system.device_trust_enabled {
            if let Some(fingerprint) = transport.device_fingerprint.as_deref() {
                crate::session::storage::upsert_trusted_device(
                    &self.pool,
                    user.id,
                    fingerprint,
                    system.device_trust_duration_days,
                )
                .await?;
                self.security_event(
                    user.id,
                    "device_trusted",
                    Severity::Info,
                    serde_json::json!({}),
                )
                .await;
            }
        }

        let credentials = self
            .sessions
            .issue(user, &transport.device_meta(), row.remember_me)
            .await?;
        self.record_attempt(Some(user.id), &user.email, true, None, transport)
            .await;
        self.security_event(
            user.id,
            "login_mfa",
            Severity::Info,
            serde_json::json!({ "method": method }),
        )
        .await;
        Ok(VerifyMfaOutcome::Complete {
            credentials,
            user: user.clone(),
        })
    }

    async fn issue_session_after_login(
        &self,
        system: &SystemMfaConfig,
        user: User,
        email: &str,
        remember_me: bool,
        transport: &TransportMeta,
    ) -> Result<LoginOutcome> {
        let credentials = self
            .sessions
            .issue(&user, &transport.device_meta(), remember_me)
            .await?;
        self.record_attempt(Some(user.id), email, true, None, transport)
            .await;
        self.audit_security(
            system,
            user.id,
            "login",
            AuditClass::Informational,
            serde_json::json!({}),
            transport,
        )
        .await;
        Ok(LoginOutcome::Session { credentials, user })
    }

    /// Self-registration: validate, hash, persist, and hand back the email
    /// verification token for delivery.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password_input: &str,
        transport: &TransportMeta,
    ) -> Result<Registration> {
        let username = username.trim();
        let email_normalized = email.trim().to_lowercase();

        if !valid_username(username) {
            return Err(AuthError::InvalidInput(
                "username must be 3-50 characters: letters, digits, '_' or '-'".to_string(),
            ));
        }
        if !valid_email(&email_normalized) {
            return Err(AuthError::InvalidInput("invalid email address".to_string()));
        }
        if let Err(errors) = password::validate(password_input) {
            return Err(AuthError::InvalidInput(errors.join("; ")));
        }

        let password_hash = password::hash(password_input, password::HashCost::default())?;
        let verification_token = token::generate_hex_token()?;
        let token_hash = token::hash_token(&verification_token);

        let system = policy::fetch_system_config(&self.pool).await?;

        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let user_id = user_storage::insert_user(
            &mut tx,
            username,
            &email_normalized,
            &password_hash,
            &token_hash,
            VERIFICATION_TOKEN_TTL_SECONDS,
        )
        .await?;

        audit::append(
            &mut tx,
            system.logging_level,
            AuditClass::StateChange,
            &audit::Record {
                actor: Actor::User { id: user_id },
                action: "USER_REGISTER",
                target_type: "user",
                target_id: Some(user_id),
                details: serde_json::json!({ "username": username }),
                meta: &transport.request_meta(),
            },
        )
        .await?;
        tx.commit().await.map_err(AuthError::from)?;

        // New users created under active enforcement skip the grace window.
        if system.enforcement_enabled {
            enforcement::mark_requires_setup(&self.pool, user_id).await?;
        }

        info!(user_id, "user registered");
        Ok(Registration {
            user_id,
            email: email_normalized,
            username: username.to_string(),
            verification_token,
        })
    }

    async fn record_attempt(
        &self,
        user_id: Option<i64>,
        email: &str,
        success: bool,
        failure_reason: Option<&str>,
        transport: &TransportMeta,
    ) {
        let parsed = ua::parse(transport.user_agent.as_deref());
        let attempt = NewLoginAttempt {
            user_id,
            email_attempted: email,
            success,
            failure_reason,
            ip: transport.ip.as_deref(),
            browser: parsed.browser.as_deref(),
            os: parsed.os.as_deref(),
            device_type: parsed.device_type.as_deref(),
            location: transport.location.as_deref(),
        };
        if let Err(err) = audit::record_login_attempt(&self.pool, &attempt).await {
            warn!("failed to record login attempt: {err}");
        }
    }

    async fn security_event(
        &self,
        user_id: i64,
        event_type: &str,
        severity: Severity,
        metadata: serde_json::Value,
    ) {
        let result = async {
            let mut tx = self.pool.begin().await?;
            audit::record_security_event(&mut tx, user_id, event_type, severity, metadata).await?;
            tx.commit().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(err) = result {
            warn!("failed to record security event: {err}");
        }
    }

    async fn audit_security(
        &self,
        system: &SystemMfaConfig,
        user_id: i64,
        action: &str,
        class: AuditClass,
        details: serde_json::Value,
        transport: &TransportMeta,
    ) {
        let record = audit::Record {
            actor: Actor::User { id: user_id },
            action,
            target_type: "user",
            target_id: Some(user_id),
            details,
            meta: &transport.request_meta(),
        };
        if let Err(err) =
            audit::append_pool(&self.pool, system.logging_level, class, &record).await
        {
            warn!("failed to append audit record: {err}");
        }
    }
}

/// Email OTPs go to the verified alternate address when one is configured.
fn otp_delivery_email(user: &User, prefs: &UserMfaPreferences) -> String {
    if prefs.alternate_email_verified {
        if let Some(alternate) = prefs.alternate_email.as_deref() {
            return alternate.to_string();
        }
    }
    user.email.clone()
}

/// Basic email shape check on normalized input.
#[must_use]
pub fn valid_email(email: &str) -> bool {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}

/// Usernames: 3-50 chars, letters/digits/underscore/dash.
#[must_use]
pub fn valid_username(username: &str) -> bool {
    let len = username.chars().count();
    (3..=50).contains(&len)
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("alice@x.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
        assert!(!valid_email("spaces in@example.com"));
    }

    #[test]
    fn valid_username_bounds() {
        assert!(valid_username("alice"));
        assert!(valid_username("a_b-c123"));
        assert!(!valid_username("ab"));
        assert!(!valid_username(&"x".repeat(51)));
        assert!(!valid_username("has space"));
        assert!(!valid_username("email@style"));
    }

    #[test]
    fn dummy_digest_never_verifies() {
        assert!(!password::verify("Secure1!", DUMMY_DIGEST));
        assert!(!password::verify("", DUMMY_DIGEST));
    }

    #[test]
    fn otp_delivery_prefers_verified_alternate() {
        let user = sample_user();
        let mut prefs = UserMfaPreferences {
            user_id: user.id,
            alternate_email: Some("alt@x.com".to_string()),
            alternate_email_verified: true,
            ..UserMfaPreferences::default()
        };
        assert_eq!(otp_delivery_email(&user, &prefs), "alt@x.com");

        prefs.alternate_email_verified = false;
        assert_eq!(otp_delivery_email(&user, &prefs), user.email);
    }

    fn sample_user() -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: None,
            role: crate::users::Role::User,
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
}
