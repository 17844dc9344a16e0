//! OTP engine: email one-time codes with attempt counting, lockout and
//! resend accounting, TOTP verification, and backup codes.
//!
//! State transitions are decided by pure functions over the loaded row and
//! then applied in one transaction, so the accounting rules are unit-tested
//! without a database and the row lock serializes concurrent requests.

pub mod backup;
pub mod code;
pub mod storage;
pub mod totp;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::error::{AuthError, Result};
use crate::policy::{EffectiveOtpSettings, LockoutBehavior};
use crate::token::{constant_time_eq, hash_code};
use self::storage::StoredOtp;

/// A freshly issued code. The plaintext goes back to the caller for delivery
/// through the email transport; only the hash is stored.
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub can_resend_at: DateTime<Utc>,
}

/// Why a mismatch ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retry { remaining: u32 },
    TemporaryLock { until: DateTime<Utc> },
    RequirePassword,
    AdminLock,
}

/// Decision for one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyDecision {
    NoCode,
    Locked { until: Option<DateTime<Utc>> },
    Expired,
    Matched,
    Failed { attempts: i32, outcome: FailureOutcome },
}

/// Whether the row is locked at `now`, by timer or by an admin hold.
fn is_locked(stored: &StoredOtp, now: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
    if stored.admin_locked {
        return Some(None);
    }
    match stored.locked_until {
        Some(until) if until > now => Some(Some(until)),
        _ => None,
    }
}

/// Pure verification decision per the documented order: lock, presence,
/// expiry, then the constant-time compare. Expired codes do not touch the
/// attempt counter.
#[must_use]
pub fn decide_verify(
    latest: Option<&StoredOtp>,
    input: &str,
    now: DateTime<Utc>,
    settings: &EffectiveOtpSettings,
) -> VerifyDecision {
    let Some(stored) = latest else {
        return VerifyDecision::NoCode;
    };

    if let Some(until) = is_locked(stored, now) {
        return VerifyDecision::Locked { until };
    }

    if stored.used {
        return VerifyDecision::NoCode;
    }

    if stored.expires_at < now {
        return VerifyDecision::Expired;
    }

    if constant_time_eq(&hash_code(input), &stored.code_hash) {
        return VerifyDecision::Matched;
    }

    let attempts = stored.attempts + 1;
    let outcome = if attempts >= settings.max_failed_attempts {
        match settings.lockout_behavior {
            LockoutBehavior::TemporaryLockout => FailureOutcome::TemporaryLock {
                until: now + Duration::minutes(i64::from(settings.lockout_duration_minutes)),
            },
            LockoutBehavior::RequirePassword => FailureOutcome::RequirePassword,
            LockoutBehavior::AdminIntervention => FailureOutcome::AdminLock,
        }
    } else {
        let remaining = settings.max_failed_attempts - attempts;
        FailureOutcome::Retry {
            remaining: u32::try_from(remaining).unwrap_or(0),
        }
    };
    VerifyDecision::Failed { attempts, outcome }
}

/// Decision for a resend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendDecision {
    Locked { until: Option<DateTime<Utc>> },
    RateLimited,
    Cooldown { wait_seconds: i64 },
    Allowed { next_resend_count: i32 },
}

#[must_use]
pub fn decide_resend(
    latest: Option<&StoredOtp>,
    now: DateTime<Utc>,
    settings: &EffectiveOtpSettings,
) -> ResendDecision {
    let Some(stored) = latest else {
        // Nothing issued yet; treat as the first send.
        return ResendDecision::Allowed {
            next_resend_count: 1,
        };
    };

    if let Some(until) = is_locked(stored, now) {
        return ResendDecision::Locked { until };
    }

    if stored.resend_count >= settings.resend_rate_limit {
        return ResendDecision::RateLimited;
    }

    if let Some(last) = stored.last_resend_at {
        let ready_at = last + Duration::seconds(i64::from(settings.resend_cooldown_seconds));
        if now < ready_at {
            return ResendDecision::Cooldown {
                wait_seconds: (ready_at - now).num_seconds().max(1),
            };
        }
    }

    ResendDecision::Allowed {
        next_resend_count: stored.resend_count + 1,
    }
}

/// Email OTP engine over the shared pool.
#[derive(Clone)]
pub struct OtpEngine {
    pool: PgPool,
}

impl OtpEngine {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a fresh code, invalidating any previous unused ones.
    ///
    /// # Errors
    /// `LockedOut` while a lock is in force; `Internal` on storage failures.
    pub async fn issue(
        &self,
        user_id: i64,
        settings: &EffectiveOtpSettings,
    ) -> Result<IssuedOtp> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        let latest = storage::latest_code_for_update(&mut tx, user_id).await?;
        if let Some(stored) = latest.as_ref() {
            if let Some(until) = is_locked(stored, now) {
                return Err(AuthError::LockedOut {
                    locked_until: until,
                });
            }
        }

        let issued = Self::insert_fresh_code(&mut tx, user_id, now, settings, 0, None).await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(issued)
    }

    /// Resend: rejects over the rate limit or inside the cooldown window,
    /// otherwise replaces the active code and bumps the counter.
    pub async fn resend(
        &self,
        user_id: i64,
        settings: &EffectiveOtpSettings,
    ) -> Result<IssuedOtp> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        let latest = storage::latest_code_for_update(&mut tx, user_id).await?;
        let next_resend_count = match decide_resend(latest.as_ref(), now, settings) {
            ResendDecision::Locked { until } => {
                return Err(AuthError::LockedOut {
                    locked_until: until,
                })
            }
            ResendDecision::RateLimited => return Err(AuthError::RateLimited),
            ResendDecision::Cooldown { wait_seconds } => {
                return Err(AuthError::Cooldown { wait_seconds })
            }
            ResendDecision::Allowed { next_resend_count } => next_resend_count,
        };

        let issued =
            Self::insert_fresh_code(&mut tx, user_id, now, settings, next_resend_count, Some(now))
                .await?;
        tx.commit().await.map_err(AuthError::from)?;
        info!(user_id, resend_count = next_resend_count, "otp resent");
        Ok(issued)
    }

    /// Verify a code, applying the attempt/lockout accounting.
    pub async fn verify(
        &self,
        user_id: i64,
        input: &str,
        settings: &EffectiveOtpSettings,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;

        let latest = storage::latest_code_for_update(&mut tx, user_id).await?;
        let decision = decide_verify(latest.as_ref(), input, now, settings);

        match decision {
            VerifyDecision::NoCode => Err(AuthError::NoCode),
            VerifyDecision::Locked { until } => Err(AuthError::LockedOut {
                locked_until: until,
            }),
            VerifyDecision::Expired => Err(AuthError::ExpiredCode),
            VerifyDecision::Matched => {
                let Some(stored) = latest else {
                    return Err(AuthError::NoCode);
                };
                storage::mark_used(&mut tx, stored.id).await?;
                tx.commit().await.map_err(AuthError::from)?;
                Ok(())
            }
            VerifyDecision::Failed { attempts, outcome } => {
                let Some(stored) = latest else {
                    return Err(AuthError::NoCode);
                };
                match outcome {
                    FailureOutcome::Retry { remaining } => {
                        storage::record_failure(&mut tx, stored.id, attempts, None, false).await?;
                        tx.commit().await.map_err(AuthError::from)?;
                        Err(AuthError::InvalidCode {
                            remaining_attempts: remaining,
                        })
                    }
                    FailureOutcome::TemporaryLock { until } => {
                        storage::record_failure(&mut tx, stored.id, attempts, Some(until), false)
                            .await?;
                        tx.commit().await.map_err(AuthError::from)?;
                        Err(AuthError::LockedOut {
                            locked_until: Some(until),
                        })
                    }
                    FailureOutcome::RequirePassword => {
                        // The code is burned; the user restarts from the
                        // password step.
                        storage::record_failure(&mut tx, stored.id, attempts, None, false).await?;
                        storage::invalidate_unused(&mut tx, user_id).await?;
                        tx.commit().await.map_err(AuthError::from)?;
                        Err(AuthError::LockedOut { locked_until: None })
                    }
                    FailureOutcome::AdminLock => {
                        storage::record_failure(&mut tx, stored.id, attempts, None, true).await?;
                        tx.commit().await.map_err(AuthError::from)?;
                        Err(AuthError::LockedOut { locked_until: None })
                    }
                }
            }
        }
    }

    /// Whether the user currently holds a usable (unused, unexpired,
    /// unlocked) code.
    pub async fn active_code_exists(&self, user_id: i64) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let latest = storage::latest_code_for_update(&mut tx, user_id).await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(latest.is_some_and(|stored| {
            !stored.used && stored.expires_at > now && is_locked(&stored, now).is_none()
        }))
    }

    /// Administrative unlock: clears locks and resets attempt counters.
    pub async fn unlock(&self, user_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(AuthError::from)?;
        let cleared = storage::clear_locks(&mut tx, user_id).await?;
        tx.commit().await.map_err(AuthError::from)?;
        Ok(cleared)
    }

    async fn insert_fresh_code(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: i64,
        now: DateTime<Utc>,
        settings: &EffectiveOtpSettings,
        resend_count: i32,
        last_resend_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedOtp> {
        storage::invalidate_unused(tx, user_id).await?;

        let plaintext = code::generate(settings.code_format)?;
        let expires_at = now + Duration::minutes(i64::from(settings.code_expiration_minutes));
        storage::insert_code(
            tx,
            user_id,
            &hash_code(&plaintext),
            expires_at,
            resend_count,
            last_resend_at,
        )
        .await?;

        Ok(IssuedOtp {
            code: plaintext,
            expires_at,
            can_resend_at: now + Duration::seconds(i64::from(settings.resend_cooldown_seconds)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::{CodeFormat, SystemMfaConfig};

    fn settings() -> EffectiveOtpSettings {
        EffectiveOtpSettings::derive(&SystemMfaConfig::default(), None)
    }

    fn stored(code: &str, now: DateTime<Utc>) -> StoredOtp {
        StoredOtp {
            id: 1,
            user_id: 42,
            code_hash: hash_code(code),
            expires_at: now + Duration::minutes(10),
            attempts: 0,
            locked_until: None,
            admin_locked: false,
            resend_count: 0,
            last_resend_at: None,
            used: false,
        }
    }

    #[test]
    fn verify_no_code() {
        let now = Utc::now();
        assert_eq!(
            decide_verify(None, "123456", now, &settings()),
            VerifyDecision::NoCode
        );
    }

    #[test]
    fn verify_used_code_counts_as_missing() {
        let now = Utc::now();
        let mut row = stored("123456", now);
        row.used = true;
        assert_eq!(
            decide_verify(Some(&row), "123456", now, &settings()),
            VerifyDecision::NoCode
        );
    }

    #[test]
    fn verify_matches_case_insensitively() {
        let now = Utc::now();
        let row = stored("A3X9K2", now);
        assert_eq!(
            decide_verify(Some(&row), "a3x9k2", now, &settings()),
            VerifyDecision::Matched
        );
    }

    #[test]
    fn expired_code_skips_attempt_counter() {
        let now = Utc::now();
        let mut row = stored("123456", now);
        row.expires_at = now - Duration::seconds(1);
        assert_eq!(
            decide_verify(Some(&row), "999999", now, &settings()),
            VerifyDecision::Expired
        );
    }

    #[test]
    fn fifth_wrong_attempt_locks_for_lockout_duration() {
        let now = Utc::now();
        let config = settings();
        let mut row = stored("123456", now);
        // Four prior failures already recorded.
        row.attempts = 4;
        let decision = decide_verify(Some(&row), "000000", now, &config);
        let VerifyDecision::Failed { attempts, outcome } = decision else {
            panic!("expected failure, got {decision:?}");
        };
        assert_eq!(attempts, 5);
        let FailureOutcome::TemporaryLock { until } = outcome else {
            panic!("expected temporary lock, got {outcome:?}");
        };
        assert_eq!(
            until,
            now + Duration::minutes(i64::from(config.lockout_duration_minutes))
        );
    }

    #[test]
    fn failures_report_remaining_attempts() {
        let now = Utc::now();
        let row = stored("123456", now);
        let decision = decide_verify(Some(&row), "000000", now, &settings());
        assert_eq!(
            decision,
            VerifyDecision::Failed {
                attempts: 1,
                outcome: FailureOutcome::Retry { remaining: 4 },
            }
        );
    }

    #[test]
    fn lock_holds_until_deadline() {
        let now = Utc::now();
        let mut row = stored("123456", now);
        row.locked_until = Some(now + Duration::minutes(5));
        // Even the right code is rejected while locked.
        let decision = decide_verify(Some(&row), "123456", now, &settings());
        assert!(matches!(decision, VerifyDecision::Locked { until: Some(_) }));

        // After the deadline the lock no longer applies.
        let later = now + Duration::minutes(6);
        let mut row = row;
        row.expires_at = later + Duration::minutes(1);
        assert_eq!(
            decide_verify(Some(&row), "123456", later, &settings()),
            VerifyDecision::Matched
        );
    }

    #[test]
    fn admin_lock_has_no_deadline() {
        let now = Utc::now();
        let mut row = stored("123456", now);
        row.admin_locked = true;
        assert_eq!(
            decide_verify(Some(&row), "123456", now, &settings()),
            VerifyDecision::Locked { until: None }
        );
    }

    #[test]
    fn require_password_behavior_burns_the_code() {
        let now = Utc::now();
        let mut config = settings();
        config.lockout_behavior = LockoutBehavior::RequirePassword;
        config.max_failed_attempts = 1;
        let row = stored("123456", now);
        let decision = decide_verify(Some(&row), "000000", now, &config);
        assert_eq!(
            decision,
            VerifyDecision::Failed {
                attempts: 1,
                outcome: FailureOutcome::RequirePassword,
            }
        );
    }

    #[test]
    fn resend_first_send_allowed() {
        let now = Utc::now();
        assert_eq!(
            decide_resend(None, now, &settings()),
            ResendDecision::Allowed {
                next_resend_count: 1
            }
        );
    }

    #[test]
    fn resend_respects_rate_limit() {
        let now = Utc::now();
        let config = settings();
        let mut row = stored("123456", now);
        row.resend_count = config.resend_rate_limit;
        assert_eq!(
            decide_resend(Some(&row), now, &config),
            ResendDecision::RateLimited
        );
    }

    #[test]
    fn resend_cooldown_reports_wait() {
        let now = Utc::now();
        let config = settings();
        let mut row = stored("123456", now);
        row.resend_count = 1;
        row.last_resend_at = Some(now - Duration::seconds(10));
        let decision = decide_resend(Some(&row), now, &config);
        let ResendDecision::Cooldown { wait_seconds } = decision else {
            panic!("expected cooldown, got {decision:?}");
        };
        assert_eq!(
            wait_seconds,
            i64::from(config.resend_cooldown_seconds) - 10
        );
    }

    #[test]
    fn resend_allowed_after_cooldown() {
        let now = Utc::now();
        let config = settings();
        let mut row = stored("123456", now);
        row.resend_count = 2;
        row.last_resend_at =
            Some(now - Duration::seconds(i64::from(config.resend_cooldown_seconds) + 1));
        assert_eq!(
            decide_resend(Some(&row), now, &config),
            ResendDecision::Allowed {
                next_resend_count: 3
            }
        );
    }

    #[test]
    fn generated_code_format_follows_settings() {
        let mut config = settings();
        config.code_format = CodeFormat::Alphanumeric6;
        let plaintext = code::generate(config.code_format).unwrap();
        assert_eq!(plaintext.len(), 6);
    }
}
