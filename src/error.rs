//! Domain error type shared by the authentication core.
//!
//! Recoverable outcomes carry the structured fields the HTTP layer surfaces
//! verbatim (remaining attempts, wait seconds, lock deadline). `Internal` is
//! the only variant whose cause is logged; callers see a redacted message.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is disabled")]
    AccountDisabled,

    #[error("email address is not verified")]
    EmailNotVerified,

    #[error("multi-factor authentication required")]
    MfaRequired,

    #[error("multi-factor authentication setup required")]
    MfaSetupRequired,

    #[error("invalid code")]
    InvalidCode { remaining_attempts: u32 },

    #[error("code has expired")]
    ExpiredCode,

    #[error("no active code")]
    NoCode,

    #[error("locked out")]
    LockedOut {
        /// Absent for lockouts only an administrator can clear.
        locked_until: Option<DateTime<Utc>>,
    },

    #[error("resend limit reached")]
    RateLimited,

    #[error("resend cooldown active, retry in {wait_seconds}s")]
    Cooldown { wait_seconds: i64 },

    #[error("operation not allowed")]
    NotAllowed,

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Conflict,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code for responses and audit details.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountDisabled => "ACCOUNT_DISABLED",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::MfaSetupRequired => "MFA_SETUP_REQUIRED",
            Self::InvalidCode { .. } => "INVALID_CODE",
            Self::ExpiredCode => "EXPIRED_CODE",
            Self::NoCode => "NO_CODE",
            Self::LockedOut { .. } => "LOCKED_OUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::Cooldown { .. } => "COOLDOWN",
            Self::NotAllowed => "NOT_ALLOWED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            Self::Conflict
        } else {
            Self::Internal(err.into())
        }
    }
}

/// SQLSTATE 23505 means a unique constraint rejected the write.
#[must_use]
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AuthError::InvalidCredentials.code(), "INVALID_CREDENTIALS");
        assert_eq!(
            AuthError::InvalidCode {
                remaining_attempts: 2
            }
            .code(),
            "INVALID_CODE"
        );
        assert_eq!(AuthError::Cooldown { wait_seconds: 30 }.code(), "COOLDOWN");
        assert_eq!(AuthError::Conflict.code(), "CONFLICT");
    }

    #[test]
    fn sqlx_row_not_found_is_internal() {
        let err = AuthError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn display_includes_structured_fields() {
        let err = AuthError::Cooldown { wait_seconds: 42 };
        assert!(err.to_string().contains("42"));
    }
}
