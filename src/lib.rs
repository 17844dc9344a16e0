//! # Identeco (Authentication & MFA Authority)
//!
//! `identeco` is an authentication, multi-factor authentication, and session
//! lifecycle service fronting a single relational store.
//!
//! ## Login & MFA
//!
//! Password login runs through the [`auth::Orchestrator`]: policy resolution
//! ([`policy::resolve`]) and enforcement grace periods decide whether a
//! second factor is due. When it is, a short-lived single-use challenge
//! token bridges the password step and session issuance; TOTP, email OTP,
//! and backup codes can satisfy it, subject to the configured mode.
//!
//! - **Modes:** disabled, TOTP-only, email-only, required-both, and
//!   TOTP-with-email-fallback (email unlocks after repeated TOTP failures
//!   within one challenge).
//! - **Lockout:** email OTP attempts are counted per code row; exhausting
//!   them locks the user out temporarily, forces a fresh password step, or
//!   waits for an administrator, per configuration.
//! - **Sessions:** a short-lived JWT access token plus an opaque refresh
//!   token with sliding expiry, capped by an absolute deadline for
//!   remember-me sessions.
//!
//! ## Audit
//!
//! Every privileged action commits its `audit_logs` row in the same
//! transaction as the action itself; login attempts and security events are
//! append-only.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod enforcement;
pub mod error;
pub mod otp;
pub mod password;
pub mod policy;
pub mod session;
pub mod token;
pub mod users;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
