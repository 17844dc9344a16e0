//! Password strength validation and Argon2id hashing.
//!
//! `verify` never panics on malformed digests and runs the full Argon2
//! computation whether or not the user exists, keeping response timing
//! uniform across "no such account" and "wrong password".

use argon2::{
    password_hash::SaltString, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier,
};
use rand::rngs::OsRng;

use crate::error::{AuthError, Result};

const MIN_LENGTH: usize = 8;
pub const SYMBOLS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?";

/// Argon2id cost parameters. The defaults target ~100ms per verify on
/// current server hardware; tests use the cheap profile.
#[derive(Debug, Clone, Copy)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl HashCost {
    /// Minimal cost for unit tests.
    #[must_use]
    pub fn cheap() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn argon2(self) -> Result<Argon2<'static>> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|err| AuthError::Internal(anyhow::anyhow!("invalid Argon2 params: {err}")))?;
        Ok(Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        ))
    }
}

/// Validate the strength policy. Returns every failed rule, not just the
/// first, so the client can render the full checklist.
pub fn validate(plaintext: &str) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if plaintext.chars().count() < MIN_LENGTH {
        errors.push(format!("must be at least {MIN_LENGTH} characters long"));
    }
    if !plaintext.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("must contain an uppercase letter".to_string());
    }
    if !plaintext.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("must contain a lowercase letter".to_string());
    }
    if !plaintext.chars().any(|c| c.is_ascii_digit()) {
        errors.push("must contain a digit".to_string());
    }
    if !plaintext.chars().any(|c| SYMBOLS.contains(c)) {
        errors.push("must contain a symbol".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Hash a password after re-checking the strength policy.
pub fn hash(plaintext: &str, cost: HashCost) -> Result<String> {
    if let Err(errors) = validate(plaintext) {
        return Err(AuthError::InvalidInput(errors.join("; ")));
    }
    let salt = SaltString::generate(&mut OsRng);
    let digest = cost
        .argon2()?
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|err| AuthError::Internal(anyhow::anyhow!("failed to hash password: {err}")))?
        .to_string();
    Ok(digest)
}

/// Verify a plaintext against a PHC digest. Malformed digests (including the
/// anonymization sentinel) verify as `false` rather than erroring.
#[must_use]
pub fn verify(plaintext: &str, digest: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(digest) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_strong_password() {
        assert!(validate("Secure1!").is_ok());
    }

    #[test]
    fn validate_reports_every_failure() {
        let errors = validate("abc").unwrap_err();
        // short, no uppercase, no digit, no symbol
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn validate_requires_symbol() {
        let errors = validate("Secure12").unwrap_err();
        assert_eq!(errors, vec!["must contain a symbol".to_string()]);
    }

    #[test]
    fn hash_rejects_weak_password() {
        let err = hash("weak", HashCost::cheap()).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let digest = hash("Secure1!", HashCost::cheap()).unwrap();
        assert!(verify("Secure1!", &digest));
        assert!(!verify("Secure2!", &digest));
    }

    #[test]
    fn same_password_hashes_differently() {
        let first = hash("Secure1!", HashCost::cheap()).unwrap();
        let second = hash("Secure1!", HashCost::cheap()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn verify_false_on_malformed_digest() {
        assert!(!verify("Secure1!", "not-a-phc-string"));
        assert!(!verify("Secure1!", "!"));
        assert!(!verify("Secure1!", ""));
    }
}
