//! Token utilities: secure random tokens, digesting, constant-time compare,
//! and the AES-256-GCM master key used to protect secrets at rest.
//!
//! Raw token values are only ever returned to the caller; the database stores
//! a SHA-256 digest. Hex rendering is used for emailed links (verification,
//! password reset), base64url for opaque bearer tokens.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Generate a 256-bit token rendered as lowercase hex.
///
/// Used for email verification and password-reset links.
pub fn generate_hex_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate hex token")?;
    Ok(hex::encode(bytes))
}

/// Generate a 256-bit opaque token, base64url without padding.
///
/// Used for refresh tokens and MFA challenge tokens.
pub fn generate_opaque_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate opaque token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// SHA-256 digest of a token, as stored in the database.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// SHA-256 digest of an OTP code, upper-cased first so user input is
/// case-insensitive for alphanumeric formats.
#[must_use]
pub fn hash_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.to_uppercase().as_bytes());
    hasher.finalize().to_vec()
}

/// Constant-time equality for token and digest comparisons.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// AES-256-GCM key protecting secrets at rest (TOTP seeds, provider
/// credentials). Loaded once at startup from `EMAIL_ENCRYPTION_KEY`.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

impl MasterKey {
    /// Parse the key material: 64 hex characters or 32 raw bytes.
    pub fn parse(material: &str) -> Result<Self> {
        let trimmed = material.trim();
        let key: [u8; 32] = if trimmed.len() == 64 {
            let decoded = hex::decode(trimmed).context("master key is not valid hex")?;
            decoded
                .try_into()
                .map_err(|_| anyhow!("master key must decode to 32 bytes"))?
        } else {
            trimmed
                .as_bytes()
                .try_into()
                .map_err(|_| anyhow!("master key must be 32 raw bytes or 64 hex characters"))?
        };
        Ok(Self { key })
    }

    /// Round-trip probe run at startup so a bad key fails the boot, not the
    /// first request that needs it.
    pub fn probe(&self) -> Result<()> {
        let sample = b"identeco-key-probe";
        let sealed = self.encrypt(sample)?;
        let opened = self.decrypt(&sealed)?;
        if opened == sample {
            Ok(())
        } else {
            Err(anyhow!("master key round-trip probe failed"))
        }
    }

    /// Encrypt with a fresh random nonce. Returns `base64(nonce || ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .context("failed to generate nonce")?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|err| anyhow!("AES-GCM encrypt: {err}"))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt a `base64(nonce || ciphertext)` payload.
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("ciphertext is not valid base64")?;

        if combined.len() <= NONCE_BYTES {
            return Err(anyhow!("ciphertext too short"));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_BYTES);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|err| anyhow!("AES-GCM decrypt: {err}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hex_token_is_64_lowercase_hex_chars() {
        let token = generate_hex_token().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token, token.to_lowercase());
    }

    #[test]
    fn opaque_token_is_url_safe() {
        let token = generate_opaque_token().unwrap();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn tokens_do_not_repeat() {
        assert_ne!(generate_opaque_token().unwrap(), generate_opaque_token().unwrap());
    }

    #[test]
    fn hash_token_is_deterministic() {
        assert_eq!(hash_token("token"), hash_token("token"));
        assert_ne!(hash_token("token"), hash_token("other"));
    }

    #[test]
    fn hash_code_ignores_case() {
        assert_eq!(hash_code("a3x9k2"), hash_code("A3X9K2"));
    }

    #[test]
    fn constant_time_eq_matches() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn master_key_parses_hex_and_raw() {
        let hex_key = "00".repeat(32);
        assert!(MasterKey::parse(&hex_key).is_ok());
        let raw_key = "a".repeat(32);
        assert!(MasterKey::parse(&raw_key).is_ok());
        assert!(MasterKey::parse("short").is_err());
    }

    #[test]
    fn master_key_round_trips() {
        let key = MasterKey::parse(&"ab".repeat(32)).unwrap();
        key.probe().unwrap();
        let sealed = key.encrypt(b"totp seed bytes").unwrap();
        assert_eq!(key.decrypt(&sealed).unwrap(), b"totp seed bytes");
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let key1 = MasterKey::parse(&"aa".repeat(32)).unwrap();
        let key2 = MasterKey::parse(&"bb".repeat(32)).unwrap();
        let sealed = key1.encrypt(b"secret").unwrap();
        assert!(key2.decrypt(&sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = MasterKey::parse(&"cc".repeat(32)).unwrap();
        let sealed = key.encrypt(b"secret").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&sealed)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(key.decrypt(&tampered).is_err());
    }
}
