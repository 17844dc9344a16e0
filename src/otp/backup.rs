//! Backup codes: a fixed batch of single-use codes accepted in lieu of a
//! second factor.
//!
//! Plaintext leaves the server exactly once, at generation. Storage holds
//! SHA-256 digests; consumption marks the matching row used and reports how
//! many codes remain.

use anyhow::Context;
use rand::{rngs::OsRng, RngCore};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{AuthError, Result};
use crate::token::{constant_time_eq, hash_code};

pub const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;

/// A freshly generated batch: plaintext for the user, digests for storage.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub batch_id: Uuid,
    pub codes: Vec<String>,
    pub code_hashes: Vec<Vec<u8>>,
}

impl BackupCodeBatch {
    /// Generate a full batch of grouped codes.
    pub fn generate() -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code()?;
            code_hashes.push(hash_code(&normalize(&code)));
            codes.push(code);
        }
        Ok(Self {
            batch_id: Uuid::new_v4(),
            codes,
            code_hashes,
        })
    }
}

/// Strip separators and upper-case for hashing and comparison.
#[must_use]
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

fn generate_code() -> Result<String> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    OsRng
        .try_fill_bytes(&mut raw)
        .context("failed to sample backup code")?;
    let alphabet = super::code::ALPHANUMERIC;
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        normalized.push(alphabet[usize::from(byte) % alphabet.len()] as char);
    }
    // Grouped as XXXX-XXXX-XXXX for readability.
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized.as_bytes().chunks(BACKUP_CODE_GROUP_SIZE).enumerate() {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid backup code chunk")?);
    }
    Ok(out)
}

/// Replace the user's batch: prior codes (used or not) are deleted.
pub async fn replace_batch(pool: &PgPool, user_id: i64, batch: &BackupCodeBatch) -> Result<()> {
    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let query = "DELETE FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to drop previous backup codes")?;

    let query = r"
        INSERT INTO backup_codes (user_id, batch_id, code_hash)
        VALUES ($1, $2, $3)
    ";
    for code_hash in &batch.code_hashes {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(batch.batch_id)
            .bind(code_hash)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to insert backup code")?;
    }

    tx.commit().await.map_err(AuthError::from)?;
    Ok(())
}

/// Consume a code if it matches an unused entry. Returns the remaining
/// unused count on success, `None` on no match.
pub async fn consume(pool: &PgPool, user_id: i64, input: &str) -> Result<Option<u32>> {
    let normalized = normalize(input);
    let input_hash = hash_code(&normalized);

    let mut tx = pool.begin().await.map_err(AuthError::from)?;

    let query = r"
        SELECT id, code_hash
        FROM backup_codes
        WHERE user_id = $1
          AND used_at IS NULL
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load backup codes")?;

    let mut matched_id: Option<i64> = None;
    for row in &rows {
        let code_hash: Vec<u8> = row.get("code_hash");
        // Scan every row so timing does not reveal the match position.
        if constant_time_eq(&input_hash, &code_hash) && matched_id.is_none() {
            matched_id = Some(row.get("id"));
        }
    }

    let Some(code_id) = matched_id else {
        return Ok(None);
    };

    let query = r"
        UPDATE backup_codes
        SET used_at = NOW()
        WHERE id = $1
          AND used_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(code_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume backup code")?;

    tx.commit().await.map_err(AuthError::from)?;

    let remaining = u32::try_from(rows.len().saturating_sub(1)).unwrap_or(0);
    Ok(Some(remaining))
}

/// Count the user's unused codes.
pub async fn remaining(pool: &PgPool, user_id: i64) -> Result<u32> {
    let query = r"
        SELECT COUNT(*) AS remaining
        FROM backup_codes
        WHERE user_id = $1
          AND used_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count backup codes")?;
    let remaining: i64 = row.get("remaining");
    Ok(u32::try_from(remaining).unwrap_or(0))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn batch_has_ten_grouped_codes() {
        let batch = BackupCodeBatch::generate().unwrap();
        assert_eq!(batch.codes.len(), BACKUP_CODE_COUNT);
        assert_eq!(batch.code_hashes.len(), BACKUP_CODE_COUNT);
        for code in &batch.codes {
            assert_eq!(code.len(), BACKUP_CODE_LEN + 2);
            assert_eq!(code.matches('-').count(), 2);
            for c in normalize(code).chars() {
                assert!(!"0O1I".contains(c));
            }
        }
    }

    #[test]
    fn hashes_match_normalized_plaintext() {
        let batch = BackupCodeBatch::generate().unwrap();
        for (code, hash) in batch.codes.iter().zip(&batch.code_hashes) {
            assert_eq!(&hash_code(&normalize(code)), hash);
        }
    }

    #[test]
    fn normalize_strips_separators_and_case() {
        assert_eq!(normalize("abcd-efgh-jklm"), "ABCDEFGHJKLM");
        assert_eq!(normalize(" ABCD EFGH JKLM "), "ABCDEFGHJKLM");
    }

    #[test]
    fn codes_within_batch_are_distinct() {
        let batch = BackupCodeBatch::generate().unwrap();
        let mut unique = batch.codes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), BACKUP_CODE_COUNT);
    }

    #[test]
    fn batches_are_distinct() {
        let first = BackupCodeBatch::generate().unwrap();
        let second = BackupCodeBatch::generate().unwrap();
        assert_ne!(first.batch_id, second.batch_id);
        assert_ne!(first.codes, second.codes);
    }
}
