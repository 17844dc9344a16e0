//! Email OTP code generation.
//!
//! Codes are sampled uniformly per format. The alphanumeric alphabet leaves
//! out 0/O/1/I so codes survive being read aloud or retyped from a screen.

use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};

use crate::policy::CodeFormat;

const DIGITS: &[u8] = b"0123456789";
pub(crate) const ALPHANUMERIC: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a fresh plaintext code for the given format.
pub fn generate(format: CodeFormat) -> Result<String> {
    match format {
        CodeFormat::Numeric6 => sample(DIGITS, 6),
        CodeFormat::Numeric8 => sample(DIGITS, 8),
        CodeFormat::Alphanumeric6 => sample(ALPHANUMERIC, 6),
    }
}

/// Expected code length for input validation.
#[must_use]
pub fn expected_length(format: CodeFormat) -> usize {
    match format {
        CodeFormat::Numeric6 | CodeFormat::Alphanumeric6 => 6,
        CodeFormat::Numeric8 => 8,
    }
}

fn sample(alphabet: &[u8], length: usize) -> Result<String> {
    // Rejection sampling keeps the distribution uniform; a modulo would bias
    // toward the low end of the alphabet.
    let mut out = String::with_capacity(length);
    let max = u8::MAX - (u8::MAX % alphabet.len() as u8);
    let mut buf = [0u8; 16];
    while out.len() < length {
        OsRng
            .try_fill_bytes(&mut buf)
            .context("failed to sample code bytes")?;
        for byte in buf {
            if out.len() == length {
                break;
            }
            if byte < max {
                out.push(alphabet[usize::from(byte) % alphabet.len()] as char);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes_have_expected_shape() {
        let code = generate(CodeFormat::Numeric6).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let code = generate(CodeFormat::Numeric8).unwrap();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn alphanumeric_codes_skip_ambiguous_glyphs() {
        for _ in 0..50 {
            let code = generate(CodeFormat::Alphanumeric6).unwrap();
            assert_eq!(code.len(), 6);
            for c in code.chars() {
                assert!(!"0O1I".contains(c), "ambiguous glyph in {code}");
                assert!(ALPHANUMERIC.contains(&(c as u8)));
            }
        }
    }

    #[test]
    fn codes_vary() {
        let first = generate(CodeFormat::Numeric8).unwrap();
        let second = generate(CodeFormat::Numeric8).unwrap();
        // One collision in 10^8 would be suspicious enough to fail loudly.
        assert_ne!(first, second);
    }

    #[test]
    fn expected_length_matches_generation() {
        for format in [
            CodeFormat::Numeric6,
            CodeFormat::Numeric8,
            CodeFormat::Alphanumeric6,
        ] {
            assert_eq!(generate(format).unwrap().len(), expected_length(format));
        }
    }
}
