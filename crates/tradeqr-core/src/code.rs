//! Pairing code generation.
//!
//! Codes carry 80 bits from the OS CSPRNG, rendered as 16 characters of
//! Crockford base32 so they survive being read off a screen and typed in.
//! They are never derived from a session or user identifier.

use thiserror::Error;

/// Rendered length of a pairing code.
pub const CODE_LENGTH: usize = 16;

/// Random bytes per code (80 bits).
pub(crate) const CODE_BYTES: usize = 10;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Clone, Error)]
pub enum CodeError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Source of fresh pairing codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> Result<String, CodeError>;
}

/// Generator backed by the operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> Result<String, CodeError> {
        let mut bytes = [0u8; CODE_BYTES];
        getrandom::getrandom(&mut bytes).map_err(|e| CodeError::Entropy(e.to_string()))?;
        Ok(encode(&bytes))
    }
}

pub(crate) fn encode(bytes: &[u8; CODE_BYTES]) -> String {
    let acc = bytes
        .iter()
        .fold(0u128, |acc, &b| (acc << 8) | u128::from(b));

    (0..CODE_LENGTH)
        .rev()
        .map(|i| ALPHABET[((acc >> (i * 5)) & 0x1f) as usize] as char)
        .collect()
}

/// Canonicalize a hand-typed code.
///
/// Strips separators and whitespace, upper-cases, and folds the look-alike
/// letters `I`/`L` to `1` and `O` to `0`. Returns `None` when the result is
/// not a well-formed code.
pub fn normalize_code(input: &str) -> Option<String> {
    let code: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| match c.to_ascii_uppercase() {
            'I' | 'L' => '1',
            'O' => '0',
            other => other,
        })
        .collect();

    if code.len() == CODE_LENGTH && code.bytes().all(|b| ALPHABET.contains(&b)) {
        Some(code)
    } else {
        None
    }
}

/// Leading characters of a code, safe to put in logs.
pub fn redact(code: &str) -> &str {
    code.get(..4).unwrap_or(code)
}
