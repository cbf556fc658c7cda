//! One-shot session code generation and validation.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;

/// Hex characters in a code, dash excluded.
const CODE_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    /// The operating system RNG failed. There is no fallback: a guessable
    /// code is worse than no session.
    #[error("system RNG unavailable: {0}")]
    RngUnavailable(String),

    #[error("invalid session code {0:?}: expected 6 hex characters as XXX-XXX")]
    InvalidFormat(String),
}

/// A 6-hex-character session code, stored normalised as `XXX-XXX`.
///
/// Generated once by the sender at listener start, submitted once by the
/// receiver during the handshake, then kept only for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCode(String);

impl SessionCode {
    /// Draws 3 bytes from the OS CSPRNG and renders them as `XXX-XXX`.
    pub fn generate() -> Result<Self, CodeError> {
        let mut bytes = [0u8; CODE_LEN / 2];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CodeError::RngUnavailable(e.to_string()))?;
        let hex = hex::encode_upper(bytes);
        Ok(Self(format!("{}-{}", &hex[..3], &hex[3..])))
    }

    /// Parses user input, accepting any case and an optional dash.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let cleaned: String = input
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.len() != CODE_LEN || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CodeError::InvalidFormat(input.to_string()));
        }
        Ok(Self(format!("{}-{}", &cleaned[..3], &cleaned[3..])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares a submitted code against this one.
    ///
    /// Normalises first, then compares in constant time so a byte-by-byte
    /// oracle cannot narrow the search space.
    pub fn matches(&self, submitted: &str) -> bool {
        let Ok(other) = SessionCode::parse(submitted) else {
            return false;
        };
        constant_time_eq(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
