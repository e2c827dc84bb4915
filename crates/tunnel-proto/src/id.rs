//! Transaction identifiers
//!
//! An id is 8 characters drawn from `[a-z0-9]`, which gives 36^8
//! (about 2.8 * 10^12) possible values. Collisions are not prevented, only
//! made unlikely.

use rand::Rng;
use std::fmt;
use thiserror::Error;

/// Number of bytes in a transaction id.
pub const TRANSACTION_ID_LEN: usize = 8;

/// Characters a transaction id may contain.
pub const TRANSACTION_ID_ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionIdError {
    #[error("invalid transaction id length: {0}, expected 8")]
    InvalidLength(usize),

    #[error("invalid transaction id character 0x{0:02x}")]
    InvalidCharacter(u8),
}

/// Correlation token attached to every command.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; TRANSACTION_ID_LEN]);

impl TransactionId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; TRANSACTION_ID_LEN];
        for byte in bytes.iter_mut() {
            *byte = TRANSACTION_ID_ALPHABET[rng.gen_range(0..TRANSACTION_ID_ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Parse an id from its wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionIdError> {
        let bytes: [u8; TRANSACTION_ID_LEN] = bytes
            .try_into()
            .map_err(|_| TransactionIdError::InvalidLength(bytes.len()))?;

        if let Some(&invalid) = bytes.iter().find(|b| !is_id_char(**b)) {
            return Err(TransactionIdError::InvalidCharacter(invalid));
        }

        Ok(Self(bytes))
    }

    /// Whether `candidate` is a well-formed id.
    pub fn is_valid(candidate: &str) -> bool {
        Self::from_bytes(candidate.as_bytes()).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only alphabet characters are ever stored, all of them ASCII.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

fn is_id_char(byte: u8) -> bool {
    byte.is_ascii_lowercase() || byte.is_ascii_digit()
}

impl std::str::FromStr for TransactionId {
    type Err = TransactionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.as_str())
    }
}
