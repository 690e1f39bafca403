//! Error types shared across the wallet core.
use thiserror::Error;

/// Failures reported by a [`ChainSource`](crate::traits::ChainSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block not found at height {0}")] BlockNotFound(u32),
    #[error("unknown block hash: {0}")] UnknownHash(String),
    #[error("transaction rejected: {0}")] Rejected(String),
    #[error("chain source unavailable: {0}")] Unavailable(String),
    #[error("wrong network: expected {expected}, got {got}")] WrongNetwork { expected: String, got: String },
}

impl ChainError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failures decoding stored or caller-supplied records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unparseable transaction: {0}")] Transaction(String),
    #[error("truncated key: expected {expected} bytes, got {got}")] KeyLength { expected: usize, got: usize },
}
