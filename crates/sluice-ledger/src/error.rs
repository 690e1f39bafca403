//! Ledger error taxonomy.
use sluice_core::error::DecodeError;
use thiserror::Error;

/// Errors returned by the ledger and its storage layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Caller-supplied data is invalid. Not retryable.
    #[error("invalid input: {0}")]
    Input(String),
    /// Storage I/O failure. The enclosing transaction was not committed.
    #[error("database error: {0}")]
    Database(String),
    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// No block record at the given height.
    #[error("no block recorded at height {0}")]
    MissingBlock(u32),
}

impl LedgerError {
    /// Whether the failure came from caller input rather than storage.
    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input(_))
    }
}

impl From<DecodeError> for LedgerError {
    fn from(e: DecodeError) -> Self {
        Self::Input(e.to_string())
    }
}
