//! Wallet error types.

use sluice_core::error::ChainError;
use sluice_core::types::OutPoint;
use sluice_ledger::LedgerError;
use sluice_sync::SyncError;
use thiserror::Error;

/// Why coin selection could not cover a target.
///
/// The three shortfall variants carry the diagnostic totals gathered while
/// filtering, so callers can tell unconfirmed or capped funds from a real lack
/// of funds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    /// Eligible plus unconfirmed value is below the target.
    #[error("insufficient funds: have {have}, need {need} ({unconfirmed} unconfirmed)")]
    InsufficientFunds { have: u64, need: u64, unconfirmed: u64 },

    /// The target is reachable only with more inputs than the cap allows.
    #[error(
        "too many inputs: {selected} selected, {overflow_count} more inputs worth {overflow_value} needed to reach {need}"
    )]
    TooManyInputs { selected: usize, overflow_value: u64, overflow_count: usize, need: u64 },

    /// Enough value exists, but part of it lacks confirmations or maturity.
    #[error("unconfirmed coins: have {have} spendable and {unconfirmed} unconfirmed, need {need}")]
    UnconfirmedCoins { have: u64, unconfirmed: u64, need: u64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl SelectError {
    /// True for every outcome meaning "not enough spendable value".
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            Self::InsufficientFunds { .. } | Self::TooManyInputs { .. } | Self::UnconfirmedCoins { .. }
        )
    }
}

/// A single input the key oracle could not sign.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("input {index} ({outpoint}): {reason}")]
pub struct InputSignError {
    pub index: usize,
    pub outpoint: OutPoint,
    pub reason: String,
}

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The wallet is shutting down and accepts no new requests.
    #[error("wallet is shutting down")]
    ShuttingDown,

    #[error("wrong network: expected {expected}, got {got}")]
    WrongNetwork { expected: String, got: String },

    /// Key material is locked.
    #[error("wallet is locked")]
    Locked,

    #[error("invalid passphrase")]
    InvalidPassphrase,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Transaction could not be assembled or fully signed.
    #[error("build error: {0}")]
    Build(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl WalletError {
    /// Whether the caller supplied something invalid.
    pub fn is_input(&self) -> bool {
        match self {
            Self::Ledger(e) => e.is_input(),
            Self::InvalidAmount(_) | Self::WrongNetwork { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::Hash256;

    #[test]
    fn shortfalls_are_insufficient_funds() {
        let e = SelectError::InsufficientFunds { have: 1, need: 2, unconfirmed: 0 };
        assert!(e.is_insufficient_funds());
        let e = SelectError::UnconfirmedCoins { have: 1, unconfirmed: 5, need: 2 };
        assert!(e.is_insufficient_funds());
        let e = SelectError::TooManyInputs { selected: 499, overflow_value: 9, overflow_count: 3, need: 10 };
        assert!(e.is_insufficient_funds());
        assert!(!SelectError::Ledger(LedgerError::Database("io".into())).is_insufficient_funds());
    }

    #[test]
    fn display_insufficient_funds() {
        let e = SelectError::InsufficientFunds { have: 100, need: 200, unconfirmed: 50 };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 200 (50 unconfirmed)");
    }

    #[test]
    fn sign_error_names_input() {
        let e = InputSignError {
            index: 2,
            outpoint: OutPoint::new(Hash256::ZERO, 1),
            reason: "no key".into(),
        };
        assert!(e.to_string().starts_with("input 2 ("));
        assert!(e.to_string().ends_with("): no key"));
    }

    #[test]
    fn input_classification() {
        assert!(WalletError::from(LedgerError::Input("bad".into())).is_input());
        assert!(!WalletError::from(LedgerError::Database("io".into())).is_input());
        assert!(WalletError::InvalidAmount("zero".into()).is_input());
        assert!(!WalletError::Locked.is_input());
    }
}
