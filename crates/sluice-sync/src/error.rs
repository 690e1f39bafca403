//! Sync engine errors.
use sluice_core::error::ChainError;
use sluice_ledger::LedgerError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("chain source: {0}")] Chain(#[from] ChainError),
    #[error("ledger: {0}")] Ledger(#[from] LedgerError),
    #[error("rescan stopped")] Stopped,
    #[error("shutting down")] ShuttingDown,
    #[error("reorg deeper than {depth} blocks")] ReorgTooDeep { depth: u32 },
}
