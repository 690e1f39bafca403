//! Integration test suite for Sluice.
//!
//! Exercises the ledger, sync engine, coin selector and wallet together
//! against the in-memory chain, including property tests for the ledger's
//! accounting and the selector's determinism and caps.

pub mod helpers;
