//! Rollup Reconcile
//!
//! End-to-end reconciliation harness for a chain and the rollup that settles
//! on it. Drives deposits, transfers, withdrawals and signing-key
//! registrations through both ledgers and checks after every step that
//! balances moved exactly as the accounting identities predict.

pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod invariants;
pub mod models;
pub mod oracle;
pub mod receipt;
pub mod scenario;
pub mod sim;

pub use context::HarnessContext;
pub use error::HarnessError;
pub use scenario::{run_all, ScenarioReport};
