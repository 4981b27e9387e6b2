//! Harness failure taxonomy.
//!
//! Every variant is fatal to the scenario that raised it; nothing is retried
//! or recovered locally.

use std::time::Duration;
use thiserror::Error;

use crate::invariants::InvariantViolation;
use crate::models::{OperationKind, Stage};

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The ledger or transport refused the operation before a receipt existed.
    #[error("{operation} submission rejected: {reason}")]
    Submission {
        operation: OperationKind,
        reason: String,
    },

    /// A required prior state (approval, signing key) does not hold.
    #[error("{operation} precondition failed: {reason}")]
    Precondition {
        operation: OperationKind,
        reason: String,
    },

    /// No terminal receipt state within the configured bound.
    #[error("{operation} {operation_id} not {stage} after {waited:?}")]
    ConfirmationTimeout {
        operation: OperationKind,
        operation_id: String,
        stage: Stage,
        waited: Duration,
    },

    /// The ledger rejected the operation after accepting it.
    #[error("{operation} {operation_id} rejected by ledger: {reason}")]
    Rejected {
        operation: OperationKind,
        operation_id: String,
        reason: String,
    },

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// Query or RPC failure outside of a submission.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn submission(operation: OperationKind, reason: impl Into<String>) -> Self {
        Self::Submission {
            operation,
            reason: reason.into(),
        }
    }

    pub fn precondition(operation: OperationKind, reason: impl Into<String>) -> Self {
        Self::Precondition {
            operation,
            reason: reason.into(),
        }
    }

    /// Short machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Submission { .. } => "submission",
            Self::Precondition { .. } => "precondition",
            Self::ConfirmationTimeout { .. } => "confirmation_timeout",
            Self::Rejected { .. } => "rejected",
            Self::Invariant(_) => "invariant_violation",
            Self::Transport(_) => "transport",
            Self::Config(_) => "config",
        }
    }

    /// Distinct non-zero process exit status per failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Submission { .. } => 2,
            Self::Precondition { .. } => 3,
            Self::ConfirmationTimeout { .. } => 4,
            Self::Rejected { .. } => 5,
            Self::Invariant(_) => 6,
            Self::Transport(_) => 7,
            Self::Config(_) => 8,
        }
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(e: reqwest::Error) -> Self {
        HarnessError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_and_non_zero() {
        let errors = [
            HarnessError::submission(OperationKind::Deposit, "x"),
            HarnessError::precondition(OperationKind::Deposit, "x"),
            HarnessError::ConfirmationTimeout {
                operation: OperationKind::Transfer,
                operation_id: "0x01".into(),
                stage: Stage::Committed,
                waited: Duration::from_secs(1),
            },
            HarnessError::Rejected {
                operation: OperationKind::Transfer,
                operation_id: "0x01".into(),
                reason: "nonce".into(),
            },
            HarnessError::Invariant(InvariantViolation::new(OperationKind::Deposit, "op", vec![])),
            HarnessError::Transport("down".into()),
            HarnessError::Config("bad".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_display_carries_context() {
        let e = HarnessError::precondition(OperationKind::Deposit, "token not approved");
        assert_eq!(e.to_string(), "deposit precondition failed: token not approved");
        assert_eq!(e.kind(), "precondition");
    }
}
