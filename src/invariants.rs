//! Balance Invariant Checker
//!
//! Closed-form accounting identities evaluated over before/after snapshots.
//! The checker is pure: it never reads a ledger and holds no state. Every
//! sub-identity is evaluated, and all mismatches are reported together in a
//! single [`InvariantViolation`].
//!
//! # Identities
//!
//! - **Deposit**: `Δtarget == amount` (rollup, committed)
//! - **Transfer**: `Δsender == -(amount + fee)`, `Δreceiver == amount`, `Δoperator == fee`
//! - **Withdrawal**: `Δsender == -(amount + fee)`, `Δoperator == fee`,
//!   `Δ(settled + pending) == amount` on the chain
//! - **Key registration**: signing key reported set afterwards
//!
//! All arithmetic is exact over the smallest token unit.

use num_bigint::{BigInt, BigUint};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::models::{Address, Deposit, OperationKind, Stage, Transfer, Withdrawal};

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Balance of the deposit target, rollup committed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositSnapshot {
    pub target: BigUint,
}

/// Rollup committed balances of every party a transfer touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub sender: BigUint,
    pub receiver: BigUint,
    pub operator: BigUint,
}

/// Rollup balances of sender and operator plus the destination's chain view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalSnapshot {
    pub sender: BigUint,
    pub operator: BigUint,
    /// Settled chain balance of the destination address.
    pub chain_settled: BigUint,
    /// Contract-held pool owed to the destination address.
    pub chain_pending: BigUint,
}

impl WithdrawalSnapshot {
    /// Settled balance plus pending withdrawal pool.
    pub fn effective_chain(&self) -> BigUint {
        &self.chain_settled + &self.chain_pending
    }
}

// =============================================================================
// VIOLATIONS
// =============================================================================

/// Party whose balance an identity constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Party {
    DepositTarget,
    Sender,
    Receiver,
    Operator,
    /// Settled chain balance plus pending withdrawal pool of the destination.
    EffectiveChain,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::DepositTarget => f.write_str("deposit target"),
            Party::Sender => f.write_str("sender"),
            Party::Receiver => f.write_str("receiver"),
            Party::Operator => f.write_str("operator"),
            Party::EffectiveChain => f.write_str("effective chain balance"),
        }
    }
}

/// One failed sub-identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ViolationType {
    BalanceDelta {
        party: Party,
        stage: Stage,
        #[serde(serialize_with = "serialize_bigint")]
        expected: BigInt,
        #[serde(serialize_with = "serialize_bigint")]
        actual: BigInt,
    },
    SigningKeyNotSet {
        account: Address,
    },
    ApprovalState {
        account: Address,
        token: String,
        expected: bool,
        actual: bool,
    },
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationType::BalanceDelta {
                party,
                stage,
                expected,
                actual,
            } => write!(
                f,
                "{party} ({stage}) changed by {actual}, expected {expected}"
            ),
            ViolationType::SigningKeyNotSet { account } => {
                write!(f, "signing key of {account} not set after registration")
            }
            ViolationType::ApprovalState {
                account,
                token,
                expected,
                actual,
            } => write!(
                f,
                "deposit approval of {token} for {account} is {actual}, expected {expected}"
            ),
        }
    }
}

/// Post-condition mismatch. Always fatal to the scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub struct InvariantViolation {
    pub operation: OperationKind,
    pub operation_id: String,
    pub failures: Vec<ViolationType>,
}

impl InvariantViolation {
    pub fn new(
        operation: OperationKind,
        operation_id: impl Into<String>,
        failures: Vec<ViolationType>,
    ) -> Self {
        Self {
            operation,
            operation_id: operation_id.into(),
            failures,
        }
    }

    /// True if a balance identity for `party` is among the failures.
    pub fn involves(&self, party: Party) -> bool {
        self.failures.iter().any(|f| {
            matches!(f, ViolationType::BalanceDelta { party: p, .. } if *p == party)
        })
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} checks failed ({} of them)",
            self.operation,
            self.operation_id,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

fn serialize_bigint<S>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_str_radix(10))
}

// =============================================================================
// CHECKS
// =============================================================================

/// Signed change from `before` to `after`.
pub fn delta(before: &BigUint, after: &BigUint) -> BigInt {
    BigInt::from(after.clone()) - BigInt::from(before.clone())
}

fn expect_delta(
    failures: &mut Vec<ViolationType>,
    party: Party,
    stage: Stage,
    before: &BigUint,
    after: &BigUint,
    expected: BigInt,
) {
    let actual = delta(before, after);
    if actual != expected {
        failures.push(ViolationType::BalanceDelta {
            party,
            stage,
            expected,
            actual,
        });
    }
}

fn finish(
    operation: OperationKind,
    operation_id: &str,
    failures: Vec<ViolationType>,
) -> Result<(), InvariantViolation> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(InvariantViolation::new(operation, operation_id, failures))
    }
}

pub fn check_deposit(
    op: &Deposit,
    operation_id: &str,
    before: &DepositSnapshot,
    after: &DepositSnapshot,
) -> Result<(), InvariantViolation> {
    let mut failures = Vec::new();
    expect_delta(
        &mut failures,
        Party::DepositTarget,
        Stage::Committed,
        &before.target,
        &after.target,
        BigInt::from(op.amount.clone()),
    );
    finish(OperationKind::Deposit, operation_id, failures)
}

pub fn check_transfer(
    op: &Transfer,
    operation_id: &str,
    before: &TransferSnapshot,
    after: &TransferSnapshot,
) -> Result<(), InvariantViolation> {
    let amount = BigInt::from(op.amount.clone());
    let fee = BigInt::from(op.fee.clone());
    let mut failures = Vec::new();

    expect_delta(
        &mut failures,
        Party::Sender,
        Stage::Committed,
        &before.sender,
        &after.sender,
        -(&amount + &fee),
    );
    expect_delta(
        &mut failures,
        Party::Receiver,
        Stage::Committed,
        &before.receiver,
        &after.receiver,
        amount,
    );
    expect_delta(
        &mut failures,
        Party::Operator,
        Stage::Committed,
        &before.operator,
        &after.operator,
        fee,
    );

    finish(OperationKind::Transfer, operation_id, failures)
}

pub fn check_withdrawal(
    op: &Withdrawal,
    operation_id: &str,
    before: &WithdrawalSnapshot,
    after: &WithdrawalSnapshot,
) -> Result<(), InvariantViolation> {
    let amount = BigInt::from(op.amount.clone());
    let fee = BigInt::from(op.fee.clone());
    let mut failures = Vec::new();

    expect_delta(
        &mut failures,
        Party::Sender,
        Stage::Committed,
        &before.sender,
        &after.sender,
        -(&amount + &fee),
    );
    expect_delta(
        &mut failures,
        Party::Operator,
        Stage::Committed,
        &before.operator,
        &after.operator,
        fee,
    );
    expect_delta(
        &mut failures,
        Party::EffectiveChain,
        Stage::Chain,
        &before.effective_chain(),
        &after.effective_chain(),
        amount,
    );

    finish(OperationKind::Withdrawal, operation_id, failures)
}

pub fn check_key_registration(
    account: Address,
    operation_id: &str,
    set_after: bool,
) -> Result<(), InvariantViolation> {
    if set_after {
        Ok(())
    } else {
        Err(InvariantViolation::new(
            OperationKind::KeyRegistration,
            operation_id,
            vec![ViolationType::SigningKeyNotSet { account }],
        ))
    }
}

pub fn check_approval(
    operation: OperationKind,
    account: Address,
    token: &str,
    expected: bool,
    actual: bool,
) -> Result<(), InvariantViolation> {
    if expected == actual {
        Ok(())
    } else {
        Err(InvariantViolation::new(
            operation,
            format!("approval:{token}"),
            vec![ViolationType::ApprovalState {
                account,
                token: token.to_string(),
                expected,
                actual,
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepositMode, TokenInfo};

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn u(v: u64) -> BigUint {
        BigUint::from(v)
    }

    fn transfer(amount: u64, fee: u64) -> Transfer {
        Transfer {
            from: addr(1),
            to: addr(2),
            token: TokenInfo::native(),
            amount: u(amount),
            fee: u(fee),
        }
    }

    #[test]
    fn test_deposit_exact_credit_passes() {
        let op = Deposit {
            depositor: addr(9),
            target: addr(1),
            token: TokenInfo::native(),
            amount: u(500),
            mode: DepositMode::AutoApproved,
        };
        let before = DepositSnapshot { target: u(100) };
        assert!(check_deposit(&op, "p1", &before, &DepositSnapshot { target: u(600) }).is_ok());

        let err = check_deposit(&op, "p1", &before, &DepositSnapshot { target: u(599) }).unwrap_err();
        assert!(err.involves(Party::DepositTarget));
        assert_eq!(err.failures.len(), 1);
    }

    #[test]
    fn test_transfer_conservation_holds() {
        let op = transfer(1000, 40);
        let before = TransferSnapshot { sender: u(5000), receiver: u(0), operator: u(7) };
        let after = TransferSnapshot { sender: u(3960), receiver: u(1000), operator: u(47) };
        assert!(check_transfer(&op, "t1", &before, &after).is_ok());

        let total = delta(&before.sender, &after.sender)
            + delta(&before.receiver, &after.receiver)
            + delta(&before.operator, &after.operator);
        assert_eq!(total, BigInt::from(0));
    }

    #[test]
    fn test_transfer_reports_every_failed_identity() {
        let op = transfer(1000, 40);
        let before = TransferSnapshot { sender: u(5000), receiver: u(0), operator: u(0) };
        // Fee went to the receiver instead of the operator.
        let after = TransferSnapshot { sender: u(3960), receiver: u(1040), operator: u(0) };
        let err = check_transfer(&op, "t2", &before, &after).unwrap_err();
        assert!(!err.involves(Party::Sender));
        assert!(err.involves(Party::Receiver));
        assert!(err.involves(Party::Operator));
        assert_eq!(err.failures.len(), 2);
    }

    #[test]
    fn test_transfer_no_partial_credit() {
        let op = transfer(1000, 40);
        let before = TransferSnapshot { sender: u(5000), receiver: u(0), operator: u(0) };
        let after = TransferSnapshot { sender: u(3961), receiver: u(1000), operator: u(40) };
        let err = check_transfer(&op, "t3", &before, &after).unwrap_err();
        match &err.failures[0] {
            ViolationType::BalanceDelta { party, expected, actual, .. } => {
                assert_eq!(*party, Party::Sender);
                assert_eq!(*expected, BigInt::from(-1040));
                assert_eq!(*actual, BigInt::from(-1039));
            }
            other => panic!("unexpected failure {other:?}"),
        }
    }

    #[test]
    fn test_withdrawal_folds_pending_pool() {
        let op = Withdrawal {
            from: addr(2),
            to: addr(2),
            token: TokenInfo::native(),
            amount: u(900),
            fee: u(45),
        };
        let before = WithdrawalSnapshot {
            sender: u(2000),
            operator: u(10),
            chain_settled: u(50),
            chain_pending: u(0),
        };
        // Nothing settled yet, the whole amount sits in the pool.
        let pooled = WithdrawalSnapshot {
            sender: u(1055),
            operator: u(55),
            chain_settled: u(50),
            chain_pending: u(900),
        };
        assert!(check_withdrawal(&op, "w1", &before, &pooled).is_ok());

        let settled = WithdrawalSnapshot {
            chain_settled: u(950),
            chain_pending: u(0),
            ..pooled.clone()
        };
        assert!(check_withdrawal(&op, "w1", &before, &settled).is_ok());

        let short = WithdrawalSnapshot {
            chain_settled: u(949),
            ..settled
        };
        let err = check_withdrawal(&op, "w1", &before, &short).unwrap_err();
        assert!(err.involves(Party::EffectiveChain));
        assert!(err.to_string().contains("effective chain balance"));
    }

    #[test]
    fn test_key_registration_and_approval_checks() {
        assert!(check_key_registration(addr(3), "k", true).is_ok());
        let err = check_key_registration(addr(3), "k", false).unwrap_err();
        assert_eq!(err.operation, OperationKind::KeyRegistration);

        assert!(check_approval(OperationKind::Deposit, addr(1), "DAI", false, false).is_ok());
        let err = check_approval(OperationKind::Deposit, addr(1), "DAI", true, false).unwrap_err();
        assert!(matches!(err.failures[0], ViolationType::ApprovalState { expected: true, .. }));
    }
}
