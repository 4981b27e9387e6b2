//! Receipt Handle
//!
//! Lifecycle of one submitted operation:
//!
//! ```text
//! Submitted ──► Committed ──► Verified
//!     │  └────────────────────────▲
//!     └──► Rejected
//! ```
//!
//! The backend that owns an operation publishes status changes through a
//! [`ReceiptPublisher`]; the scenario awaits them on the paired
//! [`ReceiptHandle`]. Regressions and transitions out of a terminal state are
//! dropped.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::models::{OperationKind, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    Submitted,
    Committed { block: u64 },
    Verified { block: u64 },
    Rejected { reason: String },
}

impl ReceiptStatus {
    fn rank(&self) -> u8 {
        match self {
            ReceiptStatus::Submitted => 0,
            ReceiptStatus::Committed { .. } => 1,
            ReceiptStatus::Verified { .. } => 2,
            ReceiptStatus::Rejected { .. } => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiptStatus::Verified { .. } | ReceiptStatus::Rejected { .. }
        )
    }

    /// Whether the status satisfies a wait for `stage`. Verification implies commitment.
    pub fn has_reached(&self, stage: Stage) -> bool {
        match stage {
            Stage::Committed => matches!(
                self,
                ReceiptStatus::Committed { .. } | ReceiptStatus::Verified { .. }
            ),
            Stage::Verified | Stage::Chain => matches!(self, ReceiptStatus::Verified { .. }),
        }
    }

    pub fn can_transition_to(&self, next: &ReceiptStatus) -> bool {
        match (self, next) {
            (ReceiptStatus::Submitted, ReceiptStatus::Rejected { .. }) => true,
            (_, ReceiptStatus::Rejected { .. }) => false,
            (current, next) => !current.is_terminal() && next.rank() > current.rank(),
        }
    }
}

/// Upper bounds for each confirmation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationBounds {
    pub committed: Duration,
    pub verified: Duration,
}

impl Default for ConfirmationBounds {
    fn default() -> Self {
        Self {
            committed: Duration::from_secs(60),
            verified: Duration::from_secs(300),
        }
    }
}

/// Create a receipt in the `Submitted` state.
pub fn receipt_channel(
    operation: OperationKind,
    operation_id: impl Into<String>,
    bounds: ConfirmationBounds,
) -> (ReceiptPublisher, ReceiptHandle) {
    let operation_id = operation_id.into();
    let (tx, rx) = watch::channel(ReceiptStatus::Submitted);
    (
        ReceiptPublisher {
            operation,
            operation_id: operation_id.clone(),
            tx,
        },
        ReceiptHandle {
            operation,
            operation_id,
            rx,
            bounds,
        },
    )
}

/// Write side of a receipt, held by the ledger backend.
#[derive(Debug)]
pub struct ReceiptPublisher {
    operation: OperationKind,
    operation_id: String,
    tx: watch::Sender<ReceiptStatus>,
}

impl ReceiptPublisher {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn current(&self) -> ReceiptStatus {
        self.tx.borrow().clone()
    }

    /// Apply `next` if it is a legal transition. Returns whether it was applied.
    pub fn advance(&self, next: ReceiptStatus) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                *current = next.clone();
                applied = true;
                true
            } else {
                false
            }
        });
        if applied {
            debug!(
                operation = %self.operation,
                id = %self.operation_id,
                status = ?next,
                "receipt advanced"
            );
        } else if self.current() != next {
            warn!(
                operation = %self.operation,
                id = %self.operation_id,
                current = ?self.current(),
                attempted = ?next,
                "illegal receipt transition ignored"
            );
        }
        applied
    }

    /// True once every handle has been dropped.
    pub fn is_orphaned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Awaitable view of a submitted operation.
#[derive(Debug, Clone)]
pub struct ReceiptHandle {
    operation: OperationKind,
    operation_id: String,
    rx: watch::Receiver<ReceiptStatus>,
    bounds: ConfirmationBounds,
}

impl ReceiptHandle {
    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn id(&self) -> &str {
        &self.operation_id
    }

    pub fn status(&self) -> ReceiptStatus {
        self.rx.borrow().clone()
    }

    /// Suspend until the operation is included in a committed block.
    pub async fn await_committed(&mut self) -> Result<ReceiptStatus, HarnessError> {
        let bound = self.bounds.committed;
        self.wait_for(Stage::Committed, bound).await
    }

    /// Suspend until the block containing the operation is verified.
    pub async fn await_verified(&mut self) -> Result<ReceiptStatus, HarnessError> {
        let bound = self.bounds.verified;
        self.wait_for(Stage::Verified, bound).await
    }

    async fn wait_for(&mut self, stage: Stage, bound: Duration) -> Result<ReceiptStatus, HarnessError> {
        let operation = self.operation;
        let operation_id = self.operation_id.clone();
        let rx = &mut self.rx;

        let waited = tokio::time::timeout(bound, async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(outcome) = settle(&current, stage, operation, &operation_id) {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return settle(&last, stage, operation, &operation_id).unwrap_or_else(|| {
                        Err(HarnessError::Transport(format!(
                            "receipt source for {operation} {operation_id} closed before {stage}"
                        )))
                    });
                }
            }
        })
        .await;

        match waited {
            Ok(outcome) => outcome,
            Err(_) => Err(HarnessError::ConfirmationTimeout {
                operation,
                operation_id: self.operation_id.clone(),
                stage,
                waited: bound,
            }),
        }
    }
}

fn settle(
    status: &ReceiptStatus,
    stage: Stage,
    operation: OperationKind,
    operation_id: &str,
) -> Option<Result<ReceiptStatus, HarnessError>> {
    if status.has_reached(stage) {
        return Some(Ok(status.clone()));
    }
    if let ReceiptStatus::Rejected { reason } = status {
        return Some(Err(HarnessError::Rejected {
            operation,
            operation_id: operation_id.to_string(),
            reason: reason.clone(),
        }));
    }
    None
}

/// Drive a publisher from a status query until the receipt is terminal or
/// nobody is listening any more. Query failures are logged and retried.
pub fn spawn_status_poller<F, Fut>(
    publisher: ReceiptPublisher,
    interval: Duration,
    mut query: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<ReceiptStatus>, HarnessError>> + Send,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if publisher.is_orphaned() {
                debug!(id = %publisher.operation_id(), "receipt poller stopped, no listeners");
                return;
            }
            match query().await {
                Ok(Some(status)) => {
                    publisher.advance(status);
                }
                Ok(None) => {}
                Err(e) => warn!(id = %publisher.operation_id(), error = %e, "receipt status query failed"),
            }
            if publisher.current().is_terminal() {
                debug!(
                    id = %publisher.operation_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "receipt reached terminal state"
                );
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(ms: u64) -> ConfirmationBounds {
        ConfirmationBounds {
            committed: Duration::from_millis(ms),
            verified: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_transition_rules() {
        let submitted = ReceiptStatus::Submitted;
        let committed = ReceiptStatus::Committed { block: 3 };
        let verified = ReceiptStatus::Verified { block: 3 };
        let rejected = ReceiptStatus::Rejected { reason: "nonce mismatch".into() };

        assert!(submitted.can_transition_to(&committed));
        assert!(submitted.can_transition_to(&verified));
        assert!(submitted.can_transition_to(&rejected));
        assert!(committed.can_transition_to(&verified));

        assert!(!committed.can_transition_to(&submitted));
        assert!(!committed.can_transition_to(&rejected));
        assert!(!verified.can_transition_to(&committed));
        assert!(!rejected.can_transition_to(&committed));
    }

    #[tokio::test]
    async fn test_await_committed_then_verified() {
        let (publisher, mut handle) = receipt_channel(OperationKind::Transfer, "0xaa", bounds(1_000));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.advance(ReceiptStatus::Committed { block: 1 });
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.advance(ReceiptStatus::Verified { block: 1 });
        });

        let committed = handle.await_committed().await.unwrap();
        assert!(committed.has_reached(Stage::Committed));
        let verified = handle.await_verified().await.unwrap();
        assert_eq!(verified, ReceiptStatus::Verified { block: 1 });
        // Already verified: waiting for commitment returns immediately.
        assert!(handle.await_committed().await.is_ok());
    }

    #[tokio::test]
    async fn test_rejection_surfaces_reason() {
        let (publisher, mut handle) = receipt_channel(OperationKind::Withdrawal, "0xbb", bounds(1_000));
        publisher.advance(ReceiptStatus::Rejected { reason: "insufficient balance".into() });
        match handle.await_committed().await {
            Err(HarnessError::Rejected { reason, operation_id, .. }) => {
                assert_eq!(reason, "insufficient balance");
                assert_eq!(operation_id, "0xbb");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_when_never_committed() {
        let (_publisher, mut handle) = receipt_channel(OperationKind::Deposit, "7", bounds(20));
        match handle.await_committed().await {
            Err(HarnessError::ConfirmationTimeout { stage, .. }) => assert_eq!(stage, Stage::Committed),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_source_before_stage_is_transport_error() {
        let (publisher, mut handle) = receipt_channel(OperationKind::Deposit, "8", bounds(1_000));
        publisher.advance(ReceiptStatus::Committed { block: 2 });
        drop(publisher);
        assert!(handle.await_committed().await.is_ok());
        assert!(matches!(handle.await_verified().await, Err(HarnessError::Transport(_))));
    }

    #[tokio::test]
    async fn test_poller_drives_publisher() {
        let (publisher, mut handle) = receipt_channel(OperationKind::Transfer, "0xcc", bounds(1_000));
        let mut calls = 0u32;
        spawn_status_poller(publisher, Duration::from_millis(5), move || {
            calls += 1;
            let status = match calls {
                1 => None,
                2 => Some(ReceiptStatus::Committed { block: 4 }),
                _ => Some(ReceiptStatus::Verified { block: 4 }),
            };
            async move { Ok(status) }
        });
        assert_eq!(handle.await_verified().await.unwrap(), ReceiptStatus::Verified { block: 4 });
    }
}
