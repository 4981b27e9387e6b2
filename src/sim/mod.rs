//! In-process simulated chain + rollup.
//!
//! Implements [`LedgerClient`] and [`ChainClient`] over shared maps. Accepted
//! operations flow through a two-stage block pipeline: a committer task puts
//! each one into a block after `commit_latency`, a verifier task verifies that
//! block after a further `verify_latency`. Receipts are advanced by those tasks.

mod signer;
mod state;

pub use signer::SimSigner;
pub use state::Faults;

use async_trait::async_trait;
use num_bigint::BigUint;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::clients::{ChainClient, ChainTxReceipt, LedgerClient};
use crate::error::HarnessError;
use crate::models::{
    AccountState, Address, OperationKind, PubKeyHash, SignedRollupTx, TokenInfo, TokenLike,
};
use crate::receipt::{receipt_channel, ConfirmationBounds, ReceiptHandle, ReceiptStatus};
use state::{apply_effect, tx_hash, Outcome, QueuedOp, SimState};

#[derive(Debug, Clone)]
pub struct SimNetworkConfig {
    pub commit_latency: Duration,
    pub verify_latency: Duration,
    /// Push verified withdrawals straight to the settled balance instead of
    /// leaving them in the pending pool.
    pub auto_complete_withdrawals: bool,
    pub operator: Address,
    pub contract: Address,
    /// ERC20 tokens registered next to the native token (ids from 1).
    pub erc20_tokens: Vec<(String, Address, u8)>,
    pub bounds: ConfirmationBounds,
}

impl Default for SimNetworkConfig {
    fn default() -> Self {
        Self {
            commit_latency: Duration::from_millis(20),
            verify_latency: Duration::from_millis(40),
            auto_complete_withdrawals: false,
            operator: Address([0x0f; 20]),
            contract: Address([0xc0; 20]),
            erc20_tokens: vec![("TST".to_string(), Address([0xe2; 20]), 18)],
            bounds: ConfirmationBounds::default(),
        }
    }
}

struct Committed {
    block: u64,
    op: QueuedOp,
}

pub struct SimNetwork {
    config: SimNetworkConfig,
    state: Arc<Mutex<SimState>>,
    pipeline: mpsc::UnboundedSender<QueuedOp>,
}

impl SimNetwork {
    /// Start the network. Must be called inside a tokio runtime.
    pub fn start(config: SimNetworkConfig) -> Arc<Self> {
        let mut tokens = vec![TokenInfo::native()];
        for (i, (symbol, address, decimals)) in config.erc20_tokens.iter().enumerate() {
            tokens.push(TokenInfo {
                id: (i + 1) as u16,
                symbol: symbol.clone(),
                address: *address,
                decimals: *decimals,
            });
        }
        info!(
            tokens = tokens.len(),
            operator = %config.operator,
            commit_ms = config.commit_latency.as_millis() as u64,
            verify_ms = config.verify_latency.as_millis() as u64,
            "starting simulated network"
        );

        let state = Arc::new(Mutex::new(SimState::new(tokens, config.operator)));
        let pipeline = spawn_pipeline(state.clone(), &config);
        Arc::new(Self {
            config,
            state,
            pipeline,
        })
    }

    pub fn tokens(&self) -> Vec<TokenInfo> {
        self.state.lock().tokens.clone()
    }

    pub fn operator(&self) -> Address {
        self.config.operator
    }

    /// New account whose key material the network can verify.
    pub fn create_account(&self) -> Arc<SimSigner> {
        let signer = SimSigner::random();
        self.state
            .lock()
            .register_secret(crate::clients::Signer::address(&signer), signer.secret());
        Arc::new(signer)
    }

    /// Credit chain funds out of thin air.
    pub fn mint(&self, owner: Address, token: &TokenInfo, amount: &BigUint) {
        self.state.lock().mint(owner, token.id, amount);
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    /// Move `owner`'s pending withdrawal pool to its settled balance.
    pub fn complete_withdrawals(&self, owner: Address, token: &TokenInfo) -> BigUint {
        self.state.lock().complete_withdrawal(owner, token.id)
    }

    fn enqueue(&self, state: &mut SimState, op: QueuedOp) -> Result<(), HarnessError> {
        if state.faults.stall_blocks {
            debug!(id = %op.publisher.operation_id(), "operation stalled");
            state.stalled.push(op.publisher);
            return Ok(());
        }
        self.pipeline
            .send(op)
            .map_err(|_| HarnessError::Transport("simulated block pipeline stopped".into()))
    }
}

fn spawn_pipeline(state: Arc<Mutex<SimState>>, config: &SimNetworkConfig) -> mpsc::UnboundedSender<QueuedOp> {
    let (submit_tx, mut submit_rx) = mpsc::unbounded_channel::<QueuedOp>();
    let (verify_tx, mut verify_rx) = mpsc::unbounded_channel::<Committed>();

    let commit_latency = config.commit_latency;
    let committer_state = state.clone();
    tokio::spawn(async move {
        while let Some(op) = submit_rx.recv().await {
            tokio::time::sleep(commit_latency).await;
            let block = {
                let mut state = committer_state.lock();
                match &op.outcome {
                    Outcome::Reject(reason) => {
                        op.publisher.advance(ReceiptStatus::Rejected {
                            reason: reason.clone(),
                        });
                        None
                    }
                    Outcome::Apply(effect) => {
                        apply_effect(&mut state.committed, effect);
                        state.settle_committed(effect);
                        Some(state.next_rollup_block())
                    }
                }
            };
            if let Some(block) = block {
                op.publisher.advance(ReceiptStatus::Committed { block });
                if verify_tx.send(Committed { block, op }).is_err() {
                    return;
                }
            }
        }
        debug!("simulated committer stopped");
    });

    let verify_latency = config.verify_latency;
    let auto_complete = config.auto_complete_withdrawals;
    tokio::spawn(async move {
        while let Some(Committed { block, op }) = verify_rx.recv().await {
            tokio::time::sleep(verify_latency).await;
            let mut state = state.lock();
            if let Outcome::Apply(effect) = &op.outcome {
                apply_effect(&mut state.verified, effect);
                state.settle_verified(effect, auto_complete);
            }
            op.publisher.advance(ReceiptStatus::Verified { block });
        }
        debug!("simulated verifier stopped");
    });

    submit_tx
}

#[async_trait]
impl LedgerClient for SimNetwork {
    async fn account_state(&self, address: Address) -> Result<AccountState, HarnessError> {
        Ok(self.state.lock().account_state(address))
    }

    async fn resolve_token(&self, token: TokenLike) -> Result<TokenInfo, HarnessError> {
        let state = self.state.lock();
        state
            .tokens
            .iter()
            .find(|info| info.token_like() == token)
            .cloned()
            .ok_or_else(|| HarnessError::Config(format!("token {token} is not registered on the rollup")))
    }

    async fn contract_address(&self) -> Result<Address, HarnessError> {
        Ok(self.config.contract)
    }

    async fn submit_tx(&self, tx: SignedRollupTx) -> Result<ReceiptHandle, HarnessError> {
        let operation = tx.tx.kind();
        let hash = tx_hash(&tx);
        let mut state = self.state.lock();

        let effect = state
            .validate(&tx)
            .map_err(|reason| HarnessError::submission(operation, reason))?;
        let (publisher, handle) = receipt_channel(operation, hash.clone(), self.config.bounds);

        let outcome = match state.faults.reject_next.take() {
            Some(reason) => Outcome::Reject(reason),
            None => {
                state.execute(&effect);
                Outcome::Apply(effect)
            }
        };
        self.enqueue(&mut state, QueuedOp { outcome, publisher })?;
        debug!(%operation, %hash, "simulated rollup accepted transaction");
        Ok(handle)
    }

    async fn watch_priority_op(&self, serial_id: u64) -> Result<ReceiptHandle, HarnessError> {
        self.state
            .lock()
            .priority_ops
            .remove(&serial_id)
            .ok_or_else(|| HarnessError::Transport(format!("unknown priority operation {serial_id}")))
    }

    async fn disconnect(&self) -> Result<(), HarnessError> {
        let state = self.state.lock();
        info!(
            pending_priority_ops = state.priority_ops.len(),
            stalled = state.stalled.len(),
            "simulated rollup client disconnected"
        );
        Ok(())
    }
}

#[async_trait]
impl ChainClient for SimNetwork {
    async fn balance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        Ok(self.state.lock().chain_balance(owner, token.id))
    }

    async fn pending_withdrawal(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        Ok(self.state.lock().pending_withdrawal(owner, token.id))
    }

    async fn deposit_allowance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        if token.is_native() {
            return Ok(crate::clients::max_allowance());
        }
        Ok(self.state.lock().allowance(owner, token.id))
    }

    async fn approve_deposits(
        &self,
        owner: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        Ok(self.state.lock().approve(owner, token, amount))
    }

    async fn deposit(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<u64, HarnessError> {
        let mut state = self.state.lock();
        let (serial, effect) = state.lock_deposit(from, to, token, amount)?;
        let (publisher, handle) =
            receipt_channel(OperationKind::Deposit, serial.to_string(), self.config.bounds);
        state.priority_ops.insert(serial, handle);
        self.enqueue(
            &mut state,
            QueuedOp {
                outcome: Outcome::Apply(effect),
                publisher,
            },
        )?;
        Ok(serial)
    }

    async fn authorize_signing_key(
        &self,
        account: Address,
        pub_key_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<ChainTxReceipt, HarnessError> {
        Ok(self.state.lock().authorize_key(account, pub_key_hash, nonce))
    }

    async fn transfer(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        self.state.lock().chain_transfer(from, to, token, amount)
    }
}
