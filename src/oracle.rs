//! Balance Oracle
//!
//! Read-only view over both ledgers. Every call samples the collaborators
//! afresh; nothing is cached between calls.

use num_bigint::BigUint;
use std::sync::Arc;
use tracing::debug;

use crate::clients::{approval_threshold, ChainClient, LedgerClient};
use crate::error::HarnessError;
use crate::models::{Address, KeyVariant, SigningKeyState, Stage, TokenInfo};

#[derive(Clone)]
pub struct BalanceOracle {
    ledger: Arc<dyn LedgerClient>,
    chain: Arc<dyn ChainClient>,
}

impl BalanceOracle {
    pub fn new(ledger: Arc<dyn LedgerClient>, chain: Arc<dyn ChainClient>) -> Self {
        Self { ledger, chain }
    }

    /// Balance of `account` at `stage`. Accounts or tokens the ledger has
    /// never seen read as zero.
    pub async fn balance_of(
        &self,
        account: Address,
        token: &TokenInfo,
        stage: Stage,
    ) -> Result<BigUint, HarnessError> {
        let balance = match stage {
            Stage::Chain => self.chain.balance(account, token).await?,
            Stage::Committed | Stage::Verified => {
                let state = self.ledger.account_state(account).await?;
                state
                    .layer(stage)
                    .map(|layer| layer.balance(&token.symbol))
                    .unwrap_or_default()
            }
        };
        debug!(%account, token = %token.symbol, %stage, %balance, "balance sampled");
        Ok(balance)
    }

    /// Amount the chain contract holds for `account`, not yet in its settled balance.
    pub async fn pending_withdrawal(&self, account: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        self.chain.pending_withdrawal(account, token).await
    }

    /// Settled chain balance plus pending withdrawal pool.
    pub async fn effective_chain_balance(
        &self,
        account: Address,
        token: &TokenInfo,
    ) -> Result<BigUint, HarnessError> {
        let settled = self.chain.balance(account, token).await?;
        let pending = self.chain.pending_withdrawal(account, token).await?;
        Ok(settled + pending)
    }

    /// Signing-key state as of the committed layer. A set key the ledger
    /// cannot attribute reports as `SetOffChain`, the default registration path.
    pub async fn signing_key_state(&self, account: Address) -> Result<SigningKeyState, HarnessError> {
        let state = self.ledger.account_state(account).await?;
        let layer = &state.committed;
        if layer.pub_key_hash.is_unset() {
            return Ok(SigningKeyState::Unset);
        }
        Ok(match layer.key_auth {
            Some(KeyVariant::OnChain) => SigningKeyState::SetOnChain,
            Some(KeyVariant::OffChain) | None => SigningKeyState::SetOffChain,
        })
    }

    pub async fn is_signing_key_set(&self, account: Address) -> Result<bool, HarnessError> {
        Ok(self.signing_key_state(account).await?.is_set())
    }

    /// Whether deposits of `token` from `account` need no further approval.
    /// The native token is always approved.
    pub async fn is_deposit_approved(&self, account: Address, token: &TokenInfo) -> Result<bool, HarnessError> {
        if token.is_native() {
            return Ok(true);
        }
        let allowance = self.chain.deposit_allowance(account, token).await?;
        Ok(allowance >= approval_threshold())
    }
}
