//! Operation Executor
//!
//! Turns an [`Operation`] into one or more collaborator calls and returns the
//! receipt of the rollup operation it produced:
//!
//! | Operation        | Chain calls                         | Rollup calls                   |
//! |------------------|-------------------------------------|--------------------------------|
//! | Deposit          | `approve` (auto, ERC20), `deposit`  | watch priority op              |
//! | Transfer         | -                                   | `tx_submit`                    |
//! | Withdrawal       | -                                   | `tx_submit`                    |
//! | KeyRegistration  | `setAuthPubkeyHash` (on-chain only) | `tx_submit` (`ChangePubKey`)   |
//!
//! Rollup nonces are read from the committed account state at submission time.

use num_bigint::BigUint;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clients::{max_allowance, ChainClient, ChainTxReceipt, LedgerClient, Signer};
use crate::context::AccountRegistry;
use crate::error::HarnessError;
use crate::models::{
    Address, Deposit, DepositMode, KeyRegistration, KeyVariant, Operation, OperationKind, RollupTx,
    SignedRollupTx, TokenInfo, Transfer, Withdrawal,
};
use crate::oracle::BalanceOracle;
use crate::receipt::ReceiptHandle;

#[derive(Clone)]
pub struct OperationExecutor {
    ledger: Arc<dyn LedgerClient>,
    chain: Arc<dyn ChainClient>,
    accounts: Arc<AccountRegistry>,
    oracle: BalanceOracle,
}

impl OperationExecutor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        chain: Arc<dyn ChainClient>,
        accounts: Arc<AccountRegistry>,
    ) -> Self {
        let oracle = BalanceOracle::new(ledger.clone(), chain.clone());
        Self {
            ledger,
            chain,
            accounts,
            oracle,
        }
    }

    /// Submit `operation`. Fails with `Submission` if a collaborator refuses
    /// it and with `Precondition` if a required prior state does not hold.
    pub async fn submit(&self, operation: &Operation) -> Result<ReceiptHandle, HarnessError> {
        let handle = match operation {
            Operation::Deposit(deposit) => self.submit_deposit(deposit).await?,
            Operation::Transfer(transfer) => self.submit_transfer(transfer).await?,
            Operation::Withdrawal(withdrawal) => self.submit_withdrawal(withdrawal).await?,
            Operation::KeyRegistration(registration) => self.submit_key_registration(registration).await?,
        };
        debug!(
            operation = %operation.kind(),
            actor = %operation.actor(),
            id = handle.id(),
            "operation submitted"
        );
        Ok(handle)
    }

    /// Approve the rollup contract for unlimited deposits of `token`.
    pub async fn approve_deposits(&self, account: Address, token: &TokenInfo) -> Result<ChainTxReceipt, HarnessError> {
        let receipt = self
            .chain
            .approve_deposits(account, token, &max_allowance())
            .await?;
        info!(%account, token = %token.symbol, tx = %receipt.hash, "unlimited deposit approval mined");
        Ok(receipt)
    }

    /// Chain value or ERC20 transfer, awaited until mined.
    pub async fn fund_account(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        let receipt = self.chain.transfer(from, to, token, amount).await?;
        debug!(%from, %to, token = %token.symbol, %amount, block = receipt.block, "account funded");
        Ok(receipt)
    }

    fn signer_for(&self, account: Address, operation: OperationKind) -> Result<Arc<dyn Signer>, HarnessError> {
        self.accounts
            .signer(account)
            .ok_or_else(|| HarnessError::precondition(operation, format!("no signer for account {account}")))
    }

    async fn committed_nonce(&self, account: Address) -> Result<u32, HarnessError> {
        Ok(self.ledger.account_state(account).await?.committed.nonce)
    }

    async fn submit_deposit(&self, deposit: &Deposit) -> Result<ReceiptHandle, HarnessError> {
        let token = &deposit.token;
        if !token.is_native() {
            match deposit.mode {
                DepositMode::AutoApproved => {
                    let receipt = self
                        .chain
                        .approve_deposits(deposit.depositor, token, &deposit.amount)
                        .await?;
                    debug!(token = %token.symbol, tx = %receipt.hash, "deposit amount approved");
                }
                DepositMode::PreApproved => {
                    if !self.oracle.is_deposit_approved(deposit.depositor, token).await? {
                        return Err(HarnessError::precondition(
                            OperationKind::Deposit,
                            format!("{} deposits from {} are not approved", token.symbol, deposit.depositor),
                        ));
                    }
                }
            }
        }

        let serial_id = self
            .chain
            .deposit(deposit.depositor, deposit.target, token, &deposit.amount)
            .await?;
        self.ledger.watch_priority_op(serial_id).await
    }

    async fn submit_transfer(&self, transfer: &Transfer) -> Result<ReceiptHandle, HarnessError> {
        let signer = self.signer_for(transfer.from, OperationKind::Transfer)?;
        let tx = RollupTx::Transfer {
            from: transfer.from,
            to: transfer.to,
            token: transfer.token.id,
            amount: transfer.amount.clone(),
            fee: transfer.fee.clone(),
            nonce: self.committed_nonce(transfer.from).await?,
        };
        self.sign_and_submit(signer.as_ref(), tx, None).await
    }

    async fn submit_withdrawal(&self, withdrawal: &Withdrawal) -> Result<ReceiptHandle, HarnessError> {
        let signer = self.signer_for(withdrawal.from, OperationKind::Withdrawal)?;
        let tx = RollupTx::Withdraw {
            from: withdrawal.from,
            to: withdrawal.to,
            token: withdrawal.token.id,
            amount: withdrawal.amount.clone(),
            fee: withdrawal.fee.clone(),
            nonce: self.committed_nonce(withdrawal.from).await?,
        };
        self.sign_and_submit(signer.as_ref(), tx, None).await
    }

    async fn submit_key_registration(&self, registration: &KeyRegistration) -> Result<ReceiptHandle, HarnessError> {
        let account = registration.account;
        let signer = self.signer_for(account, OperationKind::KeyRegistration)?;
        let new_pk_hash = signer.pub_key_hash().await?;
        let nonce = self.committed_nonce(account).await?;

        let (onchain_auth, eth_signature) = match registration.variant {
            KeyVariant::OnChain => {
                let receipt = self
                    .chain
                    .authorize_signing_key(account, new_pk_hash, nonce)
                    .await?;
                debug!(%account, block = receipt.block, "signing key authorized on chain");
                (true, None)
            }
            KeyVariant::OffChain => (false, Some(signer.sign_key_authorization(new_pk_hash, nonce).await?)),
        };

        let tx = RollupTx::ChangePubKey {
            account,
            new_pk_hash,
            nonce,
            onchain_auth,
        };
        self.sign_and_submit(signer.as_ref(), tx, eth_signature).await
    }

    async fn sign_and_submit(
        &self,
        signer: &dyn Signer,
        tx: RollupTx,
        eth_signature: Option<String>,
    ) -> Result<ReceiptHandle, HarnessError> {
        let signature = signer.sign(&tx).await?;
        self.ledger
            .submit_tx(SignedRollupTx {
                tx,
                signature,
                eth_signature,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use crate::sim::{SimNetwork, SimNetworkConfig};
    use std::time::Duration;

    struct Fixture {
        net: Arc<SimNetwork>,
        executor: OperationExecutor,
        oracle: BalanceOracle,
        alice: Address,
        bob: Address,
        erc20: TokenInfo,
    }

    fn fixture() -> Fixture {
        let net = SimNetwork::start(SimNetworkConfig {
            commit_latency: Duration::from_millis(5),
            verify_latency: Duration::from_millis(5),
            ..SimNetworkConfig::default()
        });
        let alice = net.create_account();
        let bob = net.create_account();
        let accounts = Arc::new(AccountRegistry::new(
            alice.address(),
            alice.clone(),
            alice.clone(),
            vec![bob.clone() as Arc<dyn Signer>],
        ));
        let erc20 = net.tokens()[1].clone();
        net.mint(alice.address(), &erc20, &BigUint::from(1_000u32));
        net.mint(alice.address(), &TokenInfo::native(), &BigUint::from(1_000u32));
        Fixture {
            executor: OperationExecutor::new(net.clone(), net.clone(), accounts),
            oracle: BalanceOracle::new(net.clone(), net.clone()),
            alice: alice.address(),
            bob: bob.address(),
            erc20,
            net,
        }
    }

    fn deposit(f: &Fixture, token: &TokenInfo, mode: DepositMode) -> Operation {
        Operation::Deposit(Deposit {
            depositor: f.alice,
            target: f.alice,
            token: token.clone(),
            amount: BigUint::from(100u32),
            mode,
        })
    }

    #[tokio::test]
    async fn test_pre_approved_deposit_without_approval_is_precondition() {
        let f = fixture();
        let err = f
            .executor
            .submit(&deposit(&f, &f.erc20, DepositMode::PreApproved))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Precondition { .. }), "{err}");
        // Never approves on the caller's behalf.
        assert_eq!(f.net.deposit_allowance(f.alice, &f.erc20).await.unwrap(), BigUint::ZERO);
        assert_eq!(
            f.oracle.balance_of(f.alice, &f.erc20, Stage::Chain).await.unwrap(),
            BigUint::from(1_000u32)
        );
    }

    #[tokio::test]
    async fn test_auto_approved_deposit_approves_exact_amount() {
        let f = fixture();
        let mut handle = f
            .executor
            .submit(&deposit(&f, &f.erc20, DepositMode::AutoApproved))
            .await
            .unwrap();
        handle.await_committed().await.unwrap();
        assert_eq!(
            f.oracle.balance_of(f.alice, &f.erc20, Stage::Committed).await.unwrap(),
            BigUint::from(100u32)
        );
        // The exact approval was consumed by the deposit.
        assert!(!f.oracle.is_deposit_approved(f.alice, &f.erc20).await.unwrap());
    }

    #[tokio::test]
    async fn test_native_deposit_bypasses_approval_in_both_modes() {
        let f = fixture();
        let eth = TokenInfo::native();
        for mode in [DepositMode::PreApproved, DepositMode::AutoApproved] {
            let mut handle = f.executor.submit(&deposit(&f, &eth, mode)).await.unwrap();
            handle.await_committed().await.unwrap();
        }
        assert_eq!(
            f.oracle.balance_of(f.alice, &eth, Stage::Committed).await.unwrap(),
            BigUint::from(200u32)
        );
    }

    #[tokio::test]
    async fn test_key_registration_variants_and_nonces() {
        let f = fixture();
        let eth = TokenInfo::native();
        f.executor
            .submit(&deposit(&f, &eth, DepositMode::AutoApproved))
            .await
            .unwrap()
            .await_committed()
            .await
            .unwrap();

        let mut handle = f
            .executor
            .submit(&Operation::KeyRegistration(KeyRegistration {
                account: f.alice,
                variant: KeyVariant::OnChain,
            }))
            .await
            .unwrap();
        handle.await_committed().await.unwrap();
        assert!(f.oracle.is_signing_key_set(f.alice).await.unwrap());

        let mut handle = f
            .executor
            .submit(&Operation::Transfer(Transfer {
                from: f.alice,
                to: f.bob,
                token: eth.clone(),
                amount: BigUint::from(40u32),
                fee: BigUint::from(2u32),
            }))
            .await
            .unwrap();
        handle.await_committed().await.unwrap();

        let mut handle = f
            .executor
            .submit(&Operation::KeyRegistration(KeyRegistration {
                account: f.bob,
                variant: KeyVariant::OffChain,
            }))
            .await
            .unwrap();
        handle.await_verified().await.unwrap();
        assert!(f.oracle.is_signing_key_set(f.bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_actor_is_precondition() {
        let f = fixture();
        let stranger = Address([0x99; 20]);
        let err = f
            .executor
            .submit(&Operation::Transfer(Transfer {
                from: stranger,
                to: f.alice,
                token: TokenInfo::native(),
                amount: BigUint::from(1u32),
                fee: BigUint::ZERO,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_unlimited_approval_and_funding() {
        let f = fixture();
        f.executor.approve_deposits(f.alice, &f.erc20).await.unwrap();
        assert!(f.oracle.is_deposit_approved(f.alice, &f.erc20).await.unwrap());

        f.executor
            .fund_account(f.alice, f.bob, &f.erc20, &BigUint::from(250u32))
            .await
            .unwrap();
        assert_eq!(
            f.oracle.balance_of(f.bob, &f.erc20, Stage::Chain).await.unwrap(),
            BigUint::from(250u32)
        );
        let err = f
            .executor
            .fund_account(f.bob, f.alice, &f.erc20, &BigUint::from(251u32))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Submission { operation: OperationKind::Funding, .. }
        ));
        assert_eq!(err.exit_code(), 2);
    }
}
