//! Collaborator seams: rollup ledger, chain, and account signers.
//!
//! The harness only talks to the two networks through these traits. Two
//! families of implementations exist: JSON-RPC over HTTP (`rollup_rpc`,
//! `eth_rpc`, `remote_signer`) and the in-process simulated network in
//! [`crate::sim`].

pub mod abi;
pub mod eth_rpc;
pub mod remote_signer;
pub mod rollup_rpc;

use async_trait::async_trait;
use num_bigint::BigUint;

use crate::error::HarnessError;
use crate::models::{AccountState, Address, PubKeyHash, RollupTx, SignedRollupTx, TokenInfo, TokenLike};
use crate::receipt::ReceiptHandle;

pub use eth_rpc::EthRpcClient;
pub use remote_signer::RemoteSigner;
pub use rollup_rpc::RollupRpcClient;

/// Allowance at or above which ERC20 deposits count as approved "forever".
pub fn approval_threshold() -> BigUint {
    BigUint::from(1u32) << 255usize
}

/// Largest ERC20 allowance, `2^256 - 1`.
pub fn max_allowance() -> BigUint {
    (BigUint::from(1u32) << 256usize) - BigUint::from(1u32)
}

/// A mined chain transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTxReceipt {
    pub hash: String,
    pub block: u64,
}

/// Off-chain ledger client.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Account state at both confirmation stages. Unknown accounts are empty, not errors.
    async fn account_state(&self, address: Address) -> Result<AccountState, HarnessError>;

    /// Resolve a token through the ledger's registry.
    async fn resolve_token(&self, token: TokenLike) -> Result<TokenInfo, HarnessError>;

    /// Address of the rollup contract on the chain.
    async fn contract_address(&self) -> Result<Address, HarnessError>;

    /// Submit a signed operation. Fails with `Submission` if rejected outright.
    async fn submit_tx(&self, tx: SignedRollupTx) -> Result<ReceiptHandle, HarnessError>;

    /// Receipt for a priority operation (deposit) queued by the chain contract.
    async fn watch_priority_op(&self, serial_id: u64) -> Result<ReceiptHandle, HarnessError>;

    async fn disconnect(&self) -> Result<(), HarnessError>;
}

/// Chain client plus the rollup contract bindings the harness needs.
/// Every transaction method returns once the transaction is mined.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Settled chain balance.
    async fn balance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError>;

    /// Contract-held pool owed to `owner` but not yet pushed to its balance.
    async fn pending_withdrawal(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError>;

    /// ERC20 allowance granted by `owner` to the rollup contract.
    async fn deposit_allowance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError>;

    async fn approve_deposits(
        &self,
        owner: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError>;

    /// Deposit into the rollup; returns the serial id of the priority operation.
    async fn deposit(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<u64, HarnessError>;

    /// Authorize a rollup signing key on chain (`setAuthPubkeyHash`).
    async fn authorize_signing_key(
        &self,
        account: Address,
        pub_key_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<ChainTxReceipt, HarnessError>;

    /// Native value transfer or ERC20 `transfer`.
    async fn transfer(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError>;
}

/// Signing material of one account. Keys never leave the implementation.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    /// Hash of the rollup signing key this signer would register.
    async fn pub_key_hash(&self) -> Result<PubKeyHash, HarnessError>;

    /// Rollup-key signature over `tx`, hex encoded.
    async fn sign(&self, tx: &RollupTx) -> Result<String, HarnessError>;

    /// Chain-key signature authorizing `new_pk_hash` at `nonce`, hex encoded.
    async fn sign_key_authorization(
        &self,
        new_pk_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<String, HarnessError>;
}
