//! Book-keeping of the simulated network.
//!
//! The rollup keeps three views of every account: `executed` (what submission
//! validation sees), `committed` and `verified`. Effects are applied to
//! `executed` on acceptance and replayed onto the other two by the block
//! pipeline, in submission order.

use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

use super::signer::{authorization_message, pub_key_hash_of, rollup_message, verify_message};
use crate::clients::{max_allowance, ChainTxReceipt};
use crate::error::HarnessError;
use crate::models::{
    AccountState, Address, KeyVariant, LayerState, OperationKind, PubKeyHash, RollupTx, SignedRollupTx,
    TokenInfo,
};
use crate::receipt::{ReceiptHandle, ReceiptPublisher};

/// Misbehaviour the simulated operator can be told to exhibit.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Credit transfer and withdrawal fees here instead of the operator.
    pub misroute_fees_to: Option<Address>,
    /// Accept the next rollup transaction, then reject it at block time.
    pub reject_next: Option<String>,
    /// Accept operations but never put them into a block.
    pub stall_blocks: bool,
}

/// A state change replayed onto each rollup layer.
#[derive(Debug, Clone)]
pub(crate) enum LedgerEffect {
    Credit {
        account: Address,
        token: TokenInfo,
        amount: BigUint,
    },
    Transfer {
        from: Address,
        to: Address,
        token: TokenInfo,
        amount: BigUint,
        fee: BigUint,
        fee_to: Address,
    },
    Withdraw {
        from: Address,
        to: Address,
        token: TokenInfo,
        amount: BigUint,
        fee: BigUint,
        fee_to: Address,
    },
    SetKey {
        account: Address,
        pub_key_hash: PubKeyHash,
        variant: KeyVariant,
    },
}

pub(crate) enum Outcome {
    Apply(LedgerEffect),
    Reject(String),
}

/// An accepted operation waiting for its block.
pub(crate) struct QueuedOp {
    pub outcome: Outcome,
    pub publisher: ReceiptPublisher,
}

type Layer = HashMap<Address, LayerState>;

fn credit(layer: &mut Layer, account: Address, symbol: &str, amount: &BigUint) {
    let entry = layer.entry(account).or_default();
    let balance = entry.balances.entry(symbol.to_string()).or_default();
    *balance += amount;
}

fn debit(layer: &mut Layer, account: Address, symbol: &str, amount: &BigUint) {
    let entry = layer.entry(account).or_default();
    let balance = entry.balances.entry(symbol.to_string()).or_default();
    if *balance < *amount {
        warn!(%account, symbol, "debit exceeds balance, clamping to zero");
        *balance = BigUint::ZERO;
    } else {
        *balance -= amount;
    }
}

fn bump_nonce(layer: &mut Layer, account: Address) {
    layer.entry(account).or_default().nonce += 1;
}

pub(crate) fn apply_effect(layer: &mut Layer, effect: &LedgerEffect) {
    match effect {
        LedgerEffect::Credit { account, token, amount } => {
            credit(layer, *account, &token.symbol, amount);
        }
        LedgerEffect::Transfer {
            from,
            to,
            token,
            amount,
            fee,
            fee_to,
        } => {
            debit(layer, *from, &token.symbol, &(amount + fee));
            credit(layer, *to, &token.symbol, amount);
            credit(layer, *fee_to, &token.symbol, fee);
            bump_nonce(layer, *from);
        }
        LedgerEffect::Withdraw {
            from,
            token,
            amount,
            fee,
            fee_to,
            ..
        } => {
            debit(layer, *from, &token.symbol, &(amount + fee));
            credit(layer, *fee_to, &token.symbol, fee);
            bump_nonce(layer, *from);
        }
        LedgerEffect::SetKey {
            account,
            pub_key_hash,
            variant,
        } => {
            let entry = layer.entry(*account).or_default();
            entry.pub_key_hash = *pub_key_hash;
            entry.key_auth = Some(*variant);
            entry.nonce += 1;
        }
    }
}

pub(crate) struct SimState {
    pub tokens: Vec<TokenInfo>,
    pub operator: Address,
    pub faults: Faults,

    chain_balances: HashMap<(Address, u16), BigUint>,
    allowances: HashMap<(Address, u16), BigUint>,
    pending_withdrawals: HashMap<(Address, u16), BigUint>,
    authorized_keys: HashMap<Address, (PubKeyHash, u32)>,
    secrets: HashMap<Address, [u8; 32]>,

    executed: Layer,
    pub committed: Layer,
    pub verified: Layer,
    account_ids: HashMap<Address, u32>,

    pub priority_ops: HashMap<u64, ReceiptHandle>,
    /// Publishers of operations held back by `Faults::stall_blocks`.
    pub stalled: Vec<ReceiptPublisher>,

    next_serial: u64,
    chain_block: u64,
    rollup_block: u64,
}

impl SimState {
    pub fn new(tokens: Vec<TokenInfo>, operator: Address) -> Self {
        let mut state = Self {
            tokens,
            operator,
            faults: Faults::default(),
            chain_balances: HashMap::new(),
            allowances: HashMap::new(),
            pending_withdrawals: HashMap::new(),
            authorized_keys: HashMap::new(),
            secrets: HashMap::new(),
            executed: HashMap::new(),
            committed: HashMap::new(),
            verified: HashMap::new(),
            account_ids: HashMap::new(),
            priority_ops: HashMap::new(),
            stalled: Vec::new(),
            next_serial: 0,
            chain_block: 0,
            rollup_block: 0,
        };
        state.ensure_account(operator);
        state
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    pub fn register_secret(&mut self, address: Address, secret: [u8; 32]) {
        self.secrets.insert(address, secret);
    }

    pub fn token_by_id(&self, id: u16) -> Option<&TokenInfo> {
        self.tokens.iter().find(|t| t.id == id)
    }

    fn ensure_account(&mut self, address: Address) {
        let next_id = self.account_ids.len() as u32;
        self.account_ids.entry(address).or_insert(next_id);
    }

    pub fn account_state(&self, address: Address) -> AccountState {
        let mut state = AccountState::empty(address);
        state.id = self.account_ids.get(&address).copied();
        if let Some(layer) = self.committed.get(&address) {
            state.committed = layer.clone();
        }
        if let Some(layer) = self.verified.get(&address) {
            state.verified = layer.clone();
        }
        state
    }

    pub fn next_rollup_block(&mut self) -> u64 {
        self.rollup_block += 1;
        self.rollup_block
    }

    // -------------------------------------------------------------------------
    // Chain
    // -------------------------------------------------------------------------

    fn mine(&mut self, label: &str) -> ChainTxReceipt {
        self.chain_block += 1;
        let digest = Sha256::digest(format!("{}:{}", self.chain_block, label).as_bytes());
        ChainTxReceipt {
            hash: format!("0x{}", hex::encode(digest)),
            block: self.chain_block,
        }
    }

    pub fn chain_balance(&self, owner: Address, token: u16) -> BigUint {
        self.chain_balances.get(&(owner, token)).cloned().unwrap_or_default()
    }

    pub fn pending_withdrawal(&self, owner: Address, token: u16) -> BigUint {
        self.pending_withdrawals.get(&(owner, token)).cloned().unwrap_or_default()
    }

    pub fn allowance(&self, owner: Address, token: u16) -> BigUint {
        self.allowances.get(&(owner, token)).cloned().unwrap_or_default()
    }

    pub fn mint(&mut self, owner: Address, token: u16, amount: &BigUint) {
        *self.chain_balances.entry((owner, token)).or_default() += amount;
    }

    fn debit_chain(
        &mut self,
        operation: OperationKind,
        owner: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<(), HarnessError> {
        let balance = self.chain_balances.entry((owner, token.id)).or_default();
        if *balance < *amount {
            return Err(HarnessError::submission(
                operation,
                format!(
                    "insufficient {} chain balance for {owner}: have {balance}, need {amount}",
                    token.symbol
                ),
            ));
        }
        *balance -= amount;
        Ok(())
    }

    pub fn approve(&mut self, owner: Address, token: &TokenInfo, amount: &BigUint) -> ChainTxReceipt {
        self.allowances.insert((owner, token.id), amount.clone());
        self.mine(&format!("approve:{owner}:{}", token.id))
    }

    pub fn chain_transfer(
        &mut self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        self.debit_chain(OperationKind::Funding, from, token, amount)?;
        self.mint(to, token.id, amount);
        Ok(self.mine(&format!("transfer:{from}:{to}:{}", token.id)))
    }

    pub fn authorize_key(&mut self, account: Address, pub_key_hash: PubKeyHash, nonce: u32) -> ChainTxReceipt {
        self.authorized_keys.insert(account, (pub_key_hash, nonce));
        self.mine(&format!("setAuthPubkeyHash:{account}:{nonce}"))
    }

    /// Lock funds in the contract and queue the priority operation.
    /// Returns the serial id and the effect to replay on the rollup.
    pub fn lock_deposit(
        &mut self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<(u64, LedgerEffect), HarnessError> {
        if !token.is_native() {
            let allowance = self.allowance(from, token.id);
            if allowance < *amount {
                return Err(HarnessError::submission(
                    OperationKind::Deposit,
                    format!("insufficient {} allowance: have {allowance}, need {amount}", token.symbol),
                ));
            }
            self.debit_chain(OperationKind::Deposit, from, token, amount)?;
            if allowance != max_allowance() {
                self.allowances.insert((from, token.id), allowance - amount);
            }
        } else {
            self.debit_chain(OperationKind::Deposit, from, token, amount)?;
        }
        self.mine(&format!("deposit:{from}:{to}:{}", token.id));

        let serial = self.next_serial;
        self.next_serial += 1;
        let effect = LedgerEffect::Credit {
            account: to,
            token: token.clone(),
            amount: amount.clone(),
        };
        self.ensure_account(to);
        apply_effect(&mut self.executed, &effect);
        Ok((serial, effect))
    }

    /// Committed withdrawals land in the contract's pending pool.
    pub fn settle_committed(&mut self, effect: &LedgerEffect) {
        if let LedgerEffect::Withdraw { to, token, amount, .. } = effect {
            *self.pending_withdrawals.entry((*to, token.id)).or_default() += amount;
        }
    }

    /// With `auto_complete`, a verified withdrawal moves from the pending pool
    /// to the settled balance; otherwise it waits for `complete_withdrawal`.
    pub fn settle_verified(&mut self, effect: &LedgerEffect, auto_complete: bool) {
        let LedgerEffect::Withdraw { to, token, amount, .. } = effect else {
            return;
        };
        if !auto_complete {
            return;
        }
        let pending = self.pending_withdrawals.entry((*to, token.id)).or_default();
        let moved = amount.min(&*pending).clone();
        *pending -= &moved;
        self.mint(*to, token.id, &moved);
    }

    /// Push a pending withdrawal to the owner's settled balance.
    pub fn complete_withdrawal(&mut self, owner: Address, token: u16) -> BigUint {
        let pending = self.pending_withdrawals.remove(&(owner, token)).unwrap_or_default();
        self.mint(owner, token, &pending);
        pending
    }

    // -------------------------------------------------------------------------
    // Rollup submission
    // -------------------------------------------------------------------------

    /// Validate a signed transaction against the executed view.
    pub fn validate(&self, signed: &SignedRollupTx) -> Result<LedgerEffect, String> {
        let tx = &signed.tx;
        let signer = tx.signer();
        let secret = self
            .secrets
            .get(&signer)
            .ok_or_else(|| format!("no key material registered for {signer}"))?;
        if !self.account_ids.contains_key(&signer) {
            return Err(format!("account {signer} does not exist on the rollup"));
        }
        let layer = self.executed.get(&signer).cloned().unwrap_or_default();
        if tx.nonce() != layer.nonce {
            return Err(format!("nonce mismatch: expected {}, got {}", layer.nonce, tx.nonce()));
        }
        if !verify_message(secret, &rollup_message(tx), &signed.signature) {
            return Err("invalid rollup signature".to_string());
        }

        let fee_to = self.faults.misroute_fees_to.unwrap_or(self.operator);
        let funded = |token_id: u16, amount: &BigUint, fee: &BigUint| -> Result<TokenInfo, String> {
            if layer.pub_key_hash.is_unset() || layer.pub_key_hash != pub_key_hash_of(secret) {
                return Err(format!("signing key of {signer} is not set"));
            }
            let token = self
                .token_by_id(token_id)
                .cloned()
                .ok_or_else(|| format!("unknown token id {token_id}"))?;
            let balance = layer.balance(&token.symbol);
            if balance < amount + fee {
                return Err(format!(
                    "insufficient {} balance: have {balance}, need {}",
                    token.symbol,
                    amount + fee
                ));
            }
            Ok(token)
        };

        match tx {
            RollupTx::Transfer {
                from,
                to,
                token,
                amount,
                fee,
                ..
            } => Ok(LedgerEffect::Transfer {
                from: *from,
                to: *to,
                token: funded(*token, amount, fee)?,
                amount: amount.clone(),
                fee: fee.clone(),
                fee_to,
            }),
            RollupTx::Withdraw {
                from,
                to,
                token,
                amount,
                fee,
                ..
            } => Ok(LedgerEffect::Withdraw {
                from: *from,
                to: *to,
                token: funded(*token, amount, fee)?,
                amount: amount.clone(),
                fee: fee.clone(),
                fee_to,
            }),
            RollupTx::ChangePubKey {
                account,
                new_pk_hash,
                nonce,
                onchain_auth,
            } => {
                if *onchain_auth {
                    if self.authorized_keys.get(account) != Some(&(*new_pk_hash, *nonce)) {
                        return Err(format!("key {new_pk_hash} not authorized on chain for nonce {nonce}"));
                    }
                } else {
                    let eth_signature = signed
                        .eth_signature
                        .as_deref()
                        .ok_or_else(|| "missing chain-key authorization signature".to_string())?;
                    if !verify_message(secret, &authorization_message(*new_pk_hash, *nonce), eth_signature) {
                        return Err("invalid chain-key authorization signature".to_string());
                    }
                }
                Ok(LedgerEffect::SetKey {
                    account: *account,
                    pub_key_hash: *new_pk_hash,
                    variant: KeyVariant::from_onchain_auth(*onchain_auth),
                })
            }
        }
    }

    /// Apply an accepted effect to the executed view.
    pub fn execute(&mut self, effect: &LedgerEffect) {
        match effect {
            LedgerEffect::Transfer { to, fee_to, .. } => {
                self.ensure_account(*to);
                self.ensure_account(*fee_to);
            }
            LedgerEffect::Withdraw { fee_to, .. } => self.ensure_account(*fee_to),
            _ => {}
        }
        apply_effect(&mut self.executed, effect);
    }
}

/// Rollup transaction hash: digest of the signed payload.
pub(crate) fn tx_hash(signed: &SignedRollupTx) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signed.tx.signing_bytes());
    hasher.update(signed.signature.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> TokenInfo {
        TokenInfo {
            id: 1,
            symbol: "TST".into(),
            address: Address([0xee; 20]),
            decimals: 18,
        }
    }

    #[test]
    fn test_transfer_effect_moves_amount_and_fee() {
        let mut layer = Layer::new();
        let (a, b, op) = (Address([1; 20]), Address([2; 20]), Address([3; 20]));
        credit(&mut layer, a, "TST", &BigUint::from(100u32));
        apply_effect(
            &mut layer,
            &LedgerEffect::Transfer {
                from: a,
                to: b,
                token: token(),
                amount: BigUint::from(60u32),
                fee: BigUint::from(4u32),
                fee_to: op,
            },
        );
        assert_eq!(layer[&a].balance("TST"), BigUint::from(36u32));
        assert_eq!(layer[&a].nonce, 1);
        assert_eq!(layer[&b].balance("TST"), BigUint::from(60u32));
        assert_eq!(layer[&op].balance("TST"), BigUint::from(4u32));
    }

    #[test]
    fn test_erc20_deposit_requires_allowance() {
        let mut state = SimState::new(vec![TokenInfo::native(), token()], Address([3; 20]));
        let user = Address([1; 20]);
        state.mint(user, 1, &BigUint::from(100u32));
        assert!(matches!(
            state.lock_deposit(user, user, &token(), &BigUint::from(10u32)),
            Err(HarnessError::Submission { .. })
        ));

        state.approve(user, &token(), &BigUint::from(10u32));
        let (serial, _) = state.lock_deposit(user, user, &token(), &BigUint::from(10u32)).unwrap();
        assert_eq!(serial, 0);
        assert_eq!(state.allowance(user, 1), BigUint::ZERO);
        assert_eq!(state.chain_balance(user, 1), BigUint::from(90u32));
    }

    #[test]
    fn test_underfunded_chain_transfer_is_a_funding_failure() {
        let mut state = SimState::new(vec![TokenInfo::native(), token()], Address([3; 20]));
        let (from, to) = (Address([1; 20]), Address([2; 20]));
        state.mint(from, 1, &BigUint::from(5u32));
        let err = state.chain_transfer(from, to, &token(), &BigUint::from(6u32)).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Submission { operation: OperationKind::Funding, .. }
        ));
        assert!(err.to_string().contains("funding"));
        assert_eq!(state.chain_balance(from, 1), BigUint::from(5u32));
        assert_eq!(state.chain_balance(to, 1), BigUint::ZERO);
    }

    #[test]
    fn test_unlimited_allowance_is_not_consumed() {
        let mut state = SimState::new(vec![TokenInfo::native(), token()], Address([3; 20]));
        let user = Address([1; 20]);
        state.mint(user, 1, &BigUint::from(100u32));
        state.approve(user, &token(), &max_allowance());
        state.lock_deposit(user, user, &token(), &BigUint::from(10u32)).unwrap();
        assert_eq!(state.allowance(user, 1), max_allowance());
    }

    #[test]
    fn test_withdrawal_settlement_modes() {
        let mut state = SimState::new(vec![TokenInfo::native()], Address([3; 20]));
        let user = Address([1; 20]);
        let effect = LedgerEffect::Withdraw {
            from: user,
            to: user,
            token: TokenInfo::native(),
            amount: BigUint::from(7u32),
            fee: BigUint::from(1u32),
            fee_to: Address([3; 20]),
        };
        state.settle_committed(&effect);
        assert_eq!(state.pending_withdrawal(user, 0), BigUint::from(7u32));
        state.settle_verified(&effect, false);
        assert_eq!(state.pending_withdrawal(user, 0), BigUint::from(7u32));
        assert_eq!(state.complete_withdrawal(user, 0), BigUint::from(7u32));
        assert_eq!(state.chain_balance(user, 0), BigUint::from(7u32));

        state.settle_committed(&effect);
        state.settle_verified(&effect, true);
        assert_eq!(state.pending_withdrawal(user, 0), BigUint::ZERO);
        assert_eq!(state.chain_balance(user, 0), BigUint::from(14u32));
    }
}
