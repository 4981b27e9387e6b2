//! Shared value types: addresses, tokens, amounts, confirmation stages,
//! account state and the operations the harness submits.

use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// Symbol used by both layers for the chain's native asset.
pub const NATIVE_SYMBOL: &str = "ETH";

/// Decimals of the native asset.
pub const NATIVE_DECIMALS: u8 = 18;

// =============================================================================
// ADDRESSES
// =============================================================================

/// 20-byte chain address. The same address identifies the account on the rollup.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Left-padded 32-byte ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

impl FromStr for Address {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let hex_part = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        if hex_part.len() != 40 {
            return Err(HarnessError::Config(format!("invalid address length: {raw}")));
        }
        let bytes = hex::decode(hex_part.to_ascii_lowercase())
            .map_err(|e| HarnessError::Config(format!("invalid address {raw}: {e}")))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash of an account's rollup signing key. All zeroes means no key is set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PubKeyHash(pub [u8; 20]);

impl PubKeyHash {
    pub fn is_unset(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl fmt::Display for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PubKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKeyHash({})", self)
    }
}

impl FromStr for PubKeyHash {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let hex_part = raw
            .strip_prefix("sync:")
            .or_else(|| raw.strip_prefix("0x"))
            .unwrap_or(raw);
        let bytes = hex::decode(hex_part)
            .map_err(|e| HarnessError::Transport(format!("invalid pubkey hash {raw}: {e}")))?;
        if bytes.len() != 20 {
            return Err(HarnessError::Transport(format!(
                "invalid pubkey hash length: {raw}"
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(PubKeyHash(out))
    }
}

impl Serialize for PubKeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKeyHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// TOKENS
// =============================================================================

/// Token as named by the caller: the native asset or an ERC20 contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenLike {
    Native,
    Erc20(Address),
}

impl TokenLike {
    pub fn is_native(&self) -> bool {
        matches!(self, TokenLike::Native)
    }
}

impl FromStr for TokenLike {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case(NATIVE_SYMBOL) {
            return Ok(TokenLike::Native);
        }
        let address: Address = raw.parse()?;
        if address.is_zero() {
            Ok(TokenLike::Native)
        } else {
            Ok(TokenLike::Erc20(address))
        }
    }
}

impl fmt::Display for TokenLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenLike::Native => f.write_str(NATIVE_SYMBOL),
            TokenLike::Erc20(address) => write!(f, "{}", address),
        }
    }
}

impl Serialize for TokenLike {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenLike {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Token as resolved by the rollup's token registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: u16,
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

impl TokenInfo {
    pub fn native() -> Self {
        Self {
            id: 0,
            symbol: NATIVE_SYMBOL.to_string(),
            address: Address::ZERO,
            decimals: NATIVE_DECIMALS,
        }
    }

    pub fn is_native(&self) -> bool {
        self.id == 0 || self.address.is_zero()
    }

    pub fn token_like(&self) -> TokenLike {
        if self.is_native() {
            TokenLike::Native
        } else {
            TokenLike::Erc20(self.address)
        }
    }
}

// =============================================================================
// AMOUNTS
// =============================================================================

/// Parse a decimal string ("0.018") into smallest units for `decimals`.
pub fn parse_units(value: &str, decimals: u8) -> Result<BigUint, HarnessError> {
    let raw = value.trim();
    let (int_part, frac_part) = match raw.split_once('.') {
        Some((i, f)) => (i, f),
        None => (raw, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(HarnessError::Config(format!("invalid amount: {value:?}")));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(HarnessError::Config(format!("invalid amount: {value:?}")));
    }
    if frac_part.len() > decimals as usize {
        return Err(HarnessError::Config(format!(
            "amount {value:?} has more than {decimals} fractional digits"
        )));
    }

    let mut digits = String::with_capacity(int_part.len() + decimals as usize);
    digits.push_str(int_part);
    digits.push_str(frac_part);
    for _ in frac_part.len()..decimals as usize {
        digits.push('0');
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(BigUint::ZERO);
    }
    BigUint::parse_bytes(digits.as_bytes(), 10)
        .ok_or_else(|| HarnessError::Config(format!("invalid amount: {value:?}")))
}

/// Render smallest units as a decimal string, trimming trailing zeroes.
pub fn format_units(amount: &BigUint, decimals: u8) -> String {
    let digits = amount.to_str_radix(10);
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }
    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

/// Serde helper: `BigUint` as a base-10 string, the way both RPC layers encode amounts.
pub mod amount_serde {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_str_radix(10))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.trim().as_bytes(), 10)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid amount: {s}")))
    }
}

// =============================================================================
// CONFIRMATION STAGES & ACCOUNT STATE
// =============================================================================

/// Where a balance is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Rollup state including committed (not yet verified) blocks.
    Committed,
    /// Rollup state as of the last verified block.
    Verified,
    /// Settled balance on the chain itself.
    Chain,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Committed => f.write_str("committed"),
            Stage::Verified => f.write_str("verified"),
            Stage::Chain => f.write_str("chain"),
        }
    }
}

/// Signing-key state of a rollup account. Both set states authorize equally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningKeyState {
    Unset,
    SetOnChain,
    SetOffChain,
}

impl SigningKeyState {
    pub fn is_set(&self) -> bool {
        !matches!(self, SigningKeyState::Unset)
    }
}

/// One confirmation layer of a rollup account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerState {
    #[serde(default, with = "balances_serde")]
    pub balances: BTreeMap<String, BigUint>,
    #[serde(default)]
    pub nonce: u32,
    #[serde(default, rename = "pubKeyHash")]
    pub pub_key_hash: PubKeyHash,
    /// How the current key was authorized, when the ledger knows it.
    #[serde(default, rename = "pubKeyAuth", skip_serializing_if = "Option::is_none")]
    pub key_auth: Option<KeyVariant>,
}

impl LayerState {
    /// Balance for `symbol`; an account that never held the token has zero.
    pub fn balance(&self, symbol: &str) -> BigUint {
        self.balances.get(symbol).cloned().unwrap_or(BigUint::ZERO)
    }
}

/// Rollup account state at both confirmation stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub address: Address,
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub committed: LayerState,
    #[serde(default)]
    pub verified: LayerState,
}

impl AccountState {
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            id: None,
            committed: LayerState::default(),
            verified: LayerState::default(),
        }
    }

    /// Layer for a rollup stage; `Stage::Chain` has no rollup layer.
    pub fn layer(&self, stage: Stage) -> Option<&LayerState> {
        match stage {
            Stage::Committed => Some(&self.committed),
            Stage::Verified => Some(&self.verified),
            Stage::Chain => None,
        }
    }
}

mod balances_serde {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(balances: &BTreeMap<String, BigUint>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(balances.iter().map(|(k, v)| (k, v.to_str_radix(10))))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, BigUint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(symbol, amount)| {
                BigUint::parse_bytes(amount.trim().as_bytes(), 10)
                    .map(|v| (symbol, v))
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid balance: {amount}")))
            })
            .collect()
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Deposit,
    Transfer,
    Withdrawal,
    KeyRegistration,
    /// Plain chain transfer that tops up a harness account.
    Funding,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Deposit => f.write_str("deposit"),
            OperationKind::Transfer => f.write_str("transfer"),
            OperationKind::Withdrawal => f.write_str("withdrawal"),
            OperationKind::KeyRegistration => f.write_str("key-registration"),
            OperationKind::Funding => f.write_str("funding"),
        }
    }
}

/// How an ERC20 deposit gets its allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositMode {
    /// Approve exactly the deposit amount as part of submission.
    AutoApproved,
    /// Require an existing approval; never approve on the caller's behalf.
    PreApproved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyVariant {
    /// Authorized by a prior `setAuthPubkeyHash` chain transaction.
    OnChain,
    /// Authorized by a chain-layer signature carried in the operation.
    OffChain,
}

impl KeyVariant {
    pub fn from_onchain_auth(onchain_auth: bool) -> Self {
        if onchain_auth {
            KeyVariant::OnChain
        } else {
            KeyVariant::OffChain
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub depositor: Address,
    pub target: Address,
    pub token: TokenInfo,
    pub amount: BigUint,
    pub mode: DepositMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub token: TokenInfo,
    pub amount: BigUint,
    pub fee: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    pub from: Address,
    /// Chain address credited; may differ from `from`.
    pub to: Address,
    pub token: TokenInfo,
    pub amount: BigUint,
    pub fee: BigUint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRegistration {
    pub account: Address,
    pub variant: KeyVariant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Deposit(Deposit),
    Transfer(Transfer),
    Withdrawal(Withdrawal),
    KeyRegistration(KeyRegistration),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Deposit(_) => OperationKind::Deposit,
            Operation::Transfer(_) => OperationKind::Transfer,
            Operation::Withdrawal(_) => OperationKind::Withdrawal,
            Operation::KeyRegistration(_) => OperationKind::KeyRegistration,
        }
    }

    /// Account whose rollup nonce and signature authorize the operation.
    pub fn actor(&self) -> Address {
        match self {
            Operation::Deposit(d) => d.depositor,
            Operation::Transfer(t) => t.from,
            Operation::Withdrawal(w) => w.from,
            Operation::KeyRegistration(k) => k.account,
        }
    }
}

/// A rollup operation ready for signing: the operation plus the actor's nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RollupTx {
    Transfer {
        from: Address,
        to: Address,
        token: u16,
        #[serde(with = "amount_serde")]
        amount: BigUint,
        #[serde(with = "amount_serde")]
        fee: BigUint,
        nonce: u32,
    },
    Withdraw {
        from: Address,
        to: Address,
        token: u16,
        #[serde(with = "amount_serde")]
        amount: BigUint,
        #[serde(with = "amount_serde")]
        fee: BigUint,
        nonce: u32,
    },
    ChangePubKey {
        account: Address,
        #[serde(rename = "newPkHash")]
        new_pk_hash: PubKeyHash,
        nonce: u32,
        #[serde(rename = "onchainAuth")]
        onchain_auth: bool,
    },
}

impl RollupTx {
    pub fn kind(&self) -> OperationKind {
        match self {
            RollupTx::Transfer { .. } => OperationKind::Transfer,
            RollupTx::Withdraw { .. } => OperationKind::Withdrawal,
            RollupTx::ChangePubKey { .. } => OperationKind::KeyRegistration,
        }
    }

    pub fn signer(&self) -> Address {
        match self {
            RollupTx::Transfer { from, .. } | RollupTx::Withdraw { from, .. } => *from,
            RollupTx::ChangePubKey { account, .. } => *account,
        }
    }

    pub fn nonce(&self) -> u32 {
        match self {
            RollupTx::Transfer { nonce, .. }
            | RollupTx::Withdraw { nonce, .. }
            | RollupTx::ChangePubKey { nonce, .. } => *nonce,
        }
    }

    /// Canonical bytes covered by the rollup signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Rollup transaction with its signatures, as accepted by `tx_submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRollupTx {
    pub tx: RollupTx,
    /// Rollup-key signature, hex.
    pub signature: String,
    /// Chain-key signature authorizing an off-chain key change, hex.
    #[serde(default, rename = "ethSignature", skip_serializing_if = "Option::is_none")]
    pub eth_signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_lowercases() {
        let a: Address = "0xAbCdEf0123456789aBcDeF0123456789ABCDEF01".parse().unwrap();
        assert_eq!(a.to_string(), "0xabcdef0123456789abcdef0123456789abcdef01");
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn test_token_like_parsing() {
        assert_eq!("eth".parse::<TokenLike>().unwrap(), TokenLike::Native);
        assert_eq!(
            "0x0000000000000000000000000000000000000000".parse::<TokenLike>().unwrap(),
            TokenLike::Native
        );
        let erc20 = "0x1111111111111111111111111111111111111111".parse::<TokenLike>().unwrap();
        assert!(!erc20.is_native());
    }

    #[test]
    fn test_parse_units_matches_ether_scale() {
        let v = parse_units("0.018", 18).unwrap();
        assert_eq!(v, BigUint::from(18_000_000_000_000_000u64));
        assert_eq!(parse_units("1", 6).unwrap(), BigUint::from(1_000_000u32));
        assert_eq!(parse_units(".5", 1).unwrap(), BigUint::from(5u32));
        assert_eq!(parse_units("0", 18).unwrap(), BigUint::ZERO);
    }

    #[test]
    fn test_parse_units_rejects_bad_input() {
        assert!(parse_units("1.0000001", 6).is_err());
        assert!(parse_units("-1", 18).is_err());
        assert!(parse_units("1e18", 18).is_err());
        assert!(parse_units("", 18).is_err());
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_units(&BigUint::from(18_000_000_000_000_000u64), 18), "0.018");
        assert_eq!(format_units(&BigUint::from(2_000_000u32), 6), "2");
        assert_eq!(format_units(&BigUint::ZERO, 18), "0");
        assert_eq!(format_units(&BigUint::from(15u32), 0), "15");
    }

    #[test]
    fn test_account_state_missing_balance_is_zero() {
        let json = r#"{
            "address": "0x2222222222222222222222222222222222222222",
            "id": 7,
            "committed": { "balances": { "ETH": "1000" }, "nonce": 3,
                           "pubKeyHash": "sync:0000000000000000000000000000000000000000" },
            "verified": { "balances": {}, "nonce": 0,
                          "pubKeyHash": "sync:0000000000000000000000000000000000000000" }
        }"#;
        let state: AccountState = serde_json::from_str(json).unwrap();
        assert_eq!(state.committed.balance("ETH"), BigUint::from(1000u32));
        assert_eq!(state.verified.balance("ETH"), BigUint::ZERO);
        assert_eq!(state.committed.balance("DAI"), BigUint::ZERO);
        assert!(state.committed.pub_key_hash.is_unset());
        assert!(state.layer(Stage::Chain).is_none());
    }

    #[test]
    fn test_key_authorization_field_is_optional() {
        let json = r#"{ "balances": {}, "nonce": 1,
                        "pubKeyHash": "sync:0101010101010101010101010101010101010101",
                        "pubKeyAuth": "OffChain" }"#;
        let layer: LayerState = serde_json::from_str(json).unwrap();
        assert_eq!(layer.key_auth, Some(KeyVariant::OffChain));

        let layer: LayerState = serde_json::from_str(r#"{ "nonce": 1 }"#).unwrap();
        assert_eq!(layer.key_auth, None);
        assert!(serde_json::to_value(&layer).unwrap().get("pubKeyAuth").is_none());
    }

    #[test]
    fn test_signing_key_state_equivalence() {
        assert!(!SigningKeyState::Unset.is_set());
        assert!(SigningKeyState::SetOnChain.is_set());
        assert!(SigningKeyState::SetOffChain.is_set());
    }
}
