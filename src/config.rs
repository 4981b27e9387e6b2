//! Harness configuration
//!
//! Loaded from an optional TOML file, then overridden by environment variables
//! (a `.env` file is honoured by the binary) and finally by CLI flags.
//!
//! Environment variables:
//! - `RECONCILE_BACKEND`          `sim` or `rpc`
//! - `WEB3_URL`                   chain JSON-RPC endpoint
//! - `ROLLUP_RPC_URL`             rollup JSON-RPC endpoint (`WS_API_ADDR` is accepted too)
//! - `SIGNER_URL`                 remote signing service
//! - `TEST_ERC20`                 ERC20 token exercised before the native token
//! - `ETH_NETWORK`                network name, informational
//! - `OPERATOR_FRANKLIN_ADDRESS`  fee account of the rollup operator

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::HarnessError;
use crate::models::{Address, TokenLike};
use crate::receipt::ConfirmationBounds;
use crate::sim::SimNetworkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated network.
    Sim,
    /// Chain node, rollup server and signing service over JSON-RPC.
    Rpc,
}

impl std::str::FromStr for Backend {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" | "simulated" => Ok(Backend::Sim),
            "rpc" => Ok(Backend::Rpc),
            other => Err(HarnessError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub backend: Backend,

    /// Informational network name, logged at start-up.
    pub network: String,

    /// Tokens exercised, in order. `None` means the backend's test ERC20 then `ETH`.
    pub tokens: Option<Vec<TokenLike>>,

    pub amounts: AmountConfig,
    pub timeouts: TimeoutConfig,
    pub rpc: RpcConfig,
    pub sim: SimConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sim,
            network: "localhost".into(),
            tokens: None,
            amounts: AmountConfig::default(),
            timeouts: TimeoutConfig::default(),
            rpc: RpcConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

/// Decimal amounts in whole-token units, converted per token's decimals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountConfig {
    /// Total deposited per token, split evenly over the two deposits.
    pub deposit: String,
    /// Native funds given to the depositor.
    pub depositor_native: String,
    /// ERC20 funds given to the depositor.
    pub depositor_erc20: String,
    /// Native funds given to the sender and every receiver.
    pub account_native: String,
}

impl Default for AmountConfig {
    fn default() -> Self {
        Self {
            deposit: "0.018".into(),
            depositor_native: "0.02".into(),
            depositor_erc20: "0.02".into(),
            account_native: "0.01".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound on waiting for a block to be committed.
    #[serde(with = "duration_serde")]
    pub commit: Duration,
    /// Upper bound on waiting for a block to be verified.
    #[serde(with = "duration_serde")]
    pub verify: Duration,
    /// Receipt polling interval (rpc backend).
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
    /// Upper bound on a chain transaction being mined (rpc backend).
    #[serde(with = "duration_serde")]
    pub chain_receipt: Duration,
    /// Per-request HTTP timeout (rpc backend).
    #[serde(with = "duration_serde")]
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            commit: Duration::from_secs(60),
            verify: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            chain_receipt: Duration::from_secs(120),
            request: Duration::from_secs(15),
        }
    }
}

impl TimeoutConfig {
    pub fn bounds(&self) -> ConfirmationBounds {
        ConfirmationBounds {
            committed: self.commit,
            verified: self.verify,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub web3_url: String,
    pub rollup_url: String,
    pub signer_url: String,
    /// ERC20 exercised ahead of the native token.
    pub test_erc20: Option<Address>,
    /// Fee account of the rollup operator.
    pub operator: Option<Address>,
    /// Node-unlocked account that funds everybody else.
    pub funder: Option<Address>,
    pub depositor: Option<Address>,
    pub sender: Option<Address>,
    /// One receiver per exercised token.
    pub receivers: Vec<Address>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            web3_url: "http://localhost:8545".into(),
            rollup_url: "http://localhost:3030".into(),
            signer_url: "http://localhost:3040".into(),
            test_erc20: None,
            operator: None,
            funder: None,
            depositor: None,
            sender: None,
            receivers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    #[serde(with = "duration_serde")]
    pub commit_latency: Duration,
    #[serde(with = "duration_serde")]
    pub verify_latency: Duration,
    pub auto_complete_withdrawals: bool,
    pub operator: Address,
    pub contract: Address,
    pub erc20: Vec<SimTokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTokenConfig {
    pub symbol: String,
    pub address: Address,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_decimals() -> u8 {
    18
}

impl Default for SimConfig {
    fn default() -> Self {
        let network = SimNetworkConfig::default();
        Self {
            commit_latency: network.commit_latency,
            verify_latency: network.verify_latency,
            auto_complete_withdrawals: network.auto_complete_withdrawals,
            operator: network.operator,
            contract: network.contract,
            erc20: network
                .erc20_tokens
                .into_iter()
                .map(|(symbol, address, decimals)| SimTokenConfig {
                    symbol,
                    address,
                    decimals,
                })
                .collect(),
        }
    }
}

impl SimConfig {
    pub fn network_config(&self, bounds: ConfirmationBounds) -> SimNetworkConfig {
        SimNetworkConfig {
            commit_latency: self.commit_latency,
            verify_latency: self.verify_latency,
            auto_complete_withdrawals: self.auto_complete_withdrawals,
            operator: self.operator,
            contract: self.contract,
            erc20_tokens: self
                .erc20
                .iter()
                .map(|t| (t.symbol.clone(), t.address, t.decimals))
                .collect(),
            bounds,
        }
    }
}

impl HarnessConfig {
    /// Read a TOML file. Missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| HarnessError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), HarnessError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RECONCILE_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = get("ETH_NETWORK") {
            self.network = v;
        }
        if let Some(v) = get("WEB3_URL") {
            self.rpc.web3_url = v;
        }
        if let Some(v) = get("ROLLUP_RPC_URL").or_else(|| get("WS_API_ADDR")) {
            self.rpc.rollup_url = v;
        }
        if let Some(v) = get("SIGNER_URL") {
            self.rpc.signer_url = v;
        }
        if let Some(v) = get("TEST_ERC20") {
            self.rpc.test_erc20 = Some(v.parse()?);
        }
        if let Some(v) = get("OPERATOR_FRANKLIN_ADDRESS") {
            let operator: Address = v.parse()?;
            self.rpc.operator = Some(operator);
            self.sim.operator = operator;
        }
        Ok(())
    }

    /// Reject configurations no scenario could run with.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.timeouts.poll_interval.is_zero() {
            return Err(HarnessError::Config("timeouts.poll_interval must be non-zero".into()));
        }
        if self.timeouts.commit > self.timeouts.verify {
            return Err(HarnessError::Config(
                "timeouts.commit must not exceed timeouts.verify".into(),
            ));
        }
        if let Some(tokens) = &self.tokens {
            if tokens.is_empty() {
                return Err(HarnessError::Config("tokens must not be empty".into()));
            }
        }
        if self.backend == Backend::Rpc {
            let rpc = &self.rpc;
            for (name, value) in [
                ("rpc.funder", rpc.funder),
                ("rpc.depositor", rpc.depositor),
                ("rpc.sender", rpc.sender),
                ("rpc.operator", rpc.operator),
            ] {
                if value.is_none() {
                    return Err(HarnessError::Config(format!("{name} is required for the rpc backend")));
                }
            }
            if rpc.receivers.len() < self.token_count() {
                return Err(HarnessError::Config(format!(
                    "rpc.receivers needs one address per token ({} tokens, {} receivers)",
                    self.token_count(),
                    rpc.receivers.len()
                )));
            }
        }
        Ok(())
    }

    fn token_count(&self) -> usize {
        match &self.tokens {
            Some(tokens) => tokens.len(),
            None if self.backend == Backend::Rpc && self.rpc.test_erc20.is_none() => 1,
            None => 2,
        }
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = HarnessConfig::default();
        assert_eq!(config.backend, Backend::Sim);
        assert_eq!(config.amounts.deposit, "0.018");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
backend = "sim"
tokens = ["ETH"]

[timeouts]
commit = 250
verify = 1000

[sim]
commit_latency = 5
verify_latency = 10
auto_complete_withdrawals = true
"#
        )
        .unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tokens, Some(vec![TokenLike::Native]));
        assert_eq!(config.timeouts.commit, Duration::from_millis(250));
        assert_eq!(config.timeouts.poll_interval, Duration::from_millis(500));
        assert_eq!(config.sim.verify_latency, Duration::from_millis(10));
        assert!(config.sim.auto_complete_withdrawals);
        assert_eq!(config.sim.erc20.len(), 1);
        assert_eq!(config.amounts.account_native, "0.01");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend = \"mainframe\"").unwrap();
        assert!(matches!(HarnessConfig::from_file(file.path()), Err(HarnessError::Config(_))));
        assert!(matches!(
            HarnessConfig::from_file("/nonexistent/reconcile.toml"),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RECONCILE_BACKEND", "rpc"),
            ("WEB3_URL", "http://chain:8545"),
            ("WS_API_ADDR", "http://rollup:3030"),
            ("TEST_ERC20", "0x1111111111111111111111111111111111111111"),
            ("OPERATOR_FRANKLIN_ADDRESS", "0x2222222222222222222222222222222222222222"),
            ("SIGNER_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = HarnessConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend, Backend::Rpc);
        assert_eq!(config.rpc.web3_url, "http://chain:8545");
        assert_eq!(config.rpc.rollup_url, "http://rollup:3030");
        assert_eq!(config.rpc.signer_url, "http://localhost:3040");
        assert_eq!(config.rpc.operator, Some(Address([0x22; 20])));
        assert_eq!(config.rpc.test_erc20, Some(Address([0x11; 20])));
    }

    #[test]
    fn test_rpc_backend_requires_accounts() {
        let mut config = HarnessConfig {
            backend: Backend::Rpc,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());

        config.rpc.funder = Some(Address([1; 20]));
        config.rpc.depositor = Some(Address([2; 20]));
        config.rpc.sender = Some(Address([3; 20]));
        config.rpc.operator = Some(Address([4; 20]));
        config.rpc.receivers = vec![Address([5; 20])];
        config.validate().unwrap();

        config.rpc.test_erc20 = Some(Address([6; 20]));
        assert!(config.validate().is_err());
        config.rpc.receivers.push(Address([7; 20]));
        config.validate().unwrap();
    }
}
