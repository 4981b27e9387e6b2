//! Harness context: everything a scenario needs, built once by the driver
//! and passed explicitly.

use std::sync::Arc;
use tracing::info;

use crate::clients::eth_rpc::EthRpcClientConfig;
use crate::clients::rollup_rpc::RollupRpcClientConfig;
use crate::clients::{ChainClient, EthRpcClient, LedgerClient, RemoteSigner, RollupRpcClient, Signer};
use crate::config::{Backend, HarnessConfig};
use crate::error::HarnessError;
use crate::executor::OperationExecutor;
use crate::models::{parse_units, Address, TokenLike};
use crate::oracle::BalanceOracle;
use crate::sim::SimNetwork;

/// Whole tokens minted to the simulated funder, per token.
const SIM_FUNDER_ALLOWANCE: &str = "1000";

/// Parties of a scenario and their signers.
pub struct AccountRegistry {
    funder: Address,
    depositor: Arc<dyn Signer>,
    sender: Arc<dyn Signer>,
    /// One fresh receiver per token, in token order.
    receivers: Vec<Arc<dyn Signer>>,
}

impl AccountRegistry {
    pub fn new(
        funder: Address,
        depositor: Arc<dyn Signer>,
        sender: Arc<dyn Signer>,
        receivers: Vec<Arc<dyn Signer>>,
    ) -> Self {
        Self {
            funder,
            depositor,
            sender,
            receivers,
        }
    }

    pub fn funder(&self) -> Address {
        self.funder
    }

    pub fn depositor(&self) -> Address {
        self.depositor.address()
    }

    pub fn sender(&self) -> Address {
        self.sender.address()
    }

    pub fn receiver(&self, index: usize) -> Option<Address> {
        self.receivers.get(index).map(|s| s.address())
    }

    pub fn receivers(&self) -> Vec<Address> {
        self.receivers.iter().map(|s| s.address()).collect()
    }

    pub fn signer(&self, address: Address) -> Option<Arc<dyn Signer>> {
        std::iter::once(&self.depositor)
            .chain(std::iter::once(&self.sender))
            .chain(self.receivers.iter())
            .find(|s| s.address() == address)
            .cloned()
    }
}

pub struct HarnessContext {
    pub ledger: Arc<dyn LedgerClient>,
    pub chain: Arc<dyn ChainClient>,
    pub accounts: Arc<AccountRegistry>,
    /// Account credited with operation fees.
    pub operator: Address,
    /// Tokens exercised, in order.
    pub tokens: Vec<TokenLike>,
    pub config: HarnessConfig,
    sim: Option<Arc<SimNetwork>>,
}

impl HarnessContext {
    /// Build the context for the configured backend.
    pub async fn connect(config: HarnessConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        match config.backend {
            Backend::Sim => Self::simulated(config),
            Backend::Rpc => Self::rpc(config).await,
        }
    }

    /// Context over a fresh simulated network. Must be called inside a tokio runtime.
    pub fn simulated(config: HarnessConfig) -> Result<Self, HarnessError> {
        let net = SimNetwork::start(config.sim.network_config(config.timeouts.bounds()));
        Self::with_sim_network(config, net)
    }

    /// Context over an already running simulated network.
    pub fn with_sim_network(config: HarnessConfig, net: Arc<SimNetwork>) -> Result<Self, HarnessError> {
        let registry = net.tokens();
        let tokens = match &config.tokens {
            Some(tokens) => tokens.clone(),
            None => registry
                .iter()
                .filter(|t| !t.is_native())
                .take(1)
                .map(|t| t.token_like())
                .chain(std::iter::once(TokenLike::Native))
                .collect(),
        };

        let funder = net.create_account().address();
        for token in &registry {
            net.mint(funder, token, &parse_units(SIM_FUNDER_ALLOWANCE, token.decimals)?);
        }
        let depositor: Arc<dyn Signer> = net.create_account();
        let sender: Arc<dyn Signer> = net.create_account();
        let receivers: Vec<Arc<dyn Signer>> = tokens
            .iter()
            .map(|_| net.create_account() as Arc<dyn Signer>)
            .collect();

        info!(
            backend = "sim",
            tokens = tokens.len(),
            depositor = %depositor.address(),
            sender = %sender.address(),
            "harness context ready"
        );
        Ok(Self {
            ledger: net.clone(),
            chain: net.clone(),
            accounts: Arc::new(AccountRegistry::new(funder, depositor, sender, receivers)),
            operator: net.operator(),
            tokens,
            config,
            sim: Some(net),
        })
    }

    /// Context over JSON-RPC endpoints and a remote signer.
    pub async fn rpc(config: HarnessConfig) -> Result<Self, HarnessError> {
        let rpc = &config.rpc;
        let timeouts = &config.timeouts;
        let required = |name: &str, value: Option<Address>| {
            value.ok_or_else(|| HarnessError::Config(format!("{name} is required for the rpc backend")))
        };

        let ledger = Arc::new(RollupRpcClient::new(RollupRpcClientConfig {
            rpc_url: rpc.rollup_url.clone(),
            poll_interval: timeouts.poll_interval,
            request_timeout: timeouts.request,
            bounds: timeouts.bounds(),
        })?);
        let rollup_contract = ledger.contract_address().await?;
        let chain = Arc::new(EthRpcClient::new(EthRpcClientConfig {
            rpc_url: rpc.web3_url.clone(),
            rollup_contract,
            receipt_poll_interval: timeouts.poll_interval,
            receipt_timeout: timeouts.chain_receipt,
            request_timeout: timeouts.request,
        })?);

        let tokens = match &config.tokens {
            Some(tokens) => tokens.clone(),
            None => rpc
                .test_erc20
                .map(TokenLike::Erc20)
                .into_iter()
                .chain(std::iter::once(TokenLike::Native))
                .collect(),
        };

        let signer = |address: Address| -> Result<Arc<dyn Signer>, HarnessError> {
            Ok(Arc::new(RemoteSigner::new(&rpc.signer_url, address, timeouts.request)?))
        };
        let depositor = signer(required("rpc.depositor", rpc.depositor)?)?;
        let sender = signer(required("rpc.sender", rpc.sender)?)?;
        let receivers = rpc
            .receivers
            .iter()
            .take(tokens.len())
            .map(|a| signer(*a))
            .collect::<Result<Vec<_>, _>>()?;
        let funder = required("rpc.funder", rpc.funder)?;
        let operator = required("rpc.operator", rpc.operator)?;

        info!(
            backend = "rpc",
            network = %config.network,
            web3 = %rpc.web3_url,
            rollup = %rpc.rollup_url,
            contract = %rollup_contract,
            "harness context ready"
        );
        Ok(Self {
            ledger,
            chain,
            accounts: Arc::new(AccountRegistry::new(funder, depositor, sender, receivers)),
            operator,
            tokens,
            config,
            sim: None,
        })
    }

    pub fn executor(&self) -> OperationExecutor {
        OperationExecutor::new(self.ledger.clone(), self.chain.clone(), self.accounts.clone())
    }

    pub fn oracle(&self) -> BalanceOracle {
        BalanceOracle::new(self.ledger.clone(), self.chain.clone())
    }

    /// The simulated network, when running against one.
    pub fn sim(&self) -> Option<&Arc<SimNetwork>> {
        self.sim.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_context_defaults_to_erc20_then_native() {
        let ctx = HarnessContext::simulated(HarnessConfig::default()).unwrap();
        assert_eq!(ctx.tokens.len(), 2);
        assert!(!ctx.tokens[0].is_native());
        assert_eq!(ctx.tokens[1], TokenLike::Native);
        assert_eq!(ctx.accounts.receivers().len(), 2);
        assert_ne!(ctx.accounts.receiver(0), ctx.accounts.receiver(1));
        assert!(ctx.sim().is_some());
    }

    #[tokio::test]
    async fn test_registry_resolves_signers() {
        let ctx = HarnessContext::simulated(HarnessConfig::default()).unwrap();
        let accounts = &ctx.accounts;
        assert!(accounts.signer(accounts.depositor()).is_some());
        assert!(accounts.signer(accounts.sender()).is_some());
        for r in accounts.receivers() {
            assert_eq!(accounts.signer(r).map(|s| s.address()), Some(r));
        }
        assert!(accounts.signer(accounts.funder()).is_none());
    }
}
