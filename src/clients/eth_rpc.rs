//! Chain client over Ethereum JSON-RPC.
//!
//! Reads go through `eth_getBalance` / `eth_call`. Writes use
//! `eth_sendTransaction`, so every sending account must be unlocked on the
//! node (dev networks). Each write waits for its receipt.

use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::abi::{self, Token};
use super::{ChainClient, ChainTxReceipt};
use crate::error::HarnessError;
use crate::models::{Address, OperationKind, PubKeyHash, TokenInfo};

const NEW_PRIORITY_REQUEST: &str = "NewPriorityRequest(address,uint64,uint8,bytes,uint256)";

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    pub code: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<TxLog>,
}

#[derive(Debug, Deserialize)]
struct TxLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Clone)]
pub struct EthRpcClientConfig {
    pub rpc_url: String,
    /// Rollup contract (deposits, pending withdrawals, key authorization).
    pub rollup_contract: Address,
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Duration,
    pub request_timeout: Duration,
}

pub struct EthRpcClient {
    http: Client,
    config: EthRpcClientConfig,
    next_id: AtomicU64,
}

impl EthRpcClient {
    pub fn new(config: EthRpcClientConfig) -> Result<Self, HarnessError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build chain http client: {e}")))?;
        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, HarnessError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = self.http.post(&self.config.rpc_url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HarnessError::Transport(format!("{method} {status}: {text}")));
        }

        let rpc = resp.json::<RpcResponse>().await?;
        if let Some(err) = rpc.error {
            return Err(HarnessError::Transport(format!(
                "{method} failed ({}): {}",
                err.code.unwrap_or_default(),
                err.message.unwrap_or_default()
            )));
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<BigUint, HarnessError> {
        let result = self
            .rpc(
                "eth_call",
                json!([{ "to": to.to_string(), "data": abi::to_hex_data(&data) }, "latest"]),
            )
            .await?;
        let hex_str = result.as_str().unwrap_or("0x");
        abi::parse_uint(hex_str)
    }

    /// Send from an unlocked account and wait for the receipt.
    async fn send(
        &self,
        operation: OperationKind,
        from: Address,
        to: Address,
        value: Option<&BigUint>,
        data: Option<Vec<u8>>,
    ) -> Result<TxReceipt, HarnessError> {
        let mut tx = json!({ "from": from.to_string(), "to": to.to_string() });
        if let Some(value) = value {
            tx["value"] = Value::String(abi::to_quantity(value));
        }
        if let Some(data) = data {
            tx["data"] = Value::String(abi::to_hex_data(&data));
        }

        let hash = match self.rpc("eth_sendTransaction", json!([tx])).await {
            Ok(Value::String(hash)) => hash,
            Ok(other) => {
                return Err(HarnessError::submission(
                    operation,
                    format!("unexpected eth_sendTransaction result: {other}"),
                ))
            }
            Err(HarnessError::Transport(reason)) => return Err(HarnessError::submission(operation, reason)),
            Err(e) => return Err(e),
        };
        debug!(%hash, %from, %to, "chain transaction sent");

        let receipt = self.wait_for_receipt(operation, &hash).await?;
        if receipt.status.as_deref() == Some("0x0") {
            return Err(HarnessError::submission(
                operation,
                format!("chain transaction {} reverted", receipt.transaction_hash),
            ));
        }
        Ok(receipt)
    }

    async fn wait_for_receipt(&self, operation: OperationKind, hash: &str) -> Result<TxReceipt, HarnessError> {
        let started = Instant::now();
        loop {
            let result = self.rpc("eth_getTransactionReceipt", json!([hash])).await?;
            if !result.is_null() {
                let receipt: TxReceipt = serde_json::from_value(result)
                    .map_err(|e| HarnessError::Transport(format!("bad receipt for {hash}: {e}")))?;
                if receipt.block_number.is_some() {
                    return Ok(receipt);
                }
            }
            if started.elapsed() >= self.config.receipt_timeout {
                return Err(HarnessError::ConfirmationTimeout {
                    operation,
                    operation_id: hash.to_string(),
                    stage: crate::models::Stage::Chain,
                    waited: self.config.receipt_timeout,
                });
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    fn to_chain_receipt(receipt: &TxReceipt) -> Result<ChainTxReceipt, HarnessError> {
        let block = receipt
            .block_number
            .as_deref()
            .map(abi::parse_uint)
            .transpose()?
            .and_then(|b| u64::try_from(b).ok())
            .unwrap_or_default();
        Ok(ChainTxReceipt {
            hash: receipt.transaction_hash.clone(),
            block,
        })
    }

    fn priority_serial_id(&self, receipt: &TxReceipt) -> Result<u64, HarnessError> {
        let topic = abi::event_topic(NEW_PRIORITY_REQUEST);
        let contract = self.config.rollup_contract.to_string();
        let log = receipt
            .logs
            .iter()
            .find(|log| {
                log.address.eq_ignore_ascii_case(&contract)
                    && log.topics.first().map(|t| t.eq_ignore_ascii_case(&topic)).unwrap_or(false)
            })
            .ok_or_else(|| {
                HarnessError::submission(
                    OperationKind::Deposit,
                    format!("no priority request emitted by {}", receipt.transaction_hash),
                )
            })?;
        let serial = abi::word_at(&log.data, 1)?;
        u64::try_from(serial).map_err(|e| HarnessError::Transport(format!("serial id out of range: {e}")))
    }
}

#[async_trait]
impl ChainClient for EthRpcClient {
    async fn balance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        if token.is_native() {
            let result = self
                .rpc("eth_getBalance", json!([owner.to_string(), "latest"]))
                .await?;
            return abi::parse_uint(result.as_str().unwrap_or("0x"));
        }
        let data = abi::encode_call("balanceOf(address)", &[Token::Address(owner)])?;
        self.call(token.address, data).await
    }

    async fn pending_withdrawal(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        let data = abi::encode_call(
            "balancesToWithdraw(address,uint16)",
            &[Token::Address(owner), Token::Uint(BigUint::from(token.id))],
        )?;
        self.call(self.config.rollup_contract, data).await
    }

    async fn deposit_allowance(&self, owner: Address, token: &TokenInfo) -> Result<BigUint, HarnessError> {
        if token.is_native() {
            return Ok(super::max_allowance());
        }
        let data = abi::encode_call(
            "allowance(address,address)",
            &[Token::Address(owner), Token::Address(self.config.rollup_contract)],
        )?;
        self.call(token.address, data).await
    }

    async fn approve_deposits(
        &self,
        owner: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        let data = abi::encode_call(
            "approve(address,uint256)",
            &[Token::Address(self.config.rollup_contract), Token::Uint(amount.clone())],
        )?;
        let receipt = self
            .send(OperationKind::Deposit, owner, token.address, None, Some(data))
            .await?;
        info!(token = %token.symbol, %owner, hash = %receipt.transaction_hash, "deposit allowance approved");
        Self::to_chain_receipt(&receipt)
    }

    async fn deposit(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<u64, HarnessError> {
        let contract = self.config.rollup_contract;
        let receipt = if token.is_native() {
            let data = abi::encode_call("depositETH(address)", &[Token::Address(to)])?;
            self.send(OperationKind::Deposit, from, contract, Some(amount), Some(data))
                .await?
        } else {
            let data = abi::encode_call(
                "depositERC20(address,uint104,address)",
                &[
                    Token::Address(token.address),
                    Token::Uint(amount.clone()),
                    Token::Address(to),
                ],
            )?;
            self.send(OperationKind::Deposit, from, contract, None, Some(data))
                .await?
        };
        self.priority_serial_id(&receipt)
    }

    async fn authorize_signing_key(
        &self,
        account: Address,
        pub_key_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<ChainTxReceipt, HarnessError> {
        let data = abi::encode_call(
            "setAuthPubkeyHash(bytes,uint32)",
            &[Token::Bytes(pub_key_hash.0.to_vec()), Token::Uint(BigUint::from(nonce))],
        )?;
        let receipt = self
            .send(
                OperationKind::KeyRegistration,
                account,
                self.config.rollup_contract,
                None,
                Some(data),
            )
            .await?;
        Self::to_chain_receipt(&receipt)
    }

    async fn transfer(
        &self,
        from: Address,
        to: Address,
        token: &TokenInfo,
        amount: &BigUint,
    ) -> Result<ChainTxReceipt, HarnessError> {
        let receipt = if token.is_native() {
            self.send(OperationKind::Funding, from, to, Some(amount), None)
                .await?
        } else {
            let data = abi::encode_call(
                "transfer(address,uint256)",
                &[Token::Address(to), Token::Uint(amount.clone())],
            )?;
            self.send(OperationKind::Funding, from, token.address, None, Some(data))
                .await?
        };
        Self::to_chain_receipt(&receipt)
    }
}
