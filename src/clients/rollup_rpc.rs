//! Rollup ledger client over JSON-RPC.
//!
//! Receipts are driven by a polling task per operation (`tx_info` for rollup
//! transactions, `ethop_info` for priority operations) that stops once the
//! receipt is terminal or its handle is dropped.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::LedgerClient;
use crate::error::HarnessError;
use crate::models::{
    AccountState, Address, KeyVariant, LayerState, OperationKind, PubKeyHash, RollupTx, SignedRollupTx, TokenInfo,
    TokenLike,
};
use crate::receipt::{receipt_channel, spawn_status_poller, ConfirmationBounds, ReceiptHandle, ReceiptStatus};

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

#[derive(Debug, Clone, Deserialize)]
struct BlockInfo {
    block_number: u64,
    committed: bool,
    verified: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TxInfo {
    executed: bool,
    success: Option<bool>,
    fail_reason: Option<String>,
    block: Option<BlockInfo>,
}

impl TxInfo {
    fn status(&self) -> Option<ReceiptStatus> {
        if !self.executed {
            return None;
        }
        if self.success == Some(false) {
            return Some(ReceiptStatus::Rejected {
                reason: self
                    .fail_reason
                    .clone()
                    .unwrap_or_else(|| "unknown reason".to_string()),
            });
        }
        match &self.block {
            Some(b) if b.verified => Some(ReceiptStatus::Verified { block: b.block_number }),
            Some(b) if b.committed => Some(ReceiptStatus::Committed { block: b.block_number }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractAddresses {
    main_contract: Address,
}

#[derive(Debug, Clone)]
pub struct RollupRpcClientConfig {
    pub rpc_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub bounds: ConfirmationBounds,
}

#[derive(Clone)]
struct RpcTransport {
    http: Client,
    url: String,
    next_id: Arc<AtomicU64>,
}

impl RpcTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, HarnessError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = self.http.post(&self.url).json(&body).send().await?;
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
}

pub struct RollupRpcClient {
    transport: RpcTransport,
    config: RollupRpcClientConfig,
    // Token registry is immutable, so it is fetched once.
    tokens: RwLock<Option<HashMap<String, TokenInfo>>>,
    // `account_info` does not say how a key was authorized; remember the
    // registrations this client submitted.
    key_auth: RwLock<HashMap<Address, (PubKeyHash, KeyVariant)>>,
}

/// Fill in the authorization of a layer whose key matches a known registration.
fn attribute_key(layer: &mut LayerState, known: Option<&(PubKeyHash, KeyVariant)>) {
    if layer.key_auth.is_some() || layer.pub_key_hash.is_unset() {
        return;
    }
    if let Some((pub_key_hash, variant)) = known {
        if *pub_key_hash == layer.pub_key_hash {
            layer.key_auth = Some(*variant);
        }
    }
}

impl RollupRpcClient {
    pub fn new(config: RollupRpcClientConfig) -> Result<Self, HarnessError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build rollup http client: {e}")))?;
        Ok(Self {
            transport: RpcTransport {
                http,
                url: config.rpc_url.clone(),
                next_id: Arc::new(AtomicU64::new(1)),
            },
            config,
            tokens: RwLock::new(None),
            key_auth: RwLock::new(HashMap::new()),
        })
    }

    async fn token_registry(&self) -> Result<HashMap<String, TokenInfo>, HarnessError> {
        let cached = self.tokens.read().clone();
        if let Some(tokens) = cached {
            return Ok(tokens);
        }
        let raw = self.transport.call("tokens", json!([])).await?;
        let tokens: HashMap<String, TokenInfo> = serde_json::from_value(raw)
            .map_err(|e| HarnessError::Transport(format!("bad token registry: {e}")))?;
        info!(count = tokens.len(), "rollup token registry loaded");
        *self.tokens.write() = Some(tokens.clone());
        Ok(tokens)
    }

    fn watch(
        &self,
        operation: OperationKind,
        operation_id: String,
        method: &'static str,
        param: Value,
    ) -> ReceiptHandle {
        let (publisher, handle) = receipt_channel(operation, operation_id, self.config.bounds);
        let transport = self.transport.clone();
        spawn_status_poller(publisher, self.config.poll_interval, move || {
            let transport = transport.clone();
            let param = param.clone();
            async move {
                let raw = transport.call(method, json!([param])).await?;
                if raw.is_null() {
                    return Ok(None);
                }
                let info: TxInfo = serde_json::from_value(raw)
                    .map_err(|e| HarnessError::Transport(format!("bad {method} response: {e}")))?;
                Ok(info.status())
            }
        });
        handle
    }
}

#[async_trait]
impl LedgerClient for RollupRpcClient {
    async fn account_state(&self, address: Address) -> Result<AccountState, HarnessError> {
        let raw = self
            .transport
            .call("account_info", json!([address.to_string()]))
            .await?;
        if raw.is_null() {
            return Ok(AccountState::empty(address));
        }
        let mut state: AccountState = serde_json::from_value(raw)
            .map_err(|e| HarnessError::Transport(format!("bad account_info for {address}: {e}")))?;
        let key_auth = self.key_auth.read();
        let known = key_auth.get(&address);
        attribute_key(&mut state.committed, known);
        attribute_key(&mut state.verified, known);
        Ok(state)
    }

    async fn resolve_token(&self, token: TokenLike) -> Result<TokenInfo, HarnessError> {
        let registry = self.token_registry().await?;
        let found = registry.values().find(|info| match token {
            TokenLike::Native => info.is_native(),
            TokenLike::Erc20(address) => info.address == address,
        });
        match (found, token) {
            (Some(info), _) => Ok(info.clone()),
            (None, TokenLike::Native) => Ok(TokenInfo::native()),
            (None, TokenLike::Erc20(address)) => Err(HarnessError::Config(format!(
                "token {address} is not registered on the rollup"
            ))),
        }
    }

    async fn contract_address(&self) -> Result<Address, HarnessError> {
        let raw = self.transport.call("contract_address", json!([])).await?;
        let addresses: ContractAddresses = serde_json::from_value(raw)
            .map_err(|e| HarnessError::Transport(format!("bad contract_address response: {e}")))?;
        Ok(addresses.main_contract)
    }

    async fn submit_tx(&self, tx: SignedRollupTx) -> Result<ReceiptHandle, HarnessError> {
        let operation = tx.tx.kind();
        let mut body = serde_json::to_value(&tx.tx)
            .map_err(|e| HarnessError::submission(operation, format!("unencodable tx: {e}")))?;
        body["signature"] = Value::String(tx.signature.clone());
        let eth_signature = tx
            .eth_signature
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null);

        let hash = match self.transport.call("tx_submit", json!([body, eth_signature])).await {
            Ok(Value::String(hash)) => hash,
            Ok(other) => {
                return Err(HarnessError::submission(
                    operation,
                    format!("unexpected tx_submit result: {other}"),
                ))
            }
            Err(HarnessError::Transport(reason)) => return Err(HarnessError::submission(operation, reason)),
            Err(e) => return Err(e),
        };
        debug!(%operation, %hash, "rollup transaction accepted");
        if let RollupTx::ChangePubKey {
            account,
            new_pk_hash,
            onchain_auth,
            ..
        } = &tx.tx
        {
            self.key_auth
                .write()
                .insert(*account, (*new_pk_hash, KeyVariant::from_onchain_auth(*onchain_auth)));
        }

        Ok(self.watch(operation, hash.clone(), "tx_info", Value::String(hash)))
    }

    async fn watch_priority_op(&self, serial_id: u64) -> Result<ReceiptHandle, HarnessError> {
        Ok(self.watch(
            OperationKind::Deposit,
            serial_id.to_string(),
            "ethop_info",
            json!(serial_id),
        ))
    }

    async fn disconnect(&self) -> Result<(), HarnessError> {
        // HTTP transport holds no session; drop cached registry.
        *self.tokens.write() = None;
        info!(url = %self.config.rpc_url, "rollup client disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_info_status_mapping() {
        let pending: TxInfo = serde_json::from_value(json!({
            "executed": false, "success": null, "fail_reason": null, "block": null
        }))
        .unwrap();
        assert_eq!(pending.status(), None);

        let committed: TxInfo = serde_json::from_value(json!({
            "executed": true, "success": true, "fail_reason": null,
            "block": { "block_number": 12, "committed": true, "verified": false }
        }))
        .unwrap();
        assert_eq!(committed.status(), Some(ReceiptStatus::Committed { block: 12 }));

        let verified: TxInfo = serde_json::from_value(json!({
            "executed": true, "success": true,
            "block": { "block_number": 12, "committed": true, "verified": true }
        }))
        .unwrap();
        assert_eq!(verified.status(), Some(ReceiptStatus::Verified { block: 12 }));

        let failed: TxInfo = serde_json::from_value(json!({
            "executed": true, "success": false, "fail_reason": "Nonce mismatch", "block": null
        }))
        .unwrap();
        assert_eq!(
            failed.status(),
            Some(ReceiptStatus::Rejected { reason: "Nonce mismatch".into() })
        );
    }

    #[test]
    fn test_key_attribution_requires_matching_hash() {
        let registered = PubKeyHash([0x11; 20]);
        let known = (registered, KeyVariant::OffChain);

        let mut layer = LayerState {
            pub_key_hash: registered,
            ..LayerState::default()
        };
        attribute_key(&mut layer, Some(&known));
        assert_eq!(layer.key_auth, Some(KeyVariant::OffChain));

        let mut rotated = LayerState {
            pub_key_hash: PubKeyHash([0x22; 20]),
            ..LayerState::default()
        };
        attribute_key(&mut rotated, Some(&known));
        assert_eq!(rotated.key_auth, None);

        let mut unset = LayerState::default();
        attribute_key(&mut unset, Some(&known));
        assert_eq!(unset.key_auth, None);

        let mut reported = LayerState {
            pub_key_hash: registered,
            key_auth: Some(KeyVariant::OnChain),
            ..LayerState::default()
        };
        attribute_key(&mut reported, Some(&known));
        assert_eq!(reported.key_auth, Some(KeyVariant::OnChain));
    }

    #[test]
    fn test_priority_op_info_without_success_field() {
        let info: TxInfo = serde_json::from_value(json!({
            "executed": true,
            "block": { "block_number": 3, "committed": true, "verified": false }
        }))
        .unwrap();
        assert_eq!(info.status(), Some(ReceiptStatus::Committed { block: 3 }));
    }
}
