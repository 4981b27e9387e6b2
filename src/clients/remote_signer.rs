//! HTTP signer: key material stays in an external signing service, the
//! harness only sends what needs signing.
//!
//! Endpoints (all `POST`, JSON):
//! - `/pubkey-hash`   `{ address }` -> `{ pubKeyHash }`
//! - `/sign`          `{ address, tx }` -> `{ signature }`
//! - `/authorize-key` `{ address, newPkHash, nonce }` -> `{ ethSignature }`

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::Signer;
use crate::error::HarnessError;
use crate::models::{Address, PubKeyHash, RollupTx};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubKeyHashResponse {
    pub_key_hash: PubKeyHash,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizationResponse {
    eth_signature: String,
}

#[derive(Clone)]
pub struct RemoteSigner {
    http: Client,
    base_url: String,
    address: Address,
}

impl RemoteSigner {
    pub fn new(base_url: &str, address: Address, timeout: Duration) -> Result<Self, HarnessError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build signer http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            address,
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, HarnessError> {
        let resp = self.http.post(self.url(path)).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(HarnessError::Transport(format!(
                "POST {path} for {} {status}: {text}",
                self.address
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| HarnessError::Transport(format!("bad signer response from {path}: {e}")))
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn pub_key_hash(&self) -> Result<PubKeyHash, HarnessError> {
        let resp: PubKeyHashResponse = self
            .post("/pubkey-hash", json!({ "address": self.address }))
            .await?;
        Ok(resp.pub_key_hash)
    }

    async fn sign(&self, tx: &RollupTx) -> Result<String, HarnessError> {
        let resp: SignatureResponse = self
            .post("/sign", json!({ "address": self.address, "tx": tx }))
            .await?;
        Ok(resp.signature)
    }

    async fn sign_key_authorization(
        &self,
        new_pk_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<String, HarnessError> {
        let resp: AuthorizationResponse = self
            .post(
                "/authorize-key",
                json!({ "address": self.address, "newPkHash": new_pk_hash, "nonce": nonce }),
            )
            .await?;
        Ok(resp.eth_signature)
    }
}
