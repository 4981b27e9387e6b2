//! HMAC-SHA256 signer for simulated accounts.
//!
//! One random secret per account stands in for both the rollup signing key and
//! the chain key; the two are separated by message domain.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::clients::Signer;
use crate::error::HarnessError;
use crate::models::{Address, PubKeyHash, RollupTx};

type HmacSha256 = Hmac<Sha256>;

const ROLLUP_DOMAIN: &[u8] = b"rollup-tx:";
const AUTH_DOMAIN: &[u8] = b"authorize-key:";

#[derive(Clone)]
pub struct SimSigner {
    address: Address,
    secret: [u8; 32],
}

impl std::fmt::Debug for SimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl SimSigner {
    /// Fresh account with a random address and secret.
    pub fn random() -> Self {
        let mut rng = StdRng::from_entropy();
        let mut address = [0u8; 20];
        let mut secret = [0u8; 32];
        rng.fill(&mut address);
        rng.fill(&mut secret);
        Self {
            address: Address(address),
            secret,
        }
    }

    pub(crate) fn secret(&self) -> [u8; 32] {
        self.secret
    }

    pub(crate) fn key_hash(&self) -> PubKeyHash {
        pub_key_hash_of(&self.secret)
    }
}

pub(crate) fn pub_key_hash_of(secret: &[u8; 32]) -> PubKeyHash {
    let digest = Sha256::digest(secret);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    PubKeyHash(out)
}

pub(crate) fn authorization_message(new_pk_hash: PubKeyHash, nonce: u32) -> Vec<u8> {
    let mut msg = Vec::with_capacity(AUTH_DOMAIN.len() + 24);
    msg.extend_from_slice(AUTH_DOMAIN);
    msg.extend_from_slice(&new_pk_hash.0);
    msg.extend_from_slice(&nonce.to_be_bytes());
    msg
}

pub(crate) fn rollup_message(tx: &RollupTx) -> Vec<u8> {
    let mut msg = ROLLUP_DOMAIN.to_vec();
    msg.extend_from_slice(&tx.signing_bytes());
    msg
}

fn mac(secret: &[u8; 32], message: &[u8]) -> Result<HmacSha256, HarnessError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| HarnessError::Config(format!("HMAC key error: {e}")))?;
    mac.update(message);
    Ok(mac)
}

pub(crate) fn sign_message(secret: &[u8; 32], message: &[u8]) -> Result<String, HarnessError> {
    Ok(hex::encode(mac(secret, message)?.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
pub(crate) fn verify_message(secret: &[u8; 32], message: &[u8], signature: &str) -> bool {
    let Ok(sig) = hex::decode(signature.trim_start_matches("0x")) else {
        return false;
    };
    match mac(secret, message) {
        Ok(mac) => mac.verify_slice(&sig).is_ok(),
        Err(_) => false,
    }
}

#[async_trait]
impl Signer for SimSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn pub_key_hash(&self) -> Result<PubKeyHash, HarnessError> {
        Ok(self.key_hash())
    }

    async fn sign(&self, tx: &RollupTx) -> Result<String, HarnessError> {
        sign_message(&self.secret, &rollup_message(tx))
    }

    async fn sign_key_authorization(
        &self,
        new_pk_hash: PubKeyHash,
        nonce: u32,
    ) -> Result<String, HarnessError> {
        sign_message(&self.secret, &authorization_message(new_pk_hash, nonce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn transfer(signer: &SimSigner, nonce: u32) -> RollupTx {
        RollupTx::Transfer {
            from: signer.address(),
            to: Address([9; 20]),
            token: 0,
            amount: BigUint::from(100u32),
            fee: BigUint::from(4u32),
            nonce,
        }
    }

    #[tokio::test]
    async fn test_signature_verifies_only_for_signed_tx() {
        let signer = SimSigner::random();
        let tx = transfer(&signer, 0);
        let sig = signer.sign(&tx).await.unwrap();
        assert!(verify_message(&signer.secret(), &rollup_message(&tx), &sig));
        assert!(!verify_message(&signer.secret(), &rollup_message(&transfer(&signer, 1)), &sig));
        assert!(!verify_message(&SimSigner::random().secret(), &rollup_message(&tx), &sig));
        assert!(!verify_message(&signer.secret(), &rollup_message(&tx), "zz"));
    }

    #[tokio::test]
    async fn test_rollup_and_authorization_domains_differ() {
        let signer = SimSigner::random();
        let pkh = signer.pub_key_hash().await.unwrap();
        assert!(!pkh.is_unset());
        let auth = signer.sign_key_authorization(pkh, 0).await.unwrap();
        assert!(verify_message(&signer.secret(), &authorization_message(pkh, 0), &auth));
        assert!(!verify_message(&signer.secret(), &authorization_message(pkh, 1), &auth));
    }

    #[test]
    fn test_random_accounts_are_distinct() {
        let a = SimSigner::random();
        let b = SimSigner::random();
        assert_ne!(a.address(), b.address());
        assert_ne!(a.key_hash(), b.key_hash());
    }
}
