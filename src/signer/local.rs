//! Holds custodial keypairs in-process. Directly grounded on the teacher's
//! `trading::signer::TransactionSigner`: bs58-decode, deserialize the
//! `VersionedTransaction`, overwrite the first signature slot, reserialize.
//! Generalized to a `keyId -> Keypair` map since the engine manages many
//! dev/ops wallets, not one.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use solana_sdk::signature::{Keypair, Signer as SolanaSigner};
use solana_sdk::transaction::VersionedTransaction;

use crate::error::{EngineError, Result};
use crate::signer::{SignedTx, Signer};
use crate::venue::types::UnsignedTx;

pub struct LocalSigner {
    keys: DashMap<String, Keypair>,
}

impl LocalSigner {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    pub fn add_key(&self, key_id: &str, private_key_base58: &str) -> Result<String> {
        let key_bytes = bs58::decode(private_key_base58)
            .into_vec()
            .map_err(|e| EngineError::Init(format!("invalid private key: {e}")))?;
        let keypair = Keypair::from_bytes(&key_bytes)
            .map_err(|e| EngineError::Init(format!("invalid keypair bytes: {e}")))?;
        let address = keypair.pubkey().to_string();
        self.keys.insert(key_id.to_string(), keypair);
        Ok(address)
    }

    pub fn address_of(&self, key_id: &str) -> Option<String> {
        self.keys.get(key_id).map(|kp| kp.pubkey().to_string())
    }
}

impl Default for LocalSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign(&self, unsigned: UnsignedTx, key_id: &str) -> Result<SignedTx> {
        let entry = self
            .keys
            .get(key_id)
            .ok_or_else(|| EngineError::SignerRefused(format!("unknown key id: {key_id}")))?;
        let keypair = entry.value();

        let tx_bytes = STANDARD
            .decode(&unsigned.base64)
            .map_err(|e| EngineError::Trading(format!("failed to decode base64 tx: {e}")))?;

        let mut tx: VersionedTransaction = bincode::deserialize(&tx_bytes)
            .map_err(|e| EngineError::Trading(format!("failed to deserialize tx: {e}")))?;

        let message = &tx.message;
        let signature = keypair.sign_message(&message.serialize());

        if tx.signatures.is_empty() {
            tx.signatures.push(signature);
        } else {
            tx.signatures[0] = signature;
        }

        let signed_bytes = bincode::serialize(&tx)
            .map_err(|e| EngineError::Trading(format!("failed to serialize signed tx: {e}")))?;

        Ok(SignedTx {
            base64: STANDARD.encode(signed_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_key_rejects_garbage_base58() {
        let signer = LocalSigner::new();
        let err = signer.add_key("k1", "not-valid-base58!!").unwrap_err();
        assert!(matches!(err, EngineError::Init(_)));
    }

    #[tokio::test]
    async fn sign_rejects_unknown_key_id() {
        let signer = LocalSigner::new();
        let unsigned = UnsignedTx {
            base64: String::new(),
            fee_payer: "x".into(),
        };
        let err = signer.sign(unsigned, "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::SignerRefused(_)));
    }
}
