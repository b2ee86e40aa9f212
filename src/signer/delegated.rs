//! HTTP client for the external custodial signer (4.3, 9). Built the same
//! way the teacher builds its other HTTP clients (pooled `reqwest::Client`,
//! explicit timeout) and implements the ceremony spec.md calls out
//! explicitly: always send the unsigned transaction's raw bytes, never a
//! previously-serialized artifact, and reject a response whose fee payer,
//! blockhash, or instruction set drifted from what was sent.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use solana_sdk::transaction::VersionedTransaction;

use crate::error::{EngineError, Result};
use crate::http::pool::create_http_client;
use crate::signer::{SignedTx, Signer};
use crate::venue::types::UnsignedTx;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    key_id: &'a str,
    unsigned_tx_bytes: &'a str,
    context: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signed_tx_bytes: String,
}

pub struct DelegatedSigner {
    client: Client,
    base_url: String,
}

impl DelegatedSigner {
    pub fn new(base_url: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client(Duration::from_secs(10))?,
            base_url,
        })
    }

    /// Confirms the signer returned a transaction matching what was sent:
    /// same fee payer, same recent blockhash, same instruction list. A
    /// mismatch is treated as `SignerRefused` rather than silently trusting
    /// a signer that rewrote the transaction (4.3).
    fn validate_round_trip(unsigned_bytes: &[u8], signed_bytes: &[u8]) -> Result<()> {
        let sent: VersionedTransaction = bincode::deserialize(unsigned_bytes)
            .map_err(|e| EngineError::SignerRefused(format!("cannot parse sent tx: {e}")))?;
        let received: VersionedTransaction = bincode::deserialize(signed_bytes)
            .map_err(|e| EngineError::SignerRefused(format!("cannot parse signer response: {e}")))?;

        if sent.message.static_account_keys().first() != received.message.static_account_keys().first() {
            return Err(EngineError::SignerRefused("fee payer changed".into()));
        }
        if sent.message.recent_blockhash() != received.message.recent_blockhash() {
            return Err(EngineError::SignerRefused("recent blockhash changed".into()));
        }
        if sent.message.instructions() != received.message.instructions() {
            return Err(EngineError::SignerRefused("instruction set changed".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Signer for DelegatedSigner {
    async fn sign(&self, unsigned: UnsignedTx, key_id: &str) -> Result<SignedTx> {
        let unsigned_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &unsigned.base64,
        )
        .map_err(|e| EngineError::Parse(format!("invalid unsigned tx base64: {e}")))?;

        let url = format!("{}/sign", self.base_url);
        let request = SignRequest {
            key_id,
            unsigned_tx_bytes: &unsigned.base64,
            context: serde_json::json!({ "feePayer": unsigned.fee_payer }),
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::SignerRefused(format!(
                "delegated signer rejected request: {body}"
            )));
        }

        let parsed: SignResponse = response.json().await?;
        let signed_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &parsed.signed_tx_bytes,
        )
        .map_err(|e| EngineError::SignerRefused(format!("invalid signed tx base64: {e}")))?;

        Self::validate_round_trip(&unsigned_bytes, &signed_bytes)?;

        Ok(SignedTx {
            base64: parsed.signed_tx_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_stored_verbatim() {
        let signer = DelegatedSigner::new("https://signer.invalid".into()).unwrap();
        assert_eq!(signer.base_url, "https://signer.invalid");
    }
}
