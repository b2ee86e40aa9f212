//! Creator-fee claim surface shared by both venue backends: claiming
//! accrued fees is a property of the token's launch program, not of whether
//! it has since graduated to a pool, so both `CurveVenue` and `PoolVenue`
//! delegate to the same HTTP client rather than duplicating the request
//! plumbing (4.2's `listClaimable`/`buildClaim`).

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::http::pool::create_http_client;
use crate::venue::types::{ClaimablePosition, UnsignedTx};

#[derive(Debug, Clone, Deserialize)]
struct ClaimableEntry {
    mint: String,
    claimable_sol: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaimTxResponse {
    transactions: Vec<UnsignedTxDto>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnsignedTxDto {
    base64: String,
    fee_payer: String,
}

#[derive(Clone)]
pub struct ClaimsClient {
    client: Client,
    base_url: String,
}

impl ClaimsClient {
    pub fn new(base_url: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client(Duration::from_secs(10))?,
            base_url,
        })
    }

    pub async fn list_claimable(
        &self,
        dev_address: &str,
    ) -> Result<Vec<(String, ClaimablePosition)>> {
        let url = format!("{}/claimable/{dev_address}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Venue(format!(
                "claimable lookup failed: {}",
                response.status()
            )));
        }
        let entries: Vec<ClaimableEntry> = response.json().await?;
        debug!(count = entries.len(), %dev_address, "fetched claimable positions");
        Ok(entries
            .into_iter()
            .map(|e| {
                (
                    e.mint,
                    ClaimablePosition {
                        claimable_sol: e.claimable_sol,
                    },
                )
            })
            .collect())
    }

    pub async fn build_claim(
        &self,
        dev_address: &str,
        mints: &[String],
    ) -> Result<Vec<UnsignedTx>> {
        let url = format!("{}/buildClaim", self.base_url);
        let body = serde_json::json!({ "devAddress": dev_address, "mints": mints });
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Venue(format!(
                "buildClaim failed: {}",
                response.status()
            )));
        }
        let parsed: ClaimTxResponse = response.json().await?;
        Ok(parsed
            .transactions
            .into_iter()
            .map(|tx| UnsignedTx {
                base64: tx.base64,
                fee_payer: tx.fee_payer,
            })
            .collect())
    }
}
