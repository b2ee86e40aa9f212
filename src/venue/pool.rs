//! Post-graduation pool venue. Quotes and builds swaps against a graduated
//! AMM aggregator over HTTP, the same shape the prior single-venue client
//! used before the engine grew a curve/pool split (`get_quote`/`get_swap_tx`
//! against `/quote` and `/swap`).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::http::pool::create_http_client;
use crate::model::TradingRoute;
use crate::venue::claims_client::ClaimsClient;
use crate::venue::types::{ClaimablePosition, Quote, Side, TokenMeta, UnsignedTx};
use crate::venue::Venue;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRequest<'a> {
    input_mint: &'a str,
    output_mint: &'a str,
    amount: u64,
    slippage_bps: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    out_amount: String,
    price_impact_pct: String,
    #[serde(default)]
    route_plan: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    user_public_key: &'a str,
    quote_response: QuoteResponse,
    wrap_and_unwrap_sol: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolMeta {
    graduated: bool,
}

pub struct PoolVenue {
    client: Client,
    base_url: String,
    claims: ClaimsClient,
}

impl PoolVenue {
    pub fn new(base_url: String, claims_base_url: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client(Duration::from_millis(5000))?,
            base_url,
            claims: ClaimsClient::new(claims_base_url)?,
        })
    }

    fn price_impact_bps(pct: &str) -> u32 {
        pct.parse::<f64>()
            .map(|p| (p * 100.0).round().max(0.0) as u32)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Venue for PoolVenue {
    async fn quote(&self, mint: &str, side: Side, input_amount: u64, slippage_bps: u16, _route: TradingRoute) -> Result<Quote> {
        let (input_mint, output_mint) = match side {
            Side::Buy => ("So11111111111111111111111111111111111111112", mint),
            Side::Sell => (mint, "So11111111111111111111111111111111111111112"),
        };

        let url = format!("{}/quote", self.base_url);
        let params = QuoteRequest {
            input_mint,
            output_mint,
            amount: input_amount,
            slippage_bps,
        };

        let start = Instant::now();
        let response = self.client.get(&url).query(&params).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Venue(format!("pool quote failed: {body}")));
        }
        let parsed: QuoteResponse = response.json().await?;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, %mint, "pool quote fetched");

        let output_amount: u64 = parsed
            .out_amount
            .parse()
            .map_err(|_| EngineError::Parse("non-numeric outAmount from pool venue".into()))?;

        Ok(Quote {
            output_amount,
            price_impact_bps: Self::price_impact_bps(&parsed.price_impact_pct),
        })
    }

    async fn build_swap(&self, mint: &str, quote: Quote, side: Side, signer_address: &str, _route: TradingRoute) -> Result<UnsignedTx> {
        let (input_mint, output_mint) = match side {
            Side::Buy => ("So11111111111111111111111111111111111111112", mint),
            Side::Sell => (mint, "So11111111111111111111111111111111111111112"),
        };

        let url = format!("{}/swap", self.base_url);
        let request = SwapRequest {
            user_public_key: signer_address,
            quote_response: QuoteResponse {
                out_amount: quote.output_amount.to_string(),
                price_impact_pct: "0".to_string(),
                route_plan: vec![serde_json::json!({
                    "inputMint": input_mint,
                    "outputMint": output_mint,
                })],
            },
            wrap_and_unwrap_sol: true,
        };

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Venue(format!("pool swap build failed: {body}")));
        }
        let parsed: SwapResponse = response.json().await?;

        Ok(UnsignedTx {
            base64: parsed.swap_transaction,
            fee_payer: signer_address.to_string(),
        })
    }

    async fn build_claim(&self, dev_address: &str, mints: &[String]) -> Result<Vec<UnsignedTx>> {
        self.claims.build_claim(dev_address, mints).await
    }

    async fn list_claimable(&self, dev_address: &str) -> Result<Vec<(String, ClaimablePosition)>> {
        self.claims.list_claimable(dev_address).await
    }

    async fn get_token_meta(&self, mint: &str) -> Result<TokenMeta> {
        let url = format!("{}/tokenMeta/{mint}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Venue(format!(
                "pool token meta lookup failed: {}",
                response.status()
            )));
        }
        let parsed: PoolMeta = response.json().await?;
        Ok(TokenMeta {
            graduated: parsed.graduated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_impact_converts_percent_to_bps() {
        assert_eq!(PoolVenue::price_impact_bps("0.5"), 50);
        assert_eq!(PoolVenue::price_impact_bps("1.23"), 123);
        assert_eq!(PoolVenue::price_impact_bps("garbage"), 0);
    }
}
