//! Pre-graduation bonding-curve venue. Quotes are computed locally with the
//! constant-product formula the curve program itself uses; only reserve
//! state and transaction construction round-trip over HTTP (the curve
//! program has no off-chain aggregator to ask for a quote).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::http::pool::create_http_client;
use crate::model::TradingRoute;
use crate::venue::claims_client::ClaimsClient;
use crate::venue::types::{ClaimablePosition, Quote, Side, TokenMeta, UnsignedTx};
use crate::venue::Venue;

/// Seed reserves for a freshly-created curve, before any trading has moved
/// them. Used only as a fallback when a mint's live reserves can't be read.
pub const INITIAL_VIRTUAL_SOL_RESERVES: u64 = 30_000_000_000;
pub const INITIAL_VIRTUAL_TOKEN_RESERVES: u64 = 1_073_000_000_000_000;
pub const INITIAL_REAL_TOKEN_RESERVES: u64 = 793_100_000_000_000;

/// Curve trading fee, in basis points of the input amount.
pub const FEE_BASIS_POINTS: u64 = 95;

#[derive(Debug, Clone, Copy)]
struct CurveReserves {
    virtual_sol: u64,
    virtual_token: u64,
    real_token: u64,
    graduated: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservesDto {
    virtual_sol_reserves: u64,
    virtual_token_reserves: u64,
    real_token_reserves: u64,
    complete: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildSwapDto {
    transaction: String,
}

/// Constant-product quote, mirroring the curve program's own math: `x * y =
/// k` on virtual reserves, fee taken from the input leg before the swap.
fn quote_constant_product(reserves: CurveReserves, side: Side, input_amount: u64) -> Quote {
    let fee = input_amount.saturating_mul(FEE_BASIS_POINTS) / 10_000;
    let amount_in_after_fee = input_amount.saturating_sub(fee);

    let (reserve_in, reserve_out) = match side {
        Side::Buy => (reserves.virtual_sol as u128, reserves.virtual_token as u128),
        Side::Sell => (reserves.virtual_token as u128, reserves.virtual_sol as u128),
    };

    let amount_in = amount_in_after_fee as u128;
    let k = reserve_in * reserve_out;
    let new_reserve_in = reserve_in + amount_in;
    let new_reserve_out = k / new_reserve_in.max(1);
    let output_amount = reserve_out.saturating_sub(new_reserve_out);

    let price_before = reserve_out as f64 / reserve_in.max(1) as f64;
    let price_after = new_reserve_out as f64 / new_reserve_in as f64;
    let price_impact_bps = if price_before > 0.0 {
        (((price_before - price_after) / price_before).abs() * 10_000.0).round() as u32
    } else {
        0
    };

    Quote {
        output_amount: output_amount.min(u64::MAX as u128) as u64,
        price_impact_bps,
    }
}

pub struct CurveVenue {
    client: Client,
    base_url: String,
    claims: ClaimsClient,
}

impl CurveVenue {
    pub fn new(base_url: String, claims_base_url: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client(Duration::from_millis(5000))?,
            base_url,
            claims: ClaimsClient::new(claims_base_url)?,
        })
    }

    async fn fetch_reserves(&self, mint: &str) -> Result<CurveReserves> {
        let url = format!("{}/reserves/{mint}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::VenueQuoteStale(format!(
                "reserves lookup failed for {mint}: {}",
                response.status()
            )));
        }
        let dto: ReservesDto = response.json().await?;
        Ok(CurveReserves {
            virtual_sol: dto.virtual_sol_reserves,
            virtual_token: dto.virtual_token_reserves,
            real_token: dto.real_token_reserves,
            graduated: dto.complete,
        })
    }
}

#[async_trait]
impl Venue for CurveVenue {
    async fn quote(&self, mint: &str, side: Side, input_amount: u64, _slippage_bps: u16, _route: TradingRoute) -> Result<Quote> {
        let reserves = self.fetch_reserves(mint).await?;
        if reserves.graduated {
            return Err(EngineError::VenueQuoteStale(format!(
                "{mint} has graduated off the curve"
            )));
        }
        debug!(%mint, virtual_sol = reserves.virtual_sol, virtual_token = reserves.virtual_token, "curve quote computed");
        Ok(quote_constant_product(reserves, side, input_amount))
    }

    async fn build_swap(&self, mint: &str, quote: Quote, side: Side, signer_address: &str, _route: TradingRoute) -> Result<UnsignedTx> {
        let url = format!("{}/buildSwap", self.base_url);
        let body = serde_json::json!({
            "mint": mint,
            "side": side,
            "minOutputAmount": quote.output_amount,
            "signerAddress": signer_address,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Venue(format!("curve swap build failed: {text}")));
        }
        let parsed: BuildSwapDto = response.json().await?;
        Ok(UnsignedTx {
            base64: parsed.transaction,
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
        let reserves = self.fetch_reserves(mint).await?;
        Ok(TokenMeta {
            graduated: reserves.graduated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_curve() -> CurveReserves {
        CurveReserves {
            virtual_sol: INITIAL_VIRTUAL_SOL_RESERVES,
            virtual_token: INITIAL_VIRTUAL_TOKEN_RESERVES,
            real_token: INITIAL_REAL_TOKEN_RESERVES,
            graduated: false,
        }
    }

    #[test]
    fn buy_quote_moves_price_up() {
        let reserves = fresh_curve();
        let quote = quote_constant_product(reserves, Side::Buy, 1_000_000_000);
        assert!(quote.output_amount > 0);
        assert!(quote.output_amount < reserves.virtual_token);
    }

    #[test]
    fn larger_input_has_worse_output_ratio() {
        let reserves = fresh_curve();
        let small = quote_constant_product(reserves, Side::Buy, 100_000_000);
        let large = quote_constant_product(reserves, Side::Buy, 10_000_000_000);

        let small_ratio = small.output_amount as f64 / 100_000_000.0;
        let large_ratio = large.output_amount as f64 / 10_000_000_000.0;
        assert!(large_ratio < small_ratio);
        assert!(large.price_impact_bps > small.price_impact_bps);
    }

    #[test]
    fn sell_quote_returns_sol_for_tokens() {
        let reserves = fresh_curve();
        let quote = quote_constant_product(reserves, Side::Sell, 1_000_000_000_000);
        assert!(quote.output_amount > 0);
        assert!(quote.output_amount < reserves.virtual_sol);
    }

    #[test]
    fn zero_input_yields_zero_output() {
        let reserves = fresh_curve();
        let quote = quote_constant_product(reserves, Side::Buy, 0);
        assert_eq!(quote.output_amount, 0);
    }
}
