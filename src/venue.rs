pub mod curve;
pub mod pool;
pub mod router;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::TradingRoute;
use crate::venue::types::{ClaimablePosition, Quote, Side, TokenMeta, UnsignedTx};

pub use router::VenueRouter;

/// A token's trading venue: pre-graduation bonding curve (`curve`) or
/// post-graduation pool (`pool`). Both backends expose this same surface
/// (4.2); the scheduler and fast-claim engine never know which one they're
/// talking to. `route` carries the token's configured selection policy so
/// `VenueRouter` can honor a forced `curve`/`pool` override; single-backend
/// implementations ignore it.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn quote(&self, mint: &str, side: Side, input_amount: u64, slippage_bps: u16, route: TradingRoute) -> Result<Quote>;
    async fn build_swap(&self, mint: &str, quote: Quote, side: Side, signer_address: &str, route: TradingRoute) -> Result<UnsignedTx>;
    async fn build_claim(&self, dev_address: &str, mints: &[String]) -> Result<Vec<UnsignedTx>>;
    async fn list_claimable(&self, dev_address: &str) -> Result<Vec<(String, ClaimablePosition)>>;
    async fn get_token_meta(&self, mint: &str) -> Result<TokenMeta>;
}
