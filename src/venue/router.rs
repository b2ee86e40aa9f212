//! Picks which venue backend handles a given mint (4.2): a forced route
//! from `TradingRoute` always wins; `Auto` asks the graduation cache, which
//! mirrors the dedup cache's instant-keyed dashmap approach but stores a
//! boolean per mint instead of a presence check.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::model::TradingRoute;
use crate::venue::types::{ClaimablePosition, Quote, Side, TokenMeta, UnsignedTx};
use crate::venue::Venue;

const GRADUATION_CACHE_TTL: Duration = Duration::from_secs(300);

struct GraduationCache {
    entries: DashMap<String, (bool, Instant)>,
}

impl GraduationCache {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn get(&self, mint: &str) -> Option<bool> {
        self.entries.get(mint).and_then(|entry| {
            let (graduated, stamped) = *entry;
            if stamped.elapsed() < GRADUATION_CACHE_TTL {
                Some(graduated)
            } else {
                None
            }
        })
    }

    fn set(&self, mint: &str, graduated: bool) {
        self.entries
            .insert(mint.to_string(), (graduated, Instant::now()));
    }
}

/// Dispatches to `curve` or `pool` per mint, selecting automatically when a
/// token's `TradingRoute` is `Auto` (3.3: every token carries its own
/// route).
pub struct VenueRouter {
    curve: Arc<dyn Venue>,
    pool: Arc<dyn Venue>,
    graduation: GraduationCache,
}

impl VenueRouter {
    pub fn new(curve: Arc<dyn Venue>, pool: Arc<dyn Venue>) -> Self {
        Self {
            curve,
            pool,
            graduation: GraduationCache::new(),
        }
    }

    /// Resolves which backend to use for `mint` given its configured route.
    /// For `Auto`, consults the cache first and only calls out to a venue
    /// when the cached graduation flag is stale or missing.
    pub async fn resolve(&self, mint: &str, route: TradingRoute) -> Result<Arc<dyn Venue>> {
        match route {
            TradingRoute::Curve => Ok(self.curve.clone()),
            TradingRoute::Pool => Ok(self.pool.clone()),
            TradingRoute::Auto => {
                if let Some(graduated) = self.graduation.get(mint) {
                    return Ok(if graduated {
                        self.pool.clone()
                    } else {
                        self.curve.clone()
                    });
                }

                let meta = match self.curve.get_token_meta(mint).await {
                    Ok(meta) => meta,
                    Err(_) => self.pool.get_token_meta(mint).await?,
                };
                self.graduation.set(mint, meta.graduated);
                Ok(if meta.graduated {
                    self.pool.clone()
                } else {
                    self.curve.clone()
                })
            }
        }
    }
}

#[async_trait]
impl Venue for VenueRouter {
    async fn quote(&self, mint: &str, side: Side, input_amount: u64, slippage_bps: u16, route: TradingRoute) -> Result<Quote> {
        self.resolve(mint, route)
            .await?
            .quote(mint, side, input_amount, slippage_bps, route)
            .await
    }

    async fn build_swap(&self, mint: &str, quote: Quote, side: Side, signer_address: &str, route: TradingRoute) -> Result<UnsignedTx> {
        self.resolve(mint, route)
            .await?
            .build_swap(mint, quote, side, signer_address, route)
            .await
    }

    async fn build_claim(&self, dev_address: &str, mints: &[String]) -> Result<Vec<UnsignedTx>> {
        self.pool.build_claim(dev_address, mints).await
    }

    async fn list_claimable(&self, dev_address: &str) -> Result<Vec<(String, ClaimablePosition)>> {
        self.pool.list_claimable(dev_address).await
    }

    async fn get_token_meta(&self, mint: &str) -> Result<TokenMeta> {
        self.pool.get_token_meta(mint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::types::TokenMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeVenue {
        graduated: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Venue for FakeVenue {
        async fn quote(&self, _mint: &str, _side: Side, _input_amount: u64, _slippage_bps: u16, _route: TradingRoute) -> Result<Quote> {
            Ok(Quote {
                output_amount: 1,
                price_impact_bps: 0,
            })
        }
        async fn build_swap(&self, _mint: &str, _quote: Quote, _side: Side, signer_address: &str, _route: TradingRoute) -> Result<UnsignedTx> {
            Ok(UnsignedTx {
                base64: String::new(),
                fee_payer: signer_address.to_string(),
            })
        }
        async fn build_claim(&self, _dev_address: &str, _mints: &[String]) -> Result<Vec<UnsignedTx>> {
            Ok(vec![])
        }
        async fn list_claimable(&self, _dev_address: &str) -> Result<Vec<(String, ClaimablePosition)>> {
            Ok(vec![])
        }
        async fn get_token_meta(&self, _mint: &str) -> Result<TokenMeta> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenMeta {
                graduated: self.graduated,
            })
        }
    }

    #[tokio::test]
    async fn forced_route_skips_graduation_lookup() {
        let curve = Arc::new(FakeVenue { graduated: false, calls: AtomicUsize::new(0) });
        let pool = Arc::new(FakeVenue { graduated: true, calls: AtomicUsize::new(0) });
        let router = VenueRouter::new(curve.clone(), pool.clone());

        router.resolve("mint1", TradingRoute::Pool).await.unwrap();
        assert_eq!(pool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(curve.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_route_caches_graduation_result() {
        let curve = Arc::new(FakeVenue { graduated: false, calls: AtomicUsize::new(0) });
        let pool = Arc::new(FakeVenue { graduated: true, calls: AtomicUsize::new(0) });
        let router = VenueRouter::new(curve.clone(), pool.clone());

        let resolved1 = router.resolve("mint1", TradingRoute::Auto).await.unwrap();
        let resolved2 = router.resolve("mint1", TradingRoute::Auto).await.unwrap();
        assert_eq!(curve.calls.load(Ordering::SeqCst), 1);
        let _ = (resolved1, resolved2);
    }
}
