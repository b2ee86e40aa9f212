//! Balance cache (4.8, C6): periodic dev/ops balance refresh with
//! copy-on-write reads. Readers never block behind an in-flight refresh —
//! they see the previous snapshot until the new one swaps in
//! (`arc_swap::ArcSwap`, a teacher dependency that sat unused until now).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tracing::debug;

use crate::admin::EventBus;
use crate::error::Result;
use crate::model::{BalanceSnapshot, Token};
use crate::registry::TokenStore;
use crate::rpc::gateway::RpcGateway;
use crate::supervisor::PeriodicJob;
use crate::utils::time::now_unix;

#[derive(Debug, Clone, Copy)]
pub struct TokenBalances {
    pub ops: BalanceSnapshot,
    pub dev: BalanceSnapshot,
}

struct Snapshot {
    by_token: HashMap<String, TokenBalances>,
    taken_at: Instant,
}

/// Holds the most recent balance read for every token's dev/ops pair.
/// `fresh()` is the eligibility gate the scheduler consults (4.5 precondition
/// 3: "Balances are fresh (else trigger a cache refresh and skip this
/// tick)").
pub struct BalanceCache {
    rpc: Arc<dyn RpcGateway>,
    registry: Arc<dyn TokenStore>,
    refresh_interval: Duration,
    batch_size: usize,
    current: ArcSwap<Snapshot>,
    event_bus: ArcSwapOption<EventBus>,
}

impl BalanceCache {
    pub fn new(
        rpc: Arc<dyn RpcGateway>,
        registry: Arc<dyn TokenStore>,
        refresh_interval: Duration,
        batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            registry,
            refresh_interval,
            batch_size,
            current: ArcSwap::from_pointee(Snapshot {
                by_token: HashMap::new(),
                taken_at: Instant::now() - refresh_interval - Duration::from_secs(1),
            }),
            event_bus: ArcSwapOption::empty(),
        })
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        self.event_bus.store(Some(bus));
    }

    /// Reads the cached balances for a token, or `None` if never refreshed.
    pub fn get(&self, token_id: &str) -> Option<TokenBalances> {
        self.current.load().by_token.get(token_id).copied()
    }

    /// True iff the cached entry for `token_id` is within `refresh_interval`.
    pub fn is_fresh(&self, token_id: &str) -> bool {
        match self.get(token_id) {
            Some(balances) => {
                (now_unix() - balances.ops.at) < self.refresh_interval.as_secs() as i64
            }
            None => false,
        }
    }

    /// Refreshes every active token's dev/ops balances, capped at
    /// `batch_size` concurrent RPC round-trips (4.8).
    pub async fn refresh_all(&self) -> Result<()> {
        let mut tokens = self.registry.active_tokens_for_flywheel().await?;
        let mut claim_tokens = self.registry.active_tokens_for_claim().await?;
        tokens.append(&mut claim_tokens);
        tokens.sort_by(|a, b| a.id.cmp(&b.id));
        tokens.dedup_by(|a, b| a.id == b.id);

        let mut by_token = self.current.load().by_token.clone();
        let mut stream = FuturesUnordered::new();

        for chunk in tokens.chunks(self.batch_size) {
            for token in chunk {
                let token = token.clone();
                stream.push(self.refresh_one(token));
            }
            while let Some(result) = stream.next().await {
                if let Ok((token_id, balances)) = result {
                    by_token.insert(token_id, balances);
                }
            }
        }

        let refreshed = by_token.len();
        self.current.store(Arc::new(Snapshot {
            by_token,
            taken_at: Instant::now(),
        }));
        if let Some(bus) = self.event_bus.load().as_ref() {
            bus.publish("balance_updates", json!({ "tokens_refreshed": refreshed }));
        }
        Ok(())
    }

    /// Refreshes a single token on demand (called when the scheduler
    /// observes stale data mid-tick).
    pub async fn refresh_token(&self, token: &Token) -> Result<TokenBalances> {
        let (token_id, balances) = self.refresh_one(token.clone()).await?;
        let mut by_token = self.current.load().by_token.clone();
        by_token.insert(token_id, balances);
        self.current.store(Arc::new(Snapshot {
            by_token,
            taken_at: Instant::now(),
        }));
        Ok(balances)
    }

    async fn refresh_one(&self, token: Token) -> Result<(String, TokenBalances)> {
        let dev = self.registry.key_handle(&token.dev_key_id).await?;
        let ops = self.registry.key_handle(&token.ops_key_id).await?;

        let ops_sol = self.rpc.get_lamports(&ops.address).await?;
        let ops_tokens = self.rpc.get_token_amount(&ops.address, &token.mint).await?;
        let dev_sol = self.rpc.get_lamports(&dev.address).await?;
        let dev_tokens = self.rpc.get_token_amount(&dev.address, &token.mint).await?;

        let at = now_unix();
        debug!(token_id = %token.id, ops_sol, dev_sol, "refreshed balances");

        Ok((
            token.id,
            TokenBalances {
                ops: BalanceSnapshot {
                    sol_lamports: ops_sol,
                    token_units: ops_tokens,
                    at,
                },
                dev: BalanceSnapshot {
                    sol_lamports: dev_sol,
                    token_units: dev_tokens,
                    at,
                },
            },
        ))
    }
}

#[async_trait]
impl PeriodicJob for BalanceCache {
    async fn tick(&self) -> Result<()> {
        self.refresh_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KeyHandle, KeyKind, TokenConfig};
    use crate::registry::InMemoryTokenStore;
    use crate::rpc::types::{Blockhash, Commitment, SignatureStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeRpc {
        lamports: AtomicU64,
    }

    #[async_trait]
    impl RpcGateway for FakeRpc {
        async fn get_lamports(&self, _address: &str) -> Result<u64> {
            Ok(self.lamports.fetch_add(0, Ordering::SeqCst) + 1_000_000_000)
        }
        async fn get_token_amount(&self, _owner_addr: &str, _mint: &str) -> Result<u128> {
            Ok(42)
        }
        async fn get_slot(&self) -> Result<u64> {
            Ok(1)
        }
        async fn get_signature_status(&self, _sig: &str, _commitment: Commitment) -> Result<SignatureStatus> {
            Ok(SignatureStatus::Confirmed)
        }
        async fn get_recent_blockhash(&self) -> Result<Blockhash> {
            Ok(Blockhash { hash: "h".into(), valid_until_height: 1 })
        }
        async fn send_raw(&self, _bytes: &[u8], _commitment: Commitment) -> Result<String> {
            Ok("sig".into())
        }
        async fn get_parsed_transaction(&self, _sig: &str) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        fn health(&self) -> crate::rpc::gateway::RpcHealth {
            crate::rpc::gateway::RpcHealth { last_slot: 1, healthy: true }
        }
    }

    #[tokio::test]
    async fn refresh_all_populates_cache_and_freshness() {
        let registry_concrete = InMemoryTokenStore::new();
        let token = Token {
            id: "t1".into(),
            mint: "mint1".into(),
            symbol: "T".into(),
            decimals: 6,
            dev_key_id: "dev1".into(),
            ops_key_id: "ops1".into(),
            owner_id: "o".into(),
            created_at: 0,
            active: true,
            suspended: false,
            graduated: false,
            venue_hint: None,
        };
        let config = TokenConfig { token_id: "t1".into(), flywheel_active: true, ..Default::default() };
        registry_concrete.insert_token(
            token,
            config,
            KeyHandle { key_id: "dev1".into(), address: "devAddr".into(), kind: KeyKind::Local },
            KeyHandle { key_id: "ops1".into(), address: "opsAddr".into(), kind: KeyKind::Local },
        );
        let registry: Arc<dyn TokenStore> = Arc::new(registry_concrete);
        let rpc: Arc<dyn RpcGateway> = Arc::new(FakeRpc { lamports: AtomicU64::new(0) });

        let cache = BalanceCache::new(rpc, registry, Duration::from_secs(300), 10);
        assert!(!cache.is_fresh("t1"));
        cache.refresh_all().await.unwrap();
        assert!(cache.is_fresh("t1"));
        let balances = cache.get("t1").unwrap();
        assert_eq!(balances.ops.token_units, 42);
    }
}
