//! Reactive engine (4.7, C9): mirrors third-party swaps on a reactive-
//! enabled mint with a scaled counter-trade, to keep the tape looking
//! active. Subscribes one `logsSubscribe` filter per mint through the
//! shared multiplexer (`rpc::subscriber::LogSubscriber`) and runs the
//! nine-step per-notification pipeline of 4.7.
//!
//! The notification-to-trigger parsing is a generalization of the
//! scaffold's `processor::transaction::parse_transaction` plus
//! `processor::swap_detector::detect_swap`: instead of a hardcoded target
//! wallet, the account of interest is always the transaction's fee payer,
//! and the token side considered is always the engine's own mint. The
//! bounded, halve-oldest-half dedup set below is the same shape as the
//! scaffold's `processor::cache::DedupCache`, generalized from TTL-based
//! eviction to a fixed entry-count bound (4.7: "evict at 2000 entries by
//! halving the oldest-half").

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::admin::EventBus;
use crate::analytics::stats::Stats;
use crate::balances::BalanceCache;
use crate::error::Result;
use crate::executor::{ExecOpts, TxExecutor};
use crate::model::{
    lamports_to_sol, sol_to_lamports, Token, TokenConfig, TradeKind, TradeRecord, TradeSource,
    TradeStatus,
};
use crate::ratelimit::RateLimitBucket;
use crate::registry::TokenStore;
use crate::rpc::gateway::RpcGateway;
use crate::rpc::subscriber::LogSubscriber;
use crate::rpc::types::LogNotification;
use crate::supervisor::PeriodicJob;
use crate::utils::time::{now_ts, now_unix};
use crate::utils::token::{clamp, raw_to_ui, ui_to_raw};
use crate::venue::types::Side;
use crate::venue::Venue;

const SETTLE_DELAY: Duration = Duration::from_millis(200);
/// Cadence the supervisor should drive this job's `tick` at; `main.rs`
/// passes this into the `reactive` job's `register` call so the constant is
/// the single source of truth for the schedule.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
const DEDUP_MAX_ENTRIES: usize = 2000;

/// Enumerated allow-list of AMM/venue program ids a notification's log
/// lines must mention to pass the cheap pre-filter (4.7 step 2).
const PROGRAM_ALLOWLIST: &[&str] = &[
    "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV",
    "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8",
    "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P",
    "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc",
];

struct DedupInner {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

/// Bounded signature dedup set, mutated only from a notification task
/// (5: "`processedSignatures` set (C9) is mutated only on the websocket
/// reader goroutine").
struct DedupSet {
    inner: Mutex<DedupInner>,
}

impl DedupSet {
    fn new() -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                order: VecDeque::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Returns `true` if `signature` was not already seen, inserting it.
    fn check_and_insert(&self, signature: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.seen.contains(signature) {
            return false;
        }
        inner.seen.insert(signature.to_string());
        inner.order.push_back(signature.to_string());

        if inner.order.len() > DEDUP_MAX_ENTRIES {
            let half = inner.order.len() / 2;
            for _ in 0..half {
                if let Some(old) = inner.order.pop_front() {
                    inner.seen.remove(&old);
                }
            }
        }
        true
    }
}

/// Minimum signal extracted from a fetched transaction: who paid for it,
/// which side we should take in response, and how large the trigger was.
struct TriggerEvent {
    fee_payer: String,
    our_side: Side,
    sol_amount: f64,
}

/// Parses the fee payer's net SOL and `mint` token-balance change out of a
/// `getTransaction` (`jsonParsed`) response and derives the opposite side
/// per 4.7 step 6, falling back to the sign of the SOL delta when the
/// token balance isn't attributable to the fee payer.
fn extract_trigger(value: &Value, mint: &str) -> Option<TriggerEvent> {
    let transaction = value.get("transaction")?;
    let meta = value.get("meta")?;
    let message = transaction.get("message")?;

    let mut account_keys: Vec<String> = Vec::new();
    if let Some(arr) = message.get("accountKeys").and_then(Value::as_array) {
        for k in arr {
            if let Some(s) = k.as_str() {
                account_keys.push(s.to_string());
            } else if let Some(pk) = k.get("pubkey").and_then(Value::as_str) {
                account_keys.push(pk.to_string());
            }
        }
    }
    if let Some(loaded) = meta.get("loadedAddresses") {
        for key in ["writable", "readonly"] {
            if let Some(arr) = loaded.get(key).and_then(Value::as_array) {
                for k in arr {
                    if let Some(s) = k.as_str() {
                        account_keys.push(s.to_string());
                    }
                }
            }
        }
    }
    if account_keys.is_empty() {
        return None;
    }
    let fee_payer = account_keys[0].clone();

    let pre_balances = meta.get("preBalances").and_then(Value::as_array)?;
    let post_balances = meta.get("postBalances").and_then(Value::as_array)?;

    let mut sol_deltas: Vec<i64> = Vec::with_capacity(pre_balances.len());
    for (pre, post) in pre_balances.iter().zip(post_balances.iter()) {
        let pre_u = pre.as_u64().unwrap_or(0) as i64;
        let post_u = post.as_u64().unwrap_or(0) as i64;
        sol_deltas.push(post_u - pre_u);
    }
    let fee_payer_sol_delta = sol_deltas.first().copied().unwrap_or(0);
    let max_abs_sol_delta = sol_deltas.iter().map(|d| d.abs()).max().unwrap_or(0);

    let fee_payer_token_delta = |key: &str| -> i128 {
        meta.get(key)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|b| {
                b.get("accountIndex").and_then(Value::as_u64) == Some(0)
                    && b.get("mint").and_then(Value::as_str) == Some(mint)
            })
            .and_then(|b| b.get("uiTokenAmount")?.get("amount")?.as_str())
            .and_then(|s| s.parse::<i128>().ok())
            .unwrap_or(0)
    };
    let delta_tok = fee_payer_token_delta("postTokenBalances") - fee_payer_token_delta("preTokenBalances");

    let our_side = if delta_tok > 0 && fee_payer_sol_delta < 0 {
        Side::Sell
    } else if delta_tok < 0 && fee_payer_sol_delta > 0 {
        Side::Buy
    } else if fee_payer_sol_delta < 0 {
        Side::Sell
    } else if fee_payer_sol_delta > 0 {
        Side::Buy
    } else {
        return None;
    };

    let sol_amount =
        fee_payer_sol_delta.abs().max(max_abs_sol_delta) as f64 / crate::model::LAMPORTS_PER_SOL as f64;

    Some(TriggerEvent { fee_payer, our_side, sol_amount })
}

/// `pct = min(scalePercent * solAmount, maxResponsePercent)`, as a
/// fraction (not a percentage) ready to multiply against a position size.
pub fn response_fraction(config: &crate::model::ReactiveConfig, sol_amount: f64) -> f64 {
    (config.scale_percent * sol_amount).min(config.max_response_percent) / 100.0
}

/// Whether a trigger clears the minimum size and the per-mint cooldown.
pub fn should_fire(config: &crate::model::ReactiveConfig, sol_amount: f64, now_ms: i64, last_fired_ms: i64) -> bool {
    sol_amount >= config.min_trigger_sol && now_ms.saturating_sub(last_fired_ms) >= config.cooldown_ms as i64
}

pub struct ReactiveEngine {
    registry: Arc<dyn TokenStore>,
    balances: Arc<BalanceCache>,
    venue: Arc<dyn Venue>,
    executor: Arc<TxExecutor>,
    rpc: Arc<dyn RpcGateway>,
    rate_limit: Arc<RateLimitBucket>,
    subscriber: Arc<LogSubscriber>,
    stats: Arc<Stats>,
    dedup: Arc<DedupSet>,
    /// mint -> last-fired unix-millis timestamp (4.7 cooldown).
    cooldowns: Arc<DashMap<String, i64>>,
    /// mint -> live subscription marker; only touched by `reconcile`.
    subscribed: DashMap<String, ()>,
    event_bus: ArcSwapOption<EventBus>,
}

impl ReactiveEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn TokenStore>,
        balances: Arc<BalanceCache>,
        venue: Arc<dyn Venue>,
        executor: Arc<TxExecutor>,
        rpc: Arc<dyn RpcGateway>,
        rate_limit: Arc<RateLimitBucket>,
        subscriber: Arc<LogSubscriber>,
        stats: Arc<Stats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            balances,
            venue,
            executor,
            rpc,
            rate_limit,
            subscriber,
            stats,
            dedup: Arc::new(DedupSet::new()),
            cooldowns: Arc::new(DashMap::new()),
            subscribed: DashMap::new(),
            event_bus: ArcSwapOption::empty(),
        })
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        self.event_bus.store(Some(bus));
    }

    /// Diffs the active reactive-token set against live subscriptions,
    /// subscribing new mints and dropping stale ones (4.7). Driven by the
    /// supervisor at the `RECONCILE_INTERVAL` cadence `main.rs` registers
    /// this job with; also the first thing that runs when the job starts,
    /// so subscriptions exist before any tick fires.
    async fn reconcile(&self) -> Result<()> {
        let tokens = self.registry.reactive_tokens().await?;
        let mut live = HashSet::with_capacity(tokens.len());

        for token in tokens {
            live.insert(token.mint.clone());
            if !self.subscribed.contains_key(&token.mint) {
                self.subscribe_token(token);
            }
        }

        let stale: Vec<String> = self
            .subscribed
            .iter()
            .map(|e| e.key().clone())
            .filter(|mint| !live.contains(mint))
            .collect();
        for mint in stale {
            self.subscriber.unsubscribe(&mint);
            self.subscribed.remove(&mint);
        }

        Ok(())
    }

    fn subscribe_token(&self, token: Token) {
        let rx = self.subscriber.subscribe(&token.mint);
        self.subscribed.insert(token.mint.clone(), ());

        let handles = self.clone_handles();
        tokio::spawn(async move {
            handles.run_mint_loop(token, rx).await;
        });
    }

    fn clone_handles(&self) -> ReactiveTaskHandles {
        ReactiveTaskHandles {
            registry: self.registry.clone(),
            balances: self.balances.clone(),
            venue: self.venue.clone(),
            executor: self.executor.clone(),
            rpc: self.rpc.clone(),
            rate_limit: self.rate_limit.clone(),
            stats: self.stats.clone(),
            dedup: self.dedup.clone(),
            cooldowns: self.cooldowns.clone(),
            event_bus: self.event_bus.load_full(),
        }
    }
}

#[async_trait]
impl PeriodicJob for ReactiveEngine {
    /// One reconciliation pass. Per-notification counter-trades run on
    /// their own per-mint task, outside this supervisor-driven tick.
    async fn tick(&self) -> Result<()> {
        self.reconcile().await
    }
}

/// Owns the per-mint notification loop. Shares the parent's `cooldowns`
/// map via `Arc` so updates are visible across every mint task and back
/// on the engine itself.
struct ReactiveTaskHandles {
    registry: Arc<dyn TokenStore>,
    balances: Arc<BalanceCache>,
    venue: Arc<dyn Venue>,
    executor: Arc<TxExecutor>,
    rpc: Arc<dyn RpcGateway>,
    rate_limit: Arc<RateLimitBucket>,
    stats: Arc<Stats>,
    dedup: Arc<DedupSet>,
    cooldowns: Arc<DashMap<String, i64>>,
    event_bus: Option<Arc<EventBus>>,
}

impl ReactiveTaskHandles {
    fn cooldowns(&self) -> &DashMap<String, i64> {
        &self.cooldowns
    }

    async fn run_mint_loop(&self, token: Token, mut rx: mpsc::UnboundedReceiver<LogNotification>) {
        while let Some(notification) = rx.recv().await {
            self.handle_notification(&token, notification).await;
        }
        debug!(token_id = %token.id, mint = %token.mint, "reactive: mint loop ended (unsubscribed)");
    }

    async fn handle_notification(&self, token: &Token, notification: LogNotification) {
        // 1. skip failed transactions.
        if notification.err.is_some() {
            return;
        }
        // 2. quick filter: known AMM/venue program id must be mentioned.
        let mentions_known_program = PROGRAM_ALLOWLIST
            .iter()
            .any(|pid| notification.logs.iter().any(|line| line.contains(pid)));
        if !mentions_known_program {
            return;
        }
        // 3. dedup on signature.
        if !self.dedup.check_and_insert(&notification.signature) {
            return;
        }

        let config = match self.registry.config(&token.id).await {
            Ok(c) => c,
            Err(_) => return,
        };
        if !config.reactive.enabled {
            return;
        }

        // 4. fetch the parsed transaction after a settle delay.
        tokio::time::sleep(SETTLE_DELAY).await;
        let value = match self.rpc.get_parsed_transaction(&notification.signature).await {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                debug!(token_id = %token.id, error = %e, "reactive: get_parsed_transaction failed");
                return;
            }
        };

        let Some(trigger) = extract_trigger(&value, &token.mint) else {
            return;
        };

        // 5. no fee-payer echo.
        let (dev, ops) = match self.key_addresses(token).await {
            Some(pair) => pair,
            None => return,
        };
        if trigger.fee_payer == dev || trigger.fee_payer == ops {
            self.stats.inc_reactive_dropped_echo();
            return;
        }

        // 7. minimum trigger size.
        if trigger.sol_amount < config.reactive.min_trigger_sol {
            return;
        }

        // 8. per-mint cooldown.
        let now_ms = now_ts() as i64;
        let last_fired = self.cooldowns().get(&token.mint).map(|e| *e).unwrap_or(0);
        if !should_fire(&config.reactive, trigger.sol_amount, now_ms, last_fired) {
            self.stats.inc_reactive_dropped_cooldown();
            return;
        }

        self.dispatch_counter_trade(token, &config, &trigger, &ops).await;
    }

    async fn key_addresses(&self, token: &Token) -> Option<(String, String)> {
        let dev = self.registry.key_handle(&token.dev_key_id).await.ok()?;
        let ops = self.registry.key_handle(&token.ops_key_id).await.ok()?;
        Some((dev.address, ops.address))
    }

    async fn dispatch_counter_trade(&self, token: &Token, config: &TokenConfig, trigger: &TriggerEvent, ops_address: &str) {
        let Some(balances) = self.balances.get(&token.id) else {
            return;
        };

        let fraction = response_fraction(&config.reactive, trigger.sol_amount);
        let (side, amount_sol, amount_tokens) = match trigger.our_side {
            Side::Sell => {
                let ops_tokens = raw_to_ui(balances.ops.token_units, token.decimals);
                let tokens = clamp(ops_tokens * fraction, 0.0, config.max_sell_tokens as f64);
                (Side::Sell, 0.0, tokens)
            }
            Side::Buy => {
                let ops_sol = lamports_to_sol(balances.ops.sol_lamports);
                let sol = clamp(ops_sol * fraction, config.min_buy_sol, config.max_buy_sol);
                (Side::Buy, sol, 0.0)
            }
        };

        let input_amount: u64 = match side {
            Side::Buy => sol_to_lamports(amount_sol),
            Side::Sell => ui_to_raw(amount_tokens, token.decimals) as u64,
        };
        if input_amount == 0 {
            return;
        }

        self.cooldowns().insert(token.mint.clone(), now_ts() as i64);
        self.stats.inc_reactive_triggered();
        self.rate_limit.acquire().await;

        let venue = self.venue.clone();
        let mint = token.mint.clone();
        let ops_address = ops_address.to_string();
        let slippage_bps = config.slippage_bps;
        let trading_route = config.trading_route;
        let build = move || {
            let venue = venue.clone();
            let mint = mint.clone();
            let ops_address = ops_address.clone();
            async move {
                let quote = venue.quote(&mint, side, input_amount, slippage_bps, trading_route).await?;
                venue.build_swap(&mint, quote, side, &ops_address, trading_route).await
            }
        };

        let result = self.executor.execute(build, &token.ops_key_id, ExecOpts::default()).await;
        let (status, signature) = match result {
            Ok(exec) => (TradeStatus::Confirmed, exec.signature),
            Err(e) => {
                warn!(token_id = %token.id, error = %e, "reactive: counter-trade failed");
                (TradeStatus::Failed, String::new())
            }
        };

        let record = TradeRecord {
            token_id: token.id.clone(),
            kind: match side {
                Side::Buy => TradeKind::Buy,
                Side::Sell => TradeKind::Sell,
            },
            sol_amount: amount_sol,
            token_amount: amount_tokens,
            signature: signature.clone(),
            status,
            at: now_unix(),
            source: TradeSource::Reactive,
        };
        if let Some(bus) = &self.event_bus {
            bus.publish(
                "reactive_events",
                json!({
                    "token_id": token.id,
                    "trigger_sol": trigger.sol_amount,
                    "side": match side { Side::Buy => "buy", Side::Sell => "sell" },
                    "status": format!("{:?}", record.status),
                    "signature": signature,
                }),
            );
        }
        let _ = self.registry.record_trade(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReactiveConfig;
    use serde_json::json;

    fn reactive_config() -> ReactiveConfig {
        ReactiveConfig {
            enabled: true,
            min_trigger_sol: 0.5,
            scale_percent: 10.0,
            max_response_percent: 80.0,
            cooldown_ms: 5_000,
        }
    }

    #[test]
    fn s4_response_fraction_clamped_to_max() {
        let config = reactive_config();
        let fraction = response_fraction(&config, 3.0);
        assert!((fraction - 0.30).abs() < 1e-9);

        let ops_tokens = 1_000_000.0;
        let sell_tokens = ops_tokens * fraction;
        assert!((sell_tokens - 300_000.0).abs() < 1e-6);
    }

    #[test]
    fn s4_response_fraction_caps_at_max_response_percent() {
        let config = reactive_config();
        // 10%/SOL * 20 SOL would be 200%, capped to 80%.
        let fraction = response_fraction(&config, 20.0);
        assert!((fraction - 0.80).abs() < 1e-9);
    }

    #[test]
    fn s4_cooldown_blocks_then_allows() {
        let config = reactive_config();
        assert!(should_fire(&config, 1.0, 0, -10_000));
        assert!(!should_fire(&config, 1.0, 2_000, 0));
        assert!(should_fire(&config, 1.0, 5_100, 0));
    }

    #[test]
    fn dedup_set_evicts_oldest_half_past_capacity() {
        let set = DedupSet::new();
        for i in 0..DEDUP_MAX_ENTRIES {
            assert!(set.check_and_insert(&format!("sig-{i}")));
        }
        assert!(!set.check_and_insert("sig-0"));

        // One more insert pushes past capacity and halves the oldest half.
        assert!(set.check_and_insert("sig-overflow"));
        assert!(set.check_and_insert("sig-0"), "oldest entries should have been evicted");
    }

    #[test]
    fn extract_trigger_detects_buy_and_computes_amount() {
        let mint = "Mint11111111111111111111111111111111111111";
        let value = json!({
            "transaction": {
                "message": {
                    "accountKeys": [
                        {"pubkey": "Trader1111111111111111111111111111111111111"},
                        {"pubkey": "Pool11111111111111111111111111111111111111"}
                    ]
                }
            },
            "meta": {
                "preBalances": [1_000_000_000u64, 5_000_000_000u64],
                "postBalances": [997_000_000u64, 5_003_000_000u64],
                "preTokenBalances": [
                    {"accountIndex": 0, "mint": mint, "uiTokenAmount": {"amount": "0", "decimals": 6}}
                ],
                "postTokenBalances": [
                    {"accountIndex": 0, "mint": mint, "uiTokenAmount": {"amount": "120000000000", "decimals": 6}}
                ]
            }
        });

        let trigger = extract_trigger(&value, mint).expect("trigger expected");
        assert_eq!(trigger.fee_payer, "Trader1111111111111111111111111111111111111");
        assert_eq!(trigger.our_side, Side::Sell);
        assert!((trigger.sol_amount - 0.003).abs() < 1e-9);
    }

    #[test]
    fn extract_trigger_falls_back_to_sol_sign_without_attributable_token_delta() {
        let mint = "Mint11111111111111111111111111111111111111";
        let value = json!({
            "transaction": { "message": { "accountKeys": [{"pubkey": "Trader1111111111111111111111111111111111111"}] } },
            "meta": {
                "preBalances": [1_000_000_000u64],
                "postBalances": [900_000_000u64],
            }
        });

        let trigger = extract_trigger(&value, mint).expect("trigger expected");
        assert_eq!(trigger.our_side, Side::Sell);
        assert!((trigger.sol_amount - 0.1).abs() < 1e-9);
    }
}
