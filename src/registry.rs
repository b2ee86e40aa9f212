//! Token registry (4.8, C5): the read paths the three jobs pull their
//! active-token snapshots from, plus the scoped state/history writes spec.md
//! §3 grants the engine ("A Token exclusively owns its TokenConfig,
//! FlywheelState, and the history of ClaimRecord/TradeRecord").
//!
//! `InMemoryTokenStore` is the only implementation here; a relational
//! adapter is out of scope (1) but would implement the same trait, which is
//! the additive schema boundary called out in §6.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{EngineError, Result};
use crate::model::{ClaimRecord, FlywheelState, KeyHandle, Token, TokenConfig, TradeRecord};
use crate::utils::time::now_unix;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn active_tokens_for_flywheel(&self) -> Result<Vec<Token>>;
    async fn active_tokens_for_claim(&self) -> Result<Vec<Token>>;
    async fn reactive_tokens(&self) -> Result<Vec<Token>>;

    async fn token(&self, token_id: &str) -> Result<Token>;
    async fn config(&self, token_id: &str) -> Result<TokenConfig>;
    async fn key_handle(&self, key_id: &str) -> Result<KeyHandle>;

    async fn flywheel_state(&self, token_id: &str) -> Result<FlywheelState>;
    /// Synchronous, single-token flush (`batchStateUpdates = false`).
    async fn save_flywheel_state(&self, state: FlywheelState) -> Result<()>;
    /// One-transaction flush for every state mutated in a tick
    /// (`batchStateUpdates = true`).
    async fn save_flywheel_states(&self, states: Vec<FlywheelState>) -> Result<()>;

    /// History writes are always synchronous (4.5) regardless of
    /// `batchStateUpdates`.
    async fn record_trade(&self, record: TradeRecord) -> Result<()>;
    async fn record_claim(&self, record: ClaimRecord) -> Result<()>;

    async fn daily_trade_total_sol(&self, token_id: &str) -> Result<f64>;

    async fn suspend(&self, token_id: &str, reason: &str) -> Result<()>;
    async fn resume(&self, token_id: &str) -> Result<()>;

    /// Set by an operator action (config edit); consumed by the scheduler
    /// at the start of the next tick (4.5 "Config reload").
    fn reload_requested(&self) -> bool;
    fn clear_reload(&self);
    fn request_reload(&self);
}

pub struct InMemoryTokenStore {
    tokens: DashMap<String, Token>,
    configs: DashMap<String, TokenConfig>,
    flywheel_states: DashMap<String, FlywheelState>,
    keys: DashMap<String, KeyHandle>,
    trades: DashMap<String, Vec<TradeRecord>>,
    claims: DashMap<String, Vec<ClaimRecord>>,
    reload_requested: AtomicBool,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            configs: DashMap::new(),
            flywheel_states: DashMap::new(),
            keys: DashMap::new(),
            trades: DashMap::new(),
            claims: DashMap::new(),
            reload_requested: AtomicBool::new(false),
        }
    }

    /// Onboards a token with its config and key handles (the wallet-creation
    /// ceremony and HTTP surface that would normally call this are out of
    /// scope; tests and `InMemoryTokenStore`'s other callers use this
    /// directly).
    pub fn insert_token(&self, token: Token, config: TokenConfig, dev: KeyHandle, ops: KeyHandle) {
        self.keys.insert(dev.key_id.clone(), dev);
        self.keys.insert(ops.key_id.clone(), ops);
        self.configs.insert(token.id.clone(), config);
        self.tokens.insert(token.id.clone(), token);
    }

    fn eligible_tokens(&self) -> Vec<Token> {
        self.tokens
            .iter()
            .filter(|entry| entry.value().eligible())
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn active_tokens_for_flywheel(&self) -> Result<Vec<Token>> {
        Ok(self
            .eligible_tokens()
            .into_iter()
            .filter(|t| {
                self.configs
                    .get(&t.id)
                    .map(|c| c.flywheel_active)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn active_tokens_for_claim(&self) -> Result<Vec<Token>> {
        Ok(self
            .eligible_tokens()
            .into_iter()
            .filter(|t| {
                self.configs
                    .get(&t.id)
                    .map(|c| c.auto_claim_enabled)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn reactive_tokens(&self) -> Result<Vec<Token>> {
        Ok(self
            .eligible_tokens()
            .into_iter()
            .filter(|t| {
                self.configs
                    .get(&t.id)
                    .map(|c| c.reactive.enabled)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn token(&self, token_id: &str) -> Result<Token> {
        self.tokens
            .get(token_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::Parse(format!("unknown token id: {token_id}")))
    }

    async fn config(&self, token_id: &str) -> Result<TokenConfig> {
        self.configs
            .get(token_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::Parse(format!("no config for token: {token_id}")))
    }

    async fn key_handle(&self, key_id: &str) -> Result<KeyHandle> {
        self.keys
            .get(key_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| EngineError::Parse(format!("unknown key id: {key_id}")))
    }

    async fn flywheel_state(&self, token_id: &str) -> Result<FlywheelState> {
        Ok(self
            .flywheel_states
            .entry(token_id.to_string())
            .or_insert_with(|| FlywheelState::new(token_id))
            .clone())
    }

    async fn save_flywheel_state(&self, state: FlywheelState) -> Result<()> {
        self.flywheel_states.insert(state.token_id.clone(), state);
        Ok(())
    }

    async fn save_flywheel_states(&self, states: Vec<FlywheelState>) -> Result<()> {
        for state in states {
            self.flywheel_states.insert(state.token_id.clone(), state);
        }
        Ok(())
    }

    async fn record_trade(&self, record: TradeRecord) -> Result<()> {
        self.trades.entry(record.token_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn record_claim(&self, record: ClaimRecord) -> Result<()> {
        self.claims.entry(record.token_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn daily_trade_total_sol(&self, token_id: &str) -> Result<f64> {
        let cutoff = now_unix() - 86_400;
        Ok(self
            .trades
            .get(token_id)
            .map(|history| {
                history
                    .iter()
                    .filter(|r| r.at >= cutoff && matches!(r.kind, crate::model::TradeKind::Buy | crate::model::TradeKind::Sell))
                    .map(|r| r.sol_amount)
                    .sum()
            })
            .unwrap_or(0.0))
    }

    async fn suspend(&self, token_id: &str, _reason: &str) -> Result<()> {
        if let Some(mut entry) = self.tokens.get_mut(token_id) {
            entry.suspended = true;
        }
        Ok(())
    }

    async fn resume(&self, token_id: &str) -> Result<()> {
        if let Some(mut entry) = self.tokens.get_mut(token_id) {
            entry.suspended = false;
        }
        if let Some(mut state) = self.flywheel_states.get_mut(token_id) {
            state.breaker_opened_at = None;
            state.consecutive_failures = 0;
        }
        Ok(())
    }

    fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::SeqCst)
    }

    fn clear_reload(&self) {
        self.reload_requested.store(false, Ordering::SeqCst);
    }

    fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Algorithm, KeyKind, TradingRoute};

    fn sample_token(id: &str) -> (Token, TokenConfig, KeyHandle, KeyHandle) {
        let token = Token {
            id: id.to_string(),
            mint: format!("mint-{id}"),
            symbol: "TKN".into(),
            decimals: 6,
            dev_key_id: format!("dev-{id}"),
            ops_key_id: format!("ops-{id}"),
            owner_id: "owner-1".into(),
            created_at: 0,
            active: true,
            suspended: false,
            graduated: false,
            venue_hint: None,
        };
        let mut config = TokenConfig {
            token_id: id.to_string(),
            ..Default::default()
        };
        config.flywheel_active = true;
        config.algorithm = Algorithm::Simple;
        config.trading_route = TradingRoute::Auto;
        let dev = KeyHandle {
            key_id: token.dev_key_id.clone(),
            address: "devAddr".into(),
            kind: KeyKind::Local,
        };
        let ops = KeyHandle {
            key_id: token.ops_key_id.clone(),
            address: "opsAddr".into(),
            kind: KeyKind::Local,
        };
        (token, config, dev, ops)
    }

    #[tokio::test]
    async fn suspended_token_excluded_from_flywheel_snapshot() {
        let store = InMemoryTokenStore::new();
        let (mut token, config, dev, ops) = sample_token("t1");
        store.insert_token(token.clone(), config, dev, ops);
        assert_eq!(store.active_tokens_for_flywheel().await.unwrap().len(), 1);

        token.suspended = true;
        store.suspend("t1", "operator").await.unwrap();
        assert!(store.active_tokens_for_flywheel().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_clears_breaker() {
        let store = InMemoryTokenStore::new();
        let (token, config, dev, ops) = sample_token("t1");
        store.insert_token(token, config, dev, ops);

        let mut state = store.flywheel_state("t1").await.unwrap();
        state.breaker_opened_at = Some(1);
        state.consecutive_failures = 5;
        store.save_flywheel_state(state).await.unwrap();

        store.resume("t1").await.unwrap();
        let state = store.flywheel_state("t1").await.unwrap();
        assert!(!state.is_breaker_open());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn flywheel_state_created_lazily_and_reused() {
        let store = InMemoryTokenStore::new();
        let first = store.flywheel_state("unknown").await.unwrap();
        let mut second = store.flywheel_state("unknown").await.unwrap();
        second.buy_count = 3;
        store.save_flywheel_state(second).await.unwrap();
        let third = store.flywheel_state("unknown").await.unwrap();
        assert_eq!(first.buy_count, 0);
        assert_eq!(third.buy_count, 3);
    }
}
