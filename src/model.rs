//! Entities from the data model: tokens, per-token config, flywheel state,
//! claim/trade history, key handles, balance snapshots, admin subscriptions.
//!
//! Amounts that cross the on-chain boundary are kept in native units
//! (lamports / raw token units, both `u64`/`u128`) so swap math stays exact;
//! `f64` SOL amounts only appear in config (human-authored thresholds) and
//! in history records meant for display.

use serde::{Deserialize, Serialize};

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64).round() as u64
}

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Simple,
    Turbo,
    Reactive,
    Rebalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingRoute {
    Auto,
    Curve,
    Pool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub mint: String,
    pub symbol: String,
    pub decimals: u8,
    pub dev_key_id: String,
    pub ops_key_id: String,
    pub owner_id: String,
    pub created_at: i64,
    pub active: bool,
    pub suspended: bool,
    /// Cached graduation flag; authoritative value comes from the venue's
    /// `get_token_meta`, refreshed on the 5 minute TTL described in 4.2.
    pub graduated: bool,
    pub venue_hint: Option<String>,
}

impl Token {
    /// A token is eligible for engine activity iff active and not suspended.
    pub fn eligible(&self) -> bool {
        self.active && !self.suspended
    }

    pub fn is_platform_token(&self, platform_token_mint: &str) -> bool {
        self.mint == platform_token_mint
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurboConfig {
    pub interval_sec: u64,
    pub cycle_buys: u32,
    pub cycle_sells: u32,
    pub inter_token_delay_ms: u64,
    pub rate_limit_per_min: u32,
    pub confirm_timeout_sec: u64,
    pub batch_state_updates: bool,
}

impl Default for TurboConfig {
    fn default() -> Self {
        Self {
            interval_sec: 15,
            cycle_buys: 8,
            cycle_sells: 8,
            inter_token_delay_ms: 200,
            rate_limit_per_min: 60,
            confirm_timeout_sec: 20,
            batch_state_updates: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReactiveConfig {
    pub enabled: bool,
    pub min_trigger_sol: f64,
    /// Percent of response per SOL of trigger size (e.g. 10.0 = 10%/SOL).
    pub scale_percent: f64,
    pub max_response_percent: f64,
    pub cooldown_ms: u64,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_trigger_sol: 0.5,
            scale_percent: 10.0,
            max_response_percent: 80.0,
            cooldown_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenConfig {
    pub token_id: String,
    pub flywheel_active: bool,
    pub auto_claim_enabled: bool,
    pub algorithm: Algorithm,
    pub min_buy_sol: f64,
    pub max_buy_sol: f64,
    pub max_sell_tokens: u64,
    pub slippage_bps: u16,
    pub trading_route: TradingRoute,
    pub turbo: TurboConfig,
    pub reactive: ReactiveConfig,
    pub daily_limit_sol: f64,
    pub max_position_sol: f64,
}

impl Default for TokenConfig {
    /// Defaults match the `simple` algorithm (5/5 @60s); the `turbo` block
    /// is reused verbatim by the cycle state machine regardless of which
    /// algorithm is active (`FlywheelState`'s `buyCount`/`sellCount`
    /// invariant is phrased against `cycleBuys`/`cycleSells` without
    /// qualifying which algorithm). Switching `algorithm` to `Turbo`
    /// without also supplying turbo-specific overrides keeps these simple
    /// defaults, which is deliberately conservative (DESIGN.md).
    fn default() -> Self {
        Self {
            token_id: String::new(),
            flywheel_active: false,
            auto_claim_enabled: true,
            algorithm: Algorithm::Simple,
            min_buy_sol: 0.05,
            max_buy_sol: 0.2,
            max_sell_tokens: u64::MAX,
            slippage_bps: 100,
            trading_route: TradingRoute::Auto,
            turbo: TurboConfig {
                interval_sec: 60,
                cycle_buys: 5,
                cycle_sells: 5,
                inter_token_delay_ms: 200,
                rate_limit_per_min: 60,
                confirm_timeout_sec: 20,
                batch_state_updates: true,
            },
            reactive: ReactiveConfig::default(),
            daily_limit_sol: 50.0,
            max_position_sol: f64::MAX,
        }
    }
}

impl TokenConfig {
    /// Turbo-mode defaults (8/8 @15s) for callers switching a token onto
    /// the turbo algorithm without hand-specifying every field.
    pub fn turbo_defaults(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            algorithm: Algorithm::Turbo,
            turbo: TurboConfig::default(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Buying,
    Selling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlywheelState {
    pub token_id: String,
    pub phase: Phase,
    pub buy_count: u32,
    pub sell_count: u32,
    pub last_trade_at: i64,
    pub consecutive_failures: u32,
    pub cooldown_until: i64,
    pub breaker_opened_at: Option<i64>,
    /// The algorithm in effect for the cycle currently running. Pinned at
    /// the last phase-counter reset so a mid-cycle config edit to
    /// `TokenConfig::algorithm` only takes effect at the next cycle
    /// boundary (4.5 "Config reload").
    pub effective_algorithm: Algorithm,
}

impl FlywheelState {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            phase: Phase::Buying,
            buy_count: 0,
            sell_count: 0,
            last_trade_at: 0,
            consecutive_failures: 0,
            cooldown_until: 0,
            breaker_opened_at: None,
            effective_algorithm: Algorithm::Simple,
        }
    }

    /// True at a cycle boundary: the running phase's counter has just reset
    /// to zero (genesis or immediately after a phase flip), the only point
    /// at which a staged algorithm change may take effect.
    pub fn at_cycle_boundary(&self) -> bool {
        self.buy_count == 0 && self.sell_count == 0
    }

    pub fn is_breaker_open(&self) -> bool {
        self.breaker_opened_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimablePosition {
    pub claimable_sol: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub token_id: String,
    pub gross_sol: f64,
    pub platform_fee_sol: f64,
    pub user_net_sol: f64,
    pub signature: String,
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSource {
    Flywheel,
    Reactive,
    Claim,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub token_id: String,
    pub kind: TradeKind,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub signature: String,
    pub status: TradeStatus,
    pub at: i64,
    pub source: TradeSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyKind {
    Local,
    Delegated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHandle {
    pub key_id: String,
    pub address: String,
    pub kind: KeyKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub sol_lamports: u64,
    pub token_units: u128,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSubscription {
    pub client_id: String,
    pub identity_id: String,
    pub channels: Vec<String>,
    pub last_ping_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_at_a_cycle_boundary_with_simple_algorithm() {
        let state = FlywheelState::new("t1");
        assert!(state.at_cycle_boundary());
        assert_eq!(state.effective_algorithm, Algorithm::Simple);
    }

    #[test]
    fn mid_cycle_counts_are_not_a_boundary() {
        let mut state = FlywheelState::new("t1");
        state.buy_count = 1;
        assert!(!state.at_cycle_boundary());
        state.buy_count = 0;
        state.sell_count = 2;
        assert!(!state.at_cycle_boundary());
    }
}
