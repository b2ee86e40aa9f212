//! Fast-claim engine (4.6, C7): sweep accrued creator fees from dev
//! addresses and split the proceeds between the platform and the token's
//! user ops wallet. Runs on its own interval, independent of the flywheel.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use solana_sdk::hash::Hash as SolanaHash;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, warn};

use crate::admin::EventBus;
use crate::analytics::stats::Stats;
use crate::balances::BalanceCache;
use crate::error::{EngineError, Result};
use crate::executor::{ExecOpts, TxExecutor};
use crate::model::{
    lamports_to_sol, sol_to_lamports, ClaimRecord, KeyHandle, Token, TradeKind, TradeRecord,
    TradeSource, TradeStatus,
};
use crate::registry::TokenStore;
use crate::rpc::gateway::RpcGateway;
use crate::supervisor::PeriodicJob;
use crate::utils::time::now_unix;
use crate::venue::types::UnsignedTx;
use crate::venue::Venue;

const GROUP_CONCURRENCY: usize = 10;

/// Pure split function, unit-tested directly against S2/S3 (8). The
/// platform token mint is exempt from the fee regardless of `fee_pct`.
pub fn split(claimed_sol: f64, reserve_sol: f64, fee_pct: f64, is_platform_token: bool) -> (f64, f64, f64) {
    let transferable = claimed_sol - reserve_sol;
    if transferable <= 0.0 {
        return (0.0, 0.0, 0.0);
    }
    let platform_fee_sol = if is_platform_token {
        0.0
    } else {
        transferable * (fee_pct / 100.0)
    };
    let user_net_sol = transferable - platform_fee_sol;
    (transferable, platform_fee_sol, user_net_sol)
}

pub struct ClaimsEngine {
    registry: Arc<dyn TokenStore>,
    balances: Arc<BalanceCache>,
    rpc: Arc<dyn RpcGateway>,
    venue: Arc<dyn Venue>,
    executor: Arc<TxExecutor>,
    stats: Arc<Stats>,
    threshold_sol: f64,
    max_concurrent_claims: usize,
    batch_delay: Duration,
    reserve_sol: f64,
    platform_fee_pct: f64,
    platform_token_mint: String,
    platform_ops_address: String,
    dev_min_reserve_sol: f64,
    event_bus: ArcSwapOption<EventBus>,
}

impl ClaimsEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn TokenStore>,
        balances: Arc<BalanceCache>,
        rpc: Arc<dyn RpcGateway>,
        venue: Arc<dyn Venue>,
        executor: Arc<TxExecutor>,
        stats: Arc<Stats>,
        threshold_sol: f64,
        max_concurrent_claims: usize,
        batch_delay: Duration,
        reserve_sol: f64,
        platform_fee_pct: f64,
        platform_token_mint: String,
        platform_ops_address: String,
        dev_min_reserve_sol: f64,
    ) -> Self {
        Self {
            registry,
            balances,
            rpc,
            venue,
            executor,
            stats,
            threshold_sol,
            max_concurrent_claims,
            batch_delay,
            reserve_sol,
            platform_fee_pct,
            platform_token_mint,
            platform_ops_address,
            dev_min_reserve_sol,
            event_bus: ArcSwapOption::empty(),
        }
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        self.event_bus.store(Some(bus));
    }

    /// Runs one fast-claim cycle: group eligible tokens by dev address,
    /// look up claimable balances in parallel, filter by threshold, then
    /// claim in bounded, delayed batches (4.6).
    async fn run_tick(&self) -> Result<()> {
        let tokens = self.registry.active_tokens_for_claim().await?;
        if tokens.is_empty() {
            return Ok(());
        }

        let mut by_dev: HashMap<String, Vec<Token>> = HashMap::new();
        for token in tokens {
            by_dev.entry(token.dev_key_id.clone()).or_default().push(token);
        }
        let groups: Vec<(String, Vec<Token>)> = by_dev.into_iter().collect();

        let mut claimable: Vec<(Token, f64)> = Vec::new();
        for chunk in groups.chunks(GROUP_CONCURRENCY) {
            let mut lookups = FuturesUnordered::new();
            for (dev_key_id, group_tokens) in chunk {
                lookups.push(self.lookup_group(dev_key_id.clone(), group_tokens.clone()));
            }
            while let Some(found) = lookups.next().await {
                claimable.extend(found);
            }
        }

        if claimable.is_empty() {
            if let Some(bus) = self.event_bus.load().as_ref() {
                bus.publish("job_status", json!({ "job": "fast_claim", "eligible": 0 }));
            }
            return Ok(());
        }

        let eligible = claimable.len();
        let mut batches = claimable.chunks(self.max_concurrent_claims).peekable();
        while let Some(batch) = batches.next() {
            let mut claims = FuturesUnordered::new();
            for (token, claimable_sol) in batch {
                claims.push(self.claim_one(token.clone(), *claimable_sol));
            }
            while claims.next().await.is_some() {}

            if batches.peek().is_some() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        if let Some(bus) = self.event_bus.load().as_ref() {
            bus.publish("job_status", json!({ "job": "fast_claim", "eligible": eligible }));
        }
        Ok(())
    }

    async fn lookup_group(&self, dev_key_id: String, group_tokens: Vec<Token>) -> Vec<(Token, f64)> {
        let dev = match self.registry.key_handle(&dev_key_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!(dev_key_id, error = %e, "fast-claim: no dev key handle");
                return Vec::new();
            }
        };

        let positions = match self.venue.list_claimable(&dev.address).await {
            Ok(p) => p,
            Err(e) => {
                warn!(dev_key_id, error = %e, "fast-claim: list_claimable failed");
                return Vec::new();
            }
        };

        let by_mint: HashMap<&str, &Token> =
            group_tokens.iter().map(|t| (t.mint.as_str(), t)).collect();

        positions
            .into_iter()
            .filter_map(|(mint, position)| {
                let token = by_mint.get(mint.as_str())?;
                if position.claimable_sol >= self.threshold_sol {
                    Some(((*token).clone(), position.claimable_sol))
                } else {
                    None
                }
            })
            .collect()
    }

    async fn claim_one(&self, token: Token, claimable_sol: f64) {
        self.stats.inc_claims_attempted();

        let dev = match self.registry.key_handle(&token.dev_key_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!(token_id = %token.id, error = %e, "fast-claim: no dev key handle");
                return;
            }
        };

        let dev_lamports = match self.rpc.get_lamports(&dev.address).await {
            Ok(l) => l,
            Err(e) => {
                warn!(token_id = %token.id, error = %e, "fast-claim: dev balance check failed");
                return;
            }
        };
        if lamports_to_sol(dev_lamports) < self.dev_min_reserve_sol {
            debug!(token_id = %token.id, "fast-claim: dev balance can't cover claim tx fee, skipping");
            return;
        }

        let venue = self.venue.clone();
        let mint = token.mint.clone();
        let dev_address = dev.address.clone();
        let build = move || {
            let venue = venue.clone();
            let mint = mint.clone();
            let dev_address = dev_address.clone();
            async move {
                let mints = [mint];
                let mut txs = venue.build_claim(&dev_address, &mints).await?;
                txs.pop()
                    .ok_or_else(|| EngineError::Venue("build_claim returned no transactions".into()))
            }
        };

        match self.executor.execute(build, &token.dev_key_id, ExecOpts::default()).await {
            Ok(exec) => {
                self.stats.inc_claims_succeeded();
                self.apply_claim_success(&token, &dev, claimable_sol, &exec.signature).await;
            }
            Err(e) => {
                self.stats.inc_claims_failed();
                warn!(token_id = %token.id, error = %e, "fast-claim: claim tx failed");
            }
        }
    }

    async fn apply_claim_success(&self, token: &Token, dev: &KeyHandle, gross_sol: f64, signature: &str) {
        let is_platform = token.is_platform_token(&self.platform_token_mint);
        let (transferable, platform_fee_sol, user_net_sol) =
            split(gross_sol, self.reserve_sol, self.platform_fee_pct, is_platform);

        let record = ClaimRecord {
            token_id: token.id.clone(),
            gross_sol,
            platform_fee_sol,
            user_net_sol,
            signature: signature.to_string(),
            at: now_unix(),
        };
        if let Some(bus) = self.event_bus.load().as_ref() {
            bus.publish(
                "transactions",
                json!({
                    "token_id": token.id,
                    "kind": "claim",
                    "gross_sol": gross_sol,
                    "platform_fee_sol": platform_fee_sol,
                    "user_net_sol": user_net_sol,
                    "signature": signature,
                }),
            );
        }
        let _ = self.registry.record_claim(record).await;

        if transferable <= 0.0 {
            return;
        }

        let ops = match self.registry.key_handle(&token.ops_key_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!(token_id = %token.id, error = %e, "fast-claim: no ops key handle, transfers skipped");
                return;
            }
        };

        // Each leg is independent (4.6/9 open question): a failure on one
        // does not roll back the other, it is recorded and alerted on.
        if platform_fee_sol > 0.0 {
            self.issue_transfer(token, dev, &self.platform_ops_address, platform_fee_sol).await;
        }
        if user_net_sol > 0.0 {
            self.issue_transfer(token, dev, &ops.address, user_net_sol).await;
        }
    }

    async fn issue_transfer(&self, token: &Token, from: &KeyHandle, to_address: &str, amount_sol: f64) {
        let rpc = self.rpc.clone();
        let from_address = from.address.clone();
        let to = to_address.to_string();
        let lamports = sol_to_lamports(amount_sol);

        let build = move || {
            let rpc = rpc.clone();
            let from_address = from_address.clone();
            let to = to.clone();
            async move {
                let blockhash = rpc.get_recent_blockhash().await?;
                build_transfer_unsigned(&from_address, &to, lamports, &blockhash.hash)
            }
        };

        let result = self.executor.execute(build, &token.dev_key_id, ExecOpts::default()).await;
        let (status, signature) = match result {
            Ok(exec) => (TradeStatus::Confirmed, exec.signature),
            Err(e) => {
                warn!(token_id = %token.id, to_address, error = %e, "fast-claim: transfer leg failed, operator alert");
                (TradeStatus::Failed, String::new())
            }
        };

        let trade = TradeRecord {
            token_id: token.id.clone(),
            kind: TradeKind::Transfer,
            sol_amount: amount_sol,
            token_amount: 0.0,
            signature,
            status,
            at: now_unix(),
            source: TradeSource::Claim,
        };
        let _ = self.registry.record_trade(trade).await;
    }
}

#[async_trait]
impl PeriodicJob for ClaimsEngine {
    async fn tick(&self) -> Result<()> {
        self.run_tick().await
    }
}

/// Builds an unsigned native-asset transfer, signable by `LocalSigner`'s
/// bincode/`VersionedTransaction` path the same as a venue-built swap.
fn build_transfer_unsigned(from: &str, to: &str, lamports: u64, blockhash: &str) -> Result<UnsignedTx> {
    let from_pk = Pubkey::from_str(from)?;
    let to_pk = Pubkey::from_str(to)?;
    let hash = SolanaHash::from_str(blockhash)
        .map_err(|e| EngineError::Parse(format!("invalid blockhash: {e}")))?;

    let ix = system_instruction::transfer(&from_pk, &to_pk, lamports);
    let message = Message::new_with_blockhash(&[ix], Some(&from_pk), &hash);
    let tx = VersionedTransaction {
        signatures: vec![Signature::default()],
        message: VersionedMessage::Legacy(message),
    };

    let bytes = bincode::serialize(&tx)
        .map_err(|e| EngineError::Parse(format!("failed to serialize transfer tx: {e}")))?;
    Ok(UnsignedTx {
        base64: STANDARD.encode(bytes),
        fee_payer: from.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s2_claim_with_platform_split() {
        let (transferable, platform_fee, user_net) = split(1.00, 0.1, 10.0, false);
        assert!((transferable - 0.9).abs() < 1e-9);
        assert!((platform_fee - 0.09).abs() < 1e-9);
        assert!((user_net - 0.81).abs() < 1e-9);
    }

    #[test]
    fn s3_platform_token_exempt_from_fee() {
        let (transferable, platform_fee, user_net) = split(1.00, 0.1, 10.0, true);
        assert!((transferable - 0.9).abs() < 1e-9);
        assert_eq!(platform_fee, 0.0);
        assert!((user_net - 0.9).abs() < 1e-9);
    }

    #[test]
    fn reserve_exceeds_claim_yields_no_transfer() {
        let (transferable, platform_fee, user_net) = split(0.05, 0.1, 10.0, false);
        assert_eq!(transferable, 0.0);
        assert_eq!(platform_fee, 0.0);
        assert_eq!(user_net, 0.0);
    }
}
