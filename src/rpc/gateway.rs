use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::rpc::types::{Blockhash, Commitment, SignatureStatus};
use crate::utils::time::now_instant;

/// All chain reads/writes the engine needs, behind a trait so C7/C8/C9 and
/// their tests can run against a deterministic fake instead of a live node
/// (4.1). All read operations are idempotent; failures are classified
/// transient/permanent by the concrete implementation.
#[async_trait]
pub trait RpcGateway: Send + Sync {
    async fn get_lamports(&self, address: &str) -> Result<u64>;
    async fn get_token_amount(&self, owner_addr: &str, mint: &str) -> Result<u128>;
    async fn get_slot(&self) -> Result<u64>;
    /// `commitment` is the level the caller needs the signature to have
    /// reached before it's reported back as settled (85: per-call
    /// `execute` opt, not a process-wide default).
    async fn get_signature_status(&self, sig: &str, commitment: Commitment) -> Result<SignatureStatus>;
    async fn get_recent_blockhash(&self) -> Result<Blockhash>;
    async fn send_raw(&self, bytes: &[u8], commitment: Commitment) -> Result<String>;
    /// Returns `None` when the transaction is not yet visible (e.g. called
    /// within ~200ms of broadcast); callers retry/backoff on `None`.
    async fn get_parsed_transaction(&self, sig: &str) -> Result<Option<serde_json::Value>>;
    fn health(&self) -> RpcHealth;
}

#[derive(Debug, Clone, Copy)]
pub struct RpcHealth {
    pub last_slot: u64,
    pub healthy: bool,
}

struct HealthTracker {
    last_slot: AtomicU64,
    last_advance: Mutex<std::time::Instant>,
}

impl HealthTracker {
    fn new() -> Self {
        Self {
            last_slot: AtomicU64::new(0),
            last_advance: Mutex::new(now_instant()),
        }
    }

    fn observe(&self, slot: u64) {
        let prev = self.last_slot.swap(slot, Ordering::SeqCst);
        if slot > prev {
            *self.last_advance.lock() = now_instant();
        }
    }

    fn snapshot(&self) -> RpcHealth {
        let last_slot = self.last_slot.load(Ordering::SeqCst);
        let stalled = self.last_advance.lock().elapsed() > Duration::from_secs(30);
        RpcHealth {
            last_slot,
            healthy: !stalled,
        }
    }
}

/// Production gateway backed by a primary + optional fallback JSON-RPC
/// endpoint. The fallback is only consulted when the primary's error
/// classifies as transient (4.1: "a single configured endpoint plus an
/// optional fallback").
pub struct SolanaRpcGateway {
    primary: RpcClient,
    fallback: Option<RpcClient>,
    health: HealthTracker,
}

impl SolanaRpcGateway {
    pub fn new(rpc_url: &str, fallback_url: Option<&str>, commitment: CommitmentConfig) -> Self {
        Self {
            primary: RpcClient::new_with_commitment(rpc_url.to_string(), commitment),
            fallback: fallback_url
                .map(|url| RpcClient::new_with_commitment(url.to_string(), commitment)),
            health: HealthTracker::new(),
        }
    }

    async fn with_fallback<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(&RpcClient) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match op(&self.primary).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_retryable() => {
                if let Some(fallback) = &self.fallback {
                    warn!(error = %e, "primary RPC failed, trying fallback");
                    op(fallback).await
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl RpcGateway for SolanaRpcGateway {
    async fn get_lamports(&self, address: &str) -> Result<u64> {
        let pubkey = Pubkey::from_str(address)?;
        self.with_fallback(|client| {
            let pubkey = pubkey;
            async move {
                client
                    .get_balance(&pubkey)
                    .await
                    .map_err(|e| EngineError::TransientRpc(e.to_string()))
            }
        })
        .await
    }

    async fn get_token_amount(&self, owner_addr: &str, mint: &str) -> Result<u128> {
        let owner = Pubkey::from_str(owner_addr)?;
        let mint = Pubkey::from_str(mint)?;
        let amount = crate::utils::token::get_token_balance(&self.primary, &owner, &mint).await?;
        Ok(amount as u128)
    }

    async fn get_slot(&self) -> Result<u64> {
        let slot = self
            .with_fallback(|client| async move {
                client
                    .get_slot()
                    .await
                    .map_err(|e| EngineError::TransientRpc(e.to_string()))
            })
            .await?;
        self.health.observe(slot);
        Ok(slot)
    }

    async fn get_signature_status(&self, sig: &str, commitment: Commitment) -> Result<SignatureStatus> {
        let signature = Signature::from_str(sig)?;
        let statuses = self
            .with_fallback(|client| {
                let signature = signature;
                async move {
                    client
                        .get_signature_statuses(&[signature])
                        .await
                        .map_err(|e| EngineError::TransientRpc(e.to_string()))
                }
            })
            .await?;

        match statuses.value.into_iter().next().flatten() {
            None => Ok(SignatureStatus::NotFound),
            Some(status) => {
                if let Some(err) = status.err {
                    return Ok(SignatureStatus::Failed(err.to_string()));
                }
                let reached = match status.confirmation_status {
                    Some(solana_transaction_status::TransactionConfirmationStatus::Finalized) => 2,
                    Some(solana_transaction_status::TransactionConfirmationStatus::Confirmed) => 1,
                    _ => 0,
                };
                let required = match commitment {
                    Commitment::Processed => 0,
                    Commitment::Confirmed => 1,
                    Commitment::Finalized => 2,
                };
                if reached < required {
                    Ok(SignatureStatus::Pending)
                } else if reached == 2 {
                    Ok(SignatureStatus::Finalized)
                } else {
                    Ok(SignatureStatus::Confirmed)
                }
            }
        }
    }

    async fn get_recent_blockhash(&self) -> Result<Blockhash> {
        let (hash, last_valid) = self
            .with_fallback(|client| async move {
                client
                    .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
                    .await
                    .map(|(h, v)| (h, v))
                    .map_err(|e| EngineError::TransientRpc(e.to_string()))
            })
            .await?;

        Ok(Blockhash {
            hash: hash.to_string(),
            valid_until_height: last_valid,
        })
    }

    async fn send_raw(&self, bytes: &[u8], commitment: Commitment) -> Result<String> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: Some(commitment_level(commitment)),
            max_retries: Some(0),
            ..Default::default()
        };
        let sig = self
            .primary
            .send_raw_transaction_with_config(bytes, config)
            .await
            .map_err(|e| EngineError::TransientRpc(e.to_string()))?;
        debug!(signature = %sig, "transaction broadcast");
        Ok(sig.to_string())
    }

    async fn get_parsed_transaction(&self, sig: &str) -> Result<Option<serde_json::Value>> {
        let signature = Signature::from_str(sig)?;
        use solana_transaction_status::UiTransactionEncoding;
        match self
            .primary
            .get_transaction(&signature, UiTransactionEncoding::JsonParsed)
            .await
        {
            Ok(tx) => Ok(Some(serde_json::to_value(tx).unwrap_or(serde_json::Value::Null))),
            Err(_) => Ok(None),
        }
    }

    fn health(&self) -> RpcHealth {
        self.health.snapshot()
    }
}

fn commitment_level(commitment: Commitment) -> CommitmentLevel {
    match commitment {
        Commitment::Processed => CommitmentLevel::Processed,
        Commitment::Confirmed => CommitmentLevel::Confirmed,
        Commitment::Finalized => CommitmentLevel::Finalized,
    }
}
