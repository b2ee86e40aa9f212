//! Tx executor (4.4, C4): sign, broadcast, confirm with retry. The one rule
//! that matters more than any other here is that `build` is called fresh on
//! every attempt — see 4.4/9 on why a previously serialized transaction must
//! never be resent.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorClass, Result};
use crate::rpc::gateway::RpcGateway;
use crate::rpc::types::{Commitment, SignatureStatus};
use crate::signer::Signer;
use crate::venue::types::UnsignedTx;

const POLL_BASE: Duration = Duration::from_millis(500);
const POLL_CAP: Duration = Duration::from_secs(4);
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy)]
pub struct ExecOpts {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    /// Commitment level `send`/poll must reach before the tx is reported
    /// settled (spec 85: part of the `execute(build, keyId, opts)` call,
    /// not a process-wide default).
    pub commitment: Commitment,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(30),
            commitment: Commitment::Confirmed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub signature: String,
    pub attempts: u32,
}

/// Drives `build -> sign -> sendRaw -> poll` with the retry/backoff state
/// machine of 4.4. Holds one `tokio::sync::Mutex` per `keyId` so two
/// in-flight executions never race a send from the same key (5: "strict
/// serialization of tx issuance on a given keyId").
pub struct TxExecutor {
    rpc: Arc<dyn RpcGateway>,
    signer: Arc<dyn Signer>,
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl TxExecutor {
    pub fn new(rpc: Arc<dyn RpcGateway>, signer: Arc<dyn Signer>) -> Self {
        Self {
            rpc,
            signer,
            key_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key_id: &str) -> Arc<AsyncMutex<()>> {
        self.key_locks
            .entry(key_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Executes one logical transaction: `build` is invoked at the start of
    /// every attempt (never reused across attempts), producing a fresh
    /// unsigned transaction whose blockhash and any venue quote ephemera are
    /// re-derived. Returns on first confirmation, on the first permanent
    /// failure, or after `maxAttempts` are exhausted.
    pub async fn execute<F, Fut>(&self, build: F, key_id: &str, opts: ExecOpts) -> Result<ExecResult>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<UnsignedTx>>,
    {
        let key_lock = self.lock_for(key_id);
        let _guard = key_lock.lock().await;

        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once(&build, key_id, opts).await {
                Ok(sig) => {
                    return Ok(ExecResult {
                        signature: sig,
                        attempts: attempt + 1,
                    })
                }
                Err(e) if matches!(e.class(), ErrorClass::Permanent) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= opts.max_attempts {
                        warn!(%key_id, attempts = attempt, error = %e, "tx attempts exhausted");
                        return Err(EngineError::PermanentProgramError("exhausted".into()));
                    }
                    let sleep_for = crate::utils::time::exp_backoff(attempt, RETRY_BASE, RETRY_CAP);
                    debug!(%key_id, attempt, error = %e, backoff_ms = sleep_for.as_millis() as u64, "retrying tx");
                    tokio::time::sleep(sleep_for).await;
                }
            }
        }
    }

    async fn attempt_once<F, Fut>(&self, build: &F, key_id: &str, opts: ExecOpts) -> Result<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<UnsignedTx>>,
    {
        let unsigned = build().await?;
        let signed = self.signer.sign(unsigned, key_id).await?;
        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &signed.base64)
            .map_err(|e| EngineError::Parse(format!("invalid signed tx base64: {e}")))?;
        let signature = self.rpc.send_raw(&raw, opts.commitment).await?;

        self.poll_until_settled(&signature, opts.per_attempt_timeout, opts.commitment).await
    }

    async fn poll_until_settled(&self, signature: &str, timeout: Duration, commitment: Commitment) -> Result<String> {
        let deadline = Instant::now() + timeout;
        let mut backoff = POLL_BASE;

        loop {
            match self.rpc.get_signature_status(signature, commitment).await? {
                SignatureStatus::Confirmed | SignatureStatus::Finalized => {
                    return Ok(signature.to_string())
                }
                SignatureStatus::Failed(reason) => {
                    return Err(classify_program_error(reason));
                }
                SignatureStatus::Pending | SignatureStatus::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::TransientRpc(format!(
                            "{signature} not confirmed within {timeout:?}"
                        )));
                    }
                    tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())))
                        .await;
                    backoff = (backoff * 2).min(POLL_CAP);
                }
            }
        }
    }
}

/// Distinguishes a permanent on-chain program error from a blockhash
/// expiry, which must be retried by rebuilding (7).
fn classify_program_error(reason: String) -> EngineError {
    let lowered = reason.to_lowercase();
    if lowered.contains("blockhash not found") || lowered.contains("blockhashnotfound") {
        EngineError::BlockhashExpired
    } else {
        EngineError::PermanentProgramError(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::gateway::RpcHealth;
    use crate::rpc::types::Blockhash;
    use crate::signer::SignedTx;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedRpc {
        statuses: Mutex<Vec<SignatureStatus>>,
        sent: AtomicU32,
    }

    #[async_trait]
    impl RpcGateway for ScriptedRpc {
        async fn get_lamports(&self, _address: &str) -> Result<u64> {
            Ok(0)
        }
        async fn get_token_amount(&self, _owner_addr: &str, _mint: &str) -> Result<u128> {
            Ok(0)
        }
        async fn get_slot(&self) -> Result<u64> {
            Ok(1)
        }
        async fn get_signature_status(&self, _sig: &str, _commitment: Commitment) -> Result<SignatureStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.is_empty() {
                Ok(SignatureStatus::Confirmed)
            } else {
                Ok(statuses.remove(0))
            }
        }
        async fn get_recent_blockhash(&self) -> Result<Blockhash> {
            Ok(Blockhash { hash: "h".into(), valid_until_height: 1 })
        }
        async fn send_raw(&self, _bytes: &[u8], _commitment: Commitment) -> Result<String> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(format!("sig-{n}"))
        }
        async fn get_parsed_transaction(&self, _sig: &str) -> Result<Option<serde_json::Value>> {
            Ok(None)
        }
        fn health(&self) -> RpcHealth {
            RpcHealth { last_slot: 1, healthy: true }
        }
    }

    struct AlwaysSignSigner;

    #[async_trait]
    impl Signer for AlwaysSignSigner {
        async fn sign(&self, _unsigned: UnsignedTx, _key_id: &str) -> Result<SignedTx> {
            Ok(SignedTx { base64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"tx") })
        }
    }

    fn dummy_unsigned() -> UnsignedTx {
        UnsignedTx { base64: String::new(), fee_payer: "payer".into() }
    }

    #[tokio::test]
    async fn succeeds_on_first_confirmed_poll() {
        let rpc: Arc<dyn RpcGateway> = Arc::new(ScriptedRpc {
            statuses: Mutex::new(vec![]),
            sent: AtomicU32::new(0),
        });
        let signer: Arc<dyn Signer> = Arc::new(AlwaysSignSigner);
        let executor = TxExecutor::new(rpc, signer);

        let result = executor
            .execute(|| async { Ok(dummy_unsigned()) }, "key1", ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately() {
        let rpc: Arc<dyn RpcGateway> = Arc::new(ScriptedRpc {
            statuses: Mutex::new(vec![SignatureStatus::Failed("custom program error: 0x1".into())]),
            sent: AtomicU32::new(0),
        });
        let signer: Arc<dyn Signer> = Arc::new(AlwaysSignSigner);
        let executor = TxExecutor::new(rpc, signer);

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let err = executor
            .execute(
                move || {
                    attempts_clone.fetch_add(1, Ordering::SeqCst);
                    async { Ok(dummy_unsigned()) }
                },
                "key1",
                ExecOpts::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::PermanentProgramError(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blockhash_expired_retries_with_fresh_build() {
        let rpc: Arc<dyn RpcGateway> = Arc::new(ScriptedRpc {
            statuses: Mutex::new(vec![SignatureStatus::Failed("BlockhashNotFound".into())]),
            sent: AtomicU32::new(0),
        });
        let signer: Arc<dyn Signer> = Arc::new(AlwaysSignSigner);
        let executor = TxExecutor::new(rpc, signer);

        let builds = Arc::new(AtomicU32::new(0));
        let builds_clone = builds.clone();
        let result = executor
            .execute(
                move || {
                    builds_clone.fetch_add(1, Ordering::SeqCst);
                    async { Ok(dummy_unsigned()) }
                },
                "key1",
                ExecOpts { max_attempts: 3, per_attempt_timeout: Duration::from_secs(5), ..ExecOpts::default() },
            )
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}
