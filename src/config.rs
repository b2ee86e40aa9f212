use std::env;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Process-wide configuration, loaded once at boot from the environment
/// (section 6). Unknown/invalid values are rejected at load time per
/// `ConfigInvalid`; a failed reload is expected to leave the caller's
/// previously loaded `Config` untouched.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,

    // Chain RPC endpoints (required).
    pub rpc_url: String,
    pub rpc_ws_url: String,
    pub rpc_fallback_url: Option<String>,

    // Fast-claim engine (C7).
    pub fast_claim_interval_seconds: u64,
    pub fast_claim_threshold_sol: f64,
    pub fast_claim_max_concurrent: usize,
    pub fast_claim_batch_delay_ms: u64,
    pub fast_claim_job_enabled: bool,

    // Flywheel scheduler (C8).
    pub flywheel_interval_seconds: u64,
    pub flywheel_max_concurrent: usize,
    pub turbo_rate_limit_per_min: u32,
    pub turbo_inter_token_delay_ms: u64,
    pub flywheel_job_enabled: bool,

    // Balance cache (C6).
    pub balance_update_interval_seconds: u64,
    pub balance_update_batch_size: usize,
    pub balance_update_job_enabled: bool,

    // Reactive engine (C9).
    pub reactive_job_enabled: bool,

    // Platform economics.
    pub platform_fee_pct: f64,
    pub platform_token_mint: String,
    /// Destination address for the platform's share of a claim transfer
    /// split (4.6). Not exempted tokens' fee still has to land somewhere.
    pub platform_ops_address: String,

    // Safety reserves.
    pub dev_min_reserve_sol: f64,
    pub claim_transfer_reserve_sol: f64,

    // Admin bus (C10).
    pub admin_bus_bind_addr: String,
    pub admin_auth_token: String,
    pub admin_auth_identity: String,

    // Venue adapter (C2).
    pub venue_curve_base_url: String,
    pub venue_pool_base_url: String,
    pub venue_claims_base_url: String,

    // Signer (C3).
    pub signer_mode: SignerMode,
    pub delegated_signer_url: Option<String>,
    /// `keyId:base58secret,keyId:base58secret` seed pairs for `LocalSigner`.
    /// Only consulted when `signer_mode` is `Local`.
    pub local_signer_keys: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerMode {
    Local,
    Delegated,
}

impl std::str::FromStr for SignerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SignerMode::Local),
            "delegated" => Ok(SignerMode::Delegated),
            other => Err(format!("unknown signer mode: {other}")),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| EngineError::ConfigInvalid(format!("{key} has an invalid value: {val}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let rpc_url = env::var("RPC_URL")
            .map_err(|_| EngineError::ConfigInvalid("RPC_URL must be set".into()))?;
        let rpc_ws_url = env::var("RPC_WS_URL")
            .map_err(|_| EngineError::ConfigInvalid("RPC_WS_URL must be set".into()))?;
        let rpc_fallback_url = env::var("RPC_URL_FALLBACK")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let platform_token_mint = env_string("PLATFORM_TOKEN_MINT", "");
        if platform_token_mint.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "PLATFORM_TOKEN_MINT must be set".into(),
            ));
        }

        let cfg = Self {
            log_level: env_string("LOG_LEVEL", "info"),

            rpc_url,
            rpc_ws_url,
            rpc_fallback_url,

            fast_claim_interval_seconds: env_parsed("FAST_CLAIM_INTERVAL_SECONDS", 30)?,
            fast_claim_threshold_sol: env_parsed("FAST_CLAIM_THRESHOLD_SOL", 0.15)?,
            fast_claim_max_concurrent: env_parsed("FAST_CLAIM_MAX_CONCURRENT", 5)?,
            fast_claim_batch_delay_ms: env_parsed("FAST_CLAIM_BATCH_DELAY_MS", 500)?,
            fast_claim_job_enabled: env_parsed("FAST_CLAIM_JOB_ENABLED", true)?,

            flywheel_interval_seconds: env_parsed("FLYWHEEL_INTERVAL_SECONDS", 60)?,
            flywheel_max_concurrent: env_parsed("FLYWHEEL_MAX_CONCURRENT", 5)?,
            turbo_rate_limit_per_min: env_parsed("TURBO_RATE_LIMIT_PER_MIN", 60)?,
            turbo_inter_token_delay_ms: env_parsed("TURBO_INTER_TOKEN_DELAY_MS", 200)?,
            flywheel_job_enabled: env_parsed("FLYWHEEL_JOB_ENABLED", true)?,

            balance_update_interval_seconds: env_parsed("BALANCE_UPDATE_INTERVAL_SECONDS", 300)?,
            balance_update_batch_size: env_parsed("BALANCE_UPDATE_BATCH_SIZE", 50)?,
            balance_update_job_enabled: env_parsed("BALANCE_UPDATE_JOB_ENABLED", true)?,

            reactive_job_enabled: env_parsed("REACTIVE_JOB_ENABLED", true)?,

            platform_fee_pct: env_parsed("PLATFORM_FEE_PCT", 10.0)?,
            platform_token_mint,
            platform_ops_address: env_string("PLATFORM_OPS_ADDRESS", ""),

            dev_min_reserve_sol: env_parsed("DEV_MIN_RESERVE_SOL", 0.03)?,
            claim_transfer_reserve_sol: env_parsed("CLAIM_TRANSFER_RESERVE_SOL", 0.1)?,

            admin_bus_bind_addr: env_string("ADMIN_BUS_BIND_ADDR", "0.0.0.0:9090"),
            admin_auth_token: env_string("ADMIN_AUTH_TOKEN", ""),
            admin_auth_identity: env_string("ADMIN_AUTH_IDENTITY", "admin"),

            venue_curve_base_url: env_string("VENUE_CURVE_BASE_URL", "https://curve.internal"),
            venue_pool_base_url: env_string("VENUE_POOL_BASE_URL", "https://pool.internal"),
            venue_claims_base_url: env_string("VENUE_CLAIMS_BASE_URL", "https://claims.internal"),

            signer_mode: env_parsed("SIGNER_MODE", SignerMode::Local)?,
            delegated_signer_url: env::var("DELEGATED_SIGNER_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            local_signer_keys: env_string("LOCAL_SIGNER_KEYS", ""),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.platform_fee_pct < 0.0 || self.platform_fee_pct > 100.0 {
            return Err(EngineError::ConfigInvalid(
                "PLATFORM_FEE_PCT must be within [0, 100]".into(),
            ));
        }
        if self.fast_claim_max_concurrent == 0 || self.flywheel_max_concurrent == 0 {
            return Err(EngineError::ConfigInvalid(
                "max-concurrent settings must be greater than zero".into(),
            ));
        }
        if self.signer_mode == SignerMode::Delegated && self.delegated_signer_url.is_none() {
            return Err(EngineError::ConfigInvalid(
                "DELEGATED_SIGNER_URL must be set when SIGNER_MODE=delegated".into(),
            ));
        }
        if self.signer_mode == SignerMode::Local && self.local_signer_keys.trim().is_empty() {
            return Err(EngineError::ConfigInvalid(
                "LOCAL_SIGNER_KEYS must be set when SIGNER_MODE=local".into(),
            ));
        }
        Ok(())
    }

    /// Parses `LOCAL_SIGNER_KEYS` into `(key_id, base58_secret)` pairs.
    pub fn parsed_local_signer_keys(&self) -> Result<Vec<(String, String)>> {
        self.local_signer_keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|pair| {
                pair.split_once(':')
                    .map(|(id, secret)| (id.to_string(), secret.to_string()))
                    .ok_or_else(|| {
                        EngineError::ConfigInvalid(format!(
                            "LOCAL_SIGNER_KEYS entry missing ':' separator: {pair}"
                        ))
                    })
            })
            .collect()
    }

    pub fn fast_claim_interval(&self) -> Duration {
        Duration::from_secs(self.fast_claim_interval_seconds)
    }

    pub fn flywheel_interval(&self) -> Duration {
        Duration::from_secs(self.flywheel_interval_seconds)
    }

    pub fn balance_update_interval(&self) -> Duration {
        Duration::from_secs(self.balance_update_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_platform_fee() {
        let mut cfg = test_config();
        cfg.platform_fee_pct = 150.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        let cfg = test_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.fast_claim_interval(), Duration::from_secs(30));
    }

    fn test_config() -> Config {
        Config {
            log_level: "info".into(),
            rpc_url: "https://example.invalid".into(),
            rpc_ws_url: "wss://example.invalid".into(),
            rpc_fallback_url: None,
            fast_claim_interval_seconds: 30,
            fast_claim_threshold_sol: 0.15,
            fast_claim_max_concurrent: 5,
            fast_claim_batch_delay_ms: 500,
            fast_claim_job_enabled: true,
            flywheel_interval_seconds: 60,
            flywheel_max_concurrent: 5,
            turbo_rate_limit_per_min: 60,
            turbo_inter_token_delay_ms: 200,
            flywheel_job_enabled: true,
            balance_update_interval_seconds: 300,
            balance_update_batch_size: 50,
            balance_update_job_enabled: true,
            reactive_job_enabled: true,
            platform_fee_pct: 10.0,
            platform_token_mint: "PlatformMint1111111111111111111111111111111".into(),
            platform_ops_address: "PlatformOps11111111111111111111111111111111".into(),
            dev_min_reserve_sol: 0.03,
            claim_transfer_reserve_sol: 0.1,
            admin_bus_bind_addr: "0.0.0.0:9090".into(),
            admin_auth_token: "test-token".into(),
            admin_auth_identity: "admin".into(),
            venue_curve_base_url: "https://curve.invalid".into(),
            venue_pool_base_url: "https://pool.invalid".into(),
            venue_claims_base_url: "https://claims.invalid".into(),
            signer_mode: SignerMode::Local,
            delegated_signer_url: None,
            local_signer_keys: "dev1:11111111111111111111111111111111".into(),
        }
    }
}
