//! Process entry point: load configuration, wire C1-C10 together, register
//! the periodic jobs with the supervisor (C11), and run until SIGTERM/SIGINT.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use flywheel_engine::admin::{EventBus, StaticAuthVerifier};
use flywheel_engine::analytics::stats::Stats;
use flywheel_engine::balances::BalanceCache;
use flywheel_engine::claims::ClaimsEngine;
use flywheel_engine::config::{Config, SignerMode};
use flywheel_engine::executor::TxExecutor;
use flywheel_engine::flywheel::FlywheelScheduler;
use flywheel_engine::ratelimit::RateLimitBucket;
use flywheel_engine::reactive::{ReactiveEngine, RECONCILE_INTERVAL};
use flywheel_engine::registry::{InMemoryTokenStore, TokenStore};
use flywheel_engine::rpc::gateway::RpcGateway;
use flywheel_engine::rpc::{LogSubscriber, SolanaRpcGateway};
use flywheel_engine::signer::{DelegatedSigner, LocalSigner, Signer};
use flywheel_engine::supervisor::JobSupervisor;
use flywheel_engine::venue::curve::CurveVenue;
use flywheel_engine::venue::pool::PoolVenue;
use flywheel_engine::venue::router::VenueRouter;
use flywheel_engine::venue::Venue;
use solana_sdk::commitment_config::CommitmentConfig;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    flywheel_engine::telemetry::init(&config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> flywheel_engine::error::Result<()> {
    info!("starting engine");

    let rpc: Arc<dyn RpcGateway> = Arc::new(SolanaRpcGateway::new(
        &config.rpc_url,
        config.rpc_fallback_url.as_deref(),
        CommitmentConfig::confirmed(),
    ));

    let curve = CurveVenue::new(config.venue_curve_base_url.clone(), config.venue_claims_base_url.clone())?;
    let pool = PoolVenue::new(config.venue_pool_base_url.clone(), config.venue_claims_base_url.clone())?;
    let venue: Arc<dyn Venue> = Arc::new(VenueRouter::new(Arc::new(curve), Arc::new(pool)));

    let signer: Arc<dyn Signer> = match config.signer_mode {
        SignerMode::Local => {
            let local = LocalSigner::new();
            for (key_id, secret) in config.parsed_local_signer_keys()? {
                local.add_key(&key_id, &secret)?;
            }
            Arc::new(local)
        }
        SignerMode::Delegated => {
            let url = config.delegated_signer_url.clone().ok_or_else(|| {
                flywheel_engine::error::EngineError::ConfigInvalid(
                    "DELEGATED_SIGNER_URL must be set when SIGNER_MODE=delegated".into(),
                )
            })?;
            Arc::new(DelegatedSigner::new(url)?)
        }
    };

    let registry: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let stats = Arc::new(Stats::new());
    let executor = Arc::new(TxExecutor::new(rpc.clone(), signer.clone()));
    let balances = BalanceCache::new(
        rpc.clone(),
        registry.clone(),
        config.balance_update_interval(),
        config.balance_update_batch_size,
    );

    let flywheel_rate_limit = Arc::new(RateLimitBucket::spawn(config.turbo_rate_limit_per_min));
    let reactive_rate_limit = Arc::new(RateLimitBucket::spawn(config.turbo_rate_limit_per_min));
    let subscriber = Arc::new(LogSubscriber::spawn(config.rpc_ws_url.clone()));

    let flywheel = Arc::new(FlywheelScheduler::with_max_concurrent(
        registry.clone(),
        balances.clone(),
        venue.clone(),
        executor.clone(),
        flywheel_rate_limit,
        stats.clone(),
        config.flywheel_max_concurrent,
    ));

    let claims = Arc::new(ClaimsEngine::new(
        registry.clone(),
        balances.clone(),
        rpc.clone(),
        venue.clone(),
        executor.clone(),
        stats.clone(),
        config.fast_claim_threshold_sol,
        config.fast_claim_max_concurrent,
        Duration::from_millis(config.fast_claim_batch_delay_ms),
        config.claim_transfer_reserve_sol,
        config.platform_fee_pct,
        config.platform_token_mint.clone(),
        config.platform_ops_address.clone(),
        config.dev_min_reserve_sol,
    ));

    let reactive = ReactiveEngine::new(
        registry.clone(),
        balances.clone(),
        venue.clone(),
        executor.clone(),
        rpc.clone(),
        reactive_rate_limit,
        subscriber,
        stats.clone(),
    );

    let auth_verifier = Arc::new(StaticAuthVerifier::new());
    if !config.admin_auth_token.is_empty() {
        auth_verifier.insert(config.admin_auth_token.clone(), config.admin_auth_identity.clone(), true);
    }
    let event_bus = EventBus::new(auth_verifier);

    flywheel.set_event_bus(event_bus.clone());
    claims.set_event_bus(event_bus.clone());
    reactive.set_event_bus(event_bus.clone());
    balances.set_event_bus(event_bus.clone());

    let bus_for_listen = event_bus.clone();
    let bind_addr = config.admin_bus_bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = bus_for_listen.listen(&bind_addr).await {
            error!(error = %e, "admin bus listener exited");
        }
    });

    let supervisor = Arc::new(JobSupervisor::new());
    supervisor
        .register("flywheel", flywheel, config.flywheel_interval())
        .await;
    supervisor
        .register("fast_claim", claims, config.fast_claim_interval())
        .await;
    supervisor
        .register("balance_refresh", balances, config.balance_update_interval())
        .await;
    supervisor
        .register("reactive", reactive, RECONCILE_INTERVAL)
        .await;

    if config.flywheel_job_enabled {
        supervisor.start("flywheel").await?;
    }
    if config.fast_claim_job_enabled {
        supervisor.start("fast_claim").await?;
    }
    if config.balance_update_job_enabled {
        supervisor.start("balance_refresh").await?;
    }
    if config.reactive_job_enabled {
        supervisor.start("reactive").await?;
    }

    info!("engine running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping jobs");
    supervisor.shutdown().await;
    info!("engine stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
