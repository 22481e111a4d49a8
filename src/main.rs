// =============================================================================
// Meridian Risk Nexus — Main Entry Point
// =============================================================================
//
// Startup order matters: the durable store must answer the initial bulk
// fetch (an empty store is fine, an unreachable one is not), after which the
// engine serves evaluations from memory and tolerates store outages by
// retaining its last snapshot.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod coordinator;
mod evaluate;
mod graduation;
mod memory;
mod recent_trades;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::audit::AuditLog;
use crate::coordinator::RiskCoordinator;
use crate::evaluate::robust::RobustZoneEvaluator;
use crate::memory::manager::{run_recompute_worker, run_reload_loop};
use crate::memory::MemoryManager;
use crate::recent_trades::RecentTradeModulator;
use crate::runtime_config::RuntimeConfig;
use crate::store::{PredictorClient, VectorStoreClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Risk Nexus — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Environment overrides for the external endpoints.
    if let Ok(url) = std::env::var("MERIDIAN_STORE_URL") {
        config.store_base_url = url;
    }
    if let Ok(url) = std::env::var("MERIDIAN_PREDICTOR_URL") {
        config.predictor_base_url = Some(url);
    }
    if let Ok(token) = std::env::var("MERIDIAN_ADMIN_TOKEN") {
        config.admin_token = Some(token);
    }

    // Invalid configuration is a hard startup failure.
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        anyhow::bail!("configuration invalid: {e}");
    }

    info!(
        store = %config.store_base_url,
        listen = %config.listen_addr,
        primary = ?config.primary_evaluator,
        "runtime configuration ready"
    );

    let config = Arc::new(RwLock::new(config));

    // ── 2. External clients ──────────────────────────────────────────────
    let (store_url, timeout_secs, predictor_url, audit_dir, listen_addr) = {
        let c = config.read();
        (
            c.store_base_url.clone(),
            c.store_timeout_secs,
            c.predictor_base_url.clone(),
            c.audit_dir.clone(),
            c.listen_addr.clone(),
        )
    };

    let store_secret = std::env::var("MERIDIAN_STORE_SECRET").ok();
    let store = Arc::new(VectorStoreClient::new(
        store_url,
        store_secret,
        std::time::Duration::from_secs(timeout_secs),
    ));

    let predictor = predictor_url.map(|url| {
        info!(url = %url, "external predictor configured");
        Arc::new(PredictorClient::new(
            url,
            std::time::Duration::from_secs(2),
        ))
    });

    // ── 3. Build subsystems ──────────────────────────────────────────────
    let audit = Arc::new(AuditLog::new(&audit_dir).context("audit log setup failed")?);

    let (memory, recompute_rx) = MemoryManager::new(store.clone(), config.clone());
    let robust = Arc::new(RobustZoneEvaluator::new(config.clone(), audit.clone()));
    let modulator = Arc::new(RecentTradeModulator::new(config.clone()));

    let coordinator = Arc::new(RiskCoordinator::new(
        config.clone(),
        memory.clone(),
        robust.clone(),
        modulator.clone(),
        store.clone(),
        predictor,
    ));

    // ── 4. Initial load (store must answer; empty data is fine) ──────────
    if let Err(e) = memory.initialize().await {
        error!(error = %e, "INITIALIZATION_FAILED — durable store unreachable at cold start");
        anyhow::bail!("initialization failed: {e}");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        memory.clone(),
        robust.clone(),
        modulator,
        coordinator,
        audit.clone(),
    ));

    // ── 5. Background lanes ──────────────────────────────────────────────
    // Reload poll: stats read every 30 s, bulk fetch on growth.
    tokio::spawn(run_reload_loop(memory.clone()));

    // Graduation recompute worker: drains the per-partition queue.
    tokio::spawn(run_recompute_worker(memory.clone(), recompute_rx));

    // Zone evolution: every 15 minutes wall-clock, per key.
    {
        let robust = robust.clone();
        let memory = memory.clone();
        let config = config.clone();
        let audit = audit.clone();
        tokio::spawn(async move {
            let secs = config.read().zone_evolution_interval_secs.max(1);
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = memory.snapshot();
                robust.evolve(&snapshot, chrono::Utc::now());
                audit.record(
                    "evolution",
                    "cycle",
                    serde_json::json!({ "partitions": snapshot.partitions.len() }),
                );
            }
        });
    }

    // ── 6. Serve ─────────────────────────────────────────────────────────
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;

    info!(addr = %listen_addr, "REST/WebSocket surface listening");
    axum::serve(listener, app)
        .await
        .context("server terminated")?;

    Ok(())
}
