use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use prediction_gateway::api::{self, AppState};
use prediction_gateway::cache::PredictionCache;
use prediction_gateway::config::GatewayConfig;
use prediction_gateway::dispatcher::Dispatcher;
use prediction_gateway::ensemble::ObliviousForestEngine;
use prediction_gateway::registry::ModelRegistry;
use prediction_gateway::{watcher, SERVICE};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = GatewayConfig::load().context("loading configuration")?;
    canopy_core::init_tracing(SERVICE, &cfg.log_level)?;
    canopy_core::init_metrics(SERVICE)?;
    info!(?cfg, "starting {SERVICE}");

    cfg.validate().context("invalid configuration")?;
    canopy_core::start_health_server(cfg.health_port).await?;

    let registry = Arc::new(ModelRegistry::new(Arc::new(ObliviousForestEngine)));
    let cache = Arc::new(PredictionCache::new(cfg.cache_capacity, cfg.cache_ttl()));
    if !cache.is_enabled() {
        info!("result cache disabled");
    }
    let dispatcher = Dispatcher::new(cache, cfg.workers, cfg.score_timeout());

    if cfg.preload {
        let reg = registry.clone();
        let dir = cfg.model_dir.clone();
        let budget = cfg.budget_bytes();
        match tokio::task::spawn_blocking(move || reg.refresh(&dir, budget)).await? {
            Ok(models) => info!(models = models.len(), "models preloaded"),
            Err(e) => warn!(error=%e, "preload failed, serving what was loaded"),
        }
    }
    if cfg.watch_models {
        watcher::spawn_model_watcher(registry.clone(), cfg.model_dir.clone(), cfg.budget_bytes());
    }

    let state = Arc::new(AppState {
        registry,
        dispatcher,
        model_dir: cfg.model_dir.clone(),
        budget_bytes: cfg.budget_bytes(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    info!(%addr, "prediction API listening");
    canopy_core::mark_ready();

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    canopy_core::clear_ready();
    canopy_core::shutdown_metrics();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error=?e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
