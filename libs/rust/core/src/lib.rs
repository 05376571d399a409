//! Core shared utilities for Canopy services: tracing, layered config,
//! readiness flags and the health/metrics side server.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use once_cell::sync::OnceCell;
use opentelemetry::KeyValue;
use opentelemetry_sdk::{metrics::MeterProvider, Resource};
use prometheus::{Encoder, TextEncoder};
use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Env var naming an optional config file layered over compiled defaults.
pub const CONFIG_FILE_ENV: &str = "CANOPY_CONFIG_FILE";
/// Prefix for `CANOPY__KEY=value` overrides.
pub const ENV_PREFIX: &str = "CANOPY";

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static METRICS_INIT: OnceCell<MeterProvider> = OnceCell::new();
static SERVICE: OnceCell<(String, Instant)> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
/// Set `CANOPY_JSON_LOG=1` for flattened JSON lines.
pub fn init_tracing(service: &str, default_filter: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CANOPY_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    SERVICE.get_or_init(|| (service.to_string(), Instant::now()));
    info!(target: "canopy", service, "tracing initialized");
    Ok(())
}

/// Route OpenTelemetry instruments into the default prometheus registry so
/// `/metrics` can expose them. Must run before any instrument is created.
pub fn init_metrics(service: &str) -> Result<()> {
    METRICS_INIT.get_or_try_init(|| -> Result<MeterProvider> {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(prometheus::default_registry().clone())
            .build()?;
        let provider = MeterProvider::builder()
            .with_reader(exporter)
            .with_resource(Resource::new(vec![KeyValue::new("service.name", service.to_string())]))
            .build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Ok(provider)
    })?;
    Ok(())
}

/// Flush and stop the meter provider installed by [`init_metrics`].
pub fn shutdown_metrics() {
    if let Some(provider) = METRICS_INIT.get() {
        if let Err(e) = provider.shutdown() { tracing::warn!(error=?e, "meter provider shutdown failed"); }
    }
}

/// Layered config: serialized `defaults`, then the file named by
/// `CANOPY_CONFIG_FILE` (format by extension), then `CANOPY__*` env vars.
pub fn load_config<T>(service: &str, defaults: &T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut builder = config::Config::builder().add_source(config::Config::try_from(defaults)?);
    if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
        info!(target: "canopy", service, %file, "layering config file");
        builder = builder.add_source(config::File::with_name(&file).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );
    Ok(builder.build()?.try_deserialize()?)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(ready_handler))
        .route("/status", get(|| async {
            let (service, uptime) = SERVICE.get()
                .map(|(s, started)| (s.clone(), started.elapsed().as_secs()))
                .unwrap_or_default();
            axum::Json(serde_json::json!({
                "service": service,
                "uptime_secs": uptime,
                "live": NODE_LIVENESS.load(Ordering::SeqCst),
                "ready": NODE_READINESS.load(Ordering::SeqCst),
            }))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(())
}

async fn ready_handler() -> impl IntoResponse {
    let ready = is_ready();
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, axum::Json(serde_json::json!({"ready": ready})))
}

async fn metrics_handler() -> axum::response::Response {
    if METRICS_INIT.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }
    let metric_families = prometheus::default_registry().gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}
