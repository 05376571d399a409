//! Gateway instruments. Exported through the prometheus registry that
//! `canopy_core::init_metrics` installs; no-ops when metrics are not
//! initialized (tests).

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};

pub struct GatewayMetrics {
    pub predictions_total: Counter<u64>,
    pub prediction_failures_total: Counter<u64>,
    pub rows_scored_total: Counter<u64>,
    pub score_latency_ms: Histogram<f64>,
    pub cache_hits_total: Counter<u64>,
    pub cache_misses_total: Counter<u64>,
    pub cache_evictions_total: Counter<u64>,
    pub refresh_total: Counter<u64>,
    pub refresh_failures_total: Counter<u64>,
    pub model_loads_total: Counter<u64>,
    pub models_evicted_total: Counter<u64>,
}

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("canopy_gateway"));

pub static GATEWAY_METRICS: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
    predictions_total: METER.u64_counter("canopy_predictions")
        .with_description("Prediction batches served, by mode")
        .init(),
    prediction_failures_total: METER.u64_counter("canopy_prediction_failures")
        .with_description("Prediction batches aborted by a row failure")
        .init(),
    rows_scored_total: METER.u64_counter("canopy_rows_scored")
        .with_description("Rows sent to the inference engine (cache misses)")
        .init(),
    score_latency_ms: METER.f64_histogram("canopy_score_latency")
        .with_description("Inference engine latency per row (ms)")
        .with_unit(Unit::new("ms"))
        .init(),
    cache_hits_total: METER.u64_counter("canopy_cache_hits")
        .with_description("Result cache hits")
        .init(),
    cache_misses_total: METER.u64_counter("canopy_cache_misses")
        .with_description("Result cache misses, including expired entries")
        .init(),
    cache_evictions_total: METER.u64_counter("canopy_cache_evictions")
        .with_description("Entries evicted by the ARC policy")
        .init(),
    refresh_total: METER.u64_counter("canopy_registry_refresh")
        .with_description("Registry refresh passes")
        .init(),
    refresh_failures_total: METER.u64_counter("canopy_registry_refresh_failures")
        .with_description("Registry refresh passes that returned an error")
        .init(),
    model_loads_total: METER.u64_counter("canopy_model_loads")
        .with_description("Model files loaded into the engine")
        .init(),
    models_evicted_total: METER.u64_counter("canopy_models_evicted")
        .with_description("Models dropped because their file disappeared")
        .init(),
});

pub fn metrics() -> &'static GatewayMetrics { &GATEWAY_METRICS }
