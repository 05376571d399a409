//! Batch prediction: bounded fan-out over the blocking pool, ordered fan-in.
//!
//! Rows are admitted through `buffer_unordered`, so at most `workers` scores
//! are in flight and the next row starts only when a slot frees up. The
//! first failing row (in completion order) ends the batch; dropping the
//! stream means queued rows are never started.

use futures::stream::{self, StreamExt, TryStreamExt};
use opentelemetry::KeyValue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{CacheKey, PredictionCache};
use crate::engine::{EngineError, FeatureRow};
use crate::metrics::metrics;
use crate::registry::{LoadedModel, VersionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictMode {
    #[default]
    Plain,
    Min,
    Max,
}

impl PredictMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictMode::Plain => "plain",
            PredictMode::Min => "min",
            PredictMode::Max => "max",
        }
    }
}

impl fmt::Display for PredictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown prediction mode '{0}', expected 'min' or 'max'")]
pub struct UnknownMode(pub String);

impl FromStr for PredictMode {
    type Err = UnknownMode;

    /// Parses the optional route segment; plain mode has no segment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(PredictMode::Min),
            "max" => Ok(PredictMode::Max),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredictionResult {
    Vector(Vec<f64>),
    Winner { index: usize, value: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub model_version: VersionTag,
    pub result: PredictionResult,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no feature rows in request")]
    EmptyBatch,
    #[error("row {row}: {source}")]
    Inference { row: usize, #[source] source: EngineError },
    #[error("row {row}: scoring timed out after {after:?}")]
    Timeout { row: usize, after: Duration },
    #[error("row {row}: scoring task failed: {reason}")]
    Worker { row: usize, reason: String },
}

/// Index and value of the extreme score. The first row attaining it wins;
/// NaN never wins unless every score is NaN, in which case row 0 does.
pub fn select_winner(values: &[f64], mode: PredictMode) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() { continue; }
        let better = match best {
            None => true,
            Some((_, b)) => match mode {
                PredictMode::Max => v > b,
                PredictMode::Min => v < b,
                PredictMode::Plain => false,
            },
        };
        if better { best = Some((i, v)); }
    }
    best.or_else(|| values.first().map(|&v| (0, v)))
}

#[derive(Debug)]
pub struct Dispatcher {
    cache: Arc<PredictionCache>,
    workers: usize,
    score_timeout: Option<Duration>,
}

impl Dispatcher {
    /// `workers == 0` scores one row at a time.
    pub fn new(cache: Arc<PredictionCache>, workers: usize, score_timeout: Option<Duration>) -> Self {
        Self { cache, workers: workers.max(1), score_timeout }
    }

    pub fn workers(&self) -> usize { self.workers }

    pub async fn predict(&self, model: &Arc<LoadedModel>, batch: Vec<FeatureRow>, mode: PredictMode) -> Result<Prediction, DispatchError> {
        if batch.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        metrics().predictions_total.add(1, &[KeyValue::new("mode", mode.as_str())]);
        let started = Instant::now();
        let rows = batch.len();
        let mut values = vec![f64::NAN; rows];

        let scored = stream::iter(batch.into_iter().enumerate())
            .map(|(index, row)| self.score_row(model, index, row))
            .buffer_unordered(self.workers);
        futures::pin_mut!(scored);
        loop {
            match scored.try_next().await {
                Ok(Some((index, value))) => values[index] = value,
                Ok(None) => break,
                Err(e) => {
                    metrics().prediction_failures_total.add(1, &[]);
                    warn!(model=%model.name(), error=%e, "batch aborted");
                    return Err(e);
                }
            }
        }
        debug!(model=%model.name(), rows, mode=%mode, elapsed_ms = started.elapsed().as_millis() as u64, "batch scored");

        let result = match mode {
            PredictMode::Plain => PredictionResult::Vector(values),
            PredictMode::Min | PredictMode::Max => {
                let (index, value) = select_winner(&values, mode).ok_or(DispatchError::EmptyBatch)?;
                PredictionResult::Winner { index, value }
            }
        };
        Ok(Prediction { model_version: model.version().clone(), result })
    }

    async fn score_row(&self, model: &Arc<LoadedModel>, index: usize, row: FeatureRow) -> Result<(usize, f64), DispatchError> {
        let key = CacheKey::new(model.version().clone(), row);
        if let Some(value) = self.cache.get(&key) {
            return Ok((index, value));
        }
        let handle = model.handle().clone();
        let task = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let result = handle.score(key.row());
            (key, result, started.elapsed())
        });
        let joined = match self.score_timeout {
            Some(after) => tokio::time::timeout(after, task)
                .await
                .map_err(|_| DispatchError::Timeout { row: index, after })?,
            None => task.await,
        };
        let (key, result, elapsed) = joined.map_err(|e| DispatchError::Worker { row: index, reason: e.to_string() })?;
        metrics().rows_scored_total.add(1, &[]);
        metrics().score_latency_ms.record(elapsed.as_secs_f64() * 1000.0, &[]);
        let value = result.map_err(|source| DispatchError::Inference { row: index, source })?;
        self.cache.insert(key, value);
        Ok((index, value))
    }
}
