//! Inference engine boundary.
//!
//! The gateway never evaluates trees itself: an [`InferenceEngine`] turns a
//! model file into an opaque [`ModelHandle`], and the handle scores one
//! feature row at a time. Handles are shared across worker threads, so
//! both traits require `Send + Sync`.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// One scalar of a feature row.
///
/// Equality and hashing are structural: numbers by their IEEE-754 bit
/// pattern, categories by content. This is what the result cache keys on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Category(String),
}

/// Ordered feature values; order must match the order used in training.
pub type FeatureRow = Vec<FeatureValue>;

impl PartialEq for FeatureValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FeatureValue::Number(a), FeatureValue::Number(b)) => a.to_bits() == b.to_bits(),
            (FeatureValue::Category(a), FeatureValue::Category(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FeatureValue {}

impl Hash for FeatureValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            FeatureValue::Number(v) => { 0u8.hash(state); v.to_bits().hash(state); }
            FeatureValue::Category(s) => { 1u8.hash(state); s.hash(state); }
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self { FeatureValue::Number(v) }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self { FeatureValue::Category(v.to_string()) }
}

/// Split a row into its numeric and categorical sub-vectors, preserving the
/// relative order inside each.
pub fn split_row(row: &[FeatureValue]) -> (Vec<f64>, Vec<&str>) {
    let mut floats = Vec::with_capacity(row.len());
    let mut cats = Vec::new();
    for value in row {
        match value {
            FeatureValue::Number(v) => floats.push(*v),
            FeatureValue::Category(s) => cats.push(s.as_str()),
        }
    }
    (floats, cats)
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read model file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("invalid model file {path}: {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("feature count mismatch: model expects {expected_numeric} numeric and {expected_categorical} categorical features, row has {got_numeric} and {got_categorical}")]
    FeatureCount {
        expected_numeric: usize,
        expected_categorical: usize,
        got_numeric: usize,
        got_categorical: usize,
    },
    #[error("scoring failed: {0}")]
    Score(String),
}

/// A loaded model. Scoring is synchronous; callers run it off the async
/// executor.
pub trait ModelHandle: Send + Sync {
    fn score(&self, row: &[FeatureValue]) -> Result<f64, EngineError>;
}

pub trait InferenceEngine: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError>;
}

#[cfg(test)]
pub(crate) mod stub {
    //! Call-counting engine for registry and dispatcher tests.
    //!
    //! Rows are `[index, delay_ms?]`: the score is `index * 10.0`, an
    //! optional second number sleeps that many milliseconds, and any
    //! `"fail"` category makes the row error.
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct Counters {
        pub scores: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    #[derive(Default)]
    pub struct StubEngine {
        pub loads: AtomicUsize,
        pub counters: Arc<Counters>,
        failing: Mutex<HashSet<String>>,
    }

    impl StubEngine {
        pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
        pub fn fail_file(&self, file_name: &str) { self.failing.lock().insert(file_name.to_string()); }
        pub fn loads(&self) -> usize { self.loads.load(Ordering::SeqCst) }
        pub fn scores(&self) -> usize { self.counters.scores.load(Ordering::SeqCst) }
        pub fn max_in_flight(&self) -> usize { self.counters.max_in_flight.load(Ordering::SeqCst) }
        pub fn handle(&self) -> Arc<dyn ModelHandle> { Arc::new(StubModel { counters: self.counters.clone() }) }
    }

    impl InferenceEngine for StubEngine {
        fn load(&self, path: &Path) -> Result<Arc<dyn ModelHandle>, EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if self.failing.lock().contains(&file_name) {
                return Err(EngineError::Format { path: path.to_path_buf(), reason: "corrupt".into() });
            }
            Ok(self.handle())
        }
    }

    struct StubModel { counters: Arc<Counters> }

    impl ModelHandle for StubModel {
        fn score(&self, row: &[FeatureValue]) -> Result<f64, EngineError> {
            let c = &self.counters;
            c.scores.fetch_add(1, Ordering::SeqCst);
            let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            c.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let (floats, cats) = split_row(row);
            if let Some(delay) = floats.get(1) { std::thread::sleep(Duration::from_millis(*delay as u64)); }
            c.in_flight.fetch_sub(1, Ordering::SeqCst);
            if cats.contains(&"fail") { return Err(EngineError::Score("stub failure".into())); }
            Ok(floats.first().copied().unwrap_or(0.0) * 10.0)
        }
    }
}
