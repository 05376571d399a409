//! Canopy prediction gateway: serves tree-ensemble models from a directory
//! over HTTP.
//!
//! [`registry`] keeps loaded models in sync with the directory,
//! [`dispatcher`] scores batches through the [`engine`] boundary with a
//! bounded fan-out, and [`cache`] memoizes scores per model version.

pub mod api;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod ensemble;
pub mod metrics;
pub mod registry;
pub mod watcher;

pub const SERVICE: &str = "prediction-gateway";
