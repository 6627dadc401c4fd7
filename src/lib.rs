//! Investment scoring for Italian municipalities and sub-market zones.
//!
//! Raw metric readings are normalized against national baselines onto a
//! 0-10 scale, gaps are filled from nearby units, and the weighted overall
//! score is persisted per unit by a resumable batch driver.

pub mod aggregate;
pub mod baseline;
pub mod batch;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod geo;
pub mod import;
pub mod insights;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod payload;
pub mod report;
pub mod simulate;
pub mod store;
pub mod telemetry;

pub use engine::ScoringEngine;
pub use error::{ScoringError, StoreError};
pub use metrics::MetricKey;
