//! Narrow interface between the scoring engine and the metric store.

use async_trait::async_trait;

use crate::batch::RunSummary;
use crate::error::StoreError;
use crate::metrics::MetricKey;
use crate::models::{MetricBaseline, MetricReading, ScoreRecord, UnitProjection};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Which units a batch run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Units whose national code starts with the prefix (province or region code).
    Region(String),
    Unit(String),
}

impl Scope {
    /// Stable key used for checkpoints and run records.
    pub fn key(&self) -> String {
        match self {
            Scope::All => "all".to_string(),
            Scope::Region(prefix) => format!("region:{prefix}"),
            Scope::Unit(code) => format!("unit:{code}"),
        }
    }

    pub fn matches(&self, unit_code: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Region(prefix) => unit_code.starts_with(prefix.as_str()),
            Scope::Unit(code) => unit_code == code,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// A nearby unit holding a real reading for the requested metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub unit_code: String,
    pub raw_value: f64,
    pub distance_km: f64,
}

#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Units in scope ordered by code, strictly after `after`.
    async fn list_units(
        &self,
        scope: &Scope,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnitProjection>, StoreError>;

    /// Every current reading held for one unit.
    async fn get_readings(&self, unit_code: &str) -> Result<Vec<MetricReading>, StoreError>;

    async fn get_reading(
        &self,
        unit_code: &str,
        metric: MetricKey,
    ) -> Result<Option<MetricReading>, StoreError> {
        Ok(self
            .get_readings(unit_code)
            .await?
            .into_iter()
            .find(|reading| reading.metric == metric))
    }

    /// Up to `k` other units with a reading for `metric` within the radius,
    /// nearest first by great-circle distance between centroids.
    async fn k_nearest(
        &self,
        unit: &UnitProjection,
        metric: MetricKey,
        k: usize,
        max_radius_km: f64,
    ) -> Result<Vec<Neighbor>, StoreError>;

    /// The full corpus of current raw values for one metric.
    async fn metric_values(&self, metric: MetricKey) -> Result<Vec<f64>, StoreError>;

    /// Ingestion-side write used by station interpolation and imports.
    async fn upsert_readings(&self, readings: &[MetricReading]) -> Result<usize, StoreError>;

    async fn load_baselines(&self) -> Result<Vec<MetricBaseline>, StoreError>;

    async fn get_baseline(&self, metric: MetricKey) -> Result<Option<MetricBaseline>, StoreError> {
        Ok(self
            .load_baselines()
            .await?
            .into_iter()
            .find(|baseline| baseline.metric == metric))
    }

    async fn save_baselines(&self, baselines: &[MetricBaseline]) -> Result<(), StoreError>;

    /// Write a commit group. Each record replaces the unit's current row.
    async fn upsert_scores(&self, records: &[ScoreRecord]) -> Result<(), StoreError>;

    async fn get_score(&self, unit_code: &str) -> Result<Option<ScoreRecord>, StoreError>;

    async fn load_checkpoint(&self, scope_key: &str) -> Result<Option<String>, StoreError>;

    async fn save_checkpoint(&self, scope_key: &str, last_unit_code: &str)
        -> Result<(), StoreError>;

    async fn clear_checkpoint(&self, scope_key: &str) -> Result<(), StoreError>;

    async fn record_run(&self, run: &RunSummary) -> Result<(), StoreError>;
}
