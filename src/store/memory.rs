use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{MetricStore, Neighbor, Scope};
use crate::batch::{RunSummary, StopSignal};
use crate::error::StoreError;
use crate::geo::haversine_km;
use crate::metrics::MetricKey;
use crate::models::{GeographicUnit, MetricBaseline, MetricReading, ScoreRecord, UnitProjection};

/// In-process store backing `simulate` runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    units: BTreeMap<String, GeographicUnit>,
    readings: BTreeMap<(String, MetricKey), MetricReading>,
    baselines: BTreeMap<MetricKey, MetricBaseline>,
    scores: BTreeMap<String, ScoreRecord>,
    checkpoints: HashMap<String, String>,
    runs: Vec<RunSummary>,
    injected_failures: HashMap<String, usize>,
    score_writes: usize,
    reads: usize,
    stop_after: Option<(usize, StopSignal)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(units: Vec<GeographicUnit>, readings: Vec<MetricReading>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for unit in units {
                inner.units.insert(unit.code.clone(), unit);
            }
            for reading in readings {
                inner
                    .readings
                    .insert((reading.unit_code.clone(), reading.metric), reading);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_unit(&self, unit: GeographicUnit) {
        self.lock().units.insert(unit.code.clone(), unit);
    }

    pub fn insert_reading(&self, reading: MetricReading) {
        self.lock()
            .readings
            .insert((reading.unit_code.clone(), reading.metric), reading);
    }

    /// Make the next `times` reading lookups for `unit_code` fail transiently.
    pub fn inject_transient_failures(&self, unit_code: &str, times: usize) {
        self.lock()
            .injected_failures
            .insert(unit_code.to_string(), times);
    }

    /// Trip `signal` once `reads` unit reading lookups have been served.
    pub fn stop_after_reads(&self, reads: usize, signal: StopSignal) {
        self.lock().stop_after = Some((reads, signal));
    }

    pub fn scores(&self) -> Vec<ScoreRecord> {
        self.lock().scores.values().cloned().collect()
    }

    pub fn score_count(&self) -> usize {
        self.lock().scores.len()
    }

    /// Number of individual score rows written, counting overwrites.
    pub fn score_writes(&self) -> usize {
        self.lock().score_writes
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.lock().runs.clone()
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn list_units(
        &self,
        scope: &Scope,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnitProjection>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .units
            .values()
            .filter(|unit| after.map_or(true, |cursor| unit.code.as_str() > cursor))
            .filter(|unit| scope.matches(&unit.code))
            .take(limit)
            .map(GeographicUnit::projection)
            .collect())
    }

    async fn get_readings(&self, unit_code: &str) -> Result<Vec<MetricReading>, StoreError> {
        let mut inner = self.lock();
        if let Some(remaining) = inner.injected_failures.get_mut(unit_code) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Transient(format!(
                    "injected failure reading {unit_code}"
                )));
            }
        }
        inner.reads += 1;
        if let Some((limit, signal)) = &inner.stop_after {
            if inner.reads >= *limit {
                signal.stop();
            }
        }
        Ok(MetricKey::ALL
            .into_iter()
            .filter_map(|metric| inner.readings.get(&(unit_code.to_string(), metric)).cloned())
            .collect())
    }

    async fn k_nearest(
        &self,
        unit: &UnitProjection,
        metric: MetricKey,
        k: usize,
        max_radius_km: f64,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let inner = self.lock();
        let mut neighbors: Vec<Neighbor> = inner
            .readings
            .values()
            .filter(|reading| reading.metric == metric && reading.unit_code != unit.code)
            .filter_map(|reading| {
                let other = inner.units.get(&reading.unit_code)?;
                let distance_km = haversine_km(unit.centroid, other.centroid);
                (distance_km <= max_radius_km).then(|| Neighbor {
                    unit_code: reading.unit_code.clone(),
                    raw_value: reading.raw_value,
                    distance_km,
                })
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.unit_code.cmp(&b.unit_code))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn metric_values(&self, metric: MetricKey) -> Result<Vec<f64>, StoreError> {
        Ok(self
            .lock()
            .readings
            .values()
            .filter(|reading| reading.metric == metric)
            .map(|reading| reading.raw_value)
            .collect())
    }

    async fn upsert_readings(&self, readings: &[MetricReading]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        for reading in readings {
            inner
                .readings
                .insert((reading.unit_code.clone(), reading.metric), reading.clone());
        }
        Ok(readings.len())
    }

    async fn load_baselines(&self) -> Result<Vec<MetricBaseline>, StoreError> {
        Ok(self.lock().baselines.values().cloned().collect())
    }

    async fn save_baselines(&self, baselines: &[MetricBaseline]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for baseline in baselines {
            inner.baselines.insert(baseline.metric, baseline.clone());
        }
        Ok(())
    }

    async fn upsert_scores(&self, records: &[ScoreRecord]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for record in records {
            inner.scores.insert(record.unit_code.clone(), record.clone());
            inner.score_writes += 1;
        }
        Ok(())
    }

    async fn get_score(&self, unit_code: &str) -> Result<Option<ScoreRecord>, StoreError> {
        Ok(self.lock().scores.get(unit_code).cloned())
    }

    async fn load_checkpoint(&self, scope_key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().checkpoints.get(scope_key).cloned())
    }

    async fn save_checkpoint(
        &self,
        scope_key: &str,
        last_unit_code: &str,
    ) -> Result<(), StoreError> {
        self.lock()
            .checkpoints
            .insert(scope_key.to_string(), last_unit_code.to_string());
        Ok(())
    }

    async fn clear_checkpoint(&self, scope_key: &str) -> Result<(), StoreError> {
        self.lock().checkpoints.remove(scope_key);
        Ok(())
    }

    async fn record_run(&self, run: &RunSummary) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => inner.runs.push(run.clone()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coordinate, UnitKind};
    use chrono::Utc;

    fn unit(code: &str, lat: f64, lon: f64) -> GeographicUnit {
        GeographicUnit {
            code: code.to_string(),
            name: code.to_string(),
            kind: UnitKind::Municipality,
            parent_code: None,
            centroid: Coordinate::new(lat, lon),
            polygon: None,
            population: Some(1000),
        }
    }

    fn reading(code: &str, metric: MetricKey, raw_value: f64) -> MetricReading {
        MetricReading {
            unit_code: code.to_string(),
            metric,
            raw_value,
            source_id: "test".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pages_units_in_code_order() {
        let store = MemoryStore::with_data(
            vec![unit("003", 45.0, 9.0), unit("001", 45.0, 9.0), unit("002", 45.0, 9.0)],
            vec![],
        );
        let first = store.list_units(&Scope::All, None, 2).await.unwrap();
        let codes: Vec<_> = first.iter().map(|u| u.code.as_str()).collect();
        assert_eq!(codes, ["001", "002"]);

        let rest = store.list_units(&Scope::All, Some("002"), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].code, "003");
    }

    #[tokio::test]
    async fn nearest_neighbors_respect_radius_and_order() {
        let target = unit("100", 45.0, 9.0);
        let store = MemoryStore::with_data(
            vec![
                target.clone(),
                unit("101", 45.05, 9.0),
                unit("102", 45.3, 9.0),
                unit("103", 47.0, 9.0),
            ],
            vec![
                reading("100", MetricKey::Seismic, 0.2),
                reading("101", MetricKey::Seismic, 0.1),
                reading("102", MetricKey::Seismic, 0.3),
                reading("103", MetricKey::Seismic, 0.4),
            ],
        );

        let neighbors = store
            .k_nearest(&target.projection(), MetricKey::Seismic, 3, 50.0)
            .await
            .unwrap();
        let codes: Vec<_> = neighbors.iter().map(|n| n.unit_code.as_str()).collect();
        assert_eq!(codes, ["101", "102"]);
        assert!(neighbors[0].distance_km < neighbors[1].distance_km);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::with_data(vec![unit("001", 45.0, 9.0)], vec![]);
        store.inject_transient_failures("001", 1);
        assert!(store.get_readings("001").await.is_err());
        assert!(store.get_readings("001").await.is_ok());
    }

    #[tokio::test]
    async fn read_hook_trips_the_stop_signal() {
        let store = MemoryStore::with_data(vec![unit("001", 45.0, 9.0)], vec![]);
        let stop = StopSignal::new();
        store.stop_after_reads(2, stop.clone());

        store.get_readings("001").await.unwrap();
        assert!(!stop.is_stopped());
        store.get_readings("001").await.unwrap();
        assert!(stop.is_stopped());
    }
}
