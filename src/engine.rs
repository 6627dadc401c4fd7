//! Scores a single unit against a baseline snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::aggregate::Aggregator;
use crate::baseline::BaselineSnapshot;
use crate::confidence::{confidence, coverage_fraction, is_reading_stale};
use crate::config::ScoringProfile;
use crate::error::ScoringError;
use crate::fallback::SpatialResolver;
use crate::metrics::MetricKey;
use crate::models::{
    ComponentScores, MetricBaseline, MetricReading, Provenance, ScoreRecord, UnitKind, UnitProjection,
};
use crate::normalize::Normalizer;
use crate::store::MetricStore;

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    profile: ScoringProfile,
    normalizer: Normalizer,
    resolver: SpatialResolver,
    aggregator: Aggregator,
}

impl ScoringEngine {
    pub fn new(profile: ScoringProfile) -> Self {
        Self {
            normalizer: Normalizer::new(profile.normalizer.clone()),
            resolver: SpatialResolver::new(profile.fallback.clone()),
            aggregator: Aggregator::new(&profile),
            profile,
        }
    }

    pub fn profile(&self) -> &ScoringProfile {
        &self.profile
    }

    /// Vet stored baselines into the snapshot a run scores against.
    pub fn snapshot(
        &self,
        baselines: Vec<MetricBaseline>,
        as_of: DateTime<Utc>,
    ) -> (BaselineSnapshot, Vec<ScoringError>) {
        BaselineSnapshot::build(baselines, &self.normalizer, &self.profile.confidence, as_of)
    }

    /// Produce the unit's full score record.
    ///
    /// `as_of` is stamped as `computed_at`, so the same inputs always yield
    /// the same record.
    pub async fn score_unit(
        &self,
        store: &dyn MetricStore,
        unit: &UnitProjection,
        snapshot: &BaselineSnapshot,
        as_of: DateTime<Utc>,
    ) -> Result<ScoreRecord, ScoringError> {
        let readings: BTreeMap<MetricKey, _> = store
            .get_readings(&unit.code)
            .await?
            .into_iter()
            .map(|reading| (reading.metric, reading))
            .collect();

        let mut components = ComponentScores::default();
        let mut provenance = Provenance::default();

        for metric in MetricKey::ALL {
            let Some(baseline) = snapshot.get(metric) else {
                continue;
            };
            let baseline_stale = snapshot.is_stale(metric);

            let reading = match readings.get(&metric) {
                Some(reading) => Some(reading.clone()),
                None => self.parent_reading(store, unit, metric).await?,
            };
            if let Some(reading) = &reading {
                match self.normalizer.normalize(reading.raw_value, baseline, metric.polarity()) {
                    Ok(score) => {
                        components.set(metric, Some(score));
                        if baseline_stale || is_reading_stale(reading, &self.profile.confidence, as_of) {
                            provenance.stale.push(metric);
                        }
                        continue;
                    }
                    Err(err) => {
                        warn!(unit = %unit.code, error = %err, "discarding reading, trying neighbours");
                    }
                }
            }

            let inferred = self
                .resolver
                .resolve_missing(store, unit, metric, baseline, &self.normalizer)
                .await?;
            if let Some(inferred) = inferred {
                components.set(metric, Some(inferred.sub_score));
                provenance.inferred.push(metric);
                if baseline_stale {
                    provenance.stale.push(metric);
                }
            }
        }

        let overall_score = self.aggregator.aggregate(&unit.code, &components)?;
        let insights = self.aggregator.insights(&components, overall_score);
        let confidence = confidence(&components, &provenance, &self.profile.confidence);

        debug!(
            unit = %unit.code,
            overall_score,
            confidence,
            present = components.present_count(),
            inferred = provenance.inferred.len(),
            stale = provenance.stale.len(),
            "unit scored"
        );

        Ok(ScoreRecord {
            unit_code: unit.code.clone(),
            computed_at: as_of,
            overall_score,
            coverage_fraction: coverage_fraction(&components),
            component_scores: components,
            confidence,
            insights,
            provenance,
            profile_version: self.profile.version.clone(),
            weights: self.profile.weights.clone(),
        })
    }

    /// A zone reads municipality-level metrics from its parent municipality.
    async fn parent_reading(
        &self,
        store: &dyn MetricStore,
        unit: &UnitProjection,
        metric: MetricKey,
    ) -> Result<Option<MetricReading>, ScoringError> {
        let Some(parent_code) = unit.parent_code.as_deref() else {
            return Ok(None);
        };
        if unit.kind != UnitKind::SubmarketZone || !metric.is_municipality_level() {
            return Ok(None);
        }
        Ok(store.get_reading(parent_code, metric).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::compute_baseline;
    use crate::models::{Coordinate, GeographicUnit};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn unit(code: &str, latitude: f64) -> GeographicUnit {
        GeographicUnit {
            code: code.into(),
            name: code.into(),
            kind: UnitKind::Municipality,
            parent_code: None,
            centroid: Coordinate::new(latitude, 10.0),
            polygon: None,
            population: None,
        }
    }

    fn reading(code: &str, metric: MetricKey, raw_value: f64, observed_at: DateTime<Utc>) -> MetricReading {
        MetricReading {
            unit_code: code.into(),
            metric,
            raw_value,
            source_id: "test".into(),
            observed_at,
        }
    }

    fn zone(code: &str, parent: &str, latitude: f64) -> GeographicUnit {
        GeographicUnit {
            kind: UnitKind::SubmarketZone,
            parent_code: Some(parent.into()),
            ..unit(code, latitude)
        }
    }

    /// Baselines for price trend, crime and seismic over a 40-unit synthetic corpus.
    fn snapshot(engine: &ScoringEngine, as_of: DateTime<Utc>) -> BaselineSnapshot {
        let values: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let baselines = [MetricKey::PriceTrend, MetricKey::Crime, MetricKey::Seismic]
            .into_iter()
            .filter_map(|metric| compute_baseline(metric, &values, as_of))
            .collect();
        engine.snapshot(baselines, as_of).0
    }

    #[tokio::test]
    async fn scores_real_readings_and_infers_gaps() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);

        let target = unit("A", 45.0);
        let store = MemoryStore::with_data(
            vec![target.clone(), unit("B", 45.05)],
            vec![
                reading("A", MetricKey::PriceTrend, 30.0, as_of),
                reading("B", MetricKey::Crime, 10.0, as_of),
            ],
        );

        let record = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap();

        assert!(record.component_scores.price_trend.unwrap() > 5.0);
        // low crime at the neighbour is good news for A
        assert!(record.component_scores.crime.unwrap() > 5.0);
        assert_eq!(record.provenance.inferred, [MetricKey::Crime]);
        assert!(record.provenance.stale.is_empty());
        assert!((record.coverage_fraction - 2.0 / 13.0).abs() < 1e-12);
        assert!(record.confidence < record.coverage_fraction);
        assert_eq!(record.computed_at, as_of);
        assert_eq!(record.profile_version, "2024.2");
        assert_eq!(record.weights, ScoringProfile::default().weights);
    }

    #[tokio::test]
    async fn old_readings_are_flagged_stale() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);
        let target = unit("A", 45.0);
        let store = MemoryStore::with_data(
            vec![target.clone()],
            vec![reading("A", MetricKey::PriceTrend, 12.0, as_of - Duration::days(365))],
        );

        let record = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap();
        assert_eq!(record.provenance.stale, [MetricKey::PriceTrend]);
        assert!(record.confidence < 1.0 / 13.0);
    }

    #[tokio::test]
    async fn rescoring_unchanged_inputs_is_identical() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);
        let target = unit("A", 45.0);
        let store = MemoryStore::with_data(
            vec![target.clone()],
            vec![
                reading("A", MetricKey::PriceTrend, 21.0, as_of),
                reading("A", MetricKey::Crime, 3.0, as_of),
            ],
        );

        let first = engine.score_unit(&store, &target.projection(), &snapshot, as_of).await.unwrap();
        let second = engine.score_unit(&store, &target.projection(), &snapshot, as_of).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unit_without_any_data_is_not_scored() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);
        let target = unit("LONELY", 45.0);
        let store = MemoryStore::with_data(vec![target.clone()], vec![]);

        let err = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::NoScorableComponents { .. }));
    }

    #[tokio::test]
    async fn invalid_reading_falls_back_to_neighbours() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);
        let target = unit("A", 45.0);
        let store = MemoryStore::with_data(
            vec![target.clone(), unit("B", 45.02)],
            vec![
                reading("A", MetricKey::PriceTrend, f64::NAN, as_of),
                reading("B", MetricKey::PriceTrend, 25.0, as_of),
            ],
        );

        let record = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap();
        assert_eq!(record.provenance.inferred, [MetricKey::PriceTrend]);
    }

    #[tokio::test]
    async fn zones_take_municipality_metrics_from_their_parent() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);

        let parent = unit("P", 45.0);
        let target = zone("P-Z1", "P", 45.009);
        let store = MemoryStore::with_data(
            vec![parent.clone(), target.clone(), unit("Q", 45.018)],
            vec![
                reading("P", MetricKey::Seismic, 5.0, as_of),
                reading("P", MetricKey::PriceTrend, 30.0, as_of),
                reading("Q", MetricKey::Seismic, 35.0, as_of),
            ],
        );

        let parent_record = engine
            .score_unit(&store, &parent.projection(), &snapshot, as_of)
            .await
            .unwrap();
        let record = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap();

        assert_eq!(
            record.component_scores.seismic,
            parent_record.component_scores.seismic
        );
        // market metrics are zone-specific and still come from neighbours
        assert_eq!(record.provenance.inferred, [MetricKey::PriceTrend]);
        assert!(record.provenance.stale.is_empty());
    }

    #[tokio::test]
    async fn municipalities_never_read_another_units_metrics() {
        let as_of = Utc::now();
        let engine = ScoringEngine::new(ScoringProfile::default());
        let snapshot = snapshot(&engine, as_of);

        let mut target = unit("A", 45.0);
        target.parent_code = Some("P".into());
        let store = MemoryStore::with_data(
            vec![unit("P", 47.0), target.clone()],
            vec![reading("P", MetricKey::Seismic, 5.0, as_of)],
        );

        let err = engine
            .score_unit(&store, &target.projection(), &snapshot, as_of)
            .await
            .unwrap_err();
        assert!(matches!(err, ScoringError::NoScorableComponents { .. }));
    }
}
