//! Inverse-distance weighting for gaps in institutional data.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::FallbackSettings;
use crate::error::ScoringError;
use crate::geo::haversine_km;
use crate::metrics::MetricKey;
use crate::models::{Coordinate, GeographicUnit, MetricBaseline, MetricReading, UnitProjection};
use crate::normalize::Normalizer;
use crate::store::MetricStore;

/// IDW mean of `(value, distance_km)` samples with weight `1 / d^power`.
/// A sample sitting on the target (distance 0) is returned as is.
pub fn inverse_distance_weighted(samples: &[(f64, f64)], power: f64) -> Option<f64> {
    if let Some((value, _)) = samples.iter().find(|(_, distance)| *distance <= f64::EPSILON) {
        return Some(*value);
    }

    let (weighted_sum, total_weight) = samples
        .iter()
        .filter(|(value, distance)| value.is_finite() && distance.is_finite())
        .fold((0.0, 0.0), |(sum, total), (value, distance)| {
            let weight = 1.0 / distance.powf(power);
            (sum + value * weight, total + weight)
        });

    (total_weight > 0.0).then(|| weighted_sum / total_weight)
}

/// A spatial estimate for a metric the unit has no reading for.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredScore {
    pub sub_score: f64,
    pub neighbors_used: usize,
    pub nearest_km: f64,
}

/// Estimates missing sub-scores from the nearest units that have data.
#[derive(Debug, Clone)]
pub struct SpatialResolver {
    settings: FallbackSettings,
}

impl SpatialResolver {
    pub fn new(settings: FallbackSettings) -> Self {
        Self { settings }
    }

    /// `Ok(None)` when no neighbour with data lies inside the search radius.
    pub async fn resolve_missing(
        &self,
        store: &dyn MetricStore,
        unit: &UnitProjection,
        metric: MetricKey,
        baseline: &MetricBaseline,
        normalizer: &Normalizer,
    ) -> Result<Option<InferredScore>, ScoringError> {
        let neighbors = store
            .k_nearest(unit, metric, self.settings.neighbors, self.settings.max_radius_km)
            .await?;

        let samples: Vec<(f64, f64)> = neighbors
            .iter()
            .filter(|neighbor| neighbor.distance_km <= self.settings.max_radius_km)
            .filter_map(|neighbor| {
                normalizer
                    .normalize(neighbor.raw_value, baseline, metric.polarity())
                    .ok()
                    .map(|score| (score, neighbor.distance_km))
            })
            .collect();

        let Some(sub_score) = inverse_distance_weighted(&samples, self.settings.power) else {
            debug!(unit = %unit.code, metric = %metric, "no neighbours within radius");
            return Ok(None);
        };

        let nearest_km = samples
            .iter()
            .map(|(_, distance)| *distance)
            .fold(f64::INFINITY, f64::min);
        debug!(
            unit = %unit.code,
            metric = %metric,
            sub_score,
            neighbors = samples.len(),
            nearest_km,
            "metric inferred from neighbours"
        );

        Ok(Some(InferredScore {
            sub_score,
            neighbors_used: samples.len(),
            nearest_km,
        }))
    }
}

/// A sparse measurement station, e.g. a PGA reference site or an air
/// quality monitor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReferencePoint {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub value: f64,
}

impl ReferencePoint {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Projects point-sampled physical quantities onto unit centroids.
#[derive(Debug, Clone, PartialEq)]
pub struct StationInterpolator {
    pub neighbors: usize,
    pub power: f64,
    /// Added to every distance so a station on the centroid stays finite
    pub distance_offset_km: f64,
}

impl Default for StationInterpolator {
    fn default() -> Self {
        Self {
            neighbors: 4,
            power: 2.0,
            distance_offset_km: 1.0,
        }
    }
}

impl StationInterpolator {
    pub fn interpolate_at(&self, target: Coordinate, stations: &[ReferencePoint]) -> Option<f64> {
        let mut distances: Vec<(f64, f64)> = stations
            .iter()
            .filter(|station| station.value.is_finite())
            .map(|station| {
                let distance = haversine_km(target, station.coordinate());
                (station.value, distance + self.distance_offset_km)
            })
            .collect();

        distances.sort_by(|a, b| a.1.total_cmp(&b.1));
        distances.truncate(self.neighbors.max(1));
        inverse_distance_weighted(&distances, self.power)
    }

    /// One reading per unit centroid, ready for `MetricStore::upsert_readings`.
    pub fn readings_for(
        &self,
        units: &[GeographicUnit],
        stations: &[ReferencePoint],
        metric: MetricKey,
        source_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Vec<MetricReading> {
        units
            .iter()
            .filter_map(|unit| {
                let raw_value = self.interpolate_at(unit.centroid, stations)?;
                Some(MetricReading {
                    unit_code: unit.code.clone(),
                    metric,
                    raw_value,
                    source_id: source_id.to_string(),
                    observed_at,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizerSettings;
    use crate::models::UnitKind;
    use crate::store::MemoryStore;

    #[test]
    fn closer_neighbour_dominates() {
        let estimate = inverse_distance_weighted(&[(3.0, 5.0), (9.0, 40.0)], 1.0).unwrap();
        assert!(estimate > 3.0 && estimate < 9.0);
        assert!(estimate < 6.0, "expected a value nearer 3.0, got {estimate}");
        assert!((estimate - 11.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn zero_distance_returns_exact_value() {
        assert_eq!(inverse_distance_weighted(&[(4.2, 0.0), (9.0, 1.0)], 1.0), Some(4.2));
    }

    #[test]
    fn no_samples_means_no_estimate() {
        assert_eq!(inverse_distance_weighted(&[], 1.0), None);
    }

    #[test]
    fn station_interpolation_uses_nearest_references() {
        let stations = vec![
            ReferencePoint {
                label: "L'Aquila".into(),
                latitude: 42.3498,
                longitude: 13.3995,
                value: 0.261,
            },
            ReferencePoint {
                label: "Milano".into(),
                latitude: 45.4642,
                longitude: 9.19,
                value: 0.05,
            },
        ];
        let interpolator = StationInterpolator {
            neighbors: 2,
            ..StationInterpolator::default()
        };

        let near_aquila = interpolator
            .interpolate_at(Coordinate::new(42.35, 13.40), &stations)
            .unwrap();
        assert!(near_aquila > 0.25, "got {near_aquila}");

        let on_station = interpolator
            .interpolate_at(Coordinate::new(45.4642, 9.19), &stations)
            .unwrap();
        assert!((on_station - 0.05).abs() < 0.001);

        let readings = interpolator.readings_for(
            &[unit("066049", 42.35)],
            &stations,
            MetricKey::Seismic,
            "ingv-mps04",
            Utc::now(),
        );
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, MetricKey::Seismic);
        assert_eq!(readings[0].source_id, "ingv-mps04");
        assert!(interpolator.readings_for(&[unit("X", 42.0)], &[], MetricKey::Seismic, "s", Utc::now()).is_empty());
    }

    fn unit(code: &str, latitude: f64) -> GeographicUnit {
        GeographicUnit {
            code: code.into(),
            name: code.into(),
            kind: UnitKind::Municipality,
            parent_code: None,
            centroid: Coordinate::new(latitude, 12.0),
            polygon: None,
            population: None,
        }
    }

    fn reading(code: &str, raw_value: f64) -> MetricReading {
        MetricReading {
            unit_code: code.into(),
            metric: MetricKey::PriceTrend,
            raw_value,
            source_id: "test".into(),
            observed_at: Utc::now(),
        }
    }

    fn baseline() -> MetricBaseline {
        MetricBaseline {
            metric: MetricKey::PriceTrend,
            mean: 0.0,
            stddev: 1.0,
            sample_size: 100,
            percentiles: None,
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn resolver_normalizes_neighbours_before_weighting() {
        let target = unit("X", 42.0);
        // 0.045 degrees of latitude is ~5 km, 0.36 is ~40 km
        let store = MemoryStore::with_data(
            vec![target.clone(), unit("Y", 42.045), unit("Z", 42.36)],
            vec![reading("Y", -0.5), reading("Z", 1.5)],
        );
        let normalizer = Normalizer::new(NormalizerSettings::default());
        let resolver = SpatialResolver::new(FallbackSettings::default());

        let inferred = resolver
            .resolve_missing(&store, &target.projection(), MetricKey::PriceTrend, &baseline(), &normalizer)
            .await
            .unwrap()
            .unwrap();

        let y = normalizer.normalize(-0.5, &baseline(), crate::metrics::Polarity::HigherBetter).unwrap();
        let z = normalizer.normalize(1.5, &baseline(), crate::metrics::Polarity::HigherBetter).unwrap();
        assert_eq!(inferred.neighbors_used, 2);
        assert!(inferred.sub_score > y && inferred.sub_score < z);
        assert!(inferred.sub_score < (y + z) / 2.0);
        assert!((inferred.nearest_km - 5.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn resolver_gives_up_outside_radius() {
        let target = unit("X", 42.0);
        let store = MemoryStore::with_data(
            vec![target.clone(), unit("FAR", 44.0)],
            vec![reading("FAR", 1.0)],
        );
        let resolver = SpatialResolver::new(FallbackSettings::default());
        let normalizer = Normalizer::new(NormalizerSettings::default());

        let inferred = resolver
            .resolve_missing(&store, &target.projection(), MetricKey::PriceTrend, &baseline(), &normalizer)
            .await
            .unwrap();
        assert!(inferred.is_none());
    }
}
