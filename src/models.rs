use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricKey;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Municipality,
    SubmarketZone,
}

impl UnitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Municipality => "municipality",
            UnitKind::SubmarketZone => "submarket_zone",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "municipality" => Ok(UnitKind::Municipality),
            "submarket_zone" | "zone" => Ok(UnitKind::SubmarketZone),
            other => Err(format!("unknown unit kind '{other}'")),
        }
    }
}

/// Reference data for one scored area. Owned by the ingestion side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeographicUnit {
    pub code: String,
    pub name: String,
    pub kind: UnitKind,
    pub parent_code: Option<String>,
    pub centroid: Coordinate,
    #[serde(default)]
    pub polygon: Option<serde_json::Value>,
    pub population: Option<i64>,
}

impl GeographicUnit {
    pub fn projection(&self) -> UnitProjection {
        UnitProjection {
            code: self.code.clone(),
            kind: self.kind,
            parent_code: self.parent_code.clone(),
            centroid: self.centroid,
        }
    }
}

/// The slice of a unit the batch driver pages through.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitProjection {
    pub code: String,
    pub kind: UnitKind,
    pub parent_code: Option<String>,
    pub centroid: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    pub unit_code: String,
    pub metric: MetricKey,
    pub raw_value: f64,
    pub source_id: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// National distribution of one metric's raw values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBaseline {
    pub metric: MetricKey,
    pub mean: f64,
    pub stddev: f64,
    pub sample_size: i64,
    pub percentiles: Option<Percentiles>,
    pub computed_at: DateTime<Utc>,
}

/// One sub-score slot per metric. Adding a metric key fails to compile until
/// `get` and `set` cover it, and serde always emits every field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub price_trend: Option<f64>,
    pub affordability: Option<f64>,
    pub rental_yield: Option<f64>,
    pub demographics: Option<f64>,
    pub crime: Option<f64>,
    pub connectivity: Option<f64>,
    pub digital_connectivity: Option<f64>,
    pub services: Option<f64>,
    pub air_quality: Option<f64>,
    pub seismic: Option<f64>,
    pub flood: Option<f64>,
    pub landslide: Option<f64>,
    pub climate: Option<f64>,
}

impl ComponentScores {
    pub fn get(&self, key: MetricKey) -> Option<f64> {
        match key {
            MetricKey::PriceTrend => self.price_trend,
            MetricKey::Affordability => self.affordability,
            MetricKey::RentalYield => self.rental_yield,
            MetricKey::Demographics => self.demographics,
            MetricKey::Crime => self.crime,
            MetricKey::Connectivity => self.connectivity,
            MetricKey::DigitalConnectivity => self.digital_connectivity,
            MetricKey::Services => self.services,
            MetricKey::AirQuality => self.air_quality,
            MetricKey::Seismic => self.seismic,
            MetricKey::Flood => self.flood,
            MetricKey::Landslide => self.landslide,
            MetricKey::Climate => self.climate,
        }
    }

    pub fn set(&mut self, key: MetricKey, value: Option<f64>) {
        let slot = match key {
            MetricKey::PriceTrend => &mut self.price_trend,
            MetricKey::Affordability => &mut self.affordability,
            MetricKey::RentalYield => &mut self.rental_yield,
            MetricKey::Demographics => &mut self.demographics,
            MetricKey::Crime => &mut self.crime,
            MetricKey::Connectivity => &mut self.connectivity,
            MetricKey::DigitalConnectivity => &mut self.digital_connectivity,
            MetricKey::Services => &mut self.services,
            MetricKey::AirQuality => &mut self.air_quality,
            MetricKey::Seismic => &mut self.seismic,
            MetricKey::Flood => &mut self.flood,
            MetricKey::Landslide => &mut self.landslide,
            MetricKey::Climate => &mut self.climate,
        };
        *slot = value;
    }

    /// Present components in canonical metric order.
    pub fn present(&self) -> impl Iterator<Item = (MetricKey, f64)> + '_ {
        MetricKey::ALL
            .into_iter()
            .filter_map(|key| self.get(key).map(|score| (key, score)))
    }

    pub fn present_count(&self) -> usize {
        self.present().count()
    }
}

impl FromIterator<(MetricKey, f64)> for ComponentScores {
    fn from_iter<I: IntoIterator<Item = (MetricKey, f64)>>(iter: I) -> Self {
        let mut scores = ComponentScores::default();
        for (key, value) in iter {
            scores.set(key, Some(value));
        }
        scores
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub strengths: Vec<MetricKey>,
    pub risks: Vec<MetricKey>,
}

/// Which present components did not come from a fresh, real reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub inferred: Vec<MetricKey>,
    pub stale: Vec<MetricKey>,
}

/// The current score of one unit. Persisted as a full-row upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub unit_code: String,
    pub computed_at: DateTime<Utc>,
    pub overall_score: f64,
    pub component_scores: ComponentScores,
    pub confidence: f64,
    pub coverage_fraction: f64,
    pub insights: Insights,
    pub provenance: Provenance,
    pub profile_version: String,
    /// Metric weights the overall score was aggregated with
    pub weights: BTreeMap<MetricKey, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_scores_cover_every_key() {
        let mut scores = ComponentScores::default();
        for (index, key) in MetricKey::ALL.into_iter().enumerate() {
            scores.set(key, Some(index as f64));
        }
        for (index, key) in MetricKey::ALL.into_iter().enumerate() {
            assert_eq!(scores.get(key), Some(index as f64));
        }
        assert_eq!(scores.present_count(), 13);
    }

    #[test]
    fn missing_components_serialize_as_null() {
        let scores: ComponentScores = [(MetricKey::Seismic, 7.5)].into_iter().collect();
        let value = serde_json::to_value(scores).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), MetricKey::ALL.len());
        for key in MetricKey::ALL {
            assert!(object.contains_key(key.as_str()), "missing {key}");
        }
        assert_eq!(object["seismic"], serde_json::json!(7.5));
        assert!(object["crime"].is_null());
    }

    #[test]
    fn unit_kind_parses_aliases() {
        assert_eq!("zone".parse::<UnitKind>().unwrap(), UnitKind::SubmarketZone);
        assert_eq!("Municipality".parse::<UnitKind>().unwrap(), UnitKind::Municipality);
        assert!("province".parse::<UnitKind>().is_err());
    }
}
