use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The closed set of metrics that feed an investment score.
///
/// Declaration order is the canonical order: it drives iteration, tie-breaks
/// in insight ranking and column order in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    PriceTrend,
    Affordability,
    RentalYield,
    Demographics,
    Crime,
    Connectivity,
    DigitalConnectivity,
    Services,
    AirQuality,
    Seismic,
    Flood,
    Landslide,
    Climate,
}

impl MetricKey {
    pub const ALL: [MetricKey; 13] = [
        MetricKey::PriceTrend,
        MetricKey::Affordability,
        MetricKey::RentalYield,
        MetricKey::Demographics,
        MetricKey::Crime,
        MetricKey::Connectivity,
        MetricKey::DigitalConnectivity,
        MetricKey::Services,
        MetricKey::AirQuality,
        MetricKey::Seismic,
        MetricKey::Flood,
        MetricKey::Landslide,
        MetricKey::Climate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::PriceTrend => "price_trend",
            MetricKey::Affordability => "affordability",
            MetricKey::RentalYield => "rental_yield",
            MetricKey::Demographics => "demographics",
            MetricKey::Crime => "crime",
            MetricKey::Connectivity => "connectivity",
            MetricKey::DigitalConnectivity => "digital_connectivity",
            MetricKey::Services => "services",
            MetricKey::AirQuality => "air_quality",
            MetricKey::Seismic => "seismic",
            MetricKey::Flood => "flood",
            MetricKey::Landslide => "landslide",
            MetricKey::Climate => "climate",
        }
    }

    /// Direction in which the raw quantity improves the score.
    pub fn polarity(self) -> Polarity {
        match self {
            MetricKey::PriceTrend
            | MetricKey::Affordability
            | MetricKey::RentalYield
            | MetricKey::Demographics
            | MetricKey::DigitalConnectivity
            | MetricKey::Services => Polarity::HigherBetter,
            MetricKey::Crime
            | MetricKey::Connectivity
            | MetricKey::AirQuality
            | MetricKey::Seismic
            | MetricKey::Flood
            | MetricKey::Landslide
            | MetricKey::Climate => Polarity::LowerBetter,
        }
    }

    /// Measured for a whole municipality; its market zones share the value.
    pub fn is_municipality_level(self) -> bool {
        !matches!(
            self,
            MetricKey::PriceTrend | MetricKey::Affordability | MetricKey::RentalYield | MetricKey::Crime
        )
    }

    pub fn refresh_tier(self) -> RefreshTier {
        match self {
            MetricKey::PriceTrend | MetricKey::Affordability | MetricKey::RentalYield => {
                RefreshTier::High
            }
            MetricKey::Crime | MetricKey::AirQuality | MetricKey::Climate => RefreshTier::Seasonal,
            MetricKey::Demographics
            | MetricKey::Connectivity
            | MetricKey::DigitalConnectivity
            | MetricKey::Services
            | MetricKey::Seismic
            | MetricKey::Flood
            | MetricKey::Landslide => RefreshTier::Strategic,
        }
    }

    /// Raw quantity the external collaborators deliver for this metric.
    pub fn raw_unit(self) -> &'static str {
        match self {
            MetricKey::PriceTrend => "YoY price growth %",
            MetricKey::Affordability => "average income EUR",
            MetricKey::RentalYield => "gross rental yield %",
            MetricKey::Demographics => "resident population",
            MetricKey::Crime => "crime index",
            MetricKey::Connectivity => "km to nearest rail station",
            MetricKey::DigitalConnectivity => "FTTH coverage %",
            MetricKey::Services => "services per 10k inhabitants",
            MetricKey::AirQuality => "PM2.5 ug/m3",
            MetricKey::Seismic => "peak ground acceleration g",
            MetricKey::Flood => "flood hazard index",
            MetricKey::Landslide => "landslide hazard index",
            MetricKey::Climate => "projected extra heatwave days",
        }
    }

    pub fn strength_note(self) -> &'static str {
        match self {
            MetricKey::PriceTrend => "Strong price growth trend",
            MetricKey::Affordability => "Incomes well placed relative to the national average",
            MetricKey::RentalYield => "High rental yield potential",
            MetricKey::Demographics => "Large, liquid resident market",
            MetricKey::Crime => "Lower than average crime statistics",
            MetricKey::Connectivity => "Close to the rail network",
            MetricKey::DigitalConnectivity => "Wide fibre broadband coverage",
            MetricKey::Services => "Dense local services",
            MetricKey::AirQuality => "Clean air",
            MetricKey::Seismic => "Low seismic risk zone",
            MetricKey::Flood => "Low flood hazard",
            MetricKey::Landslide => "Low landslide hazard",
            MetricKey::Climate => "Limited long-term heat stress",
        }
    }

    pub fn risk_note(self) -> &'static str {
        match self {
            MetricKey::PriceTrend => "Weak or falling prices",
            MetricKey::Affordability => "Very high property entry prices for local incomes",
            MetricKey::RentalYield => "Compressed rental yields",
            MetricKey::Demographics => "Small or shrinking resident market",
            MetricKey::Crime => "Higher than average crime statistics",
            MetricKey::Connectivity => "Far from the rail network",
            MetricKey::DigitalConnectivity => "Poor fibre broadband coverage",
            MetricKey::Services => "Sparse local services",
            MetricKey::AirQuality => "Poor air quality",
            MetricKey::Seismic => "Elevated seismic hazard",
            MetricKey::Flood => "Elevated flood hazard",
            MetricKey::Landslide => "Elevated landslide hazard",
            MetricKey::Climate => "Significant long-term climate risk",
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric key '{0}'")]
pub struct UnknownMetric(pub String);

impl FromStr for MetricKey {
    type Err = UnknownMetric;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let needle = value.trim();
        MetricKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownMetric(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    HigherBetter,
    LowerBetter,
}

/// How often a metric's source is expected to publish fresh readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTier {
    High,
    Seasonal,
    Strategic,
}

/// Static description of one metric combined with its profile weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricDescriptor {
    pub key: MetricKey,
    pub polarity: Polarity,
    pub weight: f64,
    pub refresh_tier: RefreshTier,
}

impl MetricDescriptor {
    pub fn new(key: MetricKey, weight: f64) -> Self {
        Self {
            key,
            polarity: key.polarity(),
            weight,
            refresh_tier: key.refresh_tier(),
        }
    }
}
