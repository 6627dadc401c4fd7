use std::collections::BTreeMap;

use serde::Serialize;

use crate::insights::{notes, recommendation, ScoreCategory};
use crate::metrics::MetricKey;
use crate::models::{ComponentScores, ScoreRecord};

/// Flat JSON shape served to readers of a unit's score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScorePayload {
    pub unit_code: String,
    pub overall_score: f64,
    pub category: ScoreCategory,
    pub recommendation: &'static str,
    pub components: ComponentScores,
    pub confidence: f64,
    pub coverage_fraction: f64,
    pub strengths: Vec<MetricKey>,
    pub risks: Vec<MetricKey>,
    pub notes: Vec<String>,
    pub inferred: Vec<MetricKey>,
    pub stale: Vec<MetricKey>,
    pub profile_version: String,
    pub weights: BTreeMap<MetricKey, f64>,
    pub computed_at: String,
}

impl From<&ScoreRecord> for ScorePayload {
    fn from(record: &ScoreRecord) -> Self {
        Self {
            unit_code: record.unit_code.clone(),
            overall_score: round2(record.overall_score),
            category: ScoreCategory::from_score(record.overall_score),
            recommendation: recommendation(record.overall_score),
            components: round_components(&record.component_scores),
            confidence: round2(record.confidence),
            coverage_fraction: round2(record.coverage_fraction),
            strengths: record.insights.strengths.clone(),
            risks: record.insights.risks.clone(),
            notes: notes(&record.insights),
            inferred: record.provenance.inferred.clone(),
            stale: record.provenance.stale.clone(),
            profile_version: record.profile_version.clone(),
            weights: record.weights.clone(),
            computed_at: record.computed_at.to_rfc3339(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_components(components: &ComponentScores) -> ComponentScores {
    let mut rounded = ComponentScores::default();
    for key in MetricKey::ALL {
        rounded.set(key, components.get(key).map(round2));
    }
    rounded
}
