use std::fmt;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKey;
use crate::models::{ComponentScores, Insights};

/// Rank present components by how far they sit above or below the overall
/// score. Equal deltas keep canonical metric order.
pub fn derive_insights(components: &ComponentScores, overall: f64, count: usize) -> Insights {
    let mut deltas: Vec<(MetricKey, f64)> = components
        .present()
        .map(|(key, score)| (key, score - overall))
        .collect();

    // stable sort: ties stay in metric declaration order
    deltas.sort_by(|a, b| b.1.total_cmp(&a.1));
    let strengths = deltas
        .iter()
        .filter(|(_, delta)| *delta > 0.0)
        .take(count)
        .map(|(key, _)| *key)
        .collect();

    deltas.sort_by(|a, b| a.1.total_cmp(&b.1));
    let risks = deltas
        .iter()
        .filter(|(_, delta)| *delta < 0.0)
        .take(count)
        .map(|(key, _)| *key)
        .collect();

    Insights { strengths, risks }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreCategory {
    Excellent,
    Good,
    Fair,
    #[serde(rename = "Below Average")]
    BelowAverage,
    Poor,
}

impl ScoreCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 8.5 {
            ScoreCategory::Excellent
        } else if score >= 7.0 {
            ScoreCategory::Good
        } else if score >= 5.5 {
            ScoreCategory::Fair
        } else if score >= 4.0 {
            ScoreCategory::BelowAverage
        } else {
            ScoreCategory::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ScoreCategory::Excellent => "Excellent",
            ScoreCategory::Good => "Good",
            ScoreCategory::Fair => "Fair",
            ScoreCategory::BelowAverage => "Below Average",
            ScoreCategory::Poor => "Poor",
        }
    }
}

impl fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn recommendation(overall: f64) -> &'static str {
    if overall >= 8.0 {
        "Excellent investment opportunity with strong fundamentals"
    } else if overall >= 6.0 {
        "Good investment potential with moderate risk"
    } else if overall >= 4.0 {
        "Fair investment opportunity, consider carefully"
    } else {
        "High risk investment, thorough due diligence required"
    }
}

/// Human-readable lines for the strengths followed by the risks.
pub fn notes(insights: &Insights) -> Vec<String> {
    insights
        .strengths
        .iter()
        .map(|key| key.strength_note().to_string())
        .chain(insights.risks.iter().map(|key| key.risk_note().to_string()))
        .collect()
}
