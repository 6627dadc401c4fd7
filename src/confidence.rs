//! How much to trust an overall score.

use chrono::{DateTime, Utc};

use crate::config::ConfidenceSettings;
use crate::metrics::MetricKey;
use crate::models::{ComponentScores, MetricReading, Provenance};

/// Share of the metric catalogue that produced a sub-score, in `[0, 1]`.
pub fn coverage_fraction(components: &ComponentScores) -> f64 {
    components.present_count() as f64 / MetricKey::ALL.len() as f64
}

/// Coverage discounted once per inferred and once per stale component.
///
/// A component that is both inferred and stale pays both penalties.
pub fn confidence(
    components: &ComponentScores,
    provenance: &Provenance,
    settings: &ConfidenceSettings,
) -> f64 {
    let inferred = provenance.inferred.len() as i32;
    let stale = provenance.stale.len() as i32;

    let value = coverage_fraction(components)
        * settings.inferred_penalty.powi(inferred)
        * settings.stale_penalty.powi(stale);
    value.clamp(0.0, 1.0)
}

/// A reading older than its metric's refresh window no longer describes
/// the unit as it is now.
pub fn is_reading_stale(
    reading: &MetricReading,
    settings: &ConfidenceSettings,
    as_of: DateTime<Utc>,
) -> bool {
    let window = settings.window_days(reading.metric.refresh_tier());
    (as_of - reading.observed_at).num_days() > window
}
