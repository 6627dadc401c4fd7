//! National per-metric statistics and the per-run snapshot built from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::ConfidenceSettings;
use crate::error::ScoringError;
use crate::metrics::MetricKey;
use crate::models::{MetricBaseline, Percentiles};
use crate::normalize::Normalizer;
use crate::store::MetricStore;

/// Mean, population standard deviation and percentile breakpoints.
/// Non-finite values are ignored; returns `None` for an empty corpus.
pub fn compute_baseline(
    metric: MetricKey,
    values: &[f64],
    computed_at: DateTime<Utc>,
) -> Option<MetricBaseline> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some(MetricBaseline {
        metric,
        mean,
        stddev: variance.sqrt(),
        sample_size: sorted.len() as i64,
        percentiles: Some(Percentiles {
            p10: percentile(&sorted, 0.10),
            p25: percentile(&sorted, 0.25),
            p50: percentile(&sorted, 0.50),
            p75: percentile(&sorted, 0.75),
            p90: percentile(&sorted, 0.90),
        }),
        computed_at,
    })
}

/// Linear interpolation between closest ranks over sorted input.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Recompute every metric's baseline from the current corpus and persist it.
///
/// Must finish before a scoring run starts; runs never see a half-written set.
pub async fn recompute_baselines(
    store: &dyn MetricStore,
    computed_at: DateTime<Utc>,
) -> Result<Vec<MetricBaseline>, ScoringError> {
    let mut baselines = Vec::new();

    for metric in MetricKey::ALL {
        let values = store.metric_values(metric).await?;
        match compute_baseline(metric, &values, computed_at) {
            Some(baseline) => {
                info!(
                    metric = %metric,
                    sample_size = baseline.sample_size,
                    mean = baseline.mean,
                    stddev = baseline.stddev,
                    "baseline computed"
                );
                baselines.push(baseline);
            }
            None => warn!(metric = %metric, "no readings, baseline not computed"),
        }
    }

    store.save_baselines(&baselines).await?;
    Ok(baselines)
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    baseline: MetricBaseline,
    stale: bool,
}

/// Read-only view of the baselines a run scores against.
///
/// Built once per run; every unit in the run sees the same statistics.
#[derive(Debug, Clone, Default)]
pub struct BaselineSnapshot {
    usable: BTreeMap<MetricKey, SnapshotEntry>,
}

impl BaselineSnapshot {
    /// Returns the snapshot plus the warnings raised while vetting baselines.
    pub fn build(
        baselines: Vec<MetricBaseline>,
        normalizer: &Normalizer,
        settings: &ConfidenceSettings,
        as_of: DateTime<Utc>,
    ) -> (Self, Vec<ScoringError>) {
        let mut by_metric: BTreeMap<MetricKey, MetricBaseline> = baselines
            .into_iter()
            .map(|baseline| (baseline.metric, baseline))
            .collect();

        let mut usable = BTreeMap::new();
        let mut warnings = Vec::new();

        for metric in MetricKey::ALL {
            let Some(baseline) = by_metric.remove(&metric) else {
                warnings.push(ScoringError::UnscoreableMetric {
                    metric,
                    reason: "no baseline computed".to_string(),
                });
                continue;
            };
            if let Err(err) = normalizer.check_baseline(&baseline) {
                warnings.push(err);
                continue;
            }

            let age_days = (as_of - baseline.computed_at).num_days();
            let stale = age_days > settings.baseline_max_age_days;
            if stale {
                warnings.push(ScoringError::StaleBaseline { metric, age_days });
            }
            usable.insert(metric, SnapshotEntry { baseline, stale });
        }

        (Self { usable }, warnings)
    }

    pub fn get(&self, metric: MetricKey) -> Option<&MetricBaseline> {
        self.usable.get(&metric).map(|entry| &entry.baseline)
    }

    pub fn is_stale(&self, metric: MetricKey) -> bool {
        self.usable.get(&metric).is_some_and(|entry| entry.stale)
    }

    pub fn usable_count(&self) -> usize {
        self.usable.len()
    }
}
