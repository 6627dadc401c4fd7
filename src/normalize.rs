use crate::config::NormalizerSettings;
use crate::error::ScoringError;
use crate::metrics::Polarity;
use crate::models::MetricBaseline;

pub const MIN_SUB_SCORE: f64 = 0.0;
pub const MAX_SUB_SCORE: f64 = 10.0;
pub const MIDPOINT: f64 = 5.0;

/// Maps raw metric values onto the 0-10 sub-score scale.
///
/// The national mean lands exactly on 5.0; deviations are squashed with
/// `5 + 5·tanh(z / spread)` so outliers approach but never cross the bounds.
#[derive(Debug, Clone)]
pub struct Normalizer {
    settings: NormalizerSettings,
}

impl Normalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self { settings }
    }

    /// Whether `baseline` can be used at all.
    pub fn check_baseline(&self, baseline: &MetricBaseline) -> Result<(), ScoringError> {
        if baseline.sample_size < self.settings.min_sample_size {
            return Err(ScoringError::UnscoreableMetric {
                metric: baseline.metric,
                reason: format!(
                    "baseline sample size {} below minimum {}",
                    baseline.sample_size, self.settings.min_sample_size
                ),
            });
        }
        if !baseline.stddev.is_finite() || baseline.stddev <= self.settings.min_stddev {
            return Err(ScoringError::UnscoreableMetric {
                metric: baseline.metric,
                reason: format!("baseline has zero variance (stddev {})", baseline.stddev),
            });
        }
        if !baseline.mean.is_finite() {
            return Err(ScoringError::UnscoreableMetric {
                metric: baseline.metric,
                reason: "baseline mean is not finite".to_string(),
            });
        }
        Ok(())
    }

    pub fn normalize(
        &self,
        raw_value: f64,
        baseline: &MetricBaseline,
        polarity: Polarity,
    ) -> Result<f64, ScoringError> {
        self.check_baseline(baseline)?;
        if !raw_value.is_finite() {
            return Err(ScoringError::InvalidReading {
                metric: baseline.metric,
                value: raw_value,
            });
        }

        let mut z = (raw_value - baseline.mean) / baseline.stddev;
        if polarity == Polarity::LowerBetter {
            z = -z;
        }
        Ok(squash(z, self.settings.spread))
    }
}

fn squash(z: f64, spread: f64) -> f64 {
    let half_range = (MAX_SUB_SCORE - MIN_SUB_SCORE) / 2.0;
    (MIDPOINT + half_range * (z / spread).tanh()).clamp(MIN_SUB_SCORE, MAX_SUB_SCORE)
}
