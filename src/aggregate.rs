use crate::config::ScoringProfile;
use crate::error::ScoringError;
use crate::insights::derive_insights;
use crate::metrics::{MetricDescriptor, MetricKey};
use crate::models::{ComponentScores, Insights};
use crate::normalize::{MAX_SUB_SCORE, MIN_SUB_SCORE};

/// Combines sub-scores into the overall 0-10 investment score.
#[derive(Debug, Clone)]
pub struct Aggregator {
    descriptors: Vec<MetricDescriptor>,
    pivot: f64,
    multiplier: f64,
    insight_count: usize,
}

impl Aggregator {
    pub fn new(profile: &ScoringProfile) -> Self {
        Self {
            descriptors: profile.descriptors(),
            pivot: profile.pivot,
            multiplier: profile.multiplier,
            insight_count: profile.insight_count,
        }
    }

    /// Weighted mean over present components, renormalized by the weight
    /// actually present. `None` when that weight is zero.
    pub fn weighted_average(&self, components: &ComponentScores) -> Option<f64> {
        let (weighted_sum, present_weight) = self
            .descriptors
            .iter()
            .filter_map(|descriptor| {
                components
                    .get(descriptor.key)
                    .map(|score| (score, descriptor.weight))
            })
            .fold((0.0, 0.0), |(sum, total), (score, weight)| {
                (sum + score * weight, total + weight)
            });

        (present_weight > 0.0).then(|| weighted_sum / present_weight)
    }

    /// Stretch the average away from the pivot so units separate visibly.
    pub fn contrast(&self, raw_average: f64) -> f64 {
        (self.pivot + self.multiplier * (raw_average - self.pivot)).clamp(MIN_SUB_SCORE, MAX_SUB_SCORE)
    }

    pub fn aggregate(&self, unit_code: &str, components: &ComponentScores) -> Result<f64, ScoringError> {
        let raw_average =
            self.weighted_average(components)
                .ok_or_else(|| ScoringError::NoScorableComponents {
                    unit_code: unit_code.to_string(),
                })?;
        Ok(self.contrast(raw_average))
    }

    pub fn insights(&self, components: &ComponentScores, overall: f64) -> Insights {
        derive_insights(components, overall, self.insight_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> Aggregator {
        Aggregator::new(&ScoringProfile::default())
    }

    #[test]
    fn missing_components_do_not_pull_score_down() {
        let full: ComponentScores = MetricKey::ALL.into_iter().map(|key| (key, 7.0)).collect();
        let mut sparse = full;
        sparse.set(MetricKey::Seismic, None);
        sparse.set(MetricKey::Climate, None);
        sparse.set(MetricKey::RentalYield, None);

        let a = aggregator();
        assert!((a.weighted_average(&full).unwrap() - 7.0).abs() < 1e-12);
        assert!((a.weighted_average(&sparse).unwrap() - 7.0).abs() < 1e-12);
        assert!((a.aggregate("001", &full).unwrap() - a.aggregate("001", &sparse).unwrap()).abs() < 1e-12);
    }

    fn weighted(weights: &[(MetricKey, f64)]) -> Aggregator {
        let mut profile = ScoringProfile::default();
        profile.weights = weights.iter().copied().collect();
        Aggregator::new(&profile)
    }

    #[test]
    fn absent_weight_leaves_numerator_and_denominator_alike() {
        let scores: ComponentScores = [(MetricKey::PriceTrend, 8.0), (MetricKey::Crime, 6.0)]
            .into_iter()
            .collect();
        let halves = weighted(&[(MetricKey::PriceTrend, 0.5), (MetricKey::Crime, 0.5)]);
        let with_gap = weighted(&[
            (MetricKey::PriceTrend, 0.3),
            (MetricKey::Crime, 0.3),
            (MetricKey::Seismic, 0.4),
        ]);

        let expected = halves.weighted_average(&scores).unwrap();
        assert!((expected - 7.0).abs() < 1e-12);
        assert!((with_gap.weighted_average(&scores).unwrap() - expected).abs() < 1e-12);
        assert!((with_gap.aggregate("x", &scores).unwrap() - halves.aggregate("x", &scores).unwrap()).abs() < 1e-12);

        // unequal weights: dividing by the full weight sum would give 4.5
        let skewed = weighted(&[
            (MetricKey::PriceTrend, 0.45),
            (MetricKey::Crime, 0.15),
            (MetricKey::Seismic, 0.4),
        ]);
        assert!((skewed.weighted_average(&scores).unwrap() - 7.5).abs() < 1e-12);
    }

    #[test]
    fn contrast_stretches_around_pivot() {
        let mut profile = ScoringProfile::default();
        profile.pivot = 6.5;
        profile.multiplier = 1.3;
        let a = Aggregator::new(&profile);
        assert!((a.contrast(5.37) - 5.031).abs() < 1e-9);
        assert_eq!(a.contrast(6.5), 6.5);
    }

    #[test]
    fn overall_stays_within_bounds() {
        let mut profile = ScoringProfile::default();
        profile.multiplier = 3.0;
        let a = Aggregator::new(&profile);

        let top: ComponentScores = MetricKey::ALL.into_iter().map(|key| (key, 9.9)).collect();
        let bottom: ComponentScores = MetricKey::ALL.into_iter().map(|key| (key, 0.1)).collect();
        assert_eq!(a.aggregate("top", &top).unwrap(), MAX_SUB_SCORE);
        assert_eq!(a.aggregate("bottom", &bottom).unwrap(), MIN_SUB_SCORE);
    }

    #[test]
    fn empty_components_are_an_error() {
        let err = aggregator()
            .aggregate("058091", &ComponentScores::default())
            .unwrap_err();
        assert!(matches!(err, ScoringError::NoScorableComponents { unit_code } if unit_code == "058091"));
    }

    #[test]
    fn zero_weight_components_alone_are_an_error() {
        let mut profile = ScoringProfile::default();
        profile.weights.insert(MetricKey::Crime, 0.0);
        let a = Aggregator::new(&profile);
        let only_crime: ComponentScores = [(MetricKey::Crime, 8.0)].into_iter().collect();
        assert!(a.aggregate("x", &only_crime).is_err());
    }
}
