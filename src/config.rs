use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{MetricDescriptor, MetricKey, RefreshTier};

pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Versioned calibration for a scoring run.
///
/// Every tunable that changes the numbers lives here so a historical run can
/// be reproduced by replaying its profile. Example JSON:
/// ```json
/// {
///   "version": "2024.2",
///   "pivot": 5.5,
///   "multiplier": 1.3,
///   "weights": { "price_trend": 0.1, "seismic": 0.05, "...": 0.0 },
///   "fallback": { "neighbors": 3, "max_radius_km": 50.0 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringProfile {
    pub version: String,
    /// Neutral point the contrast stretch pivots around
    pub pivot: f64,
    /// Stretch applied to deviations from the pivot (> 1)
    pub multiplier: f64,
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<MetricKey, f64>,
    /// Strengths and risks reported per unit
    #[serde(default = "default_insight_count")]
    pub insight_count: usize,
    #[serde(default)]
    pub normalizer: NormalizerSettings,
    #[serde(default)]
    pub fallback: FallbackSettings,
    #[serde(default)]
    pub confidence: ConfidenceSettings,
}

impl Default for ScoringProfile {
    fn default() -> Self {
        Self {
            version: "2024.2".to_string(),
            pivot: 5.5,
            multiplier: 1.3,
            weights: default_weights(),
            insight_count: default_insight_count(),
            normalizer: NormalizerSettings::default(),
            fallback: FallbackSettings::default(),
            confidence: ConfidenceSettings::default(),
        }
    }
}

impl ScoringProfile {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ProfileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let profile: ScoringProfile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::ProfileParse {
                path: path.to_path_buf(),
                source,
            })?;
        validate_profile(&profile).map_err(ConfigError::InvalidProfile)?;
        Ok(profile)
    }

    pub fn weight(&self, key: MetricKey) -> f64 {
        self.weights.get(&key).copied().unwrap_or(0.0)
    }

    pub fn descriptor(&self, key: MetricKey) -> MetricDescriptor {
        MetricDescriptor::new(key, self.weight(key))
    }

    pub fn descriptors(&self) -> Vec<MetricDescriptor> {
        MetricKey::ALL.into_iter().map(|key| self.descriptor(key)).collect()
    }
}

fn default_weights() -> BTreeMap<MetricKey, f64> {
    MetricKey::ALL
        .into_iter()
        .map(|key| {
            let weight = match key {
                MetricKey::PriceTrend
                | MetricKey::Affordability
                | MetricKey::RentalYield
                | MetricKey::Connectivity
                | MetricKey::DigitalConnectivity
                | MetricKey::AirQuality
                | MetricKey::Climate => 0.10,
                MetricKey::Demographics
                | MetricKey::Crime
                | MetricKey::Services
                | MetricKey::Seismic
                | MetricKey::Flood
                | MetricKey::Landslide => 0.05,
            };
            (key, weight)
        })
        .collect()
}

fn default_insight_count() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizerSettings {
    /// Baselines built from fewer readings are not trusted
    pub min_sample_size: i64,
    /// z is divided by this before the tanh squash
    pub spread: f64,
    /// Standard deviations at or below this count as zero variance
    pub min_stddev: f64,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            spread: 1.0,
            min_stddev: 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackSettings {
    pub neighbors: usize,
    pub max_radius_km: f64,
    pub power: f64,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            neighbors: 3,
            max_radius_km: 50.0,
            power: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfidenceSettings {
    pub inferred_penalty: f64,
    pub stale_penalty: f64,
    pub high_window_days: i64,
    pub seasonal_window_days: i64,
    pub strategic_window_days: i64,
    pub baseline_max_age_days: i64,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        Self {
            inferred_penalty: 0.85,
            stale_penalty: 0.95,
            high_window_days: 200,
            seasonal_window_days: 400,
            strategic_window_days: 1100,
            baseline_max_age_days: 45,
        }
    }
}

impl ConfidenceSettings {
    pub fn window_days(&self, tier: RefreshTier) -> i64 {
        match tier {
            RefreshTier::High => self.high_window_days,
            RefreshTier::Seasonal => self.seasonal_window_days,
            RefreshTier::Strategic => self.strategic_window_days,
        }
    }
}

/// Validate a scoring profile. Returns every problem at once.
pub fn validate_profile(profile: &ScoringProfile) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if profile.version.trim().is_empty() {
        errors.push("version: must not be empty".to_string());
    }
    if !(0.0..=10.0).contains(&profile.pivot) {
        errors.push(format!("pivot: {} is outside 0-10", profile.pivot));
    }
    if !profile.multiplier.is_finite() || profile.multiplier <= 0.0 {
        errors.push(format!("multiplier: {} must be positive", profile.multiplier));
    }

    for key in MetricKey::ALL {
        match profile.weights.get(&key) {
            None => errors.push(format!("weights.{key}: missing")),
            Some(weight) if !(0.0..=1.0).contains(weight) => {
                errors.push(format!("weights.{key}: {weight} is outside 0-1"));
            }
            Some(_) => {}
        }
    }
    let total: f64 = profile.weights.values().sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        errors.push(format!("weights: sum to {total:.6}, expected 1.0"));
    }

    if profile.normalizer.min_sample_size < 2 {
        errors.push("normalizer.min_sample_size: must be at least 2".to_string());
    }
    if profile.normalizer.spread <= 0.0 {
        errors.push("normalizer.spread: must be positive".to_string());
    }
    if profile.fallback.neighbors == 0 {
        errors.push("fallback.neighbors: must be at least 1".to_string());
    }
    if profile.fallback.max_radius_km <= 0.0 {
        errors.push("fallback.max_radius_km: must be positive".to_string());
    }
    if profile.fallback.power <= 0.0 {
        errors.push("fallback.power: must be positive".to_string());
    }

    for (name, penalty) in [
        ("inferred_penalty", profile.confidence.inferred_penalty),
        ("stale_penalty", profile.confidence.stale_penalty),
    ] {
        if !(0.0..=1.0).contains(&penalty) {
            errors.push(format!("confidence.{name}: {penalty} is outside 0-1"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Batch driver pacing.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub throttle: Duration,
    pub commit_every: usize,
    /// Total attempts per unit, the first one included
    pub max_retries: usize,
    /// Base of the exponential backoff between retries of one unit
    pub retry_base_ms: u64,
    pub max_retry_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            commit_every: 100,
            max_retries: 3,
            retry_base_ms: 50,
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Process configuration read from `.env` and the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub log_level: String,
    pub profile_path: Option<PathBuf>,
    pub batch: BatchSettings,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty());
        let log_level = env::var("SCORING_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let profile_path = env::var("SCORING_PROFILE").ok().map(PathBuf::from);

        let defaults = BatchSettings::default();
        let batch = BatchSettings {
            throttle: Duration::from_millis(parse_var("BATCH_THROTTLE_MS", 100u64)?),
            commit_every: parse_var("BATCH_COMMIT_EVERY", defaults.commit_every)?.max(1),
            max_retries: parse_var("BATCH_MAX_RETRIES", defaults.max_retries)?,
            ..defaults
        };

        Ok(Self {
            database_url,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 5u32)?,
            log_level,
            profile_path,
            batch,
        })
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::MissingDatabaseUrl)
    }

    /// The profile named by `SCORING_PROFILE`, or the built-in calibration.
    pub fn scoring_profile(&self) -> Result<ScoringProfile, ConfigError> {
        match &self.profile_path {
            Some(path) => ScoringProfile::from_json_file(path),
            None => Ok(ScoringProfile::default()),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            name,
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DATABASE_URL must be set to a Postgres instance")]
    MissingDatabaseUrl,
    #[error("{name} must be a number, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("cannot read scoring profile {}: {source}", path.display())]
    ProfileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse scoring profile {}: {source}", path.display())]
    ProfileParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid scoring profile: {}", .0.join("; "))]
    InvalidProfile(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "DATABASE_URL",
            "SCORING_LOG_LEVEL",
            "SCORING_PROFILE",
            "BATCH_THROTTLE_MS",
            "BATCH_COMMIT_EVERY",
            "BATCH_MAX_RETRIES",
            "DB_MAX_CONNECTIONS",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn default_profile_is_valid() {
        let profile = ScoringProfile::default();
        assert!(validate_profile(&profile).is_ok());
        let total: f64 = profile.weights.values().sum();
        assert!((total - 1.0).abs() < WEIGHT_TOLERANCE);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut profile = ScoringProfile::default();
        profile.weights.insert(MetricKey::Seismic, 0.5);
        let errors = validate_profile(&profile).unwrap_err();
        assert!(errors.iter().any(|e| e.starts_with("weights: sum")));
    }

    #[test]
    fn collects_all_errors() {
        let mut profile = ScoringProfile::default();
        profile.multiplier = -1.0;
        profile.weights.remove(&MetricKey::Flood);
        profile.fallback.neighbors = 0;
        let errors = validate_profile(&profile).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("multiplier")));
        assert!(errors.iter().any(|e| e.contains("weights.flood: missing")));
        assert!(errors.iter().any(|e| e.contains("fallback.neighbors")));
    }

    #[test]
    fn partial_profile_json_uses_defaults() {
        let json = r#"{ "version": "calib-a", "pivot": 6.5, "multiplier": 1.8 }"#;
        let profile: ScoringProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.pivot, 6.5);
        assert_eq!(profile.multiplier, 1.8);
        assert_eq!(profile.weights, default_weights());
        assert_eq!(profile.fallback, FallbackSettings::default());
        assert!(validate_profile(&profile).is_ok());
    }

    #[test]
    fn unknown_profile_fields_are_rejected() {
        let json = r#"{ "version": "x", "pivot": 5.5, "multiplier": 1.3, "boost": 2 }"#;
        assert!(serde_json::from_str::<ScoringProfile>(json).is_err());
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.batch.throttle, Duration::from_millis(100));
        assert_eq!(config.batch.commit_every, 100);
        assert_eq!(config.max_connections, 5);
        assert!(config.profile_path.is_none());
    }

    #[test]
    fn rejects_non_numeric_throttle() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("BATCH_THROTTLE_MS", "fast");
        let err = AppConfig::load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { name: "BATCH_THROTTLE_MS", .. }));
        reset_env();
    }
}
