use thiserror::Error;

use crate::metrics::MetricKey;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Failures worth retrying on the same unit.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| {
                    // serialization failure, deadlock, admin shutdown, connection class
                    code == "40001" || code == "40P01" || code == "57P01" || code.starts_with("08")
                }),
                _ => false,
            },
            StoreError::Migration(_) | StoreError::Corrupt(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("metric {metric} is unscoreable: {reason}")]
    UnscoreableMetric { metric: MetricKey, reason: String },
    #[error("unit {unit_code} has no scorable components")]
    NoScorableComponents { unit_code: String },
    #[error("baseline for {metric} is stale ({age_days} days old)")]
    StaleBaseline { metric: MetricKey, age_days: i64 },
    #[error("reading for {metric} is not a finite number ({value})")]
    InvalidReading { metric: MetricKey, value: f64 },
    #[error("no score recorded for unit {0}")]
    ScoreNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScoringError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ScoringError::Store(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_transients_are_retryable() {
        let transient = ScoringError::from(StoreError::Transient("reset".into()));
        assert!(transient.is_transient());

        let corrupt = ScoringError::from(StoreError::Corrupt("bad metric".into()));
        assert!(!corrupt.is_transient());

        let empty = ScoringError::NoScorableComponents {
            unit_code: "058091".into(),
        };
        assert!(!empty.is_transient());
    }

    #[test]
    fn pool_timeouts_are_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
