//! Whole-pipeline dry run over in-memory data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::baseline::recompute_baselines;
use crate::batch::{BatchDriver, RunOptions, RunSummary, StopSignal};
use crate::config::{BatchSettings, ScoringProfile};
use crate::engine::ScoringEngine;
use crate::error::ScoringError;
use crate::models::{GeographicUnit, MetricReading};
use crate::payload::ScorePayload;
use crate::store::{MemoryStore, Scope};

pub struct Simulation {
    pub summary: RunSummary,
    pub payloads: Vec<ScorePayload>,
}

/// Compute baselines and score every unit without touching Postgres.
///
/// The throttle only protects a shared database and is ignored here.
pub async fn simulate(
    units: Vec<GeographicUnit>,
    readings: Vec<MetricReading>,
    profile: ScoringProfile,
    settings: BatchSettings,
    as_of: DateTime<Utc>,
) -> Result<Simulation, ScoringError> {
    info!(units = units.len(), readings = readings.len(), "simulating scoring run");
    let store = Arc::new(MemoryStore::with_data(units, readings));
    recompute_baselines(store.as_ref(), as_of).await?;

    let settings = BatchSettings {
        throttle: Duration::ZERO,
        ..settings
    };
    let driver = BatchDriver::new(
        store.clone(),
        ScoringEngine::new(profile),
        settings,
        StopSignal::new(),
    );
    let summary = driver
        .run(RunOptions {
            scope: Scope::All,
            resume: false,
            as_of,
        })
        .await;

    let payloads = store.scores().iter().map(ScorePayload::from).collect();
    Ok(Simulation { summary, payloads })
}
