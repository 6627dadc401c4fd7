//! Full-population recomputation: pages units, scores them, commits in groups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::baseline::BaselineSnapshot;
use crate::config::BatchSettings;
use crate::engine::ScoringEngine;
use crate::error::{ScoringError, StoreError};
use crate::models::{ScoreRecord, UnitProjection};
use crate::store::{MetricStore, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::PartiallyCompleted => "partially_completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nothing scorable, real or inferred; the unit is skipped.
    NoData,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_code: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredUnit {
    pub unit_code: String,
    pub overall_score: f64,
    pub confidence: f64,
}

impl From<&ScoreRecord> for ScoredUnit {
    fn from(record: &ScoreRecord) -> Self {
        Self {
            unit_code: record.unit_code.clone(),
            overall_score: record.overall_score,
            confidence: record.confidence,
        }
    }
}

/// Operator-facing outcome of one batch run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: Uuid,
    pub scope: Scope,
    pub as_of: DateTime<Utc>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resumed_after: Option<String>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub failures: Vec<UnitFailure>,
    pub scored: Vec<ScoredUnit>,
    pub baseline_warnings: Vec<String>,
    pub fatal_error: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(scope: Scope, as_of: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            as_of,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            resumed_after: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cancelled: false,
            failures: Vec::new(),
            scored: Vec::new(),
            baseline_warnings: Vec::new(),
            fatal_error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn record_failure(&mut self, unit_code: &str, err: &ScoringError) {
        let kind = match err {
            ScoringError::NoScorableComponents { .. } => {
                self.skipped += 1;
                FailureKind::NoData
            }
            _ => {
                self.failed += 1;
                FailureKind::Error
            }
        };
        self.failures.push(UnitFailure {
            unit_code: unit_code.to_string(),
            kind,
            reason: err.to_string(),
        });
    }
}

/// Cooperative cancellation flag, checked between units.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Trip the signal on the first Ctrl-C.
    pub fn install_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing current unit and flushing");
                signal.stop();
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scope: Scope,
    /// Restart after the scope's saved checkpoint instead of from the top
    pub resume: bool,
    pub as_of: DateTime<Utc>,
}

impl RunOptions {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            resume: false,
            as_of: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no usable baselines; compute baselines before scoring")]
    NoUsableBaselines,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BatchDriver {
    store: Arc<dyn MetricStore>,
    engine: ScoringEngine,
    settings: BatchSettings,
    stop: StopSignal,
}

impl BatchDriver {
    pub fn new(
        store: Arc<dyn MetricStore>,
        engine: ScoringEngine,
        settings: BatchSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
            stop,
        }
    }

    /// Run to completion, cancellation or systemic failure. Per-unit errors
    /// never abort the run; they land in the summary's failure list.
    pub async fn run(&self, options: RunOptions) -> RunSummary {
        let mut summary = RunSummary::new(options.scope.clone(), options.as_of);
        summary.status = RunStatus::Running;
        self.record(&summary).await;
        info!(run_id = %summary.id, scope = %options.scope, resume = options.resume, "batch run started");

        let started = Instant::now();
        let outcome = self.drive(&options, &mut summary, started).await;
        summary.elapsed = started.elapsed();
        summary.finished_at = Some(Utc::now());
        summary.status = match outcome {
            Ok(()) if summary.cancelled || !summary.failures.is_empty() => RunStatus::PartiallyCompleted,
            Ok(()) => RunStatus::Completed,
            Err(err) => {
                error!(run_id = %summary.id, error = %err, "batch run failed");
                summary.fatal_error = Some(err.to_string());
                RunStatus::Failed
            }
        };

        info!(
            run_id = %summary.id,
            status = summary.status.as_str(),
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "batch run finished"
        );
        self.record(&summary).await;
        summary
    }

    async fn drive(
        &self,
        options: &RunOptions,
        summary: &mut RunSummary,
        started: Instant,
    ) -> Result<(), BatchError> {
        let baselines = self.store.load_baselines().await?;
        let (snapshot, warnings) = self.engine.snapshot(baselines, options.as_of);
        for warning in &warnings {
            warn!(error = %warning, "baseline excluded or degraded");
        }
        summary.baseline_warnings = warnings.iter().map(ToString::to_string).collect();
        if snapshot.usable_count() == 0 {
            return Err(BatchError::NoUsableBaselines);
        }

        let scope_key = options.scope.key();
        let mut cursor = if options.resume {
            self.store.load_checkpoint(&scope_key).await?
        } else {
            None
        };
        if let Some(after) = &cursor {
            info!(scope = %scope_key, after = %after, "resuming from checkpoint");
        }
        summary.resumed_after = cursor.clone();

        let page_size = self.settings.commit_every.max(1);
        loop {
            let page = self
                .store
                .list_units(&options.scope, cursor.as_deref(), page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            let mut buffer = Vec::with_capacity(page.len());
            let mut last_processed = None;
            for unit in &page {
                if self.stop.is_stopped() {
                    summary.cancelled = true;
                    break;
                }

                summary.processed += 1;
                match self.score_with_retry(unit, &snapshot, options.as_of).await {
                    Ok(record) => {
                        summary.succeeded += 1;
                        summary.scored.push(ScoredUnit::from(&record));
                        buffer.push(record);
                    }
                    Err(err) => {
                        warn!(unit = %unit.code, error = %err, "unit not scored");
                        summary.record_failure(&unit.code, &err);
                    }
                }
                last_processed = Some(unit.code.clone());

                if !self.settings.throttle.is_zero() {
                    tokio::time::sleep(self.settings.throttle).await;
                }
            }

            self.flush(&scope_key, &buffer, last_processed.as_deref()).await?;
            info!(
                processed = summary.processed,
                succeeded = summary.succeeded,
                failures = summary.failures.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "commit group flushed"
            );

            if summary.cancelled || page.len() < page_size {
                break;
            }
            cursor = last_processed;
        }

        if !summary.cancelled {
            self.store.clear_checkpoint(&scope_key).await?;
        }
        Ok(())
    }

    async fn score_with_retry(
        &self,
        unit: &UnitProjection,
        snapshot: &BaselineSnapshot,
        as_of: DateTime<Utc>,
    ) -> Result<ScoreRecord, ScoringError> {
        // The strategy yields the delays between attempts, one fewer than the attempts.
        let strategy = ExponentialBackoff::from_millis(self.settings.retry_base_ms)
            .max_delay(self.settings.max_retry_delay)
            .take(self.settings.max_retries.saturating_sub(1));

        RetryIf::spawn(
            strategy,
            || self.engine.score_unit(self.store.as_ref(), unit, snapshot, as_of),
            |err: &ScoringError| {
                let retry = err.is_transient();
                if retry {
                    warn!(unit = %unit.code, error = %err, "transient failure, retrying");
                }
                retry
            },
        )
        .await
    }

    /// One transaction for the group, then the checkpoint.
    async fn flush(
        &self,
        scope_key: &str,
        records: &[ScoreRecord],
        last_processed: Option<&str>,
    ) -> Result<(), StoreError> {
        if !records.is_empty() {
            self.store.upsert_scores(records).await?;
        }
        if let Some(unit_code) = last_processed {
            self.store.save_checkpoint(scope_key, unit_code).await?;
        }
        Ok(())
    }

    async fn record(&self, summary: &RunSummary) {
        if let Err(err) = self.store.record_run(summary).await {
            warn!(run_id = %summary.id, error = %err, "could not persist run record");
        }
    }
}
