use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use investment_score_engine::baseline::recompute_baselines;
use investment_score_engine::batch::{BatchDriver, RunOptions, RunStatus, StopSignal};
use investment_score_engine::config::AppConfig;
use investment_score_engine::engine::ScoringEngine;
use investment_score_engine::fallback::StationInterpolator;
use investment_score_engine::metrics::MetricKey;
use investment_score_engine::payload::ScorePayload;
use investment_score_engine::store::{MetricStore, PgStore, Scope};
use investment_score_engine::{import, report, simulate, telemetry, ScoringError};

#[derive(Parser)]
#[command(name = "investment-score")]
#[command(about = "Scores Italian municipalities and sub-market zones for property investment", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a small set of realistic units and readings
    Seed,
    /// Import metric readings (and optionally units) from CSV files
    Import {
        #[arg(long)]
        csv: PathBuf,
        /// Units to upsert before the readings
        #[arg(long)]
        units: Option<PathBuf>,
    },
    /// Recompute national baselines for every metric
    Baselines,
    /// Recompute scores for a scope
    #[command(group(
        ArgGroup::new("scope")
            .args(["all", "region", "unit"])
            .required(true)
            .multiple(false)
    ))]
    Run {
        #[arg(long)]
        all: bool,
        /// National code prefix, e.g. a province code
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        unit: Option<String>,
        /// Continue after the last checkpoint for this scope
        #[arg(long)]
        resume: bool,
        /// Refresh baselines before scoring
        #[arg(long)]
        recompute_baselines: bool,
        /// Write a markdown run report
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print a unit's current score as JSON
    Show {
        #[arg(long)]
        unit: String,
    },
    /// Score CSV inputs in memory without a database
    Simulate {
        #[arg(long)]
        units: PathBuf,
        #[arg(long)]
        readings: PathBuf,
        #[arg(long, default_value = "scores.json")]
        out: PathBuf,
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Project reference-station measurements onto unit centroids
    Interpolate {
        #[arg(long)]
        stations: PathBuf,
        #[arg(long)]
        metric: MetricKey,
        #[arg(long)]
        source_id: String,
        #[arg(long, default_value_t = 4)]
        neighbors: usize,
        #[arg(long, default_value_t = 2.0)]
        power: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load().context("failed to load configuration")?;
    telemetry::init(&config.log_level).context("failed to initialise logging")?;
    let profile = config.scoring_profile()?;

    match cli.command {
        Commands::InitDb => {
            connect(&config).await?.init_db().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            connect(&config).await?.seed().await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv, units } => {
            let store = connect(&config).await?;
            if let Some(path) = units {
                let units = import::read_units_csv(&path)?;
                let upserted = store.upsert_units(&units).await?;
                println!("Upserted {upserted} units from {}.", path.display());
            }
            let readings = import::read_readings_csv(&csv)?;
            let upserted = store.upsert_readings(&readings).await?;
            println!("Upserted {upserted} readings from {}.", csv.display());
        }
        Commands::Baselines => {
            let store = connect(&config).await?;
            let baselines = recompute_baselines(&store, Utc::now()).await?;
            for baseline in &baselines {
                println!(
                    "- {}: mean {:.3}, stddev {:.3} over {} units ({})",
                    baseline.metric,
                    baseline.mean,
                    baseline.stddev,
                    baseline.sample_size,
                    baseline.metric.raw_unit()
                );
            }
            println!("Computed {} of {} baselines.", baselines.len(), MetricKey::ALL.len());
        }
        Commands::Run {
            all: _,
            region,
            unit,
            resume,
            recompute_baselines: recompute,
            report: report_path,
        } => {
            let scope = match (region, unit) {
                (Some(prefix), _) => Scope::Region(prefix),
                (None, Some(code)) => Scope::Unit(code),
                (None, None) => Scope::All,
            };
            let store = Arc::new(connect(&config).await?);
            if recompute {
                recompute_baselines(store.as_ref(), Utc::now()).await?;
            }

            let stop = StopSignal::new();
            stop.install_ctrl_c();
            let driver = BatchDriver::new(
                store,
                ScoringEngine::new(profile),
                config.batch.clone(),
                stop,
            );
            let summary = driver
                .run(RunOptions {
                    resume,
                    ..RunOptions::new(scope)
                })
                .await;

            println!(
                "Run {} {}: {} scored, {} failed, {} skipped.",
                summary.id,
                summary.status.as_str(),
                summary.succeeded,
                summary.failed,
                summary.skipped
            );
            if let Some(path) = report_path {
                std::fs::write(&path, report::build_run_report(&summary))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Report written to {}.", path.display());
            }
            if summary.status == RunStatus::Failed {
                bail!(
                    "run failed: {}",
                    summary.fatal_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Show { unit } => {
            let store = connect(&config).await?;
            match store.get_score(&unit).await? {
                Some(record) => {
                    let payload = ScorePayload::from(&record);
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                None => return Err(ScoringError::ScoreNotFound(unit).into()),
            }
        }
        Commands::Simulate {
            units,
            readings,
            out,
            report: report_path,
        } => {
            let units = import::read_units_csv(&units)?;
            let readings = import::read_readings_csv(&readings)?;
            let simulation =
                simulate::simulate(units, readings, profile, config.batch.clone(), Utc::now())
                    .await?;

            std::fs::write(&out, serde_json::to_string_pretty(&simulation.payloads)?)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!(
                "Scored {} units ({} failures) into {}.",
                simulation.summary.succeeded,
                simulation.summary.failures.len(),
                out.display()
            );
            if let Some(path) = report_path {
                std::fs::write(&path, report::build_run_report(&simulation.summary))
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Report written to {}.", path.display());
            }
        }
        Commands::Interpolate {
            stations,
            metric,
            source_id,
            neighbors,
            power,
        } => {
            let stations = import::read_stations_csv(&stations)?;
            if stations.is_empty() {
                bail!("no reference stations to interpolate from");
            }
            let store = connect(&config).await?;
            let units = store.all_units().await?;
            let interpolator = StationInterpolator {
                neighbors,
                power,
                ..StationInterpolator::default()
            };
            let readings =
                interpolator.readings_for(&units, &stations, metric, &source_id, Utc::now());
            let upserted = store.upsert_readings(&readings).await?;
            info!(metric = %metric, stations = stations.len(), upserted, "station values interpolated");
            println!("Interpolated {metric} for {upserted} units from {} stations.", stations.len());
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> anyhow::Result<PgStore> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")?;
    Ok(PgStore::new(pool))
}
