use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::{MetricStore, Neighbor, Scope};
use crate::batch::RunSummary;
use crate::error::StoreError;
use crate::geo::EARTH_RADIUS_KM;
use crate::metrics::MetricKey;
use crate::models::{
    ComponentScores, Coordinate, GeographicUnit, Insights, MetricBaseline, MetricReading,
    Percentiles, Provenance, ScoreRecord, UnitKind, UnitProjection,
};

/// Full-row replace keyed on the table's primary key, so a unit keeps one row.
const UPSERT_SCORE_SQL: &str = r#"
INSERT INTO investment_scoring.score_records
(unit_code, computed_at, overall_score, component_scores, confidence,
 coverage_fraction, insights, provenance, profile_version, weights)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (unit_code) DO UPDATE
SET computed_at = EXCLUDED.computed_at,
    overall_score = EXCLUDED.overall_score,
    component_scores = EXCLUDED.component_scores,
    confidence = EXCLUDED.confidence,
    coverage_fraction = EXCLUDED.coverage_fraction,
    insights = EXCLUDED.insights,
    provenance = EXCLUDED.provenance,
    profile_version = EXCLUDED.profile_version,
    weights = EXCLUDED.weights
"#;

/// Kilometres per degree of latitude, used for the bounding-box prefilter.
const KM_PER_DEGREE: f64 = 111.0;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_db(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_units(&self, units: &[GeographicUnit]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Parents first so zone rows satisfy the foreign key.
        let mut ordered: Vec<&GeographicUnit> = units.iter().collect();
        ordered.sort_by_key(|unit| unit.parent_code.is_some());

        for unit in ordered {
            sqlx::query(
                r#"
                INSERT INTO investment_scoring.geographic_units
                (code, name, kind, parent_code, latitude, longitude, polygon, population)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (code) DO UPDATE
                SET name = EXCLUDED.name,
                    kind = EXCLUDED.kind,
                    parent_code = EXCLUDED.parent_code,
                    latitude = EXCLUDED.latitude,
                    longitude = EXCLUDED.longitude,
                    polygon = EXCLUDED.polygon,
                    population = EXCLUDED.population
                "#,
            )
            .bind(&unit.code)
            .bind(&unit.name)
            .bind(unit.kind.as_str())
            .bind(&unit.parent_code)
            .bind(unit.centroid.latitude)
            .bind(unit.centroid.longitude)
            .bind(unit.polygon.as_ref().map(Json))
            .bind(unit.population)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(units.len())
    }

    /// Every unit in code order. Used by ingestion-side helpers only.
    pub async fn all_units(&self) -> Result<Vec<GeographicUnit>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT code, name, kind, parent_code, latitude, longitude, polygon, population
            FROM investment_scoring.geographic_units
            ORDER BY code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<GeographicUnit, StoreError> {
                let polygon: Option<Json<serde_json::Value>> = row.try_get("polygon")?;
                Ok(GeographicUnit {
                    code: row.try_get("code")?,
                    name: row.try_get("name")?,
                    kind: parse_kind(row)?,
                    parent_code: row.try_get("parent_code")?,
                    centroid: Coordinate::new(row.try_get("latitude")?, row.try_get("longitude")?),
                    polygon: polygon.map(|json| json.0),
                    population: row.try_get("population")?,
                })
            })
            .collect()
    }

    pub async fn seed(&self) -> Result<(), StoreError> {
        let units = vec![
            seed_unit("015146", "Milano", None, 45.4642, 9.1900, 1_371_000),
            seed_unit("015146-B1", "Milano Centro Storico", Some("015146"), 45.4641, 9.1919, 98_000),
            seed_unit("015146-D20", "Milano Citta Studi", Some("015146"), 45.4780, 9.2268, 61_000),
            seed_unit("016024", "Bergamo", None, 45.6983, 9.6773, 120_000),
            seed_unit("037006", "Bologna", None, 44.4949, 11.3426, 390_000),
            seed_unit("058091", "Roma", None, 41.9028, 12.4964, 2_750_000),
            seed_unit("063049", "Napoli", None, 40.8518, 14.2681, 910_000),
            seed_unit("066049", "L'Aquila", None, 42.3498, 13.3995, 69_000),
            seed_unit("082053", "Palermo", None, 38.1157, 13.3615, 630_000),
        ];
        self.upsert_units(&units).await?;

        let observed_at = DateTime::parse_from_rfc3339("2024-06-30T00:00:00Z")
            .map_err(|err| StoreError::Corrupt(format!("seed timestamp: {err}")))?
            .with_timezone(&Utc);
        let readings: Vec<MetricReading> = [
            ("015146", MetricKey::PriceTrend, 6.8),
            ("015146", MetricKey::Affordability, 31_500.0),
            ("015146", MetricKey::AirQuality, 24.1),
            ("015146", MetricKey::Seismic, 0.05),
            ("015146-B1", MetricKey::PriceTrend, 8.9),
            ("015146-B1", MetricKey::RentalYield, 3.4),
            ("015146-D20", MetricKey::RentalYield, 4.6),
            ("016024", MetricKey::AirQuality, 22.3),
            ("037006", MetricKey::PriceTrend, 4.2),
            ("037006", MetricKey::Seismic, 0.17),
            ("058091", MetricKey::PriceTrend, 3.1),
            ("058091", MetricKey::Affordability, 27_800.0),
            ("058091", MetricKey::Crime, 61.0),
            ("063049", MetricKey::Crime, 72.0),
            ("063049", MetricKey::Seismic, 0.17),
            ("066049", MetricKey::Seismic, 0.26),
            ("082053", MetricKey::Seismic, 0.09),
            ("082053", MetricKey::Climate, 18.0),
        ]
        .into_iter()
        .map(|(code, metric, raw_value)| MetricReading {
            unit_code: code.to_string(),
            metric,
            raw_value,
            source_id: "seed".to_string(),
            observed_at,
        })
        .collect();
        self.upsert_readings(&readings).await?;

        Ok(())
    }
}

fn seed_unit(
    code: &str,
    name: &str,
    parent_code: Option<&str>,
    latitude: f64,
    longitude: f64,
    population: i64,
) -> GeographicUnit {
    GeographicUnit {
        code: code.to_string(),
        name: name.to_string(),
        kind: if parent_code.is_some() {
            UnitKind::SubmarketZone
        } else {
            UnitKind::Municipality
        },
        parent_code: parent_code.map(str::to_string),
        centroid: Coordinate::new(latitude, longitude),
        polygon: None,
        population: Some(population),
    }
}

fn parse_kind(row: &PgRow) -> Result<UnitKind, StoreError> {
    let raw: String = row.try_get("kind")?;
    UnitKind::from_str(&raw).map_err(StoreError::Corrupt)
}

fn parse_metric(row: &PgRow) -> Result<MetricKey, StoreError> {
    let raw: String = row.try_get("metric_key")?;
    MetricKey::from_str(&raw).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn reading_from_row(row: &PgRow) -> Result<MetricReading, StoreError> {
    Ok(MetricReading {
        unit_code: row.try_get("unit_code")?,
        metric: parse_metric(row)?,
        raw_value: row.try_get("raw_value")?,
        source_id: row.try_get("source_id")?,
        observed_at: row.try_get("observed_at")?,
    })
}

fn score_from_row(row: &PgRow) -> Result<ScoreRecord, StoreError> {
    let components: Json<ComponentScores> = row.try_get("component_scores")?;
    let insights: Json<Insights> = row.try_get("insights")?;
    let provenance: Json<Provenance> = row.try_get("provenance")?;
    let weights: Json<BTreeMap<MetricKey, f64>> = row.try_get("weights")?;
    Ok(ScoreRecord {
        unit_code: row.try_get("unit_code")?,
        computed_at: row.try_get("computed_at")?,
        overall_score: row.try_get("overall_score")?,
        component_scores: components.0,
        confidence: row.try_get("confidence")?,
        coverage_fraction: row.try_get("coverage_fraction")?,
        insights: insights.0,
        provenance: provenance.0,
        profile_version: row.try_get("profile_version")?,
        weights: weights.0,
    })
}

#[async_trait]
impl MetricStore for PgStore {
    async fn list_units(
        &self,
        scope: &Scope,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UnitProjection>, StoreError> {
        let mut query = String::from(
            "SELECT code, kind, parent_code, latitude, longitude \
             FROM investment_scoring.geographic_units \
             WHERE ($1::TEXT IS NULL OR code > $1)",
        );
        match scope {
            Scope::All => {}
            Scope::Region(_) => query.push_str(" AND starts_with(code, $3)"),
            Scope::Unit(_) => query.push_str(" AND code = $3"),
        }
        query.push_str(" ORDER BY code LIMIT $2");

        let mut rows = sqlx::query(&query)
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));
        match scope {
            Scope::All => {}
            Scope::Region(value) | Scope::Unit(value) => rows = rows.bind(value),
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut units = Vec::with_capacity(records.len());
        for row in records {
            units.push(UnitProjection {
                code: row.try_get("code")?,
                kind: parse_kind(&row)?,
                parent_code: row.try_get("parent_code")?,
                centroid: Coordinate::new(row.try_get("latitude")?, row.try_get("longitude")?),
            });
        }
        Ok(units)
    }

    async fn get_readings(&self, unit_code: &str) -> Result<Vec<MetricReading>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT unit_code, metric_key, raw_value, source_id, observed_at
            FROM investment_scoring.metric_readings
            WHERE unit_code = $1
            ORDER BY metric_key
            "#,
        )
        .bind(unit_code)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(reading_from_row).collect()
    }

    async fn get_reading(
        &self,
        unit_code: &str,
        metric: MetricKey,
    ) -> Result<Option<MetricReading>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT unit_code, metric_key, raw_value, source_id, observed_at
            FROM investment_scoring.metric_readings
            WHERE unit_code = $1 AND metric_key = $2
            "#,
        )
        .bind(unit_code)
        .bind(metric.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(reading_from_row).transpose()
    }

    async fn k_nearest(
        &self,
        unit: &UnitProjection,
        metric: MetricKey,
        k: usize,
        max_radius_km: f64,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let lat_window = max_radius_km / KM_PER_DEGREE;
        let rows = sqlx::query(
            r#"
            SELECT unit_code, raw_value, distance_km FROM (
                SELECT r.unit_code, r.raw_value,
                       2 * $7 * asin(least(1.0, sqrt(
                           power(sin(radians(u.latitude - $1) / 2), 2)
                           + cos(radians($1)) * cos(radians(u.latitude))
                             * power(sin(radians(u.longitude - $2) / 2), 2)
                       ))) AS distance_km
                FROM investment_scoring.metric_readings r
                JOIN investment_scoring.geographic_units u ON u.code = r.unit_code
                WHERE r.metric_key = $3
                  AND r.unit_code <> $4
                  AND u.latitude BETWEEN $1 - $5 AND $1 + $5
            ) candidates
            WHERE distance_km <= $6
            ORDER BY distance_km, unit_code
            LIMIT $8
            "#,
        )
        .bind(unit.centroid.latitude)
        .bind(unit.centroid.longitude)
        .bind(metric.as_str())
        .bind(&unit.code)
        .bind(lat_window)
        .bind(max_radius_km)
        .bind(EARTH_RADIUS_KM)
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut neighbors = Vec::with_capacity(rows.len());
        for row in rows {
            neighbors.push(Neighbor {
                unit_code: row.try_get("unit_code")?,
                raw_value: row.try_get("raw_value")?,
                distance_km: row.try_get("distance_km")?,
            });
        }
        Ok(neighbors)
    }

    async fn metric_values(&self, metric: MetricKey) -> Result<Vec<f64>, StoreError> {
        let rows = sqlx::query(
            "SELECT raw_value FROM investment_scoring.metric_readings WHERE metric_key = $1",
        )
        .bind(metric.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<f64, _>("raw_value").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_readings(&self, readings: &[MetricReading]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for reading in readings {
            let result = sqlx::query(
                r#"
                INSERT INTO investment_scoring.metric_readings
                (unit_code, metric_key, raw_value, source_id, observed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (unit_code, metric_key) DO UPDATE
                SET raw_value = EXCLUDED.raw_value,
                    source_id = EXCLUDED.source_id,
                    observed_at = EXCLUDED.observed_at
                WHERE investment_scoring.metric_readings.observed_at <= EXCLUDED.observed_at
                "#,
            )
            .bind(&reading.unit_code)
            .bind(reading.metric.as_str())
            .bind(reading.raw_value)
            .bind(&reading.source_id)
            .bind(reading.observed_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                written += 1;
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn load_baselines(&self) -> Result<Vec<MetricBaseline>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT metric_key, mean, stddev, sample_size, percentiles, computed_at
            FROM investment_scoring.metric_baselines
            ORDER BY metric_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut baselines = Vec::with_capacity(rows.len());
        for row in rows {
            let percentiles: Option<Json<Percentiles>> = row.try_get("percentiles")?;
            baselines.push(MetricBaseline {
                metric: parse_metric(&row)?,
                mean: row.try_get("mean")?,
                stddev: row.try_get("stddev")?,
                sample_size: row.try_get("sample_size")?,
                percentiles: percentiles.map(|json| json.0),
                computed_at: row.try_get("computed_at")?,
            });
        }
        Ok(baselines)
    }

    async fn save_baselines(&self, baselines: &[MetricBaseline]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for baseline in baselines {
            sqlx::query(
                r#"
                INSERT INTO investment_scoring.metric_baselines
                (metric_key, mean, stddev, sample_size, percentiles, computed_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (metric_key) DO UPDATE
                SET mean = EXCLUDED.mean,
                    stddev = EXCLUDED.stddev,
                    sample_size = EXCLUDED.sample_size,
                    percentiles = EXCLUDED.percentiles,
                    computed_at = EXCLUDED.computed_at
                "#,
            )
            .bind(baseline.metric.as_str())
            .bind(baseline.mean)
            .bind(baseline.stddev)
            .bind(baseline.sample_size)
            .bind(baseline.percentiles.map(Json))
            .bind(baseline.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_scores(&self, records: &[ScoreRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(UPSERT_SCORE_SQL)
            .bind(&record.unit_code)
            .bind(record.computed_at)
            .bind(record.overall_score)
            .bind(Json(&record.component_scores))
            .bind(record.confidence)
            .bind(record.coverage_fraction)
            .bind(Json(&record.insights))
            .bind(Json(&record.provenance))
            .bind(&record.profile_version)
            .bind(Json(&record.weights))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_score(&self, unit_code: &str) -> Result<Option<ScoreRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT unit_code, computed_at, overall_score, component_scores, confidence,
                   coverage_fraction, insights, provenance, profile_version, weights
            FROM investment_scoring.score_records
            WHERE unit_code = $1
            "#,
        )
        .bind(unit_code)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(score_from_row).transpose()
    }

    async fn load_checkpoint(&self, scope_key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT last_unit_code FROM investment_scoring.batch_checkpoints WHERE scope_key = $1",
        )
        .bind(scope_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.try_get("last_unit_code"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn save_checkpoint(
        &self,
        scope_key: &str,
        last_unit_code: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO investment_scoring.batch_checkpoints (scope_key, last_unit_code, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (scope_key) DO UPDATE
            SET last_unit_code = EXCLUDED.last_unit_code, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(scope_key)
        .bind(last_unit_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_checkpoint(&self, scope_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM investment_scoring.batch_checkpoints WHERE scope_key = $1")
            .bind(scope_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_run(&self, run: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO investment_scoring.batch_runs
            (id, scope_key, status, started_at, finished_at, processed, succeeded,
             failed, skipped, cancelled, failures)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                finished_at = EXCLUDED.finished_at,
                processed = EXCLUDED.processed,
                succeeded = EXCLUDED.succeeded,
                failed = EXCLUDED.failed,
                skipped = EXCLUDED.skipped,
                cancelled = EXCLUDED.cancelled,
                failures = EXCLUDED.failures
            "#,
        )
        .bind(run.id)
        .bind(run.scope.key())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(count(run.processed))
        .bind(count(run.succeeded))
        .bind(count(run.failed))
        .bind(count(run.skipped))
        .bind(run.cancelled)
        .bind(Json(&run.failures))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
