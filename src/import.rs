//! Flat CSV inputs for units, readings and reference stations.

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::fallback::ReferencePoint;
use crate::metrics::MetricKey;
use crate::models::{Coordinate, GeographicUnit, MetricReading, UnitKind};

#[derive(Debug, Deserialize)]
struct UnitRow {
    code: String,
    name: String,
    kind: String,
    parent_code: Option<String>,
    latitude: f64,
    longitude: f64,
    population: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReadingRow {
    unit_code: String,
    metric_key: String,
    raw_value: f64,
    source_id: String,
    observed_at: String,
}

pub fn read_units<R: Read>(input: R) -> anyhow::Result<Vec<GeographicUnit>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut units = Vec::new();

    for (index, result) in reader.deserialize::<UnitRow>().enumerate() {
        let row = result.with_context(|| format!("unit row {}", index + 1))?;
        let kind: UnitKind = row
            .kind
            .parse()
            .map_err(|message: String| anyhow!("unit row {}: {message}", index + 1))?;
        units.push(GeographicUnit {
            code: row.code,
            name: row.name,
            kind,
            parent_code: row.parent_code.filter(|code| !code.trim().is_empty()),
            centroid: Coordinate::new(row.latitude, row.longitude),
            polygon: None,
            population: row.population,
        });
    }

    Ok(units)
}

pub fn read_readings<R: Read>(input: R) -> anyhow::Result<Vec<MetricReading>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut readings = Vec::new();

    for (index, result) in reader.deserialize::<ReadingRow>().enumerate() {
        let row = result.with_context(|| format!("reading row {}", index + 1))?;
        let metric: MetricKey = row
            .metric_key
            .parse()
            .with_context(|| format!("reading row {}", index + 1))?;
        let observed_at = parse_timestamp(&row.observed_at)
            .with_context(|| format!("reading row {}: bad observed_at", index + 1))?;
        readings.push(MetricReading {
            unit_code: row.unit_code,
            metric,
            raw_value: row.raw_value,
            source_id: row.source_id,
            observed_at,
        });
    }

    Ok(readings)
}

pub fn read_stations<R: Read>(input: R) -> anyhow::Result<Vec<ReferencePoint>> {
    let mut reader = csv::Reader::from_reader(input);
    reader
        .deserialize::<ReferencePoint>()
        .enumerate()
        .map(|(index, result)| result.with_context(|| format!("station row {}", index + 1)))
        .collect()
}

pub fn read_units_csv(path: &Path) -> anyhow::Result<Vec<GeographicUnit>> {
    read_units(open(path)?)
}

pub fn read_readings_csv(path: &Path) -> anyhow::Result<Vec<MetricReading>> {
    read_readings(open(path)?)
}

pub fn read_stations_csv(path: &Path) -> anyhow::Result<Vec<ReferencePoint>> {
    read_stations(open(path)?)
}

fn open(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))
}

/// RFC 3339 timestamps, or bare dates taken as midnight UTC.
fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("invalid date {value}"))
}
