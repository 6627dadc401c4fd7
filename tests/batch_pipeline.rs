use std::fmt::Write;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use investment_score_engine::batch::{FailureKind, RunStatus};
use investment_score_engine::config::{BatchSettings, ScoringProfile};
use investment_score_engine::import::{read_readings, read_units};
use investment_score_engine::report::build_run_report;
use investment_score_engine::simulate::simulate;
use investment_score_engine::MetricKey;

fn settings() -> BatchSettings {
    BatchSettings {
        throttle: Duration::ZERO,
        commit_every: 7,
        max_retries: 1,
        retry_base_ms: 1,
        max_retry_delay: Duration::from_millis(2),
    }
}

/// A 6x6 grid of municipalities around Bologna plus one island with no data.
/// The first unit of every grid row lacks a seismic reading and must borrow
/// it from neighbours roughly 3 km away.
fn inputs() -> (String, String) {
    let mut units = String::from("code,name,kind,parent_code,latitude,longitude,population\n");
    let mut readings = String::from("unit_code,metric_key,raw_value,source_id,observed_at\n");

    for i in 0..36 {
        let code = format!("037{i:03}");
        let latitude = 44.3 + (i / 6) as f64 * 0.03;
        let longitude = 11.2 + (i % 6) as f64 * 0.04;
        let _ = writeln!(units, "{code},Comune {i},municipality,,{latitude},{longitude},{}", 2_000 + i * 150);

        let _ = writeln!(readings, "{code},price_trend,{},omi,2024-06-30", (i % 9) as f64 * 0.7 - 1.0);
        let _ = writeln!(readings, "{code},rental_yield,{},omi,2024-06-30", 3.0 + (i % 5) as f64 * 0.4);
        let _ = writeln!(readings, "{code},crime,{},istat,2024-03-31", 20.0 + (i % 7) as f64 * 6.0);
        let _ = writeln!(readings, "{code},air_quality,{},arpa,2024-05-01", 12.0 + (i % 4) as f64 * 3.5);
        if i % 6 != 0 {
            let _ = writeln!(readings, "{code},seismic,{},ingv,2023-01-01", 0.10 + (i % 6) as f64 * 0.02);
        }
    }
    let _ = writeln!(units, "090001,Isola,municipality,,40.9,8.7,300");

    (units, readings)
}

#[tokio::test]
async fn csv_inputs_score_end_to_end() {
    let (units_csv, readings_csv) = inputs();
    let units = read_units(units_csv.as_bytes()).unwrap();
    let readings = read_readings(readings_csv.as_bytes()).unwrap();
    let as_of = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();

    let simulation = simulate(units, readings, ScoringProfile::default(), settings(), as_of)
        .await
        .unwrap();
    let summary = &simulation.summary;

    assert_eq!(summary.status, RunStatus::PartiallyCompleted);
    assert_eq!(summary.processed, 37);
    assert_eq!(summary.succeeded, 36);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].unit_code, "090001");
    assert_eq!(summary.failures[0].kind, FailureKind::NoData);

    assert_eq!(simulation.payloads.len(), 36);
    for payload in &simulation.payloads {
        assert!((0.0..=10.0).contains(&payload.overall_score));
        assert!((0.0..=1.0).contains(&payload.confidence));
        assert!(payload.components.seismic.is_some(), "{} lacks seismic", payload.unit_code);
    }

    let gap = simulation
        .payloads
        .iter()
        .find(|payload| payload.unit_code == "037000")
        .unwrap();
    let measured = simulation
        .payloads
        .iter()
        .find(|payload| payload.unit_code == "037001")
        .unwrap();
    assert_eq!(gap.inferred, [MetricKey::Seismic]);
    assert!(measured.inferred.is_empty());
    assert!(gap.confidence < measured.confidence);

    let json = serde_json::to_value(gap).unwrap();
    assert_eq!(json["components"].as_object().unwrap().len(), 13);

    let report = build_run_report(summary);
    assert!(report.contains("- scored: 36"));
    assert!(report.contains("090001"));
}

#[tokio::test]
async fn identical_inputs_give_identical_payloads() {
    let (units_csv, readings_csv) = inputs();
    let as_of = Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let simulation = simulate(
            read_units(units_csv.as_bytes()).unwrap(),
            read_readings(readings_csv.as_bytes()).unwrap(),
            ScoringProfile::default(),
            settings(),
            as_of,
        )
        .await
        .unwrap();
        runs.push(simulation.payloads);
    }

    assert_eq!(runs[0], runs[1]);
}
