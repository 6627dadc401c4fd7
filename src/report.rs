use std::collections::BTreeMap;
use std::fmt::Write;

use crate::batch::{FailureKind, RunSummary, ScoredUnit, UnitFailure};

/// Failure counts keyed by reason, most frequent first.
pub fn summarize_failures(failures: &[UnitFailure]) -> Vec<(String, usize)> {
    let mut map: BTreeMap<&str, usize> = BTreeMap::new();
    for failure in failures {
        *map.entry(failure.reason_class()).or_insert(0) += 1;
    }

    let mut summaries: Vec<(String, usize)> = map
        .into_iter()
        .map(|(reason, count)| (reason.to_string(), count))
        .collect();
    summaries.sort_by(|a, b| b.1.cmp(&a.1));
    summaries
}

impl UnitFailure {
    fn reason_class(&self) -> &str {
        match self.kind {
            FailureKind::NoData => "no scorable components",
            FailureKind::Error => self.reason.as_str(),
        }
    }
}

pub fn build_run_report(summary: &RunSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Investment Score Run Report");
    let _ = writeln!(
        output,
        "Run {} over {} as of {} ({})",
        summary.id,
        summary.scope,
        summary.as_of.format("%Y-%m-%d %H:%M UTC"),
        summary.status.as_str()
    );
    if let Some(after) = &summary.resumed_after {
        let _ = writeln!(output, "Resumed after unit {after}.");
    }
    if summary.cancelled {
        let _ = writeln!(output, "Run was cancelled before covering the whole scope.");
    }
    if let Some(fatal) = &summary.fatal_error {
        let _ = writeln!(output, "Run aborted: {fatal}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Totals");
    let _ = writeln!(output, "- processed: {}", summary.processed);
    let _ = writeln!(output, "- scored: {}", summary.succeeded);
    let _ = writeln!(output, "- failed: {}", summary.failed);
    let _ = writeln!(output, "- skipped (no data): {}", summary.skipped);
    let _ = writeln!(output, "- elapsed: {:.1}s", summary.elapsed.as_secs_f64());

    if !summary.baseline_warnings.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Baseline Warnings");
        for warning in &summary.baseline_warnings {
            let _ = writeln!(output, "- {warning}");
        }
    }

    let mut ranked: Vec<&ScoredUnit> = summary.scored.iter().collect();
    ranked.sort_by(|a, b| {
        b.overall_score
            .total_cmp(&a.overall_score)
            .then_with(|| a.unit_code.cmp(&b.unit_code))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Scoring Units");
    if ranked.is_empty() {
        let _ = writeln!(output, "No units scored in this run.");
    } else {
        for unit in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} score {:.2} (confidence {:.2})",
                unit.unit_code, unit.overall_score, unit.confidence
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Lowest Scoring Units");
    if ranked.is_empty() {
        let _ = writeln!(output, "No units scored in this run.");
    } else {
        for unit in ranked.iter().rev().take(5) {
            let _ = writeln!(
                output,
                "- {} score {:.2} (confidence {:.2})",
                unit.unit_code, unit.overall_score, unit.confidence
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Failures");
    if summary.failures.is_empty() {
        let _ = writeln!(output, "No unit failures.");
    } else {
        for (reason, count) in summarize_failures(&summary.failures) {
            let _ = writeln!(output, "- {count} x {reason}");
        }
        let _ = writeln!(output);
        for failure in summary.failures.iter().take(20) {
            let _ = writeln!(output, "- {}: {}", failure.unit_code, failure.reason);
        }
        if summary.failures.len() > 20 {
            let _ = writeln!(output, "- ... and {} more", summary.failures.len() - 20);
        }
    }

    output
}
