//! CLI output formatting for the `process` command.
//!
//! # Output Format
//!
//! ```text
//! 001 sunset.jpg → 3f2c9a0e5b7d4c1e8f6a2b9d0c3e7f1a
//!     Stored: images/original/2026/10/19/3f2c9a0e5b7d4c1e8f6a2b9d0c3e7f1a.jpg
//!     Thumbnail: ok
//!     Processed: failed
//!         images/processed/2026/10/19/3f2c…e7f1a.jpg (1024px): VipsForeignLoad: …
//!     HiRes: ok
//! 002 beach.png → 9b1d…
//!     Stored: …
//!     still running after 30s
//!
//! 2 pictures: 0 complete, 1 with failures, 1 timed out
//! Tasks: 6 started, 5 finished, 0 events dropped
//! ```
//!
//! # Architecture
//!
//! Each view has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure:
//! no I/O, no side effects.

use crate::pipeline::PipelineStats;
use crate::task::{TaskKind, VariantOutcome};
use crate::tracker::PictureOutcome;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// What happened to one file given to `process`.
#[derive(Debug, Clone, Serialize)]
pub struct PictureReport {
    pub source: PathBuf,
    pub key: String,
    /// Where the original was copied to.
    pub stored: PathBuf,
    /// `None` when the wait timed out; the tasks were still running.
    pub outcome: Option<PictureOutcome>,
}

impl PictureReport {
    pub fn succeeded(&self) -> bool {
        self.outcome
            .as_ref()
            .is_some_and(PictureOutcome::all_succeeded)
    }
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    pictures: &'a [PictureReport],
    stats: &'a PipelineStats,
}

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn variant_lines(kind: TaskKind, outcome: &VariantOutcome) -> Vec<String> {
    match outcome {
        VariantOutcome::Succeeded => vec![format!("{}{}: ok", indent(1), kind)],
        VariantOutcome::Abandoned => vec![format!("{}{}: abandoned", indent(1), kind)],
        VariantOutcome::Failed { failures } => {
            let mut lines = vec![format!("{}{}: failed", indent(1), kind)];
            for failure in failures {
                let detail = failure.detail.lines().next().unwrap_or_default();
                lines.push(format!(
                    "{}{} ({}px): {}",
                    indent(2),
                    failure.output.display(),
                    failure.max_dimension,
                    detail
                ));
            }
            lines
        }
    }
}

/// Format one picture: header, stored path, then a line per variant kind.
pub fn format_report(index: usize, report: &PictureReport, timeout: Duration) -> Vec<String> {
    let name = report
        .source
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| report.source.display().to_string());

    let mut lines = vec![
        format!("{} {} \u{2192} {}", format_index(index), name, report.key),
        format!("{}Stored: {}", indent(1), report.stored.display()),
    ];
    match &report.outcome {
        Some(outcome) => {
            for (kind, variant) in &outcome.variants {
                lines.extend(variant_lines(*kind, variant));
            }
        }
        None => lines.push(format!(
            "{}still running after {}s",
            indent(1),
            timeout.as_secs()
        )),
    }
    lines
}

/// Totals line plus pipeline counters.
pub fn format_summary(reports: &[PictureReport], stats: &PipelineStats) -> Vec<String> {
    let complete = reports.iter().filter(|r| r.succeeded()).count();
    let timed_out = reports.iter().filter(|r| r.outcome.is_none()).count();
    let failed = reports.len() - complete - timed_out;
    let noun = if reports.len() == 1 { "picture" } else { "pictures" };

    vec![
        format!(
            "{} {}: {} complete, {} with failures, {} timed out",
            reports.len(),
            noun,
            complete,
            failed,
            timed_out
        ),
        format!(
            "Tasks: {} started, {} finished, {} events dropped",
            stats.tasks_started, stats.tasks_finished, stats.events_dropped
        ),
    ]
}

pub fn format_json(reports: &[PictureReport], stats: &PipelineStats) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        pictures: reports,
        stats,
    })
}

pub fn print_reports(reports: &[PictureReport], stats: &PipelineStats, timeout: Duration) {
    for (i, report) in reports.iter().enumerate() {
        for line in format_report(i + 1, report, timeout) {
            println!("{}", line);
        }
    }
    println!();
    for line in format_summary(reports, stats) {
        println!("{}", line);
    }
}
