//! Aggregation of a finished run: the [`RunSummary`] and the failure
//! analysis text.

use crate::outcome::{ErrorKind, Outcome};
use crate::stats::LatencyHistogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Longest error detail shown in a failure sample.
const SAMPLE_DETAIL_CHARS: usize = 200;

/// Why admission stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Every task the source could produce was admitted
    Exhausted,
    /// The time budget closed admission
    TimeLimit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    pub transport: u64,
    pub status: u64,
    pub decode: u64,
    pub upstream_semantic: u64,
}

impl KindCounts {
    pub fn get(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::None => 0,
            ErrorKind::Transport => self.transport,
            ErrorKind::Status => self.status,
            ErrorKind::Decode => self.decode,
            ErrorKind::UpstreamSemantic => self.upstream_semantic,
        }
    }

    fn add(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::None => {}
            ErrorKind::Transport => self.transport += 1,
            ErrorKind::Status => self.status += 1,
            ErrorKind::Decode => self.decode += 1,
            ErrorKind::UpstreamSemantic => self.upstream_semantic += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Tasks the source would have produced
    pub planned: u64,
    /// Tasks admitted for execution
    pub submitted: u64,
    /// Outcomes collected
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub errors: KindCounts,
    pub mean_elapsed_ms: f64,
    pub max_elapsed_ms: u64,
    pub total_elapsed_ms: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub wall_clock_ms: u64,
    /// Processed outcomes per wall-clock second
    pub throughput_per_sec: f64,
    pub termination: Termination,
    pub time_limit_reached: bool,
}

impl RunSummary {
    /// Pure aggregation: the same inputs always give the same summary,
    /// whatever order the outcomes completed in.
    pub fn from_outcomes(
        planned: u64,
        submitted: u64,
        outcomes: &[Outcome],
        wall_clock: Duration,
        termination: Termination,
    ) -> Self {
        let mut errors = KindCounts::default();
        let mut latency = LatencyHistogram::new();
        let mut successful = 0u64;

        for outcome in outcomes {
            if outcome.is_success() {
                successful += 1;
            } else {
                errors.add(outcome.error_kind());
            }
            latency.record(outcome.elapsed());
        }

        let processed = outcomes.len() as u64;
        let wall_clock_ms = wall_clock.as_millis() as u64;
        let throughput_per_sec = if wall_clock.is_zero() {
            0.0
        } else {
            processed as f64 / wall_clock.as_secs_f64()
        };

        Self {
            planned,
            submitted,
            processed,
            successful,
            failed: processed - successful,
            errors,
            mean_elapsed_ms: latency.mean_ms(),
            max_elapsed_ms: latency.max_ms(),
            total_elapsed_ms: latency.total_ms(),
            latency_p50_ms: latency.percentile(50),
            latency_p95_ms: latency.percentile(95),
            latency_p99_ms: latency.percentile(99),
            wall_clock_ms,
            throughput_per_sec,
            termination,
            time_limit_reached: termination == Termination::TimeLimit,
        }
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Outcomes in completion order
    pub outcomes: Vec<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_report: Option<String>,
}

impl RunReport {
    pub fn failed_outcomes(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

/// Receives the finished report. Errors are logged by the dispatcher and
/// never fail the run.
pub trait ReportHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_complete(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Grouped, sampled description of the failures, or `None` if nothing failed.
pub fn failure_report(outcomes: &[Outcome], max_samples: usize) -> Option<String> {
    let failed: Vec<&Outcome> = outcomes.iter().filter(|o| !o.is_success()).collect();
    if failed.is_empty() {
        return None;
    }

    let mut by_kind: BTreeMap<ErrorKind, Vec<&Outcome>> = BTreeMap::new();
    let mut by_status: BTreeMap<u16, u64> = BTreeMap::new();
    for outcome in &failed {
        by_kind.entry(outcome.error_kind()).or_default().push(outcome);
        if let Some(status) = outcome.status_code() {
            *by_status.entry(status).or_default() += 1;
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "=== Failure Analysis Report ===");
    let _ = writeln!(out, "Total failed requests: {}", failed.len());

    for (kind, group) in &by_kind {
        let _ = writeln!(out);
        let _ = writeln!(out, "=== {} ({} occurrences) ===", kind, group.len());
        for (i, outcome) in group.iter().take(max_samples).enumerate() {
            let _ = write!(out, "#{} task {}", i + 1, outcome.task_id());
            if let Some(status) = outcome.status_code() {
                let _ = write!(out, " status {status}");
            }
            let _ = write!(out, " ({}ms)", outcome.elapsed().as_millis());
            if let Some(detail) = outcome.error_detail() {
                let _ = write!(out, ": {}", truncate(detail, SAMPLE_DETAIL_CHARS));
            }
            let _ = writeln!(out);
        }
        if group.len() > max_samples {
            let _ = writeln!(out, "... {} more", group.len() - max_samples);
        }
    }

    if !by_status.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "=== Status Codes ===");
        for (status, count) in &by_status {
            let _ = writeln!(out, "- Status {status}: {count} occurrences");
        }
    }

    Some(out)
}

/// Cut `s` to at most `max_chars` characters, marking the cut with "...".
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
