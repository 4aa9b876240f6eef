use dispatch_core::{Outcome, ReportHook, RunReport, RunSummary};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Serialize)]
struct SummaryFile<'a> {
    timestamp: String,
    summary: &'a RunSummary,
    results: &'a [Outcome],
}

/// Writes `summary.json` (every result), plus `failure_analysis.txt` and
/// `failed_requests.json` with full response bodies when something failed.
pub struct FileReportHook {
    dir: PathBuf,
}

impl FileReportHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ReportHook for FileReportHook {
    fn name(&self) -> &'static str {
        "files"
    }

    fn on_complete(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(&self.dir)?;

        let summary = SummaryFile {
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: &report.summary,
            results: &report.outcomes,
        };
        std::fs::write(self.dir.join("summary.json"), serde_json::to_string_pretty(&summary)?)?;

        if let Some(analysis) = &report.failure_report {
            std::fs::write(self.dir.join("failure_analysis.txt"), analysis)?;
            let failed: Vec<&Outcome> = report.failed_outcomes().collect();
            std::fs::write(
                self.dir.join("failed_requests.json"),
                serde_json::to_string_pretty(&failed)?,
            )?;
        }

        Ok(())
    }
}
