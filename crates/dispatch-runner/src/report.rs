//! Result aggregation and run reports (JSON and Markdown).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use dispatch_core::{Job, JobKind, JobStatus, PipelineType, Priority, RunResult, TrailEntry};
use serde::{Deserialize, Serialize};

use crate::error::RunnerResult;

/// Aggregated outcome of one pipeline (and, worst-first, of a whole run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Degraded,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    fn severity(self) -> u8 {
        match self {
            PipelineStatus::Success => 0,
            PipelineStatus::Degraded => 1,
            PipelineStatus::Cancelled => 2,
            PipelineStatus::Failed => 3,
        }
    }

    /// The more severe of the two: `Failed > Cancelled > Degraded > Success`.
    pub fn worst(self, other: PipelineStatus) -> PipelineStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Degraded => "degraded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub required: bool,
    pub status: JobStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_from: Option<String>,
}

impl JobReport {
    pub fn new(job: &Job, result: &RunResult) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            kind: job.kind,
            stack: job.stack.clone(),
            required: job.required,
            status: result.status,
            attempts: result.attempts,
            duration_ms: result.duration_ms,
            logs_ref: result.logs_ref.clone(),
            error: result.error.clone(),
            shared_from: result.shared_from.clone(),
        }
    }
}

/// Aggregate the terminal job states of one pipeline.
///
/// Required failures fail the pipeline; a required job cancelled before it
/// finished makes it `Cancelled`; a required job skipped behind a failure
/// counts as failed. A cancellation that lands before any required job
/// succeeded is `Cancelled` too, including pipelines with no required jobs.
/// Otherwise optional jobs that did not succeed only degrade it.
pub fn aggregate<'a, I>(pipeline_id: &str, jobs: I) -> PipelineStatus
where
    I: IntoIterator<Item = &'a JobReport>,
{
    let jobs: Vec<&JobReport> = jobs.into_iter().collect();
    let required = |status: JobStatus| jobs.iter().any(|j| j.required && j.status == status);

    let status = if required(JobStatus::Failed) {
        PipelineStatus::Failed
    } else if required(JobStatus::Cancelled) {
        PipelineStatus::Cancelled
    } else if required(JobStatus::Skipped) {
        PipelineStatus::Failed
    } else if jobs.iter().any(|j| j.status == JobStatus::Cancelled)
        && !required(JobStatus::Succeeded)
    {
        PipelineStatus::Cancelled
    } else if jobs
        .iter()
        .any(|j| !j.required && j.status != JobStatus::Succeeded)
    {
        PipelineStatus::Degraded
    } else {
        PipelineStatus::Success
    };
    tracing::debug!(pipeline_id = %pipeline_id, status = %status, jobs = jobs.len(), "pipeline aggregated");
    status
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub id: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    pub priority: Priority,
    pub reason: String,
    pub status: PipelineStatus,
    /// Job reports grouped by component id.
    pub components: BTreeMap<String, Vec<JobReport>>,
}

impl PipelineReport {
    pub fn jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.components.values().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub event_id: String,
    pub git_ref: String,
    pub status: PipelineStatus,
    /// The run was cancelled because a newer event targeted the same ref.
    pub superseded: bool,
    pub duration_ms: u64,
    pub pipelines: Vec<PipelineReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<TrailEntry>,
}

impl RunReport {
    /// Worst pipeline status; a run with no pipelines succeeds.
    pub fn overall(pipelines: &[PipelineReport]) -> PipelineStatus {
        pipelines
            .iter()
            .fold(PipelineStatus::Success, |acc, p| acc.worst(p.status))
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineReport> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.pipelines.iter().flat_map(|p| p.jobs()).find(|j| j.id == id)
    }

    pub fn job_count(&self) -> usize {
        self.pipelines.iter().map(|p| p.jobs().count()).sum()
    }

    pub fn with_trail(mut self, trail: Vec<TrailEntry>) -> Self {
        self.trail = trail;
        self
    }

    pub fn to_json_pretty(&self) -> RunnerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn status_mark(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "ok",
        JobStatus::Failed => "FAILED",
        JobStatus::Skipped => "skipped",
        JobStatus::Cancelled => "cancelled",
        JobStatus::Queued | JobStatus::Running | JobStatus::Retrying => "pending",
    }
}

/// Render the run report for PR comments and terminal output.
pub fn render_run_report_md(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run {}\n\n", report.run_id));
    out.push_str(&format!(
        "- event: `{}`\n- ref: `{}`\n- status: **{}**\n- duration: {} ms\n",
        report.event_id, report.git_ref, report.status, report.duration_ms
    ));
    if report.superseded {
        out.push_str("- superseded by a newer event on the same ref\n");
    }
    out.push('\n');

    if report.pipelines.is_empty() {
        out.push_str("No pipelines were selected.\n");
    }

    for pipeline in &report.pipelines {
        out.push_str(&format!(
            "## {} ({}, {}): {}\n\n",
            pipeline.id, pipeline.pipeline_type, pipeline.priority, pipeline.status
        ));
        out.push_str(&format!("{}\n\n", pipeline.reason));
        for (component, jobs) in &pipeline.components {
            out.push_str(&format!("### {component}\n"));
            for job in jobs {
                out.push_str(&format!(
                    "- `{}` {} ({} attempt(s), {} ms)",
                    job.name,
                    status_mark(job.status),
                    job.attempts,
                    job.duration_ms
                ));
                if !job.required {
                    out.push_str(" optional");
                }
                if let Some(owner) = &job.shared_from {
                    out.push_str(&format!(" shared from `{owner}`"));
                }
                out.push('\n');
                if let Some(error) = &job.error {
                    out.push_str(&format!("  - {}\n", error.lines().next().unwrap_or("")));
                }
            }
            out.push('\n');
        }
    }

    if !report.trail.is_empty() {
        out.push_str("## Dispatch trail\n");
        for entry in &report.trail {
            out.push_str(&format!("- {entry}\n"));
        }
    }
    out
}

pub fn write_run_report_json(path: &Path, report: &RunReport) -> RunnerResult<()> {
    std::fs::write(path, report.to_json_pretty()?)?;
    Ok(())
}

pub fn write_run_report_md(path: &Path, report: &RunReport) -> RunnerResult<()> {
    std::fs::write(path, render_run_report_md(report))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, required: bool, status: JobStatus) -> JobReport {
        JobReport {
            id: format!("ci:web:{name}"),
            name: name.to_string(),
            kind: JobKind::Test,
            stack: Some("node".to_string()),
            required,
            status,
            attempts: 1,
            duration_ms: 10,
            logs_ref: None,
            error: None,
            shared_from: None,
        }
    }

    #[test]
    fn test_required_failure_fails_pipeline() {
        let jobs = [
            job("build", true, JobStatus::Failed),
            job("deploy", true, JobStatus::Skipped),
        ];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Failed);
    }

    #[test]
    fn test_optional_failure_degrades() {
        let jobs = [
            job("test", true, JobStatus::Succeeded),
            job("e2e", false, JobStatus::Failed),
        ];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Degraded);
    }

    #[test]
    fn test_cancelled_required_job() {
        let jobs = [
            job("lint", true, JobStatus::Succeeded),
            job("test", true, JobStatus::Cancelled),
        ];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Cancelled);
    }

    #[test]
    fn test_failure_outranks_cancellation() {
        let jobs = [
            job("lint", true, JobStatus::Failed),
            job("test", true, JobStatus::Cancelled),
        ];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Failed);
    }

    #[test]
    fn test_optional_only_pipeline_cancelled_before_running() {
        let jobs = [
            job("e2e", false, JobStatus::Cancelled),
            job("perf", false, JobStatus::Cancelled),
        ];
        assert_eq!(aggregate("nightly", &jobs), PipelineStatus::Cancelled);
    }

    #[test]
    fn test_optional_cancelled_after_required_success_degrades() {
        let jobs = [
            job("test", true, JobStatus::Succeeded),
            job("e2e", false, JobStatus::Cancelled),
        ];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Degraded);
    }

    #[test]
    fn test_all_succeeded() {
        let jobs = [job("lint", true, JobStatus::Succeeded)];
        assert_eq!(aggregate("ci", &jobs), PipelineStatus::Success);
        assert_eq!(aggregate("ci", &[] as &[JobReport]), PipelineStatus::Success);
    }

    #[test]
    fn test_worst_ordering() {
        use PipelineStatus::*;
        assert_eq!(Success.worst(Degraded), Degraded);
        assert_eq!(Degraded.worst(Cancelled), Cancelled);
        assert_eq!(Failed.worst(Cancelled), Failed);
        assert_eq!(Cancelled.worst(Success), Cancelled);
    }

    fn report() -> RunReport {
        let mut components = BTreeMap::new();
        components.insert(
            "web".to_string(),
            vec![
                job("test-node", true, JobStatus::Succeeded),
                JobReport {
                    error: Some("`npm run build` exited with code 1\nstack".to_string()),
                    ..job("build-node", true, JobStatus::Failed)
                },
            ],
        );
        let pipeline = PipelineReport {
            id: "ci".to_string(),
            pipeline_type: PipelineType::Ci,
            priority: Priority::High,
            reason: "push on main matched trigger rule #0; 2 job(s) for web".to_string(),
            status: PipelineStatus::Failed,
            components,
        };
        let pipelines = vec![pipeline];
        RunReport {
            run_id: "run-1".to_string(),
            event_id: "evt-1".to_string(),
            git_ref: "refs/heads/main".to_string(),
            status: RunReport::overall(&pipelines),
            superseded: false,
            duration_ms: 1200,
            pipelines,
            trail: Vec::new(),
        }
    }

    #[test]
    fn test_run_report_lookup_and_overall() {
        let report = report();
        assert_eq!(report.status, PipelineStatus::Failed);
        assert_eq!(report.job_count(), 2);
        assert_eq!(
            report.job("ci:web:build-node").map(|j| j.status),
            Some(JobStatus::Failed)
        );
        assert!(report.pipeline("release").is_none());
    }

    #[test]
    fn test_markdown_render() {
        let md = render_run_report_md(&report());
        assert!(md.starts_with("# Run run-1\n"));
        assert!(md.contains("- status: **failed**"));
        assert!(md.contains("## ci (ci, high): failed"));
        assert!(md.contains("### web\n"));
        assert!(md.contains("- `build-node` FAILED"));
        assert!(md.contains("  - `npm run build` exited with code 1\n"));
        assert!(!md.contains("Dispatch trail"));
    }

    #[test]
    fn test_json_shape() {
        let value: serde_json::Value =
            serde_json::from_str(&report().to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["pipelines"][0]["type"], "ci");
        assert_eq!(value["pipelines"][0]["components"]["web"][1]["status"], "failed");
        assert!(value.get("trail").is_none());
    }

    #[test]
    fn test_write_report_files() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("report.json");
        let md = dir.path().join("report.md");
        write_run_report_json(&json, &report()).unwrap();
        write_run_report_md(&md, &report()).unwrap();
        let back: RunReport =
            serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(back, report());
        assert!(std::fs::read_to_string(md).unwrap().contains("build-node"));
    }
}
