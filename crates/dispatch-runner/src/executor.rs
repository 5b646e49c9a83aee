//! Job execution seam and the process-backed executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use dispatch_core::{CacheKey, Job, PipelineType};
use tokio::process::Command;

use crate::commands::CommandTable;
use crate::error::JobError;

/// Everything an executor learns about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: String,
    pub event_id: String,
    pub git_ref: String,
    pub pipeline_id: String,
    pub pipeline_type: PipelineType,
    pub job: Job,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Component root inside the workspace.
    pub working_dir: PathBuf,
    /// Manual-dispatch inputs of the triggering event.
    pub inputs: BTreeMap<String, String>,
}

/// Successful attempt output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub logs: String,
    /// Reference to whatever the job produced (image, package, change set).
    pub artifact: Option<String>,
}

impl JobOutput {
    pub fn logs(logs: impl Into<String>) -> Self {
        Self {
            logs: logs.into(),
            artifact: None,
        }
    }
}

/// Runs one job attempt.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobError>;

    /// Warm the dependency cache for `key`. The runner guarantees at most one
    /// concurrent call per key.
    async fn prepare(&self, _key: &CacheKey, _ctx: &JobContext) -> Result<String, JobError> {
        Ok(String::new())
    }
}

/// Runs the stack command for each job as a child process.
pub struct CommandExecutor {
    table: CommandTable,
}

impl CommandExecutor {
    pub fn new(table: CommandTable) -> Self {
        Self { table }
    }

    fn command_for(&self, ctx: &JobContext) -> Result<&[String], JobError> {
        let stack = ctx.job.stack.as_deref().ok_or_else(|| {
            JobError::permanent(format!(
                "{} is stack-agnostic and has no {} command",
                ctx.job.id, ctx.job.kind
            ))
        })?;
        self.table.command(ctx.job.kind, stack).ok_or_else(|| {
            JobError::permanent(format!("no {} command for stack {stack}", ctx.job.kind))
        })
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(CommandTable::builtin())
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let command = self.command_for(ctx)?;
        run_command(command, &ctx.working_dir).await
    }

    async fn prepare(&self, key: &CacheKey, ctx: &JobContext) -> Result<String, JobError> {
        match self.table.install_command(&key.stack) {
            Some(command) => Ok(run_command(command, &ctx.working_dir).await?.logs),
            None => Ok(String::new()),
        }
    }
}

/// Spawn `command` in `dir` and classify the outcome.
///
/// Missing executables and non-zero exits are permanent; I/O errors while
/// waiting and termination by signal are transient.
pub async fn run_command(command: &[String], dir: &Path) -> Result<JobOutput, JobError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| JobError::permanent("empty command"))?;
    let shown = command.join(" ");

    let child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                JobError::permanent(format!("cannot start `{shown}`: {e}"))
            }
            _ => JobError::transient(format!("cannot start `{shown}`: {e}")),
        })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| JobError::transient(format!("waiting for `{shown}`: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let logs = format!("$ {shown}\n{stdout}{stderr}");

    match output.status.code() {
        Some(0) => Ok(JobOutput::logs(logs)),
        Some(code) => Err(JobError::permanent(format!(
            "`{shown}` exited with code {code}\n{}",
            tail(&stderr, 20)
        ))),
        None => Err(JobError::transient(format!("`{shown}` was terminated by a signal"))),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Succeeds without running anything, logging what would have run.
pub struct DryRunExecutor {
    table: CommandTable,
}

impl DryRunExecutor {
    pub fn new(table: CommandTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl JobExecutor for DryRunExecutor {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let command = ctx
            .job
            .stack
            .as_deref()
            .and_then(|stack| self.table.command(ctx.job.kind, stack))
            .map(|c| c.join(" "))
            .unwrap_or_else(|| format!("<{} {}>", ctx.job.kind, ctx.job.component_id));
        Ok(JobOutput::logs(format!(
            "would run in {}: {command}",
            ctx.working_dir.display()
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dispatch_core::{JobKind, JobStatus};
    use std::collections::BTreeSet;

    pub(crate) fn context(kind: JobKind, stack: Option<&str>, dir: &Path) -> JobContext {
        JobContext {
            run_id: "run-1".to_string(),
            event_id: "evt-1".to_string(),
            git_ref: "refs/heads/main".to_string(),
            pipeline_id: "ci".to_string(),
            pipeline_type: PipelineType::Ci,
            job: Job {
                id: "ci:svc:job".to_string(),
                name: "job".to_string(),
                pipeline_id: "ci".to_string(),
                template_id: "job".to_string(),
                component_id: "svc".to_string(),
                kind,
                stack: stack.map(str::to_string),
                environment: None,
                required: true,
                dependencies: BTreeSet::new(),
                shared_from: None,
                cache_key: None,
                status: JobStatus::Running,
                attempt_count: 1,
            },
            attempt: 1,
            working_dir: dir.to_path_buf(),
            inputs: BTreeMap::new(),
        }
    }

    fn shell(script: &str) -> CommandTable {
        CommandTable::empty().with_command(
            JobKind::Test,
            "sh",
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(shell("echo hello"));
        let output = executor
            .execute(&context(JobKind::Test, Some("sh"), dir.path()))
            .await
            .unwrap();
        assert!(output.logs.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_command_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(shell("echo boom >&2; exit 3"));
        let err = executor
            .execute(&context(JobKind::Test, Some("sh"), dir.path()))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("code 3"));
        assert!(err.message().contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let table = CommandTable::empty().with_command(
            JobKind::Build,
            "sh",
            vec!["definitely-not-a-real-binary-7f3a".to_string()],
        );
        let err = CommandExecutor::new(table)
            .execute(&context(JobKind::Build, Some("sh"), dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_stack_agnostic_job_has_no_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandExecutor::default()
            .execute(&context(JobKind::Deploy, None, dir.path()))
            .await
            .unwrap_err();
        assert!(err.message().contains("stack-agnostic"));
    }

    #[tokio::test]
    async fn test_dry_run_reports_command() {
        let dir = tempfile::tempdir().unwrap();
        let output = DryRunExecutor::new(CommandTable::builtin())
            .execute(&context(JobKind::Test, Some("go"), dir.path()))
            .await
            .unwrap();
        assert!(output.logs.contains("go test ./..."));
    }
}
