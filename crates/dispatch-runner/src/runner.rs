//! Executes the job graph of a dispatch decision.
//!
//! A single coordinator owns every job's state machine. Each runnable job is
//! handed to a worker task that waits for a concurrency permit, runs the
//! attempts (with cache warm-up, per-attempt timeout and backoff between
//! transient failures) and reports progress back over a channel. The
//! coordinator applies the transitions, journals them to the run ledger and
//! releases dependents as their dependencies succeed.
//!
//! Cancellation arrives through a `watch` channel. Queued jobs are cancelled
//! at once; running jobs get the configured grace period to finish.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dispatch_core::obs::{
    emit_job_retry, emit_job_transition, emit_ledger_error, emit_run_finished, emit_run_started,
};
use dispatch_core::{
    DispatchConfig, DispatchDecision, Event, JobGraph, JobStatus, PipelineType, RunResult,
    RunnerSettings, METRICS,
};
use dispatch_state::{LogStore, RunEvent, RunId, RunLedger, RunMetadata, RunSummary};
use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::audit::JOB_TRANSITION;
use crate::cache::BuildCache;
use crate::error::{JobError, RunnerResult};
use crate::executor::{JobContext, JobExecutor, JobOutput};
use crate::report::{aggregate, JobReport, PipelineReport, PipelineStatus, RunReport};
use crate::retry::RetryPolicy;

pub struct PipelineRunner {
    settings: RunnerSettings,
    retry: RetryPolicy,
    executor: Arc<dyn JobExecutor>,
    ledger: Arc<dyn RunLedger>,
    logs: Arc<dyn LogStore>,
    cache: Arc<BuildCache>,
    workspace: PathBuf,
    component_roots: HashMap<String, PathBuf>,
}

impl PipelineRunner {
    pub fn new(
        settings: RunnerSettings,
        executor: Arc<dyn JobExecutor>,
        ledger: Arc<dyn RunLedger>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_settings(&settings),
            settings,
            executor,
            ledger,
            logs,
            cache: Arc::new(BuildCache::new()),
            workspace: PathBuf::from("."),
            component_roots: HashMap::new(),
        }
    }

    /// Run jobs inside `workspace`, each in its component's root directory.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>, config: &DispatchConfig) -> Self {
        let workspace = workspace.into();
        self.component_roots = config
            .components
            .iter()
            .map(|c| (c.id.clone(), workspace.join(c.root_dir())))
            .collect();
        self.workspace = workspace;
        self
    }

    /// Share a build cache across runners.
    pub fn with_cache(mut self, cache: Arc<BuildCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Execute every job of `decision` and aggregate the results.
    ///
    /// Job failures never surface as `Err`; they are part of the report.
    /// Errors are reserved for a decision whose jobs do not form a valid
    /// graph, or for a broken job state machine.
    pub async fn run(
        &self,
        event: &Event,
        decision: &DispatchDecision,
        cancel: watch::Receiver<bool>,
    ) -> RunnerResult<RunReport> {
        let span = tracing::info_span!("run", event_id = %event.id(), git_ref = %event.git_ref());
        self.execute(event, decision, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        event: &Event,
        decision: &DispatchDecision,
        cancel: watch::Receiver<bool>,
    ) -> RunnerResult<RunReport> {
        let started = Instant::now();

        let mut jobs = Vec::with_capacity(decision.job_count());
        let mut pipeline_types = HashMap::new();
        for pipeline in &decision.selected_pipelines {
            pipeline_types.insert(pipeline.pipeline_id.clone(), pipeline.pipeline_type);
            jobs.extend(pipeline.instantiate_jobs());
        }
        let graph = JobGraph::build(jobs)?;

        let metadata = RunMetadata {
            event_id: event.id().to_string(),
            git_ref: event.git_ref().to_string(),
            actor: event.actor().to_string(),
            tags: json!({
                "event_type": event.event_type().as_str(),
                "pipelines": decision.pipeline_ids(),
            }),
        };
        let run_id = match self.ledger.create_run(metadata).await {
            Ok(id) => id,
            Err(err) => {
                let id = RunId::new();
                emit_ledger_error(&id.0, &err);
                id
            }
        };
        emit_run_started(&run_id.0, event.id(), event.git_ref(), graph.len());

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Worker {
            executor: Arc::clone(&self.executor),
            cache: Arc::clone(&self.cache),
            permits: Arc::new(Semaphore::new(self.settings.max_concurrency.max(1))),
            retry: self.retry,
            timeout: self.settings.job_timeout(),
            grace: self.settings.cancel_grace(),
            progress: progress_tx,
        });

        let context = ContextSource {
            event_id: event.id().to_string(),
            git_ref: event.git_ref().to_string(),
            inputs: event.inputs().clone(),
            pipeline_types,
            workspace: self.workspace.clone(),
            component_roots: self.component_roots.clone(),
        };
        let mut coordinator = Coordinator::new(
            graph,
            Journal::new(Arc::clone(&self.ledger), run_id),
            Arc::clone(&self.logs),
            worker,
            progress_rx,
            cancel,
            context,
        );
        coordinator.drive().await?;
        Ok(coordinator.finish(event, decision, started.elapsed()).await)
    }
}

/// Ordered writer of run ledger events. Ledger failures are logged and
/// never stop the run.
struct Journal {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
}

impl Journal {
    fn new(ledger: Arc<dyn RunLedger>, run_id: RunId) -> Self {
        Self {
            ledger,
            run_id,
            seq: 0,
        }
    }

    async fn record(&mut self, kind: &str, payload: serde_json::Value) {
        self.seq += 1;
        let event = RunEvent {
            seq: self.seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.ledger.append_event(&self.run_id, event).await {
            emit_ledger_error(&self.run_id.0, &err);
        }
    }

    async fn close(&self, status: PipelineStatus, summary: RunSummary) {
        let result = match status {
            PipelineStatus::Success | PipelineStatus::Degraded => {
                self.ledger.complete_run(&self.run_id, summary).await
            }
            PipelineStatus::Failed => self.ledger.fail_run(&self.run_id, summary).await,
            PipelineStatus::Cancelled => self.ledger.cancel_run(&self.run_id, summary).await,
        };
        if let Err(err) = result {
            emit_ledger_error(&self.run_id.0, &err);
        }
    }
}

/// Event data every job context is built from.
struct ContextSource {
    event_id: String,
    git_ref: String,
    inputs: BTreeMap<String, String>,
    pipeline_types: HashMap<String, PipelineType>,
    workspace: PathBuf,
    component_roots: HashMap<String, PathBuf>,
}

enum Progress {
    Started {
        idx: usize,
        attempt: u32,
    },
    Retrying {
        idx: usize,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Finished {
        idx: usize,
        outcome: Outcome,
    },
}

enum Outcome {
    Succeeded { logs: String },
    Failed { logs: String, error: String },
    Cancelled { logs: String },
}

impl Outcome {
    fn into_parts(self) -> (JobStatus, String, Option<String>) {
        match self {
            Outcome::Succeeded { logs } => (JobStatus::Succeeded, logs, None),
            Outcome::Failed { logs, error } => (JobStatus::Failed, logs, Some(error)),
            Outcome::Cancelled { logs } => (
                JobStatus::Cancelled,
                logs,
                Some("cancelled".to_string()),
            ),
        }
    }
}

/// Resolves once `rx` carries `true`. Never resolves if the sender is gone
/// without having cancelled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancel| *cancel).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Shared by every job task of one run.
struct Worker {
    executor: Arc<dyn JobExecutor>,
    cache: Arc<BuildCache>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
    grace: Duration,
    progress: mpsc::UnboundedSender<Progress>,
}

impl Worker {
    async fn drive(self: Arc<Self>, idx: usize, mut ctx: JobContext, mut cancel: watch::Receiver<bool>) {
        let outcome = self.attempts(idx, &mut ctx, &mut cancel).await;
        let _ = self.progress.send(Progress::Finished { idx, outcome });
    }

    async fn attempts(
        &self,
        idx: usize,
        ctx: &mut JobContext,
        cancel: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = cancelled(cancel) => None,
        };
        let stop = *cancel.borrow();
        let Some(_permit) = permit.filter(|_| !stop) else {
            return Outcome::Cancelled {
                logs: String::new(),
            };
        };

        let mut logs = String::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.attempt = attempt;
            let _ = self.progress.send(Progress::Started { idx, attempt });

            let work = self.attempt(ctx);
            tokio::pin!(work);
            let result = tokio::select! {
                result = &mut work => result,
                _ = cancelled(cancel) => {
                    match tokio::time::timeout(self.grace, &mut work).await {
                        Ok(result) => result,
                        Err(_) => {
                            logs.push_str(&format!(
                                "attempt {attempt}: cancelled after {}s grace period\n",
                                self.grace.as_secs()
                            ));
                            return Outcome::Cancelled { logs };
                        }
                    }
                }
            };

            let err = match result {
                Ok(output) => {
                    logs.push_str(&output.logs);
                    return Outcome::Succeeded { logs };
                }
                Err(err) => err,
            };
            logs.push_str(&format!("attempt {attempt}: {err}\n"));

            let stop = *cancel.borrow();
            if !err.is_transient() {
                return Outcome::Failed {
                    logs,
                    error: err.message().to_string(),
                };
            }
            if stop {
                return Outcome::Cancelled { logs };
            }
            if !self.retry.allows_retry(attempt) {
                return Outcome::Failed {
                    logs,
                    error: format!(
                        "{} (gave up after {attempt} attempt(s))",
                        err.message()
                    ),
                };
            }

            let delay = self.retry.delay_for(attempt);
            let _ = self.progress.send(Progress::Retrying {
                idx,
                attempt,
                delay,
                error: err.message().to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel) => return Outcome::Cancelled { logs },
            }
        }
    }

    /// One attempt: warm the dependency cache, then execute under the
    /// per-attempt timeout.
    async fn attempt(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        if let Some(key) = &ctx.job.cache_key {
            let executor = Arc::clone(&self.executor);
            let owned_key = key.clone();
            let owned_ctx = ctx.clone();
            self.cache
                .get_or_populate(key, move || async move {
                    executor.prepare(&owned_key, &owned_ctx).await
                })
                .await?;
        }

        match tokio::time::timeout(self.timeout, self.executor.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::transient(format!(
                "timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Owns the job state machines of one run.
struct Coordinator {
    graph: JobGraph,
    journal: Journal,
    worker: Arc<Worker>,
    progress: mpsc::UnboundedReceiver<Progress>,
    cancel: watch::Receiver<bool>,
    context: ContextSource,
    logs: Arc<dyn LogStore>,
    tasks: JoinSet<()>,
    results: Vec<RunResult>,
    started: Vec<Option<Instant>>,
    /// Dependencies of each job that have not succeeded yet.
    unmet: Vec<usize>,
    /// Execution owner of each shared job, when that owner is in this run.
    owner: Vec<Option<usize>>,
    /// Shared jobs waiting for their owner to finish.
    waiting: HashMap<usize, Vec<usize>>,
    ready: VecDeque<usize>,
    settled: VecDeque<usize>,
    remaining: usize,
    cancelling: bool,
}

impl Coordinator {
    fn new(
        graph: JobGraph,
        journal: Journal,
        logs: Arc<dyn LogStore>,
        worker: Arc<Worker>,
        progress: mpsc::UnboundedReceiver<Progress>,
        cancel: watch::Receiver<bool>,
        context: ContextSource,
    ) -> Self {
        let n = graph.len();
        let results = graph
            .jobs()
            .iter()
            .map(|j| RunResult::new(j.id.clone(), JobStatus::Queued))
            .collect();
        let unmet = (0..n).map(|i| graph.dependencies(i).count()).collect();
        let owner = graph
            .jobs()
            .iter()
            .map(|j| j.shared_from.as_deref().and_then(|id| graph.index_of(id)))
            .collect();
        let ready = graph.roots().into_iter().collect();
        Self {
            graph,
            journal,
            worker,
            progress,
            cancel,
            context,
            logs,
            tasks: JoinSet::new(),
            results,
            started: vec![None; n],
            unmet,
            owner,
            waiting: HashMap::new(),
            ready,
            settled: VecDeque::new(),
            remaining: n,
            cancelling: false,
        }
    }

    async fn drive(&mut self) -> RunnerResult<()> {
        let already = *self.cancel.borrow_and_update();
        if already {
            self.cancel_queued().await?;
        }
        self.process().await?;

        let mut watching = true;
        while self.remaining > 0 {
            tokio::select! {
                Some(progress) = self.progress.recv() => self.on_progress(progress).await?,
                changed = self.cancel.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let cancel = *self.cancel.borrow_and_update();
                    if cancel {
                        self.cancel_queued().await?;
                    }
                }
                else => break,
            }
        }

        self.tasks.shutdown().await;
        Ok(())
    }

    async fn on_progress(&mut self, progress: Progress) -> RunnerResult<()> {
        match progress {
            Progress::Started { idx, attempt } => {
                if self.graph.job(idx).status.is_terminal() {
                    return Ok(());
                }
                self.started[idx].get_or_insert_with(Instant::now);
                self.transition(idx, JobStatus::Running).await?;
                tracing::debug!(job_id = %self.graph.job(idx).id, attempt, "attempt started");
            }
            Progress::Retrying {
                idx,
                attempt,
                delay,
                error,
            } => {
                if self.graph.job(idx).status != JobStatus::Running {
                    return Ok(());
                }
                self.transition(idx, JobStatus::Retrying).await?;
                emit_job_retry(
                    &self.journal.run_id.0,
                    &self.graph.job(idx).id,
                    attempt,
                    delay.as_millis() as u64,
                    &error,
                );
                METRICS.inc_retries();
            }
            Progress::Finished { idx, outcome } => {
                if self.graph.job(idx).status.is_terminal() {
                    return Ok(());
                }
                let (status, logs, error) = outcome.into_parts();
                self.transition(idx, status).await?;
                if self.graph.job(idx).attempt_count > 0 {
                    METRICS.inc_jobs_executed();
                }

                let job = self.graph.job(idx);
                let result = RunResult {
                    job_id: job.id.clone(),
                    status,
                    duration_ms: self.started[idx]
                        .map(|t| t.elapsed().as_millis() as u64)
                        .unwrap_or(0),
                    attempts: job.attempt_count,
                    logs_ref: self.store_logs(&logs).await,
                    error,
                    shared_from: None,
                };
                self.conclude(idx, result);

                if status == JobStatus::Cancelled {
                    self.cancel_queued().await?;
                }
                self.process().await?;
            }
        }
        Ok(())
    }

    /// Drain the settled and ready queues until nothing more can move.
    async fn process(&mut self) -> RunnerResult<()> {
        loop {
            if let Some(idx) = self.settled.pop_front() {
                self.after_terminal(idx).await?;
            } else if let Some(idx) = self.ready.pop_front() {
                self.schedule(idx).await?;
            } else {
                return Ok(());
            }
        }
    }

    async fn after_terminal(&mut self, idx: usize) -> RunnerResult<()> {
        if let Some(shared) = self.waiting.remove(&idx) {
            self.ready.extend(shared);
        }

        let status = self.graph.job(idx).status;
        match status {
            JobStatus::Succeeded => {
                let dependents: Vec<usize> = self.graph.dependents(idx).collect();
                for dep in dependents {
                    self.unmet[dep] -= 1;
                    if self.unmet[dep] == 0 {
                        self.ready.push_back(dep);
                    }
                }
            }
            JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled => {
                let follow = if status == JobStatus::Cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Skipped
                };
                let reason = format!("dependency {} {}", self.graph.job(idx).id, status);
                for dep in self.graph.transitive_dependents(idx) {
                    if self.graph.job(dep).status == JobStatus::Queued {
                        self.abandon(dep, follow, reason.clone()).await?;
                    }
                }
            }
            JobStatus::Queued | JobStatus::Running | JobStatus::Retrying => {}
        }
        Ok(())
    }

    async fn schedule(&mut self, idx: usize) -> RunnerResult<()> {
        if self.graph.job(idx).status != JobStatus::Queued {
            return Ok(());
        }

        if let Some(owner) = self.owner[idx] {
            if self.graph.job(owner).status.is_terminal() {
                self.mirror(idx, owner).await?;
            } else {
                self.waiting.entry(owner).or_default().push(idx);
            }
            return Ok(());
        }

        let ctx = self.job_context(idx);
        let worker = Arc::clone(&self.worker);
        self.tasks.spawn(worker.drive(idx, ctx, self.cancel.clone()));
        Ok(())
    }

    /// Give a shared job the terminal outcome of the job it reuses.
    async fn mirror(&mut self, idx: usize, owner: usize) -> RunnerResult<()> {
        let owned = self.results[owner].clone();
        match owned.status {
            JobStatus::Succeeded | JobStatus::Failed => {
                self.transition(idx, JobStatus::Running).await?;
                self.transition(idx, owned.status).await?;
            }
            other => self.transition(idx, other).await?,
        }
        let job = self.graph.job_mut(idx);
        job.attempt_count = owned.attempts;
        let result = RunResult {
            job_id: job.id.clone(),
            shared_from: Some(owned.job_id.clone()),
            ..owned
        };
        self.conclude(idx, result);
        Ok(())
    }

    /// Finish a job that never ran.
    async fn abandon(&mut self, idx: usize, status: JobStatus, reason: String) -> RunnerResult<()> {
        self.transition(idx, status).await?;
        let mut result = RunResult::new(self.graph.job(idx).id.clone(), status);
        result.error = Some(reason);
        self.conclude(idx, result);
        Ok(())
    }

    /// Cancel every job that has not started. Running jobs are left to their
    /// workers, which observe the same signal.
    async fn cancel_queued(&mut self) -> RunnerResult<()> {
        if self.cancelling {
            return Ok(());
        }
        self.cancelling = true;
        for idx in 0..self.graph.len() {
            if self.graph.job(idx).status == JobStatus::Queued {
                self.abandon(idx, JobStatus::Cancelled, "superseded".to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn transition(&mut self, idx: usize, next: JobStatus) -> RunnerResult<()> {
        let job = self.graph.job_mut(idx);
        let from = job.status;
        job.transition(next)?;
        let job_id = job.id.clone();
        let attempt = job.attempt_count;

        emit_job_transition(
            &self.journal.run_id.0,
            &job_id,
            from.as_str(),
            next.as_str(),
            attempt,
        );
        self.journal
            .record(
                JOB_TRANSITION,
                json!({ "job_id": job_id, "from": from, "to": next, "attempt": attempt }),
            )
            .await;
        Ok(())
    }

    fn conclude(&mut self, idx: usize, result: RunResult) {
        self.results[idx] = result;
        self.remaining -= 1;
        self.settled.push_back(idx);
    }

    async fn store_logs(&self, logs: &str) -> Option<String> {
        if logs.is_empty() {
            return None;
        }
        match self.logs.put(logs.as_bytes()).await {
            Ok(digest) => Some(digest.as_str().to_string()),
            Err(err) => {
                emit_ledger_error(&self.journal.run_id.0, &err);
                None
            }
        }
    }

    fn job_context(&self, idx: usize) -> JobContext {
        let job = self.graph.job(idx).clone();
        let source = &self.context;
        JobContext {
            run_id: self.journal.run_id.0.clone(),
            event_id: source.event_id.clone(),
            git_ref: source.git_ref.clone(),
            pipeline_id: job.pipeline_id.clone(),
            pipeline_type: source
                .pipeline_types
                .get(&job.pipeline_id)
                .copied()
                .unwrap_or(PipelineType::Ci),
            working_dir: source
                .component_roots
                .get(&job.component_id)
                .cloned()
                .unwrap_or_else(|| source.workspace.clone()),
            inputs: source.inputs.clone(),
            attempt: 0,
            job,
        }
    }

    async fn finish(
        mut self,
        event: &Event,
        decision: &DispatchDecision,
        elapsed: Duration,
    ) -> RunReport {
        let mut pipelines = Vec::with_capacity(decision.selected_pipelines.len());
        for selected in &decision.selected_pipelines {
            let mut components: BTreeMap<String, Vec<JobReport>> = BTreeMap::new();
            for planned in &selected.jobs {
                if let Some(idx) = self.graph.index_of(&planned.id) {
                    components
                        .entry(planned.component_id.clone())
                        .or_default()
                        .push(JobReport::new(self.graph.job(idx), &self.results[idx]));
                }
            }
            let status = aggregate(&selected.pipeline_id, components.values().flatten());
            pipelines.push(PipelineReport {
                id: selected.pipeline_id.clone(),
                pipeline_type: selected.pipeline_type,
                priority: selected.priority,
                reason: selected.reason.clone(),
                status,
                components,
            });
        }

        let status = RunReport::overall(&pipelines);
        let duration_ms = elapsed.as_millis() as u64;
        let superseded = *self.cancel.borrow();

        self.journal
            .record("run_finished", json!({ "status": status, "superseded": superseded }))
            .await;
        let summary = RunSummary {
            total_events: self.journal.seq,
            total_jobs: self.graph.len() as u64,
            duration_ms,
            success: matches!(status, PipelineStatus::Success | PipelineStatus::Degraded),
        };
        self.journal.close(status, summary).await;

        emit_run_finished(&self.journal.run_id.0, duration_ms, self.graph.len(), status.as_str());
        METRICS.flush();

        RunReport {
            run_id: self.journal.run_id.0.clone(),
            event_id: event.id().to_string(),
            git_ref: event.git_ref().to_string(),
            status,
            superseded,
            duration_ms,
            pipelines,
            trail: Vec::new(),
        }
    }
}
