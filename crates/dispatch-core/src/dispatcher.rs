//! The dispatcher: a pure function from (event, configuration, resolved
//! stacks) to a [`DispatchDecision`], plus the per-event session state
//! machine `Idle → Evaluating → Dispatched → Complete`.
//!
//! Evaluation order:
//! 1. change detection maps changed paths to affected components
//! 2. pipelines whose trigger rules match the event become candidates,
//!    ranked by priority (declaration order breaks ties)
//! 3. each candidate instantiates jobs from its templates for every
//!    matching component and resolved stack
//! 4. label rules force opt-in templates or suppress jobs; dependents of a
//!    suppressed job are removed with it
//! 5. identical jobs across pipelines are de-duplicated: the highest
//!    ranked pipeline owns the job, later ones record `shared_from`
//!
//! Every inclusion and exclusion is written to the reasoning trail.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::Utc;
use dispatch_state::{ContentDigest, DecisionLog, DecisionRecord};
use serde::{Deserialize, Serialize};

use crate::change::{ChangeDetector, PathOrigin};
use crate::config::{DispatchConfig, LabelEffect, LabelRule};
use crate::domain::component::{Capability, Component, INFRASTRUCTURE_COMPONENT};
use crate::domain::decision::{DecisionJob, DispatchDecision, SelectedPipeline};
use crate::domain::digest;
use crate::domain::error::{DispatchError, Result, ValidationError};
use crate::domain::event::{Event, EventType};
use crate::domain::job::Job;
use crate::domain::pipeline::{CompiledTrigger, JobKind, Pipeline, Priority};
use crate::graph::JobGraph;
use crate::metrics::METRICS;
use crate::obs;
use crate::stack::{StackIndex, StackInfo, StackResolution};

/// One step of the dispatch reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum TrailEntry {
    FullRun {
        components: usize,
    },
    PathMatched {
        path: String,
        component: String,
        pattern: String,
    },
    SharedPath {
        path: String,
        pattern: String,
    },
    PathUnmatched {
        path: String,
    },
    PipelineTriggered {
        pipeline: String,
        rule: usize,
    },
    PipelineNotTriggered {
        pipeline: String,
    },
    TemplateNotForced {
        pipeline: String,
        template: String,
    },
    TemplateUnmatched {
        pipeline: String,
        template: String,
    },
    CapabilityMissing {
        pipeline: String,
        template: String,
        component: String,
        capability: Capability,
    },
    StackUnknown {
        pipeline: String,
        template: String,
        component: String,
    },
    DependencyAbsent {
        pipeline: String,
        job: String,
        dependency: String,
    },
    JobSuppressed {
        pipeline: String,
        job: String,
        label: String,
    },
    JobDropped {
        pipeline: String,
        job: String,
        dependency: String,
    },
    JobShared {
        pipeline: String,
        job: String,
        shared_from: String,
    },
    PipelineEmpty {
        pipeline: String,
    },
    PipelineSelected {
        pipeline: String,
        priority: Priority,
        jobs: usize,
    },
}

impl fmt::Display for TrailEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TrailEntry::*;
        match self {
            FullRun { components } => {
                write!(f, "no changed files: all {components} components affected")
            }
            PathMatched {
                path,
                component,
                pattern,
            } => write!(f, "{path} -> {component} (pattern {pattern})"),
            SharedPath { path, pattern } => {
                write!(f, "{path} matches shared pattern {pattern}: all components affected")
            }
            PathUnmatched { path } => write!(f, "{path} -> {INFRASTRUCTURE_COMPONENT}"),
            PipelineTriggered { pipeline, rule } => {
                write!(f, "pipeline {pipeline} triggered by rule #{rule}")
            }
            PipelineNotTriggered { pipeline } => {
                write!(f, "pipeline {pipeline} not triggered")
            }
            TemplateNotForced { pipeline, template } => {
                write!(f, "{pipeline}/{template} is opt-in and no label forced it")
            }
            TemplateUnmatched { pipeline, template } => {
                write!(f, "{pipeline}/{template} matched no affected component")
            }
            CapabilityMissing {
                pipeline,
                template,
                component,
                capability,
            } => write!(
                f,
                "{pipeline}/{template} skipped for {component}: missing {capability} capability"
            ),
            StackUnknown {
                pipeline,
                template,
                component,
            } => write!(
                f,
                "{pipeline}/{template} skipped for {component}: stack unknown"
            ),
            DependencyAbsent {
                pipeline,
                job,
                dependency,
            } => write!(
                f,
                "{job} in {pipeline}: dependency template {dependency} produced no job"
            ),
            JobSuppressed {
                pipeline,
                job,
                label,
            } => write!(f, "{job} in {pipeline} suppressed by label {label}"),
            JobDropped {
                pipeline,
                job,
                dependency,
            } => write!(f, "{job} in {pipeline} dropped with suppressed {dependency}"),
            JobShared {
                pipeline,
                job,
                shared_from,
            } => write!(f, "{job} in {pipeline} reuses {shared_from}"),
            PipelineEmpty { pipeline } => {
                write!(f, "pipeline {pipeline} excluded: no jobs resolved")
            }
            PipelineSelected {
                pipeline,
                priority,
                jobs,
            } => write!(f, "pipeline {pipeline} selected ({priority}, {jobs} jobs)"),
        }
    }
}

/// Non-fatal conditions surfaced next to the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum DispatchWarning {
    /// No pipeline matched a non-schedule event.
    NoPipelineMatched {
        event_id: String,
        event_type: EventType,
        git_ref: String,
    },
    /// A stack-specific template was omitted for a component without a
    /// recognised stack.
    StackUnknown {
        pipeline: String,
        template: String,
        component: String,
    },
}

impl fmt::Display for DispatchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchWarning::NoPipelineMatched {
                event_id,
                event_type,
                git_ref,
            } => write!(
                f,
                "no pipeline matched {event_type} event {event_id} on {git_ref}"
            ),
            DispatchWarning::StackUnknown {
                pipeline,
                template,
                component,
            } => write!(
                f,
                "{pipeline}/{template} omitted for {component}: no stack signature"
            ),
        }
    }
}

/// Decision plus the reasoning that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub decision: DispatchDecision,
    pub trail: Vec<TrailEntry>,
    pub warnings: Vec<DispatchWarning>,
}

impl DispatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.decision.is_empty()
    }

    /// Audit record for the decision log.
    pub fn to_record(&self) -> Result<DecisionRecord> {
        let decision = serde_json::to_value(&self.decision)?;
        let canonical = digest::canonical_json(&decision);
        Ok(DecisionRecord {
            event_id: self.decision.event_id.clone(),
            decision_digest: ContentDigest::from_bytes(canonical.as_bytes()),
            decision,
            trail: serde_json::to_value(&self.trail)?,
            recorded_at: Utc::now(),
        })
    }
}

type JobIdentity = (String, JobKind, Option<String>, Option<String>);

/// Compiled dispatcher for one configuration and stack index.
pub struct Dispatcher<'a> {
    config: &'a DispatchConfig,
    stacks: &'a StackIndex,
    detector: ChangeDetector,
    triggers: Vec<Vec<CompiledTrigger>>,
}

impl<'a> Dispatcher<'a> {
    /// Validate the configuration and compile its globs.
    pub fn new(
        config: &'a DispatchConfig,
        stacks: &'a StackIndex,
    ) -> std::result::Result<Self, ValidationError> {
        config.validate()?;
        let detector = ChangeDetector::new(&config.components, &config.shared_patterns)?;
        let triggers = config
            .pipelines
            .iter()
            .map(|p| {
                p.trigger_rules
                    .iter()
                    .map(|r| r.compile())
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            stacks,
            detector,
            triggers,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        self.config
    }

    /// Evaluate one event. Pure: the same inputs yield the same outcome.
    pub fn dispatch(&self, event: &Event) -> Result<DispatchOutcome> {
        let _span = obs::DispatchSpan::enter(event.id());
        let mut trail = Vec::new();
        let mut warnings = Vec::new();

        let affected_ids = self.affected_components(event, &mut trail);
        let infrastructure = Component::infrastructure();
        let mut affected: Vec<&Component> = self
            .config
            .components
            .iter()
            .filter(|c| affected_ids.contains(&c.id))
            .collect();
        if affected_ids.contains(INFRASTRUCTURE_COMPONENT) {
            affected.push(&infrastructure);
        }

        let mut candidates = Vec::new();
        for (idx, pipeline) in self.config.pipelines.iter().enumerate() {
            match self.triggers[idx].iter().position(|t| t.matches(event)) {
                Some(rule) => {
                    trail.push(TrailEntry::PipelineTriggered {
                        pipeline: pipeline.id.clone(),
                        rule,
                    });
                    candidates.push((idx, rule));
                }
                None => trail.push(TrailEntry::PipelineNotTriggered {
                    pipeline: pipeline.id.clone(),
                }),
            }
        }
        // Stable sort: equal priorities keep declaration order.
        candidates.sort_by_key(|&(idx, _)| Reverse(self.config.pipelines[idx].priority));

        let active_rules: Vec<&LabelRule> = self
            .config
            .label_rules
            .iter()
            .filter(|r| event.has_label(&r.label))
            .collect();
        let forced_tags: BTreeSet<&str> = active_rules
            .iter()
            .filter(|r| r.effect == LabelEffect::Force)
            .filter_map(|r| r.tag.as_deref())
            .collect();
        let suppressors: Vec<&LabelRule> = active_rules
            .iter()
            .copied()
            .filter(|r| r.effect == LabelEffect::Suppress)
            .collect();

        let mut owners: HashMap<JobIdentity, String> = HashMap::new();
        let mut selected = Vec::new();
        for (idx, rule) in candidates {
            let pipeline = &self.config.pipelines[idx];
            let mut jobs = self.instantiate(
                pipeline,
                &affected,
                &forced_tags,
                &suppressors,
                &mut trail,
                &mut warnings,
            )?;
            if jobs.is_empty() {
                trail.push(TrailEntry::PipelineEmpty {
                    pipeline: pipeline.id.clone(),
                });
                continue;
            }

            let mut claimed = Vec::new();
            for job in &mut jobs {
                let identity = (
                    job.component_id.clone(),
                    job.kind,
                    job.stack.clone(),
                    job.environment.clone(),
                );
                match owners.get(&identity) {
                    Some(owner) => {
                        job.shared_from = Some(owner.clone());
                        trail.push(TrailEntry::JobShared {
                            pipeline: pipeline.id.clone(),
                            job: job.id.clone(),
                            shared_from: owner.clone(),
                        });
                    }
                    None => claimed.push((identity, job.id.clone())),
                }
            }
            for (identity, id) in claimed {
                owners.entry(identity).or_insert(id);
            }

            let runtime: Vec<Job> = jobs.iter().map(|j| j.instantiate(&pipeline.id)).collect();
            JobGraph::build(runtime)?;

            let components: BTreeSet<&str> =
                jobs.iter().map(|j| j.component_id.as_str()).collect();
            let reason = format!(
                "{} on {} matched trigger rule #{}; {} job(s) for {}",
                event.event_type(),
                event.git_ref(),
                rule,
                jobs.len(),
                components.into_iter().collect::<Vec<_>>().join(", "),
            );
            trail.push(TrailEntry::PipelineSelected {
                pipeline: pipeline.id.clone(),
                priority: pipeline.priority,
                jobs: jobs.len(),
            });
            obs::emit_pipeline_selected(
                event.id(),
                &pipeline.id,
                &pipeline.priority.to_string(),
                jobs.len(),
            );
            selected.push(SelectedPipeline {
                pipeline_id: pipeline.id.clone(),
                pipeline_type: pipeline.pipeline_type,
                priority: pipeline.priority,
                reason,
                jobs,
            });
        }

        if selected.is_empty() && event.event_type() != EventType::Schedule {
            obs::emit_no_pipeline_matched(
                event.id(),
                event.event_type().as_str(),
                event.git_ref(),
            );
            warnings.push(DispatchWarning::NoPipelineMatched {
                event_id: event.id().to_string(),
                event_type: event.event_type(),
                git_ref: event.git_ref().to_string(),
            });
        }

        let decision = DispatchDecision {
            event_id: event.id().to_string(),
            selected_pipelines: selected,
        };
        METRICS.record_dispatch(decision.job_count() as u64);
        obs::emit_dispatch_evaluated(
            event.id(),
            event.event_type().as_str(),
            decision.selected_pipelines.len(),
            decision.job_count(),
        );

        Ok(DispatchOutcome {
            decision,
            trail,
            warnings,
        })
    }

    /// Events without changed files (schedules, tags, manual runs) target
    /// every component.
    fn affected_components(&self, event: &Event, trail: &mut Vec<TrailEntry>) -> BTreeSet<String> {
        if event.changed_files().is_empty() {
            trail.push(TrailEntry::FullRun {
                components: self.config.components.len(),
            });
            return self
                .config
                .components
                .iter()
                .map(|c| c.id.clone())
                .collect();
        }

        let changes = self.detector.detect(event.changed_files());
        for m in changes.matches {
            trail.push(match m.origin {
                PathOrigin::Component {
                    component_id,
                    pattern,
                } => TrailEntry::PathMatched {
                    path: m.path,
                    component: component_id,
                    pattern,
                },
                PathOrigin::Shared { pattern } => TrailEntry::SharedPath {
                    path: m.path,
                    pattern,
                },
                PathOrigin::Unmatched => TrailEntry::PathUnmatched { path: m.path },
            });
        }
        changes.affected
    }

    /// Jobs of one pipeline with dependencies resolved and label rules applied.
    fn instantiate(
        &self,
        pipeline: &Pipeline,
        affected: &[&Component],
        forced_tags: &BTreeSet<&str>,
        suppressors: &[&LabelRule],
        trail: &mut Vec<TrailEntry>,
        warnings: &mut Vec<DispatchWarning>,
    ) -> Result<Vec<DecisionJob>> {
        let mut jobs: Vec<DecisionJob> = Vec::new();
        let mut template_of: Vec<usize> = Vec::new();
        let mut produced: HashMap<(usize, String), Vec<usize>> = HashMap::new();

        for (t_idx, template) in pipeline.job_templates.iter().enumerate() {
            if template.opt_in && !template.tags.iter().any(|t| forced_tags.contains(t.as_str())) {
                trail.push(TrailEntry::TemplateNotForced {
                    pipeline: pipeline.id.clone(),
                    template: template.id.clone(),
                });
                continue;
            }

            let mut matched_any = false;
            for component in affected {
                let resolution = self.stacks.get(&component.id);
                if !template
                    .component_selector
                    .matches(component, &resolution.tags())
                {
                    continue;
                }
                if let Some(capability) = template.kind.required_capability() {
                    if !component.has_capability(capability) {
                        trail.push(TrailEntry::CapabilityMissing {
                            pipeline: pipeline.id.clone(),
                            template: template.id.clone(),
                            component: component.id.clone(),
                            capability,
                        });
                        continue;
                    }
                }
                // The infrastructure pseudo-component never has stacks.
                if template.per_stack && component.is_infrastructure() {
                    continue;
                }
                matched_any = true;

                let variants: Vec<(String, Option<&StackInfo>)> = if template.per_stack {
                    match resolution {
                        StackResolution::Unknown => {
                            trail.push(TrailEntry::StackUnknown {
                                pipeline: pipeline.id.clone(),
                                template: template.id.clone(),
                                component: component.id.clone(),
                            });
                            warnings.push(DispatchWarning::StackUnknown {
                                pipeline: pipeline.id.clone(),
                                template: template.id.clone(),
                                component: component.id.clone(),
                            });
                            continue;
                        }
                        StackResolution::Resolved(stacks) => stacks
                            .iter()
                            .filter(|s| template.component_selector.admits_stack(&s.id, &s.language))
                            .map(|s| (format!("{}-{}", template.id, s.id), Some(s)))
                            .collect(),
                    }
                } else {
                    vec![(template.id.clone(), None)]
                };

                for (name, stack) in variants {
                    let id = Job::job_id(&pipeline.id, &component.id, &name);
                    if jobs.iter().any(|j| j.id == id) {
                        return Err(ValidationError::DuplicateJob {
                            pipeline: pipeline.id.clone(),
                            job: id,
                        }
                        .into());
                    }
                    produced
                        .entry((t_idx, component.id.clone()))
                        .or_default()
                        .push(jobs.len());
                    template_of.push(t_idx);
                    jobs.push(DecisionJob {
                        id,
                        component_id: component.id.clone(),
                        kind: template.kind,
                        depends_on: Vec::new(),
                        name,
                        template_id: template.id.clone(),
                        stack: stack.map(|s| s.id.clone()),
                        environment: template.environment.clone(),
                        required: !template.optional,
                        shared_from: None,
                        cache_key: stack.map(|s| s.cache_key(&component.id)),
                    });
                }
            }
            if !matched_any {
                trail.push(TrailEntry::TemplateUnmatched {
                    pipeline: pipeline.id.clone(),
                    template: template.id.clone(),
                });
            }
        }

        self.resolve_dependencies(pipeline, &mut jobs, &template_of, &produced, trail);
        Ok(apply_suppression(
            pipeline,
            jobs,
            &template_of,
            suppressors,
            trail,
        ))
    }

    /// Template dependencies become job edges on the same component; when
    /// both sides are stack-specific the matching stack is preferred.
    fn resolve_dependencies(
        &self,
        pipeline: &Pipeline,
        jobs: &mut [DecisionJob],
        template_of: &[usize],
        produced: &HashMap<(usize, String), Vec<usize>>,
        trail: &mut Vec<TrailEntry>,
    ) {
        for i in 0..jobs.len() {
            let template = &pipeline.job_templates[template_of[i]];
            let mut deps = BTreeSet::new();
            for dep_template in &template.depends_on {
                let Some(dep_idx) = pipeline
                    .job_templates
                    .iter()
                    .position(|t| &t.id == dep_template)
                else {
                    continue;
                };
                let key = (dep_idx, jobs[i].component_id.clone());
                let Some(candidates) = produced.get(&key) else {
                    trail.push(TrailEntry::DependencyAbsent {
                        pipeline: pipeline.id.clone(),
                        job: jobs[i].id.clone(),
                        dependency: dep_template.clone(),
                    });
                    continue;
                };
                let same_stack: Vec<usize> = match &jobs[i].stack {
                    Some(stack) => candidates
                        .iter()
                        .copied()
                        .filter(|&c| jobs[c].stack.as_ref() == Some(stack))
                        .collect(),
                    None => Vec::new(),
                };
                let chosen = if same_stack.is_empty() {
                    candidates.as_slice()
                } else {
                    same_stack.as_slice()
                };
                deps.extend(chosen.iter().map(|&c| jobs[c].id.clone()));
            }
            jobs[i].depends_on = deps.into_iter().collect();
        }
    }
}

/// Drop suppressed jobs and, transitively, everything that depends on them.
fn apply_suppression(
    pipeline: &Pipeline,
    jobs: Vec<DecisionJob>,
    template_of: &[usize],
    suppressors: &[&LabelRule],
    trail: &mut Vec<TrailEntry>,
) -> Vec<DecisionJob> {
    if suppressors.is_empty() {
        return jobs;
    }

    let mut removed: BTreeSet<String> = BTreeSet::new();
    for (i, job) in jobs.iter().enumerate() {
        let tags = &pipeline.job_templates[template_of[i]].tags;
        if let Some(rule) = suppressors
            .iter()
            .find(|r| r.suppresses(job.kind, job.environment.as_deref(), tags))
        {
            removed.insert(job.id.clone());
            trail.push(TrailEntry::JobSuppressed {
                pipeline: pipeline.id.clone(),
                job: job.id.clone(),
                label: rule.label.clone(),
            });
        }
    }

    loop {
        let mut dropped = Vec::new();
        for job in &jobs {
            if removed.contains(&job.id) {
                continue;
            }
            if let Some(dep) = job.depends_on.iter().find(|d| removed.contains(*d)) {
                dropped.push((job.id.clone(), dep.clone()));
            }
        }
        if dropped.is_empty() {
            break;
        }
        for (job, dependency) in dropped {
            trail.push(TrailEntry::JobDropped {
                pipeline: pipeline.id.clone(),
                job: job.clone(),
                dependency,
            });
            removed.insert(job);
        }
    }

    jobs.into_iter()
        .filter(|j| !removed.contains(&j.id))
        .collect()
}

/// One-shot dispatch without keeping a compiled [`Dispatcher`].
pub fn dispatch(
    event: &Event,
    config: &DispatchConfig,
    stacks: &StackIndex,
) -> Result<DispatchOutcome> {
    Dispatcher::new(config, stacks)?.dispatch(event)
}

/// Lifecycle of one event through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Evaluating,
    Dispatched,
    Complete,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DispatchState::Idle => "idle",
            DispatchState::Evaluating => "evaluating",
            DispatchState::Dispatched => "dispatched",
            DispatchState::Complete => "complete",
        })
    }
}

/// Drives one event from ingestion to an audited decision.
#[derive(Debug)]
pub struct DispatchSession {
    event: Event,
    state: DispatchState,
    outcome: Option<DispatchOutcome>,
}

impl DispatchSession {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            state: DispatchState::Idle,
            outcome: None,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        self.outcome.as_ref()
    }

    fn expect(&self, expected: DispatchState) -> Result<()> {
        if self.state != expected {
            return Err(DispatchError::InvalidState {
                state: self.state.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    /// `Idle → Evaluating → Dispatched`. A failed evaluation returns to
    /// `Idle` with no outcome.
    pub fn evaluate(&mut self, dispatcher: &Dispatcher<'_>) -> Result<&DispatchOutcome> {
        self.expect(DispatchState::Idle)?;
        self.state = DispatchState::Evaluating;
        match dispatcher.dispatch(&self.event) {
            Ok(outcome) => {
                self.state = DispatchState::Dispatched;
                Ok(self.outcome.insert(outcome))
            }
            Err(e) => {
                self.state = DispatchState::Idle;
                Err(e)
            }
        }
    }

    /// `Dispatched → Complete` once the decision is in the audit log.
    pub async fn record(&mut self, log: &dyn DecisionLog) -> Result<DecisionRecord> {
        self.expect(DispatchState::Dispatched)?;
        let record = match &self.outcome {
            Some(outcome) => outcome.to_record()?,
            None => {
                return Err(DispatchError::InvalidState {
                    state: self.state.to_string(),
                    expected: DispatchState::Dispatched.to_string(),
                })
            }
        };
        log.append(record.clone()).await?;
        obs::emit_decision_recorded(&record.event_id, record.decision_digest.short());
        self.state = DispatchState::Complete;
        Ok(record)
    }

    pub fn into_outcome(self) -> Option<DispatchOutcome> {
        self.outcome
    }
}
