//! Pipelines, trigger rules and job templates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::component::{Capability, Component};
use crate::domain::error::ValidationError;
use crate::domain::event::{Event, EventType};

/// Category of work a pipeline performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    Ci,
    Release,
    Maintenance,
    Evolution,
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineType::Ci => "ci",
            PipelineType::Release => "release",
            PipelineType::Maintenance => "maintenance",
            PipelineType::Evolution => "evolution",
        })
    }
}

/// Pipeline priority. Variant order is rank order: `Critical` is highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Test,
    Lint,
    Build,
    Deploy,
    Publish,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Test => "test",
            JobKind::Lint => "lint",
            JobKind::Build => "build",
            JobKind::Deploy => "deploy",
            JobKind::Publish => "publish",
        }
    }

    /// Component capability a job of this kind needs. Lint needs none.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            JobKind::Test => Some(Capability::Test),
            JobKind::Build | JobKind::Publish => Some(Capability::Build),
            JobKind::Deploy => Some(Capability::Deploy),
            JobKind::Lint => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate over an event. Every populated field must hold; empty fields
/// match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    #[serde(default)]
    pub events: BTreeSet<EventType>,
    /// Globs over the full ref or its short form (`main`, `v*`).
    #[serde(default)]
    pub refs: Vec<String>,
    /// Schedule names this rule answers to.
    #[serde(default)]
    pub schedules: Vec<String>,
    /// Manual-dispatch inputs that must be present; `*` accepts any value.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// At least one of these labels must be on the event.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl TriggerRule {
    pub fn on(events: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_refs<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.refs = refs.into_iter().map(Into::into).collect();
        self
    }

    /// Compile ref globs once so matching is allocation-free.
    pub fn compile(&self) -> Result<CompiledTrigger, ValidationError> {
        let refs = if self.refs.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &self.refs {
                builder.add(compile_glob(pattern)?);
            }
            Some(builder.build().map_err(|e| ValidationError::InvalidGlob {
                pattern: self.refs.join(","),
                reason: e.to_string(),
            })?)
        };
        Ok(CompiledTrigger {
            rule: self.clone(),
            refs,
        })
    }
}

/// A [`TriggerRule`] with its ref globs compiled.
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    rule: TriggerRule,
    refs: Option<GlobSet>,
}

impl CompiledTrigger {
    pub fn matches(&self, event: &Event) -> bool {
        let rule = &self.rule;
        if !rule.events.is_empty() && !rule.events.contains(&event.event_type()) {
            return false;
        }
        if let Some(refs) = &self.refs {
            if !refs.is_match(event.git_ref()) && !refs.is_match(event.short_ref()) {
                return false;
            }
        }
        if !rule.schedules.is_empty() {
            match event.schedule() {
                Some(name) if rule.schedules.iter().any(|s| s == name) => {}
                _ => return false,
            }
        }
        for (key, expected) in &rule.inputs {
            match event.inputs().get(key) {
                Some(value) if expected == "*" || value == expected => {}
                _ => return false,
            }
        }
        if !rule.labels.is_empty() && !rule.labels.iter().any(|l| event.has_label(l)) {
            return false;
        }
        true
    }
}

/// Compile a path or ref glob. `*` stays within one `/` segment.
pub fn compile_glob(pattern: &str) -> Result<globset::Glob, ValidationError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| ValidationError::InvalidGlob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Which components a template applies to. Populated fields AND-combine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSelector {
    #[serde(default)]
    pub components: Vec<String>,
    /// Matches declared component languages, resolved stack languages or
    /// stack ids.
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ComponentSelector {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn components<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `stack_tags` carries the language and id of every resolved stack.
    pub fn matches(&self, component: &Component, stack_tags: &BTreeSet<&str>) -> bool {
        if !self.components.is_empty() && !self.components.iter().any(|c| *c == component.id) {
            return false;
        }
        if !self.languages.is_empty()
            && !self.languages.iter().any(|lang| {
                component.languages.contains(lang) || stack_tags.contains(lang.as_str())
            })
        {
            return false;
        }
        self.capabilities
            .iter()
            .all(|cap| component.has_capability(*cap))
    }

    /// Whether a resolved stack passes the language filter.
    pub fn admits_stack(&self, stack_id: &str, language: &str) -> bool {
        self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|lang| lang == stack_id || lang == language)
    }
}

fn default_true() -> bool {
    true
}

/// Blueprint for jobs instantiated per affected component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: String,
    #[serde(default)]
    pub component_selector: ComponentSelector,
    pub kind: JobKind,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// One job per resolved stack, named `<template>-<stack>`.
    #[serde(default = "default_true")]
    pub per_stack: bool,
    /// Deploy target such as `preview` or `production`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Optional jobs only degrade a pipeline when they fail.
    #[serde(default)]
    pub optional: bool,
    /// Opt-in templates run only when a label forces one of their tags.
    #[serde(default)]
    pub opt_in: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl JobTemplate {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            component_selector: ComponentSelector::any(),
            kind,
            depends_on: BTreeSet::new(),
            per_stack: true,
            environment: None,
            optional: false,
            opt_in: false,
            tags: BTreeSet::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn selector(mut self, selector: ComponentSelector) -> Self {
        self.component_selector = selector;
        self
    }

    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn stack_agnostic(mut self) -> Self {
        self.per_stack = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn opt_in<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.opt_in = true;
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A named, trigger-activated template for a category of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    #[serde(default)]
    pub priority: Priority,
    pub trigger_rules: Vec<TriggerRule>,
    pub job_templates: Vec<JobTemplate>,
}

impl Pipeline {
    pub fn new(id: impl Into<String>, pipeline_type: PipelineType) -> Self {
        Self {
            id: id.into(),
            pipeline_type,
            priority: Priority::default(),
            trigger_rules: Vec::new(),
            job_templates: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn trigger(mut self, rule: TriggerRule) -> Self {
        self.trigger_rules.push(rule);
        self
    }

    pub fn template(mut self, template: JobTemplate) -> Self {
        self.job_templates.push(template);
        self
    }

    pub fn template_by_id(&self, id: &str) -> Option<&JobTemplate> {
        self.job_templates.iter().find(|t| t.id == id)
    }
}
