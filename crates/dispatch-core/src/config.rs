//! Dispatch configuration: runner settings, components, pipelines and
//! label rules.
//!
//! Loaded once at startup from TOML or JSON (chosen by file extension) and
//! read-only afterwards. [`DispatchConfig::validate`] rejects anything that
//! would make dispatch ambiguous or the job graph cyclic.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::component::{Component, INFRASTRUCTURE_COMPONENT};
use crate::domain::error::ValidationError;
use crate::domain::pipeline::{compile_glob, JobKind, Pipeline};
use crate::graph::kahn_order;
use crate::stack::SignatureRule;

/// What happens to an in-flight run when a newer event targets its ref.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupersedePolicy {
    #[default]
    Cancel,
    AllowParallel,
}

/// Whether a label removes jobs or forces opt-in templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelEffect {
    Suppress,
    Force,
}

/// Label-driven routing.
///
/// A `suppress` rule removes every job matching all of its populated
/// `kind` / `environment` / `tag` filters. A `force` rule includes opt-in
/// templates carrying `tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub label: String,
    pub effect: LabelEffect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl LabelRule {
    /// Whether a job with these attributes falls under this suppress rule.
    pub fn suppresses(
        &self,
        kind: JobKind,
        environment: Option<&str>,
        tags: &BTreeSet<String>,
    ) -> bool {
        if self.effect != LabelEffect::Suppress {
            return false;
        }
        if let Some(k) = self.kind {
            if k != kind {
                return false;
            }
        }
        if let Some(env) = &self.environment {
            if environment != Some(env.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// `skip-preview` drops preview deploys; `test:full` forces comprehensive tests.
pub fn default_label_rules() -> Vec<LabelRule> {
    vec![
        LabelRule {
            label: "skip-preview".to_string(),
            effect: LabelEffect::Suppress,
            kind: Some(JobKind::Deploy),
            environment: Some("preview".to_string()),
            tag: None,
        },
        LabelRule {
            label: "test:full".to_string(),
            effect: LabelEffect::Force,
            kind: None,
            environment: None,
            tag: Some("comprehensive".to_string()),
        },
    ]
}

fn default_max_concurrency() -> usize {
    4
}

fn default_retry_max() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_max() -> u64 {
    60
}

fn default_cancel_grace() -> u64 {
    30
}

fn default_job_timeout() -> u64 {
    1800
}

/// Execution knobs consumed by the pipeline runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSettings {
    pub max_concurrency: usize,
    /// Total attempts per job, first attempt included.
    pub retry_max: u32,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_max_seconds: u64,
    pub supersede_policy: SupersedePolicy,
    pub cancel_grace_seconds: u64,
    pub job_timeout_seconds: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry_max: default_retry_max(),
            retry_backoff_base_seconds: default_backoff_base(),
            retry_backoff_max_seconds: default_backoff_max(),
            supersede_policy: SupersedePolicy::default(),
            cancel_grace_seconds: default_cancel_grace(),
            job_timeout_seconds: default_job_timeout(),
        }
    }
}

impl RunnerSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_seconds: u64,
    #[serde(default = "default_backoff_max")]
    pub retry_backoff_max_seconds: u64,
    #[serde(default)]
    pub supersede_policy: SupersedePolicy,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_seconds: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,

    /// Paths that affect every component.
    #[serde(default)]
    pub shared_patterns: Vec<String>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default = "default_label_rules")]
    pub label_rules: Vec<LabelRule>,
    /// Extra stack signatures, consulted before the built-in table.
    #[serde(default)]
    pub signatures: Vec<SignatureRule>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let settings = RunnerSettings::default();
        Self {
            max_concurrency: settings.max_concurrency,
            retry_max: settings.retry_max,
            retry_backoff_base_seconds: settings.retry_backoff_base_seconds,
            retry_backoff_max_seconds: settings.retry_backoff_max_seconds,
            supersede_policy: settings.supersede_policy,
            cancel_grace_seconds: settings.cancel_grace_seconds,
            job_timeout_seconds: settings.job_timeout_seconds,
            shared_patterns: Vec::new(),
            components: Vec::new(),
            pipelines: Vec::new(),
            label_rules: default_label_rules(),
            signatures: Vec::new(),
        }
    }
}

impl DispatchConfig {
    /// Load and validate a config file. `.json` is parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ValidationError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };
        tracing::debug!(
            path = %path.display(),
            components = config.components.len(),
            pipelines = config.pipelines.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ValidationError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ValidationError::MalformedConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ValidationError::MalformedConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            max_concurrency: self.max_concurrency,
            retry_max: self.retry_max,
            retry_backoff_base_seconds: self.retry_backoff_base_seconds,
            retry_backoff_max_seconds: self.retry_backoff_max_seconds,
            supersede_policy: self.supersede_policy,
            cancel_grace_seconds: self.cancel_grace_seconds,
            job_timeout_seconds: self.job_timeout_seconds,
        }
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn pipeline(&self, id: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id == id)
    }

    /// Check the whole configuration. Returns the first problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_settings()?;

        if self.components.is_empty() {
            return Err(ValidationError::MissingConfiguration {
                what: "components".to_string(),
            });
        }
        if self.pipelines.is_empty() {
            return Err(ValidationError::MissingConfiguration {
                what: "pipelines".to_string(),
            });
        }

        for pattern in &self.shared_patterns {
            compile_glob(pattern)?;
        }

        let mut component_ids = HashSet::new();
        for component in &self.components {
            if component.id.trim().is_empty() {
                return Err(ValidationError::EmptyId {
                    what: "component".to_string(),
                });
            }
            if component.id == INFRASTRUCTURE_COMPONENT {
                return Err(ValidationError::ReservedComponent {
                    id: component.id.clone(),
                });
            }
            if !component_ids.insert(component.id.as_str()) {
                return Err(ValidationError::DuplicateComponent {
                    id: component.id.clone(),
                });
            }
            if component.path_patterns.is_empty() {
                return Err(ValidationError::NoPathPatterns {
                    id: component.id.clone(),
                });
            }
            for pattern in &component.path_patterns {
                compile_glob(pattern)?;
            }
        }

        let mut pipeline_ids = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.id.trim().is_empty() {
                return Err(ValidationError::EmptyId {
                    what: "pipeline".to_string(),
                });
            }
            if !pipeline_ids.insert(pipeline.id.as_str()) {
                return Err(ValidationError::DuplicatePipeline {
                    id: pipeline.id.clone(),
                });
            }
            self.validate_pipeline(pipeline, &component_ids)?;
        }

        for rule in &self.label_rules {
            validate_label_rule(rule)?;
        }

        Ok(())
    }

    fn validate_settings(&self) -> Result<(), ValidationError> {
        let invalid = |name: &str, reason: &str| ValidationError::InvalidSetting {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be at least 1"));
        }
        if self.retry_max == 0 {
            return Err(invalid("retry_max", "must be at least 1"));
        }
        if self.retry_backoff_max_seconds < self.retry_backoff_base_seconds {
            return Err(invalid(
                "retry_backoff_max_seconds",
                "must not be below retry_backoff_base_seconds",
            ));
        }
        if self.job_timeout_seconds == 0 {
            return Err(invalid("job_timeout_seconds", "must be at least 1"));
        }
        Ok(())
    }

    fn validate_pipeline(
        &self,
        pipeline: &Pipeline,
        component_ids: &HashSet<&str>,
    ) -> Result<(), ValidationError> {
        if pipeline.trigger_rules.is_empty() {
            return Err(ValidationError::NoTriggerRules {
                pipeline: pipeline.id.clone(),
            });
        }
        for rule in &pipeline.trigger_rules {
            rule.compile()?;
        }
        if pipeline.job_templates.is_empty() {
            return Err(ValidationError::NoJobTemplates {
                pipeline: pipeline.id.clone(),
            });
        }

        let mut template_ids = HashSet::new();
        for template in &pipeline.job_templates {
            if template.id.trim().is_empty() {
                return Err(ValidationError::EmptyId {
                    what: format!("job template in pipeline {}", pipeline.id),
                });
            }
            if !template_ids.insert(template.id.as_str()) {
                return Err(ValidationError::DuplicateTemplate {
                    pipeline: pipeline.id.clone(),
                    template: template.id.clone(),
                });
            }
            for component in &template.component_selector.components {
                if component != INFRASTRUCTURE_COMPONENT
                    && !component_ids.contains(component.as_str())
                {
                    return Err(ValidationError::UnknownComponent {
                        pipeline: pipeline.id.clone(),
                        template: template.id.clone(),
                        component: component.clone(),
                    });
                }
            }
        }

        let position = |id: &str| pipeline.job_templates.iter().position(|t| t.id == id);
        let mut upstream = Vec::with_capacity(pipeline.job_templates.len());
        for template in &pipeline.job_templates {
            let mut deps = BTreeSet::new();
            for dep in &template.depends_on {
                let idx = position(dep).ok_or_else(|| ValidationError::UnknownDependency {
                    pipeline: pipeline.id.clone(),
                    template: template.id.clone(),
                    dependency: dep.clone(),
                })?;
                deps.insert(idx);
            }
            upstream.push(deps);
        }
        kahn_order(&upstream).map_err(|stuck| ValidationError::TemplateCycle {
            pipeline: pipeline.id.clone(),
            templates: stuck
                .into_iter()
                .map(|i| pipeline.job_templates[i].id.clone())
                .collect(),
        })?;
        Ok(())
    }
}

fn validate_label_rule(rule: &LabelRule) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidLabelRule {
        label: rule.label.clone(),
        reason: reason.to_string(),
    };
    if rule.label.trim().is_empty() {
        return Err(invalid("label must not be empty"));
    }
    match rule.effect {
        LabelEffect::Suppress
            if rule.kind.is_none() && rule.environment.is_none() && rule.tag.is_none() =>
        {
            Err(invalid("suppress rules need a kind, environment or tag filter"))
        }
        LabelEffect::Force if rule.tag.is_none() => Err(invalid("force rules need a tag")),
        _ => Ok(()),
    }
}
