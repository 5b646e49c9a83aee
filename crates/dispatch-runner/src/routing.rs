//! Routes jobs to the collaborator that can run them: registry pushes for
//! deploy/publish, a content generator for evolution pipelines, commands for
//! the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dispatch_core::{CacheKey, JobKind, PipelineType};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::executor::{JobContext, JobExecutor, JobOutput};

/// What a deploy or publish job hands to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub component_id: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub git_ref: String,
    pub run_id: String,
}

/// Artifact registry or deployment target.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Push the artifact; returns a reference to what was published.
    async fn push(&self, request: &PushRequest) -> Result<String, JobError>;
}

/// Changes proposed by a content generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub summary: String,
    /// Path to new file contents.
    pub files: BTreeMap<String, String>,
}

/// Produces code changes for evolution pipelines.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<ChangeProposal, JobError>;
}

pub struct RoutingExecutor {
    commands: Arc<dyn JobExecutor>,
    registry: Option<Arc<dyn RegistryClient>>,
    generator: Option<Arc<dyn ContentGenerator>>,
}

impl RoutingExecutor {
    pub fn new(commands: Arc<dyn JobExecutor>) -> Self {
        Self {
            commands,
            registry: None,
            generator: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ContentGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    async fn evolve(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            JobError::permanent(format!(
                "{} belongs to an evolution pipeline but no content generator is configured",
                ctx.job.id
            ))
        })?;
        let proposal = generator.generate(&evolution_prompt(ctx)).await?;

        let mut logs = format!("proposal: {}\n", proposal.summary);
        for path in proposal.files.keys() {
            logs.push_str(&format!("  {path}\n"));
        }
        Ok(JobOutput {
            logs,
            artifact: Some(format!("{} file(s)", proposal.files.len())),
        })
    }

    async fn push(
        &self,
        registry: &dyn RegistryClient,
        ctx: &JobContext,
    ) -> Result<JobOutput, JobError> {
        let request = PushRequest {
            component_id: ctx.job.component_id.clone(),
            kind: ctx.job.kind,
            stack: ctx.job.stack.clone(),
            environment: ctx.job.environment.clone(),
            git_ref: ctx.git_ref.clone(),
            run_id: ctx.run_id.clone(),
        };
        let reference = registry.push(&request).await?;
        Ok(JobOutput {
            logs: format!("pushed {} for {}: {reference}\n", ctx.job.kind, ctx.job.component_id),
            artifact: Some(reference),
        })
    }
}

fn evolution_prompt(ctx: &JobContext) -> String {
    let mut prompt = format!(
        "pipeline: {}\ncomponent: {}\nref: {}\njob: {}\n",
        ctx.pipeline_id, ctx.job.component_id, ctx.git_ref, ctx.job.name
    );
    for (key, value) in &ctx.inputs {
        prompt.push_str(&format!("{key}: {value}\n"));
    }
    prompt
}

#[async_trait]
impl JobExecutor for RoutingExecutor {
    async fn execute(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        if ctx.pipeline_type == PipelineType::Evolution {
            return self.evolve(ctx).await;
        }
        match (&self.registry, ctx.job.kind) {
            (Some(registry), JobKind::Deploy | JobKind::Publish) => {
                self.push(registry.as_ref(), ctx).await
            }
            _ => self.commands.execute(ctx).await,
        }
    }

    async fn prepare(&self, key: &CacheKey, ctx: &JobContext) -> Result<String, JobError> {
        self.commands.prepare(key, ctx).await
    }
}
