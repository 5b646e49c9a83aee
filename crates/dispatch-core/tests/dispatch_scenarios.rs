//! End-to-end dispatch over a Node/Python monorepo configuration.

use std::collections::BTreeSet;

use dispatch_core::{
    DispatchConfig, DispatchWarning, Dispatcher, Event, JobKind, StackIndex, StackResolver,
    StaticSignatureSource, TrailEntry, INFRASTRUCTURE_COMPONENT,
};
use serde_json::json;

const CONFIG: &str = include_str!("fixtures/monorepo.toml");

fn config() -> DispatchConfig {
    DispatchConfig::from_toml_str(CONFIG).expect("fixture config is valid")
}

fn stacks(config: &DispatchConfig) -> StackIndex {
    let source = StaticSignatureSource::new()
        .with_file("frontend", "package.json", r#"{"name":"web"}"#)
        .with_file("frontend", "pnpm-lock.yaml", "lockfileVersion: '9.0'")
        .with_file("backend", "pyproject.toml", "[tool.poetry]")
        .with_file("backend", "poetry.lock", "# poetry lock")
        .with_file("docs", "package.json", r#"{"name":"docs"}"#);
    StackIndex::resolve_all(
        &config.components,
        &StackResolver::new(&config.signatures),
        &source,
    )
}

fn event(value: serde_json::Value) -> Event {
    let mut value = value;
    let object = value.as_object_mut().unwrap();
    object.entry("actor").or_insert(json!("octocat"));
    object
        .entry("timestamp")
        .or_insert(json!("2026-03-14T09:26:53Z"));
    Event::from_json(&value.to_string()).expect("valid event")
}

fn pull_request(files: &[&str], labels: &[&str]) -> Event {
    event(json!({
        "type": "pull_request",
        "ref": "refs/pull/42/merge",
        "changed_files": files,
        "labels": labels,
    }))
}

fn job_ids(outcome: &dispatch_core::DispatchOutcome, pipeline: &str) -> BTreeSet<String> {
    outcome
        .decision
        .pipeline(pipeline)
        .map(|p| p.jobs.iter().map(|j| j.id.clone()).collect())
        .unwrap_or_default()
}

#[test]
fn frontend_change_only_schedules_frontend_jobs() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&pull_request(&["frontend/app.tsx"], &[]))
        .unwrap();

    assert_eq!(outcome.decision.pipeline_ids(), vec!["ci"]);
    let ci = outcome.decision.pipeline("ci").unwrap();
    let names: BTreeSet<&str> = ci.jobs.iter().map(|j| j.name.as_str()).collect();
    assert!(names.contains("test-node"));
    assert!(names.contains("lint-node"));
    assert!(ci.jobs.iter().all(|j| j.component_id == "frontend"));
    assert!(!ci.jobs.iter().any(|j| j.component_id == "backend"));

    let build = ci.job("ci:frontend:build-node").unwrap();
    assert_eq!(
        build.depends_on,
        vec!["ci:frontend:lint-node", "ci:frontend:test-node"]
    );
    let cache_key = build.cache_key.as_ref().unwrap();
    assert_eq!(cache_key.component_id, "frontend");
    assert_eq!(cache_key.stack, "node");
    assert_ne!(cache_key.lockfile_hash, "none");
}

#[test]
fn shared_path_schedules_every_component() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&event(json!({
            "type": "push",
            "ref": "refs/heads/main",
            "changed_files": ["shared/lib.py"],
        })))
        .unwrap();

    let ci = outcome.decision.pipeline("ci").unwrap();
    let components: BTreeSet<&str> = ci.jobs.iter().map(|j| j.component_id.as_str()).collect();
    for component in &config.components {
        assert!(
            components.contains(component.id.as_str()),
            "no job for {}",
            component.id
        );
    }
    assert!(outcome
        .trail
        .iter()
        .any(|t| matches!(t, TrailEntry::SharedPath { path, .. } if path == "shared/lib.py")));
}

#[test]
fn component_capabilities_limit_job_kinds() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&pull_request(&["docs/index.md"], &[]))
        .unwrap();

    let ids = job_ids(&outcome, "ci");
    assert_eq!(
        ids,
        ["ci:docs:build-node", "ci:docs:lint-node"]
            .into_iter()
            .map(String::from)
            .collect()
    );
    let ci = outcome.decision.pipeline("ci").unwrap();
    assert_eq!(
        ci.job("ci:docs:build-node").unwrap().depends_on,
        vec!["ci:docs:lint-node"]
    );
    assert!(outcome.trail.iter().any(|t| matches!(
        t,
        TrailEntry::CapabilityMissing { component, template, .. }
            if component == "docs" && template == "deploy"
    )));
}

#[test]
fn skip_preview_label_removes_preview_deploys() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&pull_request(
            &["frontend/app.tsx", "backend/api.py"],
            &["skip-preview"],
        ))
        .unwrap();

    for pipeline in &outcome.decision.selected_pipelines {
        assert!(!pipeline
            .jobs
            .iter()
            .any(|j| j.kind == JobKind::Deploy && j.environment.as_deref() == Some("preview")));
    }
    let suppressed = outcome
        .trail
        .iter()
        .filter(|t| matches!(t, TrailEntry::JobSuppressed { label, .. } if label == "skip-preview"))
        .count();
    assert_eq!(suppressed, 2);
    assert!(job_ids(&outcome, "ci").contains("ci:backend:build-python"));
}

#[test]
fn full_test_label_forces_comprehensive_templates() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let plain = dispatcher
        .dispatch(&pull_request(&["frontend/app.tsx"], &[]))
        .unwrap();
    assert!(!job_ids(&plain, "ci").contains("ci:frontend:e2e"));

    let forced = dispatcher
        .dispatch(&pull_request(&["frontend/app.tsx"], &["test:full"]))
        .unwrap();
    let ci = forced.decision.pipeline("ci").unwrap();
    let e2e = ci.job("ci:frontend:e2e").unwrap();
    assert!(!e2e.required);
    assert_eq!(e2e.depends_on, vec!["ci:frontend:deploy"]);

    let both = dispatcher
        .dispatch(&pull_request(
            &["frontend/app.tsx"],
            &["test:full", "skip-preview"],
        ))
        .unwrap();
    assert!(!job_ids(&both, "ci").contains("ci:frontend:e2e"));
}

#[test]
fn unmatched_paths_target_infrastructure() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&pull_request(&[".github/workflows/ci.yml"], &[]))
        .unwrap();

    let ci = outcome.decision.pipeline("ci").unwrap();
    assert_eq!(ci.jobs.len(), 1);
    assert_eq!(ci.jobs[0].component_id, INFRASTRUCTURE_COMPONENT);
    assert_eq!(ci.jobs[0].id, "ci:infrastructure:lint-workflows");
}

#[test]
fn release_tag_runs_release_pipeline_across_components() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let outcome = dispatcher
        .dispatch(&event(json!({"type": "tag", "ref": "refs/tags/v2.1.0"})))
        .unwrap();

    assert_eq!(outcome.decision.pipeline_ids(), vec!["release"]);
    assert!(matches!(outcome.trail[0], TrailEntry::FullRun { components: 3 }));
    let release = outcome.decision.pipeline("release").unwrap();
    let deploy = release.job("release:backend:deploy").unwrap();
    assert_eq!(deploy.environment.as_deref(), Some("production"));
    assert_eq!(deploy.depends_on, vec!["release:backend:publish-python"]);
    assert!(release.job("release:docs:publish-node").is_some());
    assert!(release.job("release:docs:deploy").is_none());

    let not_release = dispatcher
        .dispatch(&event(json!({"type": "tag", "ref": "refs/tags/nightly-7"})))
        .unwrap();
    assert!(not_release.is_empty());
    assert!(matches!(
        not_release.warnings[0],
        DispatchWarning::NoPipelineMatched { .. }
    ));
}

#[test]
fn schedules_and_manual_inputs_select_their_pipelines() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();

    let nightly = dispatcher
        .dispatch(&event(json!({
            "type": "schedule",
            "ref": "refs/heads/main",
            "schedule": "nightly",
        })))
        .unwrap();
    assert_eq!(nightly.decision.pipeline_ids(), vec!["maintenance"]);

    let weekly = dispatcher
        .dispatch(&event(json!({
            "type": "schedule",
            "ref": "refs/heads/main",
            "schedule": "weekly",
        })))
        .unwrap();
    assert!(weekly.is_empty());
    assert!(weekly.warnings.is_empty());

    let manual = dispatcher
        .dispatch(&event(json!({
            "type": "manual",
            "ref": "refs/heads/main",
            "inputs": {"goal": "tighten error handling"},
        })))
        .unwrap();
    assert_eq!(manual.decision.pipeline_ids(), vec!["evolution"]);
    assert_eq!(
        job_ids(&manual, "evolution"),
        BTreeSet::from(["evolution:backend:propose".to_string()])
    );
}

#[test]
fn decision_json_has_the_documented_shape() {
    let config = config();
    let stacks = stacks(&config);
    let dispatcher = Dispatcher::new(&config, &stacks).unwrap();
    let event = pull_request(&["backend/api.py"], &[]);

    let outcome = dispatcher.dispatch(&event).unwrap();
    let value = outcome.decision.to_value();

    assert_eq!(value["event_id"], json!(event.id()));
    let pipeline = &value["pipelines"][0];
    assert_eq!(pipeline["id"], json!("ci"));
    assert!(pipeline["reason"].as_str().unwrap().contains("pull_request"));
    let job = &pipeline["jobs"][0];
    for field in ["id", "component_id", "kind", "depends_on"] {
        assert!(job.get(field).is_some(), "missing {field}");
    }
}

#[test]
fn invalid_configuration_is_rejected_before_dispatch() {
    let broken = CONFIG.replace("depends_on = [\"lint\", \"test\"]", "depends_on = [\"compile\"]");
    let err = DispatchConfig::from_toml_str(&broken).unwrap_err();
    assert!(err.to_string().contains("compile"));
}
