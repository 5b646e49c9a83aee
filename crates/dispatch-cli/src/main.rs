//! `dispatch`: decide and run CI/CD pipelines for a repository event.
//!
//! ## Commands
//!
//! - `evaluate`: print the dispatch decision for an event
//! - `run`: evaluate, then execute the selected jobs and print the report
//! - `validate`: check a configuration file
//! - `stacks`: show the technology stacks resolved for each component
//!
//! Exit codes: `0` when at least one pipeline is selected (job failures
//! included), `1` on validation or other fatal errors, `2` when no pipeline
//! matched the event.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use dispatch_core::{
    DispatchConfig, DispatchOutcome, DispatchSession, Dispatcher, Event, FsSignatureSource,
    StackIndex, StackResolution, StackResolver,
};
use dispatch_runner::{
    render_run_report_md, CommandExecutor, CommandTable, DryRunExecutor, JobExecutor,
    PipelineRunner, RoutingExecutor,
};
use dispatch_state::{FsLogStore, JsonlDecisionLog, JsonlRunLedger};

/// Directory under the workspace holding decisions, runs and logs.
const STATE_DIR: &str = ".dispatch";

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Unified CI/CD dispatch engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct ConfigArgs {
    /// Engine configuration (TOML, or JSON by extension)
    #[arg(short, long, env = "DISPATCH_CONFIG", default_value = "dispatch.toml")]
    config: PathBuf,

    /// Repository root: stack detection and job working directories
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the dispatch decision for an event
    Evaluate {
        /// Event JSON document
        #[arg(short, long)]
        event_file: PathBuf,

        /// Do not append the decision to the audit log
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Evaluate an event and execute the selected jobs
    Run {
        /// Event JSON document
        #[arg(short, long)]
        event_file: PathBuf,

        /// Describe each job's command instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Override the configured worker pool size
        #[arg(long, env = "DISPATCH_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,

        /// Report format printed to stdout
        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Check a configuration file
    Validate {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show the stacks resolved for every component
    Stacks {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

/// Process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Selected = 0,
    Invalid = 1,
    NoMatch = 2,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    dispatch_core::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Evaluate {
            event_file,
            dry_run,
            config,
        } => cmd_evaluate(&config, &event_file, dry_run).await,
        Commands::Run {
            event_file,
            dry_run,
            max_concurrency,
            format,
            config,
        } => cmd_run(&config, &event_file, dry_run, max_concurrency, format).await,
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Stacks { config } => cmd_stacks(&config),
    };

    match result {
        Ok(exit) => exit.into(),
        Err(e) => {
            eprintln!("error: {e:#}");
            Exit::Invalid.into()
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<DispatchConfig> {
    DispatchConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))
}

fn load_event(path: &Path) -> Result<Event> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file {}", path.display()))?;
    Event::from_json(&text).with_context(|| format!("Invalid event in {}", path.display()))
}

fn resolve_stacks(config: &DispatchConfig, workspace: &Path) -> StackIndex {
    let resolver = StackResolver::new(&config.signatures);
    let source = FsSignatureSource::new(workspace);
    StackIndex::resolve_all(&config.components, &resolver, &source)
}

/// Evaluate `event` and, unless `dry_run`, append the decision to the
/// workspace's decision log.
async fn decide(
    config: &DispatchConfig,
    workspace: &Path,
    event: Event,
    dry_run: bool,
) -> Result<DispatchOutcome> {
    let stacks = resolve_stacks(config, workspace);
    let dispatcher = Dispatcher::new(config, &stacks).context("Invalid configuration")?;

    let mut session = DispatchSession::new(event);
    session
        .evaluate(&dispatcher)
        .context("Failed to evaluate event")?;
    if !dry_run {
        let log = JsonlDecisionLog::new(workspace.join(STATE_DIR).join("decisions.jsonl"));
        session
            .record(&log)
            .await
            .context("Failed to record decision")?;
    }
    session
        .into_outcome()
        .context("Dispatch session finished without an outcome")
}

async fn cmd_evaluate(args: &ConfigArgs, event_file: &Path, dry_run: bool) -> Result<Exit> {
    let config = load_config(args)?;
    let event = load_event(event_file)?;
    let outcome = decide(&config, &args.workspace, event, dry_run).await?;

    for warning in &outcome.warnings {
        warn!(%warning, "dispatch warning");
    }
    println!("{}", serde_json::to_string_pretty(&outcome.decision)?);

    if outcome.is_empty() {
        Ok(Exit::NoMatch)
    } else {
        Ok(Exit::Selected)
    }
}

fn executor_for(dry_run: bool) -> Arc<dyn JobExecutor> {
    if dry_run {
        Arc::new(DryRunExecutor::new(CommandTable::builtin()))
    } else {
        let commands: Arc<dyn JobExecutor> = Arc::new(CommandExecutor::default());
        Arc::new(RoutingExecutor::new(commands))
    }
}

async fn cmd_run(
    args: &ConfigArgs,
    event_file: &Path,
    dry_run: bool,
    max_concurrency: Option<usize>,
    format: ReportFormat,
) -> Result<Exit> {
    let config = load_config(args)?;
    let event = load_event(event_file)?;
    let outcome = decide(&config, &args.workspace, event.clone(), dry_run).await?;
    if outcome.is_empty() {
        info!(event_id = %event.id(), "no pipeline matched; nothing to run");
        return Ok(Exit::NoMatch);
    }

    let mut settings = config.runner_settings();
    if let Some(limit) = max_concurrency {
        anyhow::ensure!(limit > 0, "--max-concurrency must be at least 1");
        settings.max_concurrency = limit;
    }

    let state_dir = args.workspace.join(STATE_DIR);
    let ledger = Arc::new(JsonlRunLedger::new(state_dir.join("runs.jsonl")));
    let logs = Arc::new(
        FsLogStore::new(state_dir.join("logs"))
            .await
            .context("Failed to open log store")?,
    );
    let runner = PipelineRunner::new(settings, executor_for(dry_run), ledger, logs)
        .with_workspace(&args.workspace, &config);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let report = runner
        .run(&event, &outcome.decision, cancel_rx)
        .await
        .context("Run failed")?
        .with_trail(outcome.trail);

    match format {
        ReportFormat::Markdown => print!("{}", render_run_report_md(&report)),
        ReportFormat::Json => println!("{}", report.to_json_pretty()?),
    }
    Ok(Exit::Selected)
}

fn cmd_validate(args: &ConfigArgs) -> Result<Exit> {
    let config = load_config(args)?;
    let templates: usize = config.pipelines.iter().map(|p| p.job_templates.len()).sum();
    println!(
        "{}: {} component(s), {} pipeline(s), {} job template(s)",
        args.config.display(),
        config.components.len(),
        config.pipelines.len(),
        templates
    );
    Ok(Exit::Selected)
}

fn cmd_stacks(args: &ConfigArgs) -> Result<Exit> {
    let config = load_config(args)?;
    let stacks = resolve_stacks(&config, &args.workspace);
    for (component, resolution) in stacks.iter() {
        println!("{}", describe_resolution(component, resolution));
    }
    Ok(Exit::Selected)
}

fn describe_resolution(component: &str, resolution: &StackResolution) -> String {
    match resolution {
        StackResolution::Unknown => format!("{component}: unknown"),
        StackResolution::Resolved(stacks) => {
            let described: Vec<String> = stacks
                .iter()
                .map(|s| match &s.lockfile_hash {
                    Some(hash) => format!(
                        "{} ({}, lockfile {})",
                        s.id,
                        s.package_manager,
                        &hash[..12.min(hash.len())]
                    ),
                    None => format!("{} ({})", s.id, s.package_manager),
                })
                .collect();
            format!("{component}: {}", described.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::builtin_stack;

    const CONFIG: &str = r#"
[[components]]
id = "api"
root = "api"
path_patterns = ["api/**"]

[[components]]
id = "docs"
path_patterns = ["docs/**"]

[[pipelines]]
id = "ci"
type = "ci"
priority = "high"

[[pipelines.trigger_rules]]
events = ["push"]

[[pipelines.job_templates]]
id = "build"
kind = "build"
"#;

    struct Fixture {
        dir: tempfile::TempDir,
        args: ConfigArgs,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("api")).unwrap();
        std::fs::write(dir.path().join("api/Cargo.toml"), "[package]\n").unwrap();
        let config = dir.path().join("dispatch.toml");
        std::fs::write(&config, CONFIG).unwrap();
        let args = ConfigArgs {
            config,
            workspace: dir.path().to_path_buf(),
        };
        Fixture { dir, args }
    }

    fn write_event(dir: &Path, event_type: &str, files: &str) -> PathBuf {
        let path = dir.join("event.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"type":"{event_type}","ref":"refs/heads/main","changed_files":[{files}],"actor":"dev","timestamp":"2026-03-01T12:00:00Z"}}"#
            ),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_evaluate_selects_and_records() {
        let f = fixture();
        let event = write_event(f.dir.path(), "push", r#""api/src/main.rs""#);

        let exit = cmd_evaluate(&f.args, &event, false).await.unwrap();
        assert_eq!(exit, Exit::Selected);

        let log = std::fs::read_to_string(f.dir.path().join(".dispatch/decisions.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_dry_run_leaves_no_audit_trail() {
        let f = fixture();
        let event = write_event(f.dir.path(), "push", r#""api/src/main.rs""#);

        cmd_evaluate(&f.args, &event, true).await.unwrap();
        assert!(!f.dir.path().join(".dispatch/decisions.jsonl").exists());
    }

    #[tokio::test]
    async fn test_evaluate_no_match_exits_two() {
        let f = fixture();
        let event = write_event(f.dir.path(), "pull_request", r#""api/src/main.rs""#);

        let exit = cmd_evaluate(&f.args, &event, true).await.unwrap();
        assert_eq!(exit, Exit::NoMatch);
        assert_eq!(exit as u8, 2);
    }

    #[tokio::test]
    async fn test_evaluate_rejects_malformed_event() {
        let f = fixture();
        let path = f.dir.path().join("event.json");
        std::fs::write(&path, r#"{"type":"push","ref":"","actor":"dev","timestamp":"2026-03-01T12:00:00Z"}"#).unwrap();

        let err = cmd_evaluate(&f.args, &path, true).await.unwrap_err();
        assert!(format!("{err:#}").contains("Invalid event"));
    }

    #[tokio::test]
    async fn test_run_dry_run_reports_success() {
        let f = fixture();
        let event = write_event(f.dir.path(), "push", r#""api/src/main.rs""#);

        let exit = cmd_run(&f.args, &event, true, Some(1), ReportFormat::Json)
            .await
            .unwrap();
        assert_eq!(exit, Exit::Selected);

        let runs = std::fs::read_to_string(f.dir.path().join(".dispatch/runs.jsonl")).unwrap();
        assert!(!runs.is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_zero_concurrency() {
        let f = fixture();
        let event = write_event(f.dir.path(), "push", r#""api/src/main.rs""#);

        let err = cmd_run(&f.args, &event, true, Some(0), ReportFormat::Markdown)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max-concurrency"));
    }

    #[test]
    fn test_validate_reports_missing_file() {
        let args = ConfigArgs {
            config: PathBuf::from("/nonexistent/dispatch.toml"),
            workspace: PathBuf::from("."),
        };
        let err = cmd_validate(&args).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load configuration"));
    }

    #[test]
    fn test_validate_accepts_fixture() {
        let f = fixture();
        assert_eq!(cmd_validate(&f.args).unwrap(), Exit::Selected);
    }

    #[test]
    fn test_describe_resolution() {
        let rust = builtin_stack("rust").unwrap();
        assert_eq!(
            describe_resolution("api", &StackResolution::Resolved(vec![rust])),
            "api: rust (cargo)"
        );
        assert_eq!(
            describe_resolution("docs", &StackResolution::Unknown),
            "docs: unknown"
        );
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "dispatch",
            "--json",
            "run",
            "--event-file",
            "event.json",
            "--max-concurrency",
            "8",
            "--format",
            "json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                max_concurrency,
                format,
                config,
                ..
            } => {
                assert_eq!(max_concurrency, Some(8));
                assert_eq!(format, ReportFormat::Json);
                assert_eq!(config.workspace, PathBuf::from("."));
            }
            _ => panic!("expected run"),
        }
    }
}
