//! Per-stack command table for test, lint, build and publish jobs.

use std::collections::HashMap;

use dispatch_core::JobKind;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Commands keyed by `(job kind, stack id)`, plus one dependency install
/// command per stack used to warm the build cache.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: HashMap<(JobKind, String), Vec<String>>,
    install: HashMap<String, Vec<String>>,
}

impl CommandTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Conventional commands for every built-in stack.
    pub fn builtin() -> Self {
        use JobKind::*;
        let mut table = Self::empty();
        let rows: &[(&str, JobKind, &[&str])] = &[
            ("rust", Test, &["cargo", "test", "--all-features"]),
            ("rust", Lint, &["cargo", "clippy", "--all-targets", "--", "-D", "warnings"]),
            ("rust", Build, &["cargo", "build", "--release"]),
            ("rust", Publish, &["cargo", "publish", "--dry-run"]),
            ("node", Test, &["npm", "test"]),
            ("node", Lint, &["npm", "run", "lint"]),
            ("node", Build, &["npm", "run", "build"]),
            ("node", Publish, &["npm", "publish", "--dry-run"]),
            ("python", Test, &["python", "-m", "pytest"]),
            ("python", Lint, &["python", "-m", "ruff", "check", "."]),
            ("python", Build, &["python", "-m", "build"]),
            ("go", Test, &["go", "test", "./..."]),
            ("go", Lint, &["go", "vet", "./..."]),
            ("go", Build, &["go", "build", "./..."]),
            ("maven", Test, &["mvn", "-B", "test"]),
            ("maven", Lint, &["mvn", "-B", "checkstyle:check"]),
            ("maven", Build, &["mvn", "-B", "package", "-DskipTests"]),
            ("gradle", Test, &["gradle", "test"]),
            ("gradle", Lint, &["gradle", "check", "-x", "test"]),
            ("gradle", Build, &["gradle", "assemble"]),
            ("bundler", Test, &["bundle", "exec", "rake", "test"]),
            ("bundler", Lint, &["bundle", "exec", "rubocop"]),
            ("bundler", Build, &["gem", "build"]),
            ("composer", Test, &["composer", "test"]),
            ("composer", Lint, &["composer", "run", "lint"]),
            ("docker", Lint, &["hadolint", "Dockerfile"]),
            ("docker", Build, &["docker", "build", "."]),
        ];
        for (stack, kind, command) in rows {
            table = table.with_command(*kind, stack, argv(command));
        }

        let installs: &[(&str, &[&str])] = &[
            ("rust", &["cargo", "fetch"]),
            ("node", &["npm", "ci"]),
            ("python", &["python", "-m", "pip", "install", "-e", "."]),
            ("go", &["go", "mod", "download"]),
            ("maven", &["mvn", "-B", "dependency:go-offline"]),
            ("bundler", &["bundle", "install"]),
            ("composer", &["composer", "install"]),
        ];
        for (stack, command) in installs {
            table = table.with_install(stack, argv(command));
        }
        table
    }

    pub fn with_command(mut self, kind: JobKind, stack: &str, command: Vec<String>) -> Self {
        self.commands.insert((kind, stack.to_string()), command);
        self
    }

    pub fn with_install(mut self, stack: &str, command: Vec<String>) -> Self {
        self.install.insert(stack.to_string(), command);
        self
    }

    pub fn command(&self, kind: JobKind, stack: &str) -> Option<&[String]> {
        self.commands
            .get(&(kind, stack.to_string()))
            .map(Vec::as_slice)
    }

    pub fn install_command(&self, stack: &str) -> Option<&[String]> {
        self.install.get(stack).map(Vec::as_slice)
    }
}
