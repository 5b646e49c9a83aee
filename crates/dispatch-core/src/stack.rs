//! Stack resolution from signature files in a component root.
//!
//! A component resolves to zero or more stacks (`rust`, `node`, `python`,
//! ...). Resolution runs once at startup and is stored in a [`StackIndex`]
//! so dispatch itself never touches the filesystem.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::component::Component;
use crate::domain::digest;
use crate::domain::job::CacheKey;

/// A signature file and the stack it implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRule {
    /// File whose presence identifies the stack.
    pub file: String,
    /// Another file that must also be present (e.g. a lockfile).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    pub stack: String,
    pub language: String,
    pub package_manager: String,
    pub build_tool: String,
    /// Lockfile hashed into the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<String>,
}

impl SignatureRule {
    fn builtin(
        file: &str,
        requires: Option<&str>,
        stack: &str,
        package_manager: &str,
        build_tool: &str,
        lockfile: Option<&str>,
    ) -> Self {
        let language = match stack {
            "maven" | "gradle" => "java",
            "bundler" => "ruby",
            "composer" => "php",
            other => other,
        };
        Self {
            file: file.to_string(),
            requires: requires.map(str::to_string),
            stack: stack.to_string(),
            language: language.to_string(),
            package_manager: package_manager.to_string(),
            build_tool: build_tool.to_string(),
            lockfile: lockfile.map(str::to_string),
        }
    }
}

/// The built-in signature table. Rules are tried in order; the first rule
/// that matches wins for its stack id.
pub fn builtin_signatures() -> Vec<SignatureRule> {
    use SignatureRule as R;
    vec![
        R::builtin("Cargo.toml", None, "rust", "cargo", "cargo", Some("Cargo.lock")),
        R::builtin(
            "package.json",
            Some("pnpm-lock.yaml"),
            "node",
            "pnpm",
            "pnpm",
            Some("pnpm-lock.yaml"),
        ),
        R::builtin("package.json", Some("yarn.lock"), "node", "yarn", "yarn", Some("yarn.lock")),
        R::builtin("package.json", None, "node", "npm", "npm", Some("package-lock.json")),
        R::builtin("pyproject.toml", Some("poetry.lock"), "python", "poetry", "poetry", Some("poetry.lock")),
        R::builtin("pyproject.toml", Some("uv.lock"), "python", "uv", "uv", Some("uv.lock")),
        R::builtin("pyproject.toml", None, "python", "pip", "pip", Some("requirements.txt")),
        R::builtin("requirements.txt", None, "python", "pip", "pip", Some("requirements.txt")),
        R::builtin("setup.py", None, "python", "pip", "setuptools", None),
        R::builtin("go.mod", None, "go", "go", "go", Some("go.sum")),
        R::builtin("pom.xml", None, "maven", "maven", "maven", None),
        R::builtin("build.gradle", None, "gradle", "gradle", "gradle", Some("gradle.lockfile")),
        R::builtin("build.gradle.kts", None, "gradle", "gradle", "gradle", Some("gradle.lockfile")),
        R::builtin("Gemfile", None, "bundler", "bundler", "bundler", Some("Gemfile.lock")),
        R::builtin("composer.json", None, "composer", "composer", "composer", Some("composer.lock")),
        R::builtin("Dockerfile", None, "docker", "docker", "docker", None),
    ]
}

/// A stack detected in a component root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackInfo {
    pub id: String,
    pub language: String,
    pub package_manager: String,
    pub build_tool: String,
    /// Signature file that identified the stack.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile_hash: Option<String>,
}

impl StackInfo {
    pub fn cache_key(&self, component_id: &str) -> CacheKey {
        CacheKey {
            component_id: component_id.to_string(),
            stack: self.id.clone(),
            lockfile_hash: self
                .lockfile_hash
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        }
    }
}

/// Outcome of resolving one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "stacks", rename_all = "snake_case")]
pub enum StackResolution {
    Resolved(Vec<StackInfo>),
    Unknown,
}

impl StackResolution {
    pub fn stacks(&self) -> &[StackInfo] {
        match self {
            StackResolution::Resolved(stacks) => stacks,
            StackResolution::Unknown => &[],
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, StackResolution::Unknown)
    }

    /// Languages and stack ids, for selector matching.
    pub fn tags(&self) -> BTreeSet<&str> {
        self.stacks()
            .iter()
            .flat_map(|s| [s.id.as_str(), s.language.as_str()])
            .collect()
    }
}

/// Where signature files are looked up.
pub trait SignatureSource: Send + Sync {
    /// File names directly inside `root` (no recursion).
    fn list_files(&self, root: &str) -> BTreeSet<String>;

    /// Contents of `root/name`, if readable.
    fn read_file(&self, root: &str, name: &str) -> Option<Vec<u8>>;
}

/// Reads signature files from a workspace checkout.
#[derive(Debug, Clone)]
pub struct FsSignatureSource {
    workspace: PathBuf,
}

impl FsSignatureSource {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    fn dir(&self, root: &str) -> PathBuf {
        if root == "." || root.is_empty() {
            self.workspace.clone()
        } else {
            self.workspace.join(Path::new(root))
        }
    }
}

impl SignatureSource for FsSignatureSource {
    fn list_files(&self, root: &str) -> BTreeSet<String> {
        let dir = self.dir(root);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "component root not readable");
                return BTreeSet::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }

    fn read_file(&self, root: &str, name: &str) -> Option<Vec<u8>> {
        std::fs::read(self.dir(root).join(name)).ok()
    }
}

/// In-memory file listing, keyed by component root.
#[derive(Debug, Clone, Default)]
pub struct StaticSignatureSource {
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl StaticSignatureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, root: &str, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files
            .entry(root.to_string())
            .or_default()
            .insert(name.to_string(), contents.into());
        self
    }
}

impl SignatureSource for StaticSignatureSource {
    fn list_files(&self, root: &str) -> BTreeSet<String> {
        self.files
            .get(root)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn read_file(&self, root: &str, name: &str) -> Option<Vec<u8>> {
        self.files.get(root)?.get(name).cloned()
    }
}

/// Matches signature files against an ordered rule table.
#[derive(Debug, Clone)]
pub struct StackResolver {
    rules: Vec<SignatureRule>,
}

impl Default for StackResolver {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl StackResolver {
    /// Configured rules are consulted before the built-in table.
    pub fn new(configured: &[SignatureRule]) -> Self {
        let mut rules = configured.to_vec();
        rules.extend(builtin_signatures());
        Self { rules }
    }

    pub fn resolve(&self, component: &Component, source: &dyn SignatureSource) -> StackResolution {
        let root = component.root_dir();
        let files = source.list_files(&root);

        let mut seen = BTreeSet::new();
        let mut stacks = Vec::new();
        for rule in &self.rules {
            if seen.contains(rule.stack.as_str()) || !files.contains(&rule.file) {
                continue;
            }
            if let Some(required) = &rule.requires {
                if !files.contains(required) {
                    continue;
                }
            }
            let lockfile_hash = rule
                .lockfile
                .as_ref()
                .filter(|lock| files.contains(*lock))
                .and_then(|lock| source.read_file(&root, lock))
                .map(|bytes| digest::sha256_hex(&bytes));
            seen.insert(rule.stack.clone());
            stacks.push(StackInfo {
                id: rule.stack.clone(),
                language: rule.language.clone(),
                package_manager: rule.package_manager.clone(),
                build_tool: rule.build_tool.clone(),
                signature: rule.file.clone(),
                lockfile_hash,
            });
        }

        if stacks.is_empty() {
            StackResolution::Unknown
        } else {
            StackResolution::Resolved(stacks)
        }
    }
}

/// Resolved stacks for every configured component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackIndex {
    by_component: BTreeMap<String, StackResolution>,
}

impl StackIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_all(
        components: &[Component],
        resolver: &StackResolver,
        source: &dyn SignatureSource,
    ) -> Self {
        let by_component = components
            .iter()
            .map(|c| {
                let resolution = resolver.resolve(c, source);
                if resolution.is_unknown() {
                    crate::obs::emit_stack_unknown(&c.id, &c.root_dir());
                }
                (c.id.clone(), resolution)
            })
            .collect();
        Self { by_component }
    }

    pub fn insert(&mut self, component_id: impl Into<String>, resolution: StackResolution) {
        self.by_component.insert(component_id.into(), resolution);
    }

    pub fn with(mut self, component_id: &str, stacks: Vec<StackInfo>) -> Self {
        let resolution = if stacks.is_empty() {
            StackResolution::Unknown
        } else {
            StackResolution::Resolved(stacks)
        };
        self.insert(component_id, resolution);
        self
    }

    /// Missing components resolve to `Unknown`.
    pub fn get(&self, component_id: &str) -> &StackResolution {
        static UNKNOWN: StackResolution = StackResolution::Unknown;
        self.by_component.get(component_id).unwrap_or(&UNKNOWN)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StackResolution)> {
        self.by_component.iter()
    }
}

/// Minimal `StackInfo` for a built-in stack id, without a lockfile.
pub fn builtin_stack(stack_id: &str) -> Option<StackInfo> {
    builtin_signatures()
        .into_iter()
        .find(|r| r.stack == stack_id && r.requires.is_none())
        .map(|r| StackInfo {
            id: r.stack,
            language: r.language,
            package_manager: r.package_manager,
            build_tool: r.build_tool,
            signature: r.file,
            lockfile_hash: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(id: &str) -> Component {
        Component::new(id, vec![format!("{id}/**")])
    }

    #[test]
    fn test_resolves_node_with_pnpm_lockfile() {
        let source = StaticSignatureSource::new()
            .with_file("web", "package.json", "{}")
            .with_file("web", "pnpm-lock.yaml", "lockfileVersion: 9");
        let resolution = StackResolver::default().resolve(&component("web"), &source);

        let stacks = resolution.stacks();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].id, "node");
        assert_eq!(stacks[0].package_manager, "pnpm");
        assert_eq!(
            stacks[0].lockfile_hash.as_deref(),
            Some(digest::sha256_hex(b"lockfileVersion: 9").as_str())
        );
    }

    #[test]
    fn test_npm_is_the_node_fallback() {
        let source = StaticSignatureSource::new().with_file("web", "package.json", "{}");
        let stacks = StackResolver::default()
            .resolve(&component("web"), &source)
            .stacks()
            .to_vec();
        assert_eq!(stacks[0].package_manager, "npm");
        assert!(stacks[0].lockfile_hash.is_none());
    }

    #[test]
    fn test_polyglot_component_resolves_several_stacks() {
        let source = StaticSignatureSource::new()
            .with_file("svc", "Cargo.toml", "[package]")
            .with_file("svc", "pyproject.toml", "[project]")
            .with_file("svc", "requirements.txt", "requests")
            .with_file("svc", "Dockerfile", "FROM scratch");
        let ids: Vec<String> = StackResolver::default()
            .resolve(&component("svc"), &source)
            .stacks()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec!["rust", "python", "docker"]);
    }

    #[test]
    fn test_no_signature_is_unknown() {
        let source = StaticSignatureSource::new().with_file("docs", "README.md", "# docs");
        let resolution = StackResolver::default().resolve(&component("docs"), &source);
        assert!(resolution.is_unknown());
        assert!(resolution.tags().is_empty());
    }

    #[test]
    fn test_configured_signature_takes_precedence() {
        let custom = SignatureRule {
            file: "package.json".to_string(),
            requires: Some("bun.lockb".to_string()),
            stack: "node".to_string(),
            language: "node".to_string(),
            package_manager: "bun".to_string(),
            build_tool: "bun".to_string(),
            lockfile: Some("bun.lockb".to_string()),
        };
        let source = StaticSignatureSource::new()
            .with_file("web", "package.json", "{}")
            .with_file("web", "bun.lockb", "bin");
        let resolution = StackResolver::new(&[custom]).resolve(&component("web"), &source);
        assert_eq!(resolution.stacks()[0].package_manager, "bun");
    }

    #[test]
    fn test_java_stacks_share_language() {
        let source = StaticSignatureSource::new().with_file("jvm", "build.gradle.kts", "");
        let resolution = StackResolver::default().resolve(&component("jvm"), &source);
        assert_eq!(resolution.stacks()[0].id, "gradle");
        assert!(resolution.tags().contains("java"));
    }

    #[test]
    fn test_fs_source_reads_component_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("api")).unwrap();
        std::fs::write(dir.path().join("api/go.mod"), "module api").unwrap();
        std::fs::write(dir.path().join("api/go.sum"), "h1:abc").unwrap();

        let source = FsSignatureSource::new(dir.path());
        let resolution = StackResolver::default().resolve(&component("api"), &source);
        let go = &resolution.stacks()[0];
        assert_eq!(go.id, "go");
        assert_eq!(go.lockfile_hash.as_deref(), Some(digest::sha256_hex(b"h1:abc").as_str()));

        let missing = StackResolver::default().resolve(&component("nope"), &source);
        assert!(missing.is_unknown());
    }

    #[test]
    fn test_index_defaults_to_unknown() {
        let index = StackIndex::new().with("web", vec![builtin_stack("node").unwrap()]);
        assert_eq!(index.get("web").stacks()[0].id, "node");
        assert!(index.get("api").is_unknown());
    }

    #[test]
    fn test_cache_key_uses_lockfile_hash() {
        let mut node = builtin_stack("node").unwrap();
        assert_eq!(node.cache_key("web").lockfile_hash, "none");
        node.lockfile_hash = Some("ab".repeat(32));
        assert_eq!(node.cache_key("web").lockfile_hash, "ab".repeat(32));
    }
}
