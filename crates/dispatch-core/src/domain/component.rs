//! Components: independently buildable units of the repository.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved id for changes that match no configured component.
pub const INFRASTRUCTURE_COMPONENT: &str = "infrastructure";

/// What a component supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Test,
    Build,
    Deploy,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Test => "test",
            Capability::Build => "build",
            Capability::Deploy => "deploy",
        })
    }
}

fn all_capabilities() -> BTreeSet<Capability> {
    [Capability::Test, Capability::Build, Capability::Deploy]
        .into_iter()
        .collect()
}

/// A logical unit of the repository, defined by path patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    /// Directory inspected for stack signature files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Ordered glob patterns over repository-relative paths.
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub languages: BTreeSet<String>,
    #[serde(default = "all_capabilities")]
    pub capabilities: BTreeSet<Capability>,
}

impl Component {
    /// A component with every capability and no declared languages.
    pub fn new(id: impl Into<String>, path_patterns: Vec<String>) -> Self {
        Self {
            id: id.into(),
            root: None,
            path_patterns,
            languages: BTreeSet::new(),
            capabilities: all_capabilities(),
        }
    }

    /// The pseudo-component collecting unmatched paths. Only capability-free
    /// job kinds (lint) can target it.
    pub fn infrastructure() -> Self {
        Self {
            id: INFRASTRUCTURE_COMPONENT.to_string(),
            root: None,
            path_patterns: Vec::new(),
            languages: BTreeSet::new(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn is_infrastructure(&self) -> bool {
        self.id == INFRASTRUCTURE_COMPONENT
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Directory holding the component's signature files.
    ///
    /// Explicit `root` wins; otherwise the literal directory prefix of the
    /// first path pattern (`frontend/**` → `frontend`), or `.`.
    pub fn root_dir(&self) -> String {
        if let Some(root) = &self.root {
            return root.trim_end_matches('/').to_string();
        }
        let Some(first) = self.path_patterns.first() else {
            return ".".to_string();
        };
        let literal = literal_prefix(first);
        let dir = match literal.rfind('/') {
            Some(idx) => &literal[..idx],
            None => "",
        };
        if dir.is_empty() {
            ".".to_string()
        } else {
            dir.to_string()
        }
    }
}

/// The part of a glob before its first metacharacter.
pub fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("frontend/**"), "frontend/");
        assert_eq!(literal_prefix("services/api/*.py"), "services/api/");
        assert_eq!(literal_prefix("Dockerfile"), "Dockerfile");
        assert_eq!(literal_prefix("**/*.md"), "");
    }

    #[test]
    fn test_root_dir_defaults_to_pattern_prefix() {
        let c = Component::new("frontend", vec!["frontend/**".to_string()]);
        assert_eq!(c.root_dir(), "frontend");

        let c = Component::new("api", vec!["services/api/src/**".to_string()]);
        assert_eq!(c.root_dir(), "services/api/src");

        let c = Component::new("docs", vec!["**/*.md".to_string()]);
        assert_eq!(c.root_dir(), ".");

        let c = Component::new("x", vec!["x/**".to_string()]).with_root("apps/x/");
        assert_eq!(c.root_dir(), "apps/x");
    }

    #[test]
    fn test_infrastructure_has_no_capabilities() {
        let infra = Component::infrastructure();
        assert!(infra.is_infrastructure());
        assert!(!infra.has_capability(Capability::Test));
        assert!(!infra.has_capability(Capability::Deploy));
    }

    #[test]
    fn test_capabilities_default_to_all_when_omitted() {
        let c: Component =
            serde_json::from_str(r#"{"id":"web","path_patterns":["web/**"]}"#).unwrap();
        assert_eq!(c.capabilities.len(), 3);
    }
}
