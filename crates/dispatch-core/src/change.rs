//! Change detection: map changed paths to affected components.
//!
//! Each path is claimed by at most one component pattern. When several
//! patterns match, the most specific wins: longest literal prefix, then the
//! longer pattern, then component declaration order. A path matching a
//! shared pattern affects every component; a path nobody claims goes to
//! the `infrastructure` pseudo-component.

use std::collections::BTreeSet;

use globset::{GlobMatcher, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::domain::component::{literal_prefix, Component, INFRASTRUCTURE_COMPONENT};
use crate::domain::error::ValidationError;
use crate::domain::pipeline::compile_glob;

/// Why a path landed where it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum PathOrigin {
    Component { component_id: String, pattern: String },
    Shared { pattern: String },
    Unmatched,
}

/// Match record for one changed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMatch {
    pub path: String,
    #[serde(flatten)]
    pub origin: PathOrigin,
}

/// Affected components plus the per-path evidence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub affected: BTreeSet<String>,
    pub matches: Vec<PathMatch>,
}

#[derive(Debug, Clone)]
struct PatternRule {
    component_id: String,
    pattern: String,
    matcher: GlobMatcher,
}

/// Compiled change detector for one configuration.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    /// Sorted most-specific first.
    rules: Vec<PatternRule>,
    shared: GlobSet,
    shared_patterns: Vec<String>,
    component_ids: Vec<String>,
}

impl ChangeDetector {
    pub fn new(components: &[Component], shared_patterns: &[String]) -> Result<Self, ValidationError> {
        let mut ranked = Vec::new();
        for (component_index, component) in components.iter().enumerate() {
            for (pattern_index, pattern) in component.path_patterns.iter().enumerate() {
                let rule = PatternRule {
                    component_id: component.id.clone(),
                    pattern: pattern.clone(),
                    matcher: compile_glob(pattern)?.compile_matcher(),
                };
                let specificity = (literal_prefix(pattern).len(), pattern.len());
                ranked.push((specificity, component_index, pattern_index, rule));
            }
        }
        // Specificity descending, then declaration order ascending.
        ranked.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut builder = GlobSetBuilder::new();
        for pattern in shared_patterns {
            builder.add(compile_glob(pattern)?);
        }
        let shared = builder.build().map_err(|e| ValidationError::InvalidGlob {
            pattern: shared_patterns.join(","),
            reason: e.to_string(),
        })?;

        Ok(Self {
            rules: ranked.into_iter().map(|(_, _, _, rule)| rule).collect(),
            shared,
            shared_patterns: shared_patterns.to_vec(),
            component_ids: components.iter().map(|c| c.id.clone()).collect(),
        })
    }

    /// Classify a single path.
    pub fn classify(&self, path: &str) -> PathOrigin {
        if let Some(&idx) = self.shared.matches(path).first() {
            return PathOrigin::Shared {
                pattern: self.shared_patterns[idx].clone(),
            };
        }
        self.rules
            .iter()
            .find(|rule| rule.matcher.is_match(path))
            .map(|rule| PathOrigin::Component {
                component_id: rule.component_id.clone(),
                pattern: rule.pattern.clone(),
            })
            .unwrap_or(PathOrigin::Unmatched)
    }

    pub fn detect<'a, I>(&self, changed_files: I) -> ChangeSet
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut set = ChangeSet::default();
        for path in changed_files {
            let origin = self.classify(path);
            match &origin {
                PathOrigin::Shared { .. } => set.affected.extend(self.component_ids.iter().cloned()),
                PathOrigin::Component { component_id, .. } => {
                    set.affected.insert(component_id.clone());
                }
                PathOrigin::Unmatched => {
                    set.affected.insert(INFRASTRUCTURE_COMPONENT.to_string());
                }
            }
            set.matches.push(PathMatch {
                path: path.clone(),
                origin,
            });
        }
        set
    }
}

/// One-shot detection without building a reusable detector.
pub fn detect(
    changed_files: &BTreeSet<String>,
    components: &[Component],
    shared_patterns: &[String],
) -> Result<BTreeSet<String>, ValidationError> {
    Ok(ChangeDetector::new(components, shared_patterns)?
        .detect(changed_files)
        .affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn components() -> Vec<Component> {
        vec![
            Component::new("frontend", vec!["frontend/**".to_string()]),
            Component::new("backend", vec!["backend/**".to_string()]),
            Component::new(
                "backend-api",
                vec!["backend/api/**".to_string(), "openapi.yaml".to_string()],
            ),
        ]
    }

    #[test]
    fn test_frontend_only_change() {
        let affected = detect(&files(&["frontend/app.tsx"]), &components(), &[]).unwrap();
        assert_eq!(affected, files(&["frontend"]));
    }

    #[test]
    fn test_most_specific_pattern_wins() {
        let affected = detect(&files(&["backend/api/routes.py"]), &components(), &[]).unwrap();
        assert_eq!(affected, files(&["backend-api"]));

        let affected = detect(&files(&["backend/db.py"]), &components(), &[]).unwrap();
        assert_eq!(affected, files(&["backend"]));
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let comps = vec![
            Component::new("first", vec!["lib/**".to_string()]),
            Component::new("second", vec!["lib/**".to_string()]),
        ];
        let affected = detect(&files(&["lib/x.rs"]), &comps, &[]).unwrap();
        assert_eq!(affected, files(&["first"]));
    }

    #[test]
    fn test_shared_pattern_affects_everything() {
        let shared = vec!["shared/**".to_string()];
        let affected = detect(&files(&["shared/lib.py"]), &components(), &shared).unwrap();
        assert_eq!(affected, files(&["frontend", "backend", "backend-api"]));
    }

    #[test]
    fn test_unmatched_goes_to_infrastructure() {
        let affected = detect(
            &files(&[".github/workflows/ci.yml", "frontend/index.html"]),
            &components(),
            &[],
        )
        .unwrap();
        assert_eq!(affected, files(&["frontend", INFRASTRUCTURE_COMPONENT]));
    }

    #[test]
    fn test_single_star_does_not_cross_directories() {
        let comps = vec![Component::new("top", vec!["src/*.rs".to_string()])];
        let detector = ChangeDetector::new(&comps, &[]).unwrap();
        assert!(matches!(
            detector.classify("src/main.rs"),
            PathOrigin::Component { .. }
        ));
        assert_eq!(detector.classify("src/nested/mod.rs"), PathOrigin::Unmatched);
    }

    #[test]
    fn test_match_trail_records_patterns() {
        let detector = ChangeDetector::new(&components(), &["shared/**".to_string()]).unwrap();
        let set = detector.detect(&files(&["backend/api/x.py", "shared/a.py", "README.md"]));
        // Paths are visited in sorted order: README.md, backend/..., shared/...
        assert_eq!(set.matches.len(), 3);
        assert_eq!(set.matches[0].origin, PathOrigin::Unmatched);
        assert_eq!(
            set.matches[1].origin,
            PathOrigin::Component {
                component_id: "backend-api".to_string(),
                pattern: "backend/api/**".to_string()
            }
        );
        assert!(matches!(set.matches[2].origin, PathOrigin::Shared { .. }));
    }

    #[test]
    fn test_empty_changes_affect_nothing() {
        assert!(detect(&BTreeSet::new(), &components(), &[]).unwrap().is_empty());
    }
}
