use crate::error::{MemoExecError, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Which entry types an exclusion applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionKind {
    Files,
    Directories,
    #[default]
    All,
}

/// A glob over exec-root-relative paths that removes matches from the input tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputExclusion {
    pub pattern: String,
    #[serde(default)]
    pub kind: ExclusionKind,
}

impl InputExclusion {
    pub fn new(pattern: impl Into<String>, kind: ExclusionKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }
}

/// Compiled exclusion patterns
#[derive(Debug, Default)]
pub struct ExclusionRules {
    patterns: Vec<(Pattern, ExclusionKind)>,
}

impl ExclusionRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A malformed pattern is an error rather than silently matching nothing.
    pub fn new(exclusions: &[InputExclusion]) -> Result<Self> {
        let patterns = exclusions
            .iter()
            .map(|ex| {
                Pattern::new(&ex.pattern)
                    .map(|p| (p, ex.kind))
                    .map_err(|e| {
                        MemoExecError::Local(format!(
                            "invalid exclusion pattern {:?}: {}",
                            ex.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if `path` (relative, `/`-separated) or any of its parent
    /// directories is excluded.
    pub fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
        if self.patterns.is_empty() || path.is_empty() {
            return false;
        }
        if self.matches(path, is_dir) {
            return true;
        }
        let mut ancestor = path;
        while let Some((parent, _)) = ancestor.rsplit_once('/') {
            if self.matches(parent, true) {
                return true;
            }
            ancestor = parent;
        }
        false
    }

    fn matches(&self, path: &str, is_dir: bool) -> bool {
        self.patterns.iter().any(|(pattern, kind)| {
            let applies = match kind {
                ExclusionKind::All => true,
                ExclusionKind::Files => !is_dir,
                ExclusionKind::Directories => is_dir,
            };
            applies && pattern.matches(path)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(specs: &[(&str, ExclusionKind)]) -> ExclusionRules {
        let exclusions: Vec<_> = specs
            .iter()
            .map(|(p, k)| InputExclusion::new(*p, *k))
            .collect();
        ExclusionRules::new(&exclusions).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let rules = rules(&[("node_modules", ExclusionKind::All), (".git", ExclusionKind::All)]);
        assert!(rules.is_excluded("node_modules", true));
        assert!(rules.is_excluded(".git", true));
        assert!(!rules.is_excluded("src", true));
    }

    #[test]
    fn test_wildcard() {
        let rules = rules(&[("*.log", ExclusionKind::All)]);
        assert!(rules.is_excluded("build.log", false));
        assert!(!rules.is_excluded("main.rs", false));
    }

    #[test]
    fn test_parent_directory_excludes_children() {
        let rules = rules(&[("out", ExclusionKind::Directories)]);
        assert!(rules.is_excluded("out/obj/a.o", false));
        assert!(!rules.is_excluded("src/out.rs", false));
    }

    #[test]
    fn test_kind_filter() {
        let rules = rules(&[("gen*", ExclusionKind::Files)]);
        assert!(rules.is_excluded("generated.h", false));
        assert!(!rules.is_excluded("gen", true));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        let bad = [InputExclusion::new("[", ExclusionKind::All)];
        assert!(ExclusionRules::new(&bad).is_err());
    }
}
