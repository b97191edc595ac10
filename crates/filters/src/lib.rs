#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `filters` compiles the exclude patterns of a backup entry into an
//! [`ExcludeSet`] the scanner consults for every directory entry. Three rule
//! shapes are recognised:
//!
//! - a trailing `/` marks a *directory-name* rule: the pattern (with an
//!   optional leading `*/` stripped) must equal the directory's name;
//! - a trailing `/**` marks a *subtree* rule: the pattern prefix matches the
//!   directory itself and everything below it, and the scanner prunes
//!   descent at the matching directory;
//! - anything else is a glob, tested against both the full relative path and
//!   the leaf name.
//!
//! Relative paths are `/`-separated regardless of platform; the scanner
//! normalises before matching.

use globset::{Glob, GlobMatcher};

/// Error returned when an exclude pattern fails to compile.
#[derive(Debug, thiserror::Error)]
#[error("invalid exclude pattern '{pattern}': {source}")]
pub struct FilterError {
    /// The pattern that failed to compile.
    pub pattern: String,
    source: globset::Error,
}

#[derive(Debug)]
enum Rule {
    /// Trailing `/`: match a directory by name.
    DirName(String),
    /// Trailing `/**`: match a subtree root and everything under it.
    Subtree(String),
    /// Glob against the full relative path or the leaf name.
    Glob { matcher: GlobMatcher },
}

/// A compiled, reusable set of exclude rules.
#[derive(Debug, Default)]
pub struct ExcludeSet {
    rules: Vec<Rule>,
}

impl ExcludeSet {
    /// Compiles `patterns` into an exclude set.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, FilterError> {
        let mut rules = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            if let Some(prefix) = pattern.strip_suffix("/**") {
                rules.push(Rule::Subtree(prefix.trim_end_matches('/').to_owned()));
            } else if let Some(name) = pattern.strip_suffix('/') {
                let name = name.strip_prefix("*/").unwrap_or(name);
                rules.push(Rule::DirName(name.to_owned()));
            } else {
                let matcher = Glob::new(pattern)
                    .map_err(|source| FilterError {
                        pattern: pattern.to_owned(),
                        source,
                    })?
                    .compile_matcher();
                rules.push(Rule::Glob { matcher });
            }
        }
        Ok(Self { rules })
    }

    /// Returns `true` when no rules are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tests whether the entry at `rel` (a `/`-separated path relative to
    /// the source root) is excluded. An excluded directory is also pruned
    /// from descent by the scanner.
    #[must_use]
    pub fn matches(&self, rel: &str, is_dir: bool) -> bool {
        let leaf = rel.rsplit('/').next().unwrap_or(rel);
        self.rules.iter().any(|rule| match rule {
            Rule::DirName(name) => is_dir && (leaf == name || rel == name),
            Rule::Subtree(prefix) => {
                rel == prefix || rel.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with('/'))
            }
            Rule::Glob { matcher } => matcher.is_match(rel) || matcher.is_match(leaf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> ExcludeSet {
        ExcludeSet::compile(patterns).expect("patterns compile")
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = set(&[]);
        assert!(set.is_empty());
        assert!(!set.matches("anything", false));
        assert!(!set.matches("any/dir", true));
    }

    #[test]
    fn glob_matches_leaf_name() {
        let set = set(&["*.log"]);
        assert!(set.matches("access.log", false));
        assert!(set.matches("sub/deep/error.log", false));
        assert!(!set.matches("access.log.gz", false));
    }

    #[test]
    fn glob_matches_full_relative_path() {
        let set = set(&["sub/*.tmp"]);
        assert!(set.matches("sub/a.tmp", false));
        assert!(!set.matches("other/a.tmp", false));
    }

    #[test]
    fn subtree_rule_matches_root_and_descendants() {
        let set = set(&[".git/**"]);
        assert!(set.matches(".git", true));
        assert!(set.matches(".git/config", false));
        assert!(set.matches(".git/objects/ab/cdef", false));
        assert!(!set.matches(".gitignore", false));
        assert!(!set.matches("src/.github", true));
    }

    #[test]
    fn dir_name_rule_requires_directory() {
        let set = set(&["node_modules/"]);
        assert!(set.matches("node_modules", true));
        assert!(set.matches("web/app/node_modules", true));
        assert!(!set.matches("node_modules", false));
    }

    #[test]
    fn dir_name_rule_strips_star_slash_prefix() {
        let set = set(&["*/cache/"]);
        assert!(set.matches("var/cache", true));
        assert!(set.matches("cache", true));
        assert!(!set.matches("cachex", true));
    }

    #[test]
    fn invalid_glob_reports_pattern() {
        let err = ExcludeSet::compile(&["[unclosed"]).unwrap_err();
        assert_eq!(err.pattern, "[unclosed");
    }

    #[test]
    fn question_mark_glob() {
        let set = set(&["file?.txt"]);
        assert!(set.matches("file1.txt", false));
        assert!(!set.matches("file10.txt", false));
    }

    #[test]
    fn empty_pattern_is_skipped() {
        let set = set(&[""]);
        assert!(set.is_empty());
    }
}
