//! Protected applications: bundles that are never selected for relocation.
//!
//! Patterns are shell-style globs. A pattern without `/` is matched against
//! the bundle's file name, case-insensitively (`1Password.app`, `Adobe*`).
//! A pattern containing `/` is matched against the full bundle path.

#![allow(missing_docs)]

use std::path::Path;

use regex::{Regex, RegexBuilder};

use crate::core::errors::{FusError, Result};

#[derive(Debug, Clone)]
struct GlobPattern {
    original: String,
    compiled: Regex,
    match_full_path: bool,
}

/// Compiled set of protection patterns.
#[derive(Debug, Clone, Default)]
pub struct ProtectionRegistry {
    patterns: Vec<GlobPattern>,
}

impl ProtectionRegistry {
    /// Compile every pattern; the first invalid one fails the whole registry.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Ok(GlobPattern {
                    original: pattern.clone(),
                    compiled: glob_to_regex(pattern)?,
                    match_full_path: pattern.contains('/'),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Registry that protects nothing. Used when re-scanning backup folders.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.matching_pattern(path).is_some()
    }

    /// Human-readable reason a path is protected, or `None`.
    pub fn protection_reason(&self, path: &Path) -> Option<String> {
        self.matching_pattern(path)
            .map(|pattern| format!("matches protected pattern {:?}", pattern.original))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.original.as_str())
    }

    fn matching_pattern(&self, path: &Path) -> Option<&GlobPattern> {
        let full = path.to_string_lossy().replace('\\', "/");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.patterns.iter().find(|pattern| {
            let subject = if pattern.match_full_path { &full } else { &name };
            pattern.compiled.is_match(subject)
        })
    }
}

/// Validate that a glob pattern is non-empty and compiles.
pub fn validate_glob_pattern(pattern: &str) -> Result<()> {
    glob_to_regex(pattern).map(|_| ())
}

/// Convert a shell-style glob to an anchored, case-insensitive regex.
///
/// `**` crosses path separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(FusError::InvalidConfig {
            details: "protected application pattern must not be empty".to_string(),
        });
    }

    let normalized = pattern.replace('\\', "/");
    let chars: Vec<char> = normalized.chars().collect();
    let mut regex_str = String::with_capacity(chars.len() * 2 + 2);
    regex_str.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex_str.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex_str.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex_str.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex_str.push_str("[^/]");
                i += 1;
            }
            c => {
                regex_str.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    regex_str.push('$');

    RegexBuilder::new(&regex_str)
        .case_insensitive(true)
        .build()
        .map_err(|err| FusError::InvalidConfig {
            details: format!("invalid glob pattern {pattern:?}: {err}"),
        })
}
