//! Include/exclude glob rules deciding which paths get indexed
//!
//! A path is indexed when some include matches it and no exclude does,
//! whatever order the patterns were added in. A path no pattern matches is
//! not indexed.

use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single inclusion or exclusion rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    /// Shell glob, matched against the root-relative path
    pub expression: String,
    /// Include (`true`) or exclude (`false`)
    #[serde(default = "default_true")]
    pub include: bool,
    /// Match at any depth rather than only relative to the root
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_true() -> bool {
    true
}

impl Pattern {
    #[must_use]
    pub fn include(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            include: true,
            recursive: true,
        }
    }

    #[must_use]
    pub fn exclude(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            include: false,
            recursive: true,
        }
    }

    /// Anchor this pattern at the indexing root
    #[must_use]
    pub fn anchored(mut self) -> Self {
        self.recursive = false;
        self
    }

    /// Parse override-file syntax: `!` prefix excludes, `/` prefix anchors.
    ///
    /// ```
    /// use cadex_core::Pattern;
    ///
    /// let p = Pattern::parse_rule("!/build/**");
    /// assert!(!p.include);
    /// assert!(!p.recursive);
    /// assert_eq!(p.expression, "build/**");
    /// ```
    #[must_use]
    pub fn parse_rule(rule: &str) -> Self {
        let (include, rest) = match rule.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, rule),
        };
        let (recursive, expression) = match rest.strip_prefix('/') {
            Some(rest) => (false, rest),
            None => (true, rest),
        };
        Self {
            expression: expression.to_string(),
            include,
            recursive,
        }
    }

    /// Glob text actually compiled for this pattern
    fn effective_glob(&self) -> String {
        let expr = self.expression.trim_start_matches('/');
        if self.recursive && !expr.starts_with("**") {
            format!("**/{expr}")
        } else {
            expr.to_string()
        }
    }

    fn compile(&self) -> Result<GlobMatcher> {
        if self.expression.trim().is_empty() {
            return Err(Error::config("empty pattern expression"));
        }
        let glob = GlobBuilder::new(&self.effective_glob())
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|e| Error::config(format!("invalid pattern `{}`: {e}", self.expression)))?;
        Ok(glob.compile_matcher())
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bang = if self.include { "" } else { "!" };
        let slash = if self.recursive { "" } else { "/" };
        write!(f, "{bang}{slash}{}", self.expression)
    }
}

/// Ordered set of compiled patterns
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    rules: Vec<(Pattern, GlobMatcher)>,
}

impl PatternMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a whole pattern list, failing on the first bad expression
    pub fn from_patterns(patterns: &[Pattern]) -> Result<Self> {
        let mut matcher = Self::new();
        for pattern in patterns {
            matcher.add(pattern.clone())?;
        }
        Ok(matcher)
    }

    /// Add a recursive pattern
    ///
    /// # Errors
    /// Returns a configuration error if the expression is not a valid glob
    pub fn add_pattern(&mut self, expression: &str, include: bool) -> Result<()> {
        let pattern = if include {
            Pattern::include(expression)
        } else {
            Pattern::exclude(expression)
        };
        self.add(pattern)
    }

    /// Add a fully specified pattern
    ///
    /// # Errors
    /// Returns a configuration error if the expression is not a valid glob
    pub fn add(&mut self, pattern: Pattern) -> Result<()> {
        let matcher = pattern.compile()?;
        self.rules.push((pattern, matcher));
        Ok(())
    }

    /// Whether `path` (relative to the indexing root) should be indexed
    ///
    /// A path is indexed when at least one include matches and no exclude
    /// does. Insertion order does not matter: an exclude always beats an
    /// include.
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        let mut included = false;
        for (pattern, glob) in &self.rules {
            if !glob.is_match(path) {
                continue;
            }
            if !pattern.include {
                return false;
            }
            included = true;
        }
        included
    }

    /// Patterns in insertion order
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.rules.iter().map(|(pattern, _)| pattern)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
