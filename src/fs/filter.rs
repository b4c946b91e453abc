//! Base-name glob filter

use crate::error::{Result, XcpError};
use crate::storage::url::base_name;
use globset::{GlobBuilder, GlobMatcher};

/// Shell-style wildcard filter (`*`, `?`, `[...]`) matched against the
/// last segment of a path only
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: String,
    matcher: Option<GlobMatcher>,
}

impl NameFilter {
    /// Compile a pattern. An empty pattern or `*` matches every name.
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        let matcher = if pattern.is_empty() || pattern == "*" {
            None
        } else {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| XcpError::Filter {
                    pattern: pattern.to_string(),
                    message: e.kind().to_string(),
                })?;
            Some(glob.compile_matcher())
        };

        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
        })
    }

    /// Filter accepting every name
    pub fn match_all() -> Self {
        Self {
            pattern: "*".to_string(),
            matcher: None,
        }
    }

    /// Source pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the base name of `path` matches
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(m) => m.is_match(base_name(path)),
        }
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::match_all()
    }
}
