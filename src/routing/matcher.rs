//! Path prefix matching.
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Prefixes match whole segments: `/api/users` matches `/api/users/1`
//!   but not `/api/usersettings`
//! - No regex to guarantee O(n) matching

/// Matches a request path against a configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher. A trailing slash is ignored.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_end_matches('/');
        Self {
            prefix: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Segments in the prefix; longer prefixes are more specific.
    pub fn specificity(&self) -> usize {
        self.prefix.split('/').filter(|s| !s.is_empty()).count()
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }

    /// `path` with the prefix removed, always starting with `/`.
    pub fn strip(&self, path: &str) -> String {
        if self.prefix == "/" {
            return path.to_string();
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{}", rest),
            None => path.to_string(),
        }
    }
}
