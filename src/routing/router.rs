//! Static upstream table.
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Longest matching prefix wins; ties keep configuration order
//! - Explicit `None` rather than a silent default upstream

use crate::config::UpstreamConfig;
use crate::routing::matcher::PathPrefixMatcher;

#[derive(Debug, Clone)]
pub struct Upstream {
    pub name: String,
    pub base_url: String,
    matcher: PathPrefixMatcher,
    strip_prefix: bool,
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub service: String,
    pub base_url: String,
    /// Path and query to request from the upstream.
    pub forward_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamTable {
    upstreams: Vec<Upstream>,
}

impl UpstreamTable {
    pub fn from_config(configs: &[UpstreamConfig]) -> Self {
        let mut upstreams: Vec<Upstream> = configs
            .iter()
            .map(|c| Upstream {
                name: c.name.clone(),
                base_url: c.base_url.trim_end_matches('/').to_string(),
                matcher: PathPrefixMatcher::new(c.path_prefix.clone()),
                strip_prefix: c.strip_prefix,
            })
            .collect();
        // Stable sort keeps configuration order among equal prefixes.
        upstreams.sort_by_key(|u| std::cmp::Reverse(u.matcher.specificity()));
        Self { upstreams }
    }

    /// Resolve `path_and_query` to an upstream.
    pub fn resolve(&self, path_and_query: &str) -> Option<ResolvedRoute> {
        let path = path_and_query.split('?').next().unwrap_or(path_and_query);
        let upstream = self.upstreams.iter().find(|u| u.matcher.matches(path))?;

        let forward_path = if upstream.strip_prefix {
            upstream.matcher.strip(path_and_query)
        } else {
            path_and_query.to_string()
        };
        Some(ResolvedRoute {
            service: upstream.name.clone(),
            base_url: upstream.base_url.clone(),
            forward_path,
        })
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
