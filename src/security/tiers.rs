//! Rate limit tiers and the table that assigns requests to them.
//!
//! Tier selection is an ordered list of rules. Each rule may constrain the
//! path prefix, the caller's role, or both; the first rule whose conditions
//! all hold decides the tier. Requests matching no rule use `general`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named rate limit policy bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    General,
    Auth,
    Search,
    Upload,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::General,
        Tier::Auth,
        Tier::Search,
        Tier::Upload,
        Tier::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Auth => "auth",
            Tier::Search => "search",
            Tier::Upload => "upload",
            Tier::Admin => "admin",
        }
    }

    /// Built-in budget used when configuration does not override the tier.
    pub fn default_policy(&self) -> TierPolicy {
        match self {
            Tier::General => TierPolicy::new(100, 60, 0),
            Tier::Auth => TierPolicy::new(5, 15 * 60, 15 * 60),
            Tier::Search => TierPolicy::new(30, 60, 0),
            Tier::Upload => TierPolicy::new(10, 60, 5 * 60),
            Tier::Admin => TierPolicy::new(200, 60, 0),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown tier '{}'", s))
    }
}

/// Static budget of a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TierPolicy {
    /// Points available per window.
    pub points: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Penalty applied once the budget is exhausted. 0 means "until the window ends".
    #[serde(default)]
    pub block_secs: u64,
}

impl TierPolicy {
    pub const fn new(points: u32, window_secs: u64, block_secs: u64) -> Self {
        Self {
            points,
            window_secs,
            block_secs,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub fn block_ms(&self) -> u64 {
        self.block_secs.saturating_mul(1000)
    }
}

/// One row of the tier selection table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TierRule {
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub tier: Tier,
}

impl TierRule {
    pub fn path(prefix: &str, tier: Tier) -> Self {
        Self {
            path_prefix: Some(prefix.to_string()),
            role: None,
            tier,
        }
    }

    pub fn role(role: &str, tier: Tier) -> Self {
        Self {
            path_prefix: None,
            role: Some(role.to_string()),
            tier,
        }
    }

    fn matches(&self, path: &str, role: Option<&str>) -> bool {
        let path_ok = self
            .path_prefix
            .as_deref()
            .map_or(true, |prefix| matches_prefix(path, prefix));
        let role_ok = match self.role.as_deref() {
            None => true,
            Some(expected) => role.is_some_and(|r| r.eq_ignore_ascii_case(expected)),
        };
        path_ok && role_ok
    }
}

/// Prefix match on whole path segments: `/api/upload` matches
/// `/api/upload` and `/api/upload/avatar`, not `/api/uploads`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Ordered tier selection table.
#[derive(Debug, Clone)]
pub struct TierTable {
    rules: Vec<TierRule>,
}

impl TierTable {
    pub fn new(rules: Vec<TierRule>) -> Self {
        Self { rules }
    }

    /// Use the configured rules, or the built-in table when none are given.
    pub fn from_config(rules: &[TierRule]) -> Self {
        if rules.is_empty() {
            Self::default()
        } else {
            Self::new(rules.to_vec())
        }
    }

    pub fn select(&self, path: &str, role: Option<&str>) -> Tier {
        self.rules
            .iter()
            .find(|rule| rule.matches(path, role))
            .map(|rule| rule.tier)
            .unwrap_or(Tier::General)
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(vec![
            TierRule::path("/api/auth", Tier::Auth),
            TierRule::path("/api/admin", Tier::Admin),
            TierRule::role("admin", Tier::Admin),
            TierRule::path("/api/search", Tier::Search),
            TierRule::path("/api/upload", Tier::Upload),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = TierTable::default();
        assert_eq!(table.select("/api/auth/login", None), Tier::Auth);
        assert_eq!(table.select("/api/admin/users", Some("user")), Tier::Admin);
        assert_eq!(table.select("/api/properties", Some("admin")), Tier::Admin);
        assert_eq!(table.select("/api/search?q=flat", None), Tier::Search);
        assert_eq!(table.select("/api/upload/avatar", Some("user")), Tier::Upload);
        assert_eq!(table.select("/api/properties", None), Tier::General);
    }

    #[test]
    fn test_auth_routes_win_over_admin_role() {
        let table = TierTable::default();
        assert_eq!(table.select("/api/auth/refresh", Some("admin")), Tier::Auth);
    }

    #[test]
    fn test_prefix_respects_segments() {
        let table = TierTable::default();
        assert_eq!(table.select("/api/uploads", None), Tier::General);
        assert_eq!(table.select("/api/searchable", None), Tier::General);
        assert_eq!(table.select("/api/search", None), Tier::Search);
    }

    #[test]
    fn test_rule_with_path_and_role() {
        let table = TierTable::new(vec![TierRule {
            path_prefix: Some("/api/reports".into()),
            role: Some("admin".into()),
            tier: Tier::Admin,
        }]);
        assert_eq!(table.select("/api/reports/daily", Some("ADMIN")), Tier::Admin);
        assert_eq!(table.select("/api/reports/daily", Some("user")), Tier::General);
        assert_eq!(table.select("/api/reports/daily", None), Tier::General);
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("Upload".parse::<Tier>().unwrap(), Tier::Upload);
        assert!("gold".parse::<Tier>().is_err());
    }
}
