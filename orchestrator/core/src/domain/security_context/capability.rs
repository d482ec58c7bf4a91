// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Scope & Capability Grants
//!
//! Bearer tokens carry `scopes`, capability tokens carry `capabilities`. Both
//! are lists of grant patterns evaluated by [`ScopePattern::allows`]:
//!
//! | Pattern | Kind | Covers |
//! |---------|------|--------|
//! | `*` | any | everything |
//! | `envelope:*` | wildcard | `envelope` and every `envelope:<x>` |
//! | `repo.write:healing/*` | namespace | `repo.write:healing/<anything>` |
//! | `healing.*` | prefix | `healing.<anything>` |
//! | `healing.selector` | exact | only itself |
//!
//! Matching is case-sensitive. Namespace and prefix grants never cover the bare
//! namespace itself (`healing.*` does not grant `healing`).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopePattern {
    Any,
    Exact(String),
    Wildcard { resource: String },
    Namespace { action: String, prefix: String },
    Prefix(String),
}

impl ScopePattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return ScopePattern::Any;
        }
        if let Some(resource) = raw.strip_suffix(":*") {
            return ScopePattern::Wildcard {
                resource: resource.to_string(),
            };
        }
        if let Some(stem) = raw.strip_suffix("/*") {
            if let Some((action, prefix)) = stem.split_once(':') {
                return ScopePattern::Namespace {
                    action: action.to_string(),
                    prefix: prefix.to_string(),
                };
            }
        }
        if let Some(prefix) = raw.strip_suffix(".*") {
            return ScopePattern::Prefix(prefix.to_string());
        }
        ScopePattern::Exact(raw.to_string())
    }

    pub fn allows(&self, required: &str) -> bool {
        match self {
            ScopePattern::Any => true,
            ScopePattern::Exact(scope) => scope == required,
            ScopePattern::Wildcard { resource } => {
                required == resource
                    || required
                        .strip_prefix(resource.as_str())
                        .is_some_and(|rest| rest.starts_with(':'))
            }
            ScopePattern::Namespace { action, prefix } => required
                .split_once(':')
                .filter(|(req_action, _)| req_action == action)
                .and_then(|(_, path)| path.strip_prefix(prefix.as_str()))
                .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/')),
            ScopePattern::Prefix(prefix) => required
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.')),
        }
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopePattern::Any => f.write_str("*"),
            ScopePattern::Exact(s) => f.write_str(s),
            ScopePattern::Wildcard { resource } => write!(f, "{resource}:*"),
            ScopePattern::Namespace { action, prefix } => write!(f, "{action}:{prefix}/*"),
            ScopePattern::Prefix(p) => write!(f, "{p}.*"),
        }
    }
}

/// Parsed grant list from a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct GrantSet {
    patterns: Vec<ScopePattern>,
}

impl GrantSet {
    pub fn new<I, S>(grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: grants.into_iter().map(|g| ScopePattern::parse(g.as_ref())).collect(),
        }
    }

    pub fn allows(&self, required: &str) -> bool {
        self.patterns.iter().any(|p| p.allows(required))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl From<Vec<String>> for GrantSet {
    fn from(value: Vec<String>) -> Self {
        Self::new(value)
    }
}

impl From<GrantSet> for Vec<String> {
    fn from(value: GrantSet) -> Self {
        value.patterns.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_and_exact() {
        assert!(ScopePattern::parse("*").allows("envelope:TaskRequest"));
        let exact = ScopePattern::parse("healing.selector");
        assert!(exact.allows("healing.selector"));
        assert!(!exact.allows("healing.selector.v2"));
        assert!(!exact.allows("Healing.selector"));
    }

    #[test]
    fn test_resource_wildcard() {
        let pattern = ScopePattern::parse("envelope:*");
        assert_eq!(pattern, ScopePattern::Wildcard { resource: "envelope".into() });
        assert!(pattern.allows("envelope:TaskRequest"));
        assert!(pattern.allows("envelope"));
        assert!(!pattern.allows("envelopes:TaskRequest"));
    }

    #[test]
    fn test_namespace() {
        let pattern = ScopePattern::parse("repo.write:healing/*");
        assert!(pattern.allows("repo.write:healing/selector"));
        assert!(pattern.allows("repo.write:healing/a/b"));
        assert!(!pattern.allows("repo.write:healing"));
        assert!(!pattern.allows("repo.write:healing-extra/x"));
        assert!(!pattern.allows("repo.read:healing/selector"));
    }

    #[test]
    fn test_prefix() {
        let pattern = ScopePattern::parse("healing.*");
        assert!(pattern.allows("healing.selector"));
        assert!(!pattern.allows("healing"));
        assert!(!pattern.allows("healingx.selector"));
    }

    #[test]
    fn test_grant_set_round_trips_through_serde() {
        let grants: GrantSet = serde_json::from_str(r#"["envelope:*", "healing.selector"]"#).unwrap();
        assert!(grants.allows("envelope:ContextRequest"));
        assert!(grants.allows("healing.selector"));
        assert!(!grants.allows("triage.run"));
        let back: Vec<String> = grants.into();
        assert_eq!(back, vec!["envelope:*".to_string(), "healing.selector".to_string()]);
    }
}
