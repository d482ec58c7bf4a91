// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry Domain
//!
//! A registration advertises an agent's identity, capabilities and topic
//! subscriptions within one tenant/project. Liveness is lease-based: an agent
//! whose lease lapses without a heartbeat becomes `UNAVAILABLE` and drops out
//! of discovery.
//!
//! ```text
//! STARTING ──heartbeat──► HEALTHY ◄──► DEGRADED
//!     │                      │             │
//!     └──────── lease expiry / mark_unavailable ──► UNAVAILABLE
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::envelope::AgentIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Starting,
    Healthy,
    Degraded,
    Unavailable,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Starting => "STARTING",
            AgentStatus::Healthy => "HEALTHY",
            AgentStatus::Degraded => "DEGRADED",
            AgentStatus::Unavailable => "UNAVAILABLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "STARTING" => Some(AgentStatus::Starting),
            "HEALTHY" => Some(AgentStatus::Healthy),
            "DEGRADED" => Some(AgentStatus::Degraded),
            "UNAVAILABLE" => Some(AgentStatus::Unavailable),
            _ => None,
        }
    }

    /// Statuses returned by discovery unless the query says otherwise.
    pub fn discoverable() -> Vec<AgentStatus> {
        vec![AgentStatus::Healthy, AgentStatus::Degraded]
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicRole {
    Publisher,
    Subscriber,
    Both,
}

impl TopicRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicRole::Publisher => "publisher",
            TopicRole::Subscriber => "subscriber",
            TopicRole::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "publisher" => Some(TopicRole::Publisher),
            "subscriber" => Some(TopicRole::Subscriber),
            "both" => Some(TopicRole::Both),
            _ => None,
        }
    }

    pub fn receives(&self) -> bool {
        matches!(self, TopicRole::Subscriber | TopicRole::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic: String,
    pub role: TopicRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub identity: AgentIdentity,
    pub tenant: String,
    pub project: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    #[serde(default)]
    pub topics: Vec<TopicSubscription>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new<I, S>(identity: AgentIdentity, tenant: impl Into<String>, project: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            identity,
            tenant: tenant.into(),
            project: project.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Starting,
            last_heartbeat: now,
            lease_until: now,
            topics: Vec::new(),
            registered_at: now,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.identity.id
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.status != AgentStatus::Unavailable && self.lease_until >= now
    }

    /// Topic this agent accepts direct work on, if it advertised a concrete one.
    pub fn inbound_topic(&self) -> Option<&str> {
        self.topics
            .iter()
            .find(|t| t.role.receives() && !t.topic.contains('*'))
            .map(|t| t.topic.as_str())
    }
}

/// Proof of liveness granted by `register` and renewed by `heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub agent_id: String,
    pub status: AgentStatus,
    pub lease_until: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub tenant: String,
    pub project: String,
    /// Every listed capability must be advertised.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "AgentStatus::discoverable")]
    pub statuses: Vec<AgentStatus>,
    #[serde(default)]
    pub agent_type: Option<String>,
}

impl DiscoveryQuery {
    pub fn new(tenant: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            capabilities: Vec::new(),
            statuses: AgentStatus::discoverable(),
            agent_type: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<AgentStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn matches(&self, registration: &AgentRegistration) -> bool {
        registration.tenant == self.tenant
            && registration.project == self.project
            && self.statuses.contains(&registration.status)
            && self.capabilities.iter().all(|c| registration.has_capability(c))
            && self
                .agent_type
                .as_ref()
                .is_none_or(|t| &registration.identity.agent_type == t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> AgentRegistration {
        let mut reg = AgentRegistration::new(
            AgentIdentity::new("specialist", "healer-7", "0.4.1"),
            "acme",
            "checkout",
            ["healing.selector", "healing.retry"],
        );
        reg.status = AgentStatus::Healthy;
        reg
    }

    #[test]
    fn test_query_filters_by_scope_status_and_capability() {
        let reg = registration();
        assert!(DiscoveryQuery::new("acme", "checkout").with_capability("healing.selector").matches(&reg));
        assert!(!DiscoveryQuery::new("acme", "billing").matches(&reg));
        assert!(!DiscoveryQuery::new("acme", "checkout").with_capability("triage").matches(&reg));

        let mut gone = reg.clone();
        gone.status = AgentStatus::Unavailable;
        assert!(!DiscoveryQuery::new("acme", "checkout").matches(&gone));
        assert!(DiscoveryQuery::new("acme", "checkout")
            .with_statuses(vec![AgentStatus::Unavailable])
            .matches(&gone));
    }

    #[test]
    fn test_inbound_topic_skips_patterns_and_publish_only() {
        let mut reg = registration();
        reg.topics = vec![
            TopicSubscription { topic: "qa.acme.checkout.specialist.*.invoke".into(), role: TopicRole::Subscriber },
            TopicSubscription { topic: "qa.acme.checkout.specialist.healer-7.status".into(), role: TopicRole::Publisher },
            TopicSubscription { topic: "qa.acme.checkout.specialist.healer-7.invoke".into(), role: TopicRole::Both },
        ];
        assert_eq!(reg.inbound_topic(), Some("qa.acme.checkout.specialist.healer-7.invoke"));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&AgentStatus::Unavailable).unwrap(), "\"UNAVAILABLE\"");
        assert_eq!(AgentStatus::parse("degraded"), Some(AgentStatus::Degraded));
    }
}
