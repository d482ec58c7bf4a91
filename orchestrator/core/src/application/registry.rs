// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry Service
//!
//! Registration, lease renewal, discovery and topic subscriptions over an
//! [`AgentRegistryRepository`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Background tasks:** [`LeaseExpiryChecker`] flips lapsed leases to
//!   `UNAVAILABLE`; [`HeartbeatTask`] keeps the local agent's lease alive.
//!
//! Expiry is eventual. Discovery filters on status, so an agent whose lease
//! lapsed since the last checker run can still be returned; callers treat the
//! invocation timeout as the final word on liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery, Lease, TopicRole, TopicSubscription};
use crate::domain::events::RegistryEvent;
use crate::domain::node_config::RegistryConfig;
use crate::domain::repository::{AgentRegistryRepository, RepositoryError};
use crate::domain::topic::{TopicError, TopicPattern};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent '{agent_id}' is not registered")]
    NotFound { agent_id: String },

    /// Lease lapsed (or the agent was marked unavailable); it must register again.
    #[error("lease of agent '{agent_id}' has expired")]
    LeaseExpired { agent_id: String },

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error(transparent)]
    InvalidTopic(#[from] TopicError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl RegistryError {
    /// Errors that mean "treat the agent as unavailable and rediscover".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. } | RegistryError::LeaseExpired { .. })
    }
}

pub struct AgentRegistry {
    repository: Arc<dyn AgentRegistryRepository>,
    events: EventBus,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(repository: Arc<dyn AgentRegistryRepository>, events: EventBus, config: RegistryConfig) -> Self {
        Self {
            repository,
            events,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create or replace a registration and grant a fresh lease.
    pub async fn register(&self, mut registration: AgentRegistration) -> Result<Lease, RegistryError> {
        if registration.agent_id().is_empty() {
            return Err(RegistryError::InvalidRegistration("agent id is empty".into()));
        }
        if registration.tenant.is_empty() || registration.project.is_empty() {
            return Err(RegistryError::InvalidRegistration(format!(
                "agent '{}' has no tenant/project scope",
                registration.agent_id()
            )));
        }
        for subscription in &registration.topics {
            TopicPattern::parse(&subscription.topic)?;
        }
        if registration.status == AgentStatus::Unavailable {
            registration.status = AgentStatus::Starting;
        }

        let now = Utc::now();
        let duration = self.config.lease_duration;
        registration.last_heartbeat = now;
        registration.lease_until = lease_deadline(now, duration);
        registration.registered_at = now;
        self.repository.upsert(&registration).await?;

        info!(
            agent_id = registration.agent_id(),
            tenant = %registration.tenant,
            project = %registration.project,
            capabilities = ?registration.capabilities,
            "Agent registered"
        );
        self.events.publish_registry_event(RegistryEvent::AgentRegistered {
            agent_id: registration.agent_id().to_string(),
            tenant: registration.tenant.clone(),
            project: registration.project.clone(),
            capabilities: registration.capabilities.iter().cloned().collect(),
            registered_at: now,
        });

        Ok(Lease {
            agent_id: registration.agent_id().to_string(),
            status: registration.status,
            lease_until: registration.lease_until,
            duration,
        })
    }

    /// Renew a lease for `lease_duration`, reporting the agent `HEALTHY`.
    pub async fn heartbeat(&self, agent_id: &str, lease_duration: Duration) -> Result<Lease, RegistryError> {
        self.heartbeat_with_status(agent_id, AgentStatus::Healthy, lease_duration).await
    }

    pub async fn heartbeat_with_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        lease_duration: Duration,
    ) -> Result<Lease, RegistryError> {
        if status == AgentStatus::Unavailable {
            return Err(RegistryError::InvalidRegistration(
                "a heartbeat cannot report UNAVAILABLE; use mark_unavailable".into(),
            ));
        }
        let now = Utc::now();
        let lease_until = lease_deadline(now, lease_duration);
        match self.repository.renew_lease(agent_id, status, now, lease_until).await? {
            Some(registration) => {
                debug!(agent_id, status = %status, lease_until = %lease_until, "Lease renewed");
                Ok(Lease {
                    agent_id: agent_id.to_string(),
                    status: registration.status,
                    lease_until: registration.lease_until,
                    duration: lease_duration,
                })
            }
            None => match self.repository.find(agent_id).await? {
                Some(_) => Err(RegistryError::LeaseExpired {
                    agent_id: agent_id.to_string(),
                }),
                None => Err(RegistryError::NotFound {
                    agent_id: agent_id.to_string(),
                }),
            },
        }
    }

    /// Registrations matching the query. Ordering is unspecified.
    pub async fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<AgentRegistration>, RegistryError> {
        Ok(self.repository.find_matching(query).await?)
    }

    pub async fn find(&self, agent_id: &str) -> Result<Option<AgentRegistration>, RegistryError> {
        Ok(self.repository.find(agent_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<AgentRegistration>, RegistryError> {
        Ok(self.repository.list_all().await?)
    }

    pub async fn mark_unavailable(&self, agent_id: &str) -> Result<(), RegistryError> {
        if !self.repository.set_status(agent_id, AgentStatus::Unavailable).await? {
            return Err(RegistryError::NotFound {
                agent_id: agent_id.to_string(),
            });
        }
        info!(agent_id, "Agent marked unavailable");
        self.events.publish_registry_event(RegistryEvent::AgentMarkedUnavailable {
            agent_id: agent_id.to_string(),
            marked_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn subscribe_topic(&self, agent_id: &str, topic: &str, role: TopicRole) -> Result<(), RegistryError> {
        TopicPattern::parse(topic)?;
        let subscription = TopicSubscription {
            topic: topic.to_string(),
            role,
        };
        if !self.repository.add_topic(agent_id, &subscription).await? {
            return Err(RegistryError::NotFound {
                agent_id: agent_id.to_string(),
            });
        }
        debug!(agent_id, topic, role = role.as_str(), "Topic subscribed");
        Ok(())
    }

    /// Returns `false` if the agent had no such subscription.
    pub async fn unsubscribe_topic(&self, agent_id: &str, topic: &str) -> Result<bool, RegistryError> {
        Ok(self.repository.remove_topic(agent_id, topic).await?)
    }

    /// Flip every lapsed lease to `UNAVAILABLE`. Returns the affected agent ids.
    pub async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>, RegistryError> {
        let expired = self.repository.expire_leases(now).await?;
        for agent_id in &expired {
            warn!(agent_id = %agent_id, "Agent lease expired");
            metrics::counter!("relay_registry_expired_total").increment(1);
            self.events.publish_registry_event(RegistryEvent::LeaseExpired {
                agent_id: agent_id.clone(),
                expired_at: now,
            });
        }
        Ok(expired)
    }

    /// Hard-delete registrations that went `UNAVAILABLE` more than `retention` ago.
    pub async fn purge_unavailable(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64, RegistryError> {
        let cutoff = now - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        Ok(self.repository.purge_unavailable_before(cutoff).await?)
    }
}

fn lease_deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

/// Background task that periodically expires lapsed leases.
pub struct LeaseExpiryChecker {
    registry: Arc<AgentRegistry>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl LeaseExpiryChecker {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        let interval = registry.config().expiry_check_interval;
        Self {
            registry,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Starting lease expiry checker");
        let mut tick = interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!("Lease expiry check failed: {}", e);
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping lease expiry checker");
                    break;
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<Vec<String>, RegistryError> {
        self.registry.expire_leases(Utc::now()).await
    }
}

/// Keeps the local agent's lease alive, re-registering if it was lost.
pub struct HeartbeatTask {
    registry: Arc<AgentRegistry>,
    registration: AgentRegistration,
    interval: Duration,
    lease_duration: Duration,
    shutdown_token: CancellationToken,
}

impl HeartbeatTask {
    pub fn new(registry: Arc<AgentRegistry>, registration: AgentRegistration) -> Self {
        let interval = registry.config().heartbeat_interval;
        let lease_duration = registry.config().lease_duration;
        Self {
            registry,
            registration,
            interval,
            lease_duration,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let agent_id = self.registration.agent_id().to_string();
        info!(agent_id = %agent_id, interval_ms = self.interval.as_millis() as u64, "Starting heartbeat task");
        let mut tick = interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(agent_id = %agent_id, "Heartbeat failed: {}", e);
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!(agent_id = %agent_id, "Shutdown signal received, stopping heartbeat task");
                    break;
                }
            }
        }
    }

    /// One heartbeat; a lost registration is re-created.
    pub async fn beat(&self) -> Result<Lease, RegistryError> {
        match self
            .registry
            .heartbeat(self.registration.agent_id(), self.lease_duration)
            .await
        {
            Err(e) if e.is_unavailable() => {
                warn!(agent_id = self.registration.agent_id(), "Lease lost, registering again");
                self.registry.register(self.registration.clone()).await?;
                self.registry
                    .heartbeat(self.registration.agent_id(), self.lease_duration)
                    .await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::AgentIdentity;
    use crate::infrastructure::repositories::InMemoryAgentRegistryRepository;

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(
            Arc::new(InMemoryAgentRegistryRepository::new()),
            EventBus::with_default_capacity(),
            RegistryConfig::default(),
        ))
    }

    fn healer(id: &str) -> AgentRegistration {
        AgentRegistration::new(
            AgentIdentity::new("specialist", id, "0.4.1"),
            "acme",
            "checkout",
            ["healing.selector"],
        )
    }

    #[tokio::test]
    async fn test_register_heartbeat_discover() {
        let registry = registry();
        let lease = registry.register(healer("healer-1")).await.unwrap();
        assert_eq!(lease.status, AgentStatus::Starting);

        let query = DiscoveryQuery::new("acme", "checkout").with_capability("healing.selector");
        assert!(registry.discover(&query).await.unwrap().is_empty());

        let renewed = registry.heartbeat("healer-1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(renewed.status, AgentStatus::Healthy);
        assert!(renewed.lease_until > lease.lease_until - chrono::Duration::seconds(1));
        let found = registry.discover(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id(), "healer-1");
    }

    #[tokio::test]
    async fn test_heartbeat_errors_distinguish_unknown_and_expired() {
        let registry = registry();
        let err = registry.heartbeat("ghost", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        registry.register(healer("healer-2")).await.unwrap();
        registry.mark_unavailable("healer-2").await.unwrap();
        let err = registry.heartbeat("healer-2", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, RegistryError::LeaseExpired { .. }));
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_expiry_excludes_lapsed_agents() {
        let registry = registry();
        registry.register(healer("healer-3")).await.unwrap();
        registry.heartbeat("healer-3", Duration::from_millis(1)).await.unwrap();
        registry.register(healer("healer-4")).await.unwrap();
        registry.heartbeat("healer-4", Duration::from_secs(600)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let expired = registry.expire_leases(later).await.unwrap();
        assert_eq!(expired, vec!["healer-3".to_string()]);

        let ids: Vec<String> = registry
            .discover(&DiscoveryQuery::new("acme", "checkout"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.agent_id().to_string())
            .collect();
        assert_eq!(ids, vec!["healer-4".to_string()]);
        // history is kept
        assert_eq!(
            registry.find("healer-3").await.unwrap().unwrap().status,
            AgentStatus::Unavailable
        );
    }

    #[tokio::test]
    async fn test_topic_subscriptions_validate_patterns() {
        let registry = registry();
        registry.register(healer("healer-5")).await.unwrap();
        registry
            .subscribe_topic("healer-5", "qa.acme.checkout.specialist.healer-5.invoke", TopicRole::Subscriber)
            .await
            .unwrap();
        assert!(matches!(
            registry.subscribe_topic("healer-5", "not.a.topic", TopicRole::Subscriber).await,
            Err(RegistryError::InvalidTopic(_))
        ));
        assert!(matches!(
            registry
                .subscribe_topic("ghost", "qa.acme.checkout.specialist.ghost.invoke", TopicRole::Both)
                .await,
            Err(RegistryError::NotFound { .. })
        ));
        let stored = registry.find("healer-5").await.unwrap().unwrap();
        assert_eq!(stored.inbound_topic(), Some("qa.acme.checkout.specialist.healer-5.invoke"));
        assert!(registry
            .unsubscribe_topic("healer-5", "qa.acme.checkout.specialist.healer-5.invoke")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_task_reregisters_lost_agent() {
        let registry = registry();
        let task = HeartbeatTask::new(registry.clone(), healer("healer-6"));
        let lease = task.beat().await.unwrap();
        assert_eq!(lease.status, AgentStatus::Healthy);

        registry.mark_unavailable("healer-6").await.unwrap();
        let lease = task.beat().await.unwrap();
        assert_eq!(lease.status, AgentStatus::Healthy);
    }
}
