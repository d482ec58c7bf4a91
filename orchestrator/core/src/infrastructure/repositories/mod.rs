// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the persistence contracts defined in
//! [`crate::domain::repository`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist checkpoints, recorded activities, idempotency records and agent registrations
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresCheckpointRepository** - `execution_steps`, `recorded_activities`, `idempotency_records`
//! - **PostgresAgentRegistryRepository** - `agents`, `agent_topics`
//!
//! ## In-Memory Repositories
//!
//! Lock-guarded maps with the same keying rules as the tables above, used for
//! development and tests:
//! - **InMemoryCheckpointRepository**
//! - **InMemoryAgentRegistryRepository**
//!
//! Every write happens under a single lock acquisition, which gives the same
//! insert-if-absent and conditional-update atomicity the PostgreSQL
//! implementations get from unique constraints.

pub mod postgres_agent;
pub mod postgres_checkpoint;

pub use postgres_agent::PostgresAgentRegistryRepository;
pub use postgres_checkpoint::PostgresCheckpointRepository;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery, TopicSubscription};
use crate::domain::checkpoint::{
    DedupRecord, DedupStatus, ExecutionStep, RecordedActivity, SaveOutcome, TraceSummary,
};
use crate::domain::execution::TraceId;
use crate::domain::repository::{AgentRegistryRepository, CheckpointRepository, RepositoryError};

/// `true` when an `InProgress` claim is old enough to be taken over.
pub(crate) fn claim_is_stale(existing: &DedupRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::weeks(5200));
    existing.status == DedupStatus::InProgress && now - existing.claimed_at > stale_after
}

#[derive(Default)]
struct CheckpointState {
    steps: HashMap<TraceId, BTreeMap<u32, ExecutionStep>>,
    activities: BTreeMap<(TraceId, u32, u32), RecordedActivity>,
    dedup: HashMap<String, DedupRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryCheckpointRepository {
    state: Arc<RwLock<CheckpointState>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoint rows; used by tests asserting write idempotency.
    pub fn step_count(&self) -> usize {
        self.state.read().steps.values().map(BTreeMap::len).sum()
    }

    pub fn activity_count(&self) -> usize {
        self.state.read().activities.len()
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn save_step(&self, step: &ExecutionStep) -> Result<SaveOutcome, RepositoryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let trace = state.steps.entry(step.trace_id).or_default();
        if let Some(existing) = trace.get(&step.step_index) {
            return Ok(SaveOutcome::AlreadyExists(existing.clone()));
        }
        trace.insert(step.step_index, step.clone());
        for activity in &step.activities {
            state
                .activities
                .entry((activity.trace_id, activity.step_index, activity.sequence))
                .or_insert_with(|| activity.clone());
        }
        Ok(SaveOutcome::Inserted)
    }

    async fn load_trace(&self, trace_id: TraceId) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let state = self.state.read();
        Ok(state
            .steps
            .get(&trace_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_activity(&self, activity: &RecordedActivity) -> Result<(), RepositoryError> {
        self.state
            .write()
            .activities
            .entry((activity.trace_id, activity.step_index, activity.sequence))
            .or_insert_with(|| activity.clone());
        Ok(())
    }

    async fn load_activities(
        &self,
        trace_id: TraceId,
        step_index: u32,
    ) -> Result<Vec<RecordedActivity>, RepositoryError> {
        let state = self.state.read();
        Ok(state
            .activities
            .range((trace_id, step_index, 0)..=(trace_id, step_index, u32::MAX))
            .map(|(_, activity)| activity.clone())
            .collect())
    }

    async fn list_traces(&self, limit: usize) -> Result<Vec<TraceSummary>, RepositoryError> {
        let state = self.state.read();
        let mut summaries: Vec<TraceSummary> = state
            .steps
            .iter()
            .filter_map(|(trace_id, steps)| {
                let (_, last) = steps.iter().next_back()?;
                Some(TraceSummary {
                    trace_id: *trace_id,
                    steps: steps.len() as u32,
                    last_node: last.node_id.clone(),
                    finished: last.is_terminal_node(),
                    last_step_at: steps.values().map(|s| s.timestamp).max().unwrap_or(last.timestamp),
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.last_step_at.cmp(&a.last_step_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn claim_dedup(
        &self,
        record: &DedupRecord,
        stale_after: Duration,
    ) -> Result<Option<DedupRecord>, RepositoryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        match state.dedup.get(&record.key) {
            Some(existing) if !claim_is_stale(existing, record.claimed_at, stale_after) => Ok(Some(existing.clone())),
            _ => {
                state.dedup.insert(record.key.clone(), record.clone());
                Ok(None)
            }
        }
    }

    async fn complete_dedup(&self, record: &DedupRecord) -> Result<(), RepositoryError> {
        self.state.write().dedup.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn find_dedup(&self, key: &str) -> Result<Option<DedupRecord>, RepositoryError> {
        Ok(self.state.read().dedup.get(key).cloned())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        // A trace goes only once its newest step and newest activity are both stale.
        let mut latest: HashMap<TraceId, DateTime<Utc>> = HashMap::new();
        let touched = state
            .steps
            .values()
            .flat_map(|steps| steps.values().map(|step| (step.trace_id, step.timestamp)))
            .chain(state.activities.values().map(|a| (a.trace_id, a.timestamp)));
        for (trace_id, at) in touched {
            let newest = latest.entry(trace_id).or_insert(at);
            *newest = (*newest).max(at);
        }
        let expired: HashSet<TraceId> = latest
            .into_iter()
            .filter(|(_, newest)| *newest < cutoff)
            .map(|(trace_id, _)| trace_id)
            .collect();

        let mut removed = 0u64;
        for trace_id in &expired {
            if let Some(steps) = state.steps.remove(trace_id) {
                removed += steps.len() as u64;
            }
        }
        let before = state.activities.len();
        state
            .activities
            .retain(|(trace_id, _, _), _| !expired.contains(trace_id));
        removed += (before - state.activities.len()) as u64;

        let before = state.dedup.len();
        state.dedup.retain(|_, record| record.claimed_at >= cutoff);
        removed += (before - state.dedup.len()) as u64;
        Ok(removed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAgentRegistryRepository {
    agents: Arc<RwLock<HashMap<String, AgentRegistration>>>,
}

impl InMemoryAgentRegistryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRegistryRepository for InMemoryAgentRegistryRepository {
    async fn upsert(&self, registration: &AgentRegistration) -> Result<(), RepositoryError> {
        self.agents
            .write()
            .insert(registration.agent_id().to_string(), registration.clone());
        Ok(())
    }

    async fn find(&self, agent_id: &str) -> Result<Option<AgentRegistration>, RepositoryError> {
        Ok(self.agents.read().get(agent_id).cloned())
    }

    async fn renew_lease(
        &self,
        agent_id: &str,
        status: AgentStatus,
        heartbeat_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<AgentRegistration>, RepositoryError> {
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(reg) if reg.status != AgentStatus::Unavailable => {
                reg.status = status;
                reg.last_heartbeat = heartbeat_at;
                reg.lease_until = lease_until;
                Ok(Some(reg.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool, RepositoryError> {
        match self.agents.write().get_mut(agent_id) {
            Some(reg) => {
                reg.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_matching(&self, query: &DiscoveryQuery) -> Result<Vec<AgentRegistration>, RepositoryError> {
        Ok(self
            .agents
            .read()
            .values()
            .filter(|reg| query.matches(reg))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<AgentRegistration>, RepositoryError> {
        let mut all: Vec<_> = self.agents.read().values().cloned().collect();
        all.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        Ok(all)
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepositoryError> {
        let mut expired = Vec::new();
        for (id, reg) in self.agents.write().iter_mut() {
            if reg.status != AgentStatus::Unavailable && reg.lease_until < now {
                reg.status = AgentStatus::Unavailable;
                expired.push(id.clone());
            }
        }
        expired.sort();
        Ok(expired)
    }

    async fn add_topic(&self, agent_id: &str, subscription: &TopicSubscription) -> Result<bool, RepositoryError> {
        let mut agents = self.agents.write();
        let Some(reg) = agents.get_mut(agent_id) else {
            return Ok(false);
        };
        match reg.topics.iter_mut().find(|t| t.topic == subscription.topic) {
            Some(existing) => existing.role = subscription.role,
            None => reg.topics.push(subscription.clone()),
        }
        Ok(true)
    }

    async fn remove_topic(&self, agent_id: &str, topic: &str) -> Result<bool, RepositoryError> {
        let mut agents = self.agents.write();
        let Some(reg) = agents.get_mut(agent_id) else {
            return Ok(false);
        };
        let before = reg.topics.len();
        reg.topics.retain(|t| t.topic != topic);
        Ok(reg.topics.len() != before)
    }

    async fn purge_unavailable_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|_, reg| !(reg.status == AgentStatus::Unavailable && reg.lease_until < cutoff));
        Ok((before - agents.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::TopicRole;
    use crate::domain::checkpoint::{ActivityResponse, ActivityType, NodeId};
    use crate::domain::envelope::AgentIdentity;
    use crate::domain::execution::StepStatus;
    use serde_json::json;

    fn step(trace_id: TraceId, index: u32, output: serde_json::Value) -> ExecutionStep {
        ExecutionStep {
            trace_id,
            step_index: index,
            node_id: NodeId::new(format!("node-{index}")),
            input_hash: "in".into(),
            output,
            next_node: None,
            activities: vec![RecordedActivity {
                trace_id,
                step_index: index,
                sequence: 0,
                activity_type: ActivityType::Clock,
                request_hash: "req".into(),
                response: ActivityResponse::Ok(json!("2026-01-01T00:00:00Z")),
                timestamp: Utc::now(),
            }],
            status: StepStatus::Completed,
            attempts: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_step_is_insert_if_absent() {
        let repo = InMemoryCheckpointRepository::new();
        let trace_id = TraceId::new();
        let first = step(trace_id, 0, json!({"v": 1}));
        assert_eq!(repo.save_step(&first).await.unwrap(), SaveOutcome::Inserted);

        let conflicting = step(trace_id, 0, json!({"v": 2}));
        match repo.save_step(&conflicting).await.unwrap() {
            SaveOutcome::AlreadyExists(stored) => assert_eq!(stored.output, json!({"v": 1})),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(repo.step_count(), 1);
        assert_eq!(repo.activity_count(), 1);
        assert_eq!(repo.load_activities(trace_id, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_removes_whole_traces_only() {
        let repo = InMemoryCheckpointRepository::new();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::days(30);
        let aged = |mut step: ExecutionStep, days: i64| {
            step.timestamp = now - chrono::Duration::days(days);
            for activity in &mut step.activities {
                activity.timestamp = step.timestamp;
            }
            step
        };

        let stale = TraceId::new();
        repo.save_step(&aged(step(stale, 0, json!(0)), 60)).await.unwrap();
        repo.save_step(&aged(step(stale, 1, json!(1)), 45)).await.unwrap();

        // Started before the cutoff, still checkpointing after it.
        let straddling = TraceId::new();
        repo.save_step(&aged(step(straddling, 0, json!(0)), 40)).await.unwrap();
        repo.save_step(&aged(step(straddling, 1, json!(1)), 1)).await.unwrap();

        assert_eq!(repo.purge_before(cutoff).await.unwrap(), 4);
        assert!(repo.load_trace(stale).await.unwrap().is_empty());
        assert!(repo.load_activities(stale, 0).await.unwrap().is_empty());

        let kept = repo.load_trace(straddling).await.unwrap();
        assert_eq!(kept.iter().map(|s| s.step_index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(repo.load_activities(straddling, 0).await.unwrap().len(), 1);
        assert_eq!(repo.activity_count(), 2);
    }

    #[tokio::test]
    async fn test_load_trace_is_ordered_and_list_traces_summarizes() {
        let repo = InMemoryCheckpointRepository::new();
        let trace_id = TraceId::new();
        for index in [2, 0, 1] {
            let mut s = step(trace_id, index, json!(index));
            s.next_node = (index < 2).then(|| NodeId::new("next"));
            repo.save_step(&s).await.unwrap();
        }
        let steps = repo.load_trace(trace_id).await.unwrap();
        assert_eq!(steps.iter().map(|s| s.step_index).collect::<Vec<_>>(), vec![0, 1, 2]);

        let summaries = repo.list_traces(10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].steps, 3);
        assert!(summaries[0].finished);
    }

    #[tokio::test]
    async fn test_dedup_claim_blocks_until_stale() {
        let repo = InMemoryCheckpointRepository::new();
        let claim = DedupRecord::claim("k1", None, None);
        assert!(repo.claim_dedup(&claim, Duration::from_secs(30)).await.unwrap().is_none());

        let again = DedupRecord::claim("k1", None, None);
        let blocking = repo.claim_dedup(&again, Duration::from_secs(30)).await.unwrap();
        assert_eq!(blocking.map(|r| r.status), Some(DedupStatus::InProgress));

        let mut late = DedupRecord::claim("k1", None, None);
        late.claimed_at = claim.claimed_at + chrono::Duration::seconds(31);
        assert!(repo.claim_dedup(&late, Duration::from_secs(30)).await.unwrap().is_none());

        repo.complete_dedup(&late.clone().succeed(json!({"ok": true}))).await.unwrap();
        let mut much_later = DedupRecord::claim("k1", None, None);
        much_later.claimed_at = late.claimed_at + chrono::Duration::days(1);
        let done = repo.claim_dedup(&much_later, Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(done.status, DedupStatus::Succeeded);
    }

    fn registration(id: &str, lease_until: DateTime<Utc>) -> AgentRegistration {
        let mut reg = AgentRegistration::new(
            AgentIdentity::new("specialist", id, "1.0.0"),
            "acme",
            "checkout",
            ["healing.selector"],
        );
        reg.status = AgentStatus::Healthy;
        reg.lease_until = lease_until;
        reg
    }

    #[tokio::test]
    async fn test_expire_leases_flips_only_stale_agents() {
        let repo = InMemoryAgentRegistryRepository::new();
        let now = Utc::now();
        repo.upsert(&registration("stale", now - chrono::Duration::seconds(1))).await.unwrap();
        repo.upsert(&registration("live", now + chrono::Duration::seconds(60))).await.unwrap();

        assert_eq!(repo.expire_leases(now).await.unwrap(), vec!["stale".to_string()]);
        assert!(repo.expire_leases(now).await.unwrap().is_empty());

        let found = repo.find_matching(&DiscoveryQuery::new("acme", "checkout")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id(), "live");

        assert!(repo
            .renew_lease("stale", AgentStatus::Healthy, now, now + chrono::Duration::seconds(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_topics_and_purge() {
        let repo = InMemoryAgentRegistryRepository::new();
        let now = Utc::now();
        repo.upsert(&registration("healer-7", now - chrono::Duration::days(8))).await.unwrap();
        let sub = TopicSubscription {
            topic: "qa.acme.checkout.healing.selector.invoke".into(),
            role: TopicRole::Subscriber,
        };
        assert!(repo.add_topic("healer-7", &sub).await.unwrap());
        assert!(!repo.add_topic("ghost", &sub).await.unwrap());
        assert_eq!(repo.find("healer-7").await.unwrap().unwrap().topics.len(), 1);
        assert!(repo.remove_topic("healer-7", &sub.topic).await.unwrap());
        assert!(!repo.remove_topic("healer-7", &sub.topic).await.unwrap());

        assert_eq!(repo.purge_unavailable_before(now).await.unwrap(), 0);
        repo.expire_leases(now).await.unwrap();
        assert_eq!(repo.purge_unavailable_before(now - chrono::Duration::days(7)).await.unwrap(), 1);
    }
}
