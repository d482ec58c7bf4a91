// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the two pieces of shared mutable state: the
//! checkpoint store and the agent registry. Interfaces live in the domain
//! layer and are implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Records | Implementations |
//! |-------|---------|----------------|
//! | `CheckpointRepository` | `ExecutionStep`, `RecordedActivity`, `DedupRecord` | `InMemoryCheckpointRepository`, `PostgresCheckpointRepository` |
//! | `AgentRegistryRepository` | `AgentRegistration`, `TopicSubscription` | `InMemoryAgentRegistryRepository`, `PostgresAgentRegistryRepository` |
//!
//! ## Write Semantics
//!
//! Every write is a single atomic statement (or transaction) keyed by a unique
//! constraint: insert-if-absent for checkpoints and dedup claims, conditional
//! updates for lease renewal and expiry. No caller performs read-modify-write.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery, TopicSubscription};
use crate::domain::checkpoint::{DedupRecord, ExecutionStep, RecordedActivity, SaveOutcome, TraceSummary};
use crate::domain::execution::TraceId;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// Insert the step together with `step.activities` in one transaction.
    /// An existing `(trace_id, step_index)` is left untouched and returned.
    async fn save_step(&self, step: &ExecutionStep) -> Result<SaveOutcome, RepositoryError>;

    /// All checkpoints of a trace ordered by `step_index`.
    async fn load_trace(&self, trace_id: TraceId) -> Result<Vec<ExecutionStep>, RepositoryError>;

    /// Persist a single activity outside a step commit. Re-recording the same
    /// `(trace_id, step_index, sequence)` is a no-op.
    async fn record_activity(&self, activity: &RecordedActivity) -> Result<(), RepositoryError>;

    /// Activities of one step ordered by `sequence`.
    async fn load_activities(
        &self,
        trace_id: TraceId,
        step_index: u32,
    ) -> Result<Vec<RecordedActivity>, RepositoryError>;

    async fn list_traces(&self, limit: usize) -> Result<Vec<TraceSummary>, RepositoryError>;

    /// Claim `record.key` for processing.
    ///
    /// Returns `None` when the claim was taken (fresh key, or an `InProgress`
    /// claim older than `stale_after` was taken over); otherwise returns the
    /// record that blocks it.
    async fn claim_dedup(
        &self,
        record: &DedupRecord,
        stale_after: Duration,
    ) -> Result<Option<DedupRecord>, RepositoryError>;

    /// Overwrite the claim with its final outcome.
    async fn complete_dedup(&self, record: &DedupRecord) -> Result<(), RepositoryError>;

    async fn find_dedup(&self, key: &str) -> Result<Option<DedupRecord>, RepositoryError>;

    /// Hard-delete every trace whose newest checkpoint and activity are older
    /// than `cutoff`, plus dedup records claimed before it. A trace is never
    /// left with a partial step history.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait AgentRegistryRepository: Send + Sync {
    /// Create or replace a registration, including its topic subscriptions.
    async fn upsert(&self, registration: &AgentRegistration) -> Result<(), RepositoryError>;

    async fn find(&self, agent_id: &str) -> Result<Option<AgentRegistration>, RepositoryError>;

    /// Renew a lease unless the agent is already `UNAVAILABLE`.
    /// Returns the updated registration, or `None` if unknown or expired.
    async fn renew_lease(
        &self,
        agent_id: &str,
        status: AgentStatus,
        heartbeat_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<AgentRegistration>, RepositoryError>;

    /// Returns `false` if the agent is unknown.
    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<bool, RepositoryError>;

    async fn find_matching(&self, query: &DiscoveryQuery) -> Result<Vec<AgentRegistration>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<AgentRegistration>, RepositoryError>;

    /// Flip every live registration with `lease_until < now` to `UNAVAILABLE`,
    /// returning the ids that changed.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>, RepositoryError>;

    async fn add_topic(&self, agent_id: &str, subscription: &TopicSubscription) -> Result<bool, RepositoryError>;

    async fn remove_topic(&self, agent_id: &str, topic: &str) -> Result<bool, RepositoryError>;

    /// Hard-delete registrations that went `UNAVAILABLE` before `cutoff`.
    async fn purge_unavailable_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
