// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Checkpoint Domain
//!
//! Durable records produced by the Runtime Executor:
//!
//! - [`ExecutionStep`]: one checkpoint per step, unique on `(trace_id, step_index)`
//! - [`RecordedActivity`]: a captured non-deterministic response, keyed by
//!   `(trace_id, step_index, sequence)`
//! - [`DedupRecord`]: the idempotency ledger entry for an inbound envelope
//!
//! Steps own their activities: a step and its activities are persisted in one
//! transaction by [`crate::domain::repository::CheckpointRepository::save_step`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::execution::{StepStatus, TraceId};

/// Name of a node in a step graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Category of non-deterministic I/O captured at the Activity Boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Network,
    Clock,
    Random,
    Storage,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Network => "network",
            ActivityType::Clock => "clock",
            ActivityType::Random => "random",
            ActivityType::Storage => "storage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "network" => Some(ActivityType::Network),
            "clock" => Some(ActivityType::Clock),
            "random" => Some(ActivityType::Random),
            "storage" => Some(ActivityType::Storage),
            _ => None,
        }
    }
}

/// Captured outcome of an activity. Failures are recorded too so that replay
/// reproduces the same error path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ActivityResponse {
    Ok(Value),
    Err(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedActivity {
    pub trace_id: TraceId,
    pub step_index: u32,
    pub sequence: u32,
    pub activity_type: ActivityType,
    pub request_hash: String,
    pub response: ActivityResponse,
    pub timestamp: DateTime<Utc>,
}

/// Durable checkpoint of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub trace_id: TraceId,
    pub step_index: u32,
    pub node_id: NodeId,
    pub input_hash: String,
    pub output: Value,
    pub next_node: Option<NodeId>,
    pub activities: Vec<RecordedActivity>,
    pub status: StepStatus,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn is_terminal_node(&self) -> bool {
        self.next_node.is_none()
    }

    pub fn output_hash(&self) -> String {
        hash_value(&self.output)
    }
}

/// Outcome of an idempotent checkpoint write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Inserted,
    /// A checkpoint for the same `(trace_id, step_index)` already existed and was kept.
    AlreadyExists(ExecutionStep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStatus::InProgress => "in_progress",
            DedupStatus::Succeeded => "succeeded",
            DedupStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(DedupStatus::InProgress),
            "succeeded" => Some(DedupStatus::Succeeded),
            "failed" => Some(DedupStatus::Failed),
            _ => None,
        }
    }
}

/// Idempotency ledger entry for one inbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub key: String,
    pub status: DedupStatus,
    pub trace_id: Option<TraceId>,
    pub message_id: Option<String>,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DedupRecord {
    pub fn claim(key: impl Into<String>, trace_id: Option<TraceId>, message_id: Option<String>) -> Self {
        Self {
            key: key.into(),
            status: DedupStatus::InProgress,
            trace_id,
            message_id,
            response: None,
            error: None,
            claimed_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn succeed(mut self, response: Value) -> Self {
        self.status = DedupStatus::Succeeded;
        self.response = Some(response);
        self.error = None;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = DedupStatus::Failed;
        self.response = None;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Compact per-trace listing used by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: TraceId,
    pub steps: u32,
    pub last_node: NodeId,
    pub finished: bool,
    pub last_step_at: DateTime<Utc>,
}

/// SHA-256 over the canonical JSON encoding of `value`, hex encoded.
///
/// `serde_json` maps keep their keys ordered, so two equal values always hash
/// to the same digest regardless of how they were built.
pub fn hash_value(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}
