// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Domain
//!
//! Identifiers, step state machine, retry policy and trace reports for the
//! Runtime Executor ([`crate::application::executor`]).
//!
//! ## Step State Machine
//!
//! ```text
//! pending ──► running ──► completed
//!    ▲           ├──────► failed ────┐
//!    │           ├──────► timed_out ─┤ (retry while attempts remain)
//!    └───────────┼───────────────────┘
//!                └──────► cancelled  (terminal)
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::checkpoint::{ExecutionStep, NodeId};
use crate::domain::repository::RepositoryError;

/// Maximum agent-to-agent call depth accepted by default.
pub const MAX_RECURSIVE_DEPTH: u32 = 5;

/// Identifier of one end-to-end execution of a step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TraceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How the Activity Boundary treats non-deterministic I/O for a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityMode {
    /// Execute against the real system, nothing is captured.
    Normal,
    /// Execute against the real system and capture every response.
    #[default]
    Record,
    /// Serve captured responses, never touch the real system.
    Replay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "timed_out" => Some(StepStatus::TimedOut),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Cancelled)
    }

    /// Advance the state machine, rejecting transitions the diagram above does not allow.
    pub fn transition(self, to: StepStatus) -> Result<StepStatus, ExecutionError> {
        use StepStatus::*;
        let allowed = matches!(
            (self, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (TimedOut, Pending)
                | (Pending, Cancelled)
                | (Failed, Cancelled)
                | (TimedOut, Cancelled)
        );
        if allowed {
            Ok(to)
        } else {
            Err(ExecutionError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Bounded exponential retry applied to failed and timed-out steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before re-entering `pending` after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }
}

/// Why the trace stopped before reaching a terminal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailureReport {
    pub step_index: u32,
    pub node_id: NodeId,
    pub status: StepStatus,
    pub attempts: u32,
    pub error: String,
}

/// Result of running (or replaying) a trace.
///
/// A failed trace carries the index of its last successful checkpoint together
/// with the failing step's error so the run can be resumed from that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReport {
    pub trace_id: TraceId,
    pub status: TraceStatus,
    pub steps: Vec<ExecutionStep>,
    pub last_checkpoint: Option<u32>,
    pub failure: Option<StepFailureReport>,
    pub output: Option<Value>,
    pub finished_at: DateTime<Utc>,
}

impl TraceReport {
    pub fn resume_from(&self) -> u32 {
        self.last_checkpoint.map(|i| i + 1).unwrap_or(0)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("trace {trace_id}: call depth {depth} exceeds limit {max}")]
    DepthExceeded { trace_id: TraceId, depth: u32, max: u32 },

    #[error("trace {trace_id} step {step_index}: fan-out limit {max} reached")]
    FanOutExceeded { trace_id: TraceId, step_index: u32, max: u32 },

    #[error("trace {trace_id}: graph has no node '{node_id}'")]
    UnknownNode { trace_id: TraceId, node_id: NodeId },

    #[error("trace {trace_id} is already running on this executor")]
    AlreadyRunning { trace_id: TraceId },

    #[error("trace {trace_id}: step limit {max_steps} reached")]
    StepLimitExceeded { trace_id: TraceId, max_steps: u32 },

    #[error("trace {trace_id}: checkpoint for step {step_index} is missing")]
    MissingCheckpoint { trace_id: TraceId, step_index: u32 },

    #[error("trace {trace_id} step {step_index}: replay diverged (expected {expected}, got {actual})")]
    ReplayDivergence {
        trace_id: TraceId,
        step_index: u32,
        expected: String,
        actual: String,
    },

    #[error("trace {trace_id} step {step_index}: replay failed: {message}")]
    ReplayFailed {
        trace_id: TraceId,
        step_index: u32,
        message: String,
    },

    #[error("invalid step transition {from} -> {to}")]
    InvalidTransition { from: StepStatus, to: StepStatus },

    #[error(transparent)]
    Activity(#[from] crate::application::activity::ActivityError),

    #[error("checkpoint store error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Activity(e) => e.code(),
            ExecutionError::ReplayDivergence { .. } => "E_REPLAY_DIVERGENCE",
            ExecutionError::DepthExceeded { .. } => "E_DEPTH_EXCEEDED",
            ExecutionError::FanOutExceeded { .. } => "E_FAN_OUT_EXCEEDED",
            ExecutionError::AlreadyRunning { .. } => "E_TRACE_RUNNING",
            _ => "E_EXECUTION",
        }
    }
}
