// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::checkpoint::NodeId;
use crate::domain::execution::{StepStatus, TraceId};

/// Runtime Executor lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TraceEvent {
    TraceStarted {
        trace_id: TraceId,
        resumed_from: Option<u32>,
        depth: u32,
        started_at: DateTime<Utc>,
    },
    StepCompleted {
        trace_id: TraceId,
        step_index: u32,
        node_id: NodeId,
        attempts: u32,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    StepRetried {
        trace_id: TraceId,
        step_index: u32,
        node_id: NodeId,
        attempt: u32,
        status: StepStatus,
        error: String,
        retried_at: DateTime<Utc>,
    },
    TraceCompleted {
        trace_id: TraceId,
        total_steps: u32,
        completed_at: DateTime<Utc>,
    },
    TraceFailed {
        trace_id: TraceId,
        step_index: u32,
        last_checkpoint: Option<u32>,
        error: String,
        failed_at: DateTime<Utc>,
    },
    TraceCancelled {
        trace_id: TraceId,
        step_index: u32,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

impl TraceEvent {
    pub fn trace_id(&self) -> TraceId {
        match self {
            TraceEvent::TraceStarted { trace_id, .. }
            | TraceEvent::StepCompleted { trace_id, .. }
            | TraceEvent::StepRetried { trace_id, .. }
            | TraceEvent::TraceCompleted { trace_id, .. }
            | TraceEvent::TraceFailed { trace_id, .. }
            | TraceEvent::TraceCancelled { trace_id, .. } => *trace_id,
        }
    }
}

/// Agent Registry events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    AgentRegistered {
        agent_id: String,
        tenant: String,
        project: String,
        capabilities: Vec<String>,
        registered_at: DateTime<Utc>,
    },
    LeaseExpired {
        agent_id: String,
        expired_at: DateTime<Utc>,
    },
    AgentMarkedUnavailable {
        agent_id: String,
        marked_at: DateTime<Utc>,
    },
}

/// Transport adapter events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportEvent {
    EnvelopeDeadLettered {
        topic: String,
        message_id: String,
        trace_id: TraceId,
        reason: String,
        dead_lettered_at: DateTime<Utc>,
    },
    PublisherPaused {
        group: String,
        pending: usize,
        threshold: usize,
        paused_at: DateTime<Utc>,
    },
    PublisherResumed {
        group: String,
        pending: usize,
        resumed_at: DateTime<Utc>,
    },
}
