// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Drafts
//!
//! An [`EnvelopeDraft`] is everything a caller decides about an outbound
//! envelope. The [`EnvelopeFactory`](crate::application::factory::EnvelopeFactory)
//! fills in the rest (identity, tenant, timestamp, `message_id`, credentials,
//! signature).

use aegis_relay_core::domain::envelope::{AgentIdentity, Envelope, Payload, Priority};
use aegis_relay_core::domain::execution::TraceId;
use aegis_relay_core::infrastructure::transport::correlation_key;

#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeDraft {
    pub to: AgentIdentity,
    pub payload: Payload,
    pub trace_id: TraceId,
    pub depth: u32,
    pub priority: Option<Priority>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub idempotency_key: Option<String>,
}

impl EnvelopeDraft {
    pub fn new(to: AgentIdentity, payload: Payload, trace_id: TraceId) -> Self {
        Self {
            to,
            payload,
            trace_id,
            depth: 0,
            priority: None,
            correlation_id: None,
            reply_to: None,
            idempotency_key: None,
        }
    }

    /// Response to `request`: same trace and depth, addressed back to the
    /// sender, correlated the way the requester's waiter expects.
    pub fn reply_to_envelope(request: &Envelope, payload: Payload) -> Self {
        Self {
            to: request.meta.from.clone(),
            payload,
            trace_id: request.meta.trace_id,
            depth: request.meta.depth,
            priority: request.meta.priority,
            correlation_id: Some(correlation_key(request)),
            reply_to: None,
            idempotency_key: None,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}
