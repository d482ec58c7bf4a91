// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Calling context for a specialist invocation.

use tokio_util::sync::CancellationToken;

use aegis_relay_core::application::executor::StepContext;
use aegis_relay_core::domain::execution::TraceId;

/// Trace the invocation belongs to and how it can be cancelled.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub trace_id: TraceId,
    /// Depth of the calling trace. The request travels with `depth + 1`.
    pub depth: u32,
    pub cancellation: CancellationToken,
}

impl InvocationContext {
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            depth: 0,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Context of a running step; cancelling the trace cancels the invocation.
    pub fn from_step(ctx: &StepContext<'_>) -> Self {
        Self {
            trace_id: ctx.trace_id,
            depth: ctx.depth,
            cancellation: ctx.cancellation().clone(),
        }
    }
}
