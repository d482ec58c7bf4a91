// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # InvokeSpecialist
//!
//! Delegates one capability-scoped task to another agent and waits for its
//! `SpecialistResult`:
//!
//! 1. discover candidates advertising the capability (`HEALTHY` preferred over
//!    `DEGRADED`, then the most recent heartbeat)
//! 2. build a `SpecialistInvocationRequest` carrying a capability token and
//!    `reply_to` pointing at this node's reply topic
//! 3. publish through the [`EnvelopeSender`] and wait for the correlated reply
//!    within the budget's time limit
//!
//! Every delivery-level failure (no candidate, policy denial, timeout,
//! cancellation, cost overrun) comes back as a [`SpecialistResult`] with a
//! non-success status. The registry may still list an agent whose lease just
//! lapsed; the timeout is what finally decides it is gone.
//!
//! Invoked from a step, the whole exchange is one network activity of that
//! step: the result is recorded with the checkpoint, and replay serves it back
//! without discovering, publishing or waiting.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use aegis_relay_core::application::activity::ActivityError;
use aegis_relay_core::application::executor::StepContext;
use aegis_relay_core::application::registry::AgentRegistry;
use aegis_relay_core::domain::agent::{AgentRegistration, AgentStatus, DiscoveryQuery};
use aegis_relay_core::domain::envelope::{
    AgentIdentity, CancelDirective, Envelope, Payload, SpecialistInvocationRequest, SpecialistResult, SpecialistStatus,
};
use aegis_relay_core::domain::execution::ExecutionError;
use aegis_relay_core::infrastructure::a2a::SecurityError;
use aegis_relay_core::infrastructure::transport::TransportError;

use crate::application::factory::EnvelopeFactory;
use crate::application::sender::{EnvelopeSender, SendError};
use crate::domain::{EnvelopeDraft, InvocationContext};

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to build invocation envelope: {0}")]
    Build(#[from] SecurityError),

    #[error("delegation rejected: {0}")]
    Execution(#[from] ExecutionError),

    #[error("delegation activity failed: {0}")]
    Activity(#[from] ActivityError),

    #[error("recorded specialist result is malformed: {0}")]
    Decode(#[from] serde_json::Error),
}

pub struct SpecialistInvoker {
    factory: Arc<EnvelopeFactory>,
    sender: EnvelopeSender,
    registry: Arc<AgentRegistry>,
    reply_topic: String,
}

impl SpecialistInvoker {
    pub fn new(
        factory: Arc<EnvelopeFactory>,
        sender: EnvelopeSender,
        registry: Arc<AgentRegistry>,
        reply_topic: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            sender,
            registry,
            reply_topic: reply_topic.into(),
        }
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Invoke from inside a running step, counting against its fan-out limit.
    pub async fn invoke_from_step(
        &self,
        ctx: &StepContext<'_>,
        request: SpecialistInvocationRequest,
    ) -> Result<SpecialistResult, InvokeError> {
        ctx.reserve_delegation()?;
        let invocation = InvocationContext::from_step(ctx);
        let activity = json!({
            "op": "invoke_specialist",
            "capability": request.capability,
            "task": request.task,
            "budget": request.budget,
        });
        let recorded = ctx
            .activities()
            .network(activity, |_| async move {
                let result = self.invoke(&invocation, request).await?;
                Ok(serde_json::to_value(result)?)
            })
            .await?;
        Ok(serde_json::from_value(recorded)?)
    }

    pub async fn invoke(
        &self,
        ctx: &InvocationContext,
        request: SpecialistInvocationRequest,
    ) -> Result<SpecialistResult, InvokeError> {
        let capability = request.capability.clone();
        let budget = request.budget.clone();

        let Some((target, topic)) = self.select_candidate(&capability).await else {
            return Ok(finish(
                &capability,
                SpecialistResult::unsuccessful(
                    SpecialistStatus::Unavailable,
                    format!("no available agent advertises capability '{}'", capability),
                ),
            ));
        };

        let envelope = self.factory.build(
            EnvelopeDraft::new(target.identity.clone(), Payload::SpecialistInvocationRequest(request), ctx.trace_id)
                .with_depth(ctx.depth + 1)
                .reply_to(&self.reply_topic),
        )?;
        info!(
            trace_id = %ctx.trace_id,
            message_id = %envelope.meta.message_id,
            capability = %capability,
            target = %target.identity,
            timeout_ms = budget.timeout_ms,
            "Invoking specialist"
        );

        let outcome = tokio::select! {
            outcome = self.sender.request(&topic, &envelope, budget.timeout()) => outcome,
            _ = ctx.cancellation.cancelled() => {
                self.cancel_remote(&topic, &envelope, target.identity.clone()).await;
                return Ok(finish(
                    &capability,
                    SpecialistResult::unsuccessful(SpecialistStatus::Cancelled, "invocation cancelled by caller"),
                ));
            }
        };

        let result = match outcome {
            Ok(reply) => match reply.payload {
                Payload::SpecialistResult(result) => match (budget.max_cost, result.cost) {
                    (Some(max), Some(cost)) if cost > max => SpecialistResult {
                        status: SpecialistStatus::BudgetExceeded,
                        error: Some(format!("reported cost {} exceeds budget {}", cost, max)),
                        ..result
                    },
                    _ => result,
                },
                other => SpecialistResult::unsuccessful(
                    SpecialistStatus::Failure,
                    format!("unexpected {} reply to invocation", other.envelope_type()),
                ),
            },
            Err(e) => failure_result(&e),
        };
        Ok(finish(&capability, result))
    }

    async fn select_candidate(&self, capability: &str) -> Option<(AgentRegistration, String)> {
        let query = DiscoveryQuery::new(self.factory.tenant(), self.factory.project()).with_capability(capability);
        let mut candidates = match self.registry.discover(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(capability, "Discovery failed, treating specialist as unavailable: {}", e);
                return None;
            }
        };
        candidates.sort_by(|a, b| {
            let rank = |r: &AgentRegistration| u8::from(r.status != AgentStatus::Healthy);
            rank(a).cmp(&rank(b)).then(b.last_heartbeat.cmp(&a.last_heartbeat))
        });
        candidates.into_iter().find_map(|candidate| {
            let topic = candidate.inbound_topic()?.to_string();
            Some((candidate, topic))
        })
    }

    async fn cancel_remote(&self, topic: &str, request: &Envelope, target: AgentIdentity) {
        let directive = self.factory.build(
            EnvelopeDraft::new(
                target,
                Payload::CancelDirective(CancelDirective {
                    reason: "caller cancelled invocation".into(),
                    target_correlation_id: Some(request.meta.message_id.clone()),
                }),
                request.meta.trace_id,
            )
            .with_depth(request.meta.depth),
        );
        let result = match directive {
            Ok(directive) => self.sender.send(topic, &directive).await.map(|_| ()),
            Err(e) => Err(SendError::Build(e)),
        };
        if let Err(e) = result {
            warn!(
                trace_id = %request.meta.trace_id,
                message_id = %request.meta.message_id,
                "Failed to publish cancel directive: {}",
                e
            );
        }
    }
}

fn failure_result(error: &SendError) -> SpecialistResult {
    let status = match error {
        SendError::Transport(TransportError::RequestTimeout { .. }) => SpecialistStatus::Timeout,
        SendError::Policy(_) => SpecialistStatus::Rejected,
        SendError::Transport(TransportError::Backpressure { .. } | TransportError::Unavailable(_) | TransportError::Closed) => {
            SpecialistStatus::Unavailable
        }
        _ => SpecialistStatus::Failure,
    };
    SpecialistResult::unsuccessful(status, error.to_string())
}

fn finish(capability: &str, result: SpecialistResult) -> SpecialistResult {
    metrics::counter!("relay_invocations_total", "status" => result.status.as_str()).increment(1);
    if result.is_success() {
        debug!(capability, "Specialist invocation succeeded");
    } else {
        warn!(
            capability,
            status = result.status.as_str(),
            error = result.error.as_deref().unwrap_or_default(),
            "Specialist invocation did not succeed"
        );
    }
    result
}
