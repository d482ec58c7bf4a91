// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Inbound Dispatcher
//!
//! Generic entry point for envelopes addressed to this node. Each delivery
//! passes the same gates in a fixed order:
//!
//! ```text
//! validate ─► credentials (signature, freshness, tokens) ─► post_receive policy
//!          ─► handler lookup by meta.type ─► idempotency claim
//!               ├─ claimed   ─► replay window ─► handler ─► record ─► reply_to
//!               ├─ cached    ─► recorded outcome (reply republished verbatim)
//!               └─ in flight ─► transient error, redelivered later
//! ```
//!
//! Every outcome, success or failure, is recorded under the envelope's
//! idempotency key before any reply leaves the node, so a redelivery after a
//! crash answers from the record instead of running the handler twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_relay_core::application::idempotency::{CachedOutcome, IdempotencyError, IdempotencyGuard, IdempotencyOutcome};
use aegis_relay_core::application::policy::PolicyViolationError;
use aegis_relay_core::domain::envelope::{Envelope, EnvelopeType, Payload, SpecialistResult, SpecialistStatus, TaskResult, TaskStatus};
use aegis_relay_core::domain::execution::TraceId;
use aegis_relay_core::infrastructure::a2a::{EnvelopeSecurity, EnvelopeValidator, SecurityError};
use aegis_relay_core::infrastructure::transport::{Consumer, DeadLetterReason, TransportError};

use crate::application::factory::EnvelopeFactory;
use crate::application::sender::{EnvelopeSender, SendError};
use crate::domain::HandledEnvelope;

/// Handles one envelope type. A returned payload is sent to `reply_to`.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Payload>>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("envelope {message_id} failed validation: {summary}")]
    Validation { message_id: String, summary: String },

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Policy(#[from] PolicyViolationError),

    #[error("no handler registered for {envelope_type} (envelope {message_id})")]
    NoHandler {
        envelope_type: EnvelopeType,
        message_id: String,
    },

    #[error("envelope with idempotency key '{key}' is being processed elsewhere")]
    InFlight { key: String },

    #[error("envelope with idempotency key '{key}' previously failed: {error}")]
    Recorded { key: String, error: String },

    #[error("handler for envelope {message_id} (trace {trace_id}) failed: {error}")]
    Handler {
        message_id: String,
        trace_id: TraceId,
        error: String,
    },

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error("failed to send reply: {0}")]
    Reply(#[from] SendError),

    #[error("failed to encode dispatch record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation { .. } => "E_VALIDATION",
            DispatchError::Security(e) => e.code(),
            DispatchError::Policy(e) => e.code(),
            DispatchError::NoHandler { .. } => "E_NO_HANDLER",
            DispatchError::InFlight { .. } => "E_IN_FLIGHT",
            DispatchError::Recorded { .. } => "E_PREVIOUSLY_FAILED",
            DispatchError::Handler { .. } => "E_HANDLER_FAILED",
            DispatchError::Idempotency(_) => "E_IDEMPOTENCY_STORE",
            DispatchError::Reply(_) => "E_REPLY_FAILED",
            DispatchError::Encode(_) => "E_ENCODE",
        }
    }

    /// Failures a later redelivery may get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::InFlight { .. } | DispatchError::Idempotency(_) | DispatchError::Reply(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled(HandledEnvelope),
    /// Already processed; the recorded outcome was returned.
    Duplicate(HandledEnvelope),
}

impl DispatchOutcome {
    pub fn record(&self) -> &HandledEnvelope {
        match self {
            DispatchOutcome::Handled(record) | DispatchOutcome::Duplicate(record) => record,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DispatchOutcome::Duplicate(_))
    }
}

pub struct InboundDispatcher {
    factory: Arc<EnvelopeFactory>,
    sender: EnvelopeSender,
    security: Arc<EnvelopeSecurity>,
    idempotency: IdempotencyGuard,
    validator: EnvelopeValidator,
    handlers: HashMap<EnvelopeType, Arc<dyn InboundHandler>>,
}

impl InboundDispatcher {
    pub fn new(
        factory: Arc<EnvelopeFactory>,
        sender: EnvelopeSender,
        security: Arc<EnvelopeSecurity>,
        idempotency: IdempotencyGuard,
    ) -> Self {
        Self {
            factory,
            sender,
            security,
            idempotency,
            validator: EnvelopeValidator::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `envelope_type`, replacing any previous one.
    pub fn route(mut self, envelope_type: EnvelopeType, handler: Arc<dyn InboundHandler>) -> Self {
        self.handlers.insert(envelope_type, handler);
        self
    }

    pub fn handles(&self, envelope_type: EnvelopeType) -> bool {
        self.handlers.contains_key(&envelope_type)
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let report = self.validator.validate_envelope(envelope);
        if !report.valid {
            return Err(DispatchError::Validation {
                message_id: envelope.meta.message_id.clone(),
                summary: report.summary(),
            });
        }

        let now = Utc::now();
        self.security.verify_credentials(envelope, now)?;
        self.sender.policy().post_receive(envelope).await?;

        let handler = self
            .handlers
            .get(&envelope.envelope_type())
            .cloned()
            .ok_or_else(|| DispatchError::NoHandler {
                envelope_type: envelope.envelope_type(),
                message_id: envelope.meta.message_id.clone(),
            })?;

        let claim = match self.idempotency.begin(envelope).await? {
            IdempotencyOutcome::Claimed(claim) => claim,
            IdempotencyOutcome::Cached(CachedOutcome::Succeeded(value)) => {
                let handled = HandledEnvelope::from_value(value)?;
                self.republish(envelope, &handled).await;
                return Ok(DispatchOutcome::Duplicate(handled));
            }
            IdempotencyOutcome::Cached(CachedOutcome::Failed(error)) => {
                return Err(DispatchError::Recorded {
                    key: envelope.idempotency_key(),
                    error,
                });
            }
            IdempotencyOutcome::InFlight { key } => return Err(DispatchError::InFlight { key }),
        };

        if let Err(e) = self.security.check_replay(envelope, now) {
            self.idempotency.fail(claim, e.to_string()).await?;
            return Err(e.into());
        }

        match self.process(envelope, handler.as_ref()).await {
            Ok((handled, record)) => {
                self.idempotency.succeed(claim, record).await?;
                if let (Some(topic), Some(reply)) = (envelope.meta.reply_to.as_deref(), &handled.reply) {
                    self.sender.send(topic, reply).await?;
                }
                info!(
                    message_id = %envelope.meta.message_id,
                    trace_id = %envelope.meta.trace_id,
                    envelope_type = %envelope.envelope_type(),
                    replied = handled.reply.is_some(),
                    "Envelope handled"
                );
                Ok(DispatchOutcome::Handled(handled))
            }
            Err(e) => {
                self.idempotency.fail(claim, e.to_string()).await?;
                if matches!(e, DispatchError::Handler { .. }) {
                    self.reply_failure(envelope, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        envelope: &Envelope,
        handler: &dyn InboundHandler,
    ) -> Result<(HandledEnvelope, serde_json::Value), DispatchError> {
        let response = handler.handle(envelope).await.map_err(|e| DispatchError::Handler {
            message_id: envelope.meta.message_id.clone(),
            trace_id: envelope.meta.trace_id,
            error: format!("{:#}", e),
        })?;

        let mut handled = HandledEnvelope::new(envelope, response.as_ref())?;
        if let (Some(_), Some(payload)) = (&envelope.meta.reply_to, response) {
            handled = handled.with_reply(self.factory.reply(envelope, payload)?);
        }
        let record = handled.to_value()?;
        Ok((handled, record))
    }

    async fn republish(&self, envelope: &Envelope, handled: &HandledEnvelope) {
        let (Some(topic), Some(reply)) = (envelope.meta.reply_to.as_deref(), &handled.reply) else {
            return;
        };
        if let Err(e) = self.sender.send(topic, reply).await {
            warn!(
                message_id = %envelope.meta.message_id,
                topic,
                "Failed to republish recorded reply: {}",
                e
            );
        }
    }

    /// Tell a waiting requester about the failure instead of letting it time out.
    async fn reply_failure(&self, envelope: &Envelope, error: &DispatchError) {
        let Some(topic) = envelope.meta.reply_to.as_deref() else {
            return;
        };
        let payload = match &envelope.payload {
            Payload::SpecialistInvocationRequest(_) => {
                Payload::SpecialistResult(SpecialistResult::unsuccessful(SpecialistStatus::Failure, error.to_string()))
            }
            Payload::TaskRequest(request) => Payload::TaskResult(TaskResult {
                task_id: request.task_id.clone(),
                status: TaskStatus::Failed,
                output: serde_json::Value::Null,
                error: Some(error.to_string()),
            }),
            _ => return,
        };
        let sent = match self.factory.reply(envelope, payload) {
            Ok(reply) => self.sender.send(topic, &reply).await.map(|_| ()),
            Err(e) => Err(SendError::Build(e)),
        };
        if let Err(e) = sent {
            warn!(message_id = %envelope.meta.message_id, topic, "Failed to send failure reply: {}", e);
        }
    }

    /// Consume deliveries until `shutdown` fires or the transport closes.
    pub async fn serve(&self, consumer: &mut dyn Consumer, shutdown: CancellationToken) -> Result<(), TransportError> {
        info!(group = consumer.group(), "Inbound dispatcher started");
        loop {
            let delivery = tokio::select! {
                delivery = consumer.next() => delivery,
                _ = shutdown.cancelled() => {
                    info!(group = consumer.group(), "Shutdown signal received, stopping inbound dispatcher");
                    return Ok(());
                }
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match self.dispatch(&delivery.envelope).await {
                Ok(outcome) => {
                    debug!(
                        message_id = %delivery.envelope.meta.message_id,
                        duplicate = outcome.is_duplicate(),
                        "Delivery settled"
                    );
                    consumer.ack(&delivery).await?;
                }
                Err(e) if e.is_transient() => {
                    debug!(message_id = %delivery.envelope.meta.message_id, code = e.code(), "Delivery returned for redelivery: {}", e);
                    consumer.nack(&delivery, &e.to_string()).await?;
                }
                Err(e) => {
                    warn!(
                        message_id = %delivery.envelope.meta.message_id,
                        trace_id = %delivery.envelope.meta.trace_id,
                        topic = %delivery.topic,
                        code = e.code(),
                        "Delivery rejected: {}",
                        e
                    );
                    if let DispatchError::Validation { summary, .. } = &e {
                        self.sender
                            .transport()
                            .dead_letter(&delivery.topic, &delivery.envelope, DeadLetterReason::Validation, summary)
                            .await?;
                    }
                    consumer.ack(&delivery).await?;
                }
            }
        }
    }
}
