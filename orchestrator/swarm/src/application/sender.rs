// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Sender
//!
//! Outbound path shared by every publisher on this node:
//!
//! ```text
//! pre_send policy ─► publish ─┬─ ok ──────────────► receipt
//!                             ├─ retriable error ─► backoff, retry (bounded)
//!                             │                       └─ exhausted ─► <topic>-dlq (publish_failed)
//!                             └─ other error ─────► returned as-is
//! ```
//!
//! `request` applies the same pre-send gate, then runs the reply through the
//! post-receive gate before handing it back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use aegis_relay_core::application::policy::{PolicyGate, PolicyViolationError};
use aegis_relay_core::domain::envelope::Envelope;
use aegis_relay_core::domain::node_config::TransportConfig;
use aegis_relay_core::infrastructure::a2a::SecurityError;
use aegis_relay_core::infrastructure::transport::{DeadLetterReason, PublishReceipt, Transport, TransportError};

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Policy(#[from] PolicyViolationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to build envelope: {0}")]
    Build(#[from] SecurityError),
}

impl SendError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Transport(TransportError::RequestTimeout { .. }))
    }
}

#[derive(Clone)]
pub struct EnvelopeSender {
    transport: Arc<dyn Transport>,
    policy: PolicyGate,
    retries: u32,
    backoff: Duration,
}

impl EnvelopeSender {
    pub fn new(transport: Arc<dyn Transport>, policy: PolicyGate) -> Self {
        Self {
            transport,
            policy,
            retries: 3,
            backoff: Duration::from_millis(200),
        }
    }

    pub fn with_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn from_config(transport: Arc<dyn Transport>, policy: PolicyGate, config: &TransportConfig) -> Self {
        Self::new(transport, policy).with_retry(config.publish_retries, config.publish_backoff)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.policy
    }

    pub async fn send(&self, topic: &str, envelope: &Envelope) -> Result<PublishReceipt, SendError> {
        self.policy.pre_send(envelope).await?;

        let mut attempt = 0u32;
        loop {
            match self.transport.publish(topic, envelope).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retriable() && attempt < self.retries => {
                    let delay = self.backoff.saturating_mul(2u32.saturating_pow(attempt));
                    attempt += 1;
                    debug!(
                        topic,
                        message_id = %envelope.meta.message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retriable() => {
                    warn!(
                        topic,
                        message_id = %envelope.meta.message_id,
                        trace_id = %envelope.meta.trace_id,
                        attempts = attempt + 1,
                        "Publish retries exhausted, dead-lettering: {}",
                        e
                    );
                    if let Err(dlq) = self
                        .transport
                        .dead_letter(topic, envelope, DeadLetterReason::PublishFailed, &e.to_string())
                        .await
                    {
                        warn!(topic, message_id = %envelope.meta.message_id, "Dead-letter write failed: {}", dlq);
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publish `envelope` and wait up to `timeout` for its correlated reply.
    pub async fn request(&self, topic: &str, envelope: &Envelope, timeout: Duration) -> Result<Envelope, SendError> {
        self.policy.pre_send(envelope).await?;
        let reply = self.transport.request(topic, envelope, timeout).await?;
        self.policy.post_receive(&reply).await?;
        Ok(reply)
    }
}
