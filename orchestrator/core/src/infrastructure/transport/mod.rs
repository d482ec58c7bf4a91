// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transport Adapter
//!
//! Publish/subscribe and request/response over a durable, partitioned log
//! with consumer-group semantics.
//!
//! ## Guarantees
//!
//! | Concern | Behaviour |
//! |---------|-----------|
//! | Partitioning | `{tenant}:{project}:{trace_id}` selects the partition, so one trace stays ordered |
//! | Consumer groups | replicas subscribing with the same group share deliveries; each record goes to one member |
//! | Backpressure | publishers pause at `threshold` pending records per group, resume at `threshold * resume_ratio` |
//! | Dead letters | invalid envelopes and records nacked past `max_redeliveries` move to `<topic>-dlq` |
//! | Request/response | reply waiters keyed by correlation id; a missed deadline is [`TransportError::RequestTimeout`] |
//!
//! [`log::InMemoryLogTransport`] is the in-process implementation. A broker
//! backed implementation plugs in behind the same [`Transport`] trait.

pub mod backpressure;
pub mod log;

pub use backpressure::{BackpressureGate, GateTransition};
pub use log::InMemoryLogTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::envelope::Envelope;
use crate::domain::topic::TopicError;

/// One record handed to a consumer. `delivery_id` is what `ack`/`nack` refer to.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    Validation,
    MaxRedeliveries,
    PublishFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Validation => "validation",
            DeadLetterReason::MaxRedeliveries => "max_redeliveries",
            DeadLetterReason::PublishFailed => "publish_failed",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the envelope was published to.
    pub topic: String,
    /// Destination it was moved to (`<topic>-dlq`).
    pub dead_letter_topic: String,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub attempts: u32,
    pub envelope: Envelope,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Redeliver { next_attempt: u32 },
    DeadLettered,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("envelope failed validation: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidTopic(#[from] TopicError),

    #[error("publisher paused on {topic} for {waited:?} by consumer backpressure")]
    Backpressure { topic: String, waited: Duration },

    #[error("no reply for correlation id {correlation_id} within {timeout:?}")]
    RequestTimeout { correlation_id: String, timeout: Duration },

    #[error("request envelope {message_id} has no reply_to topic")]
    MissingReplyTo { message_id: String },

    #[error("unknown delivery {0}")]
    UnknownDelivery(u64),

    #[error("consumer group '{group}' is bound to '{existing}', cannot subscribe to '{requested}'")]
    GroupPatternMismatch {
        group: String,
        existing: String,
        requested: String,
    },

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Publish failures worth retrying with backoff before dead-lettering.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Backpressure { .. } | TransportError::Unavailable(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Validate (unless disabled) and append the envelope to `topic`.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<PublishReceipt, TransportError>;

    /// Join (or create) consumer group `group` reading topics matching `pattern`.
    async fn subscribe(&self, pattern: &str, group: &str) -> Result<Box<dyn Consumer>, TransportError>;

    /// Publish and wait for the response envelope carrying the request's correlation id.
    async fn request(&self, topic: &str, envelope: &Envelope, timeout: Duration) -> Result<Envelope, TransportError>;

    /// Move an envelope to `topic`'s dead-letter destination.
    async fn dead_letter(
        &self,
        topic: &str,
        envelope: &Envelope,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<(), TransportError>;

    async fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>, TransportError>;
}

#[async_trait]
pub trait Consumer: Send {
    fn group(&self) -> &str;

    /// Wait for the next record for this group.
    async fn next(&mut self) -> Result<Delivery, TransportError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Return the record for redelivery, or dead-letter it once it has been
    /// delivered more than `max_redeliveries` times.
    async fn nack(&mut self, delivery: &Delivery, reason: &str) -> Result<NackOutcome, TransportError>;
}

/// Correlation id a response to `request` must carry.
pub fn correlation_key(request: &Envelope) -> String {
    request
        .meta
        .correlation_id
        .clone()
        .unwrap_or_else(|| request.meta.message_id.clone())
}
