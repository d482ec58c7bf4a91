// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Idempotency Guard
//!
//! Suppresses duplicate processing of inbound envelopes using the dedup
//! ledger in the checkpoint store.
//!
//! ```text
//! begin(envelope) ─► claim_dedup(key)
//!      ├─ claimed            ─► Claimed(claim)   process, then succeed()/fail()
//!      ├─ Succeeded / Failed ─► Cached(outcome)  return recorded result, do not process
//!      └─ InProgress         ─► InFlight         another worker holds the key
//! ```
//!
//! An `InProgress` claim older than `stale_after` (a crashed worker) is taken
//! over by the next `begin`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::checkpoint::{DedupRecord, DedupStatus};
use crate::domain::envelope::Envelope;
use crate::domain::repository::{CheckpointRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("dedup record '{key}' is {status:?} without an outcome")]
    Corrupt { key: String, status: DedupStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Outcome recorded for an envelope that was already processed.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedOutcome {
    Succeeded(Value),
    Failed(String),
}

/// Exclusive right to process one idempotency key.
#[derive(Debug)]
pub struct IdempotencyClaim {
    record: DedupRecord,
}

impl IdempotencyClaim {
    pub fn key(&self) -> &str {
        &self.record.key
    }
}

#[derive(Debug)]
pub enum IdempotencyOutcome {
    Claimed(IdempotencyClaim),
    Cached(CachedOutcome),
    InFlight { key: String },
}

pub struct IdempotencyGuard {
    repository: Arc<dyn CheckpointRepository>,
    stale_after: Duration,
}

impl IdempotencyGuard {
    pub fn new(repository: Arc<dyn CheckpointRepository>, stale_after: Duration) -> Self {
        Self {
            repository,
            stale_after,
        }
    }

    pub async fn begin(&self, envelope: &Envelope) -> Result<IdempotencyOutcome, IdempotencyError> {
        let key = envelope.idempotency_key();
        let claim = DedupRecord::claim(
            key.clone(),
            Some(envelope.meta.trace_id),
            Some(envelope.meta.message_id.clone()),
        );

        let Some(existing) = self.repository.claim_dedup(&claim, self.stale_after).await? else {
            debug!(key = %key, trace_id = %envelope.meta.trace_id, "Idempotency key claimed");
            return Ok(IdempotencyOutcome::Claimed(IdempotencyClaim { record: claim }));
        };

        let outcome = match existing.status {
            DedupStatus::InProgress => return Ok(IdempotencyOutcome::InFlight { key }),
            DedupStatus::Succeeded => CachedOutcome::Succeeded(existing.response.unwrap_or(Value::Null)),
            DedupStatus::Failed => CachedOutcome::Failed(existing.error.ok_or_else(|| IdempotencyError::Corrupt {
                key: key.clone(),
                status: existing.status,
            })?),
        };
        metrics::counter!("relay_idempotent_hits_total").increment(1);
        info!(
            key = %key,
            message_id = %envelope.meta.message_id,
            trace_id = %envelope.meta.trace_id,
            "Duplicate envelope, returning recorded outcome"
        );
        Ok(IdempotencyOutcome::Cached(outcome))
    }

    pub async fn succeed(&self, claim: IdempotencyClaim, response: Value) -> Result<(), IdempotencyError> {
        self.repository.complete_dedup(&claim.record.succeed(response)).await?;
        Ok(())
    }

    pub async fn fail(&self, claim: IdempotencyClaim, error: impl Into<String>) -> Result<(), IdempotencyError> {
        self.repository.complete_dedup(&claim.record.fail(error)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::test_support::{sample_envelope, task_request};
    use crate::infrastructure::repositories::InMemoryCheckpointRepository;
    use serde_json::json;

    fn guard(stale_after: Duration) -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(InMemoryCheckpointRepository::new()), stale_after)
    }

    #[tokio::test]
    async fn test_second_delivery_returns_cached_result() {
        let guard = guard(Duration::from_secs(300));
        let envelope = sample_envelope(task_request());

        let IdempotencyOutcome::Claimed(claim) = guard.begin(&envelope).await.unwrap() else {
            panic!("first delivery must claim");
        };
        assert!(matches!(
            guard.begin(&envelope).await.unwrap(),
            IdempotencyOutcome::InFlight { .. }
        ));
        guard.succeed(claim, json!({"ok": 1})).await.unwrap();

        match guard.begin(&envelope).await.unwrap() {
            IdempotencyOutcome::Cached(CachedOutcome::Succeeded(value)) => assert_eq!(value, json!({"ok": 1})),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failures_are_cached_too() {
        let guard = guard(Duration::from_secs(300));
        let envelope = sample_envelope(task_request());
        let IdempotencyOutcome::Claimed(claim) = guard.begin(&envelope).await.unwrap() else {
            panic!("first delivery must claim");
        };
        guard.fail(claim, "E_POLICY_VIOLATION: denied").await.unwrap();
        assert!(matches!(
            guard.begin(&envelope).await.unwrap(),
            IdempotencyOutcome::Cached(CachedOutcome::Failed(e)) if e.contains("denied")
        ));
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let guard = guard(Duration::ZERO);
        let envelope = sample_envelope(task_request());
        assert!(matches!(guard.begin(&envelope).await.unwrap(), IdempotencyOutcome::Claimed(_)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(guard.begin(&envelope).await.unwrap(), IdempotencyOutcome::Claimed(_)));
    }
}
