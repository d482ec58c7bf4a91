// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policy Gate
//!
//! Runs the external policy evaluator before an envelope is sent
//! (`pre_send`) and after one is received (`post_receive`). A denial aborts
//! the operation with a [`PolicyViolationError`] carrying the violations.
//!
//! ## Evaluator failures
//!
//! A slow or unreachable evaluator denies unless `fail_open` is set. With no
//! evaluator configured every envelope is allowed.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::domain::envelope::Envelope;
use crate::domain::execution::TraceId;
use crate::domain::node_config::PolicyConfig;
use crate::domain::policy::{PolicyError, PolicyEvaluator, PolicyOperation};
use crate::infrastructure::policy_client::HttpPolicyEvaluator;

#[derive(Debug, Clone, Error)]
#[error("policy denied {operation} of envelope {message_id} (trace {trace_id}): {reason}")]
pub struct PolicyViolationError {
    pub operation: PolicyOperation,
    pub message_id: String,
    pub trace_id: TraceId,
    pub reason: String,
    pub violations: Vec<String>,
}

impl PolicyViolationError {
    pub fn code(&self) -> &'static str {
        "E_POLICY_VIOLATION"
    }
}

#[derive(Clone)]
pub struct PolicyGate {
    evaluator: Option<Arc<dyn PolicyEvaluator>>,
    fail_open: bool,
}

impl PolicyGate {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>, fail_open: bool) -> Self {
        Self {
            evaluator: Some(evaluator),
            fail_open,
        }
    }

    /// Gate without an evaluator.
    pub fn permissive() -> Self {
        Self {
            evaluator: None,
            fail_open: true,
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        Ok(match HttpPolicyEvaluator::from_config(config)? {
            Some(evaluator) => Self::new(Arc::new(evaluator), config.fail_open),
            None => Self::permissive(),
        })
    }

    pub async fn pre_send(&self, envelope: &Envelope) -> Result<(), PolicyViolationError> {
        self.check(envelope, PolicyOperation::PreSend).await
    }

    pub async fn post_receive(&self, envelope: &Envelope) -> Result<(), PolicyViolationError> {
        self.check(envelope, PolicyOperation::PostReceive).await
    }

    pub async fn check(&self, envelope: &Envelope, operation: PolicyOperation) -> Result<(), PolicyViolationError> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(());
        };

        let (reason, violations) = match evaluator.evaluate(envelope, operation).await {
            Ok(decision) if decision.allow => return Ok(()),
            Ok(decision) => (
                decision.reason.unwrap_or_else(|| "denied by policy".to_string()),
                decision.violations,
            ),
            Err(e) if self.fail_open => {
                warn!(
                    message_id = %envelope.meta.message_id,
                    operation = %operation,
                    "Policy evaluator failed, allowing (fail_open): {}",
                    e
                );
                return Ok(());
            }
            Err(e) => (format!("policy evaluator unavailable: {}", e), vec!["evaluator_unavailable".to_string()]),
        };

        metrics::counter!("relay_policy_denials_total", "operation" => operation.as_str()).increment(1);
        warn!(
            message_id = %envelope.meta.message_id,
            trace_id = %envelope.meta.trace_id,
            operation = %operation,
            ?violations,
            "Policy denied envelope: {}",
            reason
        );
        Err(PolicyViolationError {
            operation,
            message_id: envelope.meta.message_id.clone(),
            trace_id: envelope.meta.trace_id,
            reason,
            violations,
        })
    }
}
