// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Policy Evaluator Clients
//!
//! Infrastructure implementations of [`PolicyEvaluator`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Reach the external rule engine behind the policy gates
//! - **Integration:** `PolicyGate` → `HttpPolicyEvaluator` → `POST {endpoint}`
//!
//! Transport failures are classified, not decided here: the gate chooses
//! whether a slow or unreachable evaluator means deny (the default) or allow.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::domain::envelope::Envelope;
use crate::domain::node_config::PolicyConfig;
use crate::domain::policy::{PolicyDecision, PolicyError, PolicyEvaluator, PolicyOperation, PolicyRequest};

pub struct HttpPolicyEvaluator {
    endpoint: String,
    timeout: Duration,
    client: Client,
}

impl HttpPolicyEvaluator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, PolicyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            timeout,
            client,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &PolicyConfig) -> Result<Option<Self>, PolicyError> {
        config
            .endpoint
            .as_ref()
            .map(|endpoint| Self::new(endpoint.clone(), config.timeout))
            .transpose()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PolicyEvaluator for HttpPolicyEvaluator {
    async fn evaluate(&self, envelope: &Envelope, operation: PolicyOperation) -> Result<PolicyDecision, PolicyError> {
        let body = PolicyRequest { envelope, operation };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PolicyError::Timeout(self.timeout)
                } else {
                    PolicyError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PolicyError::InvalidResponse(format!("HTTP {}", status)));
        }

        let decision = response.json::<PolicyDecision>().await.map_err(|e| {
            if e.is_timeout() {
                PolicyError::Timeout(self.timeout)
            } else {
                PolicyError::InvalidResponse(e.to_string())
            }
        })?;
        debug!(
            message_id = %envelope.meta.message_id,
            operation = %operation,
            allow = decision.allow,
            "Policy evaluated"
        );
        Ok(decision)
    }
}

/// Fixed decision for development nodes and tests.
#[derive(Debug, Clone)]
pub struct StaticPolicyEvaluator {
    decision: PolicyDecision,
}

impl StaticPolicyEvaluator {
    pub fn allow_all() -> Self {
        Self {
            decision: PolicyDecision::allow(),
        }
    }

    pub fn deny_all(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision::deny(reason, vec![]),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicyEvaluator {
    async fn evaluate(&self, _envelope: &Envelope, _operation: PolicyOperation) -> Result<PolicyDecision, PolicyError> {
        Ok(self.decision.clone())
    }
}
