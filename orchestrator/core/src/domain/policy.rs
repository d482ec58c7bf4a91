// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Policy Domain
//!
//! Policy gates run before an envelope is sent and after one is received. The
//! rules themselves live in an external evaluator; this module defines the
//! request/decision contract with it.
//!
//! Request: `{ "envelope": <Envelope>, "operation": "pre_send" | "post_receive" }`
//! Decision: `{ "allow": bool, "reason": string?, "violations": [string] }`

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOperation {
    PreSend,
    PostReceive,
}

impl PolicyOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyOperation::PreSend => "pre_send",
            PolicyOperation::PostReceive => "post_receive",
        }
    }
}

impl fmt::Display for PolicyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub violations: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            violations: vec![],
        }
    }

    pub fn deny(reason: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            violations,
        }
    }
}

/// Wire body sent to the evaluator.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest<'a> {
    pub envelope: &'a Envelope,
    pub operation: PolicyOperation,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy evaluator unreachable: {0}")]
    Unreachable(String),

    #[error("policy evaluator did not answer within {0:?}")]
    Timeout(Duration),

    #[error("policy evaluator returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// External rule engine consulted by the policy gates.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        envelope: &Envelope,
        operation: PolicyOperation,
    ) -> Result<PolicyDecision, PolicyError>;
}
