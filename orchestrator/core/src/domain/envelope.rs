// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # A2A Envelope
//!
//! The versioned wire contract exchanged between agents. Every message is an
//! [`Envelope`] made of a [`EnvelopeMeta`] header and a typed [`Payload`]
//! whose variant always agrees with `meta.type`.
//!
//! ## Wire Form
//!
//! ```json
//! {
//!   "meta": {
//!     "version": "1.0",
//!     "message_id": "<sha256 of immutable fields>",
//!     "trace_id": "<uuid>",
//!     "ts": "2026-01-01T00:00:00.000Z",
//!     "from": {"type": "orchestrator", "id": "cmo-1", "version": "1.2.0"},
//!     "to":   {"type": "specialist",   "id": "healer-7", "version": "0.4.1"},
//!     "tenant": "acme", "project": "checkout",
//!     "type": "SpecialistInvocationRequest",
//!     "correlation_id": "...", "reply_to": "qa.acme.checkout.agents.cmo-1.reply"
//!   },
//!   "payload": { "capability": "healing.selector", "task": {}, "budget": {"timeout_ms": 2000} }
//! }
//! ```
//!
//! Structural and semantic checks live in
//! [`crate::infrastructure::a2a::validator::EnvelopeValidator`]; this module only
//! guarantees the type/payload pairing.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::agent::AgentStatus;
use crate::domain::execution::TraceId;

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub id: String,
    pub version: String,
}

impl AgentIdentity {
    pub fn new(agent_type: impl Into<String>, id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.agent_type, self.id, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EnvelopeType {
    TaskRequest,
    TaskResult,
    MemoryEvent,
    ContextRequest,
    ContextResult,
    SpecialistInvocationRequest,
    SpecialistResult,
    RetryDirective,
    DecisionNotice,
    CancelDirective,
    AgentHeartbeat,
}

impl EnvelopeType {
    pub const ALL: [EnvelopeType; 11] = [
        EnvelopeType::TaskRequest,
        EnvelopeType::TaskResult,
        EnvelopeType::MemoryEvent,
        EnvelopeType::ContextRequest,
        EnvelopeType::ContextResult,
        EnvelopeType::SpecialistInvocationRequest,
        EnvelopeType::SpecialistResult,
        EnvelopeType::RetryDirective,
        EnvelopeType::DecisionNotice,
        EnvelopeType::CancelDirective,
        EnvelopeType::AgentHeartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::TaskRequest => "TaskRequest",
            EnvelopeType::TaskResult => "TaskResult",
            EnvelopeType::MemoryEvent => "MemoryEvent",
            EnvelopeType::ContextRequest => "ContextRequest",
            EnvelopeType::ContextResult => "ContextResult",
            EnvelopeType::SpecialistInvocationRequest => "SpecialistInvocationRequest",
            EnvelopeType::SpecialistResult => "SpecialistResult",
            EnvelopeType::RetryDirective => "RetryDirective",
            EnvelopeType::DecisionNotice => "DecisionNotice",
            EnvelopeType::CancelDirective => "CancelDirective",
            EnvelopeType::AgentHeartbeat => "AgentHeartbeat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    /// Response types are routed to pending request/response waiters by `correlation_id`.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            EnvelopeType::TaskResult | EnvelopeType::ContextResult | EnvelopeType::SpecialistResult
        )
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub version: String,
    pub message_id: String,
    pub trace_id: TraceId,
    pub ts: DateTime<Utc>,
    pub from: AgentIdentity,
    pub to: AgentIdentity,
    pub tenant: String,
    pub project: String,
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    /// Agent-to-agent call depth; incremented on every delegation.
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryEventKind {
    Upsert,
    Append,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub event: MemoryEventKind,
    pub key: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    #[serde(default)]
    pub filters: Map<String, Value>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    pub results: Vec<ContextHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationBudget {
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

impl InvocationBudget {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistInvocationRequest {
    pub capability: String,
    #[serde(default)]
    pub task: Value,
    pub budget: InvocationBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
    Unavailable,
    Rejected,
    BudgetExceeded,
}

impl SpecialistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistStatus::Success => "success",
            SpecialistStatus::Failure => "failure",
            SpecialistStatus::Timeout => "timeout",
            SpecialistStatus::Cancelled => "cancelled",
            SpecialistStatus::Unavailable => "unavailable",
            SpecialistStatus::Rejected => "rejected",
            SpecialistStatus::BudgetExceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialistResult {
    pub status: SpecialistStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl SpecialistResult {
    pub fn success(output: Value, cost: Option<f64>) -> Self {
        Self {
            status: SpecialistStatus::Success,
            output,
            error: None,
            cost,
        }
    }

    pub fn unsuccessful(status: SpecialistStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            output: Value::Null,
            error: Some(error.into()),
            cost: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SpecialistStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDirective {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<u32>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
    Defer,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionNotice {
    pub decision: Decision,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelDirective {
    pub reason: String,
    /// Narrows cancellation to one in-flight request; `None` cancels the whole trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub status: AgentStatus,
    pub lease_seconds: u64,
}

/// Typed payload; the variant is selected by `meta.type` when decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    TaskRequest(TaskRequest),
    TaskResult(TaskResult),
    MemoryEvent(MemoryEvent),
    ContextRequest(ContextRequest),
    ContextResult(ContextResult),
    SpecialistInvocationRequest(SpecialistInvocationRequest),
    SpecialistResult(SpecialistResult),
    RetryDirective(RetryDirective),
    DecisionNotice(DecisionNotice),
    CancelDirective(CancelDirective),
    AgentHeartbeat(AgentHeartbeat),
}

impl Payload {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Payload::TaskRequest(_) => EnvelopeType::TaskRequest,
            Payload::TaskResult(_) => EnvelopeType::TaskResult,
            Payload::MemoryEvent(_) => EnvelopeType::MemoryEvent,
            Payload::ContextRequest(_) => EnvelopeType::ContextRequest,
            Payload::ContextResult(_) => EnvelopeType::ContextResult,
            Payload::SpecialistInvocationRequest(_) => EnvelopeType::SpecialistInvocationRequest,
            Payload::SpecialistResult(_) => EnvelopeType::SpecialistResult,
            Payload::RetryDirective(_) => EnvelopeType::RetryDirective,
            Payload::DecisionNotice(_) => EnvelopeType::DecisionNotice,
            Payload::CancelDirective(_) => EnvelopeType::CancelDirective,
            Payload::AgentHeartbeat(_) => EnvelopeType::AgentHeartbeat,
        }
    }

    pub fn decode(envelope_type: EnvelopeType, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match envelope_type {
            EnvelopeType::TaskRequest => Payload::TaskRequest(serde_json::from_value(value)?),
            EnvelopeType::TaskResult => Payload::TaskResult(serde_json::from_value(value)?),
            EnvelopeType::MemoryEvent => Payload::MemoryEvent(serde_json::from_value(value)?),
            EnvelopeType::ContextRequest => Payload::ContextRequest(serde_json::from_value(value)?),
            EnvelopeType::ContextResult => Payload::ContextResult(serde_json::from_value(value)?),
            EnvelopeType::SpecialistInvocationRequest => {
                Payload::SpecialistInvocationRequest(serde_json::from_value(value)?)
            }
            EnvelopeType::SpecialistResult => Payload::SpecialistResult(serde_json::from_value(value)?),
            EnvelopeType::RetryDirective => Payload::RetryDirective(serde_json::from_value(value)?),
            EnvelopeType::DecisionNotice => Payload::DecisionNotice(serde_json::from_value(value)?),
            EnvelopeType::CancelDirective => Payload::CancelDirective(serde_json::from_value(value)?),
            EnvelopeType::AgentHeartbeat => Payload::AgentHeartbeat(serde_json::from_value(value)?),
        })
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Error)]
pub enum EnvelopeDecodeError {
    #[error("payload does not match envelope type {envelope_type}: {source}")]
    PayloadMismatch {
        envelope_type: EnvelopeType,
        #[source]
        source: serde_json::Error,
    },
}

/// Untyped wire shape used while decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub meta: EnvelopeMeta,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    pub meta: EnvelopeMeta,
    pub payload: Payload,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeDecodeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let envelope_type = raw.meta.envelope_type;
        let payload = Payload::decode(envelope_type, raw.payload)
            .map_err(|source| EnvelopeDecodeError::PayloadMismatch { envelope_type, source })?;
        Ok(Self { meta: raw.meta, payload })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 2)?;
        state.serialize_field("meta", &self.meta)?;
        state.serialize_field("payload", &self.payload)?;
        state.end()
    }
}

/// Millisecond-precision RFC 3339 rendering used everywhere a timestamp is hashed.
pub fn canonical_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time truncated to milliseconds so it survives a wire round trip unchanged.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

impl Envelope {
    pub fn envelope_type(&self) -> EnvelopeType {
        self.meta.envelope_type
    }

    pub fn trace_id(&self) -> TraceId {
        self.meta.trace_id
    }

    /// Deterministic hash of the fields that never change after the envelope is built.
    ///
    /// Credentials, the signature and the idempotency key are excluded; the
    /// idempotency key is derived from this value.
    pub fn compute_message_id(&self) -> String {
        let meta = &self.meta;
        let immutable = json!({
            "version": meta.version,
            "trace_id": meta.trace_id,
            "ts": canonical_ts(&meta.ts),
            "from": meta.from,
            "to": meta.to,
            "tenant": meta.tenant,
            "project": meta.project,
            "type": meta.envelope_type,
            "depth": meta.depth,
            "priority": meta.priority,
            "correlation_id": meta.correlation_id,
            "reply_to": meta.reply_to,
            "payload": self.payload,
        });
        let bytes = serde_json::to_vec(&immutable).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }

    /// Stamp `meta.message_id` from the immutable fields.
    pub fn seal(mut self) -> Self {
        self.meta.message_id = self.compute_message_id();
        self
    }

    /// `message_id` matches the hash of the immutable fields.
    pub fn has_consistent_message_id(&self) -> bool {
        self.meta.message_id == self.compute_message_id()
    }

    /// Explicit key if the sender provided one, otherwise `trace_id:message_id:ts:from.id`.
    pub fn idempotency_key(&self) -> String {
        match &self.meta.idempotency_key {
            Some(key) => key.clone(),
            None => derive_idempotency_key(&self.meta),
        }
    }

    pub fn payload_type_matches(&self) -> bool {
        self.payload.envelope_type() == self.meta.envelope_type
    }
}

pub fn derive_idempotency_key(meta: &EnvelopeMeta) -> String {
    format!(
        "{}:{}:{}:{}",
        meta.trace_id,
        meta.message_id,
        canonical_ts(&meta.ts),
        meta.from.id
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn sample_envelope(payload: Payload) -> Envelope {
        Envelope {
            meta: EnvelopeMeta {
                version: PROTOCOL_VERSION.to_string(),
                message_id: String::new(),
                trace_id: TraceId::new(),
                ts: now_millis(),
                from: AgentIdentity::new("orchestrator", "cmo-1", "1.0.0"),
                to: AgentIdentity::new("specialist", "healer-7", "0.4.1"),
                tenant: "acme".into(),
                project: "checkout".into(),
                envelope_type: payload.envelope_type(),
                depth: 0,
                priority: None,
                correlation_id: None,
                reply_to: None,
                idempotency_key: None,
                auth_token: None,
                capability_token: None,
                signature: None,
            },
            payload,
        }
        .seal()
    }

    pub fn task_request() -> Payload {
        Payload::TaskRequest(TaskRequest {
            task_id: "task-1".into(),
            task_type: "triage".into(),
            inputs: json!({"ticket": 42}),
            deadline: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_envelope_round_trips_through_json() {
        let envelope = sample_envelope(task_request());
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.has_consistent_message_id());
    }

    #[test]
    fn test_payload_must_match_type() {
        let envelope = sample_envelope(task_request());
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["meta"]["type"] = json!("DecisionNotice");
        let err = serde_json::from_value::<Envelope>(value).unwrap_err();
        assert!(err.to_string().contains("DecisionNotice"));
    }

    #[test]
    fn test_message_id_ignores_credentials() {
        let envelope = sample_envelope(task_request());
        let mut tokened = envelope.clone();
        tokened.meta.auth_token = Some("abc".into());
        tokened.meta.signature = Some("ff".into());
        assert_eq!(envelope.compute_message_id(), tokened.compute_message_id());

        let mut altered = envelope.clone();
        altered.meta.tenant = "other".into();
        assert_ne!(envelope.compute_message_id(), altered.compute_message_id());
    }

    #[test]
    fn test_derived_idempotency_key_format() {
        let envelope = sample_envelope(task_request());
        let key = envelope.idempotency_key();
        let expected_prefix = format!("{}:{}:", envelope.meta.trace_id, envelope.meta.message_id);
        assert!(key.starts_with(&expected_prefix));
        assert!(key.ends_with(":cmo-1"));

        let mut explicit = envelope;
        explicit.meta.idempotency_key = Some("caller-key".into());
        assert_eq!(explicit.idempotency_key(), "caller-key");
    }

    #[test]
    fn test_response_types() {
        let responses: Vec<_> = EnvelopeType::ALL.iter().filter(|t| t.is_response()).collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(EnvelopeType::parse("CancelDirective"), Some(EnvelopeType::CancelDirective));
        assert_eq!(EnvelopeType::parse("Nope"), None);
    }
}
