// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Validator
//!
//! Structural and semantic validation of `{meta, payload}` JSON documents.
//!
//! Each envelope type owns one [`PayloadSchema`] built when the validator is
//! constructed; `meta.type` selects it through a map lookup, so dispatch costs
//! the same for every type. Validation never panics and never returns `Err`
//! for bad input: problems come back as [`ValidationIssue`]s carrying a JSON
//! pointer (`/payload/budget/timeout_ms`) and a message. The only `Err` path is
//! [`EnvelopeValidator::schema_for`], used when code asks for a type name that
//! does not exist.

use std::collections::HashMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::envelope::{Envelope, EnvelopeType};
use crate::domain::topic::parse_topic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(errors: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown envelope type '{0}'")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    NonEmpty,
    UInt,
    PositiveInt,
    Number,
    NonNegative,
    Object,
    Any,
    Timestamp,
    Uuid,
    Hex,
    Version,
    TopicSegment,
    Topic,
    OneOf(&'static [&'static str]),
    Nested(&'static [Field]),
    ArrayOf(&'static [Field]),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    kind: Kind,
    required: bool,
}

const fn req(name: &'static str, kind: Kind) -> Field {
    Field { name, kind, required: true }
}

const fn opt(name: &'static str, kind: Kind) -> Field {
    Field { name, kind, required: false }
}

const IDENTITY: &[Field] = &[
    req("type", Kind::NonEmpty),
    req("id", Kind::NonEmpty),
    req("version", Kind::NonEmpty),
];

const META: &[Field] = &[
    req("version", Kind::Version),
    req("message_id", Kind::Hex),
    req("trace_id", Kind::Uuid),
    req("ts", Kind::Timestamp),
    req("from", Kind::Nested(IDENTITY)),
    req("to", Kind::Nested(IDENTITY)),
    req("tenant", Kind::TopicSegment),
    req("project", Kind::TopicSegment),
    opt("depth", Kind::UInt),
    opt("priority", Kind::OneOf(&["low", "normal", "high", "critical"])),
    opt("correlation_id", Kind::NonEmpty),
    opt("reply_to", Kind::Topic),
    opt("idempotency_key", Kind::NonEmpty),
    opt("auth_token", Kind::NonEmpty),
    opt("capability_token", Kind::NonEmpty),
    opt("signature", Kind::Hex),
];

const BUDGET: &[Field] = &[req("timeout_ms", Kind::PositiveInt), opt("max_cost", Kind::NonNegative)];

const CONTEXT_HIT: &[Field] = &[req("id", Kind::NonEmpty), req("score", Kind::Number), opt("content", Kind::Any)];

type SemanticCheck = fn(&Map<String, Value>, &mut Vec<ValidationIssue>);

/// Compiled rules for one envelope type's payload.
#[derive(Debug, Clone)]
pub struct PayloadSchema {
    envelope_type: EnvelopeType,
    fields: &'static [Field],
    semantic: Option<SemanticCheck>,
}

impl PayloadSchema {
    pub fn envelope_type(&self) -> EnvelopeType {
        self.envelope_type
    }

    pub fn required_fields(&self) -> Vec<&'static str> {
        self.fields.iter().filter(|f| f.required).map(|f| f.name).collect()
    }
}

const TASK_REQUEST: &[Field] = &[
    req("task_id", Kind::NonEmpty),
    req("task_type", Kind::NonEmpty),
    opt("inputs", Kind::Any),
    opt("deadline", Kind::Timestamp),
];

const TASK_RESULT: &[Field] = &[
    req("task_id", Kind::NonEmpty),
    req("status", Kind::OneOf(&["succeeded", "failed", "cancelled"])),
    opt("output", Kind::Any),
    opt("error", Kind::Str),
];

const MEMORY_EVENT: &[Field] = &[
    req("event", Kind::OneOf(&["upsert", "append", "delete"])),
    req("key", Kind::NonEmpty),
    opt("data", Kind::Any),
];

const CONTEXT_REQUEST: &[Field] = &[
    req("query", Kind::NonEmpty),
    opt("filters", Kind::Object),
    req("limit", Kind::PositiveInt),
];

const CONTEXT_RESULT: &[Field] = &[req("results", Kind::ArrayOf(CONTEXT_HIT))];

const SPECIALIST_REQUEST: &[Field] = &[
    req("capability", Kind::NonEmpty),
    opt("task", Kind::Any),
    req("budget", Kind::Nested(BUDGET)),
];

const SPECIALIST_RESULT: &[Field] = &[
    req(
        "status",
        Kind::OneOf(&[
            "success",
            "failure",
            "timeout",
            "cancelled",
            "unavailable",
            "rejected",
            "budget_exceeded",
        ]),
    ),
    opt("output", Kind::Any),
    opt("error", Kind::Str),
    opt("cost", Kind::NonNegative),
];

const RETRY_DIRECTIVE: &[Field] = &[
    req("reason", Kind::NonEmpty),
    opt("target_step", Kind::UInt),
    req("max_attempts", Kind::PositiveInt),
    req("backoff_ms", Kind::UInt),
];

const DECISION_NOTICE: &[Field] = &[
    req("decision", Kind::OneOf(&["approve", "reject", "defer", "escalate"])),
    req("rationale", Kind::NonEmpty),
    opt("proposal", Kind::Any),
];

const CANCEL_DIRECTIVE: &[Field] = &[req("reason", Kind::NonEmpty), opt("target_correlation_id", Kind::NonEmpty)];

const AGENT_HEARTBEAT: &[Field] = &[
    req("status", Kind::OneOf(&["STARTING", "HEALTHY", "DEGRADED", "UNAVAILABLE"])),
    req("lease_seconds", Kind::PositiveInt),
];

fn payload_fields(envelope_type: EnvelopeType) -> (&'static [Field], Option<SemanticCheck>) {
    match envelope_type {
        EnvelopeType::TaskRequest => (TASK_REQUEST, None),
        EnvelopeType::TaskResult => (TASK_RESULT, None),
        EnvelopeType::MemoryEvent => (MEMORY_EVENT, None),
        EnvelopeType::ContextRequest => (CONTEXT_REQUEST, None),
        EnvelopeType::ContextResult => (CONTEXT_RESULT, None),
        EnvelopeType::SpecialistInvocationRequest => (SPECIALIST_REQUEST, None),
        EnvelopeType::SpecialistResult => (SPECIALIST_RESULT, None),
        EnvelopeType::RetryDirective => (RETRY_DIRECTIVE, None),
        EnvelopeType::DecisionNotice => (DECISION_NOTICE, Some(approval_carries_proposal)),
        EnvelopeType::CancelDirective => (CANCEL_DIRECTIVE, None),
        EnvelopeType::AgentHeartbeat => (AGENT_HEARTBEAT, None),
    }
}

fn approval_carries_proposal(payload: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    let approved = payload.get("decision").and_then(Value::as_str) == Some("approve");
    let has_proposal = payload.get("proposal").is_some_and(|p| !p.is_null());
    if approved && !has_proposal {
        issues.push(issue("/payload/proposal", "required when decision is approve"));
    }
}

fn issue(path: impl Into<String>, message: impl Into<String>) -> ValidationIssue {
    ValidationIssue {
        path: path.into(),
        message: message.into(),
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_fields(object: &Map<String, Value>, fields: &[Field], base: &str, issues: &mut Vec<ValidationIssue>) {
    for field in fields {
        let path = format!("{base}/{}", field.name);
        match object.get(field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    issues.push(issue(path, "required field missing"));
                }
            }
            Some(value) => check_value(value, field.kind, &path, issues),
        }
    }
}

fn check_value(value: &Value, kind: Kind, path: &str, issues: &mut Vec<ValidationIssue>) {
    let problem: Option<String> = match kind {
        Kind::Any => None,
        Kind::Str => (!value.is_string()).then(|| "expected string".into()),
        Kind::NonEmpty => match value.as_str() {
            Some(s) if !s.trim().is_empty() => None,
            Some(_) => Some("must not be empty".into()),
            None => Some("expected string".into()),
        },
        Kind::UInt => value.as_u64().is_none().then(|| "expected non-negative integer".into()),
        Kind::PositiveInt => match value.as_u64() {
            Some(n) if n > 0 => None,
            _ => Some("expected positive integer".into()),
        },
        Kind::Number => value.as_f64().is_none().then(|| "expected number".into()),
        Kind::NonNegative => match value.as_f64() {
            Some(n) if n >= 0.0 => None,
            _ => Some("expected non-negative number".into()),
        },
        Kind::Object => (!value.is_object()).then(|| "expected object".into()),
        Kind::Timestamp => match value.as_str() {
            Some(s) if DateTime::parse_from_rfc3339(s).is_ok() => None,
            Some(_) => Some("expected RFC 3339 timestamp".into()),
            None => Some("expected string".into()),
        },
        Kind::Uuid => match value.as_str() {
            Some(s) if Uuid::parse_str(s).is_ok() => None,
            _ => Some("expected UUID".into()),
        },
        Kind::Hex => match value.as_str() {
            Some(s) if is_hex(s) => None,
            _ => Some("expected hex string".into()),
        },
        Kind::Version => match value.as_str() {
            Some(s) if s.starts_with("1.") => None,
            Some(s) => Some(format!("unsupported protocol version '{s}'")),
            None => Some("expected string".into()),
        },
        Kind::TopicSegment => match value.as_str() {
            Some(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => None,
            Some(_) => Some("must be a non-empty topic segment [A-Za-z0-9_-]".into()),
            None => Some("expected string".into()),
        },
        Kind::Topic => match value.as_str() {
            Some(s) => parse_topic(s).err().map(|e| e.to_string()),
            None => Some("expected string".into()),
        },
        Kind::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => None,
            _ => Some(format!("expected one of {}", allowed.join(", "))),
        },
        Kind::Nested(fields) => match value.as_object() {
            Some(object) => {
                check_fields(object, fields, path, issues);
                None
            }
            None => Some("expected object".into()),
        },
        Kind::ArrayOf(fields) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}/{i}");
                    match item.as_object() {
                        Some(object) => check_fields(object, fields, &item_path, issues),
                        None => issues.push(issue(item_path, "expected object")),
                    }
                }
                None
            }
            None => Some("expected array".into()),
        },
    };
    if let Some(message) = problem {
        issues.push(issue(path, message));
    }
}

/// Validator with one pre-built schema per envelope type.
#[derive(Debug, Clone)]
pub struct EnvelopeValidator {
    schemas: HashMap<EnvelopeType, PayloadSchema>,
}

impl Default for EnvelopeValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeValidator {
    pub fn new() -> Self {
        let schemas = EnvelopeType::ALL
            .iter()
            .map(|&envelope_type| {
                let (fields, semantic) = payload_fields(envelope_type);
                (
                    envelope_type,
                    PayloadSchema {
                        envelope_type,
                        fields,
                        semantic,
                    },
                )
            })
            .collect();
        Self { schemas }
    }

    /// Look up the schema for a type name.
    pub fn schema_for(&self, type_name: &str) -> Result<&PayloadSchema, ValidationError> {
        EnvelopeType::parse(type_name)
            .and_then(|t| self.schemas.get(&t))
            .ok_or_else(|| ValidationError::UnknownType(type_name.to_string()))
    }

    pub fn validate(&self, document: &Value) -> ValidationReport {
        let mut issues = Vec::new();

        let Some(root) = document.as_object() else {
            return ValidationReport::from_issues(vec![issue("", "expected object")]);
        };

        let meta = match root.get("meta") {
            Some(Value::Object(meta)) => meta,
            Some(_) => {
                issues.push(issue("/meta", "expected object"));
                return ValidationReport::from_issues(issues);
            }
            None => {
                issues.push(issue("/meta", "required field missing"));
                return ValidationReport::from_issues(issues);
            }
        };
        check_fields(meta, META, "/meta", &mut issues);

        let envelope_type = match meta.get("type").and_then(Value::as_str) {
            Some(name) => match EnvelopeType::parse(name) {
                Some(t) => Some(t),
                None => {
                    issues.push(issue("/meta/type", format!("unknown envelope type '{name}'")));
                    None
                }
            },
            None => {
                issues.push(issue("/meta/type", "required field missing"));
                None
            }
        };

        if let Some(envelope_type) = envelope_type {
            if envelope_type.is_response() && meta.get("correlation_id").is_none_or(Value::is_null) {
                issues.push(issue("/meta/correlation_id", "required for response envelopes"));
            }
            match root.get("payload") {
                Some(Value::Object(payload)) => {
                    if let Some(schema) = self.schemas.get(&envelope_type) {
                        check_fields(payload, schema.fields, "/payload", &mut issues);
                        if let Some(semantic) = schema.semantic {
                            semantic(payload, &mut issues);
                        }
                    }
                }
                Some(_) => issues.push(issue("/payload", "expected object")),
                None => issues.push(issue("/payload", "required field missing")),
            }
        }

        if issues.is_empty() {
            match serde_json::from_value::<Envelope>(document.clone()) {
                Ok(envelope) if !envelope.has_consistent_message_id() => {
                    issues.push(issue("/meta/message_id", "does not match envelope content"));
                }
                Ok(_) => {}
                Err(e) => issues.push(issue("", e.to_string())),
            }
        }

        ValidationReport::from_issues(issues)
    }

    pub fn validate_envelope(&self, envelope: &Envelope) -> ValidationReport {
        match serde_json::to_value(envelope) {
            Ok(document) => self.validate(&document),
            Err(e) => ValidationReport::from_issues(vec![issue("", e.to_string())]),
        }
    }
}
