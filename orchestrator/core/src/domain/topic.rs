// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Topic Naming
//!
//! Topics follow `qa.<tenant>.<project>.<domain>.<entity>.<verb>`. Every
//! segment is non-empty and limited to ASCII alphanumerics, `-` and `_`, so a
//! built topic always parses back into the same components.
//!
//! Subscriptions may use [`TopicPattern`], where a whole segment can be `*`.
//! Wildcards are rejected by [`build_topic`] and [`parse_topic`]: publishers
//! always address one concrete topic.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::execution::TraceId;

pub const TOPIC_ROOT: &str = "qa";
pub const DEAD_LETTER_SUFFIX: &str = "dlq";

const SEGMENT_NAMES: [&str; 6] = ["root", "tenant", "project", "domain", "entity", "verb"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic '{topic}' has {found} segments, expected 6")]
    SegmentCount { topic: String, found: usize },

    #[error("topic '{topic}' must start with 'qa'")]
    InvalidRoot { topic: String },

    #[error("{segment} segment is empty")]
    EmptySegment { segment: &'static str },

    #[error("{segment} segment '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        segment: &'static str,
        value: String,
        ch: char,
    },

    #[error("wildcard not allowed in {segment} segment of a concrete topic")]
    WildcardNotAllowed { segment: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicComponents {
    pub tenant: String,
    pub project: String,
    pub domain: String,
    pub entity: String,
    pub verb: String,
}

impl TopicComponents {
    pub fn new(
        tenant: impl Into<String>,
        project: impl Into<String>,
        domain: impl Into<String>,
        entity: impl Into<String>,
        verb: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            domain: domain.into(),
            entity: entity.into(),
            verb: verb.into(),
        }
    }

    fn segments(&self) -> [(&'static str, &str); 5] {
        [
            (SEGMENT_NAMES[1], self.tenant.as_str()),
            (SEGMENT_NAMES[2], self.project.as_str()),
            (SEGMENT_NAMES[3], self.domain.as_str()),
            (SEGMENT_NAMES[4], self.entity.as_str()),
            (SEGMENT_NAMES[5], self.verb.as_str()),
        ]
    }
}

fn check_segment(segment: &'static str, value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::EmptySegment { segment });
    }
    if value == "*" {
        return Err(TopicError::WildcardNotAllowed { segment });
    }
    if let Some(ch) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(TopicError::InvalidCharacter {
            segment,
            value: value.to_string(),
            ch,
        });
    }
    Ok(())
}

pub fn build_topic(components: &TopicComponents) -> Result<String, TopicError> {
    for (segment, value) in components.segments() {
        check_segment(segment, value)?;
    }
    Ok(format!(
        "{TOPIC_ROOT}.{}.{}.{}.{}.{}",
        components.tenant, components.project, components.domain, components.entity, components.verb
    ))
}

pub fn parse_topic(topic: &str) -> Result<TopicComponents, TopicError> {
    let parts: Vec<&str> = topic.split('.').collect();
    if parts.len() != 6 {
        return Err(TopicError::SegmentCount {
            topic: topic.to_string(),
            found: parts.len(),
        });
    }
    if parts[0] != TOPIC_ROOT {
        return Err(TopicError::InvalidRoot {
            topic: topic.to_string(),
        });
    }
    for (i, part) in parts.iter().enumerate().skip(1) {
        check_segment(SEGMENT_NAMES[i], part)?;
    }
    Ok(TopicComponents::new(parts[1], parts[2], parts[3], parts[4], parts[5]))
}

/// Map arbitrary text (an agent id, a dotted capability) onto a legal segment.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Partition key that keeps every message of one trace on the same partition.
pub fn generate_partition_key(tenant: &str, project: &str, trace_id: &TraceId) -> String {
    format!("{tenant}:{project}:{trace_id}")
}

/// Stable partition index for a key.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions as u64) as usize
}

/// Dead-letter destination for `topic`: the verb gains a `-dlq` suffix, so
/// `qa.acme.checkout.cmo.decisions.create` maps to
/// `qa.acme.checkout.cmo.decisions.create-dlq` and still parses.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}-{DEAD_LETTER_SUFFIX}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternSegment {
    Literal(String),
    Any,
}

/// Subscription pattern; `*` matches exactly one whole segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        let parts: Vec<&str> = pattern.split('.').collect();
        if parts.len() != 6 {
            return Err(TopicError::SegmentCount {
                topic: pattern.to_string(),
                found: parts.len(),
            });
        }
        if parts[0] != TOPIC_ROOT {
            return Err(TopicError::InvalidRoot {
                topic: pattern.to_string(),
            });
        }
        let mut segments = vec![PatternSegment::Literal(TOPIC_ROOT.to_string())];
        for (i, part) in parts.iter().enumerate().skip(1) {
            if *part == "*" {
                segments.push(PatternSegment::Any);
            } else {
                check_segment(SEGMENT_NAMES[i], part)?;
                segments.push(PatternSegment::Literal((*part).to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        parts.len() == self.segments.len()
            && self.segments.iter().zip(parts).all(|(seg, part)| match seg {
                PatternSegment::Any => !part.is_empty(),
                PatternSegment::Literal(lit) => lit == part,
            })
    }

    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
