// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Activity Boundary
//!
//! Every non-deterministic effect a step performs (network call, clock read,
//! randomness, storage operation) goes through an [`ActivityContext`].
//!
//! | Mode | Real system touched | Captured |
//! |------|---------------------|----------|
//! | `Normal` | yes | no |
//! | `Record` | yes | yes, into the step journal |
//! | `Replay` | never | served from the recorded activities |
//!
//! A recorded activity is identified by `request_hash`, the hash of its type
//! and request body. Replay serves the first not-yet-consumed recording with a
//! matching hash, so repeated identical requests within a step come back in
//! recorded order. A missing recording is [`ActivityError::ReplayGap`]; replay
//! never falls back to live execution.
//!
//! The journal is committed together with the step checkpoint, so the
//! activities of a failed attempt are never persisted.

use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::domain::checkpoint::{hash_value, ActivityResponse, ActivityType, RecordedActivity};
use crate::domain::envelope::now_millis;
use crate::domain::execution::{ActivityMode, TraceId};

#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("trace {trace_id} step {step_index}: no recorded {activity_type:?} activity for request {request_hash}")]
    ReplayGap {
        trace_id: TraceId,
        step_index: u32,
        activity_type: ActivityType,
        request_hash: String,
    },

    #[error("trace {trace_id} step {step_index}: {activity_type:?} activity failed: {message}")]
    Failed {
        trace_id: TraceId,
        step_index: u32,
        activity_type: ActivityType,
        message: String,
    },

    #[error("recorded response has unexpected shape: {0}")]
    Decode(String),
}

impl ActivityError {
    pub fn code(&self) -> &'static str {
        match self {
            ActivityError::ReplayGap { .. } => "E_REPLAY_GAP",
            ActivityError::Failed { .. } => "E_ACTIVITY_FAILED",
            ActivityError::Decode(_) => "E_ACTIVITY_DECODE",
        }
    }
}

/// Hash identifying an activity request within a step.
pub fn request_hash(activity_type: ActivityType, request: &Value) -> String {
    hash_value(&json!({"type": activity_type, "request": request}))
}

#[derive(Default)]
struct ActivityState {
    next_sequence: u32,
    journal: Vec<RecordedActivity>,
    recorded: Vec<RecordedActivity>,
    consumed: Vec<bool>,
}

/// Activity boundary for one attempt of one step.
pub struct ActivityContext {
    trace_id: TraceId,
    step_index: u32,
    mode: ActivityMode,
    state: Mutex<ActivityState>,
}

impl ActivityContext {
    pub fn new(trace_id: TraceId, step_index: u32, mode: ActivityMode) -> Self {
        Self {
            trace_id,
            step_index,
            mode,
            state: Mutex::new(ActivityState::default()),
        }
    }

    /// Context serving `recorded` (the step's stored activities) in replay mode.
    pub fn replay(trace_id: TraceId, step_index: u32, mut recorded: Vec<RecordedActivity>) -> Self {
        recorded.sort_by_key(|a| a.sequence);
        let consumed = vec![false; recorded.len()];
        Self {
            trace_id,
            step_index,
            mode: ActivityMode::Replay,
            state: Mutex::new(ActivityState {
                recorded,
                consumed,
                ..ActivityState::default()
            }),
        }
    }

    pub fn mode(&self) -> ActivityMode {
        self.mode
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn step_index(&self) -> u32 {
        self.step_index
    }

    /// Run `effect` through the boundary according to the mode.
    pub async fn execute<F, Fut>(&self, activity_type: ActivityType, request: Value, effect: F) -> Result<Value, ActivityError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let hash = request_hash(activity_type, &request);
        match self.mode {
            ActivityMode::Replay => self.serve_recorded(activity_type, &hash),
            ActivityMode::Normal => effect(request).await.map_err(|e| self.failed(activity_type, e.to_string())),
            ActivityMode::Record => {
                let response = match effect(request).await {
                    Ok(value) => ActivityResponse::Ok(value),
                    Err(e) => ActivityResponse::Err(e.to_string()),
                };
                self.capture(activity_type, hash, response.clone());
                self.into_result(activity_type, response)
            }
        }
    }

    /// Recordable wall-clock read, millisecond precision.
    pub async fn now(&self) -> Result<DateTime<Utc>, ActivityError> {
        let value = self
            .execute(ActivityType::Clock, json!({"op": "now"}), |_| async {
                Ok(json!(now_millis().to_rfc3339()))
            })
            .await?;
        value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .ok_or_else(|| ActivityError::Decode(format!("expected RFC 3339 timestamp, got {value}")))
    }

    /// Recordable random number.
    pub async fn random_u64(&self) -> Result<u64, ActivityError> {
        let value = self
            .execute(ActivityType::Random, json!({"op": "u64"}), |_| async {
                Ok(json!(OsRng.next_u64()))
            })
            .await?;
        value
            .as_u64()
            .ok_or_else(|| ActivityError::Decode(format!("expected unsigned integer, got {value}")))
    }

    pub async fn network<F, Fut>(&self, request: Value, call: F) -> Result<Value, ActivityError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        self.execute(ActivityType::Network, request, call).await
    }

    pub async fn storage<F, Fut>(&self, request: Value, op: F) -> Result<Value, ActivityError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        self.execute(ActivityType::Storage, request, op).await
    }

    /// Activities captured so far, in sequence order. Empty outside record mode.
    pub fn journal(&self) -> Vec<RecordedActivity> {
        self.state.lock().journal.clone()
    }

    /// Recorded activities replay has not served yet.
    pub fn unconsumed(&self) -> usize {
        self.state.lock().consumed.iter().filter(|c| !**c).count()
    }

    fn capture(&self, activity_type: ActivityType, request_hash: String, response: ActivityResponse) {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.journal.push(RecordedActivity {
            trace_id: self.trace_id,
            step_index: self.step_index,
            sequence,
            activity_type,
            request_hash,
            response,
            timestamp: Utc::now(),
        });
    }

    fn serve_recorded(&self, activity_type: ActivityType, hash: &str) -> Result<Value, ActivityError> {
        let response = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let position = state
                .recorded
                .iter()
                .zip(state.consumed.iter())
                .position(|(a, used)| !used && a.activity_type == activity_type && a.request_hash == hash);
            match position {
                Some(i) => {
                    state.consumed[i] = true;
                    state.recorded[i].response.clone()
                }
                None => {
                    return Err(ActivityError::ReplayGap {
                        trace_id: self.trace_id,
                        step_index: self.step_index,
                        activity_type,
                        request_hash: hash.to_string(),
                    })
                }
            }
        };
        debug!(trace_id = %self.trace_id, step_index = self.step_index, request_hash = hash, "Served recorded activity");
        self.into_result(activity_type, response)
    }

    fn into_result(&self, activity_type: ActivityType, response: ActivityResponse) -> Result<Value, ActivityError> {
        match response {
            ActivityResponse::Ok(value) => Ok(value),
            ActivityResponse::Err(message) => Err(self.failed(activity_type, message)),
        }
    }

    fn failed(&self, activity_type: ActivityType, message: String) -> ActivityError {
        ActivityError::Failed {
            trace_id: self.trace_id,
            step_index: self.step_index,
            activity_type,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_record_then_replay_returns_same_values() {
        let trace_id = TraceId::new();
        let live = ActivityContext::new(trace_id, 0, ActivityMode::Record);
        let ts = live.now().await.unwrap();
        let n = live.random_u64().await.unwrap();
        let body = live
            .network(json!({"url": "https://api/selectors"}), |_| async { Ok(json!({"selector": "#login"})) })
            .await
            .unwrap();
        let journal = live.journal();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.iter().map(|a| a.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);

        let replay = ActivityContext::replay(trace_id, 0, journal);
        let calls = AtomicU32::new(0);
        assert_eq!(replay.now().await.unwrap(), ts);
        assert_eq!(replay.random_u64().await.unwrap(), n);
        let replayed = replay
            .network(json!({"url": "https://api/selectors"}), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("live"))
            })
            .await
            .unwrap();
        assert_eq!(replayed, body);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(replay.unconsumed(), 0);
    }

    #[tokio::test]
    async fn test_replay_gap_never_runs_live() {
        let replay = ActivityContext::replay(TraceId::new(), 3, vec![]);
        let calls = AtomicU32::new(0);
        let err = replay
            .storage(json!({"get": "k"}), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_REPLAY_GAP");
        assert!(matches!(err, ActivityError::ReplayGap { step_index: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recorded_failure_replays_as_failure() {
        let trace_id = TraceId::new();
        let live = ActivityContext::new(trace_id, 1, ActivityMode::Record);
        let err = live
            .network(json!({"url": "x"}), |_| async { Err(anyhow::anyhow!("connection reset")) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_ACTIVITY_FAILED");

        let replay = ActivityContext::replay(trace_id, 1, live.journal());
        let replayed = replay
            .network(json!({"url": "x"}), |_| async { Ok(json!("live")) })
            .await
            .unwrap_err();
        assert!(replayed.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_identical_requests_replay_in_order() {
        let trace_id = TraceId::new();
        let live = ActivityContext::new(trace_id, 0, ActivityMode::Record);
        let first = live.random_u64().await.unwrap();
        let second = live.random_u64().await.unwrap();

        let replay = ActivityContext::replay(trace_id, 0, live.journal());
        assert_eq!(replay.random_u64().await.unwrap(), first);
        assert_eq!(replay.random_u64().await.unwrap(), second);
        assert!(replay.random_u64().await.is_err());
    }

    #[tokio::test]
    async fn test_normal_mode_keeps_no_journal() {
        let ctx = ActivityContext::new(TraceId::new(), 0, ActivityMode::Normal);
        ctx.random_u64().await.unwrap();
        assert!(ctx.journal().is_empty());
    }
}
