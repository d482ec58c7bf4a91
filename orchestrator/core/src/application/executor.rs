// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime Executor
//!
//! Drives a [`StepGraph`] one step at a time for a trace, checkpointing each
//! completed step together with the activities it recorded.
//!
//! ## Step Pipeline
//!
//! ```text
//! pending ─► running ──► handler(ctx, input) under step_timeout
//!                │            │
//!                │      Ok ───┴──► save_step (insert-if-absent) ─► next node / done
//!                │      Err / timeout ─► retry with backoff until max_attempts,
//!                │                       then TraceReport{status: failed}
//!                └─ cancel(trace_id) ─► TraceReport{status: cancelled}
//! ```
//!
//! ## Resume & Replay
//!
//! `run` on a trace that already has checkpoints continues after the last one,
//! so a failed trace is resumed rather than re-executed. `replay` re-runs the
//! stored path against recorded activities only and checks every step output
//! is byte-identical to its checkpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::application::activity::{ActivityContext, ActivityError};
use crate::domain::checkpoint::{hash_value, ExecutionStep, NodeId, RecordedActivity, SaveOutcome};
use crate::domain::events::TraceEvent;
use crate::domain::execution::{
    ActivityMode, ExecutionError, RetryPolicy, StepFailureReport, StepStatus, TraceId, TraceReport, TraceStatus,
};
use crate::domain::node_config::RuntimeConfig;
use crate::domain::repository::CheckpointRepository;
use crate::infrastructure::event_bus::EventBus;

const REDACTED: &str = "[REDACTED]";

/// What a step produced and where the graph goes next.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: Value,
    pub next: Option<NodeId>,
}

impl StepOutcome {
    pub fn next(output: Value, node: impl Into<NodeId>) -> Self {
        Self {
            output,
            next: Some(node.into()),
        }
    }

    /// Terminal step.
    pub fn finish(output: Value) -> Self {
        Self { output, next: None }
    }
}

/// Per-attempt view handed to a [`StepHandler`].
pub struct StepContext<'a> {
    pub trace_id: TraceId,
    pub step_index: u32,
    pub node_id: &'a NodeId,
    pub attempt: u32,
    /// Call depth of this trace; delegations carry `depth + 1`.
    pub depth: u32,
    activities: &'a ActivityContext,
    cancellation: CancellationToken,
    delegations: AtomicU32,
    max_fan_out: u32,
}

impl StepContext<'_> {
    pub fn activities(&self) -> &ActivityContext {
        self.activities
    }

    pub fn is_replay(&self) -> bool {
        self.activities.mode() == ActivityMode::Replay
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Count one delegation against the fan-out limit.
    pub fn reserve_delegation(&self) -> Result<u32, ExecutionError> {
        let used = self.delegations.fetch_add(1, Ordering::SeqCst) + 1;
        if used > self.max_fan_out {
            return Err(ExecutionError::FanOutExceeded {
                trace_id: self.trace_id,
                step_index: self.step_index,
                max: self.max_fan_out,
            });
        }
        Ok(used)
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome>;
}

/// Named handlers plus the entry node.
#[derive(Clone)]
pub struct StepGraph {
    entry: NodeId,
    nodes: HashMap<NodeId, Arc<dyn StepHandler>>,
}

impl StepGraph {
    pub fn new(entry: impl Into<NodeId>) -> Self {
        Self {
            entry: entry.into(),
            nodes: HashMap::new(),
        }
    }

    pub fn node(mut self, id: impl Into<NodeId>, handler: Arc<dyn StepHandler>) -> Self {
        self.nodes.insert(id.into(), handler);
        self
    }

    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    fn handler(&self, trace_id: TraceId, node_id: &NodeId) -> Result<Arc<dyn StepHandler>, ExecutionError> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownNode {
                trace_id,
                node_id: node_id.clone(),
            })
    }
}

/// Masks the values of sensitive object keys (case-insensitive) before they reach a span.
#[derive(Debug, Clone, Default)]
pub struct RedactionPolicy {
    keys: HashSet<String>,
}

impl RedactionPolicy {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: keys.into_iter().map(|k| k.as_ref().to_ascii_lowercase()).collect(),
        }
    }

    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        if self.keys.contains(&k.to_ascii_lowercase()) {
                            (k.clone(), Value::String(REDACTED.to_string()))
                        } else {
                            (k.clone(), self.redact(v))
                        }
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub max_depth: u32,
    pub max_fan_out: u32,
    pub max_steps: u32,
    pub activity_mode: ActivityMode,
    pub redaction: RedactionPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

impl ExecutorConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            retry: runtime.retry.clone(),
            step_timeout: runtime.step_timeout,
            max_depth: runtime.max_depth,
            max_fan_out: runtime.max_fan_out,
            max_steps: runtime.max_steps,
            activity_mode: ActivityMode::Record,
            redaction: RedactionPolicy::new(&runtime.redaction_keys),
        }
    }
}

enum AttemptResult {
    Completed(StepOutcome, Vec<RecordedActivity>),
    Failed(String, bool),
    TimedOut,
    Cancelled,
}

enum StepResult {
    Completed(ExecutionStep),
    Failed(StepFailureReport),
    Cancelled(String),
}

type RunningTraces = DashMap<TraceId, (CancellationToken, Arc<parking_lot::Mutex<Option<String>>>)>;

/// Registration of an active run; removed when the run ends or its future is dropped.
struct RunningGuard<'a> {
    running: &'a RunningTraces,
    trace_id: TraceId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.trace_id);
    }
}

pub struct RuntimeExecutor {
    graph: Arc<StepGraph>,
    checkpoints: Arc<dyn CheckpointRepository>,
    events: EventBus,
    config: ExecutorConfig,
    running: RunningTraces,
}

impl RuntimeExecutor {
    pub fn new(
        graph: StepGraph,
        checkpoints: Arc<dyn CheckpointRepository>,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpoints,
            events,
            config,
            running: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Request cancellation of a running trace. Returns `false` if it is not running here.
    pub fn cancel(&self, trace_id: TraceId, reason: impl Into<String>) -> bool {
        match self.running.get(&trace_id) {
            Some(entry) => {
                let (token, slot) = entry.value();
                *slot.lock() = Some(reason.into());
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, trace_id: TraceId) -> bool {
        self.running.contains_key(&trace_id)
    }

    /// Run (or resume) a trace.
    ///
    /// Step failures and cancellation are reported in the returned
    /// [`TraceReport`]; `Err` is reserved for structural problems such as an
    /// unknown node, an exceeded depth limit, a second concurrent run of the
    /// same trace or a store failure.
    pub async fn run(&self, trace_id: TraceId, input: Value, depth: u32) -> Result<TraceReport, ExecutionError> {
        if depth > self.config.max_depth {
            return Err(ExecutionError::DepthExceeded {
                trace_id,
                depth,
                max: self.config.max_depth,
            });
        }

        let token = CancellationToken::new();
        let reason_slot = Arc::new(parking_lot::Mutex::new(None));
        let _registration = self.register_run(trace_id, &token, &reason_slot)?;

        let mut steps = self.checkpoints.load_trace(trace_id).await?;
        ensure_contiguous(trace_id, &steps)?;

        let (mut node_id, mut input, mut step_index) = match steps.last() {
            None => (self.graph.entry().clone(), input, 0),
            Some(last) => match &last.next_node {
                None => {
                    info!(trace_id = %trace_id, steps = steps.len(), "Trace already completed");
                    let output = Some(last.output.clone());
                    return Ok(self.report(trace_id, TraceStatus::Completed, steps, None, output));
                }
                Some(next) => (next.clone(), last.output.clone(), last.step_index + 1),
            },
        };
        let resumed_from = steps.last().map(|s| s.step_index);

        info!(trace_id = %trace_id, ?resumed_from, depth, "Trace started");
        self.events.publish_trace_event(TraceEvent::TraceStarted {
            trace_id,
            resumed_from,
            depth,
            started_at: Utc::now(),
        });

        let outcome = loop {
            if step_index >= self.config.max_steps {
                break Err(ExecutionError::StepLimitExceeded {
                    trace_id,
                    max_steps: self.config.max_steps,
                });
            }
            let handler = match self.graph.handler(trace_id, &node_id) {
                Ok(handler) => handler,
                Err(e) => break Err(e),
            };

            let result = self
                .execute_step(trace_id, step_index, &node_id, depth, &input, handler, &token, &reason_slot)
                .await;
            match result {
                Err(e) => break Err(e),
                Ok(StepResult::Cancelled(reason)) => {
                    self.events.publish_trace_event(TraceEvent::TraceCancelled {
                        trace_id,
                        step_index,
                        reason,
                        cancelled_at: Utc::now(),
                    });
                    break Ok(self.report(trace_id, TraceStatus::Cancelled, steps, None, None));
                }
                Ok(StepResult::Failed(failure)) => {
                    let last_checkpoint = steps.last().map(|s| s.step_index);
                    error!(
                        trace_id = %trace_id,
                        step_index,
                        node_id = %failure.node_id,
                        attempts = failure.attempts,
                        "Trace failed: {}",
                        failure.error
                    );
                    self.events.publish_trace_event(TraceEvent::TraceFailed {
                        trace_id,
                        step_index,
                        last_checkpoint,
                        error: failure.error.clone(),
                        failed_at: Utc::now(),
                    });
                    break Ok(self.report(trace_id, TraceStatus::Failed, steps, Some(failure), None));
                }
                Ok(StepResult::Completed(step)) => {
                    let next = step.next_node.clone();
                    let output = step.output.clone();
                    steps.push(step);
                    match next {
                        None => {
                            info!(trace_id = %trace_id, total_steps = steps.len(), "Trace completed");
                            self.events.publish_trace_event(TraceEvent::TraceCompleted {
                                trace_id,
                                total_steps: steps.len() as u32,
                                completed_at: Utc::now(),
                            });
                            break Ok(self.report(trace_id, TraceStatus::Completed, steps, None, Some(output)));
                        }
                        Some(next) => {
                            node_id = next;
                            input = output;
                            step_index += 1;
                        }
                    }
                }
            }
        };

        outcome
    }

    fn register_run(
        &self,
        trace_id: TraceId,
        token: &CancellationToken,
        reason_slot: &Arc<parking_lot::Mutex<Option<String>>>,
    ) -> Result<RunningGuard<'_>, ExecutionError> {
        match self.running.entry(trace_id) {
            Entry::Occupied(_) => {
                warn!(trace_id = %trace_id, "Rejected concurrent run of a trace already running");
                Err(ExecutionError::AlreadyRunning { trace_id })
            }
            Entry::Vacant(slot) => {
                slot.insert((token.clone(), Arc::clone(reason_slot)));
                Ok(RunningGuard {
                    running: &self.running,
                    trace_id,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        trace_id: TraceId,
        step_index: u32,
        node_id: &NodeId,
        depth: u32,
        input: &Value,
        handler: Arc<dyn StepHandler>,
        token: &CancellationToken,
        reason_slot: &parking_lot::Mutex<Option<String>>,
    ) -> Result<StepResult, ExecutionError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let input_hash = hash_value(input);
        let mut status = StepStatus::Pending;

        for attempt in 1..=max_attempts {
            status = status.transition(StepStatus::Running)?;
            let started = Instant::now();
            let result = self
                .attempt(trace_id, step_index, node_id, attempt, depth, input, handler.as_ref(), token)
                .await;
            metrics::histogram!("relay_step_duration_seconds").record(started.elapsed().as_secs_f64());

            let (failed_status, error, retriable) = match result {
                AttemptResult::Completed(outcome, activities) => {
                    status = status.transition(StepStatus::Completed)?;
                    metrics::counter!("relay_steps_total", "status" => status.as_str()).increment(1);
                    let step = ExecutionStep {
                        trace_id,
                        step_index,
                        node_id: node_id.clone(),
                        input_hash,
                        output: outcome.output,
                        next_node: outcome.next,
                        activities,
                        status,
                        attempts: attempt,
                        timestamp: Utc::now(),
                    };
                    let stored = match self.checkpoints.save_step(&step).await? {
                        SaveOutcome::Inserted => step,
                        SaveOutcome::AlreadyExists(existing) => {
                            warn!(trace_id = %trace_id, step_index, "Checkpoint already present, keeping stored result");
                            existing
                        }
                    };
                    self.events.publish_trace_event(TraceEvent::StepCompleted {
                        trace_id,
                        step_index,
                        node_id: node_id.clone(),
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                        completed_at: Utc::now(),
                    });
                    return Ok(StepResult::Completed(stored));
                }
                AttemptResult::Cancelled => {
                    status.transition(StepStatus::Cancelled)?;
                    metrics::counter!("relay_steps_total", "status" => StepStatus::Cancelled.as_str()).increment(1);
                    let reason = reason_slot.lock().clone().unwrap_or_else(|| "cancelled".to_string());
                    info!(trace_id = %trace_id, step_index, reason = %reason, "Step cancelled");
                    return Ok(StepResult::Cancelled(reason));
                }
                AttemptResult::TimedOut => (
                    StepStatus::TimedOut,
                    format!("step exceeded {:?}", self.config.step_timeout),
                    true,
                ),
                AttemptResult::Failed(error, retriable) => (StepStatus::Failed, error, retriable),
            };

            status = status.transition(failed_status)?;
            metrics::counter!("relay_steps_total", "status" => status.as_str()).increment(1);

            if !retriable || attempt == max_attempts {
                return Ok(StepResult::Failed(StepFailureReport {
                    step_index,
                    node_id: node_id.clone(),
                    status,
                    attempts: attempt,
                    error,
                }));
            }

            let backoff = self.config.retry.backoff_for(attempt);
            warn!(
                trace_id = %trace_id,
                step_index,
                node_id = %node_id,
                attempt,
                status = %status,
                backoff_ms = backoff.as_millis() as u64,
                "Step attempt failed, retrying: {}",
                error
            );
            self.events.publish_trace_event(TraceEvent::StepRetried {
                trace_id,
                step_index,
                node_id: node_id.clone(),
                attempt,
                status,
                error,
                retried_at: Utc::now(),
            });
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = token.cancelled() => {
                    status.transition(StepStatus::Cancelled)?;
                    let reason = reason_slot.lock().clone().unwrap_or_else(|| "cancelled".to_string());
                    return Ok(StepResult::Cancelled(reason));
                }
            }
            status = status.transition(StepStatus::Pending)?;
        }

        // max_attempts >= 1 so the loop always returns
        Err(ExecutionError::StepLimitExceeded {
            trace_id,
            max_steps: self.config.max_steps,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        trace_id: TraceId,
        step_index: u32,
        node_id: &NodeId,
        attempt: u32,
        depth: u32,
        input: &Value,
        handler: &dyn StepHandler,
        token: &CancellationToken,
    ) -> AttemptResult {
        let activities = ActivityContext::new(trace_id, step_index, self.config.activity_mode);
        let ctx = StepContext {
            trace_id,
            step_index,
            node_id,
            attempt,
            depth,
            activities: &activities,
            cancellation: token.child_token(),
            delegations: AtomicU32::new(0),
            max_fan_out: self.config.max_fan_out,
        };
        let span = tracing::info_span!(
            "step",
            trace_id = %trace_id,
            step_index,
            node_id = %node_id,
            attempt,
            input = %self.config.redaction.redact(input),
            output = tracing::field::Empty,
        );

        let run = tokio::time::timeout(self.config.step_timeout, handler.execute(&ctx, input.clone()))
            .instrument(span.clone());
        tokio::select! {
            result = run => match result {
                Ok(Ok(outcome)) => {
                    span.record("output", tracing::field::display(self.config.redaction.redact(&outcome.output)));
                    AttemptResult::Completed(outcome, activities.journal())
                }
                Ok(Err(e)) => {
                    let retriable = !e.chain().any(|cause| cause.is::<ExecutionError>());
                    AttemptResult::Failed(format!("{:#}", e), retriable)
                }
                Err(_) => AttemptResult::TimedOut,
            },
            _ = token.cancelled() => AttemptResult::Cancelled,
        }
    }

    /// Re-run the stored path of a trace against its recorded activities only.
    ///
    /// `input` must be the input the trace originally started with; every
    /// replayed step output has to match its checkpoint byte for byte.
    pub async fn replay(&self, trace_id: TraceId, input: Value) -> Result<TraceReport, ExecutionError> {
        let stored = self.checkpoints.load_trace(trace_id).await?;
        if stored.is_empty() {
            return Err(ExecutionError::MissingCheckpoint { trace_id, step_index: 0 });
        }
        ensure_contiguous(trace_id, &stored)?;

        let mut node_id = self.graph.entry().clone();
        let mut input = input;
        let mut replayed = Vec::with_capacity(stored.len());

        for checkpoint in &stored {
            let step_index = checkpoint.step_index;
            if checkpoint.node_id != node_id {
                return Err(ExecutionError::ReplayDivergence {
                    trace_id,
                    step_index,
                    expected: checkpoint.node_id.to_string(),
                    actual: node_id.to_string(),
                });
            }
            let input_hash = hash_value(&input);
            if input_hash != checkpoint.input_hash {
                return Err(ExecutionError::ReplayDivergence {
                    trace_id,
                    step_index,
                    expected: checkpoint.input_hash.clone(),
                    actual: input_hash,
                });
            }

            let handler = self.graph.handler(trace_id, &node_id)?;
            let activities = ActivityContext::replay(trace_id, step_index, checkpoint.activities.clone());
            let ctx = StepContext {
                trace_id,
                step_index,
                node_id: &node_id,
                attempt: checkpoint.attempts,
                depth: 0,
                activities: &activities,
                cancellation: CancellationToken::new(),
                delegations: AtomicU32::new(0),
                max_fan_out: self.config.max_fan_out,
            };
            let span = tracing::info_span!("replay_step", trace_id = %trace_id, step_index, node_id = %node_id);
            let outcome = match tokio::time::timeout(self.config.step_timeout, handler.execute(&ctx, input.clone()))
                .instrument(span)
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    if let Some(activity) = e.chain().find_map(|cause| cause.downcast_ref::<ActivityError>()) {
                        return Err(ExecutionError::Activity(activity.clone()));
                    }
                    return Err(ExecutionError::ReplayFailed {
                        trace_id,
                        step_index,
                        message: format!("{:#}", e),
                    });
                }
                Err(_) => {
                    return Err(ExecutionError::ReplayFailed {
                        trace_id,
                        step_index,
                        message: format!("step exceeded {:?}", self.config.step_timeout),
                    })
                }
            };

            let expected = serde_json::to_vec(&checkpoint.output).unwrap_or_default();
            let actual = serde_json::to_vec(&outcome.output).unwrap_or_default();
            if expected != actual {
                return Err(ExecutionError::ReplayDivergence {
                    trace_id,
                    step_index,
                    expected: checkpoint.output_hash(),
                    actual: hash_value(&outcome.output),
                });
            }
            if outcome.next != checkpoint.next_node {
                return Err(ExecutionError::ReplayDivergence {
                    trace_id,
                    step_index,
                    expected: format!("{:?}", checkpoint.next_node),
                    actual: format!("{:?}", outcome.next),
                });
            }

            replayed.push(ExecutionStep {
                output: outcome.output,
                ..checkpoint.clone()
            });
            match outcome.next {
                Some(next) => {
                    input = checkpoint.output.clone();
                    node_id = next;
                }
                None => break,
            }
        }

        let finished = replayed.last().is_some_and(ExecutionStep::is_terminal_node);
        let output = replayed.last().filter(|s| s.is_terminal_node()).map(|s| s.output.clone());
        let status = if finished { TraceStatus::Completed } else { TraceStatus::Running };
        info!(trace_id = %trace_id, steps = replayed.len(), "Trace replayed");
        Ok(self.report(trace_id, status, replayed, None, output))
    }

    fn report(
        &self,
        trace_id: TraceId,
        status: TraceStatus,
        steps: Vec<ExecutionStep>,
        failure: Option<StepFailureReport>,
        output: Option<Value>,
    ) -> TraceReport {
        TraceReport {
            trace_id,
            status,
            last_checkpoint: steps.last().map(|s| s.step_index),
            steps,
            failure,
            output,
            finished_at: Utc::now(),
        }
    }
}

fn ensure_contiguous(trace_id: TraceId, steps: &[ExecutionStep]) -> Result<(), ExecutionError> {
    for (expected, step) in steps.iter().enumerate() {
        if step.step_index != expected as u32 {
            return Err(ExecutionError::MissingCheckpoint {
                trace_id,
                step_index: expected as u32,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryCheckpointRepository;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Fetch;

    #[async_trait]
    impl StepHandler for Fetch {
        async fn execute(&self, ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
            let n = ctx.activities().random_u64().await?;
            Ok(StepOutcome::next(json!({"seed": n % 1000, "input": input}), "finish"))
        }
    }

    struct Finish;

    #[async_trait]
    impl StepHandler for Finish {
        async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::finish(json!({"done": input["seed"]})))
        }
    }

    struct Flaky {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl StepHandler for Flaky {
        async fn execute(&self, _ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("upstream 503");
            }
            Ok(StepOutcome::finish(input))
        }
    }

    struct Slow;

    #[async_trait]
    impl StepHandler for Slow {
        async fn execute(&self, _ctx: &StepContext<'_>, _input: Value) -> anyhow::Result<StepOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StepOutcome::finish(Value::Null))
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
            step_timeout: Duration::from_millis(100),
            ..ExecutorConfig::default()
        }
    }

    fn executor(graph: StepGraph) -> (RuntimeExecutor, Arc<InMemoryCheckpointRepository>) {
        let repo = Arc::new(InMemoryCheckpointRepository::new());
        let executor = RuntimeExecutor::new(graph, repo.clone(), EventBus::with_default_capacity(), fast_config());
        (executor, repo)
    }

    #[tokio::test]
    async fn test_run_checkpoints_every_step_with_activities() {
        let graph = StepGraph::new("fetch")
            .node("fetch", Arc::new(Fetch))
            .node("finish", Arc::new(Finish));
        let (executor, repo) = executor(graph);
        let trace_id = TraceId::new();
        let report = executor.run(trace_id, json!({"ticket": 7}), 0).await.unwrap();

        assert_eq!(report.status, TraceStatus::Completed);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.last_checkpoint, Some(1));
        assert_eq!(report.steps[0].activities.len(), 1);
        assert_eq!(repo.step_count(), 2);
        assert!(!executor.is_running(trace_id));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let graph = StepGraph::new("flaky").node(
            "flaky",
            Arc::new(Flaky {
                failures_left: AtomicUsize::new(2),
            }),
        );
        let (executor, _) = executor(graph);
        let report = executor.run(TraceId::new(), json!(1), 0).await.unwrap();
        assert_eq!(report.status, TraceStatus::Completed);
        assert_eq!(report.steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_checkpoint() {
        let graph = StepGraph::new("fetch")
            .node("fetch", Arc::new(Fetch))
            .node(
                "finish",
                Arc::new(Flaky {
                    failures_left: AtomicUsize::new(10),
                }),
            );
        let (executor, _) = executor(graph);
        let report = executor.run(TraceId::new(), json!({}), 0).await.unwrap();
        assert_eq!(report.status, TraceStatus::Failed);
        assert_eq!(report.last_checkpoint, Some(0));
        assert_eq!(report.resume_from(), 1);
        let failure = report.failure.unwrap();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.status, StepStatus::Failed);
        assert!(failure.error.contains("upstream 503"));
    }

    #[tokio::test]
    async fn test_step_timeout_forces_timed_out() {
        let graph = StepGraph::new("slow").node("slow", Arc::new(Slow));
        let (executor, _) = executor(graph);
        let started = Instant::now();
        let report = executor.run(TraceId::new(), Value::Null, 0).await.unwrap();
        assert_eq!(report.status, TraceStatus::Failed);
        assert_eq!(report.failure.unwrap().status, StepStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_is_a_terminal_outcome() {
        let graph = StepGraph::new("slow").node("slow", Arc::new(Slow));
        let repo = Arc::new(InMemoryCheckpointRepository::new());
        let executor = Arc::new(RuntimeExecutor::new(
            graph,
            repo,
            EventBus::with_default_capacity(),
            ExecutorConfig {
                step_timeout: Duration::from_secs(30),
                ..fast_config()
            },
        ));
        let trace_id = TraceId::new();
        let runner = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(trace_id, Value::Null, 0).await })
        };
        while !executor.is_running(trace_id) {
            tokio::task::yield_now().await;
        }
        assert!(executor.cancel(trace_id, "operator abort"));
        let report = runner.await.unwrap().unwrap();
        assert_eq!(report.status, TraceStatus::Cancelled);
        assert!(!executor.cancel(trace_id, "again"));
    }

    fn slow_executor() -> Arc<RuntimeExecutor> {
        let graph = StepGraph::new("slow").node("slow", Arc::new(Slow));
        Arc::new(RuntimeExecutor::new(
            graph,
            Arc::new(InMemoryCheckpointRepository::new()),
            EventBus::with_default_capacity(),
            ExecutorConfig {
                step_timeout: Duration::from_secs(30),
                ..fast_config()
            },
        ))
    }

    #[tokio::test]
    async fn test_concurrent_run_of_same_trace_is_rejected() {
        let executor = slow_executor();
        let trace_id = TraceId::new();
        let first = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(trace_id, Value::Null, 0).await })
        };
        while !executor.is_running(trace_id) {
            tokio::task::yield_now().await;
        }

        let err = executor.run(trace_id, Value::Null, 0).await.unwrap_err();
        assert_eq!(err.code(), "E_TRACE_RUNNING");

        // The rejected run must not have displaced the first run's registration.
        assert!(executor.is_running(trace_id));
        assert!(executor.cancel(trace_id, "operator abort"));
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.status, TraceStatus::Cancelled);
        assert!(!executor.is_running(trace_id));
    }

    #[tokio::test]
    async fn test_dropped_run_releases_trace() {
        let executor = slow_executor();
        let trace_id = TraceId::new();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), executor.run(trace_id, Value::Null, 0)).await;
        assert!(abandoned.is_err());
        assert!(!executor.is_running(trace_id));
        assert!(!executor.cancel(trace_id, "nothing to cancel"));

        // The trace can be started again afterwards.
        let rerun = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run(trace_id, Value::Null, 0).await })
        };
        while !executor.is_running(trace_id) {
            tokio::task::yield_now().await;
        }
        assert!(executor.cancel(trace_id, "done"));
        assert_eq!(rerun.await.unwrap().unwrap().status, TraceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_depth_limit_and_unknown_node() {
        let (executor, _) = executor(StepGraph::new("missing"));
        let err = executor.run(TraceId::new(), Value::Null, 99).await.unwrap_err();
        assert_eq!(err.code(), "E_DEPTH_EXCEEDED");
        let err = executor.run(TraceId::new(), Value::Null, 0).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownNode { .. }));
    }

    #[test]
    fn test_redaction_masks_nested_keys() {
        let policy = RedactionPolicy::new(["password", "Authorization"]);
        let redacted = policy.redact(&json!({
            "user": "a",
            "PASSWORD": "x",
            "headers": [{"authorization": "Bearer t"}]
        }));
        assert_eq!(
            redacted,
            json!({"user": "a", "PASSWORD": REDACTED, "headers": [{"authorization": REDACTED}]})
        );
    }
}
