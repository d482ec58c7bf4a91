//! Integration tests for deterministic replay
//!
//! Runs a three-step graph whose steps read the clock, draw random numbers
//! and call a (mock) network service through the activity boundary, then
//! replays the stored trace against its recorded activities.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aegis_relay_core::application::executor::{
    ExecutorConfig, RuntimeExecutor, StepContext, StepGraph, StepHandler, StepOutcome,
};
use aegis_relay_core::domain::checkpoint::{ExecutionStep, NodeId, SaveOutcome};
use aegis_relay_core::domain::execution::{ExecutionError, StepStatus, TraceId, TraceStatus};
use aegis_relay_core::domain::repository::CheckpointRepository;
use aegis_relay_core::infrastructure::event_bus::EventBus;
use aegis_relay_core::infrastructure::repositories::InMemoryCheckpointRepository;
use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};

/// Stand-in for a selector-healing service; counts real calls.
#[derive(Default)]
struct QuoteService {
    calls: AtomicUsize,
}

impl QuoteService {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Plan;

#[async_trait]
impl StepHandler for Plan {
    async fn execute(&self, ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
        let started = ctx.activities().now().await?;
        let seed = ctx.activities().random_u64().await?;
        Ok(StepOutcome::next(
            json!({"ticket": input["ticket"], "seed": seed, "started": started.to_rfc3339()}),
            "heal",
        ))
    }
}

struct Heal {
    service: Arc<QuoteService>,
}

#[async_trait]
impl StepHandler for Heal {
    async fn execute(&self, ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
        let service = self.service.clone();
        let request = json!({"url": "http://healer.local/selector", "ticket": input["ticket"]});
        let response = ctx
            .activities()
            .network(request, |req| async move {
                let n = service.calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"selector": format!("#buy-{}", n), "echo": req["ticket"]}))
            })
            .await?;
        Ok(StepOutcome::next(json!({"plan": input, "healed": response}), "finish"))
    }
}

struct Finish;

#[async_trait]
impl StepHandler for Finish {
    async fn execute(&self, ctx: &StepContext<'_>, input: Value) -> anyhow::Result<StepOutcome> {
        let finished = ctx.activities().now().await?;
        Ok(StepOutcome::finish(json!({
            "selector": input["healed"]["selector"],
            "finished": finished.to_rfc3339(),
        })))
    }
}

fn graph(service: Arc<QuoteService>) -> StepGraph {
    StepGraph::new("plan")
        .node("plan", Arc::new(Plan))
        .node("heal", Arc::new(Heal { service }))
        .node("finish", Arc::new(Finish))
}

fn executor(repo: Arc<InMemoryCheckpointRepository>, service: Arc<QuoteService>) -> RuntimeExecutor {
    RuntimeExecutor::new(graph(service), repo, EventBus::with_default_capacity(), ExecutorConfig::default())
}

fn output_bytes(steps: &[ExecutionStep]) -> Vec<Vec<u8>> {
    steps.iter().map(|s| serde_json::to_vec(&s.output).unwrap()).collect()
}

#[tokio::test]
async fn test_replay_reproduces_outputs_without_touching_the_service() {
    let repo = Arc::new(InMemoryCheckpointRepository::new());
    let service = Arc::new(QuoteService::default());
    let executor = executor(repo.clone(), service.clone());
    let trace_id = TraceId::new();
    let input = json!({"ticket": 42});

    let original = executor.run(trace_id, input.clone(), 0).await.unwrap();
    assert_eq!(original.status, TraceStatus::Completed);
    assert_eq!(original.steps.len(), 3);
    assert_eq!(service.calls(), 1);

    let replayed = executor.replay(trace_id, input).await.unwrap();
    assert_eq!(replayed.status, TraceStatus::Completed);
    assert_eq!(output_bytes(&replayed.steps), output_bytes(&original.steps));
    assert_eq!(replayed.output, original.output);
    assert_eq!(service.calls(), 1, "replay must not reach the real service");
}

#[tokio::test]
async fn test_replay_with_a_different_input_diverges() {
    let repo = Arc::new(InMemoryCheckpointRepository::new());
    let executor = executor(repo, Arc::new(QuoteService::default()));
    let trace_id = TraceId::new();
    executor.run(trace_id, json!({"ticket": 1}), 0).await.unwrap();

    let err = executor.replay(trace_id, json!({"ticket": 2})).await.unwrap_err();
    assert_eq!(err.code(), "E_REPLAY_DIVERGENCE");
}

#[tokio::test]
async fn test_replay_gap_fails_fast() {
    let original_repo = Arc::new(InMemoryCheckpointRepository::new());
    let service = Arc::new(QuoteService::default());
    let trace_id = TraceId::new();
    let input = json!({"ticket": 7});
    executor(original_repo.clone(), service.clone())
        .run(trace_id, input.clone(), 0)
        .await
        .unwrap();

    // Copy the trace, dropping the network recording of the "heal" step.
    let damaged = Arc::new(InMemoryCheckpointRepository::new());
    for mut step in original_repo.load_trace(trace_id).await.unwrap() {
        if step.node_id == NodeId::new("heal") {
            step.activities.clear();
        }
        damaged.save_step(&step).await.unwrap();
    }

    let err = executor(damaged, service.clone())
        .replay(trace_id, input)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Activity(_)), "{err:?}");
    assert_eq!(err.code(), "E_REPLAY_GAP");
    assert_eq!(service.calls(), 1, "a replay gap must not fall back to live execution");
}

#[tokio::test]
async fn test_save_step_twice_keeps_one_row() {
    let repo = InMemoryCheckpointRepository::new();
    let step = ExecutionStep {
        trace_id: TraceId::new(),
        step_index: 0,
        node_id: NodeId::new("plan"),
        input_hash: "ab".into(),
        output: json!({"seed": 1}),
        next_node: Some(NodeId::new("heal")),
        activities: vec![],
        status: StepStatus::Completed,
        attempts: 1,
        timestamp: Utc::now(),
    };

    assert_eq!(repo.save_step(&step).await.unwrap(), SaveOutcome::Inserted);
    assert_eq!(
        repo.save_step(&step).await.unwrap(),
        SaveOutcome::AlreadyExists(step.clone())
    );
    assert_eq!(repo.step_count(), 1);

    // A conflicting write for the same key keeps the first result.
    let conflicting = ExecutionStep {
        output: json!({"seed": 2}),
        ..step.clone()
    };
    assert_eq!(
        repo.save_step(&conflicting).await.unwrap(),
        SaveOutcome::AlreadyExists(step.clone())
    );
    assert_eq!(repo.load_trace(step.trace_id).await.unwrap(), vec![step]);
}

#[tokio::test]
async fn test_rerunning_a_completed_trace_writes_nothing() {
    let repo = Arc::new(InMemoryCheckpointRepository::new());
    let service = Arc::new(QuoteService::default());
    let executor = executor(repo.clone(), service.clone());
    let trace_id = TraceId::new();

    let first = executor.run(trace_id, json!({"ticket": 3}), 0).await.unwrap();
    let second = executor.run(trace_id, json!({"ticket": 3}), 0).await.unwrap();

    assert_eq!(second.status, TraceStatus::Completed);
    assert_eq!(second.output, first.output);
    assert_eq!(repo.step_count(), 3);
    assert_eq!(service.calls(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_replay_is_byte_identical(ticket in any::<u32>(), label in "[a-z]{1,12}") {
        tokio_test::block_on(async {
            let repo = Arc::new(InMemoryCheckpointRepository::new());
            let service = Arc::new(QuoteService::default());
            let executor = executor(repo, service.clone());
            let trace_id = TraceId::new();
            let input = json!({"ticket": ticket, "label": label});

            let original = executor.run(trace_id, input.clone(), 0).await.unwrap();
            let replayed = executor.replay(trace_id, input).await.unwrap();

            assert_eq!(output_bytes(&replayed.steps), output_bytes(&original.steps));
            assert_eq!(service.calls(), 1);
        });
    }
}
