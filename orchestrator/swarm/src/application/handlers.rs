// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Stock [`InboundHandler`]s wiring inbound envelopes to core services.
//!
//! | Handler | Envelope | Effect |
//! |---------|----------|--------|
//! | [`TaskRunHandler`] | `TaskRequest` | runs the local step graph, replies `TaskResult` |
//! | [`InvocationRunHandler`] | `SpecialistInvocationRequest` | runs the local step graph on `task`, replies `SpecialistResult` |
//! | [`CancelDirectiveHandler`] | `CancelDirective` | cancels the matching local trace |
//! | [`ContextRequestHandler`] | `ContextRequest` | queries the context service, replies `ContextResult` |
//!
//! A delegated task runs under a child trace id derived from the caller's
//! trace and the request's message id, so caller and callee never share
//! checkpoint keys and a redelivered request resumes the same child trace.
//! A `CancelDirective` naming the request in `target_correlation_id` maps to
//! that same child trace.
//!
//! A directive travels on the request's partition, behind the request itself.
//! A node that must honour cancellation while a delegated trace is running
//! hands directives to the dispatcher outside the loop serving requests.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use aegis_relay_core::application::executor::RuntimeExecutor;
use aegis_relay_core::domain::envelope::{
    Envelope, Payload, SpecialistResult, SpecialistStatus, TaskResult, TaskStatus,
};
use aegis_relay_core::domain::execution::{TraceId, TraceReport, TraceStatus};
use aegis_relay_core::infrastructure::ContextClient;

use crate::application::dispatcher::InboundHandler;

/// Trace id a delegated request runs under on the receiving node.
pub fn child_trace_id(parent: TraceId, request_message_id: &str) -> TraceId {
    TraceId(Uuid::new_v5(&parent.0, request_message_id.as_bytes()))
}

pub struct TaskRunHandler {
    executor: Arc<RuntimeExecutor>,
}

impl TaskRunHandler {
    pub fn new(executor: Arc<RuntimeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl InboundHandler for TaskRunHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Payload>> {
        let Payload::TaskRequest(request) = &envelope.payload else {
            bail!("TaskRunHandler received {}", envelope.envelope_type());
        };
        let trace_id = child_trace_id(envelope.meta.trace_id, &envelope.meta.message_id);
        info!(
            parent_trace_id = %envelope.meta.trace_id,
            trace_id = %trace_id,
            task_id = %request.task_id,
            "Running delegated task"
        );

        let report = self
            .executor
            .run(trace_id, request.inputs.clone(), envelope.meta.depth)
            .await?;
        let (status, error) = match report.status {
            TraceStatus::Completed => (TaskStatus::Succeeded, None),
            TraceStatus::Cancelled => (TaskStatus::Cancelled, None),
            TraceStatus::Failed | TraceStatus::Running => (TaskStatus::Failed, Some(failure_message(&report))),
        };
        Ok(Some(Payload::TaskResult(TaskResult {
            task_id: request.task_id.clone(),
            status,
            output: report.output.unwrap_or_default(),
            error,
        })))
    }
}

pub struct InvocationRunHandler {
    executor: Arc<RuntimeExecutor>,
}

impl InvocationRunHandler {
    pub fn new(executor: Arc<RuntimeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl InboundHandler for InvocationRunHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Payload>> {
        let Payload::SpecialistInvocationRequest(request) = &envelope.payload else {
            bail!("InvocationRunHandler received {}", envelope.envelope_type());
        };
        let trace_id = child_trace_id(envelope.meta.trace_id, &envelope.meta.message_id);
        info!(
            parent_trace_id = %envelope.meta.trace_id,
            trace_id = %trace_id,
            capability = %request.capability,
            "Running specialist invocation"
        );

        let report = self
            .executor
            .run(trace_id, request.task.clone(), envelope.meta.depth)
            .await?;
        let result = match report.status {
            TraceStatus::Completed => SpecialistResult::success(report.output.unwrap_or_default(), None),
            TraceStatus::Cancelled => {
                SpecialistResult::unsuccessful(SpecialistStatus::Cancelled, "delegated trace cancelled")
            }
            TraceStatus::Failed | TraceStatus::Running => {
                SpecialistResult::unsuccessful(SpecialistStatus::Failure, failure_message(&report))
            }
        };
        Ok(Some(Payload::SpecialistResult(result)))
    }
}

fn failure_message(report: &TraceReport) -> String {
    match &report.failure {
        Some(f) => format!("step {} ({}): {}", f.step_index, f.node_id, f.error),
        None => format!("trace {} stopped before completing", report.trace_id),
    }
}

pub struct CancelDirectiveHandler {
    executor: Arc<RuntimeExecutor>,
}

impl CancelDirectiveHandler {
    pub fn new(executor: Arc<RuntimeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl InboundHandler for CancelDirectiveHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Payload>> {
        let Payload::CancelDirective(directive) = &envelope.payload else {
            bail!("CancelDirectiveHandler received {}", envelope.envelope_type());
        };
        let trace_id = match &directive.target_correlation_id {
            Some(request_id) => child_trace_id(envelope.meta.trace_id, request_id),
            None => envelope.meta.trace_id,
        };
        let cancelled = self.executor.cancel(trace_id, directive.reason.clone());
        info!(
            trace_id = %trace_id,
            cancelled,
            reason = %directive.reason,
            "Cancel directive received"
        );
        Ok(None)
    }
}

pub struct ContextRequestHandler {
    client: ContextClient,
}

impl ContextRequestHandler {
    pub fn new(client: ContextClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl InboundHandler for ContextRequestHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Payload>> {
        let Payload::ContextRequest(request) = &envelope.payload else {
            bail!("ContextRequestHandler received {}", envelope.envelope_type());
        };
        let result = self.client.retrieve(request).await?;
        Ok(Some(Payload::ContextResult(result)))
    }
}
