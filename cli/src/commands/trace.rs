// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Trace inspection commands
//!
//! Commands: list, show, resume-point
//!
//! Reads checkpoints only; nothing here executes a step graph. The resume
//! point is where `RuntimeExecutor::run` would pick the trace back up.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;

use aegis_relay_core::domain::checkpoint::{ExecutionStep, NodeId, TraceSummary};
use aegis_relay_core::domain::execution::{StepStatus, TraceId};
use aegis_relay_core::domain::node_config::NodeConfigManifest;
use aegis_relay_core::domain::repository::CheckpointRepository;

use crate::stores::Stores;

#[derive(Subcommand)]
pub enum TraceCommand {
    /// List recent traces
    List {
        /// Maximum number of traces to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the checkpoints of a trace
    Show {
        #[arg(value_name = "TRACE_ID")]
        trace_id: TraceId,

        /// Print checkpoints (with recorded activities) as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show where a failed or interrupted trace would resume
    ResumePoint {
        #[arg(value_name = "TRACE_ID")]
        trace_id: TraceId,

        #[arg(long)]
        json: bool,
    },
}

/// Where execution of a stored trace continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResumePoint {
    /// No checkpoints: a run starts at the entry node with fresh input.
    NotStarted,
    /// Continue at `step_index` on `node_id`, fed the previous step's output.
    Resume { step_index: u32, node_id: NodeId },
    /// The last checkpoint is terminal.
    Completed { steps: u32 },
    /// Checkpoints are not contiguous; the executor refuses to resume.
    Gap { missing_step: u32 },
}

pub fn resume_point(steps: &[ExecutionStep]) -> ResumePoint {
    for (expected, step) in steps.iter().enumerate() {
        if step.step_index != expected as u32 {
            return ResumePoint::Gap {
                missing_step: expected as u32,
            };
        }
    }
    match steps.last() {
        None => ResumePoint::NotStarted,
        Some(last) => match &last.next_node {
            None => ResumePoint::Completed {
                steps: steps.len() as u32,
            },
            Some(next) => ResumePoint::Resume {
                step_index: last.step_index + 1,
                node_id: next.clone(),
            },
        },
    }
}

pub async fn handle_command(command: TraceCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    let stores = Stores::connect(&config).await?;
    run(command, stores.checkpoints.as_ref()).await
}

pub async fn run(command: TraceCommand, checkpoints: &dyn CheckpointRepository) -> Result<()> {
    match command {
        TraceCommand::List { limit } => {
            let traces = checkpoints.list_traces(limit).await?;
            print!("{}", render_list(&traces));
        }
        TraceCommand::Show { trace_id, json } => {
            let steps = checkpoints.load_trace(trace_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&steps)?);
            } else {
                print!("{}", render_steps(trace_id, &steps));
            }
        }
        TraceCommand::ResumePoint { trace_id, json } => {
            let steps = checkpoints.load_trace(trace_id).await?;
            let point = resume_point(&steps);
            if json {
                println!("{}", serde_json::to_string_pretty(&point)?);
            } else {
                println!("{}", render_resume_point(trace_id, &point));
            }
        }
    }
    Ok(())
}

fn format_status(status: StepStatus) -> colored::ColoredString {
    match status {
        StepStatus::Completed => status.as_str().green(),
        StepStatus::Failed | StepStatus::TimedOut => status.as_str().red(),
        StepStatus::Running | StepStatus::Cancelled => status.as_str().yellow(),
        StepStatus::Pending => status.as_str().normal(),
    }
}

pub fn render_list(traces: &[TraceSummary]) -> String {
    let mut out = String::new();
    if traces.is_empty() {
        let _ = writeln!(out, "{}", "No traces found".yellow());
        return out;
    }
    let _ = writeln!(out, "{} traces:", traces.len());
    for trace in traces {
        let state = if trace.finished {
            "finished".green()
        } else {
            "open".yellow()
        };
        let _ = writeln!(
            out,
            "  {} - {} steps - last node {} - {} ({})",
            trace.trace_id,
            trace.steps,
            trace.last_node,
            state,
            trace.last_step_at.to_rfc3339()
        );
    }
    out
}

pub fn render_steps(trace_id: TraceId, steps: &[ExecutionStep]) -> String {
    let mut out = String::new();
    if steps.is_empty() {
        let _ = writeln!(out, "{}", format!("No checkpoints for trace {}", trace_id).yellow());
        return out;
    }
    let _ = writeln!(out, "Trace {}", trace_id.to_string().bold());
    for step in steps {
        let next = step.next_node.as_ref().map(NodeId::as_str).unwrap_or("(end)");
        let _ = writeln!(
            out,
            "  #{:<3} {:<20} {:<10} attempts={} activities={} next={} at {}",
            step.step_index,
            step.node_id.as_str(),
            format_status(step.status),
            step.attempts,
            step.activities.len(),
            next,
            step.timestamp.to_rfc3339()
        );
    }
    out
}

pub fn render_resume_point(trace_id: TraceId, point: &ResumePoint) -> String {
    match point {
        ResumePoint::NotStarted => format!("Trace {} has no checkpoints; a run starts at the entry node", trace_id),
        ResumePoint::Resume { step_index, node_id } => format!(
            "Trace {} resumes at step {} on node {}",
            trace_id,
            step_index,
            node_id.as_str().bold()
        ),
        ResumePoint::Completed { steps } => {
            format!("{}", format!("✓ Trace {} completed after {} steps", trace_id, steps).green())
        }
        ResumePoint::Gap { missing_step } => format!(
            "{}",
            format!("✗ Trace {} is missing checkpoint {}; it cannot be resumed", trace_id, missing_step).red()
        ),
    }
}
