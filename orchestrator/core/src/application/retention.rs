// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Retention Job - background hard cleanup
//!
//! Lease expiry and trace completion only change status; this job is the one
//! place that deletes. It removes registrations that have been `UNAVAILABLE`
//! longer than `registry.unavailable_retention` and checkpoints, activities and
//! dedup records older than `database.checkpoint_retention`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::repository::{AgentRegistryRepository, CheckpointRepository, RepositoryError};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub checkpoint_retention: Duration,
    pub unavailable_retention: Duration,
    /// How often to run.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            checkpoint_retention: Duration::from_secs(30 * 24 * 3600),
            unavailable_retention: Duration::from_secs(7 * 24 * 3600),
            interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub checkpoint_rows: u64,
    pub agents: u64,
}

pub struct RetentionJob {
    checkpoints: Arc<dyn CheckpointRepository>,
    agents: Arc<dyn AgentRegistryRepository>,
    config: RetentionConfig,
    shutdown_token: CancellationToken,
}

impl RetentionJob {
    pub fn new(
        checkpoints: Arc<dyn CheckpointRepository>,
        agents: Arc<dyn AgentRegistryRepository>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            checkpoints,
            agents,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            checkpoint_retention_s = self.config.checkpoint_retention.as_secs(),
            unavailable_retention_s = self.config.unavailable_retention.as_secs(),
            "Starting retention job"
        );
        let mut tick = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) => info!(checkpoint_rows = report.checkpoint_rows, agents = report.agents, "Retention cycle completed"),
                        Err(e) => warn!("Retention cycle failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping retention job");
                    break;
                }
            }
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport, RepositoryError> {
        let checkpoint_rows = self
            .checkpoints
            .purge_before(now - to_chrono(self.config.checkpoint_retention))
            .await?;
        let agents = self
            .agents
            .purge_unavailable_before(now - to_chrono(self.config.unavailable_retention))
            .await?;
        Ok(RetentionReport { checkpoint_rows, agents })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}
