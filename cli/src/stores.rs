// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Store wiring for operator commands.
//!
//! Trace and registry commands read the same PostgreSQL database the relay
//! nodes write to; `spec.database` must be configured (or
//! `RELAY_DATABASE_URL` set).

use std::sync::Arc;

use anyhow::{Context, Result};

use aegis_relay_core::application::registry::AgentRegistry;
use aegis_relay_core::domain::node_config::{resolve_secret, NodeConfigManifest, RegistryConfig};
use aegis_relay_core::domain::repository::{CheckpointRepository, PostgresConfig};
use aegis_relay_core::infrastructure::db::Database;
use aegis_relay_core::infrastructure::event_bus::EventBus;
use aegis_relay_core::infrastructure::repositories::{
    InMemoryAgentRegistryRepository, InMemoryCheckpointRepository, PostgresAgentRegistryRepository,
    PostgresCheckpointRepository,
};

pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub registry: Arc<AgentRegistry>,
}

impl Stores {
    /// Connect to the configured database.
    pub async fn connect(config: &NodeConfigManifest) -> Result<Self> {
        let database = config
            .spec
            .database
            .as_ref()
            .context("No database configured: set spec.database.url or RELAY_DATABASE_URL")?;
        let connection_string = resolve_secret(&database.url)?;
        let db = Database::from_config(&PostgresConfig {
            connection_string,
            max_connections: database.max_connections,
        })
        .await?;
        tracing::debug!("Connected to relay database");

        let pool = db.get_pool().clone();
        Ok(Self {
            checkpoints: Arc::new(PostgresCheckpointRepository::new(pool.clone())),
            registry: Arc::new(AgentRegistry::new(
                Arc::new(PostgresAgentRegistryRepository::new(pool)),
                EventBus::with_default_capacity(),
                config.spec.registry.clone(),
            )),
        })
    }

    /// Process-local stores, used by tests.
    pub fn in_memory(registry: RegistryConfig) -> Self {
        Self {
            checkpoints: Arc::new(InMemoryCheckpointRepository::new()),
            registry: Arc::new(AgentRegistry::new(
                Arc::new(InMemoryAgentRegistryRepository::new()),
                EventBus::with_default_capacity(),
                registry,
            )),
        }
    }
}
