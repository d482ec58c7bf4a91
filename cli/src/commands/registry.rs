// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent registry maintenance commands
//!
//! Commands: list, expire, cleanup

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use colored::Colorize;

use aegis_relay_core::application::registry::AgentRegistry;
use aegis_relay_core::domain::agent::{AgentRegistration, AgentStatus};
use aegis_relay_core::domain::node_config::NodeConfigManifest;

use crate::stores::Stores;

#[derive(Subcommand)]
pub enum RegistryCommand {
    /// List registered agents
    List {
        /// Only agents of this tenant
        #[arg(long)]
        tenant: Option<String>,

        /// Only agents advertising this capability
        #[arg(long)]
        capability: Option<String>,

        /// Print registrations as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mark every agent whose lease has lapsed as UNAVAILABLE
    Expire,

    /// Delete UNAVAILABLE registrations older than the configured retention
    Cleanup,
}

pub async fn handle_command(command: RegistryCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    let stores = Stores::connect(&config).await?;
    run(command, &stores.registry).await
}

pub async fn run(command: RegistryCommand, registry: &AgentRegistry) -> Result<()> {
    match command {
        RegistryCommand::List {
            tenant,
            capability,
            json,
        } => {
            let agents: Vec<AgentRegistration> = registry
                .list()
                .await?
                .into_iter()
                .filter(|a| tenant.as_deref().is_none_or(|t| a.tenant == t))
                .filter(|a| capability.as_deref().is_none_or(|c| a.has_capability(c)))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&agents)?);
            } else {
                print!("{}", render_agents(&agents));
            }
        }
        RegistryCommand::Expire => {
            let expired = registry.expire_leases(Utc::now()).await?;
            if expired.is_empty() {
                println!("{}", "No lapsed leases".green());
            } else {
                println!("{}", format!("Marked {} agents UNAVAILABLE:", expired.len()).yellow());
                for agent_id in expired {
                    println!("  {}", agent_id);
                }
            }
        }
        RegistryCommand::Cleanup => {
            let retention = registry.config().unavailable_retention;
            let purged = registry.purge_unavailable(Utc::now(), retention).await?;
            println!(
                "{}",
                format!("✓ Removed {} registrations unavailable for more than {:?}", purged, retention).green()
            );
        }
    }
    Ok(())
}

fn format_status(status: AgentStatus) -> colored::ColoredString {
    match status {
        AgentStatus::Healthy => status.as_str().green(),
        AgentStatus::Degraded | AgentStatus::Starting => status.as_str().yellow(),
        AgentStatus::Unavailable => status.as_str().red(),
    }
}

pub fn render_agents(agents: &[AgentRegistration]) -> String {
    let mut out = String::new();
    if agents.is_empty() {
        let _ = writeln!(out, "{}", "No agents registered".yellow());
        return out;
    }
    let _ = writeln!(out, "{} agents:", agents.len());
    for agent in agents {
        let capabilities: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
        let _ = writeln!(
            out,
            "  {} ({} v{}) - {}/{} - {} - lease until {}",
            agent.agent_id().bold(),
            agent.identity.agent_type,
            agent.identity.version,
            agent.tenant,
            agent.project,
            format_status(agent.status),
            agent.lease_until.to_rfc3339()
        );
        if !capabilities.is_empty() {
            let _ = writeln!(out, "    capabilities: {}", capabilities.join(", "));
        }
        if let Some(topic) = agent.inbound_topic() {
            let _ = writeln!(out, "    inbound: {}", topic);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_relay_core::domain::envelope::AgentIdentity;
    use aegis_relay_core::domain::node_config::RegistryConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_expire_then_cleanup() {
        let stores = Stores::in_memory(RegistryConfig {
            unavailable_retention: Duration::ZERO,
            ..RegistryConfig::default()
        });
        let registry = &stores.registry;
        let healer = AgentRegistration::new(
            AgentIdentity::new("specialist", "healer-7", "0.4.1"),
            "acme",
            "checkout",
            ["healing.selector"],
        );
        registry.register(healer).await.unwrap();
        registry.heartbeat("healer-7", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        run(RegistryCommand::Expire, registry).await.unwrap();
        let agents = registry.list().await.unwrap();
        assert_eq!(agents[0].status, AgentStatus::Unavailable);
        assert!(render_agents(&agents).contains("UNAVAILABLE"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        run(RegistryCommand::Cleanup, registry).await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_render_empty_registry() {
        assert!(render_agents(&[]).contains("No agents registered"));
    }
}
