// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Topic tooling
//!
//! Commands: build, parse, match

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

use aegis_relay_core::domain::topic::{build_topic, parse_topic, TopicComponents, TopicPattern};

#[derive(Subcommand)]
pub enum TopicCommand {
    /// Build `qa.<tenant>.<project>.<domain>.<entity>.<verb>`
    Build {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        verb: String,
    },

    /// Split a topic into its segments
    Parse {
        #[arg(value_name = "TOPIC")]
        topic: String,

        #[arg(long)]
        json: bool,
    },

    /// Check a topic against a subscription pattern (`*` matches one segment)
    Match {
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[arg(value_name = "TOPIC")]
        topic: String,
    },
}

pub fn handle_command(command: TopicCommand) -> Result<()> {
    match command {
        TopicCommand::Build {
            tenant,
            project,
            domain,
            entity,
            verb,
        } => {
            let topic = build_topic(&TopicComponents::new(tenant, project, domain, entity, verb))?;
            println!("{}", topic);
        }
        TopicCommand::Parse { topic, json } => {
            let components = parse_topic(&topic)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&components)?);
            } else {
                println!("{}", "Topic segments:".bold());
                println!("  tenant:  {}", components.tenant);
                println!("  project: {}", components.project);
                println!("  domain:  {}", components.domain);
                println!("  entity:  {}", components.entity);
                println!("  verb:    {}", components.verb);
            }
        }
        TopicCommand::Match { pattern, topic } => {
            if matches(&pattern, &topic)? {
                println!("{}", format!("✓ {} matches {}", topic, pattern).green());
            } else {
                anyhow::bail!("{} does not match {}", topic, pattern);
            }
        }
    }
    Ok(())
}

/// `true` if the concrete `topic` is covered by `pattern`.
pub fn matches(pattern: &str, topic: &str) -> Result<bool> {
    let pattern = TopicPattern::parse(pattern)?;
    parse_topic(topic)?;
    Ok(pattern.matches(topic))
}
