// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Relay Operator CLI
//!
//! The `relay` binary inspects and maintains the shared state of a relay
//! deployment. It never runs step graphs or hosts agents itself.
//!
//! ## Commands
//!
//! - `relay config show|validate|generate` - Configuration management
//! - `relay trace list|show|resume-point` - Checkpoint inspection
//! - `relay registry list|expire|cleanup` - Agent registry maintenance
//! - `relay topic build|parse|match` - Topic naming tooling

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

use aegis_relay::commands::{self, ConfigCommand, RegistryCommand, TopicCommand, TraceCommand};
use aegis_relay::logging::{init_logging, LogFormat};

/// AEGIS Relay - operator tooling for the agent messaging substrate
#[derive(Parser)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "RELAY_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "RELAY_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "RELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Checkpoint inspection
    #[command(name = "trace")]
    Trace {
        #[command(subcommand)]
        command: TraceCommand,
    },

    /// Agent registry maintenance
    #[command(name = "registry")]
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },

    /// Topic naming tooling
    #[command(name = "topic")]
    Topic {
        #[command(subcommand)]
        command: TopicCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Trace { command }) => commands::trace::handle_command(command, cli.config).await,
        Some(Commands::Registry { command }) => commands::registry::handle_command(command, cli.config).await,
        Some(Commands::Topic { command }) => commands::topic::handle_command(command),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
