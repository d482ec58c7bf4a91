// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use aegis_relay_core::domain::node_config::NodeConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML (secrets masked)
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./relay-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(&output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, yaml: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. RELAY_CONFIG_PATH: {}",
            std::env::var("RELAY_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./relay-config.yaml");
        println!("  4. ~/.relay/config.yaml");
        println!("  5. /etc/relay/config.yaml");
        println!();
    }

    if yaml {
        print!("{}", masked(&config).to_yaml_string()?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();
    print!("{}", render_summary(&config));
    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

/// Write the default manifest to `output`.
pub fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    NodeConfigManifest::default()
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());
    Ok(())
}

/// Copy of `config` with every secret replaced by a marker.
pub fn masked(config: &NodeConfigManifest) -> NodeConfigManifest {
    let mut config = config.clone();
    let security = &mut config.spec.security;
    for secret in [&mut security.token_secret, &mut security.signing_key] {
        if let Some(value) = secret.as_mut() {
            *value = mask(value);
        }
    }
    if let Some(db) = config.spec.database.as_mut() {
        db.url = mask(&db.url);
    }
    config
}

fn mask(value: &str) -> String {
    // Indirections are safe to show.
    if value.starts_with("env:") {
        value.to_string()
    } else {
        "********".to_string()
    }
}

fn set_or_unset(value: Option<&str>) -> String {
    match value {
        Some(v) if v.starts_with("env:") => v.to_string(),
        Some(_) => "(set)".to_string(),
        None => "(not set)".to_string(),
    }
}

pub fn render_summary(config: &NodeConfigManifest) -> String {
    let spec = &config.spec;
    let mut out = String::new();

    let _ = writeln!(out, "{}", "Node Identity:".bold());
    let _ = writeln!(out, "  Name: {}", config.metadata.name);
    let _ = writeln!(
        out,
        "  Agent: {} ({} v{})",
        spec.node.agent_id, spec.node.agent_type, spec.node.agent_version
    );
    let _ = writeln!(out, "  Tenant/Project: {}/{}", spec.node.tenant, spec.node.project);
    if !spec.node.capabilities.is_empty() {
        let _ = writeln!(out, "  Capabilities: {}", spec.node.capabilities.join(", "));
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Security:".bold());
    let _ = writeln!(out, "  Issuer: {}", spec.security.issuer);
    let _ = writeln!(out, "  Token algorithm: {:?}", spec.security.token_algorithm);
    let _ = writeln!(out, "  Token secret: {}", set_or_unset(spec.security.token_secret.as_deref()));
    let _ = writeln!(out, "  Signing key: {}", set_or_unset(spec.security.signing_key.as_deref()));
    let _ = writeln!(out, "  Freshness window: {:?}", spec.security.freshness_window);
    let _ = writeln!(
        out,
        "  Require auth token / signatures: {} / {}",
        spec.security.require_auth_token, spec.security.require_signatures
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Registry:".bold());
    let _ = writeln!(
        out,
        "  Lease: {:?} (heartbeat every {:?})",
        spec.registry.lease_duration, spec.registry.heartbeat_interval
    );
    let _ = writeln!(out, "  Unavailable retention: {:?}", spec.registry.unavailable_retention);
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Transport:".bold());
    let _ = writeln!(out, "  Partitions: {}", spec.transport.partitions);
    let _ = writeln!(
        out,
        "  Backpressure: pause at {}, resume at {:.0}%",
        spec.transport.backpressure_threshold,
        spec.transport.resume_ratio * 100.0
    );
    let _ = writeln!(out, "  Max redeliveries: {}", spec.transport.max_redeliveries);
    let _ = writeln!(out, "  Retained records: {} per partition", spec.transport.retained_records);
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Runtime:".bold());
    let _ = writeln!(
        out,
        "  Retry: {} attempts, step timeout {:?}",
        spec.runtime.retry.max_attempts, spec.runtime.step_timeout
    );
    let _ = writeln!(
        out,
        "  Max depth / fan-out / steps: {} / {} / {}",
        spec.runtime.max_depth, spec.runtime.max_fan_out, spec.runtime.max_steps
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "{}", "Policy:".bold());
    let _ = writeln!(
        out,
        "  Endpoint: {}",
        spec.policy.endpoint.as_deref().unwrap_or("(none, allow all)")
    );
    let _ = writeln!(
        out,
        "  Timeout: {:?} ({})",
        spec.policy.timeout,
        if spec.policy.fail_open { "fail open" } else { "fail closed" }
    );
    let _ = writeln!(out);

    if let Some(context) = &spec.context {
        let _ = writeln!(out, "{}", "Context Service:".bold());
        let _ = writeln!(out, "  Endpoint: {}", context.endpoint);
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "{}", "Database:".bold());
    match &spec.database {
        Some(db) => {
            let _ = writeln!(out, "  URL: {}", set_or_unset(Some(&db.url)));
            let _ = writeln!(out, "  Checkpoint retention: {:?}", db.checkpoint_retention);
        }
        None => {
            let _ = writeln!(out, "  {}", "(not configured)".dimmed());
        }
    }
    out
}
