// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dataspace_transfer_core::domain::connector_config::{
    ConnectorConfigManifest, DataPlaneInstanceConfig, PolicyBindingConfig,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./connector-config.yaml)
        #[arg(short, long, default_value = "./connector-config.yaml")]
        output: PathBuf,

        /// Include a sample data plane and policy binding
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, examples } => generate(&output, examples),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ConnectorConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. DSC_CONFIG_PATH: {}",
            std::env::var("DSC_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./connector-config.yaml");
        println!("  4. ~/.dsconnector/config.yaml");
        println!("  5. /etc/dsconnector/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Connector:".bold());
    println!("  ID: {}", spec.connector.id);
    if let Some(callback) = &spec.connector.callback_address {
        println!("  Callback: {}", callback);
    }
    println!();

    let orchestrator = &spec.orchestrator;
    println!("{}", "Orchestrator:".bold());
    println!("  Workers: {}", orchestrator.workers);
    println!("  Batch size: {}", orchestrator.batch_size);
    println!("  Poll interval: {:?}", orchestrator.poll_interval);
    println!("  Lease: {:?}", orchestrator.lease_duration);
    println!("  Dispatch timeout: {:?}", orchestrator.dispatch_timeout);
    println!(
        "  Retry: {} attempts, {:?} base, {:?} max",
        orchestrator.retry.max_attempts, orchestrator.retry.base_delay, orchestrator.retry.max_delay
    );
    println!();

    println!("{}", "Data Planes:".bold());
    match spec.data_planes.liveness_timeout {
        Some(timeout) => println!("  Liveness timeout: {:?}", timeout),
        None => println!("  Liveness timeout: {}", "(disabled)".dimmed()),
    }
    for instance in &spec.data_planes.instances {
        println!("  {} → {}", instance.id.bold(), instance.url);
        println!("    Transfer types: {}", instance.transfer_types.join(", "));
    }
    println!();

    println!("{}", "Policies:".bold());
    if spec.policies.is_empty() {
        println!("  {}", "(none bound; every transfer will be denied)".dimmed());
    }
    for binding in &spec.policies {
        println!("  {}", binding.agreement_id);
    }
    println!();

    println!("{}", "Storage:".bold());
    println!("  Backend: {:?}", spec.storage.backend);
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ConnectorConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Manifest written by `config generate`.
pub fn sample_manifest(with_examples: bool) -> ConnectorConfigManifest {
    let mut manifest = ConnectorConfigManifest::default();
    if with_examples {
        manifest.spec.data_planes.instances.push(DataPlaneInstanceConfig {
            id: "dataplane-1".to_string(),
            url: "http://localhost:8181/control".to_string(),
            transfer_types: vec!["blob->http".to_string(), "*->s3".to_string()],
            properties: HashMap::from([("region".to_string(), "eu-west".to_string())]),
        });
        manifest.spec.policies.push(PolicyBindingConfig {
            agreement_id: "agreement-1".to_string(),
            policy: json!({
                "permissions": [{
                    "action": "use",
                    "constraints": [
                        {"leftOperand": "region", "operator": "in", "rightOperand": ["eu-west", "eu-central"]}
                    ]
                }]
            }),
            attributes: HashMap::from([("region".to_string(), json!("eu-west"))]),
        });
    }
    manifest
}

fn generate(output: &Path, with_examples: bool) -> Result<()> {
    sample_manifest(with_examples)
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
