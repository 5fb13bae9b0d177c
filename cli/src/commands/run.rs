// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `dsconnector run`
//!
//! Wires the connector core from configuration and runs the orchestrator
//! workers and the liveness sweeper until Ctrl-C or SIGTERM.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dataspace_transfer_core::application::repository_factory::create_repositories;
use dataspace_transfer_core::application::{
    DataPlaneSelector, LivenessSweeper, StandardDataPlaneSelector, StandardTransferProcessService,
    TransferCollaborators, TransferProcessManager,
};
use dataspace_transfer_core::domain::connector_config::ConnectorConfigManifest;
use dataspace_transfer_core::domain::data_plane::{DataPlaneInstance, SelectionError};
use dataspace_transfer_core::domain::policy::RuleBasedPolicyEvaluator;
use dataspace_transfer_core::infrastructure::{
    EventBus, HttpDataPlaneClient, HttpDispatchGateway, InMemoryPolicySource,
};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Number of orchestrator workers (overrides spec.orchestrator.workers)
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Everything `run` starts, built but not yet running.
pub struct ConnectorRuntime {
    pub service: Arc<StandardTransferProcessService>,
    pub selector: Arc<dyn DataPlaneSelector>,
    pub policies: InMemoryPolicySource,
    pub event_bus: Arc<EventBus>,
    manager: Arc<TransferProcessManager>,
    sweeper: Option<Arc<LivenessSweeper>>,
    static_instances: Vec<DataPlaneInstance>,
    sweep_interval: Duration,
    shutdown_token: CancellationToken,
}

impl ConnectorRuntime {
    pub async fn build(config: &ConnectorConfigManifest) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        let spec = &config.spec;

        let backend = spec.storage.to_backend()?;
        let repositories = create_repositories(&backend)
            .await
            .context("Failed to initialize storage")?;

        let event_bus = Arc::new(EventBus::with_default_capacity());
        let selector: Arc<dyn DataPlaneSelector> = Arc::new(StandardDataPlaneSelector::new(
            repositories.data_planes.clone(),
            event_bus.clone(),
            spec.data_planes.liveness_timeout_chrono(),
        ));

        let mut static_instances = Vec::with_capacity(spec.data_planes.instances.len());
        for instance_config in &spec.data_planes.instances {
            let instance = instance_config.to_instance()?;
            selector
                .register(instance.clone())
                .await
                .with_context(|| format!("Failed to register data plane {}", instance.id))?;
            static_instances.push(instance);
        }

        let policies = InMemoryPolicySource::new();
        for binding in &spec.policies {
            policies.bind(&binding.agreement_id, binding.policy.clone(), binding.attributes.clone());
        }

        let dispatch_timeout = spec.orchestrator.dispatch_timeout;
        let collaborators = TransferCollaborators {
            repository: repositories.transfer_processes.clone(),
            selector: selector.clone(),
            policy_source: Arc::new(policies.clone()),
            policy_evaluator: Arc::new(RuleBasedPolicyEvaluator::new()),
            gateway: Arc::new(HttpDispatchGateway::new(dispatch_timeout)?),
            data_plane_client: Arc::new(HttpDataPlaneClient::new(dispatch_timeout)?),
            event_bus: event_bus.clone(),
        };

        let shutdown_token = CancellationToken::new();
        let manager = Arc::new(TransferProcessManager::new(
            collaborators,
            spec.connector.clone(),
            spec.orchestrator.clone(),
            shutdown_token.clone(),
        ));

        let sweeper = spec.data_planes.liveness_timeout.map(|_| {
            Arc::new(LivenessSweeper::new(
                selector.clone(),
                spec.data_planes.sweep_interval,
                shutdown_token.clone(),
            ))
        });

        Ok(Self {
            service: Arc::new(StandardTransferProcessService::new(
                repositories.transfer_processes,
                event_bus.clone(),
            )),
            selector,
            policies,
            event_bus,
            manager,
            sweeper,
            static_instances,
            sweep_interval: spec.data_planes.sweep_interval,
            shutdown_token,
        })
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.manager.clone().start();
        if let Some(sweeper) = &self.sweeper {
            handles.push(sweeper.clone().start());
            if !self.static_instances.is_empty() {
                handles.push(self.keep_static_instances_alive());
            }
        }
        handles
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Configured data planes never heartbeat on their own; vouch for them
    /// once per sweep so the sweeper leaves them registered.
    fn keep_static_instances_alive(&self) -> JoinHandle<()> {
        let selector = self.selector.clone();
        let instances = self.static_instances.clone();
        let token = self.shutdown_token.clone();
        let mut tick = tokio::time::interval(self.sweep_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for instance in &instances {
                            match selector.heartbeat(&instance.id, None).await {
                                Ok(()) => {}
                                Err(SelectionError::UnknownInstance(_)) => {
                                    if let Err(e) = selector.register(instance.clone()).await {
                                        warn!(instance_id = %instance.id, "Failed to re-register data plane: {}", e);
                                    }
                                }
                                Err(e) => warn!(instance_id = %instance.id, "Data plane heartbeat failed: {}", e),
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }
}

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config =
        ConnectorConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.spec.orchestrator.workers = workers;
    }

    info!(
        connector_id = %config.spec.connector.id,
        workers = config.spec.orchestrator.workers,
        data_planes = config.spec.data_planes.instances.len(),
        policies = config.spec.policies.len(),
        "Starting dataspace connector"
    );

    let runtime = ConnectorRuntime::build(&config).await?;
    let handles = runtime.start();

    shutdown_signal().await;
    info!("Stopping orchestrator workers");
    runtime.shutdown();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Dataspace connector stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
