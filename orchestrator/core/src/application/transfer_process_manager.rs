// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transfer Process Manager
//!
//! The orchestrator loop. Each worker repeatedly claims a bounded batch of
//! actionable processes from the store, runs exactly one transition attempt
//! per process, and writes the result back with a compare-and-set update that
//! also releases the lease.
//!
//! Exclusivity comes from the store's claim, never from in-process locks, so
//! any number of workers in any number of OS processes may share one store.
//!
//! ## One attempt per state
//!
//! | State | Attempt | Transient failure | Terminal failure |
//! |-------|---------|-------------------|------------------|
//! | `INITIAL` | none | - | - |
//! | `REQUESTING` | opening message to counterparty | retry, then `dispatch exhausted` | rejection |
//! | `REQUESTED` | policy gate | policy source unavailable | deny, missing policy |
//! | `STARTING` | select worker and start flow | retry, then `no capable worker` | worker rejection |
//! | `STARTED` | consume pushed completion or poll | poll again | `transfer timed out`, failed flow, worker rejection |
//! | `COMPLETING` | completion message | retry, then `dispatch exhausted` | rejection |
//! | `TERMINATING` | termination message, best effort | retry, then give up | - |
//!
//! Pending commands (cancel, suspend, resume) take precedence over the
//! state's own attempt.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::data_plane_selector::DataPlaneSelector;
use crate::domain::connector_config::{ConnectorIdentity, OrchestratorConfig};
use crate::domain::data_plane::{DataFlowRequest, DataPlaneClient, DataPlaneError, SelectionError, SelectionRequest, TransferOutcome};
use crate::domain::dispatch::{DispatchError, DispatchGateway, RemoteMessage, RemoteMessageKind};
use crate::domain::events::TransferProcessEvent;
use crate::domain::policy::{PolicyDecision, PolicyEvaluationContext, PolicyEvaluator, PolicySource, ACTION_TRANSFER};
use crate::domain::repository::{LeaseRequest, RepositoryError, TransferProcessRepository};
use crate::domain::transfer::{TransferCommand, TransferError, TransferProcess, TransferProcessType};
use crate::domain::transfer_state::{TransferEvent, TransferState};
use crate::infrastructure::event_bus::EventBus;

pub const DISPATCH_EXHAUSTED: &str = "dispatch exhausted";
pub const NO_CAPABLE_WORKER: &str = "no capable worker";
pub const TRANSFER_TIMED_OUT: &str = "transfer timed out";

/// Outcome of one claim cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimCycle {
    pub claimed: usize,
    /// Attempts whose result reached the store
    pub persisted: usize,
}

/// Everything the orchestrator talks to.
#[derive(Clone)]
pub struct TransferCollaborators {
    pub repository: Arc<dyn TransferProcessRepository>,
    pub selector: Arc<dyn DataPlaneSelector>,
    pub policy_source: Arc<dyn PolicySource>,
    pub policy_evaluator: Arc<dyn PolicyEvaluator>,
    pub gateway: Arc<dyn DispatchGateway>,
    pub data_plane_client: Arc<dyn DataPlaneClient>,
    pub event_bus: Arc<EventBus>,
}

pub struct TransferProcessManager {
    collaborators: TransferCollaborators,
    connector: ConnectorIdentity,
    config: OrchestratorConfig,
    /// Distinguishes lease holders of managers sharing a connector id
    instance_id: String,
    shutdown_token: CancellationToken,
}

impl TransferProcessManager {
    pub fn new(
        collaborators: TransferCollaborators,
        connector: ConnectorIdentity,
        config: OrchestratorConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            collaborators,
            connector,
            config,
            instance_id: Uuid::new_v4().simple().to_string(),
            shutdown_token,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Lease holder name of worker `index`.
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}/{}/worker-{}", self.connector.id, self.instance_id, index)
    }

    /// Spawn `config.workers` independent claim loops.
    pub fn start(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers)
            .map(|index| {
                let manager = self.clone();
                let holder = manager.worker_name(index);
                tokio::spawn(async move { manager.worker_loop(holder).await })
            })
            .collect()
    }

    async fn worker_loop(&self, holder: String) {
        info!(
            worker = %holder,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting transfer process worker"
        );

        while !self.shutdown_token.is_cancelled() {
            let cycle = match self.run_once(&holder).await {
                Ok(cycle) => cycle,
                Err(e) => {
                    warn!(worker = %holder, "Claim cycle failed: {}", e);
                    ClaimCycle::default()
                }
            };

            // Only progress goes straight into the next claim; released
            // leases wait out the poll interval
            if cycle.persisted == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.shutdown_token.cancelled() => break,
                }
            }
        }

        info!(worker = %holder, "Transfer process worker stopped");
    }

    /// One claim cycle: claim a batch, attempt one transition per process,
    /// persist.
    pub async fn run_once(&self, holder: &str) -> Result<ClaimCycle, RepositoryError> {
        let lease = LeaseRequest::new(holder, to_chrono(self.config.lease_duration));
        let batch = self
            .collaborators
            .repository
            .next_for_state(&TransferState::ACTIONABLE, self.config.batch_size, &lease)
            .await?;

        if batch.is_empty() {
            return Ok(ClaimCycle::default());
        }
        metrics::counter!("transfer_process_claims_total").increment(batch.len() as u64);
        debug!(worker = %holder, claimed = batch.len(), "Claimed transfer processes");

        // Processes of one batch are independent; each is bounded by the
        // dispatch timeout, which the lease outlasts
        let claimed = batch.len();
        let persisted = join_all(batch.into_iter().map(|process| self.process_claimed(process, holder)))
            .await
            .into_iter()
            .filter(|persisted| *persisted)
            .count();
        Ok(ClaimCycle { claimed, persisted })
    }

    /// Returns whether the attempt was written back.
    async fn process_claimed(&self, mut process: TransferProcess, holder: &str) -> bool {
        let repository = &self.collaborators.repository;
        let from = process.state();
        let entered_at = process.state_timestamp();

        if let Err(e) = self.advance(&mut process).await {
            error!(process_id = %process.id, state = %from, "Transition attempt failed: {}", e);
            self.release(&process, holder).await;
            return false;
        }

        match repository.update(&process).await {
            Ok(()) => {
                if process.state_timestamp() != entered_at {
                    self.record_transition(&process, from);
                }
                true
            }
            Err(RepositoryError::Conflict(_)) => {
                // A signal or another worker moved the record; its next claim
                // sees the newer version
                debug!(process_id = %process.id, state = %from, "Update conflicted, abandoning attempt");
                self.release(&process, holder).await;
                false
            }
            Err(e) => {
                warn!(process_id = %process.id, "Failed to persist transition: {}", e);
                self.release(&process, holder).await;
                false
            }
        }
    }

    async fn release(&self, process: &TransferProcess, holder: &str) {
        if let Err(e) = self.collaborators.repository.release(&process.id, holder).await {
            warn!(process_id = %process.id, "Failed to release lease: {}", e);
        }
    }

    fn record_transition(&self, process: &TransferProcess, from: TransferState) {
        let to = process.state();
        let now = process.state_timestamp();
        metrics::counter!(
            "transfer_process_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        if from == to {
            debug!(process_id = %process.id, state = %to, state_count = process.state_count(), "Transfer process retrying");
        } else {
            info!(process_id = %process.id, from = %from, to = %to, "Transfer process transitioned");
        }

        let event_bus = &self.collaborators.event_bus;
        event_bus.publish_transfer_event(TransferProcessEvent::StateChanged {
            process_id: process.id.clone(),
            from,
            to,
            state_count: process.state_count(),
            changed_at: now,
        });

        if from == to {
            return;
        }
        let follow_up = match to {
            TransferState::Suspended => Some(TransferProcessEvent::Suspended {
                process_id: process.id.clone(),
                suspended_from: from,
                suspended_at: now,
            }),
            TransferState::Completed => Some(TransferProcessEvent::Completed {
                process_id: process.id.clone(),
                completed_at: now,
            }),
            TransferState::Terminated => Some(TransferProcessEvent::Terminated {
                process_id: process.id.clone(),
                error_detail: process.error_detail().map(str::to_string),
                terminated_at: now,
            }),
            _ if from == TransferState::Suspended => Some(TransferProcessEvent::Resumed {
                process_id: process.id.clone(),
                resumed_to: to,
                resumed_at: now,
            }),
            _ => None,
        };
        if let Some(event) = follow_up {
            event_bus.publish_transfer_event(event);
        }
    }

    async fn advance(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        if let Some(command) = process.take_pending_command() {
            return self.apply_command(process, command);
        }

        match process.state() {
            TransferState::Initial => process.transition(TransferEvent::Begin),
            TransferState::Requesting => self.send_opening(process).await,
            TransferState::Requested => self.check_policy(process).await,
            TransferState::Starting => self.start_data_flow(process).await,
            TransferState::Started => self.track_data_flow(process).await,
            TransferState::Completing => self.send_completion(process).await,
            TransferState::Terminating => self.send_termination(process).await,
            TransferState::Suspended | TransferState::Completed | TransferState::Terminated => Ok(()),
        }
    }

    fn apply_command(&self, process: &mut TransferProcess, command: TransferCommand) -> Result<(), TransferError> {
        info!(process_id = %process.id, state = %process.state(), command = ?command, "Applying pending command");
        match command {
            TransferCommand::Cancel => process.cancel(),
            TransferCommand::Suspend if process.state().can_suspend() => process.transition(TransferEvent::Suspend),
            TransferCommand::Resume if process.state() == TransferState::Suspended => process.resume(),
            TransferCommand::Suspend | TransferCommand::Resume => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Per-state attempts
    // ------------------------------------------------------------------------

    async fn send_opening(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        let kind = RemoteMessage::opening_kind(process.process_type);
        match self.dispatch(process, kind).await {
            Ok(()) => process.transition(TransferEvent::Dispatched),
            Err(DispatchError::Transient(reason)) => {
                warn!(process_id = %process.id, attempt = process.state_count() + 1, "Dispatch failed: {}", reason);
                self.retry_or_fail(process, DISPATCH_EXHAUSTED)
            }
            Err(DispatchError::Rejected(reason)) => process.fail(format!("dispatch rejected: {}", reason)),
        }
    }

    async fn check_policy(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        let agreement_id = process.data_request.agreement_id.clone();
        let resolved = match self
            .bounded(self.collaborators.policy_source.resolve(&agreement_id))
            .await
        {
            Some(Ok(Some(resolved))) => resolved,
            Some(Ok(None)) => {
                return process.fail(format!("policy denied: no policy bound to agreement {}", agreement_id));
            }
            Some(Err(e)) => {
                warn!(process_id = %process.id, "Policy source failed: {}", e);
                return self.retry_or_fail(process, "policy source unavailable");
            }
            None => {
                warn!(process_id = %process.id, "Policy source timed out");
                return self.retry_or_fail(process, "policy source unavailable");
            }
        };

        let requesting_party = match process.process_type {
            TransferProcessType::Provider => process.data_request.connector_id.clone(),
            TransferProcessType::Consumer => self.connector.id.clone(),
        };
        let mut context = PolicyEvaluationContext::new(agreement_id, requesting_party, ACTION_TRANSFER);
        context.attributes = resolved.attributes;

        match self.collaborators.policy_evaluator.evaluate(&resolved.policy, &context) {
            PolicyDecision::Allow => process.transition(TransferEvent::PolicyAllowed),
            decision @ PolicyDecision::Deny(_) => {
                let reason = decision.reason().unwrap_or_default();
                info!(process_id = %process.id, reason = %reason, "Transfer denied by policy");
                process.fail(format!("policy denied: {}", reason))
            }
        }
    }

    async fn start_data_flow(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        let request = SelectionRequest::from(&process.data_request);
        let instance = match self.collaborators.selector.select(&request).await {
            Ok(instance) => instance,
            Err(SelectionError::NotFound(transfer_type)) => {
                warn!(process_id = %process.id, transfer_type = %transfer_type, "No capable data plane");
                return self.retry_or_fail(process, NO_CAPABLE_WORKER);
            }
            Err(e) => {
                warn!(process_id = %process.id, "Data plane selection failed: {}", e);
                return self.retry_or_fail(process, NO_CAPABLE_WORKER);
            }
        };

        let flow = DataFlowRequest {
            process_id: process.id.clone(),
            data_request: process.data_request.clone(),
            callback_address: self.connector.callback_address.clone(),
        };
        match self
            .bounded(self.collaborators.data_plane_client.start(&instance, &flow))
            .await
        {
            Some(Ok(handle)) => {
                info!(process_id = %process.id, instance_id = %instance.id, handle = %handle, "Data flow started");
                process.record_data_flow(instance.id, handle);
                process.transition(TransferEvent::WorkerStarted)
            }
            Some(Err(DataPlaneError::Rejected(reason))) => process.fail(format!("data plane rejected: {}", reason)),
            Some(Err(DataPlaneError::Unavailable(reason))) => {
                warn!(process_id = %process.id, instance_id = %instance.id, "Data plane unavailable: {}", reason);
                self.retry_or_fail(process, NO_CAPABLE_WORKER)
            }
            None => {
                warn!(process_id = %process.id, instance_id = %instance.id, "Data plane start timed out");
                self.retry_or_fail(process, NO_CAPABLE_WORKER)
            }
        }
    }

    async fn track_data_flow(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        if let Some(outcome) = process.completion().cloned() {
            return finish_data_flow(process, outcome);
        }

        let Some(flow) = process.data_flow().cloned() else {
            return process.fail("no data flow recorded");
        };

        let now = Utc::now();
        if now - flow.started_at >= to_chrono(self.config.transfer_timeout) {
            warn!(process_id = %process.id, handle = %flow.handle, "Data flow exceeded transfer timeout");
            return process.fail(TRANSFER_TIMED_OUT);
        }

        let next_poll = now + to_chrono(self.config.status_poll_interval);

        // A deregistered worker can still push its completion
        let instance = match self.collaborators.selector.find(&flow.instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => return process.retry(next_poll),
            Err(e) => {
                debug!(process_id = %process.id, "Data plane lookup failed: {}", e);
                return process.retry(next_poll);
            }
        };

        match self
            .bounded(self.collaborators.data_plane_client.poll(&instance, &flow.handle))
            .await
        {
            Some(Ok(Some(outcome))) => {
                process.record_completion(outcome.clone());
                finish_data_flow(process, outcome)
            }
            Some(Ok(None)) => process.retry(next_poll),
            Some(Err(DataPlaneError::Rejected(reason))) => {
                warn!(process_id = %process.id, handle = %flow.handle, "Data plane rejected status poll: {}", reason);
                process.fail(format!("data plane rejected: {}", reason))
            }
            Some(Err(DataPlaneError::Unavailable(reason))) => {
                debug!(process_id = %process.id, "Status poll failed: {}", reason);
                process.retry(next_poll)
            }
            None => {
                debug!(process_id = %process.id, "Status poll timed out");
                process.retry(next_poll)
            }
        }
    }

    async fn send_completion(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        match self.dispatch(process, RemoteMessageKind::TransferCompletion).await {
            Ok(()) => process.transition(TransferEvent::Finalized),
            Err(DispatchError::Transient(reason)) => {
                warn!(process_id = %process.id, "Completion dispatch failed: {}", reason);
                self.retry_or_fail(process, DISPATCH_EXHAUSTED)
            }
            Err(DispatchError::Rejected(reason)) => process.fail(format!("dispatch rejected: {}", reason)),
        }
    }

    async fn send_termination(&self, process: &mut TransferProcess) -> Result<(), TransferError> {
        match self.dispatch(process, RemoteMessageKind::TransferTermination).await {
            Ok(()) => process.transition(TransferEvent::Terminated),
            Err(DispatchError::Transient(reason)) if !self.config.retry.is_exhausted(process.state_count()) => {
                debug!(process_id = %process.id, "Termination dispatch failed: {}", reason);
                process.retry(self.next_attempt_at(process.state_count()))
            }
            Err(e) => {
                warn!(process_id = %process.id, "Counterparty not notified of termination: {}", e);
                process.transition(TransferEvent::Terminated)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn dispatch(&self, process: &TransferProcess, kind: RemoteMessageKind) -> Result<(), DispatchError> {
        let message = RemoteMessage::for_process(kind, process);
        match self.bounded(self.collaborators.gateway.send(&message)).await {
            Some(result) => result,
            None => Err(DispatchError::Transient(format!(
                "no response within {:?}",
                self.config.dispatch_timeout
            ))),
        }
    }

    /// Run an external call under the dispatch timeout; `None` on expiry.
    async fn bounded<T>(&self, call: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.config.dispatch_timeout, call).await.ok()
    }

    fn retry_or_fail(&self, process: &mut TransferProcess, detail: &str) -> Result<(), TransferError> {
        if self.config.retry.is_exhausted(process.state_count()) {
            warn!(
                process_id = %process.id,
                state = %process.state(),
                attempts = process.state_count() + 1,
                "Retries exhausted: {}",
                detail
            );
            process.fail(detail)
        } else {
            process.retry(self.next_attempt_at(process.state_count()))
        }
    }

    fn next_attempt_at(&self, state_count: u32) -> DateTime<Utc> {
        Utc::now() + to_chrono(self.config.retry.delay_for(state_count))
    }
}

fn finish_data_flow(process: &mut TransferProcess, outcome: TransferOutcome) -> Result<(), TransferError> {
    match outcome {
        TransferOutcome::Succeeded => process.transition(TransferEvent::WorkerFinished),
        TransferOutcome::Failed { detail } => process.fail(format!("transfer failed: {}", detail)),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
