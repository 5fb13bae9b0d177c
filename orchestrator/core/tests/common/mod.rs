// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use dataspace_transfer_core::application::{
    StandardDataPlaneSelector, StandardTransferProcessService, TransferCollaborators, TransferProcessManager,
};
use dataspace_transfer_core::domain::connector_config::{ConnectorIdentity, OrchestratorConfig, RetryPolicy};
use dataspace_transfer_core::domain::data_plane::{
    DataFlowHandle, DataFlowRequest, DataPlaneClient, DataPlaneError, DataPlaneInstance, DataPlaneInstanceId,
    TransferOutcome, TransferTypeCapability,
};
use dataspace_transfer_core::domain::dispatch::{DispatchError, DispatchGateway, RemoteMessage, RemoteMessageKind};
use dataspace_transfer_core::domain::events::TransferProcessEvent;
use dataspace_transfer_core::domain::policy::{
    PolicyDecision, PolicyEvaluationContext, PolicyEvaluator, RuleBasedPolicyEvaluator,
};
use dataspace_transfer_core::domain::repository::TransferProcessRepository;
use dataspace_transfer_core::domain::transfer::{
    DataAddress, DataRequest, TransferProcess, TransferProcessId, TransferSignal,
};
use dataspace_transfer_core::infrastructure::event_bus::{DomainEvent, EventBus, EventReceiver};
use dataspace_transfer_core::infrastructure::repositories::{
    InMemoryDataPlaneInstanceRepository, InMemoryTransferProcessRepository,
};
use dataspace_transfer_core::infrastructure::InMemoryPolicySource;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const WORKER: &str = "urn:connector:consumer/test/worker-0";

pub fn data_request(id: &str) -> DataRequest {
    DataRequest {
        id: id.to_string(),
        agreement_id: "agreement-1".to_string(),
        asset_id: "asset-1".to_string(),
        connector_id: "urn:connector:provider".to_string(),
        connector_address: "http://provider:8282/protocol".to_string(),
        protocol: "dataspace-protocol-http".to_string(),
        source: DataAddress::new("blob").with_property("container", "src"),
        destination: DataAddress::new("http").with_property("baseUrl", "http://sink"),
        data_plane_properties: HashMap::new(),
    }
}

/// No backoff, no status poll wait, generous lease.
pub fn fast_config(max_attempts: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        workers: 1,
        batch_size: 10,
        poll_interval: Duration::from_millis(10),
        lease_duration: Duration::from_secs(60),
        dispatch_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        status_poll_interval: Duration::ZERO,
        transfer_timeout: Duration::from_secs(3600),
    }
}

pub fn blob_to_http_instance(id: &str) -> DataPlaneInstance {
    DataPlaneInstance::new(
        id,
        format!("http://{}:8181", id),
        vec![TransferTypeCapability::new("blob", "http")],
        HashMap::new(),
    )
    .expect("valid instance")
}

// ============================================================================
// Mock dispatch gateway
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayBehavior {
    Accept,
    Transient,
    Reject,
}

pub struct MockGateway {
    behavior: Mutex<GatewayBehavior>,
    sent: Mutex<Vec<RemoteMessage>>,
    /// Cancels the addressed process while the first send is in flight
    cancel_during_send: Mutex<Option<Arc<dyn TransferProcessRepository>>>,
}

impl MockGateway {
    pub fn new(behavior: GatewayBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            sent: Mutex::new(Vec::new()),
            cancel_during_send: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: GatewayBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn cancel_on_next_send(&self, repository: Arc<dyn TransferProcessRepository>) {
        *self.cancel_during_send.lock() = Some(repository);
    }

    pub fn sent_kinds(&self) -> Vec<RemoteMessageKind> {
        self.sent.lock().iter().map(|m| m.kind).collect()
    }

    pub fn count(&self, kind: RemoteMessageKind) -> usize {
        self.sent.lock().iter().filter(|m| m.kind == kind).count()
    }
}

#[async_trait]
impl DispatchGateway for MockGateway {
    async fn send(&self, message: &RemoteMessage) -> Result<(), DispatchError> {
        self.sent.lock().push(message.clone());

        let interloper = self.cancel_during_send.lock().take();
        if let Some(repository) = interloper {
            repository
                .apply_signal(&message.process_id, &TransferSignal::Cancel)
                .await
                .expect("cancel signal applies");
        }

        match *self.behavior.lock() {
            GatewayBehavior::Accept => Ok(()),
            GatewayBehavior::Transient => Err(DispatchError::Transient("connection refused".to_string())),
            GatewayBehavior::Reject => Err(DispatchError::Rejected("409 unknown agreement".to_string())),
        }
    }
}

// ============================================================================
// Mock data plane client
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    Accept,
    Unavailable,
    Reject,
}

pub struct MockDataPlaneClient {
    start_behavior: Mutex<StartBehavior>,
    poll_outcome: Mutex<Option<TransferOutcome>>,
    poll_rejection: Mutex<Option<String>>,
    starts: Mutex<Vec<(DataPlaneInstanceId, TransferProcessId)>>,
    polls: Mutex<usize>,
}

impl MockDataPlaneClient {
    pub fn new(start_behavior: StartBehavior) -> Self {
        Self {
            start_behavior: Mutex::new(start_behavior),
            poll_outcome: Mutex::new(None),
            poll_rejection: Mutex::new(None),
            starts: Mutex::new(Vec::new()),
            polls: Mutex::new(0),
        }
    }

    pub fn set_start_behavior(&self, behavior: StartBehavior) {
        *self.start_behavior.lock() = behavior;
    }

    /// What status polls report; `None` keeps the flow running.
    pub fn set_poll_outcome(&self, outcome: Option<TransferOutcome>) {
        *self.poll_outcome.lock() = outcome;
    }

    /// Make every status poll fail permanently, e.g. a worker that lost the flow.
    pub fn reject_polls(&self, reason: &str) {
        *self.poll_rejection.lock() = Some(reason.to_string());
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().len()
    }

    pub fn started_on(&self) -> Vec<DataPlaneInstanceId> {
        self.starts.lock().iter().map(|(instance, _)| instance.clone()).collect()
    }

    pub fn poll_count(&self) -> usize {
        *self.polls.lock()
    }

    pub fn handle_for(process_id: &TransferProcessId) -> DataFlowHandle {
        DataFlowHandle(format!("flow-{}", process_id))
    }
}

#[async_trait]
impl DataPlaneClient for MockDataPlaneClient {
    async fn start(
        &self,
        instance: &DataPlaneInstance,
        request: &DataFlowRequest,
    ) -> Result<DataFlowHandle, DataPlaneError> {
        self.starts.lock().push((instance.id.clone(), request.process_id.clone()));
        match *self.start_behavior.lock() {
            StartBehavior::Accept => Ok(Self::handle_for(&request.process_id)),
            StartBehavior::Unavailable => Err(DataPlaneError::Unavailable("503 Service Unavailable".to_string())),
            StartBehavior::Reject => Err(DataPlaneError::Rejected("400 unsupported destination".to_string())),
        }
    }

    async fn poll(
        &self,
        _instance: &DataPlaneInstance,
        _handle: &DataFlowHandle,
    ) -> Result<Option<TransferOutcome>, DataPlaneError> {
        *self.polls.lock() += 1;
        if let Some(reason) = self.poll_rejection.lock().clone() {
            return Err(DataPlaneError::Rejected(reason));
        }
        Ok(self.poll_outcome.lock().clone())
    }
}

// ============================================================================
// Fixed policy evaluator
// ============================================================================

pub struct FixedPolicyEvaluator {
    decision: PolicyDecision,
    contexts: Mutex<Vec<PolicyEvaluationContext>>,
}

impl FixedPolicyEvaluator {
    pub fn new(decision: PolicyDecision) -> Self {
        Self {
            decision,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn contexts(&self) -> Vec<PolicyEvaluationContext> {
        self.contexts.lock().clone()
    }
}

impl PolicyEvaluator for FixedPolicyEvaluator {
    fn evaluate(&self, _policy: &Value, context: &PolicyEvaluationContext) -> PolicyDecision {
        self.contexts.lock().push(context.clone());
        self.decision.clone()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub repository: Arc<InMemoryTransferProcessRepository>,
    pub service: StandardTransferProcessService,
    pub selector: Arc<StandardDataPlaneSelector>,
    pub policies: InMemoryPolicySource,
    pub gateway: Arc<MockGateway>,
    pub data_plane: Arc<MockDataPlaneClient>,
    pub event_bus: Arc<EventBus>,
    pub manager: Arc<TransferProcessManager>,
    collaborators: TransferCollaborators,
    connector: ConnectorIdentity,
    config: OrchestratorConfig,
}

impl Harness {
    /// Rule-based evaluation against a permissive policy bound to `agreement-1`.
    pub fn new(config: OrchestratorConfig) -> Self {
        let harness = Self::with_evaluator(config, Arc::new(RuleBasedPolicyEvaluator::new()));
        harness.policies.bind(
            "agreement-1",
            json!({"permissions": [{"action": "use"}]}),
            HashMap::new(),
        );
        harness
    }

    pub fn with_evaluator(config: OrchestratorConfig, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        let repository = Arc::new(InMemoryTransferProcessRepository::new());
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let selector = Arc::new(StandardDataPlaneSelector::new(
            Arc::new(InMemoryDataPlaneInstanceRepository::new()),
            event_bus.clone(),
            None,
        ));
        let policies = InMemoryPolicySource::new();
        let gateway = Arc::new(MockGateway::new(GatewayBehavior::Accept));
        let data_plane = Arc::new(MockDataPlaneClient::new(StartBehavior::Accept));

        let collaborators = TransferCollaborators {
            repository: repository.clone(),
            selector: selector.clone(),
            policy_source: Arc::new(policies.clone()),
            policy_evaluator: evaluator,
            gateway: gateway.clone(),
            data_plane_client: data_plane.clone(),
            event_bus: event_bus.clone(),
        };
        let connector = ConnectorIdentity {
            id: "urn:connector:consumer".to_string(),
            callback_address: Some("http://consumer:8080/callback".to_string()),
        };
        let manager = Arc::new(TransferProcessManager::new(
            collaborators.clone(),
            connector.clone(),
            config.clone(),
            CancellationToken::new(),
        ));

        Self {
            service: StandardTransferProcessService::new(repository.clone(), event_bus.clone()),
            repository,
            selector,
            policies,
            gateway,
            data_plane,
            event_bus,
            manager,
            collaborators,
            connector,
            config,
        }
    }

    /// Another orchestrator instance on the same store and collaborators.
    pub fn another_manager(&self) -> Arc<TransferProcessManager> {
        Arc::new(TransferProcessManager::new(
            self.collaborators.clone(),
            self.connector.clone(),
            self.config.clone(),
            CancellationToken::new(),
        ))
    }

    /// Claim cycles until nothing is claimable or `max_cycles` ran.
    pub async fn drive(&self, max_cycles: usize) -> usize {
        for cycle in 0..max_cycles {
            let outcome = self.manager.run_once(WORKER).await.expect("claim cycle");
            if outcome.claimed == 0 {
                return cycle;
            }
        }
        max_cycles
    }

    pub async fn process(&self, id: &TransferProcessId) -> TransferProcess {
        self.repository
            .find_by_id(id)
            .await
            .expect("repository read")
            .expect("process exists")
    }
}

/// Transfer events published so far on `receiver`, in order.
pub fn drain_transfer_events(receiver: &mut EventReceiver) -> Vec<TransferProcessEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let DomainEvent::Transfer(event) = event {
            events.push(event);
        }
    }
    events
}
