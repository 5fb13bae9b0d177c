// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transfer Process Aggregate
//!
//! The durable record of one data movement from request to completion or
//! failure. The aggregate guards its own invariants:
//!
//! - state changes only through [`TransferState::next`]
//! - `state_count` is zero on entry into a new state and counts re-entries
//! - `error_detail` is only ever set on the `TERMINATING -> TERMINATED` path
//!
//! Leases and the version token are carried on the record so that any store
//! implementation can run the compare-and-set claim protocol; the aggregate
//! itself never interprets them beyond [`TransferProcess::is_claimable`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::data_plane::{DataFlowHandle, DataPlaneInstanceId, TransferOutcome};
use crate::domain::transfer_state::{InvalidTransition, TransferEvent, TransferState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferProcessId(pub String);

impl TransferProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferProcessId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which side of the exchange this process represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferProcessType {
    Consumer,
    Provider,
}

impl TransferProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferProcessType::Consumer => "CONSUMER",
            TransferProcessType::Provider => "PROVIDER",
        }
    }
}

/// Location and technology of one end of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    /// Transfer type of this endpoint, e.g. `blob`, `http`, `kafka`
    #[serde(rename = "type")]
    pub address_type: String,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DataAddress {
    pub fn new(address_type: impl Into<String>) -> Self {
        Self {
            address_type: address_type.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The `(source, destination)` pair a data plane must support.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferType {
    pub source_type: String,
    pub destination_type: String,
}

impl TransferType {
    pub fn new(source_type: impl Into<String>, destination_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            destination_type: destination_type.into(),
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.source_type, self.destination_type)
    }
}

/// What was requested: the negotiated agreement plus source and destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Correlation id shared with the counterparty
    pub id: String,
    pub agreement_id: String,
    pub asset_id: String,
    /// Identity of the remote connector
    pub connector_id: String,
    /// Where messages for the remote connector are sent
    pub connector_address: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub source: DataAddress,
    pub destination: DataAddress,
    /// Properties the executing data plane must advertise
    #[serde(default)]
    pub data_plane_properties: HashMap<String, String>,
}

fn default_protocol() -> String {
    "dataspace-protocol-http".to_string()
}

impl DataRequest {
    pub fn transfer_type(&self) -> TransferType {
        TransferType::new(&self.source.address_type, &self.destination.address_type)
    }

    /// Structural validation done before any record exists.
    pub fn validate(&self) -> Result<(), TransferError> {
        let required = [
            ("id", &self.id),
            ("agreement_id", &self.agreement_id),
            ("asset_id", &self.asset_id),
            ("connector_id", &self.connector_id),
            ("connector_address", &self.connector_address),
            ("source.type", &self.source.address_type),
            ("destination.type", &self.destination.address_type),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(TransferError::MalformedRequest(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

/// External control commands waiting for the next claim cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferCommand {
    Cancel,
    Suspend,
    Resume,
}

/// Anything delivered to a process from outside the orchestrator loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum TransferSignal {
    Cancel,
    Suspend,
    Resume,
    Completion {
        handle: DataFlowHandle,
        outcome: TransferOutcome,
    },
}

/// The data plane a process was delegated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlowAssignment {
    pub instance_id: DataPlaneInstanceId,
    pub handle: DataFlowHandle,
    pub started_at: DateTime<Utc>,
}

/// Time-bounded exclusive right of one orchestrator worker to advance a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("Malformed transfer request: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Transfer process is {state}: {reason}")]
    InvalidState { state: TransferState, reason: String },

    #[error("Unknown data flow handle: {0}")]
    UnknownHandle(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProcess {
    pub id: TransferProcessId,
    #[serde(rename = "type")]
    pub process_type: TransferProcessType,
    state: TransferState,
    state_count: u32,
    state_timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub data_request: DataRequest,
    error_detail: Option<String>,
    suspended_from: Option<TransferState>,
    pending_command: Option<TransferCommand>,
    data_flow: Option<DataFlowAssignment>,
    completion: Option<TransferOutcome>,
    /// Backoff: not claimable before this instant
    pub retry_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: u64,
}

impl TransferProcess {
    /// Create a process in `INITIAL`. Fails fast on malformed input so that no
    /// record is ever persisted for it.
    pub fn new(process_type: TransferProcessType, data_request: DataRequest) -> Result<Self, TransferError> {
        data_request.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: TransferProcessId::new(),
            process_type,
            state: TransferState::Initial,
            state_count: 0,
            state_timestamp: now,
            created_at: now,
            data_request,
            error_detail: None,
            suspended_from: None,
            pending_command: None,
            data_flow: None,
            completion: None,
            retry_at: None,
            lease: None,
            version: 0,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn state_count(&self) -> u32 {
        self.state_count
    }

    pub fn state_timestamp(&self) -> DateTime<Utc> {
        self.state_timestamp
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    pub fn suspended_from(&self) -> Option<TransferState> {
        self.suspended_from
    }

    pub fn pending_command(&self) -> Option<TransferCommand> {
        self.pending_command
    }

    pub fn data_flow(&self) -> Option<&DataFlowAssignment> {
        self.data_flow.as_ref()
    }

    pub fn completion(&self) -> Option<&TransferOutcome> {
        self.completion.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one event of the state graph.
    pub fn transition(&mut self, event: TransferEvent) -> Result<(), TransferError> {
        let target = self.state.next(event)?;

        match event {
            TransferEvent::Suspend => self.suspended_from = Some(self.state),
            TransferEvent::Resume(_) => self.suspended_from = None,
            _ => {}
        }

        self.state_count = if target == self.state { self.state_count + 1 } else { 0 };
        self.state = target;
        self.state_timestamp = Utc::now();
        self.retry_at = None;
        Ok(())
    }

    /// Re-enter the current state, not claimable again before `not_before`.
    pub fn retry(&mut self, not_before: DateTime<Utc>) -> Result<(), TransferError> {
        self.transition(TransferEvent::Retry)?;
        self.retry_at = Some(not_before);
        Ok(())
    }

    /// Leave `SUSPENDED` for the state recorded on suspension.
    pub fn resume(&mut self) -> Result<(), TransferError> {
        let prior = self.suspended_from.ok_or_else(|| TransferError::InvalidState {
            state: self.state,
            reason: "no state recorded to resume to".to_string(),
        })?;
        self.transition(TransferEvent::Resume(prior))
    }

    /// Enter the terminal error path with a recorded reason.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<(), TransferError> {
        self.transition(TransferEvent::Terminate)?;
        self.error_detail = Some(detail.into());
        self.pending_command = None;
        Ok(())
    }

    /// Enter `TERMINATING` without an error (explicit cancellation).
    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.transition(TransferEvent::Terminate)?;
        self.pending_command = None;
        Ok(())
    }

    pub fn record_data_flow(&mut self, instance_id: DataPlaneInstanceId, handle: DataFlowHandle) {
        self.data_flow = Some(DataFlowAssignment {
            instance_id,
            handle,
            started_at: Utc::now(),
        });
        self.completion = None;
    }

    /// Record a polled completion (the pushed variant goes through
    /// [`TransferProcess::accept_signal`]).
    pub fn record_completion(&mut self, outcome: TransferOutcome) {
        if self.completion.is_none() {
            self.completion = Some(outcome);
        }
    }

    pub fn take_pending_command(&mut self) -> Option<TransferCommand> {
        self.pending_command.take()
    }

    /// Validate an externally delivered signal against the current record.
    ///
    /// Returns `Ok(true)` when the record changed, `Ok(false)` when the signal
    /// was already applied or has no effect (idempotent delivery).
    pub fn accept_signal(&mut self, signal: &TransferSignal) -> Result<bool, TransferError> {
        match signal {
            TransferSignal::Cancel => {
                if self.state.is_terminal()
                    || self.state == TransferState::Terminating
                    || self.pending_command == Some(TransferCommand::Cancel)
                {
                    return Ok(false);
                }
                self.pending_command = Some(TransferCommand::Cancel);
                Ok(true)
            }
            TransferSignal::Suspend => {
                if !self.state.can_suspend() && self.state != TransferState::Suspended {
                    return Err(self.rejected("cannot be suspended"));
                }
                match (self.state, self.pending_command) {
                    (_, Some(TransferCommand::Cancel)) => Err(self.rejected("cancellation pending")),
                    (TransferState::Suspended, Some(TransferCommand::Resume)) => {
                        self.pending_command = None;
                        Ok(true)
                    }
                    (TransferState::Suspended, _) | (_, Some(TransferCommand::Suspend)) => Ok(false),
                    _ => {
                        self.pending_command = Some(TransferCommand::Suspend);
                        Ok(true)
                    }
                }
            }
            TransferSignal::Resume => match (self.state, self.pending_command) {
                (_, Some(TransferCommand::Cancel)) => Err(self.rejected("cancellation pending")),
                (_, Some(TransferCommand::Suspend)) => {
                    self.pending_command = None;
                    Ok(true)
                }
                (TransferState::Suspended, Some(TransferCommand::Resume)) => Ok(false),
                (TransferState::Suspended, None) => {
                    self.pending_command = Some(TransferCommand::Resume);
                    Ok(true)
                }
                _ => Err(self.rejected("not suspended")),
            },
            TransferSignal::Completion { handle, outcome } => {
                if self.state.is_terminal() || self.completion.is_some() {
                    return Ok(false);
                }
                match &self.data_flow {
                    Some(flow) if &flow.handle == handle => {
                        self.completion = Some(outcome.clone());
                        Ok(true)
                    }
                    _ => Err(TransferError::UnknownHandle(handle.to_string())),
                }
            }
        }
    }

    /// Whether a worker may take a lease on this record at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.lease.as_ref().is_some_and(|lease| lease.is_active(now)) {
            return false;
        }
        if self.state == TransferState::Suspended && self.pending_command.is_none() {
            return false;
        }
        // Cancellation and pushed completions skip the backoff window
        let urgent = self.pending_command == Some(TransferCommand::Cancel)
            || (self.state == TransferState::Started && self.completion.is_some());
        urgent || self.retry_at.map_or(true, |at| at <= now)
    }

    fn rejected(&self, reason: &str) -> TransferError {
        TransferError::InvalidState {
            state: self.state,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn sample_request() -> DataRequest {
        DataRequest {
            id: "req-1".to_string(),
            agreement_id: "agreement-1".to_string(),
            asset_id: "asset-1".to_string(),
            connector_id: "urn:connector:provider".to_string(),
            connector_address: "http://provider:8282/protocol".to_string(),
            protocol: default_protocol(),
            source: DataAddress::new("blob").with_property("container", "src"),
            destination: DataAddress::new("http").with_property("baseUrl", "http://sink"),
            data_plane_properties: HashMap::new(),
        }
    }

    fn started_process() -> TransferProcess {
        let mut process = TransferProcess::new(TransferProcessType::Consumer, sample_request()).unwrap();
        process.transition(TransferEvent::Begin).unwrap();
        process.transition(TransferEvent::Dispatched).unwrap();
        process.transition(TransferEvent::PolicyAllowed).unwrap();
        process.record_data_flow(DataPlaneInstanceId::from("dp-1"), DataFlowHandle::from("flow-1"));
        process.transition(TransferEvent::WorkerStarted).unwrap();
        process
    }

    #[test]
    fn test_malformed_request_rejected() {
        let mut request = sample_request();
        request.destination.address_type = " ".to_string();
        let err = TransferProcess::new(TransferProcessType::Consumer, request).unwrap_err();
        assert!(matches!(err, TransferError::MalformedRequest(_)));
    }

    #[test]
    fn test_state_count_bookkeeping() {
        let mut process = TransferProcess::new(TransferProcessType::Consumer, sample_request()).unwrap();
        process.transition(TransferEvent::Begin).unwrap();
        assert_eq!(process.state_count(), 0);

        process.retry(Utc::now()).unwrap();
        process.retry(Utc::now()).unwrap();
        assert_eq!(process.state(), TransferState::Requesting);
        assert_eq!(process.state_count(), 2);

        process.transition(TransferEvent::Dispatched).unwrap();
        assert_eq!(process.state_count(), 0);
        assert!(process.retry_at.is_none());
    }

    #[test]
    fn test_error_detail_only_on_termination_path() {
        let mut process = TransferProcess::new(TransferProcessType::Provider, sample_request()).unwrap();
        process.transition(TransferEvent::Begin).unwrap();
        process.fail("dispatch exhausted").unwrap();
        assert_eq!(process.state(), TransferState::Terminating);
        assert_eq!(process.error_detail(), Some("dispatch exhausted"));

        process.transition(TransferEvent::Terminated).unwrap();
        assert_eq!(process.state(), TransferState::Terminated);
        assert!(process.fail("again").is_err());
    }

    #[test]
    fn test_suspend_resume_restores_prior_state() {
        let mut process = started_process();
        process.transition(TransferEvent::Suspend).unwrap();
        assert_eq!(process.suspended_from(), Some(TransferState::Started));

        process.resume().unwrap();
        assert_eq!(process.state(), TransferState::Started);
        assert_eq!(process.suspended_from(), None);
    }

    #[test]
    fn test_cancel_signal_is_idempotent() {
        let mut process = started_process();
        assert!(process.accept_signal(&TransferSignal::Cancel).unwrap());
        assert!(!process.accept_signal(&TransferSignal::Cancel).unwrap());
        assert_eq!(process.pending_command(), Some(TransferCommand::Cancel));

        process.cancel().unwrap();
        process.transition(TransferEvent::Terminated).unwrap();
        assert!(!process.accept_signal(&TransferSignal::Cancel).unwrap());
    }

    #[test]
    fn test_cancel_overrides_pending_suspend() {
        let mut process = started_process();
        assert!(process.accept_signal(&TransferSignal::Suspend).unwrap());
        assert!(process.accept_signal(&TransferSignal::Cancel).unwrap());
        assert_eq!(process.pending_command(), Some(TransferCommand::Cancel));
        assert!(process.accept_signal(&TransferSignal::Suspend).is_err());
    }

    #[test]
    fn test_resume_clears_pending_suspend() {
        let mut process = started_process();
        process.accept_signal(&TransferSignal::Suspend).unwrap();
        assert!(process.accept_signal(&TransferSignal::Resume).unwrap());
        assert_eq!(process.pending_command(), None);
        assert!(process.accept_signal(&TransferSignal::Resume).is_err());
    }

    #[test]
    fn test_completion_signal_matches_handle_once() {
        let mut process = started_process();
        let wrong = TransferSignal::Completion {
            handle: DataFlowHandle::from("other"),
            outcome: TransferOutcome::Succeeded,
        };
        assert!(matches!(process.accept_signal(&wrong), Err(TransferError::UnknownHandle(_))));

        let signal = TransferSignal::Completion {
            handle: DataFlowHandle::from("flow-1"),
            outcome: TransferOutcome::Succeeded,
        };
        assert!(process.accept_signal(&signal).unwrap());
        assert!(!process.accept_signal(&signal).unwrap());
        assert_eq!(process.completion(), Some(&TransferOutcome::Succeeded));
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let mut process = started_process();
        assert!(process.is_claimable(now));

        process.lease = Some(Lease { holder: "w1".to_string(), expires_at: now + Duration::seconds(30) });
        assert!(!process.is_claimable(now));
        assert!(process.is_claimable(now + Duration::seconds(31)));

        process.lease = None;
        process.retry_at = Some(now + Duration::seconds(10));
        assert!(!process.is_claimable(now));

        // A pushed completion bypasses the poll backoff
        process
            .accept_signal(&TransferSignal::Completion {
                handle: DataFlowHandle::from("flow-1"),
                outcome: TransferOutcome::Succeeded,
            })
            .unwrap();
        assert!(process.is_claimable(now));

        process.transition(TransferEvent::Suspend).unwrap();
        assert!(!process.is_claimable(now));
        process.accept_signal(&TransferSignal::Resume).unwrap();
        assert!(process.is_claimable(now));
    }
}
