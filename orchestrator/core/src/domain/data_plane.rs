// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Data Plane Domain
//!
//! Registered data-plane workers, their advertised transfer-type capabilities,
//! the deterministic selection rule, and the execution contract the
//! orchestrator uses to hand a data flow to a worker.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Capability matching and the worker execution port

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::domain::transfer::{DataRequest, TransferProcessId, TransferType};

/// Matches any transfer type in a capability entry.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataPlaneInstanceId(pub String);

impl DataPlaneInstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataPlaneInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataPlaneInstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferTypeCapability {
    pub source_type: String,
    pub destination_type: String,
}

impl TransferTypeCapability {
    pub fn new(source_type: impl Into<String>, destination_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            destination_type: destination_type.into(),
        }
    }

    /// Number of exactly matched ends (0..=2), or `None` when incapable.
    pub fn specificity(&self, transfer_type: &TransferType) -> Option<u8> {
        let source = end_specificity(&self.source_type, &transfer_type.source_type)?;
        let destination = end_specificity(&self.destination_type, &transfer_type.destination_type)?;
        Some(source + destination)
    }
}

fn end_specificity(advertised: &str, requested: &str) -> Option<u8> {
    if advertised == WILDCARD {
        Some(0)
    } else if advertised.eq_ignore_ascii_case(requested) {
        Some(1)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPlaneInstance {
    pub id: DataPlaneInstanceId,
    /// Base URL of the worker's control API
    pub url: String,
    capabilities: Vec<TransferTypeCapability>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// In-flight flows as last reported by the worker
    #[serde(default)]
    pub load: Option<u32>,
}

impl DataPlaneInstance {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        capabilities: Vec<TransferTypeCapability>,
        properties: HashMap<String, String>,
    ) -> Result<Self, SelectionError> {
        let now = Utc::now();
        let instance = Self {
            id: DataPlaneInstanceId(id.into()),
            url: url.into(),
            capabilities,
            properties,
            registered_at: now,
            last_seen: now,
            load: None,
        };
        instance.validate()?;
        Ok(instance)
    }

    /// Descriptor checks, repeated on registration since instances may
    /// arrive deserialized.
    pub fn validate(&self) -> Result<(), SelectionError> {
        if self.id.0.trim().is_empty() {
            return Err(SelectionError::InvalidInstance("missing identifier".to_string()));
        }
        if self.capabilities.is_empty() {
            return Err(SelectionError::InvalidInstance(format!("{} advertises no capabilities", self.id)));
        }
        if self
            .capabilities
            .iter()
            .any(|c| c.source_type.trim().is_empty() || c.destination_type.trim().is_empty())
        {
            return Err(SelectionError::InvalidInstance(format!("{} has an empty transfer type", self.id)));
        }
        Ok(())
    }

    pub fn capabilities(&self) -> &[TransferTypeCapability] {
        &self.capabilities
    }

    pub fn is_live(&self, now: DateTime<Utc>, liveness_timeout: Option<Duration>) -> bool {
        liveness_timeout.map_or(true, |timeout| now - self.last_seen <= timeout)
    }

    /// Best specificity over all capability entries, `None` if this worker
    /// cannot serve the request.
    pub fn match_specificity(&self, request: &SelectionRequest) -> Option<u8> {
        let properties_match = request
            .required_properties
            .iter()
            .all(|(key, value)| self.properties.get(key) == Some(value));
        if !properties_match {
            return None;
        }
        self.capabilities
            .iter()
            .filter_map(|capability| capability.specificity(&request.transfer_type))
            .max()
    }
}

/// What the orchestrator asks the registry for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    pub transfer_type: TransferType,
    pub required_properties: HashMap<String, String>,
}

impl From<&DataRequest> for SelectionRequest {
    fn from(request: &DataRequest) -> Self {
        Self {
            transfer_type: request.transfer_type(),
            required_properties: request.data_plane_properties.clone(),
        }
    }
}

/// Deterministic choice among capable, live instances: highest specificity,
/// then lowest reported load (unreported sorts last), then lexicographic id.
pub fn select_instance<'a>(
    instances: &'a [DataPlaneInstance],
    request: &SelectionRequest,
    now: DateTime<Utc>,
    liveness_timeout: Option<Duration>,
) -> Option<&'a DataPlaneInstance> {
    instances
        .iter()
        .filter(|instance| instance.is_live(now, liveness_timeout))
        .filter_map(|instance| instance.match_specificity(request).map(|score| (score, instance)))
        .min_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then_with(|| compare_load(a.load, b.load))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(_, instance)| instance)
}

fn compare_load(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("Invalid data plane instance: {0}")]
    InvalidInstance(String),

    #[error("No capable data plane for transfer type {0}")]
    NotFound(TransferType),

    #[error("Data plane instance not found: {0}")]
    UnknownInstance(DataPlaneInstanceId),

    #[error(transparent)]
    Repository(#[from] crate::domain::repository::RepositoryError),
}

// ============================================================================
// Worker execution port
// ============================================================================

/// Opaque reference to a running flow on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFlowHandle(pub String);

impl fmt::Display for DataFlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataFlowHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Succeeded,
    Failed { detail: String },
}

/// Payload handed to the worker. `process_id` doubles as the idempotency key:
/// a worker receiving the same id twice must not start a second flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlowRequest {
    pub process_id: TransferProcessId,
    pub data_request: DataRequest,
    pub callback_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataPlaneError {
    #[error("Data plane unavailable: {0}")]
    Unavailable(String),

    #[error("Data plane rejected the flow: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DataPlaneClient: Send + Sync {
    /// Hand the flow to `instance`; returns immediately with a handle.
    async fn start(
        &self,
        instance: &DataPlaneInstance,
        request: &DataFlowRequest,
    ) -> Result<DataFlowHandle, DataPlaneError>;

    /// Poll a flow; `None` while it is still running.
    async fn poll(
        &self,
        instance: &DataPlaneInstance,
        handle: &DataFlowHandle,
    ) -> Result<Option<TransferOutcome>, DataPlaneError>;
}
