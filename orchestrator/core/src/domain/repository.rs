// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the two aggregates of the connector core,
//! following the DDD Repository pattern: interface defined in the domain
//! layer, implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `TransferProcessRepository` | `TransferProcess` | `InMemoryTransferProcessRepository`, `PostgresTransferProcessRepository` |
//! | `DataPlaneInstanceRepository` | `DataPlaneInstance` | `InMemoryDataPlaneInstanceRepository`, `PostgresDataPlaneInstanceRepository` |
//!
//! ## Claim protocol
//!
//! The transfer process store is the only shared mutable resource between
//! orchestrator workers, which may live in different OS processes. Exclusive
//! progress on a record is therefore enforced here and nowhere else:
//!
//! 1. [`TransferProcessRepository::next_for_state`] atomically leases a batch
//!    of claimable records to one holder and bumps their version.
//! 2. [`TransferProcessRepository::update`] is a compare-and-set on
//!    `(version, lease holder)`; it releases the lease on success and fails
//!    with [`RepositoryError::Conflict`] otherwise.
//! 3. [`TransferProcessRepository::apply_signal`] lets callers outside the
//!    loop change a record regardless of leases. It bumps the version, so a
//!    concurrent lease holder's next `update` conflicts and is abandoned.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::domain::data_plane::{DataPlaneInstance, DataPlaneInstanceId};
use crate::domain::transfer::{TransferError, TransferProcess, TransferProcessId, TransferProcessType, TransferSignal};
use crate::domain::transfer_state::TransferState;

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// Who asks for a lease, for how long, and at which instant.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub holder: String,
    pub duration: Duration,
    pub now: DateTime<Utc>,
}

impl LeaseRequest {
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self::at(holder, duration, Utc::now())
    }

    pub fn at(holder: impl Into<String>, duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            duration,
            now,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.now + self.duration
    }
}

/// Filter for listing processes. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TransferProcessQuery {
    pub states: Vec<TransferState>,
    pub process_type: Option<TransferProcessType>,
    pub agreement_id: Option<String>,
    pub limit: Option<usize>,
}

impl TransferProcessQuery {
    pub fn matches(&self, process: &TransferProcess) -> bool {
        (self.states.is_empty() || self.states.contains(&process.state()))
            && self.process_type.map_or(true, |t| t == process.process_type)
            && self
                .agreement_id
                .as_ref()
                .map_or(true, |id| id == &process.data_request.agreement_id)
    }
}

/// Repository interface for TransferProcess aggregates
#[async_trait]
pub trait TransferProcessRepository: Send + Sync {
    /// Insert a new record; fails with `AlreadyExists` on a duplicate id
    async fn create(&self, process: &TransferProcess) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &TransferProcessId) -> Result<Option<TransferProcess>, RepositoryError>;

    /// Correlate a counterparty data request id with the local process
    async fn find_by_data_request_id(&self, data_request_id: &str) -> Result<Option<TransferProcess>, RepositoryError>;

    /// Atomically lease up to `batch_size` claimable records in `states`,
    /// oldest `state_timestamp` first
    async fn next_for_state(
        &self,
        states: &[TransferState],
        batch_size: usize,
        lease: &LeaseRequest,
    ) -> Result<Vec<TransferProcess>, RepositoryError>;

    /// Persist a leased record and release its lease
    async fn update(&self, process: &TransferProcess) -> Result<(), RepositoryError>;

    /// Drop a lease without writing anything else; no-op for other holders
    async fn release(&self, id: &TransferProcessId, holder: &str) -> Result<(), RepositoryError>;

    /// Apply an external signal atomically and return the resulting record
    async fn apply_signal(&self, id: &TransferProcessId, signal: &TransferSignal) -> Result<TransferProcess, RepositoryError>;

    async fn count_by_state(&self) -> Result<HashMap<TransferState, usize>, RepositoryError>;

    async fn query(&self, query: &TransferProcessQuery) -> Result<Vec<TransferProcess>, RepositoryError>;
}

/// Repository interface for DataPlaneInstance aggregates
#[async_trait]
pub trait DataPlaneInstanceRepository: Send + Sync {
    /// Insert or replace; returns whether an entry was replaced
    async fn save(&self, instance: &DataPlaneInstance) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &DataPlaneInstanceId) -> Result<Option<DataPlaneInstance>, RepositoryError>;

    /// All instances ordered by id
    async fn list_all(&self) -> Result<Vec<DataPlaneInstance>, RepositoryError>;

    /// Returns whether an entry was removed
    async fn delete(&self, id: &DataPlaneInstanceId) -> Result<bool, RepositoryError>;

    /// Refresh `last_seen`, and `load` when given, of an existing entry in a
    /// single write. Returns `false` if the id is not registered; never
    /// recreates a removed entry or touches its capabilities.
    async fn touch(
        &self,
        id: &DataPlaneInstanceId,
        last_seen: DateTime<Utc>,
        load: Option<u32>,
    ) -> Result<bool, RepositoryError>;

    /// Remove the entry only if it was last seen before `cutoff`, checked in
    /// the same write. Returns whether it was removed.
    async fn delete_if_stale(&self, id: &DataPlaneInstanceId, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Signal rejected: {0}")]
    Rejected(#[from] TransferError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
