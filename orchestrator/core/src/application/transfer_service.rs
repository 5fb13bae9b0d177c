// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transfer Process Service
//!
//! Control surface exposed to callers: create, cancel, suspend, resume and
//! inspect transfer processes. Every mutation of an existing process goes
//! through `TransferProcessRepository::apply_signal` and is picked up by the
//! orchestrator at its next claim; this service never advances state itself.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Caller-facing operations on the transfer process aggregate

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::data_plane::{DataFlowHandle, TransferOutcome};
use crate::domain::events::TransferProcessEvent;
use crate::domain::repository::{RepositoryError, TransferProcessQuery, TransferProcessRepository};
use crate::domain::transfer::{
    DataRequest, TransferError, TransferProcess, TransferProcessId, TransferProcessType, TransferSignal,
};
use crate::domain::transfer_state::TransferState;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum TransferServiceError {
    #[error("Transfer process not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for TransferServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => TransferServiceError::NotFound(id),
            RepositoryError::Rejected(e) => TransferServiceError::Transfer(e),
            other => TransferServiceError::Repository(other),
        }
    }
}

#[async_trait]
pub trait TransferProcessService: Send + Sync {
    /// Fails fast on a malformed request; no record is created in that case
    async fn create_transfer(
        &self,
        process_type: TransferProcessType,
        data_request: DataRequest,
    ) -> Result<TransferProcessId, TransferServiceError>;

    /// Idempotent; a no-op on terminal or terminating processes
    async fn cancel(&self, id: &TransferProcessId) -> Result<(), TransferServiceError>;

    async fn suspend(&self, id: &TransferProcessId) -> Result<(), TransferServiceError>;

    async fn resume(&self, id: &TransferProcessId) -> Result<(), TransferServiceError>;

    /// Worker completion report; duplicates are ignored
    async fn notify_completion(
        &self,
        id: &TransferProcessId,
        handle: DataFlowHandle,
        outcome: TransferOutcome,
    ) -> Result<(), TransferServiceError>;

    async fn get_status(&self, id: &TransferProcessId) -> Result<TransferProcess, TransferServiceError>;

    async fn get_state(&self, id: &TransferProcessId) -> Result<TransferState, TransferServiceError>;

    async fn find_by_data_request_id(&self, data_request_id: &str) -> Result<Option<TransferProcess>, TransferServiceError>;

    async fn query(&self, query: &TransferProcessQuery) -> Result<Vec<TransferProcess>, TransferServiceError>;

    async fn count_by_state(&self) -> Result<HashMap<TransferState, usize>, TransferServiceError>;
}

pub struct StandardTransferProcessService {
    repository: Arc<dyn TransferProcessRepository>,
    event_bus: Arc<EventBus>,
}

impl StandardTransferProcessService {
    pub fn new(repository: Arc<dyn TransferProcessRepository>, event_bus: Arc<EventBus>) -> Self {
        Self { repository, event_bus }
    }

    async fn signal(&self, id: &TransferProcessId, signal: TransferSignal) -> Result<TransferProcess, TransferServiceError> {
        let process = self.repository.apply_signal(id, &signal).await?;
        debug!(
            process_id = %id,
            state = %process.state(),
            pending = ?process.pending_command(),
            "Signal applied"
        );
        Ok(process)
    }
}

#[async_trait]
impl TransferProcessService for StandardTransferProcessService {
    async fn create_transfer(
        &self,
        process_type: TransferProcessType,
        data_request: DataRequest,
    ) -> Result<TransferProcessId, TransferServiceError> {
        let process = TransferProcess::new(process_type, data_request)?;
        self.repository.create(&process).await?;

        info!(
            process_id = %process.id,
            process_type = process_type.as_str(),
            agreement_id = %process.data_request.agreement_id,
            transfer_type = %process.data_request.transfer_type(),
            "Transfer process created"
        );

        self.event_bus.publish_transfer_event(TransferProcessEvent::Created {
            process_id: process.id.clone(),
            process_type,
            agreement_id: process.data_request.agreement_id.clone(),
            created_at: process.created_at,
        });
        Ok(process.id)
    }

    async fn cancel(&self, id: &TransferProcessId) -> Result<(), TransferServiceError> {
        self.signal(id, TransferSignal::Cancel).await?;
        Ok(())
    }

    async fn suspend(&self, id: &TransferProcessId) -> Result<(), TransferServiceError> {
        self.signal(id, TransferSignal::Suspend).await?;
        Ok(())
    }

    async fn resume(&self, id: &TransferProcessId) -> Result<(), TransferServiceError> {
        self.signal(id, TransferSignal::Resume).await?;
        Ok(())
    }

    async fn notify_completion(
        &self,
        id: &TransferProcessId,
        handle: DataFlowHandle,
        outcome: TransferOutcome,
    ) -> Result<(), TransferServiceError> {
        self.signal(id, TransferSignal::Completion { handle, outcome }).await?;
        Ok(())
    }

    async fn get_status(&self, id: &TransferProcessId) -> Result<TransferProcess, TransferServiceError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| TransferServiceError::NotFound(id.to_string()))
    }

    async fn get_state(&self, id: &TransferProcessId) -> Result<TransferState, TransferServiceError> {
        Ok(self.get_status(id).await?.state())
    }

    async fn find_by_data_request_id(&self, data_request_id: &str) -> Result<Option<TransferProcess>, TransferServiceError> {
        Ok(self.repository.find_by_data_request_id(data_request_id).await?)
    }

    async fn query(&self, query: &TransferProcessQuery) -> Result<Vec<TransferProcess>, TransferServiceError> {
        Ok(self.repository.query(query).await?)
    }

    async fn count_by_state(&self) -> Result<HashMap<TransferState, usize>, TransferServiceError> {
        Ok(self.repository.count_by_state().await?)
    }
}
