// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Outbound messages to the remote counterparty.
//!
//! The gateway performs exactly one delivery attempt per call. Retries are the
//! orchestrator's business and are driven by the process `state_count`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::transfer::{TransferProcess, TransferProcessId, TransferProcessType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMessageKind {
    /// Consumer asks the provider to transfer
    TransferRequest,
    /// Provider acknowledges and prepares the transfer
    TransferStart,
    TransferCompletion,
    TransferTermination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub kind: RemoteMessageKind,
    pub process_id: TransferProcessId,
    pub data_request_id: String,
    pub agreement_id: String,
    pub connector_address: String,
    pub protocol: String,
    #[serde(default)]
    pub payload: Value,
}

impl RemoteMessage {
    pub fn for_process(kind: RemoteMessageKind, process: &TransferProcess) -> Self {
        let request = &process.data_request;
        let payload = match kind {
            RemoteMessageKind::TransferRequest => serde_json::json!({
                "assetId": request.asset_id,
                "destination": request.destination,
            }),
            RemoteMessageKind::TransferTermination => serde_json::json!({
                "reason": process.error_detail(),
            }),
            RemoteMessageKind::TransferStart | RemoteMessageKind::TransferCompletion => Value::Null,
        };

        Self {
            kind,
            process_id: process.id.clone(),
            data_request_id: request.id.clone(),
            agreement_id: request.agreement_id.clone(),
            connector_address: request.connector_address.clone(),
            protocol: request.protocol.clone(),
            payload,
        }
    }

    /// Opening message for the given side of the exchange.
    pub fn opening_kind(process_type: TransferProcessType) -> RemoteMessageKind {
        match process_type {
            TransferProcessType::Consumer => RemoteMessageKind::TransferRequest,
            TransferProcessType::Provider => RemoteMessageKind::TransferStart,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Worth retrying: timeouts, connection errors, 5xx
    #[error("Transient dispatch failure: {0}")]
    Transient(String),

    /// The counterparty refused the message
    #[error("Message rejected by counterparty: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DispatchGateway: Send + Sync {
    async fn send(&self, message: &RemoteMessage) -> Result<(), DispatchError>;
}
