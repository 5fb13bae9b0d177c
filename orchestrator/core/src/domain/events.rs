// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::data_plane::DataPlaneInstanceId;
use crate::domain::transfer::{TransferProcessId, TransferProcessType};
use crate::domain::transfer_state::TransferState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferProcessEvent {
    Created {
        process_id: TransferProcessId,
        process_type: TransferProcessType,
        agreement_id: String,
        created_at: DateTime<Utc>,
    },
    StateChanged {
        process_id: TransferProcessId,
        from: TransferState,
        to: TransferState,
        state_count: u32,
        changed_at: DateTime<Utc>,
    },
    Suspended {
        process_id: TransferProcessId,
        suspended_from: TransferState,
        suspended_at: DateTime<Utc>,
    },
    Resumed {
        process_id: TransferProcessId,
        resumed_to: TransferState,
        resumed_at: DateTime<Utc>,
    },
    Completed {
        process_id: TransferProcessId,
        completed_at: DateTime<Utc>,
    },
    Terminated {
        process_id: TransferProcessId,
        error_detail: Option<String>,
        terminated_at: DateTime<Utc>,
    },
}

impl TransferProcessEvent {
    pub fn process_id(&self) -> &TransferProcessId {
        match self {
            TransferProcessEvent::Created { process_id, .. }
            | TransferProcessEvent::StateChanged { process_id, .. }
            | TransferProcessEvent::Suspended { process_id, .. }
            | TransferProcessEvent::Resumed { process_id, .. }
            | TransferProcessEvent::Completed { process_id, .. }
            | TransferProcessEvent::Terminated { process_id, .. } => process_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataPlaneEvent {
    Registered {
        instance_id: DataPlaneInstanceId,
        replaced: bool,
        registered_at: DateTime<Utc>,
    },
    Deregistered {
        instance_id: DataPlaneInstanceId,
        deregistered_at: DateTime<Utc>,
    },
    Evicted {
        instance_id: DataPlaneInstanceId,
        last_seen: DateTime<Utc>,
        evicted_at: DateTime<Utc>,
    },
}
