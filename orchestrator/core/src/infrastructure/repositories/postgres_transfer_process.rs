// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PostgreSQL transfer process store.
//!
//! The aggregate is kept as a JSONB payload. Everything the claim predicate
//! needs (state, timestamps, pending command, lease, version) is duplicated
//! into plain columns; on read the lease and version columns win over the
//! payload copy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

use crate::domain::repository::{LeaseRequest, RepositoryError, TransferProcessQuery, TransferProcessRepository};
use crate::domain::transfer::{Lease, TransferCommand, TransferProcess, TransferProcessId, TransferSignal};
use crate::domain::transfer_state::TransferState;

pub struct PostgresTransferProcessRepository {
    pool: PgPool,
}

impl PostgresTransferProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_process(row: &PgRow) -> Result<TransferProcess, RepositoryError> {
        let payload: serde_json::Value = row.try_get("payload")?;
        let mut process: TransferProcess = serde_json::from_value(payload)?;

        let holder: Option<String> = row.try_get("lease_holder")?;
        let expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let version: i64 = row.try_get("version")?;

        process.lease = match (holder, expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
            _ => None,
        };
        process.version = version as u64;
        Ok(process)
    }

    fn state_names(states: &[TransferState]) -> Vec<String> {
        states.iter().map(|s| s.as_str().to_string()).collect()
    }

    async fn exists(&self, id: &TransferProcessId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM transfer_processes WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn command_name(command: Option<TransferCommand>) -> Option<&'static str> {
    command.map(|c| match c {
        TransferCommand::Cancel => "cancel",
        TransferCommand::Suspend => "suspend",
        TransferCommand::Resume => "resume",
    })
}

const SELECT_COLUMNS: &str = "payload, lease_holder, lease_expires_at, version";

#[async_trait]
impl TransferProcessRepository for PostgresTransferProcessRepository {
    async fn create(&self, process: &TransferProcess) -> Result<(), RepositoryError> {
        let payload = serde_json::to_value(process)?;

        let result = sqlx::query(
            r#"
            INSERT INTO transfer_processes (
                id, data_request_id, process_type, agreement_id, state, state_timestamp,
                retry_at, pending_command, has_completion, lease_holder, lease_expires_at,
                version, created_at, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(process.id.as_str())
        .bind(&process.data_request.id)
        .bind(process.process_type.as_str())
        .bind(&process.data_request.agreement_id)
        .bind(process.state().as_str())
        .bind(process.state_timestamp())
        .bind(process.retry_at)
        .bind(command_name(process.pending_command()))
        .bind(process.completion().is_some())
        .bind(process.version as i64)
        .bind(process.created_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(process.id.to_string()));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: &TransferProcessId) -> Result<Option<TransferProcess>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM transfer_processes WHERE id = $1", SELECT_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_process).transpose()
    }

    async fn find_by_data_request_id(&self, data_request_id: &str) -> Result<Option<TransferProcess>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_processes WHERE data_request_id = $1 ORDER BY created_at LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(data_request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_process).transpose()
    }

    async fn next_for_state(
        &self,
        states: &[TransferState],
        batch_size: usize,
        lease: &LeaseRequest,
    ) -> Result<Vec<TransferProcess>, RepositoryError> {
        // SKIP LOCKED keeps concurrent claimers from blocking on, or double
        // claiming, the same candidate rows
        let rows = sqlx::query(&format!(
            r#"
            UPDATE transfer_processes
            SET lease_holder = $3, lease_expires_at = $4, version = version + 1
            WHERE id IN (
                SELECT id FROM transfer_processes
                WHERE state = ANY($1)
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $2)
                  AND (state <> 'SUSPENDED' OR pending_command IS NOT NULL)
                  AND (
                      retry_at IS NULL OR retry_at <= $2
                      OR pending_command = 'cancel'
                      OR (state = 'STARTED' AND has_completion)
                  )
                ORDER BY state_timestamp, id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(Self::state_names(states))
        .bind(lease.now)
        .bind(&lease.holder)
        .bind(lease.expires_at())
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows.iter().map(Self::row_to_process).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| {
            a.state_timestamp()
                .cmp(&b.state_timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(claimed)
    }

    async fn update(&self, process: &TransferProcess) -> Result<(), RepositoryError> {
        let holder = process
            .lease
            .as_ref()
            .map(|lease| lease.holder.clone())
            .ok_or_else(|| RepositoryError::Conflict(process.id.to_string()))?;
        let payload = serde_json::to_value(process)?;

        let result = sqlx::query(
            r#"
            UPDATE transfer_processes
            SET state = $2, state_timestamp = $3, retry_at = $4, pending_command = $5,
                has_completion = $6, payload = $7,
                lease_holder = NULL, lease_expires_at = NULL, version = version + 1
            WHERE id = $1 AND version = $8 AND lease_holder = $9
            "#,
        )
        .bind(process.id.as_str())
        .bind(process.state().as_str())
        .bind(process.state_timestamp())
        .bind(process.retry_at)
        .bind(command_name(process.pending_command()))
        .bind(process.completion().is_some())
        .bind(payload)
        .bind(process.version as i64)
        .bind(holder)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.exists(&process.id).await? {
                return Err(RepositoryError::Conflict(process.id.to_string()));
            }
            return Err(RepositoryError::NotFound(process.id.to_string()));
        }
        Ok(())
    }

    async fn release(&self, id: &TransferProcessId, holder: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE transfer_processes
            SET lease_holder = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(id.as_str())
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_signal(&self, id: &TransferProcessId, signal: &TransferSignal) -> Result<TransferProcess, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_processes WHERE id = $1 FOR UPDATE",
            SELECT_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        let mut process = Self::row_to_process(&row)?;
        if !process.accept_signal(signal)? {
            tx.commit().await?;
            return Ok(process);
        }

        let payload = serde_json::to_value(&process)?;
        let version: i64 = sqlx::query_scalar(
            r#"
            UPDATE transfer_processes
            SET pending_command = $2, has_completion = $3, payload = $4, version = version + 1
            WHERE id = $1
            RETURNING version
            "#,
        )
        .bind(id.as_str())
        .bind(command_name(process.pending_command()))
        .bind(process.completion().is_some())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        process.version = version as u64;
        Ok(process)
    }

    async fn count_by_state(&self) -> Result<HashMap<TransferState, usize>, RepositoryError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM transfer_processes GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let total: i64 = row.try_get("total")?;
            let state = TransferState::from_str(&state).map_err(RepositoryError::Serialization)?;
            counts.insert(state, total as usize);
        }
        Ok(counts)
    }

    async fn query(&self, query: &TransferProcessQuery) -> Result<Vec<TransferProcess>, RepositoryError> {
        let states = (!query.states.is_empty()).then(|| Self::state_names(&query.states));

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transfer_processes
            WHERE ($1::text[] IS NULL OR state = ANY($1))
              AND ($2::text IS NULL OR process_type = $2)
              AND ($3::text IS NULL OR agreement_id = $3)
            ORDER BY created_at, id
            LIMIT $4
            "#,
            SELECT_COLUMNS
        ))
        .bind(states)
        .bind(query.process_type.map(|t| t.as_str()))
        .bind(query.agreement_id.as_deref())
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_process).collect()
    }
}
