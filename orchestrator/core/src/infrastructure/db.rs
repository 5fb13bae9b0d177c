// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL repository implementations, and owns the
//! idempotent schema bootstrap.

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::domain::repository::PostgresConfig;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transfer_processes (
        id                TEXT PRIMARY KEY,
        data_request_id   TEXT NOT NULL,
        process_type      TEXT NOT NULL,
        agreement_id      TEXT NOT NULL,
        state             TEXT NOT NULL,
        state_timestamp   TIMESTAMPTZ NOT NULL,
        retry_at          TIMESTAMPTZ,
        pending_command   TEXT,
        has_completion    BOOLEAN NOT NULL DEFAULT FALSE,
        lease_holder      TEXT,
        lease_expires_at  TIMESTAMPTZ,
        version           BIGINT NOT NULL DEFAULT 0,
        created_at        TIMESTAMPTZ NOT NULL,
        payload           JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transfer_processes_claim ON transfer_processes (state, state_timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_transfer_processes_data_request ON transfer_processes (data_request_id)",
    r#"
    CREATE TABLE IF NOT EXISTS data_plane_instances (
        id         TEXT PRIMARY KEY,
        url        TEXT NOT NULL,
        last_seen  TIMESTAMPTZ NOT NULL,
        payload    JSONB NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
