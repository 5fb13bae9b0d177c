// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on storage backend configuration,
//! keeping the domain layer free of infrastructure dependencies:
//! - Domain layer: defines repository traits
//! - Application layer: picks an implementation per backend
//! - Infrastructure layer: provides the implementations
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Wire repositories for the configured backend

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::domain::repository::{DataPlaneInstanceRepository, StorageBackend, TransferProcessRepository};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::{
    InMemoryDataPlaneInstanceRepository, InMemoryTransferProcessRepository, PostgresDataPlaneInstanceRepository,
    PostgresTransferProcessRepository,
};

/// Both repositories of the connector core, built for one backend.
#[derive(Clone)]
pub struct Repositories {
    pub transfer_processes: Arc<dyn TransferProcessRepository>,
    pub data_planes: Arc<dyn DataPlaneInstanceRepository>,
}

/// Creates a TransferProcessRepository implementation based on the configured backend
pub fn create_transfer_process_repository(
    backend: &StorageBackend,
    database: Option<&Database>,
) -> Result<Arc<dyn TransferProcessRepository>> {
    match (backend, database) {
        (StorageBackend::InMemory, _) => Ok(Arc::new(InMemoryTransferProcessRepository::new())),
        (StorageBackend::PostgreSQL(_), Some(db)) => Ok(Arc::new(PostgresTransferProcessRepository::new(
            db.get_pool().clone(),
        ))),
        (StorageBackend::PostgreSQL(_), None) => anyhow::bail!("PostgreSQL backend selected without a database pool"),
    }
}

/// Creates a DataPlaneInstanceRepository implementation based on the configured backend
pub fn create_data_plane_repository(
    backend: &StorageBackend,
    database: Option<&Database>,
) -> Result<Arc<dyn DataPlaneInstanceRepository>> {
    match (backend, database) {
        (StorageBackend::InMemory, _) => Ok(Arc::new(InMemoryDataPlaneInstanceRepository::new())),
        (StorageBackend::PostgreSQL(_), Some(db)) => Ok(Arc::new(PostgresDataPlaneInstanceRepository::new(
            db.get_pool().clone(),
        ))),
        (StorageBackend::PostgreSQL(_), None) => anyhow::bail!("PostgreSQL backend selected without a database pool"),
    }
}

/// Connect (and bootstrap the schema) when the backend needs a database,
/// then build both repositories.
pub async fn create_repositories(backend: &StorageBackend) -> Result<Repositories> {
    let database = match backend {
        StorageBackend::InMemory => {
            info!("Using in-memory storage backend");
            None
        }
        StorageBackend::PostgreSQL(config) => {
            info!(max_connections = config.max_connections, "Connecting to PostgreSQL storage backend");
            let database = Database::new(config).await?;
            database.ensure_schema().await?;
            Some(database)
        }
    };

    Ok(Repositories {
        transfer_processes: create_transfer_process_repository(backend, database.as_ref())?,
        data_planes: create_data_plane_repository(backend, database.as_ref())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::PostgresConfig;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let repositories = create_repositories(&StorageBackend::InMemory).await.unwrap();
        assert!(repositories.data_planes.list_all().await.unwrap().is_empty());
        assert!(repositories.transfer_processes.count_by_state().await.unwrap().is_empty());
    }

    #[test]
    fn test_postgres_requires_pool() {
        let backend = StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: "postgres://localhost/dataspace".to_string(),
            max_connections: 2,
        });
        assert!(create_transfer_process_repository(&backend, None).is_err());
        assert!(create_data_plane_repository(&backend, None).is_err());
    }
}
