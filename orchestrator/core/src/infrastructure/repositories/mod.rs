// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! This module provides infrastructure implementations of repository abstractions
//! defined in the domain layer, following the Repository pattern from DDD.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! Shared by every orchestrator worker of a deployment, including workers in
//! other OS processes:
//! - **PostgresTransferProcessRepository** - claim with `FOR UPDATE SKIP LOCKED`,
//!   compare-and-set updates
//! - **PostgresDataPlaneInstanceRepository** - registry entries
//!
//! ## In-Memory Repositories
//!
//! Single-process implementations for development and tests. The claim is
//! atomic because candidate selection and lease assignment happen under one
//! write lock.

pub mod postgres_transfer_process;
pub mod postgres_data_plane;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domain::data_plane::{DataPlaneInstance, DataPlaneInstanceId};
use crate::domain::repository::{
    DataPlaneInstanceRepository, LeaseRequest, RepositoryError, TransferProcessQuery, TransferProcessRepository,
};
use crate::domain::transfer::{Lease, TransferProcess, TransferProcessId, TransferSignal};
use crate::domain::transfer_state::TransferState;

pub use postgres_data_plane::PostgresDataPlaneInstanceRepository;
pub use postgres_transfer_process::PostgresTransferProcessRepository;

#[derive(Clone, Default)]
pub struct InMemoryTransferProcessRepository {
    processes: Arc<RwLock<HashMap<TransferProcessId, TransferProcess>>>,
}

impl InMemoryTransferProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferProcessRepository for InMemoryTransferProcessRepository {
    async fn create(&self, process: &TransferProcess) -> Result<(), RepositoryError> {
        let mut processes = self.processes.write();
        if processes.contains_key(&process.id) {
            return Err(RepositoryError::AlreadyExists(process.id.to_string()));
        }
        processes.insert(process.id.clone(), process.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &TransferProcessId) -> Result<Option<TransferProcess>, RepositoryError> {
        Ok(self.processes.read().get(id).cloned())
    }

    async fn find_by_data_request_id(&self, data_request_id: &str) -> Result<Option<TransferProcess>, RepositoryError> {
        let processes = self.processes.read();
        Ok(processes
            .values()
            .find(|p| p.data_request.id == data_request_id)
            .cloned())
    }

    async fn next_for_state(
        &self,
        states: &[TransferState],
        batch_size: usize,
        lease: &LeaseRequest,
    ) -> Result<Vec<TransferProcess>, RepositoryError> {
        let mut processes = self.processes.write();

        let mut candidates: Vec<(DateTime<Utc>, TransferProcessId)> = processes
            .values()
            .filter(|p| states.contains(&p.state()) && p.is_claimable(lease.now))
            .map(|p| (p.state_timestamp(), p.id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(process) = processes.get_mut(&id) {
                process.lease = Some(Lease {
                    holder: lease.holder.clone(),
                    expires_at: lease.expires_at(),
                });
                process.version += 1;
                claimed.push(process.clone());
            }
        }
        Ok(claimed)
    }

    async fn update(&self, process: &TransferProcess) -> Result<(), RepositoryError> {
        let mut processes = self.processes.write();
        let stored = processes
            .get_mut(&process.id)
            .ok_or_else(|| RepositoryError::NotFound(process.id.to_string()))?;

        let holder_matches = match (&stored.lease, &process.lease) {
            (Some(current), Some(claimed)) => current.holder == claimed.holder,
            _ => false,
        };
        if stored.version != process.version || !holder_matches {
            return Err(RepositoryError::Conflict(process.id.to_string()));
        }

        let mut next = process.clone();
        next.lease = None;
        next.version = stored.version + 1;
        *stored = next;
        Ok(())
    }

    async fn release(&self, id: &TransferProcessId, holder: &str) -> Result<(), RepositoryError> {
        let mut processes = self.processes.write();
        if let Some(stored) = processes.get_mut(id) {
            if stored.lease.as_ref().is_some_and(|lease| lease.holder == holder) {
                stored.lease = None;
            }
        }
        Ok(())
    }

    async fn apply_signal(&self, id: &TransferProcessId, signal: &TransferSignal) -> Result<TransferProcess, RepositoryError> {
        let mut processes = self.processes.write();
        let stored = processes
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;

        let mut next = stored.clone();
        if next.accept_signal(signal)? {
            next.version += 1;
            *stored = next;
        }
        Ok(stored.clone())
    }

    async fn count_by_state(&self) -> Result<HashMap<TransferState, usize>, RepositoryError> {
        let processes = self.processes.read();
        let mut counts = HashMap::new();
        for process in processes.values() {
            *counts.entry(process.state()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn query(&self, query: &TransferProcessQuery) -> Result<Vec<TransferProcess>, RepositoryError> {
        let processes = self.processes.read();
        let mut matching: Vec<TransferProcess> = processes.values().filter(|p| query.matches(p)).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDataPlaneInstanceRepository {
    instances: Arc<RwLock<BTreeMap<DataPlaneInstanceId, DataPlaneInstance>>>,
}

impl InMemoryDataPlaneInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataPlaneInstanceRepository for InMemoryDataPlaneInstanceRepository {
    async fn save(&self, instance: &DataPlaneInstance) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write();
        Ok(instances.insert(instance.id.clone(), instance.clone()).is_some())
    }

    async fn find_by_id(&self, id: &DataPlaneInstanceId) -> Result<Option<DataPlaneInstance>, RepositoryError> {
        Ok(self.instances.read().get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<DataPlaneInstance>, RepositoryError> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn delete(&self, id: &DataPlaneInstanceId) -> Result<bool, RepositoryError> {
        Ok(self.instances.write().remove(id).is_some())
    }

    async fn touch(
        &self,
        id: &DataPlaneInstanceId,
        last_seen: DateTime<Utc>,
        load: Option<u32>,
    ) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write();
        let Some(instance) = instances.get_mut(id) else {
            return Ok(false);
        };
        instance.last_seen = last_seen;
        if load.is_some() {
            instance.load = load;
        }
        Ok(true)
    }

    async fn delete_if_stale(&self, id: &DataPlaneInstanceId, cutoff: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut instances = self.instances.write();
        match instances.get(id) {
            Some(instance) if instance.last_seen < cutoff => Ok(instances.remove(id).is_some()),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::data_plane::{DataFlowHandle, TransferOutcome};
    use crate::domain::transfer::tests::sample_request;
    use crate::domain::transfer::{TransferCommand, TransferProcessType};
    use crate::domain::transfer_state::TransferEvent;
    use chrono::{Duration, Utc};

    fn new_process() -> TransferProcess {
        TransferProcess::new(TransferProcessType::Consumer, sample_request()).unwrap()
    }

    fn lease(holder: &str) -> LeaseRequest {
        LeaseRequest::new(holder, Duration::seconds(60))
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let repo = InMemoryTransferProcessRepository::new();
        let process = new_process();
        repo.create(&process).await.unwrap();
        assert!(matches!(repo.create(&process).await, Err(RepositoryError::AlreadyExists(_))));
        assert!(repo.find_by_data_request_id("req-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let repo = InMemoryTransferProcessRepository::new();
        repo.create(&new_process()).await.unwrap();

        let first = repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w1")).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w2")).await.unwrap();
        assert!(second.is_empty());

        repo.release(&first[0].id, "w2").await.unwrap();
        assert!(repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w2")).await.unwrap().is_empty());

        repo.release(&first[0].id, "w1").await.unwrap();
        assert_eq!(repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed() {
        let repo = InMemoryTransferProcessRepository::new();
        repo.create(&new_process()).await.unwrap();

        let now = Utc::now();
        let short = LeaseRequest::at("w1", Duration::seconds(5), now);
        let claimed = repo.next_for_state(&TransferState::ACTIONABLE, 10, &short).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let later = LeaseRequest::at("w2", Duration::seconds(60), now + Duration::seconds(6));
        let reclaimed = repo.next_for_state(&TransferState::ACTIONABLE, 10, &later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        // The crashed holder's late write must not land
        let mut stale = claimed[0].clone();
        stale.transition(TransferEvent::Begin).unwrap();
        assert!(matches!(repo.update(&stale).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_releases_lease_and_bumps_version() {
        let repo = InMemoryTransferProcessRepository::new();
        repo.create(&new_process()).await.unwrap();

        let mut claimed = repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w1")).await.unwrap();
        let mut process = claimed.remove(0);
        let claimed_version = process.version;
        process.transition(TransferEvent::Begin).unwrap();
        repo.update(&process).await.unwrap();

        let stored = repo.find_by_id(&process.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), TransferState::Requesting);
        assert!(stored.lease.is_none());
        assert_eq!(stored.version, claimed_version + 1);

        // Second write with the same token conflicts
        assert!(matches!(repo.update(&process).await, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_signal_invalidates_current_lease() {
        let repo = InMemoryTransferProcessRepository::new();
        repo.create(&new_process()).await.unwrap();

        let mut claimed = repo.next_for_state(&TransferState::ACTIONABLE, 10, &lease("w1")).await.unwrap();
        let mut process = claimed.remove(0);

        let signalled = repo.apply_signal(&process.id, &TransferSignal::Cancel).await.unwrap();
        assert_eq!(signalled.pending_command(), Some(TransferCommand::Cancel));

        process.transition(TransferEvent::Begin).unwrap();
        assert!(matches!(repo.update(&process).await, Err(RepositoryError::Conflict(_))));

        // Duplicate signals leave the version alone
        let again = repo.apply_signal(&process.id, &TransferSignal::Cancel).await.unwrap();
        assert_eq!(again.version, signalled.version);
    }

    #[tokio::test]
    async fn test_signal_rejection_surfaces() {
        let repo = InMemoryTransferProcessRepository::new();
        let process = new_process();
        repo.create(&process).await.unwrap();

        let completion = TransferSignal::Completion {
            handle: DataFlowHandle::from("unknown"),
            outcome: TransferOutcome::Succeeded,
        };
        assert!(matches!(repo.apply_signal(&process.id, &completion).await, Err(RepositoryError::Rejected(_))));
        assert!(matches!(
            repo.apply_signal(&TransferProcessId::new(), &TransferSignal::Cancel).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_oldest_first_and_batch_bound() {
        let repo = InMemoryTransferProcessRepository::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let process = new_process();
            ids.push(process.id.clone());
            repo.create(&process).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let batch = repo.next_for_state(&TransferState::ACTIONABLE, 2, &lease("w1")).await.unwrap();
        let claimed: Vec<_> = batch.iter().map(|p| p.id.clone()).collect();
        assert_eq!(claimed, ids[..2].to_vec());

        let counts = repo.count_by_state().await.unwrap();
        assert_eq!(counts.get(&TransferState::Initial), Some(&5));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let repo = InMemoryTransferProcessRepository::new();
        let consumer = new_process();
        let provider = TransferProcess::new(TransferProcessType::Provider, sample_request()).unwrap();
        repo.create(&consumer).await.unwrap();
        repo.create(&provider).await.unwrap();

        let query = TransferProcessQuery {
            process_type: Some(TransferProcessType::Provider),
            ..Default::default()
        };
        let found = repo.query(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, provider.id);

        let query = TransferProcessQuery {
            states: vec![TransferState::Completed],
            ..Default::default()
        };
        assert!(repo.query(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_plane_repository_replace_and_delete() {
        let repo = InMemoryDataPlaneInstanceRepository::new();
        let instance = DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![crate::domain::data_plane::TransferTypeCapability::new("blob", "http")],
            HashMap::new(),
        )
        .unwrap();

        assert!(!repo.save(&instance).await.unwrap());
        assert!(repo.save(&instance).await.unwrap());
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
        assert!(repo.delete(&instance.id).await.unwrap());
        assert!(!repo.delete(&instance.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_never_resurrects_or_rewrites_capabilities() {
        let repo = InMemoryDataPlaneInstanceRepository::new();
        let original = DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![crate::domain::data_plane::TransferTypeCapability::new("blob", "http")],
            HashMap::new(),
        )
        .unwrap();
        repo.save(&original).await.unwrap();

        let replacement = DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![crate::domain::data_plane::TransferTypeCapability::new("s3", "http")],
            HashMap::new(),
        )
        .unwrap();
        repo.save(&replacement).await.unwrap();

        let seen = Utc::now() + Duration::seconds(5);
        assert!(repo.touch(&original.id, seen, Some(3)).await.unwrap());
        let stored = repo.find_by_id(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.capabilities(), replacement.capabilities());
        assert_eq!(stored.last_seen, seen);
        assert_eq!(stored.load, Some(3));

        // Load is kept when not reported
        assert!(repo.touch(&original.id, seen, None).await.unwrap());
        assert_eq!(repo.find_by_id(&original.id).await.unwrap().unwrap().load, Some(3));

        repo.delete(&original.id).await.unwrap();
        assert!(!repo.touch(&original.id, seen, None).await.unwrap());
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_if_stale_spares_recently_seen() {
        let repo = InMemoryDataPlaneInstanceRepository::new();
        let instance = DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![crate::domain::data_plane::TransferTypeCapability::new("blob", "http")],
            HashMap::new(),
        )
        .unwrap();
        repo.save(&instance).await.unwrap();

        assert!(!repo.delete_if_stale(&instance.id, instance.last_seen).await.unwrap());
        assert!(repo.find_by_id(&instance.id).await.unwrap().is_some());

        let cutoff = instance.last_seen + Duration::seconds(1);
        assert!(repo.delete_if_stale(&instance.id, cutoff).await.unwrap());
        assert!(!repo.delete_if_stale(&instance.id, cutoff).await.unwrap());
    }
}
