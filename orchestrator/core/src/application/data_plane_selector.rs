// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Capability Registry
//!
//! Keeps the set of registered data plane workers and resolves a transfer
//! request to one of them. The registry never talks to workers; it only
//! advises the orchestrator which one to use.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Registry control surface and deterministic selection

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::data_plane::{select_instance, DataPlaneInstance, DataPlaneInstanceId, SelectionError, SelectionRequest};
use crate::domain::events::DataPlaneEvent;
use crate::domain::repository::DataPlaneInstanceRepository;
use crate::infrastructure::event_bus::EventBus;

#[async_trait]
pub trait DataPlaneSelector: Send + Sync {
    /// Insert or replace an instance; returns whether an entry was replaced
    async fn register(&self, instance: DataPlaneInstance) -> Result<bool, SelectionError>;

    /// Idempotent: unknown ids are not an error
    async fn deregister(&self, id: &DataPlaneInstanceId) -> Result<(), SelectionError>;

    async fn select(&self, request: &SelectionRequest) -> Result<DataPlaneInstance, SelectionError>;

    async fn find(&self, id: &DataPlaneInstanceId) -> Result<Option<DataPlaneInstance>, SelectionError>;

    async fn list(&self) -> Result<Vec<DataPlaneInstance>, SelectionError>;

    /// Refresh liveness and, when reported, the in-flight load
    async fn heartbeat(&self, id: &DataPlaneInstanceId, load: Option<u32>) -> Result<(), SelectionError>;

    /// Remove instances not seen within the liveness timeout
    async fn evict_stale(&self, now: DateTime<Utc>) -> Result<Vec<DataPlaneInstanceId>, SelectionError>;
}

pub struct StandardDataPlaneSelector {
    repository: Arc<dyn DataPlaneInstanceRepository>,
    event_bus: Arc<EventBus>,
    liveness_timeout: Option<Duration>,
}

impl StandardDataPlaneSelector {
    pub fn new(
        repository: Arc<dyn DataPlaneInstanceRepository>,
        event_bus: Arc<EventBus>,
        liveness_timeout: Option<Duration>,
    ) -> Self {
        Self {
            repository,
            event_bus,
            liveness_timeout,
        }
    }
}

#[async_trait]
impl DataPlaneSelector for StandardDataPlaneSelector {
    async fn register(&self, mut instance: DataPlaneInstance) -> Result<bool, SelectionError> {
        instance.validate()?;

        let now = Utc::now();
        instance.registered_at = now;
        instance.last_seen = now;

        let replaced = self.repository.save(&instance).await?;
        info!(
            instance_id = %instance.id,
            capabilities = instance.capabilities().len(),
            replaced,
            "Data plane registered"
        );

        self.event_bus.publish_data_plane_event(DataPlaneEvent::Registered {
            instance_id: instance.id,
            replaced,
            registered_at: now,
        });
        Ok(replaced)
    }

    async fn deregister(&self, id: &DataPlaneInstanceId) -> Result<(), SelectionError> {
        if self.repository.delete(id).await? {
            info!(instance_id = %id, "Data plane deregistered");
            self.event_bus.publish_data_plane_event(DataPlaneEvent::Deregistered {
                instance_id: id.clone(),
                deregistered_at: Utc::now(),
            });
        } else {
            debug!(instance_id = %id, "Deregistration of unknown data plane ignored");
        }
        Ok(())
    }

    async fn select(&self, request: &SelectionRequest) -> Result<DataPlaneInstance, SelectionError> {
        let instances = self.repository.list_all().await?;
        match select_instance(&instances, request, Utc::now(), self.liveness_timeout) {
            Some(instance) => {
                metrics::counter!("data_plane_selections_total", "outcome" => "selected").increment(1);
                debug!(
                    instance_id = %instance.id,
                    transfer_type = %request.transfer_type,
                    "Data plane selected"
                );
                Ok(instance.clone())
            }
            None => {
                metrics::counter!("data_plane_selections_total", "outcome" => "not_found").increment(1);
                Err(SelectionError::NotFound(request.transfer_type.clone()))
            }
        }
    }

    async fn find(&self, id: &DataPlaneInstanceId) -> Result<Option<DataPlaneInstance>, SelectionError> {
        Ok(self.repository.find_by_id(id).await?)
    }

    async fn list(&self) -> Result<Vec<DataPlaneInstance>, SelectionError> {
        Ok(self.repository.list_all().await?)
    }

    async fn heartbeat(&self, id: &DataPlaneInstanceId, load: Option<u32>) -> Result<(), SelectionError> {
        if self.repository.touch(id, Utc::now(), load).await? {
            Ok(())
        } else {
            Err(SelectionError::UnknownInstance(id.clone()))
        }
    }

    async fn evict_stale(&self, now: DateTime<Utc>) -> Result<Vec<DataPlaneInstanceId>, SelectionError> {
        let Some(timeout) = self.liveness_timeout else {
            return Ok(Vec::new());
        };
        let cutoff = now - timeout;

        let mut evicted = Vec::new();
        for instance in self.repository.list_all().await? {
            if instance.is_live(now, self.liveness_timeout) {
                continue;
            }
            // Rechecked in the delete; a heartbeat since the listing wins
            if self.repository.delete_if_stale(&instance.id, cutoff).await? {
                info!(instance_id = %instance.id, last_seen = %instance.last_seen, "Evicted stale data plane");
                self.event_bus.publish_data_plane_event(DataPlaneEvent::Evicted {
                    instance_id: instance.id.clone(),
                    last_seen: instance.last_seen,
                    evicted_at: now,
                });
                evicted.push(instance.id);
            }
        }
        Ok(evicted)
    }
}
