// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Data Plane Liveness Sweeper - Background task evicting silent workers
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodically drives `DataPlaneSelector::evict_stale`

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::data_plane_selector::DataPlaneSelector;

pub struct LivenessSweeper {
    selector: Arc<dyn DataPlaneSelector>,
    sweep_interval: Duration,
    shutdown_token: CancellationToken,
}

impl LivenessSweeper {
    pub fn new(selector: Arc<dyn DataPlaneSelector>, sweep_interval: Duration, shutdown_token: CancellationToken) -> Self {
        Self {
            selector,
            sweep_interval,
            shutdown_token,
        }
    }

    /// Start the sweeper background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval_ms = self.sweep_interval.as_millis() as u64,
            "Starting data plane liveness sweeper"
        );

        let mut tick = interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.selector.evict_stale(Utc::now()).await {
                        Ok(evicted) if evicted.is_empty() => debug!("Liveness sweep found no stale data planes"),
                        Ok(evicted) => info!(evicted = evicted.len(), "Liveness sweep evicted stale data planes"),
                        Err(e) => warn!("Liveness sweep failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping liveness sweeper");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::data_plane_selector::StandardDataPlaneSelector;
    use crate::domain::data_plane::{DataPlaneInstance, TransferTypeCapability};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryDataPlaneInstanceRepository;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_sweeper_stops_on_cancellation() {
        let selector: Arc<dyn DataPlaneSelector> = Arc::new(StandardDataPlaneSelector::new(
            Arc::new(InMemoryDataPlaneInstanceRepository::new()),
            Arc::new(EventBus::new(8)),
            Some(chrono::Duration::milliseconds(1)),
        ));
        let instance = DataPlaneInstance::new(
            "dp-1",
            "http://dp-1",
            vec![TransferTypeCapability::new("blob", "http")],
            HashMap::new(),
        )
        .unwrap();
        selector.register(instance).await.unwrap();

        let token = CancellationToken::new();
        let sweeper = Arc::new(LivenessSweeper::new(selector.clone(), Duration::from_millis(10), token.clone()));
        let handle = sweeper.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(selector.list().await.unwrap().is_empty());
    }
}
