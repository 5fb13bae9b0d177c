// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod repositories;
pub mod db;
pub mod event_bus;
pub mod http_dispatch;
pub mod http_data_plane_client;
pub mod policy_store;

pub use event_bus::{DomainEvent, EventBus};
pub use http_data_plane_client::HttpDataPlaneClient;
pub use http_dispatch::HttpDispatchGateway;
pub use policy_store::InMemoryPolicySource;
