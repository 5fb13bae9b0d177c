// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer of the connector core.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Aggregates, state graph, selection and policy rules, and the
//!   ports (repositories, gateway, worker client) the application layer drives

pub mod transfer_state;
pub mod transfer;
pub mod data_plane;
pub mod policy;
pub mod dispatch;
pub mod events;
pub mod repository;
pub mod connector_config;
