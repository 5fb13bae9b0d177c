// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dataspace transfer core
//!
//! Drives transfer processes between connectors: a durable state machine,
//! data plane selection, policy evaluation at transfer time, and the claim
//! protocol that lets several orchestrator workers share one store.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Library surface consumed by the `dsconnector` binary

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
