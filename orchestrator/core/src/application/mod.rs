// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod transfer_service;
pub mod data_plane_selector;
pub mod transfer_process_manager;
pub mod liveness_sweeper;
pub mod repository_factory;

// Re-export services for convenience
pub use data_plane_selector::{DataPlaneSelector, StandardDataPlaneSelector};
pub use liveness_sweeper::LivenessSweeper;
pub use transfer_process_manager::{ClaimCycle, TransferCollaborators, TransferProcessManager};
pub use transfer_service::{StandardTransferProcessService, TransferProcessService, TransferServiceError};
