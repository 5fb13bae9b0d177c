// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Transfer Process State Graph
//!
//! The complete transition graph of a transfer process, expressed as a pure
//! function `(state, event) -> state`. Every mutation of a
//! [`TransferProcess`](crate::domain::transfer::TransferProcess) goes through
//! [`TransferState::next`], so the graph below is the single place where legal
//! moves are defined:
//!
//! ```text
//! INITIAL -> REQUESTING -> REQUESTED -> STARTING -> STARTED -> COMPLETING -> COMPLETED*
//! (any non-terminal, not terminating) -> SUSPENDED -> (resume) prior state
//! (any non-terminal) -> TERMINATING -> TERMINATED*
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Auditable, exhaustively testable transfer lifecycle graph

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Initial,
    Requesting,
    Requested,
    Starting,
    Started,
    Completing,
    Completed,
    Suspended,
    Terminating,
    Terminated,
}

/// Inputs of the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// First processing pass of a freshly created process.
    Begin,
    /// The request (or acknowledgement) reached the counterparty.
    Dispatched,
    /// The usage policy allowed the transfer to start.
    PolicyAllowed,
    /// A data plane accepted the data flow.
    WorkerStarted,
    /// The data plane reported a successful completion.
    WorkerFinished,
    /// Completion bookkeeping is done.
    Finalized,
    /// Re-enter the current state (transient failure or wait).
    Retry,
    Suspend,
    /// Leave `SUSPENDED` towards the recorded prior state.
    Resume(TransferState),
    /// Cancellation or unrecoverable error.
    Terminate,
    /// Termination bookkeeping is done.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: TransferState,
    pub event: TransferEvent,
}

impl TransferState {
    pub const ALL: [TransferState; 10] = [
        TransferState::Initial,
        TransferState::Requesting,
        TransferState::Requested,
        TransferState::Starting,
        TransferState::Started,
        TransferState::Completing,
        TransferState::Completed,
        TransferState::Suspended,
        TransferState::Terminating,
        TransferState::Terminated,
    ];

    /// States an orchestrator worker polls for.
    pub const ACTIONABLE: [TransferState; 8] = [
        TransferState::Initial,
        TransferState::Requesting,
        TransferState::Requested,
        TransferState::Starting,
        TransferState::Started,
        TransferState::Completing,
        TransferState::Suspended,
        TransferState::Terminating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Initial => "INITIAL",
            TransferState::Requesting => "REQUESTING",
            TransferState::Requested => "REQUESTED",
            TransferState::Starting => "STARTING",
            TransferState::Started => "STARTED",
            TransferState::Completing => "COMPLETING",
            TransferState::Completed => "COMPLETED",
            TransferState::Suspended => "SUSPENDED",
            TransferState::Terminating => "TERMINATING",
            TransferState::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Terminated)
    }

    pub fn can_suspend(&self) -> bool {
        !self.is_terminal()
            && !matches!(self, TransferState::Suspended | TransferState::Terminating)
    }

    /// States that may be re-entered after a transient failure or while waiting
    /// on an external party.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferState::Requesting
                | TransferState::Requested
                | TransferState::Starting
                | TransferState::Started
                | TransferState::Completing
                | TransferState::Terminating
        )
    }

    /// The transition function. Returns the target state or the rejected
    /// `(state, event)` pair.
    pub fn next(self, event: TransferEvent) -> Result<TransferState, InvalidTransition> {
        use TransferEvent as E;
        use TransferState as S;

        let target = match (self, event) {
            (S::Initial, E::Begin) => Some(S::Requesting),
            (S::Requesting, E::Dispatched) => Some(S::Requested),
            (S::Requested, E::PolicyAllowed) => Some(S::Starting),
            (S::Starting, E::WorkerStarted) => Some(S::Started),
            (S::Started, E::WorkerFinished) => Some(S::Completing),
            (S::Completing, E::Finalized) => Some(S::Completed),
            (s, E::Retry) if s.is_retryable() => Some(s),
            (s, E::Suspend) if s.can_suspend() => Some(S::Suspended),
            (S::Suspended, E::Resume(prior)) if prior.can_suspend() => Some(prior),
            (s, E::Terminate) if !s.is_terminal() && s != S::Terminating => Some(S::Terminating),
            (S::Terminating, E::Terminated) => Some(S::Terminated),
            _ => None,
        };

        target.ok_or(InvalidTransition { from: self, event })
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown transfer state: {}", s))
    }
}
