// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory policy source keyed by agreement id.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::policy::{PolicySource, PolicySourceError, ResolvedPolicy};

#[derive(Clone, Default)]
pub struct InMemoryPolicySource {
    policies: Arc<RwLock<HashMap<String, ResolvedPolicy>>>,
}

impl InMemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a policy document to an agreement, replacing any previous binding
    pub fn bind(&self, agreement_id: impl Into<String>, policy: Value, attributes: HashMap<String, Value>) {
        self.policies
            .write()
            .insert(agreement_id.into(), ResolvedPolicy { policy, attributes });
    }

    pub fn unbind(&self, agreement_id: &str) -> bool {
        self.policies.write().remove(agreement_id).is_some()
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn resolve(&self, agreement_id: &str) -> Result<Option<ResolvedPolicy>, PolicySourceError> {
        Ok(self.policies.read().get(agreement_id).cloned())
    }
}
