// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Usage Policy Evaluation
//!
//! Policies arrive as JSON documents resolved by a [`PolicySource`]. The
//! evaluator is a pure, total function over `(document, context)`: any input
//! yields a decision, and a document that does not parse is denied with
//! `"malformed policy"` instead of surfacing an error to the orchestrator.
//!
//! The default [`RuleBasedPolicyEvaluator`] understands an ODRL-like shape:
//!
//! ```json
//! {
//!   "permissions":  [{ "action": "use", "constraints": [
//!       { "leftOperand": "region", "operator": "in", "rightOperand": ["eu-west", "eu-central"] }
//!   ]}],
//!   "prohibitions": [{ "action": "transfer", "constraints": [
//!       { "or": [ { "leftOperand": "embargoed", "operator": "eq", "rightOperand": true } ] }
//!   ]}],
//!   "obligations":  []
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

/// Action covering every more specific action.
pub const ACTION_USE: &str = "use";

/// Action evaluated before a transfer is started.
pub const ACTION_TRANSFER: &str = "transfer";

pub const MALFORMED_POLICY: &str = "malformed policy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(Vec<String>),
}

impl PolicyDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny(vec![reason.into()])
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny(reasons) => Some(reasons.join("; ")),
        }
    }
}

/// Built per evaluation; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEvaluationContext {
    pub agreement_id: String,
    pub requesting_party: String,
    pub action: String,
    /// Already-resolved attributes, e.g. the requester's region or membership
    pub attributes: HashMap<String, Value>,
}

impl PolicyEvaluationContext {
    pub fn new(agreement_id: impl Into<String>, requesting_party: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            agreement_id: agreement_id.into(),
            requesting_party: requesting_party.into(),
            action: action.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    fn operand(&self, name: &str) -> Option<Value> {
        match name {
            "agreementId" => Some(Value::String(self.agreement_id.clone())),
            "requestingParty" => Some(Value::String(self.requesting_party.clone())),
            "action" => Some(Value::String(self.action.clone())),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

pub trait PolicyEvaluator: Send + Sync {
    fn evaluate(&self, policy: &Value, context: &PolicyEvaluationContext) -> PolicyDecision;
}

// ============================================================================
// Policy model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub permissions: Vec<Rule>,
    #[serde(default)]
    pub prohibitions: Vec<Rule>,
    #[serde(default)]
    pub obligations: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub action: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Rule {
    fn applies_to(&self, action: &str) -> bool {
        self.action == ACTION_USE || self.action == action
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constraint {
    Atomic {
        #[serde(rename = "leftOperand")]
        left_operand: String,
        operator: Operator,
        #[serde(rename = "rightOperand")]
        right_operand: Value,
    },
    And { and: Vec<Constraint> },
    Or { or: Vec<Constraint> },
    Xone { xone: Vec<Constraint> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Geq,
    Lt,
    Leq,
    In,
}

impl Constraint {
    /// Missing operands and incomparable values evaluate to `false`.
    fn holds(&self, context: &PolicyEvaluationContext) -> bool {
        match self {
            Constraint::Atomic { left_operand, operator, right_operand } => context
                .operand(left_operand)
                .is_some_and(|left| apply_operator(*operator, &left, right_operand)),
            Constraint::And { and } => and.iter().all(|c| c.holds(context)),
            Constraint::Or { or } => or.iter().any(|c| c.holds(context)),
            Constraint::Xone { xone } => xone.iter().filter(|c| c.holds(context)).count() == 1,
        }
    }

    fn describe(&self) -> String {
        match self {
            Constraint::Atomic { left_operand, operator, right_operand } => {
                format!("{} {:?} {}", left_operand, operator, right_operand).to_lowercase()
            }
            Constraint::And { and } => format!("and[{}]", and.len()),
            Constraint::Or { or } => format!("or[{}]", or.len()),
            Constraint::Xone { xone } => format!("xone[{}]", xone.len()),
        }
    }

    fn is_well_formed(&self) -> bool {
        match self {
            Constraint::Atomic { left_operand, .. } => !left_operand.trim().is_empty(),
            Constraint::And { and: items } | Constraint::Or { or: items } | Constraint::Xone { xone: items } => {
                !items.is_empty() && items.iter().all(Constraint::is_well_formed)
            }
        }
    }
}

fn apply_operator(operator: Operator, left: &Value, right: &Value) -> bool {
    match operator {
        Operator::Eq => values_equal(left, right),
        Operator::Neq => !values_equal(left, right),
        Operator::Gt => compare(left, right) == Some(Ordering::Greater),
        Operator::Geq => matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => compare(left, right) == Some(Ordering::Less),
        Operator::Leq => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => match right {
            Value::Array(items) => items.iter().any(|item| values_equal(left, item)),
            _ => false,
        },
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        // ISO-8601 timestamps compare correctly as strings
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

impl Policy {
    pub fn parse(document: &Value) -> Option<Policy> {
        let policy: Policy = serde_json::from_value(document.clone()).ok()?;
        let well_formed = policy
            .permissions
            .iter()
            .chain(&policy.prohibitions)
            .chain(&policy.obligations)
            .all(|rule| !rule.action.trim().is_empty() && rule.constraints.iter().all(Constraint::is_well_formed));
        well_formed.then_some(policy)
    }
}

/// Default rule engine.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedPolicyEvaluator;

impl RuleBasedPolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate_policy(&self, policy: &Policy, context: &PolicyEvaluationContext) -> PolicyDecision {
        let action = context.action.as_str();
        let mut reasons = Vec::new();

        for prohibition in policy.prohibitions.iter().filter(|r| r.applies_to(action)) {
            if prohibition.constraints.iter().all(|c| c.holds(context)) {
                reasons.push(format!("action '{}' is prohibited", action));
            }
        }

        let mut permissions = policy.permissions.iter().filter(|r| r.applies_to(action)).peekable();
        if permissions.peek().is_none() {
            reasons.push(format!("no permission grants action '{}'", action));
        }
        for permission in permissions {
            for constraint in permission.constraints.iter().filter(|c| !c.holds(context)) {
                reasons.push(format!("permission constraint not satisfied: {}", constraint.describe()));
            }
        }

        for obligation in policy.obligations.iter().filter(|r| r.applies_to(action)) {
            for constraint in obligation.constraints.iter().filter(|c| !c.holds(context)) {
                reasons.push(format!("obligation not fulfilled: {}", constraint.describe()));
            }
        }

        if reasons.is_empty() {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(reasons)
        }
    }
}

impl PolicyEvaluator for RuleBasedPolicyEvaluator {
    fn evaluate(&self, policy: &Value, context: &PolicyEvaluationContext) -> PolicyDecision {
        match Policy::parse(policy) {
            Some(policy) => self.evaluate_policy(&policy, context),
            None => PolicyDecision::deny(MALFORMED_POLICY),
        }
    }
}

// ============================================================================
// Policy source port
// ============================================================================

/// A policy document plus the attributes needed to evaluate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicy {
    pub policy: Value,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicySourceError {
    #[error("Policy source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `Ok(None)` when no policy is bound to the agreement.
    async fn resolve(&self, agreement_id: &str) -> Result<Option<ResolvedPolicy>, PolicySourceError>;
}
