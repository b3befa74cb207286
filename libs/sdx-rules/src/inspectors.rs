//! Collaborator contracts consumed by the rule manager
//!
//! Validity, breakdown and authorization engines, the resource registry and
//! the dispatch sink towards local controllers are all external services.
//! The composition root builds them once and hands them to the manager in a
//! [`Collaborators`] bundle.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Breakdown, Rule};

/// Decides whether a rule is well formed
#[async_trait]
pub trait ValidityInspector: Send + Sync {
    async fn is_valid_rule(&self, rule: &Rule) -> Result<bool>;
}

/// Decomposes a rule into per local controller breakdowns
#[async_trait]
pub trait BreakdownEngine: Send + Sync {
    async fn get_breakdown(&self, rule: &Rule) -> Result<Option<Vec<Breakdown>>>;
}

/// Decides whether a user may install or remove a rule
#[async_trait]
pub trait AuthorizationInspector: Send + Sync {
    async fn is_authorized(&self, user: &str, rule: &Rule) -> Result<bool>;
}

/// Topology resource bookkeeping keyed by opaque identifiers
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn reserve_resource(&self, resource: &str) -> Result<()>;
    async fn unreserve_resource(&self, resource: &str) -> Result<()>;
}

/// Delivers breakdowns to, and withdraws them from, local controllers
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn push_breakdown(&self, breakdown: &Breakdown) -> Result<()>;
    async fn retract_breakdown(&self, breakdown: &Breakdown) -> Result<()>;
}

/// Validity inspector that asks the rule's own policy
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyValidityInspector;

#[async_trait]
impl ValidityInspector for PolicyValidityInspector {
    async fn is_valid_rule(&self, rule: &Rule) -> Result<bool> {
        rule.policy().validate()
    }
}

/// Breakdown engine that asks the rule's own policy
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyBreakdownEngine;

#[async_trait]
impl BreakdownEngine for PolicyBreakdownEngine {
    async fn get_breakdown(&self, rule: &Rule) -> Result<Option<Vec<Breakdown>>> {
        rule.policy().breakdown()
    }
}

/// Sink used until the owning process wires up its local controller transport
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSink;

#[async_trait]
impl DispatchSink for UnconfiguredSink {
    async fn push_breakdown(&self, breakdown: &Breakdown) -> Result<()> {
        anyhow::bail!(
            "rule manager has no dispatch sink; cannot push breakdown for {}",
            breakdown.lc
        )
    }

    async fn retract_breakdown(&self, breakdown: &Breakdown) -> Result<()> {
        anyhow::bail!(
            "rule manager has no dispatch sink; cannot retract breakdown for {}",
            breakdown.lc
        )
    }
}

/// External services the manager is constructed with
#[derive(Clone)]
pub struct Collaborators {
    pub validity: Arc<dyn ValidityInspector>,
    pub breakdown: Arc<dyn BreakdownEngine>,
    pub authorization: Arc<dyn AuthorizationInspector>,
    pub resources: Arc<dyn ResourceRegistry>,
    pub dispatch: Arc<dyn DispatchSink>,
}

impl Collaborators {
    /// Bundle with policy-delegating validity and breakdown engines and no
    /// dispatch sink yet
    pub fn new(
        authorization: Arc<dyn AuthorizationInspector>,
        resources: Arc<dyn ResourceRegistry>,
    ) -> Self {
        Self {
            validity: Arc::new(PolicyValidityInspector),
            breakdown: Arc::new(PolicyBreakdownEngine),
            authorization,
            resources,
            dispatch: Arc::new(UnconfiguredSink),
        }
    }

    pub fn with_validity(mut self, validity: Arc<dyn ValidityInspector>) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_breakdown_engine(mut self, breakdown: Arc<dyn BreakdownEngine>) -> Self {
        self.breakdown = breakdown;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Arc<dyn DispatchSink>) -> Self {
        self.dispatch = dispatch;
        self
    }
}
