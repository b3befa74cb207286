//! Rule-type capability set
//!
//! Every rule kind implements [`Policy`]. The manager only ever talks to
//! rules through this trait, and rebuilds them from storage through a
//! [`PolicyRegistry`] keyed by rule type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::inspectors::{AuthorizationInspector, ResourceRegistry};
use crate::types::{Breakdown, Rule};

/// Collaborators handed to rule-type hooks
#[derive(Clone, Copy)]
pub struct PolicyContext<'a> {
    pub resources: &'a dyn ResourceRegistry,
    pub authorization: &'a dyn AuthorizationInspector,
}

/// Capabilities of one rule kind
#[async_trait]
pub trait Policy: Send + Sync + 'static {
    /// Tag identifying the rule kind; also the registry key
    fn rule_type(&self) -> &str;

    /// JSON view shown to users
    fn to_json(&self) -> Value;

    /// Serialized body, decoded again by the registry entry for `rule_type`
    fn encode(&self) -> anyhow::Result<Value>;

    /// Self-validation of the rule's own fields
    fn validate(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Self-decomposition into per local controller breakdowns
    fn breakdown(&self) -> anyhow::Result<Option<Vec<Breakdown>>> {
        Ok(None)
    }

    /// Runs after the hash is assigned and before the rule is persisted.
    /// Returning an error rejects the rule.
    async fn pre_add(&self, _rule: &Rule, _ctx: &PolicyContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before an authorized removal
    async fn pre_remove(&self, _rule: &Rule, _ctx: &PolicyContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Reacts to a live network event for this rule, possibly returning
    /// additional breakdown entries to install
    async fn switch_change(
        &self,
        _rule: &Rule,
        _ctx: &PolicyContext<'_>,
        _event: &Value,
    ) -> anyhow::Result<Option<Vec<Breakdown>>> {
        Ok(None)
    }
}

type Decoder = Box<dyn Fn(Value) -> anyhow::Result<Arc<dyn Policy>> + Send + Sync>;

/// Maps rule types to decoders for their stored bodies
#[derive(Default)]
pub struct PolicyRegistry {
    decoders: HashMap<String, Decoder>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule kind whose body deserializes straight into `P`
    pub fn register<P>(&mut self, rule_type: impl Into<String>)
    where
        P: Policy + DeserializeOwned,
    {
        self.register_with(rule_type, |body| {
            let policy: P = serde_json::from_value(body)?;
            Ok(Arc::new(policy) as Arc<dyn Policy>)
        });
    }

    /// Register a rule kind with a custom decoder
    pub fn register_with<F>(&mut self, rule_type: impl Into<String>, decoder: F)
    where
        F: Fn(Value) -> anyhow::Result<Arc<dyn Policy>> + Send + Sync + 'static,
    {
        self.decoders.insert(rule_type.into(), Box::new(decoder));
    }

    /// Builder form of [`PolicyRegistry::register`]
    pub fn with<P>(mut self, rule_type: impl Into<String>) -> Self
    where
        P: Policy + DeserializeOwned,
    {
        self.register::<P>(rule_type);
        self
    }

    pub fn contains(&self, rule_type: &str) -> bool {
        self.decoders.contains_key(rule_type)
    }

    pub fn rule_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Rebuild a policy from its stored body
    pub fn decode(&self, rule_type: &str, body: Value) -> Result<Arc<dyn Policy>> {
        let decoder = self.decoders.get(rule_type).ok_or_else(|| {
            RuleError::Serialization(format!("unknown rule type '{}'", rule_type))
        })?;
        decoder(body).map_err(|e| {
            RuleError::Serialization(format!("failed to decode '{}' rule: {}", rule_type, e))
        })
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("rule_types", &self.rule_types())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Mirror {
        port: u16,
    }

    impl Policy for Mirror {
        fn rule_type(&self) -> &str {
            "mirror"
        }

        fn to_json(&self) -> Value {
            json!({ "mirror": { "port": self.port } })
        }

        fn encode(&self) -> anyhow::Result<Value> {
            Ok(serde_json::to_value(self)?)
        }
    }

    #[test]
    fn test_registry_decodes_registered_type() {
        let registry = PolicyRegistry::new().with::<Mirror>("mirror");
        assert!(registry.contains("mirror"));

        let policy = registry.decode("mirror", json!({ "port": 7 })).unwrap();
        assert_eq!(policy.rule_type(), "mirror");
        assert_eq!(policy.to_json()["mirror"]["port"], 7);
        assert!(policy.validate().unwrap());
    }

    #[test]
    fn test_registry_rejects_unknown_and_malformed() {
        let registry = PolicyRegistry::new().with::<Mirror>("mirror");

        let err = registry.decode("l2tunnel", json!({})).err().unwrap();
        assert!(matches!(err, RuleError::Serialization(_)));

        let err = registry.decode("mirror", json!({ "port": "x" })).err().unwrap();
        assert!(matches!(err, RuleError::Serialization(_)));
    }
}
