//! Rule, breakdown and state types

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RuleError;
use crate::policy::Policy;
use crate::time::normalize;

/// Rule identifier, also used as the cookie on every derived low-level entry
pub type RuleHash = i64;

/// Opaque resource identifier understood by the resource registry
pub type ResourceId = String;

/// Persisted lifecycle state of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Active,
    Inactive,
    Expired,
    /// Defined for completeness; admission rejects before a row could be
    /// written in this state.
    InsufficientPrivileges,
}

impl RuleState {
    /// Value stored in the `state` column
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Active => "active",
            RuleState::Inactive => "inactive",
            RuleState::Expired => "expired",
            RuleState::InsufficientPrivileges => "insufficient_privileges",
        }
    }

    /// Human readable name used in listings
    pub fn display_name(&self) -> &'static str {
        match self {
            RuleState::Active => "ACTIVE RULE",
            RuleState::Inactive => "INACTIVE RULE",
            RuleState::Expired => "EXPIRED RULE",
            RuleState::InsufficientPrivileges => "INSUFFICIENT PRIVILEGES",
        }
    }

    /// Legacy numeric codes (1 = active, 2 = inactive, 3 = expired, 4 = insufficient)
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(RuleState::Active),
            2 => Some(RuleState::Inactive),
            3 => Some(RuleState::Expired),
            4 => Some(RuleState::InsufficientPrivileges),
            _ => None,
        }
    }
}

impl fmt::Display for RuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for RuleState {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "active" | "active_rule" => Ok(RuleState::Active),
            "inactive" | "inactive_rule" => Ok(RuleState::Inactive),
            "expired" | "expired_rule" => Ok(RuleState::Expired),
            "insufficient_privileges" => Ok(RuleState::InsufficientPrivileges),
            _ => Err(RuleError::Validation(format!("unknown rule state '{}'", s))),
        }
    }
}

/// One low-level entry destined for a local controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcRule {
    /// Parent rule hash; set by the manager at admission
    #[serde(default)]
    pub cookie: Option<RuleHash>,
    /// Entry kind understood by the local controller (e.g. "match-action")
    pub kind: String,
    /// Opaque entry body
    #[serde(default)]
    pub body: Value,
}

impl LcRule {
    pub fn new(kind: impl Into<String>, body: Value) -> Self {
        Self {
            cookie: None,
            kind: kind.into(),
            body,
        }
    }
}

impl fmt::Display for LcRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cookie {
            Some(cookie) => write!(f, "{} cookie={} {}", self.kind, cookie, self.body),
            None => write!(f, "{} {}", self.kind, self.body),
        }
    }
}

/// Decomposition of one rule for one local controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    /// Local controller identifier
    pub lc: String,
    /// Ordered low-level entries
    pub rules: Vec<LcRule>,
}

impl Breakdown {
    pub fn new(lc: impl Into<String>) -> Self {
        Self {
            lc: lc.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: LcRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Stamp the parent rule hash on every entry
    pub fn set_cookie(&mut self, cookie: RuleHash) {
        for entry in &mut self.rules {
            entry.cookie = Some(cookie);
        }
    }

    /// `lc:entry` lines for display
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.rules.iter().map(move |r| format!("{}:{}", self.lc, r))
    }
}

/// An abstract network policy submitted by a user
#[derive(Clone)]
pub struct Rule {
    pub(crate) hash: Option<RuleHash>,
    pub(crate) user: String,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) stop_time: Option<DateTime<Utc>>,
    pub(crate) resources: Vec<ResourceId>,
    pub(crate) breakdown: Vec<Breakdown>,
    pub(crate) extended_breakdown: Vec<Breakdown>,
    pub(crate) state: Option<RuleState>,
    pub(crate) policy: Arc<dyn Policy>,
}

impl Rule {
    /// Create an unadmitted rule, bounded in neither direction
    pub fn new(user: impl Into<String>, policy: Arc<dyn Policy>) -> Self {
        Self {
            hash: None,
            user: user.into(),
            start_time: None,
            stop_time: None,
            resources: Vec::new(),
            breakdown: Vec::new(),
            extended_breakdown: Vec::new(),
            state: None,
            policy,
        }
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(normalize(start));
        self
    }

    pub fn with_stop_time(mut self, stop: DateTime<Utc>) -> Self {
        self.stop_time = Some(normalize(stop));
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn hash(&self) -> Option<RuleHash> {
        self.hash
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn rule_type(&self) -> &str {
        self.policy.rule_type()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        self.stop_time
    }

    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    pub fn breakdown(&self) -> &[Breakdown] {
        &self.breakdown
    }

    pub fn extended_breakdown(&self) -> &[Breakdown] {
        &self.extended_breakdown
    }

    /// State at the time the rule was loaded or last transitioned
    pub fn state(&self) -> Option<RuleState> {
        self.state
    }

    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    /// JSON view of the rule, as rendered by its policy
    pub fn to_json(&self) -> Value {
        self.policy.to_json()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("hash", &self.hash)
            .field("rule_type", &self.rule_type())
            .field("user", &self.user)
            .field("start_time", &self.start_time)
            .field("stop_time", &self.stop_time)
            .field("resources", &self.resources)
            .field("state", &self.state)
            .finish()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hash {
            Some(hash) => write!(f, "{}#{} ({})", self.rule_type(), hash, self.user),
            None => write!(f, "{} ({})", self.rule_type(), self.user),
        }
    }
}

/// Row returned by rule listings
#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub hash: RuleHash,
    pub json: Value,
    pub rule_type: String,
    pub user: String,
    pub state: RuleState,
}

/// Rule listing plus its human readable breakdown lines
#[derive(Debug, Clone, Serialize)]
pub struct RuleDetails {
    pub hash: RuleHash,
    pub json: Value,
    pub rule_type: String,
    pub state: RuleState,
    pub user: String,
    /// `lc:entry` lines, base breakdown first, then extended entries
    pub breakdowns: Vec<String>,
}
