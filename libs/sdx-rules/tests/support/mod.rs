//! Shared fixtures for the rule manager integration tests
//!
//! Recording collaborators, a small tunnel rule type and a manager opened on a
//! temporary on-disk database with a manual clock.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::sqlite::SqliteClient;
use sdx_rules::{
    AuthorizationInspector, Breakdown, Collaborators, DispatchSink, LcRule, ManagerConfig,
    ManualTimeProvider, Policy, PolicyContext, PolicyRegistry, ResourceRegistry, Rule,
    RuleCallback, RuleHash, RuleManager, RuleState, ValidityInspector,
};

pub const TUNNEL: &str = "l2tunnel";

/// Point-to-point tunnel crossing one or more local controllers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub src: String,
    pub dst: String,
    pub vlan: u16,
    pub lcs: Vec<String>,
}

#[async_trait]
impl Policy for Tunnel {
    fn rule_type(&self) -> &str {
        TUNNEL
    }

    fn to_json(&self) -> Value {
        json!({ TUNNEL: { "src": self.src, "dst": self.dst, "vlan": self.vlan } })
    }

    fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn breakdown(&self) -> Result<Option<Vec<Breakdown>>> {
        Ok(Some(
            self.lcs
                .iter()
                .map(|lc| {
                    Breakdown::new(lc.clone()).with_rule(LcRule::new(
                        "vlan-forward",
                        json!({ "src": self.src, "dst": self.dst, "vlan": self.vlan }),
                    ))
                })
                .collect(),
        ))
    }

    /// A learned MAC address adds one forwarding entry on each of two LCs
    async fn switch_change(
        &self,
        _rule: &Rule,
        _ctx: &PolicyContext<'_>,
        event: &Value,
    ) -> Result<Option<Vec<Breakdown>>> {
        let Some(mac) = event.get("mac").and_then(Value::as_str) else {
            return Ok(None);
        };
        Ok(Some(vec![
            Breakdown::new("lc-1").with_rule(LcRule::new("mac-learn", json!({ "mac": mac }))),
            Breakdown::new("lc-2").with_rule(LcRule::new("mac-learn", json!({ "mac": mac }))),
        ]))
    }
}

pub fn tunnel(user: &str) -> Rule {
    Rule::new(
        user,
        Arc::new(Tunnel {
            src: "sw1:1".to_string(),
            dst: "sw2:1".to_string(),
            vlan: 100,
            lcs: vec!["lc-1".to_string(), "lc-2".to_string()],
        }),
    )
    .with_resources(["sw1:1/vlan100", "sw2:1/vlan100"])
}

pub fn registry() -> PolicyRegistry {
    PolicyRegistry::new().with::<Tunnel>(TUNNEL)
}

#[derive(Default)]
pub struct RecordingSink {
    pub pushed: Mutex<Vec<Breakdown>>,
    pub retracted: Mutex<Vec<Breakdown>>,
    pub fail_push: AtomicBool,
}

impl RecordingSink {
    pub fn pushed(&self) -> Vec<Breakdown> {
        self.pushed.lock().clone()
    }

    pub fn retracted(&self) -> Vec<Breakdown> {
        self.retracted.lock().clone()
    }

    pub fn fail_pushes(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    /// Pushes minus retracts on `lc`; zero when nothing is left programmed
    pub fn programmed(&self, lc: &str) -> i64 {
        let count = |list: &Mutex<Vec<Breakdown>>| {
            list.lock().iter().filter(|bd| bd.lc == lc).count() as i64
        };
        count(&self.pushed) - count(&self.retracted)
    }
}

#[async_trait]
impl DispatchSink for RecordingSink {
    async fn push_breakdown(&self, breakdown: &Breakdown) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            bail!("{} unreachable", breakdown.lc);
        }
        self.pushed.lock().push(breakdown.clone());
        Ok(())
    }

    async fn retract_breakdown(&self, breakdown: &Breakdown) -> Result<()> {
        self.retracted.lock().push(breakdown.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRegistry {
    pub reserved: Mutex<Vec<String>>,
    pub unreserved: Mutex<Vec<String>>,
    fail_unreserve: Mutex<Option<String>>,
}

impl RecordingRegistry {
    pub fn reserved(&self) -> Vec<String> {
        self.reserved.lock().clone()
    }

    pub fn unreserved(&self) -> Vec<String> {
        self.unreserved.lock().clone()
    }

    /// Make the next unreserve of `resource` fail
    pub fn fail_next_unreserve(&self, resource: &str) {
        *self.fail_unreserve.lock() = Some(resource.to_string());
    }

    /// Reservations minus releases per resource; zero everywhere once every
    /// reservation was released exactly once
    pub fn held(&self, resource: &str) -> i64 {
        let count = |list: &Mutex<Vec<String>>| {
            list.lock().iter().filter(|r| r.as_str() == resource).count() as i64
        };
        count(&self.reserved) - count(&self.unreserved)
    }
}

#[async_trait]
impl ResourceRegistry for RecordingRegistry {
    async fn reserve_resource(&self, resource: &str) -> Result<()> {
        self.reserved.lock().push(resource.to_string());
        Ok(())
    }

    async fn unreserve_resource(&self, resource: &str) -> Result<()> {
        {
            let mut fail = self.fail_unreserve.lock();
            if fail.as_deref() == Some(resource) {
                *fail = None;
                bail!("registry refused to release {}", resource);
            }
        }
        self.unreserved.lock().push(resource.to_string());
        Ok(())
    }
}

/// Authorizes everybody except the denied users
#[derive(Default)]
pub struct DenyList {
    denied: Mutex<HashSet<String>>,
}

impl DenyList {
    pub fn deny(&self, user: &str) {
        self.denied.lock().insert(user.to_string());
    }
}

#[async_trait]
impl AuthorizationInspector for DenyList {
    async fn is_authorized(&self, user: &str, _rule: &Rule) -> Result<bool> {
        Ok(!self.denied.lock().contains(user))
    }
}

/// Validity inspector that can be switched off
pub struct Switchable {
    valid: AtomicBool,
}

impl Default for Switchable {
    fn default() -> Self {
        Self {
            valid: AtomicBool::new(true),
        }
    }
}

impl Switchable {
    pub fn set(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }
}

#[async_trait]
impl ValidityInspector for Switchable {
    async fn is_valid_rule(&self, rule: &Rule) -> Result<bool> {
        Ok(self.valid.load(Ordering::SeqCst) && rule.policy().validate()?)
    }
}

/// Observer recording (hash, state) for every rule it sees
#[derive(Default)]
pub struct Seen {
    pub events: Mutex<Vec<(Option<RuleHash>, Option<RuleState>)>>,
}

impl Seen {
    pub fn callback(self: &Arc<Self>) -> RuleCallback {
        let seen = Arc::clone(self);
        Arc::new(move |rule: &Rule| seen.events.lock().push((rule.hash(), rule.state())))
    }

    pub fn events(&self) -> Vec<(Option<RuleHash>, Option<RuleState>)> {
        self.events.lock().clone()
    }

    /// Poll until at least `count` events were recorded
    pub async fn wait_for(&self, count: usize) -> Vec<(Option<RuleHash>, Option<RuleState>)> {
        for _ in 0..100 {
            if self.events.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.events()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub manager: RuleManager,
    pub sink: Arc<RecordingSink>,
    pub resources: Arc<RecordingRegistry>,
    pub auth: Arc<DenyList>,
    pub validity: Arc<Switchable>,
    pub clock: Arc<ManualTimeProvider>,
    pub db_path: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sdxctlr.db");
        let clock = Arc::new(ManualTimeProvider::new(epoch()));
        let sink = Arc::new(RecordingSink::default());
        let resources = Arc::new(RecordingRegistry::default());
        let auth = Arc::new(DenyList::default());
        let validity = Arc::new(Switchable::default());

        let manager = open(
            &db_path,
            &clock,
            Some(sink.clone()),
            resources.clone(),
            auth.clone(),
            validity.clone(),
        )
        .await;

        Self {
            manager,
            sink,
            resources,
            auth,
            validity,
            clock,
            db_path,
            _dir: dir,
        }
    }

    /// Open a second manager on the same database, as after a restart
    pub async fn restart(&mut self) {
        self.manager.shutdown().await;
        self.manager = open(
            &self.db_path,
            &self.clock,
            Some(self.sink.clone()),
            self.resources.clone(),
            self.auth.clone(),
            self.validity.clone(),
        )
        .await;
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub async fn state_of(&self, hash: RuleHash) -> Option<RuleState> {
        self.manager
            .get_rules(Some(&json!({ "hash": hash })), None)
            .await
            .unwrap()
            .first()
            .map(|r| r.state)
    }

    /// Poll until the rule reaches `state` or two seconds pass
    pub async fn wait_for_state(&self, hash: RuleHash, state: RuleState) {
        for _ in 0..100 {
            if self.state_of(hash).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "rule {} never reached {:?} (now {:?})",
            hash,
            state,
            self.state_of(hash).await
        );
    }
}

pub async fn open(
    db_path: &Path,
    clock: &Arc<ManualTimeProvider>,
    sink: Option<Arc<RecordingSink>>,
    resources: Arc<RecordingRegistry>,
    auth: Arc<DenyList>,
    validity: Arc<Switchable>,
) -> RuleManager {
    let client = SqliteClient::new(db_path).await.unwrap();

    let mut collaborators = Collaborators::new(auth, resources).with_validity(validity);
    if let Some(sink) = sink {
        collaborators = collaborators.with_dispatch(sink);
    }

    let config = ManagerConfig {
        db_path: db_path.to_path_buf(),
        retry_delay_ms: 50,
        ..Default::default()
    };

    RuleManager::with_time_provider(
        client.pool().clone(),
        collaborators,
        registry(),
        config,
        clock.clone(),
    )
    .await
    .unwrap()
}
