//! Rule Manager - admission, lifecycle timers, removal and queries
//!
//! SQLite is the single source of truth. Request callers and the two timer
//! tasks mutate rows concurrently; the lifecycle mutex serializes every
//! transition of an existing row. A row's state is only written after its
//! dispatch and resource calls succeeded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{Result, RuleError};
use crate::inspectors::{
    AuthorizationInspector, BreakdownEngine, Collaborators, DispatchSink, ResourceRegistry,
    ValidityInspector,
};
use crate::policy::{PolicyContext, PolicyRegistry};
use crate::query::{RuleFilter, RuleOrdering, SEARCH_FIELDS};
use crate::repository::{self, RuleRow, StoredRule};
use crate::scheduler::{delay_until, Timer, TimerKind};
use crate::time::{normalize, parse_time, SystemTimeProvider, TimeProvider};
use crate::types::{
    Breakdown, LcRule, ResourceId, Rule, RuleDetails, RuleHash, RuleState, RuleSummary,
};

/// Observer invoked with the rule that was installed or removed
pub type RuleCallback = Arc<dyn Fn(&Rule) + Send + Sync>;

#[derive(Default)]
struct Observers {
    install: Vec<RuleCallback>,
    remove: Vec<RuleCallback>,
}

struct Inner {
    pool: SqlitePool,
    validity: Arc<dyn ValidityInspector>,
    breakdown: Arc<dyn BreakdownEngine>,
    authorization: Arc<dyn AuthorizationInspector>,
    resources: Arc<dyn ResourceRegistry>,
    dispatch: RwLock<Arc<dyn DispatchSink>>,
    registry: PolicyRegistry,
    config: ManagerConfig,
    clock: Arc<dyn TimeProvider>,
    /// Serializes transitions of persisted rows
    lifecycle: tokio::sync::Mutex<()>,
    install_timer: Timer,
    remove_timer: Timer,
    observers: RwLock<Observers>,
    stopped: AtomicBool,
}

impl Inner {
    fn timer(&self, kind: TimerKind) -> &Timer {
        match kind {
            TimerKind::Install => &self.install_timer,
            TimerKind::Remove => &self.remove_timer,
        }
    }
}

/// Rule manager handle; clones share the same state
#[derive(Clone)]
pub struct RuleManager {
    inner: Arc<Inner>,
}

impl RuleManager {
    /// Open the manager on `pool` using the system clock
    ///
    /// Creates the schema, purges autogenerated rules, initializes counters
    /// and rearms both timers from the persisted rows.
    pub async fn new(
        pool: SqlitePool,
        collaborators: Collaborators,
        registry: PolicyRegistry,
        config: ManagerConfig,
    ) -> Result<Self> {
        Self::with_time_provider(
            pool,
            collaborators,
            registry,
            config,
            Arc::new(SystemTimeProvider),
        )
        .await
    }

    /// Same as [`RuleManager::new`] with an explicit clock
    pub async fn with_time_provider(
        pool: SqlitePool,
        collaborators: Collaborators,
        registry: PolicyRegistry,
        config: ManagerConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let Collaborators {
            validity,
            breakdown,
            authorization,
            resources,
            dispatch,
        } = collaborators;

        repository::init_schema(&pool).await?;

        match repository::delete_rules_by_user(&pool, &config.autogenerated_user).await {
            Ok(0) => debug!("No autogenerated rules to clean up"),
            Ok(n) => info!("Removed {} autogenerated rules", n),
            Err(e) => warn!("Autogenerated rule cleanup failed: {}", e),
        }

        let now = normalize(clock.now());
        let next_hash = repository::init_config(&pool, &now).await?;

        let rows = repository::load_all_rows(&pool).await?;
        info!(
            "Rule manager started with {} rules, next hash {}",
            rows.len(),
            next_hash
        );
        for row in &rows {
            debug!(
                "Rule {} type={} user={} state={}",
                row.hash,
                row.rule_type,
                row.user,
                row.state.as_str()
            );
        }

        let manager = Self {
            inner: Arc::new(Inner {
                pool,
                validity,
                breakdown,
                authorization,
                resources,
                dispatch: RwLock::new(dispatch),
                registry,
                config,
                clock,
                lifecycle: tokio::sync::Mutex::new(()),
                install_timer: Timer::new(TimerKind::Install),
                remove_timer: Timer::new(TimerKind::Remove),
                observers: RwLock::new(Observers::default()),
                stopped: AtomicBool::new(false),
            }),
        };

        manager.resume_timers().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.inner.registry
    }

    /// Replace the sink used to reach local controllers
    pub fn set_dispatch_sink(&self, sink: Arc<dyn DispatchSink>) {
        *self.inner.dispatch.write() = sink;
        info!("Dispatch sink replaced");
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Validate, break down, authorize, persist and (if due) install a rule
    pub async fn add_rule(&self, mut rule: Rule) -> Result<RuleHash> {
        if let Some(hash) = rule.hash {
            return Err(RuleError::Manager(format!(
                "rule {} has already been admitted",
                hash
            )));
        }

        rule.breakdown = self.check_rule(&rule).await?;

        let hash = repository::next_rule_hash(&self.inner.pool).await?;
        rule.hash = Some(hash);
        for bd in &mut rule.breakdown {
            bd.set_cookie(hash);
        }

        let policy = Arc::clone(&rule.policy);
        policy
            .pre_add(&rule, &self.policy_context())
            .await
            .map_err(|e| RuleError::Rejected(format!("{}: {:#}", rule, e)))?;

        let now = self.now();
        let state = classify(&rule, now);
        if state == RuleState::Active {
            self.install_rule(&rule).await?;
        }

        if let Err(e) = self.persist_new(hash, &rule, state).await {
            if state == RuleState::Active {
                let reserved: Vec<&str> = rule.resources.iter().map(String::as_str).collect();
                self.rollback_install(&rule, self.sink().as_ref(), &reserved, &rule.breakdown)
                    .await;
            }
            return Err(e);
        }
        rule.state = Some(state);
        info!("Rule {} admitted as {}", rule, state.as_str());

        self.touch_last_modified(now).await;
        match state {
            RuleState::Inactive => self.rearm_logged(TimerKind::Install, None).await,
            RuleState::Active if rule.stop_time.is_some() => {
                self.rearm_logged(TimerKind::Remove, None).await
            },
            _ => {},
        }

        self.notify_install(&rule);
        Ok(hash)
    }

    /// Run validation, breakdown and authorization without admitting
    pub async fn test_add_rule(&self, rule: &Rule) -> Result<Vec<Breakdown>> {
        self.check_rule(rule).await
    }

    async fn check_rule(&self, rule: &Rule) -> Result<Vec<Breakdown>> {
        match self.inner.validity.is_valid_rule(rule).await {
            Ok(true) => {},
            Ok(false) => {
                return Err(RuleError::Validation(format!("{} is not valid", rule)));
            },
            Err(e) => return Err(RuleError::Validation(format!("{}: {:#}", rule, e))),
        }

        let breakdown = match self.inner.breakdown.get_breakdown(rule).await {
            Ok(Some(bd)) if !bd.is_empty() => bd,
            Ok(_) => {
                return Err(RuleError::Breakdown(format!(
                    "{} produced no breakdown",
                    rule
                )));
            },
            Err(e) => return Err(RuleError::Breakdown(format!("{}: {:#}", rule, e))),
        };

        match self.inner.authorization.is_authorized(&rule.user, rule).await {
            Ok(true) => Ok(breakdown),
            Ok(false) => Err(RuleError::Authorization(format!(
                "user '{}' may not install {}",
                rule.user, rule
            ))),
            Err(e) => Err(RuleError::Authorization(format!("{}: {:#}", rule, e))),
        }
    }

    async fn persist_new(&self, hash: RuleHash, rule: &Rule, state: RuleState) -> Result<()> {
        let stored = StoredRule::from_rule(rule)?;
        repository::insert_rule(&self.inner.pool, hash, &stored, state).await
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a rule on behalf of `user`
    ///
    /// An active rule is uninstalled first; the row is only deleted once that
    /// succeeded.
    pub async fn remove_rule(&self, hash: RuleHash, user: &str) -> Result<()> {
        let guard = self.inner.lifecycle.lock().await;

        let row = repository::get_rule_row(&self.inner.pool, hash)
            .await?
            .ok_or_else(|| RuleError::NotFound(hash.to_string()))?;
        let rule = row.into_rule(&self.inner.registry)?;

        match self.inner.authorization.is_authorized(user, &rule).await {
            Ok(true) => {},
            Ok(false) => {
                return Err(RuleError::Authorization(format!(
                    "user '{}' may not remove {}",
                    user, rule
                )));
            },
            Err(e) => return Err(RuleError::Authorization(format!("{}: {:#}", rule, e))),
        }

        rule.policy
            .pre_remove(&rule, &self.policy_context())
            .await
            .map_err(|e| RuleError::Rejected(format!("{}: {:#}", rule, e)))?;

        let state = rule.state.unwrap_or(RuleState::Inactive);
        if state == RuleState::Active {
            self.uninstall_rule(&rule).await?;
        }
        if let Err(e) = repository::delete_rule(&self.inner.pool, hash).await {
            if state == RuleState::Active {
                let installed = footprint(&rule);
                self.restore_uninstall(&rule, self.sink().as_ref(), &rule.resources, &installed)
                    .await;
            }
            return Err(e);
        }
        self.touch_last_modified(self.now()).await;
        drop(guard);

        info!("Rule {} removed by {}", rule, user);
        match state {
            RuleState::Active => self.rearm_logged(TimerKind::Remove, None).await,
            RuleState::Inactive => self.rearm_logged(TimerKind::Install, None).await,
            _ => {},
        }

        self.notify_remove(&rule);
        Ok(())
    }

    /// Remove every rule that is not autogenerated, one by one
    pub async fn remove_all_rules(&self, user: &str) -> Result<usize> {
        let rows = repository::load_all_rows(&self.inner.pool).await?;
        let mut removed = 0;
        for row in rows {
            if row.user == self.inner.config.autogenerated_user {
                continue;
            }
            match self.remove_rule(row.hash, user).await {
                Ok(()) => removed += 1,
                Err(RuleError::NotFound(_)) => debug!("Rule {} already gone", row.hash),
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Dynamic extension
    // ========================================================================

    /// Feed a live network event to the rule identified by `cookie`
    ///
    /// Entries returned by the rule's policy are pushed immediately and
    /// appended to its extended breakdown. Rules that are not active ignore
    /// events.
    pub async fn dispatch_change_callback(&self, cookie: RuleHash, event: &Value) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        let row = repository::get_rule_row(&self.inner.pool, cookie)
            .await?
            .ok_or_else(|| RuleError::NotFound(cookie.to_string()))?;
        let rule = row.into_rule(&self.inner.registry)?;
        if rule.state != Some(RuleState::Active) {
            debug!("Ignoring change event for non-active rule {}", rule);
            return Ok(());
        }

        let entries = rule
            .policy
            .switch_change(&rule, &self.policy_context(), event)
            .await
            .map_err(|e| RuleError::Rejected(format!("{}: {:#}", rule, e)))?;
        let mut entries = match entries {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Ok(()),
        };
        for bd in &mut entries {
            bd.set_cookie(cookie);
        }

        let sink = self.sink();
        for (i, bd) in entries.iter().enumerate() {
            if let Err(e) = sink.push_breakdown(bd).await {
                retract_extension(sink.as_ref(), cookie, &entries[..i]).await;
                return Err(RuleError::Dispatch(format!(
                    "push of extension for {} to {} failed: {:#}",
                    cookie, bd.lc, e
                )));
            }
        }

        let mut extended = rule.extended_breakdown.clone();
        extended.extend(entries.iter().cloned());
        let recorded =
            repository::set_extended_breakdown(&self.inner.pool, cookie, &extended).await;
        if let Err(e) = recorded {
            // Entries missing from extendedbd are never retracted on uninstall
            retract_extension(sink.as_ref(), cookie, &entries).await;
            return Err(e);
        }
        self.touch_last_modified(self.now()).await;

        info!("Rule {} extended to {} breakdowns", cookie, extended.len());
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// List rules matching a JSON filter object, optionally ordered by a
    /// column name (`-` prefix for descending)
    pub async fn get_rules(
        &self,
        filter: Option<&Value>,
        ordering: Option<&str>,
    ) -> Result<Vec<RuleSummary>> {
        let filter = RuleFilter::from_json(filter)?;
        let ordering = ordering.map(RuleOrdering::parse).transpose()?;
        repository::list_rules(&self.inner.pool, &filter, ordering.as_ref()).await
    }

    pub async fn get_rule_details(&self, hash: RuleHash) -> Result<Option<RuleDetails>> {
        repository::rule_details(&self.inner.pool, hash).await
    }

    /// Fully decoded rule
    pub async fn get_raw_rule(&self, hash: RuleHash) -> Result<Option<Rule>> {
        repository::get_rule_row(&self.inner.pool, hash)
            .await?
            .map(|row| row.into_rule(&self.inner.registry))
            .transpose()
    }

    pub fn get_rules_search_fields(&self) -> &'static [&'static str] {
        SEARCH_FIELDS
    }

    pub async fn get_breakdown_rules_by_lc(&self, lc: &str) -> Result<Vec<LcRule>> {
        repository::breakdowns_for_lc(&self.inner.pool, lc).await
    }

    pub async fn get_last_modified_timestamp(&self) -> Result<String> {
        repository::last_modified(&self.inner.pool).await
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn register_for_rule_updates(
        &self,
        install: Option<RuleCallback>,
        remove: Option<RuleCallback>,
    ) {
        let mut observers = self.inner.observers.write();
        if let Some(cb) = install {
            observers.install.push(cb);
        }
        if let Some(cb) = remove {
            observers.remove.push(cb);
        }
    }

    /// Remove observers by identity; fails if either was never registered
    pub fn unregister_for_rule_updates(
        &self,
        install: Option<&RuleCallback>,
        remove: Option<&RuleCallback>,
    ) -> Result<()> {
        let mut observers = self.inner.observers.write();

        let install_pos = match install {
            Some(cb) => Some(position(&observers.install, cb).ok_or_else(|| {
                RuleError::Manager("install callback is not registered".to_string())
            })?),
            None => None,
        };
        let remove_pos = match remove {
            Some(cb) => Some(position(&observers.remove, cb).ok_or_else(|| {
                RuleError::Manager("remove callback is not registered".to_string())
            })?),
            None => None,
        };

        if let Some(pos) = install_pos {
            observers.install.remove(pos);
        }
        if let Some(pos) = remove_pos {
            observers.remove.remove(pos);
        }
        Ok(())
    }

    fn notify_install(&self, rule: &Rule) {
        let callbacks = self.inner.observers.read().install.clone();
        for cb in callbacks {
            cb(rule);
        }
    }

    fn notify_remove(&self, rule: &Rule) {
        let callbacks = self.inner.observers.read().remove.clone();
        for cb in callbacks {
            cb(rule);
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Rearm both timers from the persisted rows
    pub async fn resume_timers(&self) -> Result<()> {
        self.inner.stopped.store(false, Ordering::Release);
        self.rearm(TimerKind::Install, None).await?;
        self.rearm(TimerKind::Remove, None).await
    }

    /// Cancel both timers; rows are left untouched
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.install_timer.cancel().await;
        self.inner.remove_timer.cancel().await;
        info!("Rule manager timers stopped");
    }

    /// Time the given timer is armed for, if any
    pub async fn timer_target(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        self.inner.timer(kind).next_time().await
    }

    async fn rearm(&self, kind: TimerKind, floor: Option<Duration>) -> Result<()> {
        let timer = self.inner.timer(kind);
        let mut slot = timer.lock().await;
        slot.cancel();

        if self.inner.stopped.load(Ordering::Acquire) {
            return Ok(());
        }

        let next = repository::earliest_pending(
            &self.inner.pool,
            kind.pending_state(),
            kind.column(),
        )
        .await?;
        let Some(target) = next else {
            debug!("{} timer idle", kind.label());
            return Ok(());
        };

        let delay = delay_until(target, self.now(), floor);
        let generation = slot.generation();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                RuleManager { inner }.fire(kind, generation).await;
            }
        });
        slot.armed(task.abort_handle(), target);

        debug!(
            "{} timer armed for {} (in {}ms)",
            kind.label(),
            target,
            delay.as_millis()
        );
        Ok(())
    }

    /// Rearm, falling back to a retry after `retry_delay_ms` when the pending
    /// rows cannot be read
    async fn rearm_logged(&self, kind: TimerKind, floor: Option<Duration>) {
        if let Err(e) = self.rearm(kind, floor).await {
            error!("Failed to rearm {} timer: {}", kind.label(), e);
            self.arm_retry(kind).await;
        }
    }

    async fn arm_retry(&self, kind: TimerKind) {
        let timer = self.inner.timer(kind);
        let mut slot = timer.lock().await;
        if slot.is_armed() || self.inner.stopped.load(Ordering::Acquire) {
            return;
        }

        let delay = self.inner.config.retry_delay();
        let generation = slot.generation();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                RuleManager { inner }.retry_rearm(kind, generation).await;
            }
        });
        let span = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let retry_at = self.now() + span;
        slot.armed(task.abort_handle(), retry_at);

        warn!(
            "{} timer retrying in {}ms",
            kind.label(),
            delay.as_millis()
        );
    }

    fn retry_rearm(
        self,
        kind: TimerKind,
        generation: u64,
    ) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.inner.timer(kind).claim(generation).await {
                self.rearm_logged(kind, None).await;
            }
        })
    }

    fn fire(self, kind: TimerKind, generation: u64) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            if !self.inner.timer(kind).claim(generation).await {
                return;
            }

            let outcome = match kind {
                TimerKind::Install => self.run_install_pass().await,
                TimerKind::Remove => self.run_remove_pass().await,
            };
            let floor = match outcome {
                Ok(true) => None,
                Ok(false) => Some(self.inner.config.retry_delay()),
                Err(e) => {
                    error!("{} timer pass failed: {}", kind.label(), e);
                    Some(self.inner.config.retry_delay())
                },
            };

            self.rearm_logged(kind, floor).await;
            if kind == TimerKind::Install {
                self.rearm_logged(TimerKind::Remove, None).await;
            }
        })
    }

    /// Activate every inactive rule whose start time has passed.
    /// Returns false if some due rule could not be activated.
    async fn run_install_pass(&self) -> Result<bool> {
        let guard = self.inner.lifecycle.lock().await;
        let now = self.now();
        let rows = repository::load_pending_rows(
            &self.inner.pool,
            RuleState::Inactive,
            TimerKind::Install.column(),
        )
        .await?;

        let mut activated = Vec::new();
        let mut clean = true;
        for row in rows {
            if !is_due(row.start_time.as_deref(), now)? {
                break;
            }
            match self.transition(row, TimerKind::Install).await {
                Ok(Some(rule)) => activated.push(rule),
                Ok(None) => {},
                Err(e) => {
                    error!("Activation failed: {}", e);
                    clean = false;
                },
            }
        }

        if !activated.is_empty() {
            self.touch_last_modified(now).await;
        }
        drop(guard);

        for rule in &activated {
            self.notify_install(rule);
        }
        Ok(clean)
    }

    /// Expire every active rule whose stop time has passed.
    /// Returns false if some due rule could not be expired.
    async fn run_remove_pass(&self) -> Result<bool> {
        let guard = self.inner.lifecycle.lock().await;
        let now = self.now();
        let rows = repository::load_pending_rows(
            &self.inner.pool,
            RuleState::Active,
            TimerKind::Remove.column(),
        )
        .await?;

        let mut expired = Vec::new();
        let mut clean = true;
        for row in rows {
            if !is_due(row.stop_time.as_deref(), now)? {
                break;
            }
            match self.transition(row, TimerKind::Remove).await {
                Ok(Some(rule)) => expired.push(rule),
                Ok(None) => {},
                Err(e) => {
                    error!("Expiry failed: {}", e);
                    clean = false;
                },
            }
        }

        if !expired.is_empty() {
            self.touch_last_modified(now).await;
        }
        drop(guard);

        for rule in &expired {
            self.notify_remove(rule);
        }
        Ok(clean)
    }

    /// Install or uninstall one due row, then commit its new state.
    /// `None` if the row changed underneath us.
    async fn transition(&self, row: RuleRow, kind: TimerKind) -> Result<Option<Rule>> {
        let hash = row.hash;
        let mut rule = row.into_rule(&self.inner.registry)?;
        let (from, to) = (kind.pending_state(), kind.target_state());

        match kind {
            TimerKind::Install => self.install_rule(&rule).await?,
            TimerKind::Remove => self.uninstall_rule(&rule).await?,
        }

        let committed = repository::transition_state(&self.inner.pool, hash, from, to).await;
        if !matches!(committed, Ok(true)) {
            if matches!(committed, Ok(false)) {
                warn!(
                    "Rule {} left {} before the {} timer committed",
                    hash,
                    from.as_str(),
                    kind.label()
                );
            }
            // The row keeps its old state, so the footprint must match it
            let sink = self.sink();
            match kind {
                TimerKind::Install => {
                    let reserved: Vec<&str> = rule.resources.iter().map(String::as_str).collect();
                    self.rollback_install(&rule, sink.as_ref(), &reserved, &rule.breakdown)
                        .await;
                },
                TimerKind::Remove if committed.is_err() => {
                    let installed = footprint(&rule);
                    self.restore_uninstall(&rule, sink.as_ref(), &rule.resources, &installed)
                        .await;
                },
                TimerKind::Remove => {},
            }
            return committed.map(|_| None);
        }

        rule.state = Some(to);
        info!("Rule {} is now {}", rule, to.as_str());
        Ok(Some(rule))
    }

    // ========================================================================
    // Install / uninstall
    // ========================================================================

    /// Reserve resources, then push each breakdown. On failure, whatever this
    /// attempt already did is undone.
    async fn install_rule(&self, rule: &Rule) -> Result<()> {
        let sink = self.sink();

        let mut reserved: Vec<&str> = Vec::with_capacity(rule.resources.len());
        for resource in &rule.resources {
            if let Err(e) = self.inner.resources.reserve_resource(resource).await {
                self.rollback_install(rule, sink.as_ref(), &reserved, &[]).await;
                return Err(RuleError::Resource(format!(
                    "reserve {} for {} failed: {:#}",
                    resource, rule, e
                )));
            }
            reserved.push(resource.as_str());
        }

        for (i, bd) in rule.breakdown.iter().enumerate() {
            if let Err(e) = sink.push_breakdown(bd).await {
                self.rollback_install(rule, sink.as_ref(), &reserved, &rule.breakdown[..i])
                    .await;
                return Err(RuleError::Dispatch(format!(
                    "push of {} to {} failed: {:#}",
                    rule, bd.lc, e
                )));
            }
        }

        debug!("Installed {} ({} breakdowns)", rule, rule.breakdown.len());
        Ok(())
    }

    async fn rollback_install(
        &self,
        rule: &Rule,
        sink: &dyn DispatchSink,
        reserved: &[&str],
        pushed: &[Breakdown],
    ) {
        for bd in pushed.iter().rev() {
            if let Err(e) = sink.retract_breakdown(bd).await {
                warn!("Rollback of {}: retract from {} failed: {:#}", rule, bd.lc, e);
            }
        }
        for resource in reserved.iter().rev() {
            if let Err(e) = self.inner.resources.unreserve_resource(resource).await {
                warn!("Rollback of {}: unreserve {} failed: {:#}", rule, resource, e);
            }
        }
    }

    /// Retract base then extended breakdowns, then release resources. On
    /// failure, whatever this attempt already undid is put back, so the rule
    /// stays fully installed and a retry starts from scratch.
    async fn uninstall_rule(&self, rule: &Rule) -> Result<()> {
        let sink = self.sink();
        let installed = footprint(rule);

        for (i, bd) in installed.iter().enumerate() {
            if let Err(e) = sink.retract_breakdown(bd).await {
                self.restore_uninstall(rule, sink.as_ref(), &[], &installed[..i])
                    .await;
                return Err(RuleError::Dispatch(format!(
                    "retract of {} from {} failed: {:#}",
                    rule, bd.lc, e
                )));
            }
        }

        for (i, resource) in rule.resources.iter().enumerate() {
            if let Err(e) = self.inner.resources.unreserve_resource(resource).await {
                self.restore_uninstall(rule, sink.as_ref(), &rule.resources[..i], &installed)
                    .await;
                return Err(RuleError::Resource(format!(
                    "unreserve {} for {} failed: {:#}",
                    resource, rule, e
                )));
            }
        }

        debug!("Uninstalled {}", rule);
        Ok(())
    }

    /// Re-reserve released resources, then re-push retracted breakdowns
    async fn restore_uninstall(
        &self,
        rule: &Rule,
        sink: &dyn DispatchSink,
        released: &[ResourceId],
        retracted: &[&Breakdown],
    ) {
        for resource in released {
            if let Err(e) = self.inner.resources.reserve_resource(resource).await {
                warn!("Restore of {}: reserve {} failed: {:#}", rule, resource, e);
            }
        }
        for bd in retracted {
            if let Err(e) = sink.push_breakdown(bd).await {
                warn!("Restore of {}: push to {} failed: {:#}", rule, bd.lc, e);
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn now(&self) -> DateTime<Utc> {
        normalize(self.inner.clock.now())
    }

    fn sink(&self) -> Arc<dyn DispatchSink> {
        self.inner.dispatch.read().clone()
    }

    fn policy_context(&self) -> PolicyContext<'_> {
        PolicyContext {
            resources: self.inner.resources.as_ref(),
            authorization: self.inner.authorization.as_ref(),
        }
    }

    async fn touch_last_modified(&self, now: DateTime<Utc>) {
        if let Err(e) = repository::touch_last_modified(&self.inner.pool, &now).await {
            warn!("Failed to update last_modified: {}", e);
        }
    }
}

/// Initial state of a rule admitted at `now`
fn classify(rule: &Rule, now: DateTime<Utc>) -> RuleState {
    if rule.stop_time.is_some_and(|stop| stop <= now) {
        RuleState::Expired
    } else if rule.start_time.is_none_or(|start| start <= now) {
        RuleState::Active
    } else {
        RuleState::Inactive
    }
}

/// Base then extended breakdowns of an installed rule
fn footprint(rule: &Rule) -> Vec<&Breakdown> {
    rule.breakdown
        .iter()
        .chain(rule.extended_breakdown.iter())
        .collect()
}

/// Withdraw freshly pushed extension entries, newest first
async fn retract_extension(sink: &dyn DispatchSink, cookie: RuleHash, entries: &[Breakdown]) {
    for bd in entries.iter().rev() {
        if let Err(e) = sink.retract_breakdown(bd).await {
            warn!("Rule {} retract of {} failed: {:#}", cookie, bd.lc, e);
        }
    }
}

fn is_due(time: Option<&str>, now: DateTime<Utc>) -> Result<bool> {
    match time {
        Some(text) => Ok(parse_time(text)? <= now),
        None => Ok(false),
    }
}

fn position(list: &[RuleCallback], cb: &RuleCallback) -> Option<usize> {
    list.iter().position(|c| Arc::ptr_eq(c, cb))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::policy::Policy;
    use chrono::TimeZone;

    struct Noop;

    impl Policy for Noop {
        fn rule_type(&self) -> &str {
            "noop"
        }

        fn to_json(&self) -> Value {
            Value::Null
        }

        fn encode(&self) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_classify() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let hour = chrono::Duration::hours(1);
        let rule = || Rule::new("alice", Arc::new(Noop));

        assert_eq!(classify(&rule(), now), RuleState::Active);
        assert_eq!(
            classify(&rule().with_start_time(now - hour), now),
            RuleState::Active
        );
        assert_eq!(
            classify(&rule().with_start_time(now + hour), now),
            RuleState::Inactive
        );
        assert_eq!(
            classify(&rule().with_stop_time(now), now),
            RuleState::Expired
        );
        assert_eq!(
            classify(
                &rule().with_start_time(now + hour).with_stop_time(now - hour),
                now
            ),
            RuleState::Expired
        );
    }

    #[test]
    fn test_is_due() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(is_due(Some("2025-06-01T12:00:00.000Z"), now).unwrap());
        assert!(!is_due(Some("2025-06-01T12:00:00.001Z"), now).unwrap());
        assert!(!is_due(None, now).unwrap());
    }
}
