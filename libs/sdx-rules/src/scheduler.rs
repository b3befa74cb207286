//! Install/remove timers
//!
//! Each timer is a single-shot tokio task sleeping until the earliest pending
//! start (install) or stop (remove) time. Every pop rearms its own timer, so
//! at most one task per kind is outstanding. A rearm bumps the generation;
//! a task that already woke up checks it and exits if it was superseded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::repository::TimeColumn;
use crate::types::RuleState;

/// Which of the two timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Activates inactive rules whose start time has passed
    Install,
    /// Expires active rules whose stop time has passed
    Remove,
}

impl TimerKind {
    /// State of the rows this timer watches
    pub fn pending_state(&self) -> RuleState {
        match self {
            TimerKind::Install => RuleState::Inactive,
            TimerKind::Remove => RuleState::Active,
        }
    }

    /// State a due row moves to
    pub fn target_state(&self) -> RuleState {
        match self {
            TimerKind::Install => RuleState::Active,
            TimerKind::Remove => RuleState::Expired,
        }
    }

    pub fn column(&self) -> TimeColumn {
        match self {
            TimerKind::Install => TimeColumn::Start,
            TimerKind::Remove => TimeColumn::Stop,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimerKind::Install => "install",
            TimerKind::Remove => "remove",
        }
    }
}

/// Mutable state of one timer
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<AbortHandle>,
    next_time: Option<DateTime<Utc>>,
    generation: u64,
}

impl TimerSlot {
    /// Abort the outstanding task, if any, and invalidate its generation
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.next_time = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Generation the next spawned task must carry
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Record the task armed for `target`
    pub fn armed(&mut self, handle: AbortHandle, target: DateTime<Utc>) {
        self.handle = Some(handle);
        self.next_time = Some(target);
    }

    pub fn next_time(&self) -> Option<DateTime<Utc>> {
        self.next_time
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

/// One timer and the mutex covering cancel, recompute and arm
#[derive(Debug)]
pub struct Timer {
    kind: TimerKind,
    slot: Mutex<TimerSlot>,
}

impl Timer {
    pub fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            slot: Mutex::new(TimerSlot::default()),
        }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub async fn lock(&self) -> MutexGuard<'_, TimerSlot> {
        self.slot.lock().await
    }

    /// Called by a woken task. Returns false if a rearm superseded it;
    /// otherwise detaches the task from the slot so its own rearm does not
    /// abort it.
    pub async fn claim(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            debug!("{} timer generation {} superseded", self.kind.label(), generation);
            return false;
        }
        slot.handle = None;
        slot.next_time = None;
        true
    }

    pub async fn cancel(&self) {
        self.slot.lock().await.cancel();
    }

    /// Target time of the armed task
    pub async fn next_time(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().await.next_time()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.slot.get_mut().cancel();
    }
}

/// Sleep duration until `target`, never negative, and no shorter than `floor`
pub fn delay_until(target: DateTime<Utc>, now: DateTime<Utc>, floor: Option<Duration>) -> Duration {
    let delay = (target - now).to_std().unwrap_or(Duration::ZERO);
    match floor {
        Some(floor) => delay.max(floor),
        None => delay,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    #[test]
    fn test_delay_until() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let ahead = now + chrono::Duration::seconds(5);
        assert_eq!(delay_until(ahead, now, None), Duration::from_secs(5));

        let past = now - chrono::Duration::seconds(5);
        assert_eq!(delay_until(past, now, None), Duration::ZERO);
        assert_eq!(
            delay_until(past, now, Some(Duration::from_millis(250))),
            Duration::from_millis(250)
        );
        assert_eq!(
            delay_until(ahead, now, Some(Duration::from_millis(250))),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_claim_checks_generation() {
        let timer = Timer::new(TimerKind::Install);
        let now = Utc::now();

        let stale = {
            let mut slot = timer.lock().await;
            slot.cancel();
            let generation = slot.generation();
            let task = tokio::spawn(async {});
            slot.armed(task.abort_handle(), now);
            generation
        };
        assert_eq!(timer.next_time().await, Some(now));

        // A rearm supersedes the first task
        timer.cancel().await;
        let current = timer.lock().await.generation();
        assert!(!timer.claim(stale).await);
        assert!(logs_contain("superseded"));
        assert!(timer.claim(current).await);
        assert!(!timer.lock().await.is_armed());
    }

    #[test]
    fn test_kind_columns() {
        assert_eq!(TimerKind::Install.pending_state(), RuleState::Inactive);
        assert_eq!(TimerKind::Install.target_state(), RuleState::Active);
        assert_eq!(TimerKind::Remove.pending_state(), RuleState::Active);
        assert_eq!(TimerKind::Remove.column(), TimeColumn::Stop);
        assert_eq!(Timer::new(TimerKind::Remove).kind(), TimerKind::Remove);
    }
}
