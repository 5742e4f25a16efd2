//! Deferred re-checks of partial or low-confidence records.
//!
//! A task moves `armed -> firing -> (resolved | re-armed | exhausted)`. Fire
//! times live in a min-heap; the map of live tasks is authoritative, and heap
//! entries whose generation no longer matches are skipped. Canceling a task
//! is just removing it from the map.

use cardrelay_core::{Fingerprint, RawMessage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Validation timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Delay before attempt `n` is `backoff_secs[min(n, len - 1)]`.
    pub backoff_secs: Vec<u64>,
    pub max_attempts: u32,
    /// Upper bound on live tasks.
    pub max_pending: usize,
    /// How often the validation loop looks for due tasks.
    pub tick_millis: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            backoff_secs: vec![30, 120, 600],
            max_attempts: 3,
            max_pending: 1024,
            tick_millis: 1000,
        }
    }
}

impl ValidationConfig {
    fn delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.backoff_secs.len().saturating_sub(1));
        let secs = self.backoff_secs.get(index).copied().unwrap_or(30);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationTask {
    pub fingerprint: Fingerprint,
    /// Message that carried the card, as it was when the task was armed.
    pub origin: RawMessage,
    pub fire_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed(DateTime<Utc>),
    AlreadyArmed,
    /// The pending set is full.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rearmed(DateTime<Utc>),
    Exhausted,
    /// The task was canceled while it was firing.
    Canceled,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, Fingerprint)>>,
    live: HashMap<Fingerprint, ValidationTask>,
    next_generation: u64,
}

impl State {
    fn push(&mut self, mut task: ValidationTask) -> DateTime<Utc> {
        self.next_generation += 1;
        task.generation = self.next_generation;
        let fire_at = task.fire_at;
        self.queue
            .push(Reverse((fire_at, task.generation, task.fingerprint.clone())));
        self.live.insert(task.fingerprint.clone(), task);
        fire_at
    }

    fn is_current(&self, task: &ValidationTask) -> bool {
        self.live
            .get(&task.fingerprint)
            .is_some_and(|live| live.generation == task.generation)
    }
}

pub struct ValidationScheduler {
    config: ValidationConfig,
    state: Mutex<State>,
}

impl ValidationScheduler {
    #[must_use]
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.tick_millis.max(1))
    }

    /// Arm a first attempt for `fingerprint`. At most one task per fingerprint
    /// is live at a time.
    pub fn arm(
        &self,
        fingerprint: &Fingerprint,
        origin: &RawMessage,
        now: DateTime<Utc>,
    ) -> ArmOutcome {
        if self.config.max_attempts == 0 {
            return ArmOutcome::Refused;
        }
        let mut state = self.state();
        if state.live.contains_key(fingerprint) {
            return ArmOutcome::AlreadyArmed;
        }
        if state.live.len() >= self.config.max_pending {
            warn!(
                "Validation queue full ({} pending), not arming {}",
                state.live.len(),
                fingerprint.short()
            );
            return ArmOutcome::Refused;
        }

        let fire_at = state.push(ValidationTask {
            fingerprint: fingerprint.clone(),
            origin: origin.clone(),
            fire_at: now + self.config.delay(0),
            attempts: 0,
            max_attempts: self.config.max_attempts,
            generation: 0,
        });
        debug!("Validation armed for {} at {fire_at}", fingerprint.short());
        ArmOutcome::Armed(fire_at)
    }

    /// Cancel the live task for `fingerprint`, firing or not.
    pub fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        let canceled = self.state().live.remove(fingerprint).is_some();
        if canceled {
            debug!("Validation canceled for {}", fingerprint.short());
        }
        canceled
    }

    /// Pop every task due at `now`. Returned tasks stay live (and cancelable)
    /// until passed to [`Self::finish`] or [`Self::retry`].
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ValidationTask> {
        let mut state = self.state();
        let mut due = Vec::new();
        while state
            .queue
            .peek()
            .is_some_and(|Reverse((at, _, _))| *at <= now)
        {
            let Some(Reverse((_, generation, fingerprint))) = state.queue.pop() else {
                break;
            };
            if let Some(task) = state
                .live
                .get(&fingerprint)
                .filter(|task| task.generation == generation)
            {
                due.push(task.clone());
            }
        }
        due
    }

    /// The task resolved (or was discarded); forget it.
    pub fn finish(&self, task: &ValidationTask) {
        let mut state = self.state();
        if state.is_current(task) {
            state.live.remove(&task.fingerprint);
        }
    }

    /// The attempt did not improve the record: re-arm with backoff or give up.
    pub fn retry(&self, task: &ValidationTask, now: DateTime<Utc>) -> RetryOutcome {
        let mut state = self.state();
        if !state.is_current(task) {
            return RetryOutcome::Canceled;
        }

        let attempts = task.attempts + 1;
        if attempts >= task.max_attempts {
            state.live.remove(&task.fingerprint);
            return RetryOutcome::Exhausted;
        }

        let fire_at = state.push(ValidationTask {
            fire_at: now + self.config.delay(attempts),
            attempts,
            ..task.clone()
        });
        RetryOutcome::Rearmed(fire_at)
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.state().live.len()
    }

    /// Earliest fire time among live tasks.
    #[must_use]
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.state().live.values().map(|task| task.fire_at).min()
    }
}
