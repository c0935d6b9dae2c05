//! Per-target hysteresis for hard failures.
//!
//! The first hard failure after a non-failure is reported as WARN and
//! tagged `softened = "first_hard_down"`; only a second consecutive hard
//! failure is reported as CRIT. Counters live in memory only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::probe::{CheckOutcome, Status};

/// Marker written to diagnostics when a hard failure is softened.
pub const SOFTENED_FIRST_HARD_DOWN: &str = "first_hard_down";

/// Consecutive-result counters for one target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Streak {
    pub consecutive_hard_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakState {
    StableOk,
    FirstHardDown,
    ConfirmedDown,
}

impl Streak {
    pub fn state(&self) -> StreakState {
        match self.consecutive_hard_failures {
            0 => StreakState::StableOk,
            1 => StreakState::FirstHardDown,
            _ => StreakState::ConfirmedDown,
        }
    }

    fn record(&mut self, hard_down: bool) {
        if hard_down {
            self.consecutive_hard_failures = self.consecutive_hard_failures.saturating_add(1);
            self.consecutive_successes = 0;
        } else {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_hard_failures = 0;
        }
    }
}

/// Streak counters keyed by target id, shared by the cycle's workers.
#[derive(Debug, Default)]
pub struct StreakStore {
    streaks: Mutex<HashMap<String, Streak>>,
}

impl StreakStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Streak>> {
        self.streaks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record this cycle's raw outcome for `target_id` and return the
    /// outcome as it should be reported.
    pub fn apply(&self, target_id: &str, mut outcome: CheckOutcome) -> CheckOutcome {
        let state = {
            let mut streaks = self.lock();
            let streak = streaks.entry(target_id.to_string()).or_default();
            streak.record(outcome.hard_down);
            streak.state()
        };

        if outcome.hard_down && state == StreakState::FirstHardDown {
            outcome.status = Status::Warn;
            outcome.meta.insert(
                "softened".into(),
                Value::String(SOFTENED_FIRST_HARD_DOWN.into()),
            );
        }

        outcome
    }

    /// Current counters for `target_id` (zero if never seen).
    pub fn get(&self, target_id: &str) -> Streak {
        self.lock().get(target_id).copied().unwrap_or_default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}
