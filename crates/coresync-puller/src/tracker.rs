//! Per-core bookkeeping of pull attempts and the backoff derived from it.
//!
//! The tracker is authoritative for scheduling only. Exclusivity comes from
//! the lease table, never from here.

use std::collections::HashMap;
use std::sync::Mutex;

use coresync_types::{CoreIdentity, Generation, PullOutcome, PullRecord, unix_millis};
use tokio::time::Duration;
use tracing::info;

/// Last pull outcome per core.
pub struct PullTracker {
    records: Mutex<HashMap<CoreIdentity, PullRecord>>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl PullTracker {
    /// Create a tracker whose backoff doubles from `backoff_base` up to
    /// `backoff_max`.
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            backoff_base,
            backoff_max,
        }
    }

    /// Mark a pull of `core` towards `generation` as in progress.
    pub fn record_attempt(&self, core: &CoreIdentity, generation: Generation) {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records
            .entry(core.clone())
            .or_insert_with(|| empty_record(core));
        record.attempted_generation = generation;
        record.outcome = PullOutcome::InProgress;
        record.updated_at_ms = unix_millis();
    }

    /// Record how the latest attempt ended and return the updated record.
    ///
    /// Success clears the failure count, a failure increments it, and a
    /// deferral leaves it alone.
    pub fn record_outcome(&self, core: &CoreIdentity, outcome: PullOutcome) -> PullRecord {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records
            .entry(core.clone())
            .or_insert_with(|| empty_record(core));
        match &outcome {
            PullOutcome::Succeeded => record.consecutive_failures = 0,
            PullOutcome::Failed { .. } => {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            }
            _ => {}
        }
        record.outcome = outcome;
        record.updated_at_ms = unix_millis();
        record.clone()
    }

    /// Stop retrying `core` until an operator calls [`reset`](Self::reset).
    pub fn mark_permanent(&self, core: &CoreIdentity, reason: String) -> PullRecord {
        let mut records = self.records.lock().expect("lock poisoned");
        let record = records
            .entry(core.clone())
            .or_insert_with(|| empty_record(core));
        record.outcome = PullOutcome::PermanentlyFailed { reason };
        record.updated_at_ms = unix_millis();
        record.clone()
    }

    /// The record of `core`, if it was ever attempted.
    pub fn status(&self, core: &CoreIdentity) -> Option<PullRecord> {
        self.records
            .lock()
            .expect("lock poisoned")
            .get(core)
            .cloned()
    }

    /// Whether `core` exhausted its retries.
    pub fn is_permanently_failed(&self, core: &CoreIdentity) -> bool {
        self.records
            .lock()
            .expect("lock poisoned")
            .get(core)
            .is_some_and(|r| matches!(r.outcome, PullOutcome::PermanentlyFailed { .. }))
    }

    /// Every core that needs operator attention, ordered by core.
    pub fn permanent_failures(&self) -> Vec<PullRecord> {
        let records = self.records.lock().expect("lock poisoned");
        let mut failed: Vec<_> = records
            .values()
            .filter(|r| matches!(r.outcome, PullOutcome::PermanentlyFailed { .. }))
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.core.cmp(&b.core));
        failed
    }

    /// Every record, ordered by core.
    pub fn snapshot(&self) -> Vec<PullRecord> {
        let records = self.records.lock().expect("lock poisoned");
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.core.cmp(&b.core));
        all
    }

    /// Forget everything about `core`, clearing a permanent failure.
    ///
    /// Returns whether the core had been permanently failed.
    pub fn reset(&self, core: &CoreIdentity) -> bool {
        let removed = self.records.lock().expect("lock poisoned").remove(core);
        let was_permanent =
            removed.is_some_and(|r| matches!(r.outcome, PullOutcome::PermanentlyFailed { .. }));
        if was_permanent {
            info!(%core, "permanent pull failure cleared");
        }
        was_permanent
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

fn empty_record(core: &CoreIdentity) -> PullRecord {
    PullRecord {
        core: core.clone(),
        attempted_generation: Generation::ZERO,
        outcome: PullOutcome::InProgress,
        updated_at_ms: unix_millis(),
        consecutive_failures: 0,
    }
}
