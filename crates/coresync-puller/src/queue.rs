//! Deduplicating work queue of cores that need a refresh.
//!
//! Many producers enqueue, the feeder is the single consumer. At most one
//! entry exists per core; a second request for a queued core only raises its
//! requested generation. Entries carry a ready time so failed or contended
//! pulls can sit out their backoff without blocking other cores.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use coresync_types::{CoreIdentity, Generation, WorkItem};
use tokio::sync::{Notify, watch};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Idle wake-up when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

struct Queued {
    item: WorkItem,
    ready_at: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Cores in insertion order, for fairness.
    order: VecDeque<CoreIdentity>,
    items: HashMap<CoreIdentity, Queued>,
}

/// Work queue feeding the pull worker.
#[derive(Default)]
pub struct PullQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl PullQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for `core` to be brought up to at least `generation`.
    ///
    /// Returns `true` if a new entry was created, `false` if the request
    /// was merged into one already queued (which keeps its place and any
    /// pending backoff).
    pub fn enqueue(&self, core: &CoreIdentity, generation: Generation) -> bool {
        let now = Instant::now();
        let created = {
            let mut state = self.state.lock().expect("lock poisoned");
            match state.items.get_mut(core) {
                Some(queued) => {
                    queued.item.requested_generation =
                        queued.item.requested_generation.max(generation);
                    false
                }
                None => {
                    state.order.push_back(core.clone());
                    state.items.insert(
                        core.clone(),
                        Queued {
                            item: WorkItem {
                                core: core.clone(),
                                requested_generation: generation,
                                enqueued_at: now,
                            },
                            ready_at: now,
                        },
                    );
                    true
                }
            }
        };
        if created {
            debug!(%core, %generation, "pull enqueued");
        } else {
            debug!(%core, %generation, "pull merged into queued request");
        }
        self.ready.notify_one();
        created
    }

    /// Put an item back, not to be dequeued before `delay` has passed.
    ///
    /// If a newer request for the same core arrived meanwhile, the two are
    /// merged and the later ready time wins.
    pub fn requeue_after(&self, item: WorkItem, delay: Duration) {
        let ready_at = Instant::now() + delay;
        {
            let mut state = self.state.lock().expect("lock poisoned");
            match state.items.get_mut(&item.core) {
                Some(queued) => {
                    queued.item.requested_generation = queued
                        .item
                        .requested_generation
                        .max(item.requested_generation);
                    queued.item.enqueued_at = queued.item.enqueued_at.min(item.enqueued_at);
                    queued.ready_at = queued.ready_at.max(ready_at);
                }
                None => {
                    state.order.push_back(item.core.clone());
                    state
                        .items
                        .insert(item.core.clone(), Queued { item, ready_at });
                }
            }
        }
        self.ready.notify_one();
    }

    /// Drop any queued request for `core`.
    pub fn remove(&self, core: &CoreIdentity) -> Option<WorkItem> {
        let mut state = self.state.lock().expect("lock poisoned");
        let removed = state.items.remove(core)?;
        state.order.retain(|c| c != core);
        Some(removed.item)
    }

    /// Whether a request for `core` is queued.
    pub fn contains(&self, core: &CoreIdentity) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .items
            .contains_key(core)
    }

    /// Number of queued cores.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").items.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the oldest ready item without waiting.
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        self.take_ready(Instant::now()).ok()
    }

    /// Wait for the next ready item, or return `None` once `shutdown` is
    /// signalled (or its sender is gone).
    pub async fn dequeue(&self, shutdown: &mut watch::Receiver<bool>) -> Option<WorkItem> {
        loop {
            if *shutdown.borrow_and_update() {
                return None;
            }

            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.take_ready(Instant::now()) {
                Ok(item) => return Some(item),
                Err(next) => next.unwrap_or_else(|| Instant::now() + IDLE_WAIT),
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Remove the first item in insertion order that is ready at `now`, or
    /// report when the earliest waiting item becomes ready.
    fn take_ready(&self, now: Instant) -> Result<WorkItem, Option<Instant>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let QueueState { order, items } = &mut *state;

        let mut earliest: Option<Instant> = None;
        let mut ready_pos = None;
        for (pos, core) in order.iter().enumerate() {
            let Some(queued) = items.get(core) else {
                continue;
            };
            if queued.ready_at <= now {
                ready_pos = Some(pos);
                break;
            }
            earliest = Some(earliest.map_or(queued.ready_at, |e| e.min(queued.ready_at)));
        }

        let Some(pos) = ready_pos else {
            return Err(earliest);
        };
        let core = order.remove(pos).ok_or(earliest)?;
        items.remove(&core).map(|q| q.item).ok_or(earliest)
    }
}
