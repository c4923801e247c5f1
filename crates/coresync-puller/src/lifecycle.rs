//! Owns the single feeder worker of a process.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use coresync_types::unix_millis;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::PullError;
use crate::feeder::PullerFeeder;

/// Lifecycle of the feeder worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederState {
    /// `start` was never called.
    NotStarted,
    /// A worker is draining the queue.
    Running,
    /// The worker was told to stop and is finishing its current item.
    StopRequested,
    /// The worker has exited.
    Stopped,
}

/// Description of the current (or last) worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Increments with every `start`.
    pub id: u64,
    /// Where the worker is in its lifecycle.
    pub state: FeederState,
    /// Unix timestamp (milliseconds) of the `start` that spawned it.
    pub started_at_ms: u64,
}

struct RunningFeeder {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Starts exactly one [`PullerFeeder`] worker and stops it with join
/// semantics.
///
/// The async mutex is held across the whole stop-then-spawn sequence, so
/// concurrent `start` calls can never leave two workers running.
pub struct FeederProcess {
    feeder: Arc<PullerFeeder>,
    running: Mutex<Option<RunningFeeder>>,
    info: StdMutex<Option<WorkerInfo>>,
}

impl FeederProcess {
    /// Wrap a feeder. Nothing runs until [`start`](Self::start).
    pub fn new(feeder: Arc<PullerFeeder>) -> Self {
        Self {
            feeder,
            running: Mutex::new(None),
            info: StdMutex::new(None),
        }
    }

    /// Launch the worker, stopping (and joining) a running one first.
    pub async fn start(&self) -> WorkerInfo {
        let mut running = self.running.lock().await;

        if let Some(old) = running.take() {
            info!("restarting puller feeder");
            if let Err(e) = self.join(old).await {
                error!(error = %e, "previous puller feeder exited abnormally");
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let feeder = self.feeder.clone();
        let task = tokio::spawn(async move { feeder.run(rx).await });
        *running = Some(RunningFeeder { shutdown, task });

        let mut info = self.info.lock().expect("lock poisoned");
        let worker = WorkerInfo {
            id: info.map_or(1, |w| w.id + 1),
            state: FeederState::Running,
            started_at_ms: unix_millis(),
        };
        *info = Some(worker);
        worker
    }

    /// Signal the worker and wait for it to exit. A no-op if none runs.
    pub async fn stop(&self) -> Result<(), PullError> {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(worker) => self.join(worker).await,
            None => Ok(()),
        }
    }

    /// The current or most recent worker.
    ///
    /// Fails with [`PullError::NotInitialized`] before the first `start`.
    pub fn active_worker(&self) -> Result<WorkerInfo, PullError> {
        self.info
            .lock()
            .expect("lock poisoned")
            .ok_or(PullError::NotInitialized)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FeederState {
        self.info
            .lock()
            .expect("lock poisoned")
            .map_or(FeederState::NotStarted, |w| w.state)
    }

    async fn join(&self, worker: RunningFeeder) -> Result<(), PullError> {
        self.set_state(FeederState::StopRequested);
        // The worker may already be gone; joining still reports how it ended.
        let _ = worker.shutdown.send(true);
        let result = worker
            .task
            .await
            .map_err(|e| PullError::Worker(e.to_string()));
        self.set_state(FeederState::Stopped);
        info!("puller feeder joined");
        result
    }

    fn set_state(&self, state: FeederState) {
        if let Some(worker) = self.info.lock().expect("lock poisoned").as_mut() {
            worker.state = state;
        }
    }
}
