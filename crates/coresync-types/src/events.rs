//! Type-safe event bus for sync lifecycle notifications.
//!
//! The [`EventBus`] lets the feeder, pusher, delete manager, and lease table
//! announce what they did, and lets monitoring subscribe to specific event
//! types without direct coupling. Permanent pull failures travel here as
//! [`PullAbandoned`] so alerting can pick them up.
//!
//! Internally the bus keeps a `HashMap<TypeId, Box<dyn Any>>` where each
//! value is a `tokio::sync::broadcast::Sender<E>`, created lazily on the
//! first `subscribe()` for that type.
//!
//! # Example
//!
//! ```rust
//! use coresync_types::events::{EventBus, PullSucceeded};
//! use coresync_types::{CoreIdentity, Generation};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<PullSucceeded>();
//! let core: CoreIdentity = "books/shard1/replica_n1".parse().unwrap();
//!
//! bus.emit(PullSucceeded {
//!     core: core.clone(),
//!     generation: Generation(5),
//!     fetched_files: 2,
//! });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.core, core);
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::warn;

use crate::{BlobRef, CoreIdentity, DeferReason, Generation};

/// Marker trait for everything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A pull brought a core up to date (or found it already current).
#[derive(Clone, Debug)]
pub struct PullSucceeded {
    /// The refreshed core.
    pub core: CoreIdentity,
    /// Local generation after the pull.
    pub generation: Generation,
    /// Segment files downloaded; 0 for a no-op pull.
    pub fetched_files: usize,
}
impl Event for PullSucceeded {}

/// A pull was put back for rescheduling without counting as a failure.
#[derive(Clone, Debug)]
pub struct PullDeferred {
    /// The core whose pull was deferred.
    pub core: CoreIdentity,
    /// Why it was deferred.
    pub reason: DeferReason,
}
impl Event for PullDeferred {}

/// A pull attempt failed and will be retried after backoff.
#[derive(Clone, Debug)]
pub struct PullFailed {
    /// The core that failed to pull.
    pub core: CoreIdentity,
    /// Consecutive failures including this one.
    pub attempt: u32,
    /// When the next attempt is scheduled.
    pub retry_in: Duration,
    /// Error description.
    pub reason: String,
}
impl Event for PullFailed {}

/// A core exhausted its retries and needs operator attention.
#[derive(Clone, Debug)]
pub struct PullAbandoned {
    /// The core that was given up on.
    pub core: CoreIdentity,
    /// How many attempts were made.
    pub attempts: u32,
    /// Error description of the last attempt.
    pub reason: String,
}
impl Event for PullAbandoned {}

/// A new generation of a core was written to the object store.
#[derive(Clone, Debug)]
pub struct CorePushed {
    /// The pushed core.
    pub core: CoreIdentity,
    /// The generation that was created.
    pub generation: Generation,
    /// Segment blobs uploaded (blobs already present remotely are skipped).
    pub uploaded_files: usize,
}
impl Event for CorePushed {}

/// A superseded blob was removed from the object store.
#[derive(Clone, Debug)]
pub struct BlobDeleted {
    /// The deleted blob.
    pub blob: BlobRef,
    /// Generation the blob last belonged to.
    pub generation: Generation,
}
impl Event for BlobDeleted {}

/// A lease exceeded the maximum hold duration and was forcibly reclaimed.
#[derive(Clone, Debug)]
pub struct LeaseRevoked {
    /// The core whose lease was revoked.
    pub core: CoreIdentity,
    /// Holder token of the revoked lease.
    pub holder: String,
    /// How long the lease had been held.
    pub held_for: Duration,
}
impl Event for LeaseRevoked {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct EventBusInner {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// A type-safe event bus for intra-node notifications.
///
/// Clonable (`Arc` inside). Emits never block: with no subscriber, or with a
/// full subscriber buffer, the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    pub fn emit<E: Event>(&self, event: E) {
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // No active receivers is fine: nobody is listening.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once every sender is gone. Lagged events are skipped
    /// with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
