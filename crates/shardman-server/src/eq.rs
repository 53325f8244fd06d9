//! Per-service event queue feeding the task slots.
//!
//! Serializes load/membership signals per service, collapses duplicates,
//! defers load signals through the deadline queue and publishes at most
//! one pending task per service into the store: each publish is a
//! conditional write advancing the service's task slot from the empty
//! string, so an unprocessed task is never overwritten.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shardman_core::event::Event;
use shardman_core::keys;
use shardman_core::store::StoreClient;
use shardman_core::Error;

use crate::pq::{Item, PriorityQueue};

/// Bound of each per-service channel; producers wait while it is full.
const EVENT_CHAN_CAPACITY: usize = 32;

/// Promotion budget per tick so a pathological burst cannot starve the
/// ticker.
const MAX_PROMOTIONS_PER_TICK: usize = 256;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

struct QueueState {
    pq: PriorityQueue,
    channels: HashMap<String, mpsc::Sender<Event>>,
    /// Services with an event still on its way to the task slot.
    in_flight: HashSet<String>,
}

struct Inner {
    store: Arc<dyn StoreClient>,
    state: Mutex<QueueState>,
    cancel: CancellationToken,
}

/// Handle to the coordinator event queue; cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    /// Create the queue and start its 1 Hz promotion loop.
    pub fn new(store: Arc<dyn StoreClient>, cancel: CancellationToken) -> Self {
        let queue = Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(QueueState {
                    pq: PriorityQueue::new(),
                    channels: HashMap::new(),
                    in_flight: HashSet::new(),
                }),
                cancel,
            }),
        };

        let ticker = queue.clone();
        tokio::spawn(async move { ticker.tick_loop().await });

        queue
    }

    /// Route one queued item. `check_dup` drops the item when its service
    /// already has an event in flight; promotions from the deadline queue
    /// skip the check since their slot was claimed on first entry.
    pub async fn push(&self, item: Item, check_dup: bool) {
        let event: Event = match serde_json::from_str(&item.value) {
            Ok(event) => event,
            Err(e) => {
                error!(raw = %item.value, error = %e, "event decode failed, dropped");
                return;
            }
        };

        let mut state = self.inner.state.lock().await;

        if check_dup {
            if state.in_flight.contains(&event.service) {
                info!(service = %event.service, "event already in flight, dropped");
                return;
            }
            state.in_flight.insert(event.service.clone());
        }

        let tx = match state.channels.get(&event.service).cloned() {
            Some(tx) => tx,
            None => {
                let (tx, rx) = mpsc::channel(EVENT_CHAN_CAPACITY);
                state.channels.insert(event.service.clone(), tx.clone());

                let inner = self.inner.clone();
                let service = event.service.clone();
                tokio::spawn(async move { ev_loop(inner, service, rx).await });
                info!(service = %event.service, "event loop started");
                tx
            }
        };

        if !event.kind.is_deferrable() || item.priority <= Utc::now().timestamp() {
            // The state lock is held across the bounded send on purpose:
            // a full channel must hold back every producer of the queue.
            if tx.send(event).await.is_err() {
                warn!("event channel closed, event dropped");
            }
            return;
        }

        info!(priority = item.priority, "event deferred");
        state.pq.push(item);
    }

    async fn tick_loop(self) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("promotion loop exit");
                    return;
                }
                _ = interval.tick() => {}
            }
            self.promote_due().await;
        }
    }

    /// Drain every item whose deadline has passed back through `push`.
    async fn promote_due(&self) {
        let now = Utc::now().timestamp();
        let mut due = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            while due.len() < MAX_PROMOTIONS_PER_TICK {
                match state.pq.peek() {
                    Some(top) if top.priority <= now => {
                        if let Some(item) = state.pq.pop() {
                            due.push(item);
                        }
                    }
                    _ => break,
                }
            }
        }

        for item in due {
            self.push(item, false).await;
        }
    }
}

/// Single consumer per service: publishes each event into the task slot
/// and releases the service's duplicate-suppression slot afterwards,
/// success or not.
async fn ev_loop(inner: Arc<Inner>, service: String, mut rx: mpsc::Receiver<Event>) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => {
                info!(service = %service, "event loop exit");
                return;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        info!(service = %service, kind = ?event.kind, "event received");

        let key = keys::task(&service);
        match inner.store.compare_and_swap(&key, "", &event.value).await {
            Ok(()) => {}
            Err(Error::ValueMismatch { .. }) => {
                warn!(key = %key, value = %event.value, "task slot busy, event dropped");
            }
            Err(e) => {
                warn!(key = %key, value = %event.value, error = %e, "task publish failed");
            }
        }

        let mut state = inner.state.lock().await;
        state.in_flight.remove(&event.service);
    }
}
