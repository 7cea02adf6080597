//! Bounded, coalescing buffer between the channel and the reconciler
//!
//! Pushing never waits. Once the buffer holds more than `capacity` events, the
//! queued events are folded per station. If that cannot bring it back under
//! four times the capacity, the oldest events are dropped.

use fuel_map_lib::{ChangeEvent, Coalesced, StationId};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Growth allowed past the nominal capacity when coalescing cannot free space
const OVERFLOW_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    /// Events folded into another queued event
    pub coalesced: u64,
    /// Events lost to overflow
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Inner {
    events: VecDeque<ChangeEvent>,
    closed: bool,
    stats: QueueStats,
}

#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event; returns `false` once the queue is closed
    pub fn push(&self, event: ChangeEvent) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed {
                return false;
            }
            inner.events.push_back(event);
            inner.stats.pushed += 1;

            if inner.events.len() > self.capacity {
                let before = inner.events.len();
                inner.events = coalesce(std::mem::take(&mut inner.events));
                let folded = before - inner.events.len();
                inner.stats.coalesced += folded as u64;
                tracing::debug!(before, after = inner.events.len(), "Coalesced event buffer");
            }

            let limit = self.capacity * OVERFLOW_FACTOR;
            if inner.events.len() > limit {
                let excess = inner.events.len() - limit;
                inner.events.drain(..excess);
                inner.stats.dropped += excess as u64;
                tracing::error!(
                    dropped = excess,
                    total_dropped = inner.stats.dropped,
                    "Event buffer overflow, dropped oldest events"
                );
            }
        }
        self.notify.notify_one();
        true
    }

    /// Wait for queued events and take up to `max` of them
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<ChangeEvent>> {
        loop {
            {
                let mut inner = self.lock();
                if !inner.events.is_empty() {
                    let take = max.max(1).min(inner.events.len());
                    return Some(inner.events.drain(..take).collect());
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting events and wake the consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }
}

/// Fold queued events per station, keeping per-station order
fn coalesce(events: VecDeque<ChangeEvent>) -> VecDeque<ChangeEvent> {
    let mut slots: Vec<Option<ChangeEvent>> = Vec::with_capacity(events.len());
    let mut last: FxHashMap<StationId, usize> = FxHashMap::default();

    for event in events {
        let Some(&slot) = last.get(event.id()) else {
            last.insert(event.id().clone(), slots.len());
            slots.push(Some(event));
            continue;
        };
        let Some(older) = slots[slot].take() else {
            continue;
        };
        match older.coalesce(event) {
            Coalesced::Merged(merged) => slots[slot] = Some(merged),
            Coalesced::Both(older, newer) => {
                slots[slot] = Some(older);
                last.insert(newer.id().clone(), slots.len());
                slots.push(Some(newer));
            }
        }
    }

    slots.into_iter().flatten().collect()
}
