//! Debounced viewport queries
//!
//! The rendering surface reports every viewport change through
//! [`ViewportController::set_viewport`]. The controller waits until changes
//! settle for the debounce interval, queries the current snapshot once with
//! the viewport current at that time and hands the results to every
//! subscriber. Publishing a new snapshot schedules a refresh the same way.

use crate::app::state::SharedSnapshot;
use fuel_map_lib::{Bounds, QueryItem, Station};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Visible map area and zoom level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub bounds: Bounds,
    pub zoom: f64,
}

/// One query result with the store attributes of its station, for leaves
#[derive(Debug, Clone)]
pub struct RenderItem {
    pub item: QueryItem,
    pub attributes: Option<Arc<Station>>,
}

/// A completed viewport query
#[derive(Debug, Clone)]
pub struct ViewportResults {
    /// Viewport generation the query ran for
    pub generation: u64,
    pub snapshot_version: u64,
    pub viewport: Viewport,
    pub items: Vec<RenderItem>,
}

type Callback = dyn Fn(&ViewportResults) + Send + Sync;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: Vec<(u64, Arc<Callback>)>,
}

/// Keeps a results callback registered; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the callback"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.callbacks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub struct ViewportController {
    snapshot: Arc<SharedSnapshot>,
    viewport: watch::Sender<Option<Viewport>>,
    /// Bumped on every viewport change
    generation: AtomicU64,
    subscribers: Arc<Mutex<Subscribers>>,
    debounce: Duration,
}

impl ViewportController {
    pub fn new(snapshot: Arc<SharedSnapshot>, debounce: Duration) -> Self {
        Self {
            snapshot,
            viewport: watch::Sender::new(None),
            generation: AtomicU64::new(0),
            subscribers: Arc::default(),
            debounce,
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new viewport; the query runs once changes settle
    pub fn set_viewport(&self, bounds: Bounds, zoom: f64) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(generation, ?bounds, zoom, "Viewport changed");
        self.viewport.send_replace(Some(Viewport { bounds, zoom }));
    }

    pub fn viewport(&self) -> Option<Viewport> {
        *self.viewport.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register a callback invoked once per completed query
    pub fn on_results_changed(
        &self,
        callback: impl Fn(&ViewportResults) + Send + Sync + 'static,
    ) -> Subscription {
        let mut subscribers = self.subscribers();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().callbacks.len()
    }

    /// Query the current viewport now and notify subscribers
    ///
    /// Returns `None` without a viewport, or when the viewport changed while
    /// the query ran.
    pub fn refresh(&self) -> Option<Arc<ViewportResults>> {
        self.execute(self.generation())
    }

    /// Run the query for viewport `generation`, discarding it if superseded
    fn execute(&self, generation: u64) -> Option<Arc<ViewportResults>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("viewport::execute");

        let viewport = self.viewport()?;
        if self.generation() != generation {
            debug!(generation, "Viewport superseded before query");
            return None;
        }

        let snapshot = self.snapshot.load();
        let items: Vec<RenderItem> = snapshot
            .query(&viewport.bounds, viewport.zoom)
            .into_iter()
            .map(|item| {
                let attributes = item
                    .station_id
                    .as_ref()
                    .and_then(|id| snapshot.station(id).cloned());
                RenderItem { item, attributes }
            })
            .collect();

        if self.generation() != generation {
            debug!(generation, "Discarding results of a superseded viewport");
            return None;
        }

        let results = Arc::new(ViewportResults {
            generation,
            snapshot_version: snapshot.version,
            viewport,
            items,
        });
        debug!(
            generation,
            snapshot = results.snapshot_version,
            items = results.items.len(),
            "Viewport results ready"
        );

        // Callbacks may subscribe or unsubscribe, so run them without the lock
        let callbacks: Vec<Arc<Callback>> = self
            .subscribers()
            .callbacks
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&results);
        }
        Some(results)
    }

    /// Debounce viewport and snapshot changes until cancelled
    ///
    /// Changes are tracked from the moment this is called, not from the first
    /// poll of the returned future.
    pub fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Future<Output = ()> + Send + 'static {
        let viewports = self.viewport.subscribe();
        let versions = self.snapshot.subscribe();
        self.debounce_loop(viewports, versions, cancel)
    }

    async fn debounce_loop(
        self: Arc<Self>,
        mut viewports: watch::Receiver<Option<Viewport>>,
        mut versions: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        let mut versions_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = viewports.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = versions.changed(), if versions_open => {
                    if changed.is_err() {
                        versions_open = false;
                        continue;
                    }
                }
            }

            // Trailing edge: wait until nothing changed for a full interval
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.debounce) => break,
                    changed = viewports.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = versions.changed(), if versions_open => {
                        if changed.is_err() {
                            versions_open = false;
                        }
                    }
                }
            }
            viewports.borrow_and_update();
            versions.borrow_and_update();

            self.execute(self.generation());
        }
        debug!("Viewport controller stopped");
    }
}
