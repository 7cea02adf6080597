//! Engine composition root
//!
//! [`Engine`] owns the published snapshot and wires three tasks together:
//! - the live channel, pushing decoded events into a bounded queue
//! - the reconciler, draining the queue in batches and publishing snapshots
//! - the viewport controller, re-querying the current viewport after changes
//!
//! `start()` spawns the tasks and `stop()` tears them down and joins them.

pub(crate) mod settings;
pub(crate) mod state;

use crate::app::settings::Settings;
use crate::app::state::{EngineStatus, SharedSnapshot};
use crate::async_runtime;
use crate::channel::{ChannelSettings, ChannelStatus, EventQueue, HttpTransport, LiveChannel, Transport};
use crate::viewport::{Subscription, ViewportController, ViewportResults};
use crate::{AppError, Result, bulk};
use fuel_map_lib::{Bounds, Config, QueryItem, ReconcileStats, Reconciler, Snapshot, Station};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tasks of a started engine
struct Running {
    cancel: CancellationToken,
    queue: Arc<EventQueue>,
    channel: JoinHandle<ChannelStatus>,
    reconciler: JoinHandle<ReconcileStats>,
    viewport: JoinHandle<()>,
}

pub struct Engine {
    config: Config,
    snapshot: Arc<SharedSnapshot>,
    viewport: Arc<ViewportController>,
    reconcile_stats: Arc<watch::Sender<ReconcileStats>>,
    channel_status: watch::Receiver<ChannelStatus>,
    running: Option<Running>,
}

impl Engine {
    /// Create an engine serving an empty snapshot
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let snapshot = Arc::new(SharedSnapshot::new(Snapshot::empty(&config)?));
        let viewport = Arc::new(ViewportController::new(
            snapshot.clone(),
            Duration::from_millis(config.debounce_interval_ms),
        ));
        let (_, channel_status) = watch::channel(ChannelStatus::default());

        Ok(Self {
            config,
            snapshot,
            viewport,
            reconcile_stats: Arc::new(watch::Sender::new(ReconcileStats::default())),
            channel_status,
            running: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the station set and build the index over it
    ///
    /// Only allowed while stopped, so the reconciler never sees the store
    /// replaced underneath it.
    pub fn load(&mut self, stations: impl IntoIterator<Item = Station>) -> Result<()> {
        if self.running.is_some() {
            return Err(AppError::AlreadyRunning);
        }
        let mut snapshot = Snapshot::build(&self.config, stations)?;
        snapshot.version = self.snapshot.version() + 1;
        info!(
            version = snapshot.version,
            stations = snapshot.store.len(),
            indexed = snapshot.index.len(),
            "Station set loaded"
        );
        self.snapshot.publish(Arc::new(snapshot));
        Ok(())
    }

    /// Connect through `transport` and start applying live updates
    pub fn start(&mut self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.running.is_some() {
            return Err(AppError::AlreadyRunning);
        }
        if !async_runtime::in_runtime_context() {
            return Err(AppError::NoRuntime);
        }

        let cancel = CancellationToken::new();
        let queue = Arc::new(EventQueue::new(self.config.event_buffer_capacity));

        let channel = LiveChannel::new(
            transport,
            ChannelSettings::from(&self.config),
            queue.clone(),
        );
        self.channel_status = channel.subscribe();
        let channel = async_runtime::spawn("live_channel", channel.run(cancel.clone()));

        let reconciler = Reconciler::new((*self.snapshot.load()).clone());
        self.reconcile_stats.send_replace(reconciler.stats());
        let reconciler = async_runtime::spawn(
            "reconciler",
            reconcile(
                reconciler,
                queue.clone(),
                self.snapshot.clone(),
                self.reconcile_stats.clone(),
                self.config.event_buffer_capacity,
            ),
        );

        let viewport = async_runtime::spawn("viewport", self.viewport.clone().run(cancel.clone()));

        // A viewport set while stopped is queried once the loop runs
        if self.viewport.viewport().is_some() {
            self.viewport.refresh();
        }

        info!(version = self.snapshot.version(), "Engine started");
        self.running = Some(Running {
            cancel,
            queue,
            channel,
            reconciler,
            viewport,
        });
        Ok(())
    }

    /// Cancel every task and wait for all of them to finish
    ///
    /// Events already queued are applied before the reconciler exits.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!("Stopping engine");
        running.cancel.cancel();
        running.queue.close();

        match running.channel.await {
            Ok(status) => debug!(state = ?status.state, health = ?status.health, "Live channel joined"),
            Err(e) => error!(error = %e, "Live channel task failed"),
        }
        match running.reconciler.await {
            Ok(stats) => {
                self.reconcile_stats.send_replace(stats);
                debug!(applied = stats.applied, "Reconciler joined");
            }
            Err(e) => error!(error = %e, "Reconciler task failed"),
        }
        if let Err(e) = running.viewport.await {
            error!(error = %e, "Viewport task failed");
        }
        info!(version = self.snapshot.version(), "Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load()
    }

    /// Receiver notified with the version of every published snapshot
    pub fn watch_snapshots(&self) -> watch::Receiver<u64> {
        self.snapshot.subscribe()
    }

    /// Query the current snapshot directly, bypassing the debounce
    pub fn query(&self, bounds: &Bounds, zoom: f64) -> Vec<QueryItem> {
        self.snapshot().query(bounds, zoom)
    }

    /// Report the rendering surface's viewport
    pub fn set_viewport(&self, bounds: Bounds, zoom: f64) {
        self.viewport.set_viewport(bounds, zoom);
    }

    pub fn on_results_changed(
        &self,
        callback: impl Fn(&ViewportResults) + Send + Sync + 'static,
    ) -> Subscription {
        self.viewport.on_results_changed(callback)
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel_status.borrow().clone()
    }

    /// Receiver for channel state and health changes
    pub fn watch_channel(&self) -> watch::Receiver<ChannelStatus> {
        self.channel_status.clone()
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.snapshot();
        let (queued_events, dropped_events) = self
            .running
            .as_ref()
            .map(|running| (running.queue.len(), running.queue.stats().dropped))
            .unwrap_or_default();
        EngineStatus {
            snapshot_version: snapshot.version,
            stations: snapshot.store.len(),
            indexed: snapshot.index.len(),
            tombstones: snapshot.store.tombstone_count(),
            reconcile: *self.reconcile_stats.borrow(),
            queued_events,
            dropped_events,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
            running.queue.close();
        }
    }
}

/// Drain the queue in batches, publishing one snapshot per changing batch
async fn reconcile(
    mut reconciler: Reconciler,
    queue: Arc<EventQueue>,
    snapshot: Arc<SharedSnapshot>,
    stats: Arc<watch::Sender<ReconcileStats>>,
    batch_size: usize,
) -> ReconcileStats {
    while let Some(batch) = queue.next_batch(batch_size).await {
        let events = batch.len();
        if let Some(next) = reconciler.apply_batch(batch) {
            debug!(version = next.version, events, "Publishing snapshot");
            snapshot.publish(next);
        }
        stats.send_replace(reconciler.stats());
    }
    debug!("Event queue closed, reconciler exiting");
    reconciler.stats()
}

/// Run the engine from command line settings until Ctrl-C
pub async fn run(settings: Settings) -> Result<()> {
    let mut engine = Engine::new(settings.config())?;
    if let Some(source) = &settings.stations {
        engine.load(bulk::load_stations(source).await?)?;
    }

    let transport = HttpTransport::new(
        settings.stream_url.clone(),
        Duration::from_secs(settings.connect_timeout_secs),
    )?;
    info!(url = transport.url(), "Connecting to live updates");

    let _subscription = engine.on_results_changed(|results| {
        let clusters = results.items.iter().filter(|i| !i.item.is_leaf).count();
        info!(
            snapshot = results.snapshot_version,
            zoom = results.viewport.zoom,
            items = results.items.len(),
            clusters,
            stations = results.items.len() - clusters,
            "Viewport results"
        );
    });

    engine.start(Arc::new(transport))?;
    engine.set_viewport(settings.bounds, settings.zoom);

    let mut channel = engine.watch_channel();
    let mut channel_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                match signal {
                    Ok(()) => info!("Ctrl-C received, shutting down"),
                    Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
                }
                break;
            }
            changed = channel.changed(), if channel_open => {
                if changed.is_err() {
                    warn!("Live channel stopped; serving the last snapshot");
                    channel_open = false;
                    continue;
                }
                let status = channel.borrow_and_update().clone();
                info!(
                    state = ?status.state,
                    health = ?status.health,
                    error = ?status.last_error,
                    "Live channel status"
                );
            }
        }
    }

    engine.stop().await;
    let status = engine.status();
    info!(
        version = status.snapshot_version,
        stations = status.stations,
        indexed = status.indexed,
        applied = status.reconcile.applied,
        stale = status.reconcile.stale,
        orphaned = status.reconcile.orphaned,
        tombstoned = status.reconcile.tombstoned,
        "Final status"
    );
    Ok(())
}
