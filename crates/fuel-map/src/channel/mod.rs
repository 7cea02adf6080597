//! Live update channel
//!
//! Keeps one push connection open, decodes Server-Sent Events into
//! [`ChangeEvent`]s and hands them to the reconciler through an [`EventQueue`].
//! Lost connections are retried with exponential backoff. Connection state and
//! health are published on a `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting -> Disconnected
//! ```

mod decoder;
mod queue;
mod transport;

pub use decoder::{MAX_MESSAGE_BYTES, Message, SseDecoder};
pub use queue::{EventQueue, QueueStats};
pub use transport::{ByteStream, HttpTransport, Transport};

#[cfg(test)]
pub(crate) use transport::testing;

use crate::ChannelError;
use fuel_map_lib::{Config, parse_event};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelHealth {
    #[default]
    Healthy,
    /// Too many consecutive malformed payloads
    Degraded,
    /// Gave up reconnecting
    Failed,
}

/// Observable channel status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub health: ChannelHealth,
    pub last_error: Option<String>,
    /// Consecutive failed connection attempts
    pub attempts: u32,
    /// Successful connections after the first
    pub reconnects: u64,
    /// Valid events received
    pub received: u64,
    /// Payloads dropped as malformed
    pub malformed: u64,
}

/// Reconnect and health policy
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub initial_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
    pub degraded_parse_threshold: usize,
    /// Longest silence tolerated on an open connection; `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl From<&Config> for ChannelSettings {
    fn from(config: &Config) -> Self {
        Self {
            initial_reconnect_interval: Duration::from_millis(config.initial_reconnect_interval_ms),
            max_reconnect_interval: Duration::from_millis(config.max_reconnect_interval_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            degraded_parse_threshold: config.degraded_parse_threshold,
            idle_timeout: (config.stream_idle_timeout_ms > 0)
                .then(|| Duration::from_millis(config.stream_idle_timeout_ms)),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Exponential backoff, doubling up to a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Replace the starting interval, e.g. from an SSE `retry:` field
    pub fn set_initial(&mut self, initial: Duration) {
        self.initial = initial.min(self.max);
        self.current = self.initial;
    }
}

/// Why a connection stopped being read
enum Disconnect {
    Cancelled,
    Lost(ChannelError),
}

pub struct LiveChannel {
    transport: Arc<dyn Transport>,
    settings: ChannelSettings,
    queue: Arc<EventQueue>,
    status: watch::Sender<ChannelStatus>,
}

impl LiveChannel {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ChannelSettings,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            transport,
            settings,
            queue,
            status: watch::Sender::new(ChannelStatus::default()),
        }
    }

    /// Receiver for status changes; keeps the final status after the channel stops
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    /// Apply `f` to the status, notifying watchers only when state, health or
    /// the attempt counter changed
    fn update(&self, f: impl FnOnce(&mut ChannelStatus)) {
        self.status.send_if_modified(|status| {
            let before = (status.state, status.health, status.attempts);
            f(status);
            before != (status.state, status.health, status.attempts)
        });
    }

    /// Run until cancelled or until reconnecting is given up
    ///
    /// Returns the final status.
    pub async fn run(self, cancel: CancellationToken) -> ChannelStatus {
        let mut decoder = SseDecoder::new();
        let mut backoff = Backoff::new(
            self.settings.initial_reconnect_interval,
            self.settings.max_reconnect_interval,
        );
        let mut failures = 0u32;
        let mut malformed_streak = 0usize;
        let mut first = true;

        self.update(|s| s.state = ConnectionState::Connecting);
        info!("Live channel starting");

        loop {
            let last_event_id = decoder.last_event_id().map(str::to_owned);
            let connect = self.transport.connect(last_event_id);
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = connect => result,
            };

            match connected {
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Live channel connection failed");
                    self.update(|s| {
                        s.attempts = failures;
                        s.last_error = Some(e.to_string());
                    });

                    let limit = self.settings.max_reconnect_attempts;
                    if limit > 0 && failures >= limit {
                        error!(attempts = failures, error = %e, "Giving up on the live channel");
                        self.update(|s| {
                            s.state = ConnectionState::Disconnected;
                            s.health = ChannelHealth::Failed;
                        });
                        return self.status.borrow().clone();
                    }
                    self.update(|s| s.state = ConnectionState::Reconnecting);
                }
                Ok(stream) => {
                    failures = 0;
                    backoff.reset();
                    let reconnected = !first;
                    self.update(|s| {
                        s.state = ConnectionState::Connected;
                        s.attempts = 0;
                        if reconnected {
                            s.reconnects += 1;
                        }
                    });
                    if reconnected {
                        info!("Live channel reconnected");
                    } else {
                        info!("Live channel connected");
                    }

                    match self
                        .pump(stream, &mut decoder, &mut malformed_streak, &cancel)
                        .await
                    {
                        Disconnect::Cancelled => break,
                        Disconnect::Lost(e) => {
                            warn!(error = %e, "Live channel connection lost");
                            decoder.reset();
                            self.update(|s| {
                                s.state = ConnectionState::Reconnecting;
                                s.last_error = Some(e.to_string());
                            });
                        }
                    }
                }
            }
            first = false;

            if let Some(retry) = decoder.take_retry() {
                debug!(?retry, "Server requested a reconnect interval");
                backoff.set_initial(retry);
            }
            let delay = backoff.next_delay();
            debug!(?delay, "Waiting before reconnecting");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Live channel stopped");
        self.update(|s| s.state = ConnectionState::Disconnected);
        self.status.borrow().clone()
    }

    /// Read one connection until it ends, goes silent for longer than the
    /// idle timeout, or the channel is cancelled
    async fn pump(
        &self,
        mut stream: ByteStream,
        decoder: &mut SseDecoder,
        malformed_streak: &mut usize,
        cancel: &CancellationToken,
    ) -> Disconnect {
        loop {
            let next = async {
                match self.settings.idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, stream.next())
                        .await
                        .map_err(|_| ChannelError::IdleTimeout(limit)),
                    None => Ok(stream.next().await),
                }
            };
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Disconnect::Cancelled,
                chunk = next => chunk,
            };
            let bytes = match chunk {
                Err(e) | Ok(Some(Err(e))) => return Disconnect::Lost(e),
                Ok(None) => return Disconnect::Lost(ChannelError::StreamEnded),
                Ok(Some(Ok(bytes))) => bytes,
            };
            for message in decoder.feed(&bytes) {
                self.handle(message, malformed_streak);
            }
            for _ in 0..decoder.take_oversized() {
                self.reject(&"payload exceeds the size limit", None, malformed_streak);
            }
        }
    }

    fn handle(&self, message: Message, malformed_streak: &mut usize) {
        match parse_event(&message.data) {
            Ok(event) => {
                *malformed_streak = 0;
                debug!(
                    station = %event.id(),
                    kind = event.kind(),
                    version = ?event.version(),
                    "Received change event"
                );
                self.update(|s| {
                    s.received += 1;
                    if s.health == ChannelHealth::Degraded {
                        s.health = ChannelHealth::Healthy;
                    }
                });
                if !self.queue.push(event) {
                    debug!("Event queue closed, dropping event");
                }
            }
            Err(e) => self.reject(&e, message.event.as_deref(), malformed_streak),
        }
    }

    fn reject(
        &self,
        error: &dyn std::fmt::Display,
        event: Option<&str>,
        malformed_streak: &mut usize,
    ) {
        *malformed_streak += 1;
        warn!(error = %error, event = ?event, "Dropping malformed payload");
        let threshold = self.settings.degraded_parse_threshold;
        let degraded = threshold > 0 && *malformed_streak >= threshold;
        self.update(|s| {
            s.malformed += 1;
            if degraded && s.health == ChannelHealth::Healthy {
                s.health = ChannelHealth::Degraded;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Connection, End, ScriptedTransport};
    use super::*;
    use bytes::Bytes;
    use fuel_map_lib::ChangeEvent;
    use tokio::time::{Instant, timeout};

    const ADDED_A: &str =
        "data: {\"type\":\"added\",\"id\":\"a\",\"version\":1,\"fields\":{\"lat\":1.0,\"lon\":2.0}}\n\n";
    const ADDED_B: &str =
        "data: {\"type\":\"added\",\"id\":\"b\",\"version\":1,\"fields\":{\"lat\":3.0,\"lon\":4.0}}\n\n";
    const MALFORMED: &str = "data: {\"type\":\"updated\"}\n\n";

    fn settings() -> ChannelSettings {
        ChannelSettings {
            initial_reconnect_interval: Duration::from_millis(500),
            max_reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: 0,
            degraded_parse_threshold: 20,
            idle_timeout: None,
        }
    }

    fn channel(
        transport: &Arc<ScriptedTransport>,
        settings: ChannelSettings,
    ) -> (LiveChannel, Arc<EventQueue>, watch::Receiver<ChannelStatus>) {
        let queue = Arc::new(EventQueue::new(64));
        let channel = LiveChannel::new(transport.clone(), settings, queue.clone());
        let status = channel.subscribe();
        (channel, queue, status)
    }

    async fn collect(queue: &EventQueue, n: usize) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while events.len() < n {
            events.extend(queue.next_batch(n).await.unwrap());
        }
        events
    }

    async fn wait_state(status: &mut watch::Receiver<ChannelStatus>, state: ConnectionState) {
        timeout(Duration::from_secs(60), status.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));

        backoff.set_initial(Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            initial_reconnect_interval_ms: 250,
            max_reconnect_attempts: 7,
            ..Default::default()
        };
        let settings = ChannelSettings::from(&config);
        assert_eq!(settings.initial_reconnect_interval, Duration::from_millis(250));
        assert_eq!(settings.max_reconnect_interval, Duration::from_secs(30));
        assert_eq!(settings.max_reconnect_attempts, 7);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(60)));

        let config = Config {
            stream_idle_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(ChannelSettings::from(&config).idle_timeout, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_dropped_after_idle_timeout() {
        let transport = Arc::new(ScriptedTransport::new([
            Connection::open(&[ADDED_A], End::Hang),
            Connection::open(&[ADDED_B], End::Hang),
        ]));
        let settings = ChannelSettings {
            idle_timeout: Some(Duration::from_secs(5)),
            ..settings()
        };
        let (channel, queue, mut status) = channel(&transport, settings);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let task = tokio::spawn(channel.run(cancel.clone()));
        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "a");

        timeout(Duration::from_secs(60), status.wait_for(|s| s.reconnects == 1))
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(
            status
                .borrow()
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("No data received"))
        );
        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "b");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_connection_open() {
        let (tx, live) = Connection::live();
        let transport = Arc::new(ScriptedTransport::new([live]));
        let settings = ChannelSettings {
            idle_timeout: Some(Duration::from_secs(5)),
            ..settings()
        };
        let (channel, _queue, mut status) = channel(&transport, settings);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        wait_state(&mut status, ConnectionState::Connected).await;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.unbounded_send(Bytes::from_static(b": ping\n")).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let current = status.borrow().clone();
        assert_eq!(current.state, ConnectionState::Connected);
        assert_eq!(current.reconnects, 0);
        assert_eq!(current.last_error, None);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_keeps_channel_connected() {
        let transport = Arc::new(ScriptedTransport::new([Connection::open(
            &[ADDED_A, MALFORMED, ADDED_B],
            End::Hang,
        )]));
        let (channel, queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        let events = collect(&queue, 2).await;
        assert_eq!(events[0].id().as_str(), "a");
        assert_eq!(events[1].id().as_str(), "b");

        wait_state(&mut status, ConnectionState::Connected).await;
        let current = status.borrow().clone();
        assert_eq!(current.malformed, 1);
        assert_eq!(current.received, 2);
        assert_eq!(current.health, ChannelHealth::Healthy);

        cancel.cancel();
        let last = task.await.unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_counts_as_malformed() {
        let (tx, live) = Connection::live();
        let transport = Arc::new(ScriptedTransport::new([live]));
        let (channel, queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        wait_state(&mut status, ConnectionState::Connected).await;
        let filler = Bytes::from(vec![b'x'; 256 * 1024]);
        tx.unbounded_send(Bytes::from_static(b"data: ")).unwrap();
        for _ in 0..8 {
            tx.unbounded_send(filler.clone()).unwrap();
        }
        tx.unbounded_send(Bytes::from_static(b"\n\n")).unwrap();
        tx.unbounded_send(Bytes::from_static(ADDED_A.as_bytes())).unwrap();

        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "a");
        let current = status.borrow().clone();
        assert_eq!(current.malformed, 1);
        assert_eq!(current.received, 1);
        assert_eq!(current.state, ConnectionState::Connected);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_streak_degrades_until_valid_event() {
        let (tx, live) = Connection::live();
        let transport = Arc::new(ScriptedTransport::new([live]));
        let settings = ChannelSettings {
            degraded_parse_threshold: 2,
            ..settings()
        };
        let (channel, queue, mut status) = channel(&transport, settings);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        wait_state(&mut status, ConnectionState::Connected).await;
        tx.unbounded_send(Bytes::from_static(MALFORMED.as_bytes())).unwrap();
        tx.unbounded_send(Bytes::from_static(b"data: not json\n\n")).unwrap();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.health == ChannelHealth::Degraded),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.borrow().state, ConnectionState::Connected);

        tx.unbounded_send(Bytes::from_static(ADDED_A.as_bytes())).unwrap();
        timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.health == ChannelHealth::Healthy),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "a");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_connection_drop() {
        let (tx, live) = Connection::live();
        let transport = Arc::new(ScriptedTransport::new([
            live,
            Connection::open(&[ADDED_B], End::Hang),
        ]));
        let (channel, queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        wait_state(&mut status, ConnectionState::Connected).await;
        tx.unbounded_send(Bytes::from_static(ADDED_A.as_bytes())).unwrap();
        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "a");

        let dropped_at = Instant::now();
        drop(tx);
        wait_state(&mut status, ConnectionState::Reconnecting).await;
        wait_state(&mut status, ConnectionState::Connected).await;
        assert!(dropped_at.elapsed() <= Duration::from_millis(600));

        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "b");
        let current = status.borrow().clone();
        assert_eq!(current.reconnects, 1);
        assert_eq!(current.attempts, 0);
        assert!(current.last_error.is_some());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(transport.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = Arc::new(ScriptedTransport::new([
            Connection::Refuse("connection refused".into()),
            Connection::Refuse("connection refused".into()),
            Connection::Refuse("connection refused".into()),
        ]));
        let settings = ChannelSettings {
            max_reconnect_attempts: 3,
            ..settings()
        };
        let (channel, _queue, status) = channel(&transport, settings);

        let started = Instant::now();
        let last = channel.run(CancellationToken::new()).await;

        assert_eq!(last.state, ConnectionState::Disconnected);
        assert_eq!(last.health, ChannelHealth::Failed);
        assert_eq!(last.attempts, 3);
        assert!(last.last_error.unwrap().contains("connection refused"));
        assert_eq!(status.borrow().health, ChannelHealth::Failed);
        assert_eq!(transport.connects(), 3);
        // 500ms + 1000ms of backoff between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_reset_after_connecting() {
        let transport = Arc::new(ScriptedTransport::new([
            Connection::Refuse("refused".into()),
            Connection::open(&[ADDED_A], End::Error("reset by peer".into())),
            Connection::Refuse("refused".into()),
            Connection::open(&[], End::Hang),
        ]));
        let settings = ChannelSettings {
            max_reconnect_attempts: 2,
            ..settings()
        };
        let (channel, queue, mut status) = channel(&transport, settings);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        timeout(Duration::from_secs(60), status.wait_for(|s| s.reconnects == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.borrow().health, ChannelHealth::Healthy);
        assert_eq!(collect(&queue, 1).await[0].id().as_str(), "a");

        cancel.cancel();
        let last = task.await.unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert_eq!(transport.connects(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_sends_last_event_id() {
        let transport = Arc::new(ScriptedTransport::new([
            Connection::open(&["id: 7\n", ADDED_A], End::Close),
            Connection::open(&[], End::Hang),
        ]));
        let (channel, _queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        timeout(Duration::from_secs(60), status.wait_for(|s| s.reconnects == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transport.last_event_ids(), vec![None, Some("7".to_string())]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_field_overrides_reconnect_interval() {
        let transport = Arc::new(ScriptedTransport::new([
            Connection::open(&["retry: 100\n\n"], End::Close),
            Connection::open(&[], End::Hang),
        ]));
        let (channel, _queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let task = tokio::spawn(channel.run(cancel.clone()));
        timeout(Duration::from_secs(60), status.wait_for(|s| s.reconnects == 1))
            .await
            .unwrap()
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(500));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = Arc::new(ScriptedTransport::new([]));
        let (channel, _queue, mut status) = channel(&transport, settings());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        wait_state(&mut status, ConnectionState::Reconnecting).await;
        cancel.cancel();
        let last = task.await.unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert_eq!(last.health, ChannelHealth::Healthy);
        assert_eq!(transport.connects(), 1);
    }
}
