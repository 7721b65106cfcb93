//! Transport and diagnostics pollers
//!
//! Each poller pulls one snapshot from the engine per tick and fans it out
//! through a `watch` channel, so a late subscriber sees the current value
//! straight away. Ticks poll inline, so a tick that comes due while the
//! previous fetch is still running is skipped, not queued, and `stop`
//! cancels a fetch in progress.
//!
//! If the engine does not implement a surface, the poller publishes a
//! synthesized snapshot once and never calls the engine.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::engine::Engine;

/// Something a [`Poller`] can fetch snapshots from
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn supported(&self) -> bool;

    /// Snapshot published before the first fetch, and forever when the
    /// source is unsupported
    fn initial(&self) -> Self::Snapshot;

    async fn fetch(&self) -> Result<Self::Snapshot>;

    /// Snapshot to publish after a failed fetch; `None` keeps the previous one
    fn on_error(&self, error: &anyhow::Error) -> Option<Self::Snapshot>;
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub frame: u64,
    pub is_playing: bool,
    pub supported: bool,
}

pub struct TransportSource {
    engine: Arc<dyn Engine>,
}

impl TransportSource {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PollSource for TransportSource {
    type Snapshot = TransportSnapshot;

    fn name(&self) -> &'static str {
        "transport"
    }

    fn supported(&self) -> bool {
        self.engine.capabilities().transport
    }

    fn initial(&self) -> TransportSnapshot {
        TransportSnapshot {
            supported: self.supported(),
            ..TransportSnapshot::default()
        }
    }

    async fn fetch(&self) -> Result<TransportSnapshot> {
        let state = self.engine.transport_state().await?;
        Ok(TransportSnapshot {
            frame: state.frame,
            is_playing: state.is_playing,
            supported: true,
        })
    }

    fn on_error(&self, _error: &anyhow::Error) -> Option<TransportSnapshot> {
        None
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticsStatus {
    #[default]
    Ok,
    Unsupported,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub status: DiagnosticsStatus,
    pub xruns: u64,
    pub last_render_duration_micros: u64,
    pub clip_buffer_bytes: u64,
    pub error: Option<String>,
}

pub struct DiagnosticsSource {
    engine: Arc<dyn Engine>,
}

impl DiagnosticsSource {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PollSource for DiagnosticsSource {
    type Snapshot = DiagnosticsSnapshot;

    fn name(&self) -> &'static str {
        "diagnostics"
    }

    fn supported(&self) -> bool {
        self.engine.capabilities().diagnostics
    }

    fn initial(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            status: if self.supported() {
                DiagnosticsStatus::Ok
            } else {
                DiagnosticsStatus::Unsupported
            },
            ..DiagnosticsSnapshot::default()
        }
    }

    async fn fetch(&self) -> Result<DiagnosticsSnapshot> {
        let diagnostics = self.engine.render_diagnostics().await?;
        Ok(DiagnosticsSnapshot {
            status: DiagnosticsStatus::Ok,
            xruns: diagnostics.xruns,
            last_render_duration_micros: diagnostics.last_render_duration_micros,
            clip_buffer_bytes: diagnostics.clip_buffer_bytes,
            error: None,
        })
    }

    fn on_error(&self, error: &anyhow::Error) -> Option<DiagnosticsSnapshot> {
        Some(DiagnosticsSnapshot {
            status: DiagnosticsStatus::Error,
            error: Some(format!("{error:#}")),
            ..DiagnosticsSnapshot::default()
        })
    }
}

// =============================================================================
// POLLER
// =============================================================================

struct PollerInner<S: PollSource> {
    source: S,
    snapshots: watch::Sender<S::Snapshot>,
    /// Held for the duration of a fetch; released on cancellation too
    fetching: AsyncMutex<()>,
}

impl<S: PollSource> PollerInner<S> {
    async fn poll_once(&self) -> bool {
        if !self.source.supported() {
            return false;
        }
        let Ok(_fetching) = self.fetching.try_lock() else {
            debug!(poller = self.source.name(), "Previous poll still running; tick dropped");
            return false;
        };
        self.fetch_and_publish().await;
        true
    }

    async fn refresh(&self) -> bool {
        if !self.source.supported() {
            return false;
        }
        let _fetching = self.fetching.lock().await;
        self.fetch_and_publish().await;
        true
    }

    async fn fetch_and_publish(&self) {
        match self.source.fetch().await {
            Ok(snapshot) => {
                self.snapshots.send_replace(snapshot);
            }
            Err(e) => {
                warn!(poller = self.source.name(), error = %format!("{e:#}"), "Poll failed");
                if let Some(snapshot) = self.source.on_error(&e) {
                    self.snapshots.send_replace(snapshot);
                }
            }
        }
    }
}

pub struct Poller<S: PollSource> {
    inner: Arc<PollerInner<S>>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub type TransportPoller = Poller<TransportSource>;
pub type DiagnosticsPoller = Poller<DiagnosticsSource>;

impl TransportPoller {
    pub fn transport(engine: Arc<dyn Engine>, interval: Duration) -> Self {
        Poller::new(TransportSource::new(engine), interval)
    }
}

impl DiagnosticsPoller {
    pub fn diagnostics(engine: Arc<dyn Engine>, interval: Duration) -> Self {
        Poller::new(DiagnosticsSource::new(engine), interval)
    }
}

impl<S: PollSource> Poller<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(source.initial());
        Self {
            inner: Arc::new(PollerInner {
                source,
                snapshots,
                fetching: AsyncMutex::new(()),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Fetch and publish one snapshot now. Returns false when the source is
    /// unsupported or a poll is already in flight.
    pub async fn poll_once(&self) -> bool {
        self.inner.poll_once().await
    }

    /// Like [`poll_once`](Self::poll_once), but waits out a poll already in
    /// flight and then fetches again, so the published snapshot postdates
    /// the call. Returns false only when the source is unsupported.
    pub async fn refresh(&self) -> bool {
        self.inner.refresh().await
    }

    /// Receiver holding the current snapshot; dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<S::Snapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn current(&self) -> S::Snapshot {
        self.inner.snapshots.borrow().clone()
    }

    /// Start ticking. A no-op if already running or unsupported.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        if !self.inner.source.supported() {
            debug!(poller = self.inner.source.name(), "Unsupported by engine; not polling");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = self.interval.max(Duration::from_millis(1));
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.poll_once().await;
            }
        }));
        debug!(poller = self.inner.source.name(), interval_ms = period.as_millis() as u64, "Poller started");
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            debug!(poller = self.inner.source.name(), "Poller stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl<S: PollSource> Drop for Poller<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCapabilities, RenderDiagnostics, TransportState};
    use crate::testing::{EngineCall, RecordingEngine};

    #[tokio::test]
    async fn test_transport_poll_publishes_to_late_subscriber() {
        let engine = Arc::new(RecordingEngine::new());
        engine.set_transport(TransportState {
            frame: 4096,
            is_playing: true,
        });
        let poller = Poller::transport(engine.clone(), Duration::from_millis(120));

        assert!(poller.poll_once().await);
        let late = poller.subscribe();
        assert_eq!(
            *late.borrow(),
            TransportSnapshot {
                frame: 4096,
                is_playing: true,
                supported: true,
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_previous_snapshot() {
        let engine = Arc::new(RecordingEngine::new());
        engine.set_transport(TransportState {
            frame: 512,
            is_playing: true,
        });
        let poller = Poller::transport(engine.clone(), Duration::from_millis(120));
        poller.poll_once().await;

        engine.set_transport(TransportState {
            frame: 1024,
            is_playing: true,
        });
        engine.fail_once(|call| matches!(call, EngineCall::TransportState));
        poller.poll_once().await;

        assert_eq!(poller.current().frame, 512);
    }

    #[tokio::test]
    async fn test_diagnostics_failure_publishes_error_status() {
        let engine = Arc::new(RecordingEngine::new());
        engine.set_diagnostics(RenderDiagnostics {
            xruns: 3,
            last_render_duration_micros: 800,
            clip_buffer_bytes: 1 << 20,
        });
        let poller = Poller::diagnostics(engine.clone(), Duration::from_millis(1500));

        poller.poll_once().await;
        assert_eq!(poller.current().xruns, 3);
        assert_eq!(poller.current().status, DiagnosticsStatus::Ok);

        engine.fail_once(|call| matches!(call, EngineCall::RenderDiagnostics));
        poller.poll_once().await;
        let snapshot = poller.current();
        assert_eq!(snapshot.status, DiagnosticsStatus::Error);
        assert!(snapshot.error.unwrap().contains("getRenderDiagnostics"));
    }

    #[tokio::test]
    async fn test_unsupported_never_calls_engine() {
        let engine = Arc::new(RecordingEngine::new().with_capabilities(EngineCapabilities {
            transport: false,
            diagnostics: false,
        }));
        let transport = Poller::transport(engine.clone(), Duration::from_millis(1));
        let diagnostics = Poller::diagnostics(engine.clone(), Duration::from_millis(1));

        transport.start();
        diagnostics.start();
        assert!(!transport.poll_once().await);
        assert!(!diagnostics.poll_once().await);

        assert!(!transport.is_running());
        assert!(!transport.current().supported);
        assert_eq!(diagnostics.current().status, DiagnosticsStatus::Unsupported);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_dropped() {
        let engine = Arc::new(RecordingEngine::new().with_latency(Duration::from_millis(20)));
        let poller = Poller::transport(engine.clone(), Duration::from_millis(120));

        let (first, second) = tokio::join!(poller.poll_once(), poller.poll_once());
        assert!(first);
        assert!(!second);
        assert_eq!(engine.calls().len(), 1);

        // Flag is cleared afterwards
        assert!(poller.poll_once().await);
    }

    #[tokio::test]
    async fn test_refresh_waits_for_inflight_poll_then_fetches() {
        let engine = Arc::new(RecordingEngine::new().with_latency(Duration::from_millis(20)));
        engine.set_transport(TransportState {
            frame: 100,
            is_playing: false,
        });
        let poller = Poller::transport(engine.clone(), Duration::from_millis(120));

        let (polled, refreshed) = tokio::join!(poller.poll_once(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.set_transport(TransportState {
                frame: 200,
                is_playing: true,
            });
            poller.refresh().await
        });

        assert!(polled);
        assert!(refreshed);
        assert_eq!(engine.calls().len(), 2);
        assert_eq!(poller.current().frame, 200);
        assert!(poller.current().is_playing);
    }

    #[tokio::test]
    async fn test_refresh_on_unsupported_source_is_false() {
        let engine = Arc::new(RecordingEngine::new().with_capabilities(EngineCapabilities {
            transport: false,
            diagnostics: false,
        }));
        let poller = Poller::transport(engine.clone(), Duration::from_millis(120));

        assert!(!poller.refresh().await);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_fetch() {
        let engine = Arc::new(RecordingEngine::new().with_latency(Duration::from_millis(40)));
        engine.set_transport(TransportState {
            frame: 777,
            is_playing: true,
        });
        let poller = Poller::transport(engine.clone(), Duration::from_millis(5));

        poller.start();
        // First tick fires immediately; its fetch is now sleeping in the engine
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.calls().len(), 1);
        poller.stop();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(engine.calls().len(), 1);
        assert_eq!(poller.current().frame, 0);
        assert!(!poller.current().is_playing);
        // Cancelled fetch released the lock
        assert!(poller.poll_once().await);
    }

    #[tokio::test]
    async fn test_started_poller_notifies_subscribers() {
        let engine = Arc::new(RecordingEngine::new());
        engine.set_transport(TransportState {
            frame: 48_000,
            is_playing: true,
        });
        let poller = Poller::transport(engine.clone(), Duration::from_millis(5));
        let mut updates = poller.subscribe();

        poller.start();
        assert!(poller.is_running());
        tokio::time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updates.borrow().frame, 48_000);

        poller.stop();
        assert!(!poller.is_running());
    }
}
