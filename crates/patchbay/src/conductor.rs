//! Top-level convergence flows
//!
//! The conductor owns every component and drives them in a fixed order for
//! each new session revision:
//!
//! 1. build the desired state (binding plugins, fetching clip buffers)
//! 2. reconcile the graph
//! 3. publish automation
//! 4. retain newly required buffers, release buffers no longer required
//! 5. release stale plugin bindings
//! 6. purge buffers that were fetched but never retained
//! 7. record the recovery snapshot and the revision
//!
//! Session updates, crash recovery and manual retries all take the same
//! convergence lock, so they never interleave.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use patchconf::PatchConfig;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::automation::{AutomationPublisher, PublishReport};
use crate::buffer_cache::BufferCache;
use crate::desired::{DesiredState, DesiredStateBuilder, SkippedClip};
use crate::engine::{AudioFileLoader, DescriptorResolver, Engine, PluginHost};
use crate::error::SyncError;
use crate::fingerprint::BufferKey;
use crate::plugins::PluginLifecycleManager;
use crate::pollers::{DiagnosticsPoller, DiagnosticsSnapshot, Poller, TransportPoller, TransportSnapshot};
use crate::reconciler::{GraphReconciler, ReconcileReport};
use crate::recovery::{CrashRecoveryCoordinator, CrashWatch, RecoverySnapshot};
use crate::session::Session;

/// The external systems a conductor drives
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn Engine>,
    pub host: Arc<dyn PluginHost>,
    pub loader: Arc<dyn AudioFileLoader>,
    pub resolver: Arc<dyn DescriptorResolver>,
}

/// Outcome of one `apply_session`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ConvergenceReport {
    /// Revision already applied; nothing was sent to the engine
    Unchanged { revision: u64 },
    Applied(AppliedRevision),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRevision {
    pub revision: u64,
    pub graph: ReconcileReport,
    pub automation: PublishReport,
    pub buffers_retained: usize,
    pub buffers_released: usize,
    pub buffers_purged: usize,
    pub plugins_released: Vec<String>,
    pub offline_plugins: Vec<String>,
    pub skipped_clips: Vec<SkippedClip>,
}

#[derive(Default)]
struct AppliedSession {
    revision: Option<u64>,
    session: Option<Arc<Session>>,
    /// Buffers this conductor holds a reference on
    buffers: BTreeSet<BufferKey>,
}

pub struct Conductor {
    engine: Arc<dyn Engine>,
    cache: BufferCache,
    plugins: Arc<PluginLifecycleManager>,
    reconciler: Arc<GraphReconciler>,
    automation: Arc<AutomationPublisher>,
    recovery: Arc<CrashRecoveryCoordinator>,
    builder: DesiredStateBuilder,
    transport: TransportPoller,
    diagnostics: DiagnosticsPoller,
    convergence: Arc<tokio::sync::Mutex<()>>,
    applied: Mutex<AppliedSession>,
    crash_watch: Mutex<Option<CrashWatch>>,
}

impl Conductor {
    pub fn new(config: &PatchConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            engine,
            host,
            loader,
            resolver,
        } = collaborators;

        let cache = BufferCache::new(engine.clone(), loader);
        let plugins = Arc::new(PluginLifecycleManager::new(
            host.clone(),
            resolver,
            config.plugins.clone(),
        ));
        let reconciler = Arc::new(GraphReconciler::new(engine.clone()));
        let automation = Arc::new(AutomationPublisher::new(engine.clone(), host.clone()));
        let convergence = Arc::new(tokio::sync::Mutex::new(()));
        let recovery = Arc::new(CrashRecoveryCoordinator::new(
            host,
            plugins.clone(),
            reconciler.clone(),
            automation.clone(),
            convergence.clone(),
        ));
        let builder = DesiredStateBuilder::new(cache.clone(), plugins.clone(), config.engine.clone());

        Self {
            transport: Poller::transport(engine.clone(), config.polling.transport_interval()),
            diagnostics: Poller::diagnostics(engine.clone(), config.polling.diagnostics_interval()),
            engine,
            cache,
            plugins,
            reconciler,
            automation,
            recovery,
            builder,
            convergence,
            applied: Mutex::new(AppliedSession::default()),
            crash_watch: Mutex::new(None),
        }
    }

    fn applied(&self) -> MutexGuard<'_, AppliedSession> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn crash_watch(&self) -> MutexGuard<'_, Option<CrashWatch>> {
        self.crash_watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the pollers and the crash watch. Needs a running tokio runtime.
    pub fn start(&self) {
        self.transport.start();
        self.diagnostics.start();
        let mut watch = self.crash_watch();
        if watch.is_none() {
            *watch = Some(self.recovery.spawn_watch());
        }
        info!("Conductor started");
    }

    /// Converge the engine on `session`.
    ///
    /// Re-applying the last revision is a no-op; an older revision is
    /// rejected. On error the revision is not recorded, so the same
    /// snapshot can be applied again.
    pub async fn apply_session(&self, session: Arc<Session>) -> Result<ConvergenceReport, SyncError> {
        let _converging = self.convergence.lock().await;

        let last_applied = self.applied().revision;
        if let Some(last_applied) = last_applied {
            if session.revision == last_applied {
                debug!(revision = session.revision, "Revision already applied");
                return Ok(ConvergenceReport::Unchanged {
                    revision: session.revision,
                });
            }
            if session.revision < last_applied {
                return Err(SyncError::RevisionRegression {
                    last_applied,
                    incoming: session.revision,
                });
            }
        }

        let crashed = self.recovery.crashed();
        let desired = self.builder.build(&session, &crashed).await?;
        let graph = self
            .reconciler
            .apply(&desired.nodes, &desired.connections)
            .await?;
        let automation = self
            .automation
            .apply_changes(desired.automation.clone())
            .await?;
        let (buffers_retained, buffers_released) = self.swap_buffers(&desired.buffers).await;

        let active = desired.active_instances();
        let plugins_released = self.plugins.release_stale(&active).await;
        self.recovery.retain_crashed(&active);
        let buffers_purged = self.cache.purge_unreferenced().await;

        self.recovery
            .record_snapshot(RecoverySnapshot::from_desired(&desired));
        {
            let mut applied = self.applied();
            applied.revision = Some(session.revision);
            applied.session = Some(Arc::clone(&session));
        }

        info!(
            session.id = %session.id,
            revision = session.revision,
            configured = graph.configured.len(),
            removed = graph.removed.len(),
            connected = graph.connected.len(),
            disconnected = graph.disconnected.len(),
            published = automation.published.len(),
            skipped_clips = desired.skipped_clips.len(),
            offline_plugins = desired.offline_plugins.len(),
            "Session converged"
        );

        Ok(ConvergenceReport::Applied(AppliedRevision {
            revision: session.revision,
            graph,
            automation,
            buffers_retained,
            buffers_released,
            buffers_purged,
            plugins_released,
            offline_plugins: desired.offline_plugins,
            skipped_clips: desired.skipped_clips,
        }))
    }

    /// Derive the desired state for `session` without reconciling it.
    ///
    /// Still binds plugins and fetches clip buffers, since both feed the
    /// derived configuration.
    pub async fn plan(&self, session: &Session) -> Result<DesiredState, SyncError> {
        let _converging = self.convergence.lock().await;
        let crashed = self.recovery.crashed();
        self.builder.build(session, &crashed).await
    }

    /// Hold references on exactly `required`
    async fn swap_buffers(&self, required: &BTreeSet<BufferKey>) -> (usize, usize) {
        let held = self.applied().buffers.clone();

        let added: Vec<&BufferKey> = required.difference(&held).collect();
        for key in &added {
            self.cache.retain(key);
        }
        let removed: Vec<BufferKey> = held.difference(required).cloned().collect();
        self.applied().buffers = required.clone();

        for key in &removed {
            self.cache.release(key).await;
        }
        (added.len(), removed.len())
    }

    /// Manually restart a crashed plugin instance
    pub async fn retry_plugin(&self, instance_id: &str) -> Result<bool, SyncError> {
        self.recovery.retry(instance_id).await
    }

    pub async fn start_transport(&self) -> Result<(), SyncError> {
        self.engine
            .start_transport()
            .await
            .map_err(|e| SyncError::engine("startTransport", e))?;
        self.transport.refresh().await;
        Ok(())
    }

    pub async fn stop_transport(&self) -> Result<(), SyncError> {
        self.engine
            .stop_transport()
            .await
            .map_err(|e| SyncError::engine("stopTransport", e))?;
        self.transport.refresh().await;
        Ok(())
    }

    pub async fn locate(&self, frame: u64) -> Result<(), SyncError> {
        self.engine
            .locate_transport(frame)
            .await
            .map_err(|e| SyncError::engine("locateTransport", e))?;
        self.transport.refresh().await;
        Ok(())
    }

    pub fn subscribe_transport(&self) -> watch::Receiver<TransportSnapshot> {
        self.transport.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> watch::Receiver<DiagnosticsSnapshot> {
        self.diagnostics.subscribe()
    }

    pub async fn refresh_diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.refresh().await;
        self.diagnostics.current()
    }

    pub fn last_applied_revision(&self) -> Option<u64> {
        self.applied().revision
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.applied().session.clone()
    }

    pub fn crashed_plugins(&self) -> BTreeSet<String> {
        self.recovery.crashed()
    }

    pub fn buffer_cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn plugins(&self) -> &PluginLifecycleManager {
        &self.plugins
    }

    pub fn recovery(&self) -> &Arc<CrashRecoveryCoordinator> {
        &self.recovery
    }

    /// Stop background work and release every plugin binding and clip
    /// buffer. Failures are logged inside each release; nothing propagates.
    pub async fn shutdown(&self) {
        self.transport.stop();
        self.diagnostics.stop();
        let watch = self.crash_watch().take();
        if let Some(watch) = watch {
            watch.stop();
        }

        let _converging = self.convergence.lock().await;
        let plugins = self.plugins.release_all().await;
        self.cache.clear().await;
        *self.applied() = AppliedSession::default();
        info!(plugins, "Conductor shut down");
    }
}
