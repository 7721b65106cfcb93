//! Plugin crash recovery
//!
//! Listens for host crash notifications. A crash the host recovered from on
//! its own is rebound to the restarted instance and its last-known node
//! configuration and automation are replayed. An unrecovered crash evicts
//! the binding, forgets the instance's automation and parks the node
//! offline until `retry` brings it back.
//!
//! Rebinds share the conductor's convergence lock, so a retry, an automatic
//! recovery and a session update never interleave. Running the same rebind
//! twice is harmless: the second one binds to whatever runtime the host
//! reports at that point.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::automation::{AutomationPublisher, AutomationRequest};
use crate::desired::{plugin_configuration, DesiredState, PluginAutomation, PluginNodeState};
use crate::engine::{PluginCrash, PluginHost};
use crate::error::SyncError;
use crate::plugins::PluginLifecycleManager;
use crate::reconciler::GraphReconciler;

/// What was last converged, kept for replay onto restarted plugins
#[derive(Debug, Clone, Default)]
pub struct RecoverySnapshot {
    pub plugin_nodes: BTreeMap<String, PluginNodeState>,
    pub plugin_automation: Vec<PluginAutomation>,
    pub automation_requests: Vec<AutomationRequest>,
}

impl RecoverySnapshot {
    pub fn from_desired(state: &DesiredState) -> Self {
        Self {
            plugin_nodes: state.plugin_nodes.clone(),
            plugin_automation: state.plugin_automation.clone(),
            automation_requests: state.automation.clone(),
        }
    }

    /// Lanes to replay for `instance_id` once it runs as `host_instance_id`:
    /// its parameter automation plus node lanes on its engine node.
    pub fn replay_requests(&self, instance_id: &str, host_instance_id: &str) -> Vec<AutomationRequest> {
        let node_id = self
            .plugin_nodes
            .get(instance_id)
            .map(|state| state.engine_node_id.as_str());

        let plugin_lanes = self
            .plugin_automation
            .iter()
            .filter(|pa| pa.instance_id == instance_id)
            .map(|pa| pa.request(host_instance_id));
        let node_lanes = self
            .automation_requests
            .iter()
            .filter(|request| node_id.is_some() && request.node_id() == node_id)
            .cloned();
        plugin_lanes.chain(node_lanes).collect()
    }
}

pub struct CrashRecoveryCoordinator {
    host: Arc<dyn PluginHost>,
    plugins: Arc<PluginLifecycleManager>,
    reconciler: Arc<GraphReconciler>,
    automation: Arc<AutomationPublisher>,
    convergence: Arc<tokio::sync::Mutex<()>>,
    snapshot: Mutex<Arc<RecoverySnapshot>>,
    crashed: Mutex<BTreeSet<String>>,
}

impl CrashRecoveryCoordinator {
    pub fn new(
        host: Arc<dyn PluginHost>,
        plugins: Arc<PluginLifecycleManager>,
        reconciler: Arc<GraphReconciler>,
        automation: Arc<AutomationPublisher>,
        convergence: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            host,
            plugins,
            reconciler,
            automation,
            convergence,
            snapshot: Mutex::new(Arc::new(RecoverySnapshot::default())),
            crashed: Mutex::new(BTreeSet::new()),
        }
    }

    fn crashed_set(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.crashed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot; called after every successful convergence.
    pub fn record_snapshot(&self, snapshot: RecoverySnapshot) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<RecoverySnapshot> {
        Arc::clone(&self.snapshot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Instances crashed and waiting for a manual retry
    pub fn crashed(&self) -> BTreeSet<String> {
        self.crashed_set().clone()
    }

    pub fn is_crashed(&self, instance_id: &str) -> bool {
        self.crashed_set().contains(instance_id)
    }

    /// Forget crash state for instances no longer in the session
    pub fn retain_crashed(&self, active: &BTreeSet<String>) {
        self.crashed_set().retain(|id| active.contains(id));
    }

    pub async fn handle_crash(&self, crash: PluginCrash) -> Result<(), SyncError> {
        if crash.recovered {
            info!(instance.id = %crash.instance_id, "Plugin restarted by host; replaying state");
            let _converging = self.convergence.lock().await;
            self.rebind_and_replay(&crash.instance_id).await
        } else {
            let _converging = self.convergence.lock().await;
            self.park_offline(&crash.instance_id).await
        }
    }

    /// Ask the host to restart a crashed instance and, if it comes back,
    /// rebind and replay it. Returns whether the instance is running again.
    pub async fn retry(&self, instance_id: &str) -> Result<bool, SyncError> {
        let _converging = self.convergence.lock().await;
        if !self.snapshot().plugin_nodes.contains_key(instance_id) {
            return Err(SyncError::UnknownInstance(instance_id.to_string()));
        }

        let restarted = self
            .host
            .retry_instance(instance_id)
            .await
            .map_err(|e| SyncError::plugin(instance_id, e))?;
        if !restarted {
            warn!(instance.id = %instance_id, "Host could not restart plugin");
            return Ok(false);
        }

        self.rebind_and_replay(instance_id).await?;
        Ok(true)
    }

    /// Spawn a task handling crash notifications until the watch is dropped.
    ///
    /// Subscribes before returning, so every crash after this call is seen.
    pub fn spawn_watch(self: &Arc<Self>) -> CrashWatch {
        let mut events = self.host.crash_events();
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(crash) => {
                        let instance_id = crash.instance_id.clone();
                        if let Err(e) = coordinator.handle_crash(crash).await {
                            error!(instance.id = %instance_id, error = %e, "Crash handling failed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Crash notifications dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        CrashWatch {
            handle: Some(handle),
        }
    }

    async fn park_offline(&self, instance_id: &str) -> Result<(), SyncError> {
        self.plugins.evict(instance_id);
        self.crashed_set().insert(instance_id.to_string());

        let snapshot = self.snapshot();
        let state = snapshot.plugin_nodes.get(instance_id);
        let node_ids: Vec<String> = state
            .map(|s| vec![s.engine_node_id.clone()])
            .unwrap_or_default();
        self.automation.forget_instance(instance_id, &node_ids).await;

        warn!(instance.id = %instance_id, "Plugin crashed; offline until retried");

        if let Some(state) = state {
            let offline = plugin_configuration(&state.engine_node_id, &state.node, None);
            self.reconciler.force_configure_node(offline).await?;
        }
        Ok(())
    }

    async fn rebind_and_replay(&self, instance_id: &str) -> Result<(), SyncError> {
        let snapshot = self.snapshot();
        let state = snapshot
            .plugin_nodes
            .get(instance_id)
            .ok_or_else(|| SyncError::UnknownInstance(instance_id.to_string()))?;

        let runtime = self
            .host
            .instance_runtime(instance_id)
            .await
            .map_err(|e| SyncError::plugin(instance_id, e))?
            .ok_or_else(|| SyncError::plugin(instance_id, anyhow!("host reports no runtime")))?;

        let binding = self.plugins.rebind(&state.node, runtime)?;
        let online = plugin_configuration(&state.engine_node_id, &state.node, Some(&binding));
        self.reconciler.force_configure_node(online).await?;
        self.crashed_set().remove(instance_id);

        self.automation
            .forget_instance(instance_id, std::slice::from_ref(&state.engine_node_id))
            .await;
        let requests = snapshot.replay_requests(instance_id, &binding.host_instance_id);
        let replayed = requests.len();
        self.automation.replay(requests).await?;

        info!(
            instance.id = %instance_id,
            host.instance = %binding.host_instance_id,
            replayed,
            "Plugin state replayed"
        );
        Ok(())
    }
}

/// Running crash watch; aborts the task on `stop` or drop
pub struct CrashWatch {
    handle: Option<JoinHandle<()>>,
}

impl CrashWatch {
    pub fn stop(mut self) {
        self.abort();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for CrashWatch {
    fn drop(&mut self) {
        self.abort();
    }
}
