//! Graph reconciler: diff desired nodes/connections against what was last
//! applied and issue the minimal set of engine commands.
//!
//! Command order within one `apply`:
//!
//! 1. `removeNodes` (one batch) for tracked ids no longer desired
//! 2. `configureNodes` (one batch) for new or changed configurations
//! 3. `disconnect`, one call per stale connection, serially
//! 4. `connect`, one call per new connection, serially
//!
//! The reconciler is not reentrant. Callers must not overlap `apply` or
//! `force_configure_node` calls on the same instance; the conductor
//! serializes them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::engine::{ConnectionKey, Engine, NodeConfiguration};
use crate::error::SyncError;

/// What one `apply` actually did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub removed: Vec<String>,
    pub configured: Vec<String>,
    pub disconnected: Vec<ConnectionKey>,
    pub connected: Vec<ConnectionKey>,
    /// Desired connections held back because an endpoint is not configured
    pub deferred: Vec<ConnectionKey>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.configured.is_empty()
            && self.disconnected.is_empty()
            && self.connected.is_empty()
    }
}

#[derive(Debug, Default)]
struct AppliedGraph {
    nodes: BTreeMap<String, NodeConfiguration>,
    connections: BTreeSet<ConnectionKey>,
}

pub struct GraphReconciler {
    engine: Arc<dyn Engine>,
    applied: Mutex<AppliedGraph>,
}

impl GraphReconciler {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            applied: Mutex::new(AppliedGraph::default()),
        }
    }

    fn applied(&self) -> MutexGuard<'_, AppliedGraph> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Converge the engine graph on `desired_nodes` and `desired_connections`.
    ///
    /// Fails fast on the first engine error; tracking reflects every command
    /// that succeeded before it, so the next `apply` picks up where this one
    /// stopped.
    pub async fn apply(
        &self,
        desired_nodes: &[NodeConfiguration],
        desired_connections: &BTreeSet<ConnectionKey>,
    ) -> Result<ReconcileReport, SyncError> {
        let mut report = ReconcileReport::default();

        let desired: BTreeMap<&str, &NodeConfiguration> = desired_nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect();

        let (to_remove, to_configure, to_disconnect) = {
            let applied = self.applied();
            let to_remove: Vec<String> = applied
                .nodes
                .keys()
                .filter(|id| !desired.contains_key(id.as_str()))
                .cloned()
                .collect();
            let to_configure: Vec<NodeConfiguration> = desired
                .values()
                .filter(|node| applied.nodes.get(&node.id) != Some(*node))
                .map(|node| (*node).clone())
                .collect();
            // Diffed before removal so connections of removed nodes are
            // still disconnected explicitly.
            let to_disconnect: Vec<ConnectionKey> = applied
                .connections
                .difference(desired_connections)
                .cloned()
                .collect();
            (to_remove, to_configure, to_disconnect)
        };

        if !to_remove.is_empty() {
            debug!(count = to_remove.len(), nodes = ?to_remove, "Removing nodes");
            self.engine
                .remove_nodes(&to_remove)
                .await
                .map_err(|e| SyncError::engine("removeNodes", e))?;
            let mut applied = self.applied();
            for id in &to_remove {
                applied.nodes.remove(id);
                applied.connections.retain(|key| !key.touches(id));
            }
            report.removed = to_remove;
        }

        if !to_configure.is_empty() {
            debug!(count = to_configure.len(), "Configuring nodes");
            self.engine
                .configure_nodes(&to_configure)
                .await
                .map_err(|e| SyncError::engine("configureNodes", e))?;
            let mut applied = self.applied();
            for node in to_configure {
                report.configured.push(node.id.clone());
                applied.nodes.insert(node.id.clone(), node);
            }
        }

        for key in to_disconnect {
            self.engine
                .disconnect(&key.source, &key.destination)
                .await
                .map_err(|e| SyncError::engine("disconnect", e))?;
            self.applied().connections.remove(&key);
            debug!(connection = %key, "Disconnected");
            report.disconnected.push(key);
        }

        let to_connect: Vec<ConnectionKey> = {
            let applied = self.applied();
            let known =
                |id: &str| desired.contains_key(id) || applied.nodes.contains_key(id);
            desired_connections
                .iter()
                .filter(|key| !applied.connections.contains(*key))
                .filter(|key| {
                    let ready = known(key.source.as_str()) && known(key.destination.as_str());
                    if !ready {
                        report.deferred.push((*key).clone());
                    }
                    ready
                })
                .cloned()
                .collect()
        };

        for key in to_connect {
            self.engine
                .connect(&key.source, &key.destination)
                .await
                .map_err(|e| SyncError::engine("connect", e))?;
            self.applied().connections.insert(key.clone());
            debug!(connection = %key, "Connected");
            report.connected.push(key);
        }

        Ok(report)
    }

    /// Reconfigure a node even if its configuration looks unchanged. Used
    /// after a plugin restart, where the engine must rebind regardless.
    pub async fn force_configure_node(&self, node: NodeConfiguration) -> Result<(), SyncError> {
        self.engine
            .configure_nodes(std::slice::from_ref(&node))
            .await
            .map_err(|e| SyncError::engine("configureNodes", e))?;
        debug!(node.id = %node.id, "Force-configured node");
        self.applied().nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Last configuration applied for `id`
    pub fn applied_node(&self, id: &str) -> Option<NodeConfiguration> {
        self.applied().nodes.get(id).cloned()
    }

    pub fn applied_node_ids(&self) -> Vec<String> {
        self.applied().nodes.keys().cloned().collect()
    }

    pub fn applied_connections(&self) -> BTreeSet<ConnectionKey> {
        self.applied().connections.clone()
    }
}
