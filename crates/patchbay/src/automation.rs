//! Automation publisher
//!
//! Tracks the signature of every lane it has published and only pushes
//! lanes whose signature changed. Lanes that disappear from the request set
//! are cleared (one point at frame 0 holding the last value) before they are
//! forgotten.
//!
//! All entry points run behind one `tokio::sync::Mutex`. Its waiters acquire
//! in arrival order, so a crash replay and a session update queue behind one
//! another instead of interleaving publishes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::{AutomationLane, Engine, PluginHost};
use crate::error::SyncError;
use crate::fingerprint::Fingerprint;

/// Where a lane is published
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AutomationTarget {
    /// An engine node parameter, published with `publishAutomation`
    #[serde(rename_all = "camelCase")]
    Node { node_id: String },
    /// A parameter inside a hosted plugin, scheduled on the host
    #[serde(rename_all = "camelCase")]
    Plugin {
        instance_id: String,
        host_instance_id: String,
        parameter_id: String,
    },
}

/// One lane to publish, with its identity key and content signature.
///
/// The key names the slot (`node:{node}:{param}` or
/// `plugin:{instance}:{param}`); the signature covers target and points, so
/// a plugin rebound under a new host instance id republishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRequest {
    pub key: String,
    pub target: AutomationTarget,
    pub lane: AutomationLane,
    pub signature: Fingerprint,
}

impl AutomationRequest {
    pub fn node(node_id: impl Into<String>, lane: AutomationLane) -> Self {
        let node_id = node_id.into();
        let key = format!("node:{}:{}", node_id, lane.parameter);
        Self::build(key, AutomationTarget::Node { node_id }, lane)
    }

    pub fn plugin(
        instance_id: impl Into<String>,
        host_instance_id: impl Into<String>,
        lane: AutomationLane,
    ) -> Self {
        let instance_id = instance_id.into();
        let key = format!("plugin:{}:{}", instance_id, lane.parameter);
        let target = AutomationTarget::Plugin {
            instance_id,
            host_instance_id: host_instance_id.into(),
            parameter_id: lane.parameter.clone(),
        };
        Self::build(key, target, lane)
    }

    fn build(key: String, target: AutomationTarget, lane: AutomationLane) -> Self {
        let signature = Fingerprint::of(&(&target, &lane));
        Self {
            key,
            target,
            lane,
            signature,
        }
    }

    /// Same slot, single point at frame 0 holding the last value
    pub fn clearing(&self) -> Self {
        Self::build(self.key.clone(), self.target.clone(), self.lane.clearing())
    }

    /// Session-level plugin instance this request drives, if any
    pub fn instance_id(&self) -> Option<&str> {
        match &self.target {
            AutomationTarget::Plugin { instance_id, .. } => Some(instance_id),
            AutomationTarget::Node { .. } => None,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match &self.target {
            AutomationTarget::Node { node_id } => Some(node_id),
            AutomationTarget::Plugin { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PublishReport {
    pub published: Vec<String>,
    pub cleared: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone)]
struct Published {
    signature: Fingerprint,
    request: AutomationRequest,
}

pub struct AutomationPublisher {
    engine: Arc<dyn Engine>,
    host: Arc<dyn PluginHost>,
    state: Mutex<BTreeMap<String, Published>>,
}

impl AutomationPublisher {
    pub fn new(engine: Arc<dyn Engine>, host: Arc<dyn PluginHost>) -> Self {
        Self {
            engine,
            host,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Publish changed lanes and clear lanes that are no longer requested.
    ///
    /// Every request is attempted even after a failure; the first error is
    /// returned once the whole batch has run. A failed clear keeps its key
    /// tracked so the next call retries it.
    pub async fn apply_changes(
        &self,
        requests: Vec<AutomationRequest>,
    ) -> Result<PublishReport, SyncError> {
        let mut state = self.state.lock().await;
        let mut report = PublishReport::default();
        let mut first_error: Option<SyncError> = None;

        let desired: BTreeMap<String, AutomationRequest> = requests
            .into_iter()
            .map(|request| (request.key.clone(), request))
            .collect();

        for (key, request) in &desired {
            if state.get(key).map(|p| &p.signature) == Some(&request.signature) {
                continue;
            }
            match self.publish(request).await {
                Ok(()) => {
                    state.insert(
                        key.clone(),
                        Published {
                            signature: request.signature.clone(),
                            request: request.clone(),
                        },
                    );
                    report.published.push(key.clone());
                }
                Err(e) => {
                    warn!(automation.key = %key, error = %e, "Automation publish failed");
                    report.failed.push(key.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        let stale: Vec<(String, AutomationRequest)> = state
            .iter()
            .filter(|(key, _)| !desired.contains_key(*key))
            .map(|(key, published)| (key.clone(), published.request.clearing()))
            .collect();

        for (key, clear) in stale {
            match self.publish(&clear).await {
                Ok(()) => {
                    state.remove(&key);
                    report.cleared.push(key);
                }
                Err(e) => {
                    warn!(automation.key = %key, error = %e, "Automation clear failed; will retry");
                    report.failed.push(key);
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(
            published = report.published.len(),
            cleared = report.cleared.len(),
            failed = report.failed.len(),
            "Automation changes applied"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Publish `requests` unconditionally and record them, leaving other
    /// tracked keys alone. Used to restore lanes on a restarted plugin.
    pub async fn replay(&self, requests: Vec<AutomationRequest>) -> Result<PublishReport, SyncError> {
        let mut state = self.state.lock().await;
        let mut report = PublishReport::default();
        let mut first_error: Option<SyncError> = None;

        for request in requests {
            match self.publish(&request).await {
                Ok(()) => {
                    report.published.push(request.key.clone());
                    state.insert(
                        request.key.clone(),
                        Published {
                            signature: request.signature.clone(),
                            request,
                        },
                    );
                }
                Err(e) => {
                    warn!(automation.key = %request.key, error = %e, "Automation replay failed");
                    report.failed.push(request.key);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Drop tracked state for a plugin instance: its parameter lanes and any
    /// lanes published on `node_ids`. Nothing is sent to the engine.
    pub async fn forget_instance(&self, instance_id: &str, node_ids: &[String]) -> usize {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|_, published| {
            let request = &published.request;
            let owned = request.instance_id() == Some(instance_id)
                || request
                    .node_id()
                    .is_some_and(|node| node_ids.iter().any(|id| id == node));
            !owned
        });
        let dropped = before - state.len();
        debug!(instance.id = %instance_id, dropped, "Forgot automation state");
        dropped
    }

    /// Signatures of every tracked key
    pub async fn tracked(&self) -> BTreeMap<String, Fingerprint> {
        self.state
            .lock()
            .await
            .iter()
            .map(|(key, published)| (key.clone(), published.signature.clone()))
            .collect()
    }

    async fn publish(&self, request: &AutomationRequest) -> Result<(), SyncError> {
        match &request.target {
            AutomationTarget::Node { node_id } => self
                .engine
                .publish_automation(node_id, &request.lane)
                .await
                .map_err(|e| SyncError::engine("publishAutomation", e)),
            AutomationTarget::Plugin {
                instance_id,
                host_instance_id,
                parameter_id,
            } => self
                .host
                .schedule_automation(host_instance_id, parameter_id, &request.lane.points)
                .await
                .map_err(|e| SyncError::plugin(instance_id.clone(), e)),
        }
    }
}
