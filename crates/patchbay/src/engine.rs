//! External collaborators and the values that cross their boundary
//!
//! The render engine, plugin host, audio file loader and descriptor resolver
//! all live outside this crate. Every engine and host operation is async and
//! may fail; failures come back as `anyhow::Error` and are given context by
//! the caller.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::fingerprint::BufferKey;
use crate::session::PluginNode;

// =============================================================================
// NODE CONFIGURATION
// =============================================================================

/// Engine-side node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    TrackInput,
    TrackOutput,
    Plugin,
    Send,
    Return,
    SidechainTap,
    ClipPlayer,
    MasterOutput,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::TrackInput => "trackInput",
            NodeType::TrackOutput => "trackOutput",
            NodeType::Plugin => "plugin",
            NodeType::Send => "send",
            NodeType::Return => "return",
            NodeType::SidechainTap => "sidechainTap",
            NodeType::ClipPlayer => "clipPlayer",
            NodeType::MasterOutput => "masterOutput",
        }
    }
}

/// A single node option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Number(v)
    }
}

impl From<u64> for OptionValue {
    fn from(v: u64) -> Self {
        OptionValue::Number(v as f64)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        OptionValue::Number(v as f64)
    }
}

impl From<usize> for OptionValue {
    fn from(v: usize) -> Self {
        OptionValue::Number(v as f64)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

/// Engine-facing `(id, type, options)` triple.
///
/// Two configurations are equal iff id, type and every option key/value
/// match; the reconciler relies on that equality to skip no-op reconfigures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfiguration {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl NodeConfiguration {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }
}

/// Canonical `source→destination` key; the unit of connection diffing
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub source: String,
    pub destination: String,
}

impl ConnectionKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Whether either end is `node_id`
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.destination == node_id
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{}", self.source, self.destination)
    }
}

// =============================================================================
// AUTOMATION LANES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LanePoint {
    pub frame: u64,
    pub value: f64,
}

/// Frame-domain automation for one parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationLane {
    pub parameter: String,
    pub points: Vec<LanePoint>,
}

impl AutomationLane {
    /// Build a lane; points are sorted by frame and deduplicated with the
    /// later write winning.
    pub fn new(parameter: impl Into<String>, points: impl IntoIterator<Item = LanePoint>) -> Self {
        let mut sorted: Vec<LanePoint> = points.into_iter().collect();
        sorted.sort_by_key(|p| p.frame);
        let mut deduped: Vec<LanePoint> = Vec::with_capacity(sorted.len());
        for point in sorted {
            match deduped.last_mut() {
                Some(last) if last.frame == point.frame => *last = point,
                _ => deduped.push(point),
            }
        }
        Self {
            parameter: parameter.into(),
            points: deduped,
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.points.last().map(|p| p.value)
    }

    /// Single point at frame 0 holding the last known value; published when a
    /// lane disappears so the parameter stops moving.
    pub fn clearing(&self) -> Self {
        Self {
            parameter: self.parameter.clone(),
            points: vec![LanePoint {
                frame: 0,
                value: self.last_value().unwrap_or(0.0),
            }],
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportState {
    pub frame: u64,
    pub is_playing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderDiagnostics {
    pub xruns: u64,
    pub last_render_duration_micros: u64,
    pub clip_buffer_bytes: u64,
}

/// Which optional surfaces an engine implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub transport: bool,
    pub diagnostics: bool,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            transport: true,
            diagnostics: true,
        }
    }
}

/// Command surface of the native render engine
#[async_trait]
pub trait Engine: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    async fn configure_nodes(&self, nodes: &[NodeConfiguration]) -> Result<()>;

    async fn remove_nodes(&self, ids: &[String]) -> Result<()>;

    async fn connect(&self, source: &str, destination: &str) -> Result<()>;

    async fn disconnect(&self, source: &str, destination: &str) -> Result<()>;

    async fn publish_automation(&self, node_id: &str, lane: &AutomationLane) -> Result<()>;

    async fn upload_clip_buffer(
        &self,
        key: &BufferKey,
        sample_rate: u32,
        channels: usize,
        frames: usize,
        channel_data: &[Vec<f32>],
    ) -> Result<()>;

    async fn release_clip_buffer(&self, key: &BufferKey) -> Result<()>;

    async fn start_transport(&self) -> Result<()>;

    async fn stop_transport(&self) -> Result<()>;

    async fn locate_transport(&self, frame: u64) -> Result<()>;

    async fn transport_state(&self) -> Result<TransportState>;

    async fn render_diagnostics(&self) -> Result<RenderDiagnostics>;
}

// =============================================================================
// PLUGIN HOST
// =============================================================================

/// A loadable plugin as advertised by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub format: String,
}

impl PluginDescriptor {
    /// Same plugin at the same version; a binding built from `other` can be
    /// reused for `self`.
    pub fn same_build(&self, other: &PluginDescriptor) -> bool {
        self.id == other.id && self.version == other.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub instance_id: String,
    pub sandbox_identifier: String,
    pub automation_bindings: Vec<String>,
}

/// Opaque host-side handle to a loaded plugin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPlugin {
    pub host_instance_id: String,
    pub handle: PluginHandle,
}

/// The host's current view of a (possibly restarted) instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRuntime {
    pub handle: PluginHandle,
    pub native_instance_id: String,
}

/// Crash notification for a session-level plugin instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCrash {
    pub instance_id: String,
    /// The host already restarted the instance on its own
    pub recovered: bool,
}

/// Out-of-process plugin host
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn load_plugin(
        &self,
        descriptor: &PluginDescriptor,
        options: &LoadOptions,
    ) -> Result<LoadedPlugin>;

    async fn release_plugin(&self, host_instance_id: &str) -> Result<()>;

    async fn schedule_automation(
        &self,
        host_instance_id: &str,
        parameter_id: &str,
        points: &[LanePoint],
    ) -> Result<()>;

    /// Subscribe to crash notifications. Dropping the receiver unsubscribes;
    /// crashes that happened before subscribing are not replayed.
    fn crash_events(&self) -> broadcast::Receiver<PluginCrash>;

    /// Ask the host to restart an instance. `Ok(false)` means the host tried
    /// and the instance did not come back.
    async fn retry_instance(&self, instance_id: &str) -> Result<bool>;

    async fn instance_runtime(&self, instance_id: &str) -> Result<Option<InstanceRuntime>>;

    async fn list_available_plugins(&self) -> Result<Vec<PluginDescriptor>>;
}

// =============================================================================
// LOADER & RESOLVER
// =============================================================================

/// Decoded audio, one `Vec` per channel
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
    pub data: Vec<Vec<f32>>,
}

#[async_trait]
pub trait AudioFileLoader: Send + Sync {
    async fn load(&self, path: &str) -> Result<RawAudio>;
}

/// Maps a session-level plugin instance to the descriptor to load for it
pub trait DescriptorResolver: Send + Sync {
    fn resolve(&self, instance_id: &str, node: &PluginNode) -> Option<PluginDescriptor>;

    /// Forget anything cached for one instance
    fn clear_instance(&self, _instance_id: &str) {}

    /// Forget everything cached
    fn clear_all(&self) {}
}
