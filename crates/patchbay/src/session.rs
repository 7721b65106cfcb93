//! Session snapshot types
//!
//! A `Session` is an immutable, revision-stamped description of the whole
//! production. A new revision is a new value; the conductor holds sessions
//! behind `Arc` and never mutates one after it has been handed over.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Revisioned snapshot of the whole production
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub revision: u64,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(id: impl Into<String>, revision: u64) -> Self {
        Self {
            id: id.into(),
            revision,
            tracks: Vec::new(),
            metadata: SessionMetadata::default(),
        }
    }

    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    /// Plugin instance ids are session-wide keys: each may be placed on
    /// exactly one node across all tracks.
    pub fn validate_plugin_instances(&self) -> Result<(), SyncError> {
        let mut placed: HashMap<&str, (&str, &str)> = HashMap::new();
        for track in &self.tracks {
            let Some(graph) = &track.routing else {
                continue;
            };
            for node in &graph.nodes {
                let RoutingNode::Plugin(plugin) = node else {
                    continue;
                };
                if let Some((other_track, other_node)) =
                    placed.insert(plugin.instance_id.as_str(), (track.id.as_str(), plugin.id.as_str()))
                {
                    return Err(SyncError::InvalidGraph {
                        track_id: track.id.clone(),
                        reason: format!(
                            "plugin instance {} on node {} is already placed on {}/{}",
                            plugin.instance_id, plugin.id, other_track, other_node
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// The same content stamped with a later revision.
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default = "SessionMetadata::default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "SessionMetadata::default_bpm")]
    pub bpm: f64,
}

impl SessionMetadata {
    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_bpm() -> f64 {
        120.0
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            sample_rate: Self::default_sample_rate(),
            bpm: Self::default_bpm(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default)]
    pub automation: Vec<AutomationCurve>,
    /// Every track must carry a graph; `None` only exists so a malformed
    /// snapshot can be rejected with a proper error instead of a parse failure.
    #[serde(default)]
    pub routing: Option<RoutingGraph>,
}

impl Track {
    pub fn new(id: impl Into<String>, routing: RoutingGraph) -> Self {
        Self {
            id: id.into(),
            clips: Vec::new(),
            automation: Vec::new(),
            routing: Some(routing),
        }
    }

    pub fn with_clip(mut self, clip: Clip) -> Self {
        self.clips.push(clip);
        self
    }

    pub fn with_curve(mut self, curve: AutomationCurve) -> Self {
        self.automation.push(curve);
        self
    }

    pub fn curve(&self, id: &str) -> Option<&AutomationCurve> {
        self.automation.iter().find(|c| c.id == id)
    }
}

// =============================================================================
// ROUTING
// =============================================================================

/// A node of a track's routing graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RoutingNode {
    TrackInput {
        id: String,
    },
    TrackOutput {
        id: String,
    },
    Plugin(PluginNode),
    #[serde(rename_all = "camelCase")]
    Send {
        id: String,
        bus: String,
        #[serde(default = "unity")]
        level: f64,
        #[serde(default)]
        pre_fader: bool,
    },
    Return {
        id: String,
        bus: String,
        #[serde(default = "unity")]
        level: f64,
    },
    #[serde(rename_all = "camelCase")]
    SidechainTap {
        id: String,
        source_track_id: String,
    },
}

fn unity() -> f64 {
    1.0
}

fn enabled() -> bool {
    true
}

impl RoutingNode {
    pub fn id(&self) -> &str {
        match self {
            RoutingNode::TrackInput { id }
            | RoutingNode::TrackOutput { id }
            | RoutingNode::Send { id, .. }
            | RoutingNode::Return { id, .. }
            | RoutingNode::SidechainTap { id, .. } => id,
            RoutingNode::Plugin(plugin) => &plugin.id,
        }
    }
}

/// A plugin instance placed in a routing graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginNode {
    pub id: String,
    /// Session-level instance id; stable across host restarts.
    pub instance_id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub bypassed: bool,
    /// Parameters the host should prepare automation bindings for.
    #[serde(default)]
    pub automated_parameters: Vec<String>,
}

impl PluginNode {
    pub fn new(
        id: impl Into<String>,
        instance_id: impl Into<String>,
        plugin_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instance_id: instance_id.into(),
            plugin_id: plugin_id.into(),
            version: None,
            bypassed: false,
            automated_parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    #[default]
    Audio,
    Midi,
    Sidechain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    #[serde(default)]
    pub port: String,
}

impl PortRef {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConnection {
    pub source: PortRef,
    pub destination: PortRef,
    #[serde(default)]
    pub signal: SignalKind,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

impl RoutingConnection {
    pub fn audio(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: PortRef::new(source, "out"),
            destination: PortRef::new(destination, "in"),
            signal: SignalKind::Audio,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Node/connection description of signal flow within one track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingGraph {
    #[serde(default)]
    pub nodes: Vec<RoutingNode>,
    #[serde(default)]
    pub connections: Vec<RoutingConnection>,
}

impl RoutingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input -> output with nothing in between.
    pub fn passthrough(input: &str, output: &str) -> Self {
        Self::new()
            .with_node(RoutingNode::TrackInput { id: input.into() })
            .with_node(RoutingNode::TrackOutput { id: output.into() })
            .with_connection(RoutingConnection::audio(input, output))
    }

    pub fn with_node(mut self, node: RoutingNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_connection(mut self, connection: RoutingConnection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn node(&self, id: &str) -> Option<&RoutingNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn input_node(&self) -> Option<&str> {
        self.nodes.iter().find_map(|n| match n {
            RoutingNode::TrackInput { id } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn output_node(&self) -> Option<&str> {
        self.nodes.iter().find_map(|n| match n {
            RoutingNode::TrackOutput { id } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Check the graph invariants: unique node ids, connections only between
    /// existing nodes, exactly one output endpoint.
    pub fn validate(&self, track_id: &str) -> Result<(), SyncError> {
        let invalid = |reason: String| SyncError::InvalidGraph {
            track_id: track_id.to_string(),
            reason,
        };

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                return Err(invalid(format!("duplicate node id {}", node.id())));
            }
        }

        for connection in &self.connections {
            for end in [&connection.source.node, &connection.destination.node] {
                if !seen.contains(end.as_str()) {
                    return Err(invalid(format!(
                        "connection {} -> {} references unknown node {}",
                        connection.source.node, connection.destination.node, end
                    )));
                }
            }
        }

        let outputs = self
            .nodes
            .iter()
            .filter(|n| matches!(n, RoutingNode::TrackOutput { .. }))
            .count();
        if outputs != 1 {
            return Err(invalid(format!(
                "expected exactly one track output endpoint, found {}",
                outputs
            )));
        }

        Ok(())
    }
}

// =============================================================================
// CLIPS & AUTOMATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub start_ms: f64,
    pub duration_ms: f64,
    pub source_path: String,
    #[serde(default = "unity")]
    pub gain: f64,
    #[serde(default)]
    pub fade_in_ms: f64,
    #[serde(default)]
    pub fade_out_ms: f64,
    #[serde(default)]
    pub automation_curve_ids: Vec<String>,
}

impl Clip {
    pub fn new(
        id: impl Into<String>,
        source_path: impl Into<String>,
        start_ms: f64,
        duration_ms: f64,
    ) -> Self {
        Self {
            id: id.into(),
            start_ms,
            duration_ms,
            source_path: source_path.into(),
            gain: 1.0,
            fade_in_ms: 0.0,
            fade_out_ms: 0.0,
            automation_curve_ids: Vec::new(),
        }
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_fades(mut self, fade_in_ms: f64, fade_out_ms: f64) -> Self {
        self.fade_in_ms = fade_in_ms;
        self.fade_out_ms = fade_out_ms;
        self
    }
}

/// What an automation curve drives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CurveTarget {
    /// The track's output endpoint
    #[default]
    TrackOutput,
    /// A specific node of the track's routing graph
    #[serde(rename_all = "camelCase")]
    Node { node_id: String },
    /// A parameter inside a hosted plugin instance
    #[serde(rename_all = "camelCase")]
    PluginParameter {
        instance_id: String,
        parameter_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPoint {
    pub time_ms: f64,
    pub value: f64,
}

/// A named parameter's value over time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationCurve {
    pub id: String,
    pub parameter: String,
    #[serde(default)]
    pub target: CurveTarget,
    #[serde(default)]
    points: Vec<AutomationPoint>,
}

impl AutomationCurve {
    pub fn new(id: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameter: parameter.into(),
            target: CurveTarget::TrackOutput,
            points: Vec::new(),
        }
    }

    pub fn targeting(mut self, target: CurveTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_point(mut self, time_ms: f64, value: f64) -> Self {
        self.insert_point(time_ms, value);
        self
    }

    /// Insert keeping points sorted by time; a point at an existing time
    /// replaces it.
    pub fn insert_point(&mut self, time_ms: f64, value: f64) {
        let point = AutomationPoint { time_ms, value };
        match self
            .points
            .binary_search_by(|p| p.time_ms.total_cmp(&time_ms))
        {
            Ok(index) => self.points[index] = point,
            Err(index) => self.points.insert(index, point),
        }
    }

    /// Points sorted by time with duplicates collapsed (later write wins).
    ///
    /// Deserialized curves may arrive unsorted; this is the view every
    /// consumer should read.
    pub fn points(&self) -> Vec<AutomationPoint> {
        let mut points = self.points.clone();
        // Stable sort keeps write order among equal times
        points.sort_by(|a, b| a.time_ms.total_cmp(&b.time_ms));
        let mut out: Vec<AutomationPoint> = Vec::with_capacity(points.len());
        for point in points {
            match out.last_mut() {
                Some(last) if last.time_ms == point.time_ms => *last = point,
                _ => out.push(point),
            }
        }
        out
    }
}
