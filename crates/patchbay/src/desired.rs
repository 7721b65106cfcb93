//! Desired engine state derived from a session snapshot
//!
//! Graph node ids are only unique within a track, so every engine node id is
//! namespaced: `{track}/{node}` for routing nodes, `{track}/clip:{clip}` for
//! clip players. Every track output feeds the fixed `master` node.
//!
//! A track without a routing graph, or with a malformed one, fails the whole
//! build. A clip or plugin that fails to prepare is logged and left out (the
//! plugin as an offline node) so the rest of the session still converges.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use patchconf::EngineConfig;
use serde::Serialize;
use tracing::{debug, warn};

use crate::automation::AutomationRequest;
use crate::buffer_cache::{BufferCache, ClipBufferDescriptor};
use crate::engine::{AutomationLane, ConnectionKey, LanePoint, NodeConfiguration, NodeType};
use crate::error::{BufferError, SyncError};
use crate::fingerprint::BufferKey;
use crate::plugins::{PluginInstanceBinding, PluginLifecycleManager};
use crate::session::{
    AutomationCurve, Clip, CurveTarget, PluginNode, RoutingGraph, RoutingNode, Session, Track,
};

/// Engine id of the global output bus
pub const MASTER_NODE_ID: &str = "master";

/// Clip player parameter driven by the fade lane
pub const GAIN_PARAMETER: &str = "gain";

/// `round(ms / 1000 * sample_rate)`, never negative
pub fn ms_to_frames(ms: f64, sample_rate: u32) -> u64 {
    let frames = (ms / 1000.0 * sample_rate as f64).round();
    if frames.is_finite() && frames > 0.0 {
        frames as u64
    } else {
        0
    }
}

/// Snap `frame` up to the next multiple of `buffer_size`, saturating at `u64::MAX`
pub fn quantize_frame(frame: u64, buffer_size: u32) -> u64 {
    if buffer_size == 0 {
        return frame;
    }
    let size = buffer_size as u64;
    frame.saturating_add((size - frame % size) % size)
}

pub fn engine_node_id(track_id: &str, node_id: &str) -> String {
    format!("{}/{}", track_id, node_id)
}

pub fn clip_node_id(track_id: &str, clip_id: &str) -> String {
    format!("{}/clip:{}", track_id, clip_id)
}

/// Plugin node configuration; online with a binding, offline without one.
pub fn plugin_configuration(
    engine_id: &str,
    plugin: &PluginNode,
    binding: Option<&PluginInstanceBinding>,
) -> NodeConfiguration {
    let base = NodeConfiguration::new(engine_id, NodeType::Plugin)
        .with_option("instanceId", plugin.instance_id.as_str())
        .with_option("pluginId", plugin.plugin_id.as_str())
        .with_option("bypassed", plugin.bypassed);
    match binding {
        Some(binding) => base
            .with_option("hostInstanceId", binding.host_instance_id.as_str())
            .with_option("version", binding.descriptor.version.as_str()),
        None => base.with_option("offline", true),
    }
}

fn routing_configuration(track_id: &str, engine_id: &str, node: &RoutingNode) -> NodeConfiguration {
    match node {
        RoutingNode::TrackInput { .. } => {
            NodeConfiguration::new(engine_id, NodeType::TrackInput).with_option("trackId", track_id)
        }
        RoutingNode::TrackOutput { .. } => {
            NodeConfiguration::new(engine_id, NodeType::TrackOutput).with_option("trackId", track_id)
        }
        RoutingNode::Send {
            bus,
            level,
            pre_fader,
            ..
        } => NodeConfiguration::new(engine_id, NodeType::Send)
            .with_option("bus", bus.as_str())
            .with_option("level", *level)
            .with_option("preFader", *pre_fader),
        RoutingNode::Return { bus, level, .. } => NodeConfiguration::new(engine_id, NodeType::Return)
            .with_option("bus", bus.as_str())
            .with_option("level", *level),
        RoutingNode::SidechainTap {
            source_track_id, ..
        } => NodeConfiguration::new(engine_id, NodeType::SidechainTap)
            .with_option("sourceTrackId", source_track_id.as_str()),
        RoutingNode::Plugin(plugin) => plugin_configuration(engine_id, plugin, None),
    }
}

/// Gain lane of a clip player: ramps for the fades, flat gain otherwise.
/// All frames are quantized; a later point at the same frame wins.
pub fn clip_gain_lane(
    start: u64,
    end: u64,
    fade_in: u64,
    fade_out: u64,
    gain: f64,
    buffer_size: u32,
) -> AutomationLane {
    let q = |frame: u64| quantize_frame(frame, buffer_size);
    let mut points = Vec::with_capacity(4);
    if fade_in > 0 {
        points.push(LanePoint { frame: q(start), value: 0.0 });
        points.push(LanePoint {
            frame: q(start.saturating_add(fade_in)),
            value: gain,
        });
    } else {
        points.push(LanePoint { frame: q(start), value: gain });
    }
    if fade_out > 0 {
        points.push(LanePoint {
            frame: q(end.saturating_sub(fade_out)),
            value: gain,
        });
        points.push(LanePoint { frame: q(end), value: 0.0 });
    }
    AutomationLane::new(GAIN_PARAMETER, points)
}

/// Plugin parameter automation not yet tied to a host instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginAutomation {
    pub instance_id: String,
    pub lane: AutomationLane,
}

impl PluginAutomation {
    pub fn request(&self, host_instance_id: &str) -> AutomationRequest {
        AutomationRequest::plugin(self.instance_id.clone(), host_instance_id, self.lane.clone())
    }
}

/// A plugin node as it was placed in the desired state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginNodeState {
    pub engine_node_id: String,
    pub node: PluginNode,
    pub configuration: NodeConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DesiredState {
    pub revision: u64,
    pub nodes: Vec<NodeConfiguration>,
    pub connections: BTreeSet<ConnectionKey>,
    /// Publishable lanes: node lanes plus plugin lanes of bound instances
    pub automation: Vec<AutomationRequest>,
    pub plugin_automation: Vec<PluginAutomation>,
    pub buffers: BTreeSet<BufferKey>,
    /// Every plugin node in the session, by instance id
    pub plugin_nodes: BTreeMap<String, PluginNodeState>,
    /// Instances configured offline
    pub offline_plugins: Vec<String>,
    /// Clips left out, with the reason
    pub skipped_clips: Vec<SkippedClip>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedClip {
    pub track_id: String,
    pub clip_id: String,
    pub reason: String,
}

impl DesiredState {
    pub fn active_instances(&self) -> BTreeSet<String> {
        self.plugin_nodes.keys().cloned().collect()
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfiguration> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub struct DesiredStateBuilder {
    cache: BufferCache,
    plugins: Arc<PluginLifecycleManager>,
    engine: EngineConfig,
}

impl DesiredStateBuilder {
    pub fn new(cache: BufferCache, plugins: Arc<PluginLifecycleManager>, engine: EngineConfig) -> Self {
        Self {
            cache,
            plugins,
            engine,
        }
    }

    /// Derive the target engine state for `session`.
    ///
    /// Instances in `crashed` stay offline and are not rebound.
    pub async fn build(
        &self,
        session: &Session,
        crashed: &BTreeSet<String>,
    ) -> Result<DesiredState, SyncError> {
        session.validate_plugin_instances()?;

        let mut state = DesiredState {
            revision: session.revision,
            ..DesiredState::default()
        };
        state
            .nodes
            .push(NodeConfiguration::new(MASTER_NODE_ID, NodeType::MasterOutput));

        let mut host_ids: BTreeMap<String, String> = BTreeMap::new();
        for track in &session.tracks {
            self.build_track(track, crashed, &mut host_ids, &mut state)
                .await?;
        }

        state.automation.extend(
            state
                .plugin_automation
                .iter()
                .filter_map(|pa| host_ids.get(&pa.instance_id).map(|host| pa.request(host))),
        );

        debug!(
            revision = session.revision,
            nodes = state.nodes.len(),
            connections = state.connections.len(),
            automation = state.automation.len(),
            buffers = state.buffers.len(),
            "Desired state built"
        );
        Ok(state)
    }

    async fn build_track(
        &self,
        track: &Track,
        crashed: &BTreeSet<String>,
        host_ids: &mut BTreeMap<String, String>,
        state: &mut DesiredState,
    ) -> Result<(), SyncError> {
        let graph = track
            .routing
            .as_ref()
            .ok_or_else(|| SyncError::MissingRoutingGraph {
                track_id: track.id.clone(),
            })?;
        graph.validate(&track.id)?;
        let output_id = graph
            .output_node()
            .map(|id| engine_node_id(&track.id, id))
            .ok_or_else(|| SyncError::InvalidGraph {
                track_id: track.id.clone(),
                reason: "no track output endpoint".to_string(),
            })?;

        for node in &graph.nodes {
            let engine_id = engine_node_id(&track.id, node.id());
            match node {
                RoutingNode::Plugin(plugin) => {
                    let binding = self.bind_plugin(plugin, crashed).await;
                    let configuration = plugin_configuration(&engine_id, plugin, binding.as_ref());
                    match binding {
                        Some(binding) => {
                            host_ids.insert(plugin.instance_id.clone(), binding.host_instance_id);
                        }
                        None => state.offline_plugins.push(plugin.instance_id.clone()),
                    }
                    state.nodes.push(configuration.clone());
                    state.plugin_nodes.insert(
                        plugin.instance_id.clone(),
                        PluginNodeState {
                            engine_node_id: engine_id,
                            node: plugin.clone(),
                            configuration,
                        },
                    );
                }
                other => state
                    .nodes
                    .push(routing_configuration(&track.id, &engine_id, other)),
            }
        }

        state.connections.extend(
            graph
                .connections
                .iter()
                .filter(|c| c.enabled)
                .map(|c| {
                    ConnectionKey::new(
                        engine_node_id(&track.id, &c.source.node),
                        engine_node_id(&track.id, &c.destination.node),
                    )
                }),
        );
        state
            .connections
            .insert(ConnectionKey::new(output_id.clone(), MASTER_NODE_ID));

        let linked: HashSet<&str> = track
            .clips
            .iter()
            .flat_map(|clip| clip.automation_curve_ids.iter().map(String::as_str))
            .collect();
        for curve in track.automation.iter().filter(|c| !linked.contains(c.id.as_str())) {
            self.track_curve(track, graph, &output_id, curve, state);
        }

        let clip_target = graph
            .input_node()
            .map(|id| engine_node_id(&track.id, id))
            .unwrap_or_else(|| output_id.clone());
        let sample_rate = self.engine.sample_rate;
        let buffers = join_all(
            track
                .clips
                .iter()
                .map(|clip| self.cache.get_buffer(&clip.source_path, sample_rate)),
        )
        .await;
        for (clip, buffer) in track.clips.iter().zip(buffers) {
            match buffer {
                Ok(descriptor) => self.place_clip(track, clip, &descriptor, &clip_target, state),
                Err(e) => Self::skip_clip(track, clip, &e, state),
            }
        }

        Ok(())
    }

    async fn bind_plugin(
        &self,
        plugin: &PluginNode,
        crashed: &BTreeSet<String>,
    ) -> Option<PluginInstanceBinding> {
        if crashed.contains(&plugin.instance_id) {
            debug!(instance.id = %plugin.instance_id, "Instance crashed; keeping node offline");
            return None;
        }
        match self.plugins.ensure_binding(plugin).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(
                    instance.id = %plugin.instance_id,
                    plugin.id = %plugin.plugin_id,
                    error = %e,
                    "Plugin failed to load; configuring offline"
                );
                None
            }
        }
    }

    fn curve_lane(&self, curve: &AutomationCurve, parameter: &str, offset: u64) -> Option<AutomationLane> {
        let points: Vec<LanePoint> = curve
            .points()
            .into_iter()
            .map(|p| LanePoint {
                frame: quantize_frame(
                    offset.saturating_add(ms_to_frames(p.time_ms, self.engine.sample_rate)),
                    self.engine.buffer_size,
                ),
                value: p.value,
            })
            .collect();
        if points.is_empty() {
            return None;
        }
        Some(AutomationLane::new(parameter, points))
    }

    fn track_curve(
        &self,
        track: &Track,
        graph: &RoutingGraph,
        output_id: &str,
        curve: &AutomationCurve,
        state: &mut DesiredState,
    ) {
        match &curve.target {
            CurveTarget::TrackOutput => {
                if let Some(lane) = self.curve_lane(curve, &curve.parameter, 0) {
                    state.automation.push(AutomationRequest::node(output_id, lane));
                }
            }
            CurveTarget::Node { node_id } => {
                if graph.node(node_id).is_none() {
                    warn!(track.id = %track.id, curve.id = %curve.id, node.id = %node_id, "Curve targets unknown node; skipped");
                    return;
                }
                if let Some(lane) = self.curve_lane(curve, &curve.parameter, 0) {
                    state
                        .automation
                        .push(AutomationRequest::node(engine_node_id(&track.id, node_id), lane));
                }
            }
            CurveTarget::PluginParameter {
                instance_id,
                parameter_id,
            } => {
                if let Some(lane) = self.curve_lane(curve, parameter_id, 0) {
                    state.plugin_automation.push(PluginAutomation {
                        instance_id: instance_id.clone(),
                        lane,
                    });
                }
            }
        }
    }

    fn place_clip(
        &self,
        track: &Track,
        clip: &Clip,
        buffer: &ClipBufferDescriptor,
        target: &str,
        state: &mut DesiredState,
    ) {
        let rate = self.engine.sample_rate;
        let size = self.engine.buffer_size;
        let start = ms_to_frames(clip.start_ms, rate);
        let end = start.saturating_add(ms_to_frames(clip.duration_ms, rate));
        let fade_in = ms_to_frames(clip.fade_in_ms, rate);
        let fade_out = ms_to_frames(clip.fade_out_ms, rate);
        let node_id = clip_node_id(&track.id, &clip.id);

        state.nodes.push(
            NodeConfiguration::new(node_id.as_str(), NodeType::ClipPlayer)
                .with_option("bufferKey", buffer.buffer_key.as_str())
                .with_option("startFrame", quantize_frame(start, size))
                .with_option("endFrame", quantize_frame(end, size))
                .with_option("fadeInFrames", fade_in)
                .with_option("fadeOutFrames", fade_out)
                .with_option("gain", clip.gain)
                .with_option("bufferSampleRate", buffer.sample_rate)
                .with_option("bufferChannels", buffer.channels)
                .with_option("bufferFrames", buffer.frames),
        );
        state
            .connections
            .insert(ConnectionKey::new(node_id.as_str(), target));
        state.buffers.insert(buffer.buffer_key.clone());

        let mut gain_linked = false;
        for curve_id in &clip.automation_curve_ids {
            let Some(curve) = track.curve(curve_id) else {
                warn!(track.id = %track.id, clip.id = %clip.id, curve.id = %curve_id, "Clip links unknown curve; skipped");
                continue;
            };
            if let Some(lane) = self.curve_lane(curve, &curve.parameter, start) {
                gain_linked |= curve.parameter == GAIN_PARAMETER;
                state
                    .automation
                    .push(AutomationRequest::node(node_id.as_str(), lane));
            }
        }

        if !gain_linked {
            let lane = clip_gain_lane(start, end, fade_in, fade_out, clip.gain, size);
            state
                .automation
                .push(AutomationRequest::node(node_id.as_str(), lane));
        }
    }

    fn skip_clip(track: &Track, clip: &Clip, error: &BufferError, state: &mut DesiredState) {
        warn!(
            track.id = %track.id,
            clip.id = %clip.id,
            path = %clip.source_path,
            error = %error,
            "Clip buffer unavailable; clip skipped"
        );
        state.skipped_clips.push(SkippedClip {
            track_id: track.id.clone(),
            clip_id: clip.id.clone(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OptionValue;
    use crate::session::{RoutingConnection, RoutingGraph};
    use crate::testing::{descriptor, FakePluginHost, MemoryLoader, RecordingEngine, StaticResolver};
    use patchconf::PluginsConfig;

    struct Fixture {
        loader: Arc<MemoryLoader>,
        host: Arc<FakePluginHost>,
        builder: DesiredStateBuilder,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(RecordingEngine::new());
        let loader = Arc::new(MemoryLoader::new());
        let host = Arc::new(FakePluginHost::new());
        let resolver = Arc::new(StaticResolver::new().with(descriptor("verb", "1.0")));
        let plugins = Arc::new(PluginLifecycleManager::new(
            host.clone(),
            resolver,
            PluginsConfig::default(),
        ));
        let cache = BufferCache::new(engine, loader.clone());
        Fixture {
            loader,
            host,
            builder: DesiredStateBuilder::new(cache, plugins, EngineConfig::default()),
        }
    }

    fn lane_for<'a>(state: &'a DesiredState, key: &str) -> &'a AutomationLane {
        &state
            .automation
            .iter()
            .find(|r| r.key == key)
            .unwrap_or_else(|| panic!("no automation for {}", key))
            .lane
    }

    #[test]
    fn test_quantize_frame() {
        assert_eq!(quantize_frame(0, 256), 0);
        assert_eq!(quantize_frame(1, 256), 256);
        assert_eq!(quantize_frame(256, 256), 256);
        assert_eq!(quantize_frame(257, 256), 512);
        assert_eq!(quantize_frame(u64::MAX, 256), u64::MAX);
        assert_eq!(quantize_frame(u64::MAX - 1, 256), u64::MAX);
    }

    #[test]
    fn test_ms_to_frames() {
        assert_eq!(ms_to_frames(100.0, 48_000), 4800);
        assert_eq!(ms_to_frames(0.01, 48_000), 0);
        assert_eq!(ms_to_frames(-50.0, 48_000), 0);
        assert_eq!(ms_to_frames(f64::NAN, 48_000), 0);
    }

    #[test]
    fn test_gain_lane_with_fade_out() {
        let lane = clip_gain_lane(0, 48_000, 0, 4800, 0.5, 256);
        assert_eq!(
            lane.points,
            vec![
                LanePoint { frame: 0, value: 0.5 },
                LanePoint { frame: 43_264, value: 0.5 },
                LanePoint { frame: 48_128, value: 0.0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_clip_fade_in_produces_two_points() {
        let f = fixture();
        f.loader.insert_tone("kick.wav", 48_000, 2, 48_000);
        let track = Track::new("t1", RoutingGraph::passthrough("in", "out")).with_clip(
            Clip::new("c1", "kick.wav", 100.0, 1000.0)
                .with_gain(0.8)
                .with_fades(100.0, 0.0),
        );
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();
        let lane = lane_for(&state, "node:t1/clip:c1:gain");

        assert_eq!(
            lane.points,
            vec![
                LanePoint {
                    frame: quantize_frame(4800, 256),
                    value: 0.0
                },
                LanePoint {
                    frame: quantize_frame(4800 + 4800, 256),
                    value: 0.8
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_far_future_clip_saturates_frames() {
        let f = fixture();
        f.loader.insert_tone("far.wav", 48_000, 1, 480);
        let track = Track::new("t1", RoutingGraph::passthrough("in", "out"))
            .with_clip(Clip::new("c1", "far.wav", 1e18, 10.0).with_fades(5.0, 5.0))
            .with_curve(AutomationCurve::new("pan", "pan").with_point(1e18, 0.5));
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();

        let clip = state.node("t1/clip:c1").unwrap();
        assert_eq!(clip.option("startFrame"), Some(&OptionValue::Number(u64::MAX as f64)));
        assert_eq!(clip.option("endFrame"), Some(&OptionValue::Number(u64::MAX as f64)));
        assert!(lane_for(&state, "node:t1/clip:c1:gain")
            .points
            .iter()
            .all(|p| p.frame == u64::MAX));
        assert_eq!(lane_for(&state, "node:t1/out:pan").points[0].frame, u64::MAX);
    }

    #[tokio::test]
    async fn test_clip_node_and_connection() {
        let f = fixture();
        f.loader.insert_tone("kick.wav", 44_100, 2, 441);
        let track = Track::new("t1", RoutingGraph::passthrough("in", "out"))
            .with_clip(Clip::new("c1", "kick.wav", 1.0, 10.0));
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();
        let clip = state.node("t1/clip:c1").unwrap();

        assert_eq!(clip.node_type, NodeType::ClipPlayer);
        assert_eq!(clip.option("startFrame"), Some(&OptionValue::Number(256.0)));
        assert_eq!(clip.option("bufferSampleRate"), Some(&OptionValue::Number(48_000.0)));
        assert_eq!(clip.option("bufferFrames"), Some(&OptionValue::Number(480.0)));
        assert!(state
            .connections
            .contains(&ConnectionKey::new("t1/clip:c1", "t1/in")));
        assert!(state
            .connections
            .contains(&ConnectionKey::new("t1/out", MASTER_NODE_ID)));
        assert_eq!(state.buffers.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_clip_is_skipped_not_fatal() {
        let f = fixture();
        f.loader.insert_tone("good.wav", 48_000, 1, 480);
        let track = Track::new("t1", RoutingGraph::passthrough("in", "out"))
            .with_clip(Clip::new("bad", "missing.wav", 0.0, 10.0))
            .with_clip(Clip::new("good", "good.wav", 0.0, 10.0));
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();
        assert!(state.node("t1/clip:good").is_some());
        assert!(state.node("t1/clip:bad").is_none());
        assert_eq!(state.skipped_clips.len(), 1);
        assert_eq!(state.skipped_clips[0].clip_id, "bad");
    }

    #[tokio::test]
    async fn test_missing_graph_is_fatal() {
        let f = fixture();
        let mut track = Track::new("t1", RoutingGraph::passthrough("in", "out"));
        track.routing = None;
        let session = Session::new("s", 1).with_track(track);

        let err = f.builder.build(&session, &BTreeSet::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingRoutingGraph { ref track_id } if track_id == "t1"));
    }

    #[tokio::test]
    async fn test_disabled_connections_skipped_and_ids_namespaced() {
        let f = fixture();
        let graph = RoutingGraph::passthrough("in", "out")
            .with_node(RoutingNode::Send {
                id: "s".into(),
                bus: "verb".into(),
                level: 0.5,
                pre_fader: false,
            })
            .with_connection(RoutingConnection::audio("in", "s").disabled());
        let session = Session::new("s", 1)
            .with_track(Track::new("t1", graph.clone()))
            .with_track(Track::new("t2", graph));

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();
        assert!(state.node("t1/s").is_some());
        assert!(state.node("t2/s").is_some());
        assert!(!state
            .connections
            .contains(&ConnectionKey::new("t1/in", "t1/s")));
        assert!(state
            .connections
            .contains(&ConnectionKey::new("t2/in", "t2/out")));
    }

    #[tokio::test]
    async fn test_plugin_binding_and_offline_fallback() {
        let f = fixture();
        let graph = RoutingGraph::passthrough("in", "out")
            .with_node(RoutingNode::Plugin(PluginNode::new("fx", "inst-1", "verb")))
            .with_node(RoutingNode::Plugin(PluginNode::new("fx2", "inst-2", "unknown")));
        let session = Session::new("s", 1).with_track(Track::new("t1", graph));

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();

        let online = state.node("t1/fx").unwrap();
        assert!(online.option("hostInstanceId").is_some());
        assert!(online.option("offline").is_none());

        let offline = state.node("t1/fx2").unwrap();
        assert_eq!(offline.option("offline"), Some(&OptionValue::Bool(true)));
        assert_eq!(state.offline_plugins, vec!["inst-2".to_string()]);
        assert_eq!(state.active_instances().len(), 2);
    }

    #[tokio::test]
    async fn test_instance_shared_across_tracks_is_fatal() {
        let f = fixture();
        let fx = || {
            RoutingGraph::passthrough("in", "out")
                .with_node(RoutingNode::Plugin(PluginNode::new("fx", "inst-1", "verb")))
        };
        let session = Session::new("s", 1)
            .with_track(Track::new("t1", fx()))
            .with_track(Track::new("t2", fx()));

        let err = f.builder.build(&session, &BTreeSet::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidGraph { ref track_id, .. } if track_id == "t2"));
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_crashed_instance_stays_offline() {
        let f = fixture();
        let graph = RoutingGraph::passthrough("in", "out")
            .with_node(RoutingNode::Plugin(PluginNode::new("fx", "inst-1", "verb")));
        let session = Session::new("s", 1).with_track(Track::new("t1", graph));
        let crashed: BTreeSet<String> = ["inst-1".to_string()].into();

        let state = f.builder.build(&session, &crashed).await.unwrap();
        assert_eq!(
            state.node("t1/fx").unwrap().option("offline"),
            Some(&OptionValue::Bool(true))
        );
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_curve_targets() {
        let f = fixture();
        let graph = RoutingGraph::passthrough("in", "out")
            .with_node(RoutingNode::Plugin(PluginNode::new("fx", "inst-1", "verb")))
            .with_node(RoutingNode::Plugin(PluginNode::new("fx2", "inst-2", "unknown")));
        let track = Track::new("t1", graph)
            .with_curve(AutomationCurve::new("vol", "volume").with_point(10.0, 0.5))
            .with_curve(
                AutomationCurve::new("mix", "mix")
                    .targeting(CurveTarget::Node { node_id: "fx".into() })
                    .with_point(0.0, 0.3),
            )
            .with_curve(
                AutomationCurve::new("cut", "ignored")
                    .targeting(CurveTarget::PluginParameter {
                        instance_id: "inst-1".into(),
                        parameter_id: "cutoff".into(),
                    })
                    .with_point(0.0, 0.1),
            )
            .with_curve(
                AutomationCurve::new("res", "ignored")
                    .targeting(CurveTarget::PluginParameter {
                        instance_id: "inst-2".into(),
                        parameter_id: "resonance".into(),
                    })
                    .with_point(0.0, 0.1),
            );
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();

        assert_eq!(
            lane_for(&state, "node:t1/out:volume").points,
            vec![LanePoint { frame: 512, value: 0.5 }]
        );
        assert!(state.automation.iter().any(|r| r.key == "node:t1/fx:mix"));
        assert!(state.automation.iter().any(|r| r.key == "plugin:inst-1:cutoff"));
        // Offline instance keeps its automation host-independent only
        assert!(!state.automation.iter().any(|r| r.key == "plugin:inst-2:resonance"));
        assert_eq!(state.plugin_automation.len(), 2);
    }

    #[tokio::test]
    async fn test_linked_gain_curve_replaces_fades() {
        let f = fixture();
        f.loader.insert_tone("pad.wav", 48_000, 1, 48_000);
        let mut clip = Clip::new("c1", "pad.wav", 1000.0, 500.0).with_fades(50.0, 50.0);
        clip.automation_curve_ids = vec!["swell".into()];
        let track = Track::new("t1", RoutingGraph::passthrough("in", "out"))
            .with_clip(clip)
            .with_curve(
                AutomationCurve::new("swell", "gain")
                    .with_point(0.0, 0.0)
                    .with_point(100.0, 1.0),
            );
        let session = Session::new("s", 1).with_track(track);

        let state = f.builder.build(&session, &BTreeSet::new()).await.unwrap();
        let lanes: Vec<_> = state
            .automation
            .iter()
            .filter(|r| r.key == "node:t1/clip:c1:gain")
            .collect();
        assert_eq!(lanes.len(), 1);
        // Relative to the clip start: 48000 and 48000 + 4800 quantized
        assert_eq!(
            lanes[0].lane.points,
            vec![
                LanePoint { frame: 48_128, value: 0.0 },
                LanePoint { frame: 52_992, value: 1.0 },
            ]
        );
        // Not also published as a track-level lane
        assert!(!state.automation.iter().any(|r| r.key == "node:t1/out:gain"));
    }
}
