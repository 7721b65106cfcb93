//! In-memory collaborators
//!
//! A recording engine, a fake plugin host, an in-memory audio loader and a
//! static descriptor resolver. Tests use them to assert on the exact command
//! stream; the CLI uses them for dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::{
    AudioFileLoader, AutomationLane, DescriptorResolver, Engine, EngineCapabilities,
    InstanceRuntime, LanePoint, LoadOptions, LoadedPlugin, NodeConfiguration, PluginCrash,
    PluginDescriptor, PluginHandle, PluginHost, RawAudio, RenderDiagnostics, TransportState,
};
use crate::fingerprint::BufferKey;
use crate::session::PluginNode;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Injected failures for a fake collaborator
struct FailureRules<C> {
    rules: Mutex<Vec<FailureRule<C>>>,
}

struct FailureRule<C> {
    matcher: Box<dyn Fn(&C) -> bool + Send + Sync>,
    remaining: Option<usize>,
}

impl<C> FailureRules<C> {
    fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, matcher: impl Fn(&C) -> bool + Send + Sync + 'static, remaining: Option<usize>) {
        lock(&self.rules).push(FailureRule {
            matcher: Box::new(matcher),
            remaining,
        });
    }

    /// Whether `call` should fail; consumes one shot of a limited rule.
    fn trips(&self, call: &C) -> bool {
        let mut rules = lock(&self.rules);
        let Some(index) = rules.iter().position(|rule| (rule.matcher)(call)) else {
            return false;
        };
        if let Some(remaining) = rules[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        true
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// One command received by [`RecordingEngine`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineCall {
    ConfigureNodes(Vec<NodeConfiguration>),
    RemoveNodes(Vec<String>),
    Connect(String, String),
    Disconnect(String, String),
    #[serde(rename_all = "camelCase")]
    PublishAutomation {
        node_id: String,
        lane: AutomationLane,
    },
    #[serde(rename_all = "camelCase")]
    UploadClipBuffer {
        key: BufferKey,
        sample_rate: u32,
        channels: usize,
        frames: usize,
    },
    ReleaseClipBuffer(BufferKey),
    StartTransport,
    StopTransport,
    LocateTransport(u64),
    TransportState,
    RenderDiagnostics,
}

impl EngineCall {
    pub fn name(&self) -> &'static str {
        match self {
            EngineCall::ConfigureNodes(_) => "configureNodes",
            EngineCall::RemoveNodes(_) => "removeNodes",
            EngineCall::Connect(..) => "connect",
            EngineCall::Disconnect(..) => "disconnect",
            EngineCall::PublishAutomation { .. } => "publishAutomation",
            EngineCall::UploadClipBuffer { .. } => "uploadClipBuffer",
            EngineCall::ReleaseClipBuffer(_) => "releaseClipBuffer",
            EngineCall::StartTransport => "startTransport",
            EngineCall::StopTransport => "stopTransport",
            EngineCall::LocateTransport(_) => "locateTransport",
            EngineCall::TransportState => "getTransportState",
            EngineCall::RenderDiagnostics => "getRenderDiagnostics",
        }
    }

    /// Read-only status queries issued by pollers
    pub fn is_query(&self) -> bool {
        matches!(self, EngineCall::TransportState | EngineCall::RenderDiagnostics)
    }
}

/// Engine that records every call and answers from in-memory state
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    failures: FailureRules<EngineCall>,
    capabilities: EngineCapabilities,
    transport: Mutex<TransportState>,
    diagnostics: Mutex<RenderDiagnostics>,
    latency: Option<Duration>,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: FailureRules::new(),
            capabilities: EngineCapabilities::default(),
            transport: Mutex::new(TransportState::default()),
            diagnostics: Mutex::new(RenderDiagnostics::default()),
            latency: None,
        }
    }

    /// Every call yields for `latency` before completing
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    /// Calls that change engine state (everything but status queries)
    pub fn commands(&self) -> Vec<EngineCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| !call.is_query())
            .cloned()
            .collect()
    }

    pub fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Fail every call matching `matcher`
    pub fn fail_on(&self, matcher: impl Fn(&EngineCall) -> bool + Send + Sync + 'static) {
        self.failures.add(matcher, None);
    }

    /// Fail the next call matching `matcher`
    pub fn fail_once(&self, matcher: impl Fn(&EngineCall) -> bool + Send + Sync + 'static) {
        self.failures.add(matcher, Some(1));
    }

    pub fn set_transport(&self, state: TransportState) {
        *lock(&self.transport) = state;
    }

    pub fn set_diagnostics(&self, diagnostics: RenderDiagnostics) {
        *lock(&self.diagnostics) = diagnostics;
    }

    async fn record(&self, call: EngineCall) -> Result<()> {
        let failing = self.failures.trips(&call);
        let name = call.name();
        lock(&self.calls).push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(anyhow!("injected {} failure", name));
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn configure_nodes(&self, nodes: &[NodeConfiguration]) -> Result<()> {
        self.record(EngineCall::ConfigureNodes(nodes.to_vec())).await
    }

    async fn remove_nodes(&self, ids: &[String]) -> Result<()> {
        self.record(EngineCall::RemoveNodes(ids.to_vec())).await
    }

    async fn connect(&self, source: &str, destination: &str) -> Result<()> {
        self.record(EngineCall::Connect(source.into(), destination.into()))
            .await
    }

    async fn disconnect(&self, source: &str, destination: &str) -> Result<()> {
        self.record(EngineCall::Disconnect(source.into(), destination.into()))
            .await
    }

    async fn publish_automation(&self, node_id: &str, lane: &AutomationLane) -> Result<()> {
        self.record(EngineCall::PublishAutomation {
            node_id: node_id.into(),
            lane: lane.clone(),
        })
        .await
    }

    async fn upload_clip_buffer(
        &self,
        key: &BufferKey,
        sample_rate: u32,
        channels: usize,
        frames: usize,
        _channel_data: &[Vec<f32>],
    ) -> Result<()> {
        self.record(EngineCall::UploadClipBuffer {
            key: key.clone(),
            sample_rate,
            channels,
            frames,
        })
        .await
    }

    async fn release_clip_buffer(&self, key: &BufferKey) -> Result<()> {
        self.record(EngineCall::ReleaseClipBuffer(key.clone())).await
    }

    async fn start_transport(&self) -> Result<()> {
        self.record(EngineCall::StartTransport).await?;
        lock(&self.transport).is_playing = true;
        Ok(())
    }

    async fn stop_transport(&self) -> Result<()> {
        self.record(EngineCall::StopTransport).await?;
        lock(&self.transport).is_playing = false;
        Ok(())
    }

    async fn locate_transport(&self, frame: u64) -> Result<()> {
        self.record(EngineCall::LocateTransport(frame)).await?;
        lock(&self.transport).frame = frame;
        Ok(())
    }

    async fn transport_state(&self) -> Result<TransportState> {
        self.record(EngineCall::TransportState).await?;
        Ok(*lock(&self.transport))
    }

    async fn render_diagnostics(&self) -> Result<RenderDiagnostics> {
        self.record(EngineCall::RenderDiagnostics).await?;
        Ok(*lock(&self.diagnostics))
    }
}

// =============================================================================
// PLUGIN HOST
// =============================================================================

/// One call received by [`FakePluginHost`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HostCall {
    #[serde(rename_all = "camelCase")]
    LoadPlugin {
        plugin_id: String,
        instance_id: String,
        sandbox_identifier: String,
    },
    ReleasePlugin(String),
    #[serde(rename_all = "camelCase")]
    ScheduleAutomation {
        host_instance_id: String,
        parameter_id: String,
        points: Vec<LanePoint>,
    },
    RetryInstance(String),
}

struct HostState {
    next_id: u64,
    runtimes: BTreeMap<String, InstanceRuntime>,
    retry_succeeds: bool,
}

/// Plugin host that hands out sequential host instance ids
/// (`host-1`, `host-2`, ...) and crashes on command.
pub struct FakePluginHost {
    calls: Mutex<Vec<HostCall>>,
    failures: FailureRules<HostCall>,
    state: Mutex<HostState>,
    crashes: broadcast::Sender<PluginCrash>,
    catalog: Vec<PluginDescriptor>,
}

impl Default for FakePluginHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePluginHost {
    pub fn new() -> Self {
        let (crashes, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            failures: FailureRules::new(),
            state: Mutex::new(HostState {
                next_id: 0,
                runtimes: BTreeMap::new(),
                retry_succeeds: true,
            }),
            crashes,
            catalog: Vec::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<PluginDescriptor>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn calls(&self) -> Vec<HostCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn fail_on(&self, matcher: impl Fn(&HostCall) -> bool + Send + Sync + 'static) {
        self.failures.add(matcher, None);
    }

    pub fn fail_once(&self, matcher: impl Fn(&HostCall) -> bool + Send + Sync + 'static) {
        self.failures.add(matcher, Some(1));
    }

    /// Whether `retry_instance` brings instances back
    pub fn set_retry_succeeds(&self, succeeds: bool) {
        lock(&self.state).retry_succeeds = succeeds;
    }

    /// Current host instance id of a session-level instance
    pub fn host_instance_id(&self, instance_id: &str) -> Option<String> {
        lock(&self.state)
            .runtimes
            .get(instance_id)
            .map(|runtime| runtime.native_instance_id.clone())
    }

    pub fn live_instances(&self) -> usize {
        lock(&self.state).runtimes.len()
    }

    /// Crash an instance. A recovered crash restarts it under a new host
    /// instance id before the notification goes out.
    pub fn crash(&self, instance_id: &str, recovered: bool) {
        {
            let mut state = lock(&self.state);
            if recovered {
                Self::restart(&mut state, instance_id);
            } else {
                state.runtimes.remove(instance_id);
            }
        }
        // No receivers is fine; crashes before subscription are not replayed
        let _ = self.crashes.send(PluginCrash {
            instance_id: instance_id.to_string(),
            recovered,
        });
    }

    fn restart(state: &mut HostState, instance_id: &str) -> InstanceRuntime {
        state.next_id += 1;
        let runtime = InstanceRuntime {
            handle: PluginHandle(format!("handle-{}", state.next_id)),
            native_instance_id: format!("host-{}", state.next_id),
        };
        state
            .runtimes
            .insert(instance_id.to_string(), runtime.clone());
        runtime
    }

    fn record(&self, call: HostCall) -> Result<()> {
        let failing = self.failures.trips(&call);
        lock(&self.calls).push(call);
        if failing {
            return Err(anyhow!("injected plugin host failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PluginHost for FakePluginHost {
    async fn load_plugin(
        &self,
        descriptor: &PluginDescriptor,
        options: &LoadOptions,
    ) -> Result<LoadedPlugin> {
        self.record(HostCall::LoadPlugin {
            plugin_id: descriptor.id.clone(),
            instance_id: options.instance_id.clone(),
            sandbox_identifier: options.sandbox_identifier.clone(),
        })?;
        let runtime = Self::restart(&mut lock(&self.state), &options.instance_id);
        Ok(LoadedPlugin {
            host_instance_id: runtime.native_instance_id,
            handle: runtime.handle,
        })
    }

    async fn release_plugin(&self, host_instance_id: &str) -> Result<()> {
        self.record(HostCall::ReleasePlugin(host_instance_id.to_string()))?;
        lock(&self.state)
            .runtimes
            .retain(|_, runtime| runtime.native_instance_id != host_instance_id);
        Ok(())
    }

    async fn schedule_automation(
        &self,
        host_instance_id: &str,
        parameter_id: &str,
        points: &[LanePoint],
    ) -> Result<()> {
        self.record(HostCall::ScheduleAutomation {
            host_instance_id: host_instance_id.to_string(),
            parameter_id: parameter_id.to_string(),
            points: points.to_vec(),
        })
    }

    fn crash_events(&self) -> broadcast::Receiver<PluginCrash> {
        self.crashes.subscribe()
    }

    async fn retry_instance(&self, instance_id: &str) -> Result<bool> {
        self.record(HostCall::RetryInstance(instance_id.to_string()))?;
        let mut state = lock(&self.state);
        if !state.retry_succeeds {
            return Ok(false);
        }
        Self::restart(&mut state, instance_id);
        Ok(true)
    }

    async fn instance_runtime(&self, instance_id: &str) -> Result<Option<InstanceRuntime>> {
        Ok(lock(&self.state).runtimes.get(instance_id).cloned())
    }

    async fn list_available_plugins(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(self.catalog.clone())
    }
}

// =============================================================================
// LOADER & RESOLVER
// =============================================================================

/// Audio loader serving decoded audio from memory
#[derive(Default)]
pub struct MemoryLoader {
    files: Mutex<HashMap<String, RawAudio>>,
    loads: Mutex<HashMap<String, usize>>,
    latency: Option<Duration>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every load yields for `latency` before completing
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, path: impl Into<String>, audio: RawAudio) {
        lock(&self.files).insert(path.into(), audio);
    }

    /// Insert a deterministic ramp signal with the given geometry
    pub fn insert_tone(&self, path: impl Into<String>, sample_rate: u32, channels: usize, frames: usize) {
        let data = (0..channels)
            .map(|channel| {
                (0..frames)
                    .map(|i| ((i + channel) % 100) as f32 / 100.0)
                    .collect()
            })
            .collect();
        self.insert(
            path,
            RawAudio {
                sample_rate,
                channels,
                frames,
                data,
            },
        );
    }

    pub fn load_count(&self, path: &str) -> usize {
        lock(&self.loads).get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AudioFileLoader for MemoryLoader {
    async fn load(&self, path: &str) -> Result<RawAudio> {
        *lock(&self.loads).entry(path.to_string()).or_default() += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        lock(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", path))
    }
}

/// Descriptor for tests and dry runs
pub fn descriptor(id: &str, version: &str) -> PluginDescriptor {
    PluginDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        vendor: "patchbay".to_string(),
        version: version.to_string(),
        format: "clap".to_string(),
    }
}

/// Resolver answering from a fixed `plugin_id -> descriptor` table
#[derive(Default)]
pub struct StaticResolver {
    descriptors: Mutex<BTreeMap<String, PluginDescriptor>>,
    cleared: Mutex<Vec<String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, descriptor: PluginDescriptor) -> Self {
        self.insert(descriptor);
        self
    }

    pub fn insert(&self, descriptor: PluginDescriptor) {
        lock(&self.descriptors).insert(descriptor.id.clone(), descriptor);
    }

    pub fn remove(&self, plugin_id: &str) {
        lock(&self.descriptors).remove(plugin_id);
    }

    /// Instance ids passed to `clear_instance`, in order
    pub fn cleared(&self) -> Vec<String> {
        lock(&self.cleared).clone()
    }
}

impl DescriptorResolver for StaticResolver {
    fn resolve(&self, _instance_id: &str, node: &PluginNode) -> Option<PluginDescriptor> {
        let descriptors = lock(&self.descriptors);
        let descriptor = descriptors.get(&node.plugin_id)?;
        match &node.version {
            Some(version) if *version != descriptor.version => None,
            _ => Some(descriptor.clone()),
        }
    }

    fn clear_instance(&self, instance_id: &str) {
        lock(&self.cleared).push(instance_id.to_string());
    }
}
