//! Patchbay: Session-to-Engine Synchronization
//!
//! Keeps a realtime audio engine and an out-of-process plugin host converged
//! on the latest session snapshot. Each new revision is turned into a desired
//! engine state and reconciled with the minimum set of commands:
//!
//! - **Graph**: node configurations and connections, diffed against what was applied
//! - **Automation**: parameter lanes, republished only when their content changes
//! - **Clip buffers**: decoded, resampled, uploaded once and reference counted
//! - **Plugins**: bound per instance, parked offline on crash, rebound on recovery
//! - **Transport and diagnostics**: polled and published on watch channels

pub mod automation;
pub mod buffer_cache;
pub mod conductor;
pub mod desired;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod plugins;
pub mod pollers;
pub mod reconciler;
pub mod recovery;
pub mod resample;
pub mod session;
pub mod testing;
pub mod wav;

pub use automation::{AutomationPublisher, AutomationRequest, AutomationTarget, PublishReport};
pub use buffer_cache::{BufferCache, ClipBufferDescriptor, EntryState};
pub use conductor::{AppliedRevision, Collaborators, Conductor, ConvergenceReport};
pub use desired::{DesiredState, DesiredStateBuilder, SkippedClip, MASTER_NODE_ID};
pub use engine::{
    AudioFileLoader, AutomationLane, ConnectionKey, DescriptorResolver, Engine,
    EngineCapabilities, LanePoint, NodeConfiguration, NodeType, OptionValue, PluginCrash,
    PluginDescriptor, PluginHost, RawAudio, RenderDiagnostics, TransportState,
};
pub use error::{BufferError, SyncError};
pub use fingerprint::{BufferKey, Fingerprint};
pub use plugins::{CatalogResolver, PluginInstanceBinding, PluginLifecycleManager};
pub use pollers::{
    DiagnosticsPoller, DiagnosticsSnapshot, DiagnosticsStatus, PollSource, Poller,
    TransportPoller, TransportSnapshot,
};
pub use reconciler::{GraphReconciler, ReconcileReport};
pub use recovery::{CrashRecoveryCoordinator, CrashWatch, RecoverySnapshot};
pub use session::{
    AutomationCurve, Clip, CurveTarget, PluginNode, RoutingConnection, RoutingGraph, RoutingNode,
    Session, Track,
};
pub use wav::{decode_wav, WavFileLoader};
