//! End-to-end convergence through the conductor against in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use patchbay::testing::{descriptor, EngineCall, FakePluginHost, HostCall, MemoryLoader, RecordingEngine, StaticResolver};
use patchbay::{
    AutomationCurve, BufferKey, Clip, Collaborators, Conductor, ConvergenceReport, CurveTarget,
    EntryState, OptionValue, PluginNode, RoutingConnection, RoutingGraph, RoutingNode, Session,
    SyncError, Track,
};
use patchconf::PatchConfig;

struct Rig {
    engine: Arc<RecordingEngine>,
    host: Arc<FakePluginHost>,
    loader: Arc<MemoryLoader>,
    conductor: Conductor,
}

fn rig() -> Rig {
    let engine = Arc::new(RecordingEngine::new());
    let host = Arc::new(FakePluginHost::new());
    let loader = Arc::new(MemoryLoader::new());
    let resolver = Arc::new(StaticResolver::new().with(descriptor("eq", "1.0")));
    let conductor = Conductor::new(
        &PatchConfig::default(),
        Collaborators {
            engine: engine.clone(),
            host: host.clone(),
            loader: loader.clone(),
            resolver,
        },
    );
    Rig {
        engine,
        host,
        loader,
        conductor,
    }
}

fn with_eq() -> RoutingGraph {
    RoutingGraph::new()
        .with_node(RoutingNode::TrackInput { id: "in".into() })
        .with_node(RoutingNode::Plugin(PluginNode::new("fx", "eq-1", "eq")))
        .with_node(RoutingNode::TrackOutput { id: "out".into() })
        .with_connection(RoutingConnection::audio("in", "fx"))
        .with_connection(RoutingConnection::audio("fx", "out"))
}

fn cutoff_curve() -> AutomationCurve {
    AutomationCurve::new("cutoff", "cutoff")
        .targeting(CurveTarget::PluginParameter {
            instance_id: "eq-1".into(),
            parameter_id: "cutoff".into(),
        })
        .with_point(0.0, 0.2)
        .with_point(1000.0, 0.8)
}

fn plugin_session(revision: u64) -> Session {
    Session::new("song", revision)
        .with_track(Track::new("t1", with_eq()).with_curve(cutoff_curve()))
}

fn configured(calls: &[EngineCall], node_id: &str) -> Vec<patchbay::NodeConfiguration> {
    calls
        .iter()
        .filter_map(|call| match call {
            EngineCall::ConfigureNodes(nodes) => Some(nodes.clone()),
            _ => None,
        })
        .flatten()
        .filter(|node| node.id == node_id)
        .collect()
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_insert_plugin_rewires_only_what_changed() {
    let rig = rig();
    let first = Session::new("song", 1)
        .with_track(Track::new("t1", RoutingGraph::passthrough("in", "out")));
    rig.conductor.apply_session(Arc::new(first)).await.unwrap();
    rig.engine.clear_calls();

    rig.conductor
        .apply_session(Arc::new(plugin_session(2)))
        .await
        .unwrap();
    let commands = rig.engine.commands();

    let batches: Vec<&Vec<patchbay::NodeConfiguration>> = commands
        .iter()
        .filter_map(|call| match call {
            EngineCall::ConfigureNodes(nodes) => Some(nodes),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].id, "t1/fx");
    assert_eq!(
        batches[0][0].option("hostInstanceId"),
        Some(&OptionValue::Text("host-1".into()))
    );

    assert!(!commands.iter().any(|c| matches!(c, EngineCall::RemoveNodes(_))));
    assert!(commands.contains(&EngineCall::Disconnect("t1/in".into(), "t1/out".into())));
    assert!(commands.contains(&EngineCall::Connect("t1/in".into(), "t1/fx".into())));
    assert!(commands.contains(&EngineCall::Connect("t1/fx".into(), "t1/out".into())));
    assert!(!commands.contains(&EngineCall::Connect("t1/out".into(), "master".into())));

    assert!(rig.host.calls().iter().any(|call| matches!(
        call,
        HostCall::ScheduleAutomation { host_instance_id, parameter_id, points }
            if host_instance_id == "host-1" && parameter_id == "cutoff" && points.len() == 2
    )));
}

#[tokio::test]
async fn test_removing_plugin_releases_binding_after_clearing_automation() {
    let rig = rig();
    rig.conductor
        .apply_session(Arc::new(plugin_session(1)))
        .await
        .unwrap();
    rig.host.clear_calls();
    rig.engine.clear_calls();

    let without = Session::new("song", 2)
        .with_track(Track::new("t1", RoutingGraph::passthrough("in", "out")));
    let report = rig.conductor.apply_session(Arc::new(without)).await.unwrap();

    let ConvergenceReport::Applied(applied) = report else {
        panic!("expected an applied revision");
    };
    assert_eq!(applied.plugins_released, vec!["eq-1".to_string()]);
    assert_eq!(applied.graph.removed, vec!["t1/fx".to_string()]);

    let host_calls = rig.host.calls();
    // Clear holds the last value at frame 0
    let cleared = host_calls.iter().position(|call| {
        matches!(
            call,
            HostCall::ScheduleAutomation { host_instance_id, points, .. }
                if host_instance_id == "host-1"
                    && points.len() == 1
                    && points[0].frame == 0
                    && points[0].value == 0.8
        )
    });
    let released = host_calls
        .iter()
        .position(|call| *call == HostCall::ReleasePlugin("host-1".into()));
    assert!(cleared.is_some());
    assert!(cleared < released);
    assert!(rig.conductor.plugins().binding("eq-1").is_none());
}

#[tokio::test]
async fn test_shared_buffer_released_when_last_clip_goes() {
    let rig = rig();
    rig.loader.insert_tone("loop.wav", 48_000, 2, 4_800);
    let key = BufferKey::derive("loop.wav", 48_000, 4_800, 2);

    let both = Session::new("song", 1)
        .with_track(
            Track::new("t1", RoutingGraph::passthrough("in", "out"))
                .with_clip(Clip::new("a", "loop.wav", 0.0, 100.0)),
        )
        .with_track(
            Track::new("t2", RoutingGraph::passthrough("in", "out"))
                .with_clip(Clip::new("b", "loop.wav", 500.0, 100.0)),
        );
    rig.conductor.apply_session(Arc::new(both.clone())).await.unwrap();

    let uploads = rig
        .engine
        .calls()
        .iter()
        .filter(|call| matches!(call, EngineCall::UploadClipBuffer { .. }))
        .count();
    assert_eq!(uploads, 1);
    assert_eq!(rig.loader.load_count("loop.wav"), 1);
    assert_eq!(
        rig.conductor.buffer_cache().entry_state(&key),
        EntryState::Cached { refs: 1 }
    );

    let mut one = both.next_revision();
    one.tracks[1].clips.clear();
    rig.conductor.apply_session(Arc::new(one.clone())).await.unwrap();
    assert!(!rig
        .engine
        .calls()
        .contains(&EngineCall::ReleaseClipBuffer(key.clone())));

    let mut none = one.next_revision();
    none.tracks[0].clips.clear();
    rig.conductor.apply_session(Arc::new(none)).await.unwrap();
    let releases = rig
        .engine
        .calls()
        .iter()
        .filter(|call| **call == EngineCall::ReleaseClipBuffer(key.clone()))
        .count();
    assert_eq!(releases, 1);
    assert_eq!(rig.conductor.buffer_cache().entry_state(&key), EntryState::Gone);
}

#[tokio::test]
async fn test_bad_clip_skipped_and_retried_next_revision() {
    let rig = rig();
    rig.loader.insert_tone("good.wav", 48_000, 1, 480);
    let session = Session::new("song", 1).with_track(
        Track::new("t1", RoutingGraph::passthrough("in", "out"))
            .with_clip(Clip::new("good", "good.wav", 0.0, 10.0))
            .with_clip(Clip::new("late", "late.wav", 0.0, 10.0)),
    );

    let report = rig.conductor.apply_session(Arc::new(session.clone())).await.unwrap();
    let ConvergenceReport::Applied(applied) = report else {
        panic!("expected an applied revision");
    };
    assert_eq!(applied.skipped_clips.len(), 1);
    assert_eq!(applied.skipped_clips[0].clip_id, "late");
    assert!(applied.graph.configured.contains(&"t1/clip:good".to_string()));

    rig.loader.insert_tone("late.wav", 48_000, 1, 480);
    let report = rig
        .conductor
        .apply_session(Arc::new(session.next_revision()))
        .await
        .unwrap();
    let ConvergenceReport::Applied(applied) = report else {
        panic!("expected an applied revision");
    };
    assert!(applied.skipped_clips.is_empty());
    assert_eq!(applied.graph.configured, vec!["t1/clip:late".to_string()]);
}

#[tokio::test]
async fn test_unrecovered_crash_stays_offline_until_retry() {
    let rig = rig();
    rig.conductor.start();
    rig.conductor
        .apply_session(Arc::new(plugin_session(1)))
        .await
        .unwrap();
    rig.engine.clear_calls();
    rig.host.clear_calls();

    rig.host.crash("eq-1", false);
    assert!(eventually(|| rig.conductor.crashed_plugins().contains("eq-1")).await);
    assert!(
        eventually(|| !configured(&rig.engine.calls(), "t1/fx").is_empty()).await
    );
    let offline = configured(&rig.engine.calls(), "t1/fx");
    assert_eq!(offline[0].option("offline"), Some(&OptionValue::Bool(true)));

    // A new revision does not try to bring it back
    rig.conductor
        .apply_session(Arc::new(plugin_session(2)))
        .await
        .unwrap();
    assert!(!rig
        .host
        .calls()
        .iter()
        .any(|call| matches!(call, HostCall::LoadPlugin { .. })));
    assert!(rig.conductor.crashed_plugins().contains("eq-1"));

    assert!(rig.conductor.retry_plugin("eq-1").await.unwrap());
    assert!(rig.conductor.crashed_plugins().is_empty());

    let restarted = rig.host.host_instance_id("eq-1").unwrap();
    assert_ne!(restarted, "host-1");
    let online = configured(&rig.engine.calls(), "t1/fx");
    assert_eq!(
        online.last().and_then(|n| n.option("hostInstanceId")),
        Some(&OptionValue::Text(restarted.clone()))
    );
    assert!(rig.host.calls().iter().any(|call| matches!(
        call,
        HostCall::ScheduleAutomation { host_instance_id, parameter_id, .. }
            if *host_instance_id == restarted && parameter_id == "cutoff"
    )));

    rig.conductor.shutdown().await;
}

#[tokio::test]
async fn test_recovered_crash_replays_without_retry() {
    let rig = rig();
    rig.conductor.start();
    rig.conductor
        .apply_session(Arc::new(plugin_session(1)))
        .await
        .unwrap();
    rig.host.clear_calls();

    rig.host.crash("eq-1", true);
    let restarted = rig.host.host_instance_id("eq-1").unwrap();
    assert!(
        eventually(|| rig.host.calls().iter().any(|call| matches!(
            call,
            HostCall::ScheduleAutomation { host_instance_id, .. } if *host_instance_id == restarted
        )))
        .await
    );
    assert!(rig.conductor.crashed_plugins().is_empty());
    assert!(!rig
        .host
        .calls()
        .iter()
        .any(|call| matches!(call, HostCall::RetryInstance(_))));

    rig.conductor.shutdown().await;
}

#[tokio::test]
async fn test_revisions_are_idempotent_and_monotonic() {
    let rig = rig();
    rig.conductor
        .apply_session(Arc::new(plugin_session(3)))
        .await
        .unwrap();
    rig.engine.clear_calls();
    rig.host.clear_calls();

    let again = rig
        .conductor
        .apply_session(Arc::new(plugin_session(3)))
        .await
        .unwrap();
    assert_eq!(again, ConvergenceReport::Unchanged { revision: 3 });
    assert!(rig.engine.calls().is_empty());
    assert!(rig.host.calls().is_empty());

    let err = rig
        .conductor
        .apply_session(Arc::new(plugin_session(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::RevisionRegression { .. }));

    // Same content, later revision: nothing to do on either side
    let report = rig
        .conductor
        .apply_session(Arc::new(plugin_session(4)))
        .await
        .unwrap();
    let ConvergenceReport::Applied(applied) = report else {
        panic!("expected an applied revision");
    };
    assert!(applied.graph.is_empty());
    assert!(applied.automation.published.is_empty());
    assert!(rig.engine.commands().is_empty());
}

#[tokio::test]
async fn test_missing_routing_graph_is_fatal() {
    let rig = rig();
    let mut session = Session::new("song", 1)
        .with_track(Track::new("t1", RoutingGraph::passthrough("in", "out")));
    session.tracks[0].routing = None;

    let err = rig
        .conductor
        .apply_session(Arc::new(session))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingRoutingGraph { ref track_id } if track_id == "t1"));
    assert!(rig.engine.commands().is_empty());
    assert_eq!(rig.conductor.last_applied_revision(), None);
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let rig = rig();
    rig.loader.insert_tone("a.wav", 48_000, 1, 480);
    let session = Session::new("song", 1).with_track(
        Track::new("t1", with_eq()).with_clip(Clip::new("c", "a.wav", 0.0, 10.0)),
    );
    rig.conductor.start();
    rig.conductor.apply_session(Arc::new(session)).await.unwrap();
    rig.engine.clear_calls();

    rig.conductor.shutdown().await;

    assert!(rig
        .host
        .calls()
        .contains(&HostCall::ReleasePlugin("host-1".into())));
    assert!(rig
        .engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::ReleaseClipBuffer(_))));
    assert!(rig.conductor.buffer_cache().is_empty());
    assert_eq!(rig.host.live_instances(), 0);
    assert_eq!(rig.conductor.last_applied_revision(), None);
}

#[tokio::test]
async fn test_shutdown_survives_release_failures() {
    let rig = rig();
    rig.loader.insert_tone("a.wav", 48_000, 1, 480);
    let session = Session::new("song", 1).with_track(
        Track::new("t1", with_eq()).with_clip(Clip::new("c", "a.wav", 0.0, 10.0)),
    );
    rig.conductor.apply_session(Arc::new(session)).await.unwrap();

    rig.host
        .fail_on(|call| matches!(call, HostCall::ReleasePlugin(_)));
    rig.conductor.shutdown().await;

    // Buffer release still attempted after the plugin release failed
    assert!(rig
        .engine
        .calls()
        .iter()
        .any(|call| matches!(call, EngineCall::ReleaseClipBuffer(_))));
}
