use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, Notify};
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::graph::BranchNotice;
use crate::hls::{HlsConfig, HlsState};
use crate::media::{EngineEvent, SimulatedEngine};
use crate::rtsp::{LocalRtspHost, RtspState};
use crate::source::SourceState;
use crate::upstream::{UpstreamState, UpstreamWriter};

struct RefusingConnector;

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<UpstreamWriter> {
        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
    }
}

/// Hands out in-memory pipes; keeps the peer ends open
#[derive(Default)]
struct PipeConnector {
    peers: Mutex<Vec<DuplexStream>>,
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<UpstreamWriter> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.peers.lock().push(remote);
        Ok(Box::new(local))
    }
}

/// Completes a connect only once the gate of its host is opened
#[derive(Default)]
struct GatedConnector {
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    peers: Mutex<Vec<DuplexStream>>,
}

impl GatedConnector {
    fn gate(&self, host: &str) -> Arc<Notify> {
        Arc::clone(self.gates.lock().entry(host.to_string()).or_default())
    }
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self, host: &str, _port: u16) -> io::Result<UpstreamWriter> {
        self.gate(host).notified().await;
        let (local, remote) = tokio::io::duplex(64 * 1024);
        self.peers.lock().push(remote);
        Ok(Box::new(local))
    }
}

struct Harness {
    daemon: Daemon,
    engine: Arc<SimulatedEngine>,
    host: Arc<LocalRtspHost>,
}

fn harness(config: DaemonConfig, connector: Arc<dyn Connector>) -> Harness {
    let engine = Arc::new(SimulatedEngine::manual());
    let host = Arc::new(LocalRtspHost::new());
    let daemon = Daemon::builder(config)
        .engine(engine.clone())
        .rtsp_host(host.clone())
        .connector(connector)
        .build()
        .unwrap();
    Harness {
        daemon,
        engine,
        host,
    }
}

/// Let the control loop drain its queue
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        seen.push(notification);
    }
    seen
}

fn source_code(daemon: &Daemon) -> i64 {
    daemon.property(Attribute::SourceState).unwrap().as_int().unwrap()
}

#[test]
fn test_build_requires_engine() {
    let err = Daemon::builder(DaemonConfig::default())
        .rtsp_host(Arc::new(LocalRtspHost::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::MissingCollaborator("media engine")));
}

#[tokio::test(start_paused = true)]
async fn test_spawn_twice_fails() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    let _control = h.daemon.spawn().unwrap();
    assert!(matches!(h.daemon.spawn(), Err(Error::InvalidState(_))));
}

#[tokio::test(start_paused = true)]
async fn test_rtsp_enable_mounts_both_presentations() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));

    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);
    assert_eq!(h.daemon.states().rtsp, RtspState::Idle);
    assert_eq!(h.host.mounts(), vec!["/stream".to_string(), "/stream-es".to_string()]);
    assert_eq!(h.host.port(), Some(554));
    assert_eq!(
        h.daemon.property(Attribute::Path).unwrap(),
        AttributeValue::Text("/stream".into())
    );

    // Idle RTSP does not keep the source running
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));

    assert!(!h.daemon.enable_rtsp(true, "/other", 8554, "", "").await);
}

#[tokio::test(start_paused = true)]
async fn test_rtsp_viewer_drives_source() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_rtsp(true, "/live", 8554, "", "").await);
    let mut rx = h.daemon.subscribe();

    let viewer = h.host.connect("10.0.0.7:50000", "/live?camera=2").unwrap();
    settle().await;

    assert_eq!(h.daemon.states().rtsp, RtspState::Running);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Playing.code()));
    assert_eq!(h.daemon.property(Attribute::RtspClientCount).unwrap(), AttributeValue::Int(1));
    assert_eq!(
        h.daemon.property(Attribute::UriParameters).unwrap(),
        AttributeValue::Text("camera=2".into())
    );
    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::RtspClientCountChanged {
        count: 1,
        addr: "10.0.0.7:50000".into()
    }));
    assert!(seen.contains(&Notification::RtspStateChanged(RtspState::Running)));

    h.host.disconnect(viewer);
    settle().await;

    assert_eq!(h.daemon.states().rtsp, RtspState::Idle);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));
    assert_eq!(h.daemon.property(Attribute::RtspClientCount).unwrap(), AttributeValue::Int(0));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_refused_stays_disabled() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    let mut rx = h.daemon.subscribe();

    assert!(!h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);
    assert_eq!(h.daemon.states().upstream, UpstreamState::Disabled);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));

    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::UpstreamStateChanged(UpstreamState::Connecting)));
    assert_eq!(
        seen.last(),
        Some(&Notification::UpstreamStateChanged(UpstreamState::Disabled))
    );
    // A refused connect does not recreate the encoders
    assert_eq!(h.engine.opened_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_first_overrun_enters_waiting() {
    let h = harness(DaemonConfig::default(), Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();

    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "token").await);
    assert_eq!(h.daemon.states().upstream, UpstreamState::Connecting);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Playing.code()));

    let mut rx = h.daemon.subscribe();
    let branch = h.daemon.0.core.lock().upstream.branch_id().unwrap();
    h.daemon.0.events.post(ControlEvent::Branch {
        consumer: Consumer::Upstream,
        branch,
        notice: BranchNotice::Overrun,
    });
    settle().await;

    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::UpstreamStateChanged(UpstreamState::Waiting)));
    assert!(seen.contains(&Notification::TcpBitrate(0)));
}

#[tokio::test(start_paused = true)]
async fn test_stale_upstream_notice_ignored() {
    let h = harness(DaemonConfig::default(), Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);
    let branch = h.daemon.0.core.lock().upstream.branch_id().unwrap();

    assert!(h.daemon.enable_upstream(false, "", 0, "").await);
    h.daemon.0.events.post(ControlEvent::Branch {
        consumer: Consumer::Upstream,
        branch,
        notice: BranchNotice::SinkFailed("broken pipe".into()),
    });
    settle().await;

    assert_eq!(h.daemon.states().upstream, UpstreamState::Disabled);
    // One rebuild from the disable, none from the stale failure
    assert_eq!(h.engine.opened_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_write_failure_keeps_other_consumers() {
    let h = harness(DaemonConfig::default(), Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);
    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);
    let mut rx = h.daemon.subscribe();

    let branch = h.daemon.0.core.lock().upstream.branch_id().unwrap();
    h.daemon.0.events.post(ControlEvent::Branch {
        consumer: Consumer::Upstream,
        branch,
        notice: BranchNotice::SinkFailed("connection reset".into()),
    });
    settle().await;

    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::UpstreamStateChanged(UpstreamState::Failed)));
    assert_eq!(h.daemon.states().upstream, UpstreamState::Disabled);
    assert_eq!(h.daemon.states().rtsp, RtspState::Idle);
    assert_eq!(h.engine.opened_count(), 1);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));
}

#[tokio::test(start_paused = true)]
async fn test_last_disable_rebuilds_source() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);
    assert_eq!(h.engine.opened_count(), 1);

    assert!(h.daemon.enable_rtsp(false, "", 0, "", "").await);
    assert!(h.daemon.states().all_disabled());
    assert!(h.host.mounts().is_empty());
    assert_eq!(h.engine.opened_count(), 2);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));

    assert!(!h.daemon.enable_rtsp(false, "", 0, "", "").await);
}

#[tokio::test(start_paused = true)]
async fn test_read_failure_rebuilds_source_under_rtsp() {
    let h = harness(DaemonConfig::default(), Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);
    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);
    let mut rx = h.daemon.subscribe();

    h.engine.raise(EngineEvent::ReadFailure("capture device gone".into()));
    settle().await;

    assert_eq!(h.daemon.states().upstream, UpstreamState::Disabled);
    assert_eq!(h.daemon.states().rtsp, RtspState::Idle);
    assert_eq!(h.engine.opened_count(), 2);
    assert_eq!(h.host.mounts(), vec!["/stream".to_string(), "/stream-es".to_string()]);
    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::EncoderError("capture device gone".into())));
    assert!(seen.contains(&Notification::UpstreamStateChanged(UpstreamState::Disabled)));
    assert!(!seen.contains(&Notification::RtspStateChanged(RtspState::Disabled)));

    // The mounts are fed from the new source
    let _viewer = h.host.connect("10.0.0.7:50000", "/stream").unwrap();
    settle().await;
    assert_eq!(h.daemon.states().rtsp, RtspState::Running);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Playing.code()));
    assert_eq!(h.daemon.0.core.lock().rtsp.branch_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_read_failure_without_consumers_recreates_source() {
    let h = harness(DaemonConfig::default(), Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);

    h.engine.raise(EngineEvent::ReadFailure("capture device gone".into()));
    settle().await;

    assert!(h.daemon.states().all_disabled());
    assert_eq!(h.engine.opened_count(), 2);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_reenable_ignores_superseded_connect() {
    let connector = Arc::new(GatedConnector::default());
    let h = harness(DaemonConfig::default(), connector.clone());

    let first = tokio::spawn({
        let daemon = h.daemon.clone();
        async move { daemon.enable_upstream(true, "hostA", 1, "").await }
    });
    settle().await;
    assert_eq!(h.daemon.states().upstream, UpstreamState::Connecting);
    assert!(h.daemon.enable_upstream(false, "", 0, "").await);

    let second = tokio::spawn({
        let daemon = h.daemon.clone();
        async move { daemon.enable_upstream(true, "hostB", 2, "").await }
    });
    settle().await;

    connector.gate("hostA").notify_one();
    assert!(!first.await.unwrap());
    assert_eq!(h.daemon.states().upstream, UpstreamState::Connecting);
    assert!(h.daemon.0.core.lock().upstream.branch_id().is_none());

    connector.gate("hostB").notify_one();
    assert!(second.await.unwrap());
    let core = h.daemon.0.core.lock();
    assert!(core.upstream.branch_id().is_some());
    assert!(format!("{:?}", core.upstream).contains("hostB:2"));
}

#[tokio::test(start_paused = true)]
async fn test_signal_lost_is_published() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    let _control = h.daemon.spawn().unwrap();
    let mut rx = h.daemon.subscribe();

    h.engine.raise(EngineEvent::SignalLost);
    settle().await;

    assert_eq!(drain(&mut rx), vec![Notification::EncoderSignalLost]);
    assert_eq!(h.engine.opened_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_ping() {
    let config = DaemonConfig::default().ping_interval(Duration::from_secs(1));
    let h = harness(config, Arc::new(RefusingConnector));
    let mut rx = h.daemon.subscribe();
    let _control = h.daemon.spawn().unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(drain(&mut rx), vec![Notification::Ping, Notification::Ping]);
}

#[tokio::test(start_paused = true)]
async fn test_attribute_writes_read_back() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));

    assert_ok!(h.daemon.set_property(Attribute::VideoBitrate, AttributeValue::Int(4_000)));
    assert_eq!(h.daemon.property(Attribute::VideoBitrate).unwrap(), AttributeValue::Int(4_000));

    assert_ok!(h.daemon.set_property(Attribute::OpenGop, true.into()));
    assert_eq!(h.daemon.property(Attribute::OpenGop).unwrap(), AttributeValue::Bool(true));

    h.daemon.set_property(Attribute::Width, AttributeValue::Int(640)).unwrap();
    assert_eq!(h.daemon.property(Attribute::Width).unwrap(), AttributeValue::Int(640));
    assert_eq!(h.daemon.property(Attribute::Height).unwrap(), AttributeValue::Int(720));

    h.daemon.set_property(Attribute::InputMode, AttributeValue::Int(2)).unwrap();
    assert_eq!(h.daemon.property(Attribute::InputMode).unwrap(), AttributeValue::Int(2));

    h.daemon.set_property(Attribute::AutoBitrate, false.into()).unwrap();
    assert_eq!(h.daemon.property(Attribute::AutoBitrate).unwrap(), AttributeValue::Bool(false));
}

#[tokio::test(start_paused = true)]
async fn test_attribute_write_rejections() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));

    assert!(matches!(
        h.daemon.set_property(Attribute::Path, AttributeValue::Text("/x".into())),
        Err(Error::ReadOnlyAttribute(_))
    ));
    assert!(matches!(
        h.daemon.set_property(Attribute::VideoBitrate, AttributeValue::Int(0)),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        h.daemon.set_property(Attribute::OpenGop, AttributeValue::Int(1)),
        Err(Error::AttributeType { .. })
    ));
    // Out of range: the engine ignores it and the read-back fails
    assert_err!(h.daemon.set_property(Attribute::BFrames, AttributeValue::Int(9)));
    assert_eq!(h.daemon.property(Attribute::BFrames).unwrap(), AttributeValue::Int(0));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_control_loop() {
    let h = harness(DaemonConfig::default(), Arc::new(RefusingConnector));
    let control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);

    h.daemon.shutdown().await;
    control.await.unwrap();

    assert!(h.daemon.states().all_disabled());
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Absent.code()));
}

#[tokio::test]
async fn test_hls_enable_and_disable() {
    let dir = tempfile::tempdir().unwrap();
    let segments = dir.path().join("hls");
    let config = DaemonConfig::default().hls(HlsConfig::with_directory(&segments));
    let h = harness(config, Arc::new(RefusingConnector));

    assert!(h.daemon.enable_hls(true, 0, "", "").await);
    assert_eq!(h.daemon.states().hls, HlsState::Idle);
    assert!(segments.is_dir());
    assert!(!h.daemon.enable_hls(true, 0, "", "").await);

    assert!(h.daemon.enable_hls(false, 0, "", "").await);
    assert_eq!(h.daemon.states().hls, HlsState::Disabled);
    assert!(!segments.exists());
}

#[tokio::test]
async fn test_hls_disable_halts_source_kept_by_idle_rtsp() {
    let dir = tempfile::tempdir().unwrap();
    let segments = dir.path().join("hls");
    let hls = HlsConfig::with_directory(&segments).segment_duration(Duration::from_millis(200));
    let h = harness(DaemonConfig::default().hls(hls), Arc::new(RefusingConnector));
    assert!(h.daemon.enable_rtsp(true, "", 0, "", "").await);
    assert!(h.daemon.enable_hls(true, 0, "", "").await);

    let bridge = HlsBridge {
        shared: Arc::downgrade(&h.daemon.0),
    };
    // No samples flow, so this gives up on the first segment and serves anyway
    assert!(bridge.playlist_requested().await);
    assert_eq!(h.daemon.states().hls, HlsState::Running);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Playing.code()));

    assert!(h.daemon.enable_hls(false, 0, "", "").await);
    assert_eq!(h.daemon.states().rtsp, RtspState::Idle);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));
    assert_eq!(h.engine.opened_count(), 1);
    assert!(!segments.exists());
}

#[tokio::test]
async fn test_write_failure_rebuilds_source_past_idle_hls() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::default().hls(HlsConfig::with_directory(dir.path().join("hls")));
    let h = harness(config, Arc::new(PipeConnector::default()));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_hls(true, 0, "", "").await);
    assert!(h.daemon.enable_upstream(true, "192.0.2.1", 9000, "").await);

    let branch = h.daemon.0.core.lock().upstream.branch_id().unwrap();
    h.daemon.0.events.post(ControlEvent::Branch {
        consumer: Consumer::Upstream,
        branch,
        notice: BranchNotice::SinkFailed("connection reset".into()),
    });
    settle().await;

    assert_eq!(h.daemon.states().upstream, UpstreamState::Disabled);
    assert_eq!(h.daemon.states().hls, HlsState::Idle);
    assert_eq!(h.engine.opened_count(), 2);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));

    assert!(h.daemon.enable_hls(false, 0, "", "").await);
}

#[tokio::test]
async fn test_hls_idle_timeout_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let segments = dir.path().join("hls");
    let hls = HlsConfig::with_directory(&segments).segment_duration(Duration::from_millis(100));
    let h = harness(DaemonConfig::default().hls(hls), Arc::new(RefusingConnector));
    let _control = h.daemon.spawn().unwrap();
    assert!(h.daemon.enable_hls(true, 0, "", "").await);
    let mut rx = h.daemon.subscribe();
    let bridge = HlsBridge {
        shared: Arc::downgrade(&h.daemon.0),
    };

    // Without samples the first segment never shows up; the wait is one segment long
    let requested = tokio::time::Instant::now();
    assert!(bridge.playlist_requested().await);
    let waited = requested.elapsed();
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(600));
    assert_eq!(h.daemon.states().hls, HlsState::Running);

    // Idle timeout is 500 ms; a served file restarts it
    tokio::time::sleep(Duration::from_millis(300)).await;
    bridge.touch();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.daemon.states().hls, HlsState::Running);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Playing.code()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.daemon.states().hls, HlsState::Idle);
    assert_eq!(source_code(&h.daemon), i64::from(SourceState::Ready.code()));
    assert_eq!(h.engine.opened_count(), 1);
    assert!(segments.is_dir());
    let seen = drain(&mut rx);
    assert!(seen.contains(&Notification::HlsStateChanged(HlsState::Running)));
    assert!(seen.contains(&Notification::HlsStateChanged(HlsState::Idle)));

    assert!(h.daemon.enable_hls(false, 0, "", "").await);
}
