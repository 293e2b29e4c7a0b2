use salang_lib::commands::demo::{render_text, run_demo, DemoOptions, Transport};
use salang_lib::config::AppConfig;
use salang_lib::media::SyntheticDevices;
use salang_lib::report::{Outcome, Step};
use salang_lib::session::{Phase, Session};
use salang_lib::signaling::MemoryHub;
use salang_lib::types::IceConnectionState;
use std::sync::Arc;
use std::time::Duration;

fn session(hub: &MemoryHub) -> Session {
    Session::new(
        AppConfig::default(),
        Arc::new(SyntheticDevices::new()),
        Arc::new(hub.clone()),
    )
}

#[tokio::test(start_paused = true)]
async fn two_sessions_see_each_other() {
    let hub = MemoryHub::new();
    hub.set_latency(Duration::from_millis(40));
    let mut caller = session(&hub);
    let mut callee = session(&hub);

    caller.start("abc123").await.unwrap();
    callee.start("abc123").await.unwrap();
    caller.pump().await;
    callee.pump().await;

    for (me, other) in [(&caller, &callee), (&callee, &caller)] {
        assert_eq!(me.phase(), Phase::PeerConnected);
        let other_id = other.local_peer_id().unwrap();
        assert!(me.peers().contains(&other_id));
        assert_eq!(me.remote_peer(), Some(other_id.as_str()));
        assert_eq!(me.ice_state(), IceConnectionState::Connected);
        assert_eq!(me.report().for_step(Step::AudioTrack).count(), 1);
    }

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    caller.pump().await;
    callee.pump().await;
    assert_eq!(caller.latency_ms(), Some(40));
    assert_eq!(callee.latency_ms(), Some(40));

    callee.stop().await.unwrap();
    caller.pump().await;
    assert_eq!(caller.phase(), Phase::PeerDisconnected);
    assert!(caller.remote_capture().is_none());
    caller.stop().await.unwrap();
    assert!(hub.members("abc123").is_empty());
}

#[tokio::test(start_paused = true)]
async fn third_peer_replaces_the_probe_timer() {
    let hub = MemoryHub::new();
    let mut a = session(&hub);
    let mut b = session(&hub);
    let mut c = session(&hub);
    a.start("room").await.unwrap();
    b.start("room").await.unwrap();
    a.pump().await;
    c.start("room").await.unwrap();
    a.pump().await;

    let c_id = c.local_peer_id().unwrap();
    assert_eq!(a.peers().len(), 2);
    assert_eq!(a.probed_peer(), Some(c_id.as_str()));

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    a.pump().await;
    assert_eq!(a.report().for_step(Step::Latency).count(), 1);

    for s in [&mut a, &mut b, &mut c] {
        s.stop().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn stale_events_after_stop_are_dropped() {
    let hub = MemoryHub::new();
    let mut caller = session(&hub);
    let mut callee = session(&hub);
    caller.start("room").await.unwrap();
    callee.start("room").await.unwrap();

    // the callee's join and stream are still queued when the caller stops
    caller.stop().await.unwrap();
    let len = caller.report().len();
    callee.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(caller.pump().await > 0);
    assert_eq!(caller.report().len(), len);
    assert_eq!(caller.phase(), Phase::Stopped);
    assert!(caller.peers().is_empty());
    assert!(caller.remote_capture().is_none());
}

#[tokio::test(start_paused = true)]
async fn ping_failures_show_up_as_failed_latency() {
    let hub = MemoryHub::new();
    hub.fail_pings(true);
    let mut caller = session(&hub);
    let mut callee = session(&hub);
    caller.start("room").await.unwrap();
    callee.start("room").await.unwrap();
    caller.pump().await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    caller.pump().await;
    let entry = caller.report().for_step(Step::Latency).last().unwrap();
    assert_eq!(entry.outcome, Outcome::Failed);
    assert_eq!(caller.phase(), Phase::PeerConnected);
}

#[tokio::test(start_paused = true)]
async fn demo_runs_both_sides_to_completion() {
    let sides = run_demo(
        AppConfig::default(),
        DemoOptions {
            room_id: "demo-room".into(),
            duration: Duration::from_secs(4),
            latency: Duration::from_millis(35),
            transport: Transport::Memory,
        },
    )
    .await
    .unwrap();

    assert_eq!(sides.len(), 2);
    for side in &sides {
        assert_eq!(side.snapshot.room_id.as_deref(), Some("demo-room"));
        assert_eq!(side.snapshot.phase, Phase::PeerConnected);
        assert_eq!(side.snapshot.latency_ms, Some(35));
        assert!(side.snapshot.levels.remote > 0.0);
        let end = side.entries.last().unwrap();
        assert_eq!((end.step, end.outcome), (Step::TestEnd, Outcome::Success));
    }

    let text = render_text(&sides);
    assert!(text.contains("== caller (room demo-room) =="));
    assert!(text.contains("35ms (good)"));
    let json = serde_json::to_string(&sides).unwrap();
    assert!(json.contains("\"name\":\"callee\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_measure_latency_over_webrtc() {
    let config = AppConfig {
        probe_interval_ms: 500,
        ..AppConfig::default()
    };
    let hub = salang_lib::RtcHub::virtual_network();
    let mut caller = Session::new(
        config.clone(),
        Arc::new(SyntheticDevices::new()),
        Arc::new(hub.clone()),
    );
    let mut callee = Session::new(config, Arc::new(SyntheticDevices::new()), Arc::new(hub));
    caller.start("rtc-room").await.unwrap();
    callee.start("rtc-room").await.unwrap();

    let measured = tokio::time::timeout(Duration::from_secs(30), async {
        while caller.latency_ms().is_none() {
            caller.step().await;
        }
    })
    .await;
    assert!(measured.is_ok(), "no round trip measured");
    caller.pump().await;
    assert_eq!(caller.phase(), Phase::PeerConnected);
    assert!(caller.ice_state().is_established());
    assert!(caller
        .report()
        .for_step(Step::IceState)
        .any(|e| e.outcome == Outcome::Success));

    callee.stop().await.unwrap();
    caller.stop().await.unwrap();
}
