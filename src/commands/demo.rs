use crate::config::AppConfig;
use crate::error::SessionError;
use crate::media::SyntheticDevices;
use crate::report::ReportEntry;
use crate::rtc::room::RtcHub;
use crate::session::{Session, SessionSnapshot};
use crate::signaling::{MemoryHub, SignalingProvider};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How the two demo sessions reach each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// In-process hub with a simulated round trip
    #[default]
    Memory,
    /// webrtc-rs connections over the host network
    Rtc,
    /// webrtc-rs connections over a virtual network
    VirtualRtc,
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub room_id: String,
    pub duration: Duration,
    /// Only used by [`Transport::Memory`]
    pub latency: Duration,
    pub transport: Transport,
}

/// Final state of one side of the demo
#[derive(Serialize, Debug)]
pub struct SideReport {
    pub name: &'static str,
    /// taken just before teardown
    pub snapshot: SessionSnapshot,
    pub entries: Vec<ReportEntry>,
}

/// Two sessions meeting in one room of an in-process hub.
///
/// Runs until `duration` elapses or Ctrl-C, then stops the callee first so the
/// caller sees it leave, and finally stops the caller.
pub async fn run_demo(config: AppConfig, opts: DemoOptions) -> Result<Vec<SideReport>, SessionError> {
    let signaling: Arc<dyn SignalingProvider> = match opts.transport {
        Transport::Memory => {
            let hub = MemoryHub::new();
            hub.set_latency(opts.latency);
            Arc::new(hub)
        }
        Transport::Rtc => Arc::new(RtcHub::new()),
        Transport::VirtualRtc => Arc::new(RtcHub::virtual_network()),
    };

    let mut caller = Session::new(
        config.clone(),
        Arc::new(SyntheticDevices::new().with_tone(440.0, 0.6)),
        signaling.clone(),
    );
    let mut callee = Session::new(
        config,
        Arc::new(SyntheticDevices::new().with_tone(880.0, 0.3)),
        signaling,
    );

    caller.start(&opts.room_id).await?;
    if let Err(err) = callee.start(&opts.room_id).await {
        let _ = caller.stop().await;
        return Err(err);
    }
    log::info!(
        "demo running in room {} for {:?} ({:?})",
        opts.room_id,
        opts.duration,
        opts.transport
    );

    let deadline = tokio::time::sleep(opts.duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = caller.next_event() => caller.handle(event).await,
            Some(event) = callee.next_event() => callee.handle(event).await,
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted, tearing down");
                break;
            }
        }
    }

    let caller_snapshot = caller.snapshot();
    let callee_snapshot = callee.snapshot();

    if let Err(err) = callee.stop().await {
        log::error!("callee teardown: {err}");
    }
    caller.pump().await;
    if let Err(err) = caller.stop().await {
        log::error!("caller teardown: {err}");
    }

    Ok(vec![
        SideReport {
            name: "caller",
            snapshot: caller_snapshot,
            entries: caller.report().entries().to_vec(),
        },
        SideReport {
            name: "callee",
            snapshot: callee_snapshot,
            entries: callee.report().entries().to_vec(),
        },
    ])
}

pub fn render_text(sides: &[SideReport]) -> String {
    let mut out = String::new();
    for side in sides {
        let snap = &side.snapshot;
        out.push_str(&format!(
            "== {} (room {}) ==\n",
            side.name,
            snap.room_id.as_deref().unwrap_or("-")
        ));
        for entry in &side.entries {
            out.push_str(&format!("{entry}\n"));
        }
        let latency = match (snap.latency_ms, snap.latency_grade) {
            (Some(ms), Some(grade)) => format!("{ms}ms ({grade})"),
            _ => "-".into(),
        };
        out.push_str(&format!(
            "phase: {}  ICE: {}  peers: {}  latency: {}  levels: local {:.1}% / remote {:.1}%\n\n",
            snap.phase,
            snap.ice_state,
            snap.peers.len(),
            latency,
            snap.levels.local,
            snap.levels.remote
        ));
    }
    out
}
