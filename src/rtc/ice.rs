use crate::report::{Outcome, ReportLog, Step};
use crate::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Logs a trickled candidate as it shows up
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        log::debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index
        );
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates<S: AsRef<str>>(candidates: &[S]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        let candidate = candidate.as_ref();
        if candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    log::debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host,
        summary.srflx,
        summary.relay
    );
    if summary.relay == 0 {
        log::warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    summary
}

/// Whether a gathered candidate proves `server_type` works: STUN servers
/// must yield a srflx candidate, TURN servers a relay one.
pub fn candidate_matches(server_type: &str, candidate: &str) -> bool {
    match server_type {
        "turn" => candidate.contains("relay"),
        _ => candidate.contains("srflx"),
    }
}

/// Gathers candidates against a single server and reports whether it answered.
pub async fn check_ice_server_availability(config: &ServerConfig, limit: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    log::debug!("checking ICE server {} ('{}' -> '{}')", config.id, config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => {
            let pc = Arc::new(pc);
            let available = check_via_ice_gathering(&pc, &config.r#type, limit).await;
            if let Err(e) = pc.close().await {
                log::debug!("closing probe connection failed: {e}");
            }
            available
        }
        Err(e) => {
            log::warn!("Failed to create peer connection: {e}");
            false
        }
    }
}

async fn check_via_ice_gathering(
    pc: &Arc<RTCPeerConnection>,
    server_type: &str,
    limit: Duration,
) -> bool {
    let (gather_tx, mut gather_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        log::debug!("ICE gathering state changed to: {:?}", state);
        let _ = gather_tx.send(state);
        Box::pin(async {})
    }));

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let kind = server_type.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            dump_candidate("PREFLIGHT", &c);
            if let Ok(init) = c.to_json() {
                if candidate_matches(&kind, &init.candidate) {
                    let _ = found_tx.send(());
                }
            }
        }
        Box::pin(async {})
    }));

    // a data channel plus an offer starts gathering
    if let Err(e) = pc.create_data_channel("preflight", None).await {
        log::warn!("Failed to create data channel: {e}");
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            log::warn!("Failed to create offer: {e}");
            return false;
        }
    };
    if let Err(e) = pc.set_local_description(offer).await {
        log::warn!("Failed to set local description: {e}");
        return false;
    }

    tokio::select! {
        result = timeout(limit, found_rx.recv()) => matches!(result, Ok(Some(()))),
        _ = async {
            while let Some(state) = gather_rx.recv().await {
                if state == RTCIceGathererState::Complete {
                    break;
                }
            }
        } => {
            // gathering may finish just after the matching candidate arrived
            found_rx.try_recv().is_ok()
        }
    }
}

/// Checks every configured server and records one entry per server.
pub async fn preflight(servers: &[ServerConfig], report: &mut ReportLog) -> usize {
    let mut reachable = 0;
    for server in servers {
        report.record(
            Step::IcePreflight,
            Outcome::Running,
            format!("checking {} server {}", server.r#type, server.url),
        );
        if check_ice_server_availability(server, CHECK_TIMEOUT).await {
            reachable += 1;
            report.record(
                Step::IcePreflight,
                Outcome::Success,
                format!("{} is reachable", server.url),
            );
        } else {
            report.record(
                Step::IcePreflight,
                Outcome::Failed,
                format!("{} did not answer", server.url),
            );
        }
    }
    reachable
}
