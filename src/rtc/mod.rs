//! webrtc-rs glue: configuration, state mapping, a [`PeerLink`] over a
//! real `RTCPeerConnection` and the [`room::RtcHub`] built on top of them.

pub mod ice;
pub mod probe;
pub mod room;

use crate::error::SessionError;
use crate::signaling::{PeerLink, RoomEvent, RoomEventSender};
use crate::types::{IceConnectionState, PeerId, ServerConfig};
use crate::utils::{add_ice_url_scheme, short_id};
use std::sync::Arc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::{setting_engine::SettingEngine, APIBuilder},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Peer connection configuration for the given ICE servers
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub async fn new_peer_connection(
    servers: &[ServerConfig],
) -> Result<Arc<RTCPeerConnection>, SessionError> {
    new_peer_connection_with(servers, SettingEngine::default()).await
}

pub async fn new_peer_connection_with(
    servers: &[ServerConfig],
    settings: SettingEngine,
) -> Result<Arc<RTCPeerConnection>, SessionError> {
    let api = APIBuilder::new().with_setting_engine(settings).build();
    let pc = api.new_peer_connection(rtc_config(servers)).await?;
    Ok(Arc::new(pc))
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                IceConnectionState::New
            }
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

/// Connection to one remote peer, as handed out by a webrtc-backed room
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

impl PeerLink for RtcPeerLink {
    fn ice_state(&self) -> IceConnectionState {
        self.pc.ice_connection_state().into()
    }

    fn on_ice_state_change(&self, peer: PeerId, events: RoomEventSender) {
        // webrtc-rs keeps a single handler, so this replaces the previous one
        self.pc
            .on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
                log::debug!("ICE state of {} changed to: {:?}", short_id(&peer), st);
                events.send(RoomEvent::IceStateChanged {
                    peer: peer.clone(),
                    state: st.into(),
                });
                Box::pin(async {})
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn config_carries_every_server() {
        let mut servers = AppConfig::default().ice_servers;
        servers.push(ServerConfig {
            id: "coturn".into(),
            r#type: "turn".into(),
            url: "localhost:3478".into(),
            username: Some("salang".into()),
            credential: Some("salang123".into()),
        });
        let config = rtc_config(&servers);
        assert_eq!(config.ice_servers.len(), 6);
        let turn = &config.ice_servers[5];
        assert_eq!(turn.urls, vec!["turn:localhost:3478".to_string()]);
        assert_eq!(turn.username, "salang");
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
    }

    #[test]
    fn maps_every_ice_state() {
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Unspecified),
            IceConnectionState::New
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Failed),
            IceConnectionState::Failed
        );
    }

    #[tokio::test]
    async fn fresh_link_is_new() {
        let pc = new_peer_connection(&[]).await.unwrap();
        let link = RtcPeerLink::new(pc.clone());
        assert_eq!(link.ice_state(), IceConnectionState::New);
        link.on_ice_state_change("peer-1".into(), RoomEventSender::channel().0);
        pc.close().await.unwrap();
    }
}
