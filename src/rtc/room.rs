//! Rooms whose members talk over real `RTCPeerConnection`s.
//!
//! Room membership and the SDP exchange stay in-process, but every pair of
//! members gets an offerer/answerer connection with a probe data channel.
//! ICE states and round trips therefore come from webrtc-rs itself. Captures
//! are still handed over in-process.

use super::probe::Pinger;
use super::{new_peer_connection_with, RtcPeerLink};
use crate::error::SessionError;
use crate::media::CaptureHandle;
use crate::signaling::{PeerLink, Room, RoomConfig, RoomEvent, RoomEventSender, SignalingProvider};
use crate::types::{PeerId, ServerConfig};
use crate::utils::{lock, random_id, short_id};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

pub const PROBE_CHANNEL: &str = "salang-probe";
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);
const VNET_CIDR: &str = "10.0.0.0/24";
const VNET_OFFER_IP: &str = "10.0.0.2";
const VNET_ANSWER_IP: &str = "10.0.0.3";

type PingerSlot = Arc<Mutex<Option<Arc<Pinger>>>>;

/// Signaling provider backed by webrtc-rs peer connections.
///
/// [`RtcHub::new`] uses the host's network and the configured ICE servers.
/// [`RtcHub::virtual_network`] puts every connection pair on its own
/// webrtc-rs virtual network, which needs no sockets at all.
#[derive(Clone, Default)]
pub struct RtcHub {
    inner: Arc<Mutex<HubState>>,
    virtual_network: bool,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
}

struct Member {
    peer_id: PeerId,
    events: RoomEventSender,
    ends: HashMap<PeerId, Arc<Endpoint>>,
    published: Option<CaptureHandle>,
}

/// This member's side of the connection to one other member
struct Endpoint {
    link: Arc<RtcPeerLink>,
    pinger: PingerSlot,
    router: Option<Arc<AsyncMutex<Router>>>,
}

impl Endpoint {
    fn pinger(&self) -> Option<Arc<Pinger>> {
        lock(&self.pinger).clone()
    }

    async fn close(&self) {
        if let Err(err) = self.link.connection().close().await {
            log::debug!("closing peer connection failed: {err}");
        }
        if let Some(router) = &self.router {
            // both ends share the router; the second stop is refused
            if let Err(err) = router.lock().await.stop().await {
                log::debug!("virtual router stop: {err}");
            }
        }
    }
}

impl RtcHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn virtual_network() -> Self {
        Self {
            virtual_network: true,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.inner)
    }

    async fn connect_pair(
        &self,
        servers: &[ServerConfig],
    ) -> Result<(Endpoint, Endpoint), SessionError> {
        let (offer_settings, answer_settings, router, servers) = if self.virtual_network {
            let router = new_router()?;
            let offer = vnet_settings(&router, VNET_OFFER_IP).await?;
            let answer = vnet_settings(&router, VNET_ANSWER_IP).await?;
            router.lock().await.start().await.map_err(vnet_error)?;
            // nothing outside the virtual network is reachable
            (offer, answer, Some(router), &[][..])
        } else {
            (SettingEngine::default(), SettingEngine::default(), None, servers)
        };

        let offerer = new_peer_connection_with(servers, offer_settings).await?;
        let answerer = new_peer_connection_with(servers, answer_settings).await?;

        // newcomer offers and owns the probe channel
        let dc = offerer.create_data_channel(PROBE_CHANNEL, None).await?;
        let offer_pinger = Arc::new(Pinger::new(dc.clone()));
        offer_pinger.attach(&dc);
        let offer_slot: PingerSlot = Arc::new(Mutex::new(Some(offer_pinger)));

        let answer_slot: PingerSlot = Arc::new(Mutex::new(None));
        let slot = answer_slot.clone();
        answerer.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            log::debug!("probe channel '{}' arrived", dc.label());
            let pinger = Arc::new(Pinger::new(dc.clone()));
            pinger.attach(&dc);
            *lock(&slot) = Some(pinger);
            Box::pin(async {})
        }));

        let offer = offerer.create_offer(None).await?;
        let offer = complete_local_description(&offerer, offer).await?;
        answerer.set_remote_description(offer).await?;
        let answer = answerer.create_answer(None).await?;
        let answer = complete_local_description(&answerer, answer).await?;
        offerer.set_remote_description(answer).await?;

        Ok((
            Endpoint {
                link: Arc::new(RtcPeerLink::new(offerer)),
                pinger: offer_slot,
                router: router.clone(),
            },
            Endpoint {
                link: Arc::new(RtcPeerLink::new(answerer)),
                pinger: answer_slot,
                router,
            },
        ))
    }
}

/// Sets `description` and waits for gathering, so the result carries every
/// candidate and no trickling is needed.
async fn complete_local_description(
    pc: &Arc<RTCPeerConnection>,
    description: RTCSessionDescription,
) -> Result<RTCSessionDescription, SessionError> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    if timeout(GATHER_TIMEOUT, gathered.recv()).await.is_err() {
        log::warn!("ICE gathering did not finish within {GATHER_TIMEOUT:?}");
    }
    pc.local_description()
        .await
        .ok_or_else(|| SessionError::SignalingFailure("missing local description".into()))
}

fn vnet_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::SignalingFailure(format!("virtual network: {err}"))
}

fn new_router() -> Result<Arc<AsyncMutex<Router>>, SessionError> {
    let router = Router::new(RouterConfig {
        cidr: VNET_CIDR.to_owned(),
        ..Default::default()
    })
    .map_err(vnet_error)?;
    Ok(Arc::new(AsyncMutex::new(router)))
}

async fn vnet_settings(
    router: &Arc<AsyncMutex<Router>>,
    ip: &str,
) -> Result<SettingEngine, SessionError> {
    let net = Arc::new(Net::new(Some(NetConfig {
        static_ips: vec![ip.to_owned()],
        ..Default::default()
    })));
    let nic = net.get_nic().map_err(vnet_error)?;
    router
        .lock()
        .await
        .add_net(Arc::clone(&nic))
        .await
        .map_err(vnet_error)?;
    nic.lock()
        .await
        .set_router(Arc::clone(router))
        .await
        .map_err(vnet_error)?;

    let mut settings = SettingEngine::default();
    settings.set_vnet(Some(net));
    settings.set_ice_timeouts(
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_millis(200)),
    );
    Ok(settings)
}

#[async_trait]
impl SignalingProvider for RtcHub {
    async fn join(
        &self,
        config: &RoomConfig,
        room_id: &str,
        events: RoomEventSender,
    ) -> Result<Arc<dyn Room>, SessionError> {
        if config.signaling.url.trim().is_empty() {
            return Err(SessionError::SignalingFailure("no signaling endpoint".into()));
        }
        let peer_id = random_id();
        let present: Vec<PeerId> = self
            .state()
            .rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.peer_id.clone()).collect())
            .unwrap_or_default();

        let mut pairs = Vec::with_capacity(present.len());
        for other in present {
            match self.connect_pair(&config.ice_servers).await {
                Ok((ours, theirs)) => pairs.push((other, ours, theirs)),
                Err(err) => {
                    for (_, ours, theirs) in pairs {
                        ours.close().await;
                        theirs.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let mut orphans = Vec::new();
        {
            let mut state = self.state();
            let members = state.rooms.entry(room_id.to_string()).or_default();
            let mut newcomer = Member {
                peer_id: peer_id.clone(),
                events,
                ends: HashMap::new(),
                published: None,
            };
            for (other, ours, theirs) in pairs {
                let Some(member) = members.iter_mut().find(|m| m.peer_id == other) else {
                    // left while the pair was being negotiated
                    orphans.push(ours);
                    orphans.push(theirs);
                    continue;
                };
                member.ends.insert(peer_id.clone(), Arc::new(theirs));
                newcomer.ends.insert(other.clone(), Arc::new(ours));
                member.events.send(RoomEvent::PeerJoined(peer_id.clone()));
                newcomer.events.send(RoomEvent::PeerJoined(other));
                if let Some(published) = &member.published {
                    newcomer.events.send(RoomEvent::PeerStream {
                        peer: member.peer_id.clone(),
                        stream: published.mirror(),
                    });
                }
            }
            members.push(newcomer);
            log::info!(
                "rtc hub: {} joined {room_id} ({} members)",
                short_id(&peer_id),
                members.len()
            );
        }
        for orphan in orphans {
            orphan.close().await;
        }

        let room: Arc<dyn Room> = Arc::new(RtcRoom {
            hub: self.clone(),
            room_id: room_id.to_string(),
            peer_id,
            left: AtomicBool::new(false),
        });
        Ok(room)
    }
}

pub struct RtcRoom {
    hub: RtcHub,
    room_id: String,
    peer_id: PeerId,
    left: AtomicBool,
}

impl RtcRoom {
    fn endpoint(&self, peer: &str) -> Option<Arc<Endpoint>> {
        self.hub
            .state()
            .rooms
            .get(&self.room_id)
            .and_then(|members| members.iter().find(|m| m.peer_id == self.peer_id))
            .and_then(|me| me.ends.get(peer).cloned())
    }
}

#[async_trait]
impl Room for RtcRoom {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn add_stream(&self, stream: &CaptureHandle) -> Result<(), SessionError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(SessionError::SignalingFailure("room already left".into()));
        }
        let mut state = self.hub.state();
        let members = state
            .rooms
            .get_mut(&self.room_id)
            .ok_or_else(|| SessionError::SignalingFailure("room is gone".into()))?;
        for member in members.iter().filter(|m| m.peer_id != self.peer_id) {
            member.events.send(RoomEvent::PeerStream {
                peer: self.peer_id.clone(),
                stream: stream.mirror(),
            });
        }
        if let Some(me) = members.iter_mut().find(|m| m.peer_id == self.peer_id) {
            me.published = Some(stream.mirror());
        }
        Ok(())
    }

    async fn ping(&self, peer: &str) -> Result<u64, SessionError> {
        let pinger = self
            .endpoint(peer)
            .and_then(|end| end.pinger())
            .ok_or_else(|| {
                SessionError::ProbeFailure(format!("no probe channel to {}", short_id(peer)))
            })?;
        pinger.ping().await
    }

    async fn leave(&self) -> Result<(), SessionError> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut closing = Vec::new();
        {
            let mut state = self.hub.state();
            if let Some(members) = state.rooms.get_mut(&self.room_id) {
                if let Some(pos) = members.iter().position(|m| m.peer_id == self.peer_id) {
                    let me = members.remove(pos);
                    closing.extend(me.ends.into_values());
                }
                for member in members.iter_mut() {
                    if let Some(end) = member.ends.remove(&self.peer_id) {
                        closing.push(end);
                    }
                    member.events.send(RoomEvent::PeerLeft(self.peer_id.clone()));
                }
                if members.is_empty() {
                    state.rooms.remove(&self.room_id);
                }
            }
        }
        log::info!("rtc hub: {} left {}", short_id(&self.peer_id), self.room_id);
        for end in closing {
            end.close().await;
        }
        Ok(())
    }

    fn peers(&self) -> HashMap<PeerId, Arc<dyn PeerLink>> {
        self.hub
            .state()
            .rooms
            .get(&self.room_id)
            .and_then(|members| members.iter().find(|m| m.peer_id == self.peer_id))
            .map(|me| {
                me.ends
                    .iter()
                    .map(|(id, end)| (id.clone(), end.link.clone() as Arc<dyn PeerLink>))
                    .collect()
            })
            .unwrap_or_default()
    }
}
