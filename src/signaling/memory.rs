use super::{PeerLink, Room, RoomConfig, RoomEvent, RoomEventSender, SignalingProvider};
use crate::error::SessionError;
use crate::media::CaptureHandle;
use crate::types::{IceConnectionState, PeerId};
use crate::utils::{lock, random_id, short_id};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// In-process signaling: every room lives in one shared map, and streams are
/// "delivered" by mirroring the sender's tracks for each receiver.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Vec<Member>>,
    latency: Duration,
    fail_join: bool,
    fail_ping: bool,
    fail_leave: bool,
}

struct Member {
    peer_id: PeerId,
    events: RoomEventSender,
    // this member's view of every other peer
    links: HashMap<PeerId, Arc<MemoryPeerLink>>,
    published: Option<CaptureHandle>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        lock(&self.inner)
    }

    /// Round trip reported by every ping.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn fail_joins(&self, fail: bool) {
        self.state().fail_join = fail;
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state().fail_ping = fail;
    }

    pub fn fail_leaves(&self, fail: bool) {
        self.state().fail_leave = fail;
    }

    pub fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.state()
            .rooms
            .get(room_id)
            .map(|members| members.iter().map(|m| m.peer_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Changes the state of `viewer`'s link to `remote`, as a transport would.
    pub fn set_ice_state(
        &self,
        room_id: &str,
        viewer: &str,
        remote: &str,
        state: IceConnectionState,
    ) -> bool {
        let link = self
            .state()
            .rooms
            .get(room_id)
            .and_then(|members| members.iter().find(|m| m.peer_id == viewer))
            .and_then(|m| m.links.get(remote).cloned());
        match link {
            Some(link) => {
                link.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Simulates a peer vanishing without leaving (e.g. a closed tab).
    pub fn drop_peer(&self, room_id: &str, peer_id: &str) -> bool {
        let mut state = self.state();
        state.remove_member(room_id, peer_id)
    }
}

impl HubState {
    fn remove_member(&mut self, room_id: &str, peer_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(pos) = members.iter().position(|m| m.peer_id == peer_id) else {
            return false;
        };
        let gone = members.remove(pos);
        for member in members.iter_mut() {
            if let Some(link) = member.links.remove(peer_id) {
                link.set_state(IceConnectionState::Closed);
            }
            member.events.send(RoomEvent::PeerLeft(peer_id.to_string()));
        }
        if members.is_empty() {
            self.rooms.remove(room_id);
        }
        log::debug!("hub: {} left {room_id}", short_id(&gone.peer_id));
        true
    }
}

#[async_trait]
impl SignalingProvider for MemoryHub {
    async fn join(
        &self,
        config: &RoomConfig,
        room_id: &str,
        events: RoomEventSender,
    ) -> Result<Arc<dyn Room>, SessionError> {
        let mut state = self.state();
        if state.fail_join {
            return Err(SessionError::SignalingFailure(
                "realtime channel refused the subscription".into(),
            ));
        }
        if config.signaling.url.trim().is_empty() {
            return Err(SessionError::SignalingFailure("no signaling endpoint".into()));
        }

        let peer_id = random_id();
        let members = state.rooms.entry(room_id.to_string()).or_default();
        let mut newcomer = Member {
            peer_id: peer_id.clone(),
            events,
            links: HashMap::new(),
            published: None,
        };

        for member in members.iter_mut() {
            let theirs = Arc::new(MemoryPeerLink::new());
            let ours = Arc::new(MemoryPeerLink::new());
            member.links.insert(peer_id.clone(), theirs.clone());
            newcomer.links.insert(member.peer_id.clone(), ours.clone());

            member.events.send(RoomEvent::PeerJoined(peer_id.clone()));
            newcomer
                .events
                .send(RoomEvent::PeerJoined(member.peer_id.clone()));
            if let Some(published) = &member.published {
                newcomer.events.send(RoomEvent::PeerStream {
                    peer: member.peer_id.clone(),
                    stream: published.mirror(),
                });
            }

            // candidates are exchanged instantly in-process
            theirs.set_state(IceConnectionState::Connected);
            ours.set_state(IceConnectionState::Connected);
        }
        members.push(newcomer);
        log::debug!(
            "hub: {} joined {room_id} ({} members)",
            short_id(&peer_id),
            members.len()
        );

        let room: Arc<dyn Room> = Arc::new(MemoryRoom {
            hub: self.clone(),
            room_id: room_id.to_string(),
            peer_id,
            left: AtomicBool::new(false),
        });
        Ok(room)
    }
}

pub struct MemoryRoom {
    hub: MemoryHub,
    room_id: String,
    peer_id: PeerId,
    left: AtomicBool,
}

impl MemoryRoom {
    fn ensure_joined(&self) -> Result<(), SessionError> {
        if self.left.load(Ordering::SeqCst) {
            return Err(SessionError::SignalingFailure(format!(
                "already left room {}",
                self.room_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Room for MemoryRoom {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn add_stream(&self, stream: &CaptureHandle) -> Result<(), SessionError> {
        self.ensure_joined()?;
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
        self.ensure_joined()?;
        let latency = {
            let state = self.hub.state();
            if state.fail_ping {
                return Err(SessionError::ProbeFailure(format!(
                    "no pong from {}",
                    short_id(peer)
                )));
            }
            let present = state
                .rooms
                .get(&self.room_id)
                .is_some_and(|members| members.iter().any(|m| m.peer_id == peer));
            if !present {
                return Err(SessionError::ProbeFailure(format!(
                    "peer {} is not in the room",
                    short_id(peer)
                )));
            }
            state.latency
        };
        tokio::time::sleep(latency).await;
        Ok(latency.as_millis() as u64)
    }

    async fn leave(&self) -> Result<(), SessionError> {
        let mut state = self.hub.state();
        if state.fail_leave {
            return Err(SessionError::SignalingFailure(
                "channel unsubscribe was rejected".into(),
            ));
        }
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        state.remove_member(&self.room_id, &self.peer_id);
        Ok(())
    }

    fn peers(&self) -> HashMap<PeerId, Arc<dyn PeerLink>> {
        self.hub
            .state()
            .rooms
            .get(&self.room_id)
            .and_then(|members| members.iter().find(|m| m.peer_id == self.peer_id))
            .map(|me| {
                me.links
                    .iter()
                    .map(|(id, link)| (id.clone(), link.clone() as Arc<dyn PeerLink>))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct MemoryPeerLink {
    state: Mutex<IceConnectionState>,
    handler: Mutex<Option<(PeerId, RoomEventSender)>>,
}

impl MemoryPeerLink {
    fn new() -> Self {
        Self {
            state: Mutex::new(IceConnectionState::Checking),
            handler: Mutex::new(None),
        }
    }

    fn set_state(&self, next: IceConnectionState) {
        {
            let mut state = lock(&self.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        if let Some((peer, events)) = lock(&self.handler).as_ref() {
            events.send(RoomEvent::IceStateChanged {
                peer: peer.clone(),
                state: next,
            });
        }
    }
}

impl PeerLink for MemoryPeerLink {
    fn ice_state(&self) -> IceConnectionState {
        *lock(&self.state)
    }

    fn on_ice_state_change(&self, peer: PeerId, events: RoomEventSender) {
        *lock(&self.handler) = Some((peer, events));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::media::{MediaTrack, ToneSource, TrackKind};
    use crate::session::SessionEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config() -> RoomConfig {
        RoomConfig::from(&AppConfig::default())
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        while let Ok(SessionEvent::Room(ev)) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn members_see_each_other() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = RoomEventSender::channel();
        let (tx_b, mut rx_b) = RoomEventSender::channel();
        let a = hub.join(&config(), "abc123", tx_a).await.unwrap();
        let b = hub.join(&config(), "abc123", tx_b).await.unwrap();

        let seen_by_a = drain(&mut rx_a);
        assert!(matches!(&seen_by_a[..], [RoomEvent::PeerJoined(p)] if *p == b.local_peer_id()));
        let seen_by_b = drain(&mut rx_b);
        assert!(matches!(&seen_by_b[..], [RoomEvent::PeerJoined(p)] if *p == a.local_peer_id()));

        let links = a.peers();
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[&b.local_peer_id()].ice_state(),
            IceConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn streams_reach_late_joiners() {
        let hub = MemoryHub::new();
        let (tx_a, _rx_a) = RoomEventSender::channel();
        let a = hub.join(&config(), "r", tx_a).await.unwrap();
        let tone = Arc::new(ToneSource::new(440.0, 0.5, 48_000));
        let local = CaptureHandle::new(vec![
            MediaTrack::new(TrackKind::Video, "cam"),
            MediaTrack::audio("mic", tone),
        ]);
        a.add_stream(&local).await.unwrap();

        let (tx_b, mut rx_b) = RoomEventSender::channel();
        hub.join(&config(), "r", tx_b).await.unwrap();
        let events = drain(&mut rx_b);
        let stream = events
            .into_iter()
            .find_map(|ev| match ev {
                RoomEvent::PeerStream { stream, .. } => Some(stream),
                _ => None,
            })
            .unwrap();
        assert_eq!(stream.audio_tracks()[0].label(), "mic");
        drop(stream);
        assert!(!local.audio_tracks()[0].is_stopped());
    }

    #[tokio::test]
    async fn leave_notifies_and_is_idempotent() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = RoomEventSender::channel();
        let (tx_b, _rx_b) = RoomEventSender::channel();
        let a = hub.join(&config(), "r", tx_a).await.unwrap();
        let b = hub.join(&config(), "r", tx_b).await.unwrap();
        let link = a.peers().remove(&b.local_peer_id()).unwrap();
        link.on_ice_state_change(b.local_peer_id(), RoomEventSender::channel().0);
        drain(&mut rx_a);

        b.leave().await.unwrap();
        b.leave().await.unwrap();
        let events = drain(&mut rx_a);
        assert!(matches!(&events[..], [RoomEvent::PeerLeft(p)] if *p == b.local_peer_id()));
        assert_eq!(hub.members("r"), vec![a.local_peer_id()]);
        assert!(b.ping(&a.local_peer_id()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reports_latency() {
        let hub = MemoryHub::new();
        hub.set_latency(Duration::from_millis(42));
        let a = hub
            .join(&config(), "r", RoomEventSender::channel().0)
            .await
            .unwrap();
        let b = hub
            .join(&config(), "r", RoomEventSender::channel().0)
            .await
            .unwrap();
        assert_eq!(a.ping(&b.local_peer_id()).await.unwrap(), 42);
        assert!(matches!(
            a.ping("nobody").await,
            Err(SessionError::ProbeFailure(_))
        ));
        hub.fail_pings(true);
        assert!(matches!(
            a.ping(&b.local_peer_id()).await,
            Err(SessionError::ProbeFailure(_))
        ));
    }

    #[tokio::test]
    async fn ice_changes_reach_registered_handler() {
        let hub = MemoryHub::new();
        let (tx_a, mut rx_a) = RoomEventSender::channel();
        let a = hub.join(&config(), "r", tx_a.clone()).await.unwrap();
        let b = hub
            .join(&config(), "r", RoomEventSender::channel().0)
            .await
            .unwrap();
        drain(&mut rx_a);
        for (peer, link) in a.peers() {
            link.on_ice_state_change(peer, tx_a.clone());
        }
        assert!(hub.set_ice_state(
            "r",
            &a.local_peer_id(),
            &b.local_peer_id(),
            IceConnectionState::Failed
        ));
        let events = drain(&mut rx_a);
        assert!(matches!(
            &events[..],
            [RoomEvent::IceStateChanged { state: IceConnectionState::Failed, .. }]
        ));
    }

    #[tokio::test]
    async fn join_failures_are_signaling_errors() {
        let hub = MemoryHub::new();
        hub.fail_joins(true);
        let err = hub
            .join(&config(), "r", RoomEventSender::channel().0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::SignalingFailure(_)));
        assert!(hub.members("r").is_empty());
    }
}
