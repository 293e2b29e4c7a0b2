#![allow(dead_code)]

use async_trait::async_trait;
use salang_lib::error::SessionError;
use salang_lib::media::{
    CaptureHandle, MediaConstraints, MediaDevices, MediaTrack, ToneSource, TrackKind,
};
use salang_lib::signaling::{
    PeerLink, Room, RoomConfig, RoomEvent, RoomEventSender, SignalingProvider,
};
use salang_lib::types::{IceConnectionState, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Signaling double whose events are pushed by the test itself.
#[derive(Default)]
pub struct Scripted {
    events: Mutex<Option<RoomEventSender>>,
    pub room: Arc<ScriptedRoom>,
    pub fail_join: AtomicBool,
    pub joins: AtomicUsize,
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emit(&self, event: RoomEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("session has not joined yet")
            .send(event);
    }

    /// Registers a link for `peer` and announces it.
    pub fn peer_joins(&self, peer: &str) -> Arc<ScriptedLink> {
        let link = Arc::new(ScriptedLink::default());
        self.room
            .links
            .lock()
            .unwrap()
            .insert(peer.to_string(), link.clone());
        self.emit(RoomEvent::PeerJoined(peer.to_string()));
        link
    }

    pub fn peer_leaves(&self, peer: &str) {
        self.room.links.lock().unwrap().remove(peer);
        self.emit(RoomEvent::PeerLeft(peer.to_string()));
    }

    pub fn peer_streams(&self, peer: &str, stream: CaptureHandle) {
        self.emit(RoomEvent::PeerStream {
            peer: peer.to_string(),
            stream,
        });
    }
}

#[async_trait]
impl SignalingProvider for Scripted {
    async fn join(
        &self,
        _config: &RoomConfig,
        _room_id: &str,
        events: RoomEventSender,
    ) -> Result<Arc<dyn Room>, SessionError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(SessionError::SignalingFailure("scripted refusal".into()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(self.room.clone() as Arc<dyn Room>)
    }
}

pub struct ScriptedRoom {
    pub pings: Mutex<Vec<PeerId>>,
    pub leaves: AtomicUsize,
    pub streams_added: AtomicUsize,
    pub ping_ms: Mutex<Result<u64, String>>,
    pub fail_leave: AtomicBool,
    pub links: Mutex<HashMap<PeerId, Arc<ScriptedLink>>>,
    /// How long `leave` stays pending
    pub leave_hold: Mutex<Duration>,
    /// Pings recorded when `leave` was entered and when it returned
    pub pings_during_leave: Mutex<Vec<(usize, usize)>>,
}

impl Default for ScriptedRoom {
    fn default() -> Self {
        Self {
            pings: Mutex::new(Vec::new()),
            leaves: AtomicUsize::new(0),
            streams_added: AtomicUsize::new(0),
            ping_ms: Mutex::new(Ok(12)),
            fail_leave: AtomicBool::new(false),
            links: Mutex::new(HashMap::new()),
            leave_hold: Mutex::new(Duration::ZERO),
            pings_during_leave: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedRoom {
    pub fn ping_count(&self) -> usize {
        self.pings.lock().unwrap().len()
    }
}

#[async_trait]
impl Room for ScriptedRoom {
    fn local_peer_id(&self) -> PeerId {
        "self-0000".into()
    }

    async fn add_stream(&self, _stream: &CaptureHandle) -> Result<(), SessionError> {
        self.streams_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, peer: &str) -> Result<u64, SessionError> {
        self.pings.lock().unwrap().push(peer.to_string());
        self.ping_ms
            .lock()
            .unwrap()
            .clone()
            .map_err(SessionError::ProbeFailure)
    }

    async fn leave(&self) -> Result<(), SessionError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        let entered = self.ping_count();
        let hold = *self.leave_hold.lock().unwrap();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        self.pings_during_leave
            .lock()
            .unwrap()
            .push((entered, self.ping_count()));
        if self.fail_leave.load(Ordering::SeqCst) {
            return Err(SessionError::SignalingFailure("leave rejected".into()));
        }
        Ok(())
    }

    fn peers(&self) -> HashMap<PeerId, Arc<dyn PeerLink>> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .map(|(id, link)| (id.clone(), link.clone() as Arc<dyn PeerLink>))
            .collect()
    }
}

pub struct ScriptedLink {
    pub state: Mutex<IceConnectionState>,
    handler: Mutex<Option<(PeerId, RoomEventSender)>>,
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self {
            state: Mutex::new(IceConnectionState::Checking),
            handler: Mutex::new(None),
        }
    }
}

impl ScriptedLink {
    pub fn change(&self, state: IceConnectionState) {
        *self.state.lock().unwrap() = state;
        if let Some((peer, events)) = self.handler.lock().unwrap().as_ref() {
            events.send(RoomEvent::IceStateChanged {
                peer: peer.clone(),
                state,
            });
        }
    }

    pub fn is_monitored(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }
}

impl PeerLink for ScriptedLink {
    fn ice_state(&self) -> IceConnectionState {
        *self.state.lock().unwrap()
    }

    fn on_ice_state_change(&self, peer: PeerId, events: RoomEventSender) {
        *self.handler.lock().unwrap() = Some((peer, events));
    }
}

/// A remote capture with a camera track and, optionally, a loud microphone.
pub fn remote_stream(with_audio: bool) -> CaptureHandle {
    let mut tracks = vec![MediaTrack::new(TrackKind::Video, "remote cam")];
    if with_audio {
        let tone = Arc::new(ToneSource::new(440.0, 0.8, 48_000));
        tracks.push(MediaTrack::audio("remote mic", tone));
    }
    CaptureHandle::new(tracks)
}

/// Devices whose microphone tone stays observable from the test.
pub struct ToneDevices {
    pub tone: Arc<ToneSource>,
}

impl ToneDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tone: Arc::new(ToneSource::new(440.0, 0.5, 48_000)),
        })
    }
}

#[async_trait]
impl MediaDevices for ToneDevices {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<CaptureHandle, SessionError> {
        Ok(CaptureHandle::new(vec![
            MediaTrack::new(TrackKind::Video, "local cam"),
            MediaTrack::audio("local mic", self.tone.clone()),
        ]))
    }
}

/// Like [`remote_stream`] with audio, but hands back the tone as well.
pub fn remote_stream_with_tone() -> (CaptureHandle, Arc<ToneSource>) {
    let tone = Arc::new(ToneSource::new(660.0, 0.8, 48_000));
    let stream = CaptureHandle::new(vec![
        MediaTrack::new(TrackKind::Video, "remote cam"),
        MediaTrack::audio("remote mic", tone.clone()),
    ]);
    (stream, tone)
}
