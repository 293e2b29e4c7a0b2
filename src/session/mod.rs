//! Connection test session.
//!
//! A [`Session`] owns one attempt to join a room: the local and remote
//! captures, the room membership, the probe timer, both level meters and the
//! report log. Collaborator callbacks, probe results and stop requests all
//! arrive on one queue and are applied by [`Session::handle`], so every state
//! change happens in one place.

mod probe;

use crate::config::AppConfig;
use crate::error::SessionError;
use crate::media::{CaptureHandle, MediaConstraints, MediaDevices};
use crate::meter::{AudioMeter, SpectrumAnalyser};
use crate::report::{Outcome, ReportLog, Step};
use crate::signaling::{Room, RoomConfig, RoomEvent, RoomEventSender, SignalingProvider};
use crate::types::{AudioLevels, IceConnectionState, LatencyGrade, PeerId};
use crate::utils::short_id;
use probe::ProbeTimer;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Joining,
    Joined,
    PeerConnected,
    PeerDisconnected,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Joining => "joining",
            Phase::Joined => "joined",
            Phase::PeerConnected => "peer_connected",
            Phase::PeerDisconnected => "peer_disconnected",
            Phase::Stopped => "stopped",
        }
    }

    /// Holding a room membership
    pub fn in_room(&self) -> bool {
        matches!(
            self,
            Phase::Joined | Phase::PeerConnected | Phase::PeerDisconnected
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Room(RoomEvent),
    ProbeCompleted {
        generation: u64,
        peer: PeerId,
        result: Result<u64, SessionError>,
    },
    /// Tagged with the run it was requested for
    StopRequested { run: u64 },
}

/// Cloneable way to ask a running session to stop
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
    active_run: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Queues a stop for the current run. Returns false when no run is in
    /// progress (before `start`, after a failed start, or once stopped).
    pub fn request_stop(&self) -> bool {
        let run = self.active_run.load(Ordering::SeqCst);
        if run == NO_RUN {
            return false;
        }
        self.tx.send(SessionEvent::StopRequested { run }).is_ok()
    }
}

const NO_RUN: u64 = 0;

/// Point-in-time view of a session for display
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub room_id: Option<String>,
    pub phase: Phase,
    pub local_peer_id: Option<PeerId>,
    pub peers: Vec<PeerId>,
    pub remote_peer: Option<PeerId>,
    pub ice_state: IceConnectionState,
    pub latency_ms: Option<u64>,
    pub latency_grade: Option<LatencyGrade>,
    pub levels: AudioLevels,
}

pub struct Session {
    config: AppConfig,
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingProvider>,

    phase: Phase,
    room_id: Option<String>,
    room: Option<Arc<dyn Room>>,
    peers: HashSet<PeerId>,
    ice_state: IceConnectionState,
    latency_ms: Option<u64>,

    local: Option<CaptureHandle>,
    remote: Option<(PeerId, CaptureHandle)>,
    stream_attached: bool,

    probe: Option<ProbeTimer>,
    probe_generation: u64,
    local_meter: AudioMeter,
    remote_meter: AudioMeter,

    report: ReportLog,
    run: u64,
    active_run: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Session {
    pub fn new(
        config: AppConfig,
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalingProvider>,
    ) -> Self {
        if let Err(err) = config.validate() {
            log::warn!("session configured with invalid settings: {err}");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let frame = config.frame_interval();
        Self {
            config,
            devices,
            signaling,
            phase: Phase::Idle,
            room_id: None,
            room: None,
            peers: HashSet::new(),
            ice_state: IceConnectionState::New,
            latency_ms: None,
            local: None,
            remote: None,
            stream_attached: false,
            probe: None,
            probe_generation: 0,
            local_meter: AudioMeter::new("local", frame),
            remote_meter: AudioMeter::new("remote", frame),
            report: ReportLog::new(),
            run: NO_RUN,
            active_run: Arc::new(AtomicU64::new(NO_RUN)),
            tx,
            rx,
        }
    }

    pub fn stop_handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.tx.clone(),
            active_run: self.active_run.clone(),
        }
    }

    /// Acquires media, joins `room_id` and starts sending the local stream.
    ///
    /// On a media or signaling failure the attempt is abandoned, anything
    /// acquired so far is released and the session is back in `Idle`.
    pub async fn start(&mut self, room_id: &str) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            return Err(SessionError::InvalidPhase(self.phase.as_str()));
        }
        let room_id = room_id.trim();
        if room_id.is_empty() {
            log::warn!("refusing to start with an empty room id");
            return Err(SessionError::InvalidRoomId);
        }

        // leftovers of an earlier attempt belong to no run
        let stale = std::iter::from_fn(|| self.rx.try_recv().ok()).count();
        if stale > 0 {
            log::debug!("discarded {stale} queued events before starting");
        }
        self.run += 1;
        self.active_run.store(self.run, Ordering::SeqCst);

        self.report = ReportLog::new();
        self.phase = Phase::Joining;
        self.room_id = Some(room_id.to_string());
        self.report
            .record(Step::TestStart, Outcome::Running, "starting connection test...");

        if let Err(err) = self.bring_up(room_id).await {
            log::error!("connection test aborted: {err}");
            self.active_run.store(NO_RUN, Ordering::SeqCst);
            self.room_id = None;
            self.phase = Phase::Idle;
            return Err(err);
        }
        Ok(())
    }

    async fn bring_up(&mut self, room_id: &str) -> Result<(), SessionError> {
        self.report.record(
            Step::MediaStream,
            Outcome::Running,
            "requesting camera and microphone access...",
        );
        let capture = match self.devices.acquire(MediaConstraints::default()).await {
            Ok(capture) => capture,
            Err(err) => {
                self.report.record(
                    Step::MediaStream,
                    Outcome::Failed,
                    format!("could not acquire media: {err}"),
                );
                return Err(err);
            }
        };
        self.report.record(
            Step::MediaStream,
            Outcome::Success,
            format!(
                "stream acquired (video: {}, audio: {})",
                capture.video_tracks().len(),
                capture.audio_tracks().len()
            ),
        );
        self.start_meter(&capture, true);

        self.report.record(
            Step::Signaling,
            Outcome::Running,
            format!("joining room \"{room_id}\" via {}...", self.config.signaling.url),
        );
        let events = RoomEventSender::new(self.tx.clone());
        let room_config = RoomConfig::from(&self.config);
        // `capture` drops, and so releases, if the join fails
        let room = match self.signaling.join(&room_config, room_id, events).await {
            Ok(room) => room,
            Err(err) => {
                self.local_meter.stop();
                self.report.record(
                    Step::Signaling,
                    Outcome::Failed,
                    format!("could not join room: {err}"),
                );
                return Err(err);
            }
        };
        self.report.record(
            Step::Signaling,
            Outcome::Success,
            format!(
                "joined room \"{room_id}\" as {}",
                short_id(&room.local_peer_id())
            ),
        );

        self.room = Some(room);
        self.local = Some(capture);
        self.phase = Phase::Joined;
        self.attach_local_stream().await;
        Ok(())
    }

    /// Sends the local capture into the room once; later calls are no-ops.
    async fn attach_local_stream(&mut self) {
        if self.stream_attached {
            return;
        }
        let (Some(room), Some(local)) = (self.room.clone(), self.local.as_ref()) else {
            return;
        };
        self.report
            .record(Step::StreamSend, Outcome::Running, "sending media stream...");
        match room.add_stream(local).await {
            Ok(()) => {
                self.stream_attached = true;
                self.report
                    .record(Step::StreamSend, Outcome::Success, "media stream is being sent");
            }
            Err(err) => self.report.record(
                Step::StreamSend,
                Outcome::Failed,
                format!("could not send stream: {err}"),
            ),
        }
    }

    fn start_meter(&mut self, capture: &CaptureHandle, local: bool) {
        let step = if local {
            Step::LocalAudioAnalysis
        } else {
            Step::RemoteAudioAnalysis
        };
        let Some(track) = capture.audio_tracks().into_iter().next() else {
            self.report
                .record(step, Outcome::Running, "no audio track to analyse");
            return;
        };
        let analyser = SpectrumAnalyser::new(track, self.config.fft_size);
        let meter = if local {
            &mut self.local_meter
        } else {
            &mut self.remote_meter
        };
        meter.start(analyser);
        self.report
            .record(step, Outcome::Success, "audio analyser initialised");
    }

    /// Waits for the next queued event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Handles one event; false if the queue is closed.
    pub async fn step(&mut self) -> bool {
        match self.rx.recv().await {
            Some(event) => {
                self.handle(event).await;
                true
            }
            None => false,
        }
    }

    /// Handles everything already queued without waiting for more.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle(event).await;
            handled += 1;
        }
        handled
    }

    /// Drives the session until it is stopped.
    pub async fn run(&mut self) {
        while self.phase != Phase::Stopped {
            if !self.step().await {
                break;
            }
        }
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        if self.phase == Phase::Stopped {
            log::debug!("session stopped, discarding {event:?}");
            return;
        }
        match event {
            SessionEvent::StopRequested { run } => {
                if run != self.run {
                    log::debug!("discarding stop request of run #{run}");
                    return;
                }
                if let Err(err) = self.stop().await {
                    log::error!("stop finished with errors: {err}");
                }
            }
            SessionEvent::ProbeCompleted {
                generation,
                peer,
                result,
            } => self.on_probe_result(generation, peer, result),
            SessionEvent::Room(event) => {
                if !self.phase.in_room() {
                    log::debug!("not in a room ({}), discarding {event:?}", self.phase);
                    return;
                }
                match event {
                    RoomEvent::PeerJoined(peer) => self.on_peer_joined(peer).await,
                    RoomEvent::PeerLeft(peer) => self.on_peer_left(peer),
                    RoomEvent::PeerStream { peer, stream } => self.on_peer_stream(peer, stream),
                    RoomEvent::IceStateChanged { peer, state } => {
                        self.on_ice_state(peer, state, true)
                    }
                }
            }
        }
    }

    async fn on_peer_joined(&mut self, peer: PeerId) {
        self.peers.insert(peer.clone());
        self.phase = Phase::PeerConnected;
        self.report.record(
            Step::PeerConnection,
            Outcome::Success,
            format!("peer connected: {}", short_id(&peer)),
        );

        self.monitor_connectivity(&peer);
        self.start_probe(peer);
        self.attach_local_stream().await;
    }

    /// Hooks every current link into the queue and records the joined
    /// peer's present state.
    fn monitor_connectivity(&mut self, joined: &str) {
        let Some(room) = self.room.clone() else {
            return;
        };
        let events = RoomEventSender::new(self.tx.clone());
        for (id, link) in room.peers() {
            link.on_ice_state_change(id.clone(), events.clone());
            if id == joined {
                self.on_ice_state(id, link.ice_state(), false);
            }
        }
    }

    fn start_probe(&mut self, peer: PeerId) {
        let Some(room) = self.room.clone() else {
            return;
        };
        if let Some(previous) = self.probe.take() {
            previous.cancel();
        }
        self.probe_generation += 1;
        self.probe = Some(ProbeTimer::spawn(
            room,
            peer,
            self.probe_generation,
            self.config.probe_interval(),
            self.tx.clone(),
        ));
    }

    fn on_peer_left(&mut self, peer: PeerId) {
        let known = self.peers.remove(&peer);
        let owned_remote = self.remote.as_ref().is_some_and(|(owner, _)| *owner == peer);
        if !known && !owned_remote {
            log::debug!("ignoring leave of unknown peer {}", short_id(&peer));
            return;
        }
        self.report.record(
            Step::PeerConnection,
            Outcome::Running,
            format!("peer disconnected: {}", short_id(&peer)),
        );

        if owned_remote {
            self.clear_remote();
        }
        // a peer only seen through its stream never counted as connected
        if !known {
            return;
        }

        if self.peers.is_empty() {
            if let Some(probe) = self.probe.take() {
                probe.cancel();
            }
            self.clear_remote();
            self.phase = Phase::PeerDisconnected;
        } else if self.probe.as_ref().is_some_and(|p| p.peer() == peer) {
            let next = self.peers.iter().min().cloned();
            if let Some(next) = next {
                self.start_probe(next);
            }
        }
    }

    fn clear_remote(&mut self) {
        self.remote_meter.stop();
        if let Some((_, remote)) = self.remote.take() {
            remote.release();
        }
    }

    fn on_peer_stream(&mut self, peer: PeerId, stream: CaptureHandle) {
        self.clear_remote();
        let audio = stream.audio_tracks();
        self.report.record(
            Step::StreamReceive,
            Outcome::Success,
            format!(
                "remote stream from {} (video: {}, audio: {})",
                short_id(&peer),
                stream.video_tracks().len(),
                audio.len()
            ),
        );

        match audio.first() {
            Some(track) => {
                self.start_meter(&stream, false);
                self.report.record(
                    Step::AudioTrack,
                    Outcome::Success,
                    format!("audio track active: {}", track.label()),
                );
            }
            None => {
                log::warn!("remote stream from {} carries no audio", short_id(&peer));
                self.report
                    .record(Step::AudioTrack, Outcome::Running, "no audio track found");
            }
        }
        self.remote = Some((peer, stream));
    }

    fn on_ice_state(&mut self, peer: PeerId, state: IceConnectionState, changed: bool) {
        if !changed && state == self.ice_state {
            return;
        }
        self.ice_state = state;
        let outcome = match state {
            s if s.is_established() => Outcome::Success,
            IceConnectionState::Failed => Outcome::Failed,
            _ => Outcome::Running,
        };
        self.report.record(
            Step::IceState,
            outcome,
            format!("ICE state: {state} ({})", short_id(&peer)),
        );
    }

    fn on_probe_result(&mut self, generation: u64, peer: PeerId, result: Result<u64, SessionError>) {
        if self.probe.as_ref().map(|p| p.generation()) != Some(generation) {
            log::debug!("discarding result of retired probe #{generation}");
            return;
        }
        match result {
            Ok(ms) => {
                self.latency_ms = Some(ms);
                let grade = LatencyGrade::classify(ms, &self.config.latency);
                let outcome = if grade == LatencyGrade::Good {
                    Outcome::Success
                } else {
                    Outcome::Running
                };
                self.report
                    .record(Step::Latency, outcome, format!("{ms}ms ({grade})"));
            }
            Err(err) => self.report.record(
                Step::Latency,
                Outcome::Failed,
                format!("measurement to {} failed: {err}", short_id(&peer)),
            ),
        }
    }

    /// Tears everything down. Idempotent; a no-op before `start`.
    ///
    /// Timers and meters are cancelled before anything is awaited. A failing
    /// step is logged and teardown carries on; the error is returned once
    /// every reference has been cleared.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        if matches!(self.phase, Phase::Idle | Phase::Stopped) {
            return Ok(());
        }

        if let Some(probe) = self.probe.take() {
            probe.cancel();
        }
        self.local_meter.close();
        self.remote_meter.close();

        let mut failures = Vec::new();
        if let Some(room) = self.room.take() {
            if let Err(err) = room.leave().await {
                log::error!("leaving room failed: {err}");
                failures.push(format!("leave room: {err}"));
            }
        }

        if let Some(local) = self.local.take() {
            local.release();
        }
        if let Some((_, remote)) = self.remote.take() {
            remote.release();
        }

        self.peers.clear();
        self.latency_ms = None;
        self.ice_state = IceConnectionState::New;
        self.stream_attached = false;
        self.active_run.store(NO_RUN, Ordering::SeqCst);
        self.phase = Phase::Stopped;

        if failures.is_empty() {
            self.report
                .record(Step::TestEnd, Outcome::Success, "all connections cleaned up");
            Ok(())
        } else {
            let detail = failures.join("; ");
            self.report.record(
                Step::TestEnd,
                Outcome::Failed,
                format!("error during cleanup: {detail}"),
            );
            Err(SessionError::TeardownFailure(detail))
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.room.as_ref().map(|r| r.local_peer_id())
    }

    pub fn peers(&self) -> &HashSet<PeerId> {
        &self.peers
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn levels(&self) -> AudioLevels {
        AudioLevels {
            local: self.local_meter.level(),
            remote: self.remote_meter.level(),
        }
    }

    pub fn report(&self) -> &ReportLog {
        &self.report
    }

    pub fn local_capture(&self) -> Option<&CaptureHandle> {
        self.local.as_ref()
    }

    pub fn remote_capture(&self) -> Option<&CaptureHandle> {
        self.remote.as_ref().map(|(_, handle)| handle)
    }

    pub fn remote_peer(&self) -> Option<&str> {
        self.remote.as_ref().map(|(peer, _)| peer.as_str())
    }

    pub fn is_stream_attached(&self) -> bool {
        self.stream_attached
    }

    /// Peer currently being probed, if the timer is live
    pub fn probed_peer(&self) -> Option<&str> {
        self.probe
            .as_ref()
            .filter(|p| p.is_active())
            .map(|p| p.peer())
    }

    pub fn meters_running(&self) -> (bool, bool) {
        (self.local_meter.is_running(), self.remote_meter.is_running())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut peers: Vec<PeerId> = self.peers.iter().cloned().collect();
        peers.sort();
        SessionSnapshot {
            room_id: self.room_id.clone(),
            phase: self.phase,
            local_peer_id: self.local_peer_id(),
            peers,
            remote_peer: self.remote_peer().map(str::to_string),
            ice_state: self.ice_state,
            latency_ms: self.latency_ms,
            latency_grade: self
                .latency_ms
                .map(|ms| LatencyGrade::classify(ms, &self.config.latency)),
            levels: self.levels(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping the fields already cancels timers and releases captures;
        // leaving the room has to be awaited, so hand it to the runtime.
        if let Some(room) = self.room.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = room.leave().await {
                        log::warn!("leave on drop failed: {err}");
                    }
                });
            }
        }
    }
}
