//! Contract of the signaling/transport collaborator.
//!
//! A provider joins a named room and hands back a [`Room`]. Everything the
//! room has to report afterwards (peers coming and going, remote streams,
//! connectivity changes) is pushed as a [`RoomEvent`] into the session's
//! event queue through a [`RoomEventSender`].

pub mod memory;

use crate::config::{AppConfig, SignalingConfig};
use crate::error::SessionError;
use crate::media::CaptureHandle;
use crate::session::SessionEvent;
use crate::types::{IceConnectionState, PeerId, ServerConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::MemoryHub;

/// What a provider needs to join: endpoint, credential and ICE servers
#[derive(Debug, Clone, PartialEq)]
pub struct RoomConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<ServerConfig>,
}

impl From<&AppConfig> for RoomConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            signaling: config.signaling.clone(),
            ice_servers: config.normalized_ice_servers(),
        }
    }
}

#[derive(Debug)]
pub enum RoomEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    PeerStream { peer: PeerId, stream: CaptureHandle },
    IceStateChanged { peer: PeerId, state: IceConnectionState },
}

/// Feeds room events into a session's queue
#[derive(Debug, Clone)]
pub struct RoomEventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl RoomEventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// A sender with its own queue, for driving a room outside a session.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the receiving session is gone.
    pub fn send(&self, event: RoomEvent) -> bool {
        self.tx.send(SessionEvent::Room(event)).is_ok()
    }
}

#[async_trait]
pub trait SignalingProvider: Send + Sync {
    async fn join(
        &self,
        config: &RoomConfig,
        room_id: &str,
        events: RoomEventSender,
    ) -> Result<Arc<dyn Room>, SessionError>;
}

/// One membership in a signaling room
#[async_trait]
pub trait Room: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    /// Starts outbound delivery of a local capture.
    async fn add_stream(&self, stream: &CaptureHandle) -> Result<(), SessionError>;

    /// Round trip to `peer`, in milliseconds.
    async fn ping(&self, peer: &str) -> Result<u64, SessionError>;

    /// Releases every signaling resource of this membership.
    async fn leave(&self) -> Result<(), SessionError>;

    fn peers(&self) -> HashMap<PeerId, Arc<dyn PeerLink>>;
}

/// The underlying connection to one remote peer
pub trait PeerLink: Send + Sync {
    fn ice_state(&self) -> IceConnectionState;

    /// Reports later state changes of this link as `IceStateChanged` for
    /// `peer`. Replaces any earlier registration.
    fn on_ice_state_change(&self, peer: PeerId, events: RoomEventSender);
}
