//! Round-trip probe over a data channel.
//!
//! Each side answers `{"type":"ping","id":N}` with `{"type":"pong","id":N}`;
//! the pinging side times the gap.

use crate::error::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeMessage {
    Ping { id: u64 },
    Pong { id: u64 },
}

impl ProbeMessage {
    pub fn decode(data: &Bytes) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    pub fn encode(&self) -> String {
        // plain enum of integers, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Text transport the prober writes to
#[async_trait]
pub trait ProbeChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), SessionError>;
}

#[async_trait]
impl ProbeChannel for RTCDataChannel {
    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        RTCDataChannel::send_text(self, text).await?;
        Ok(())
    }
}

pub struct Pinger {
    channel: Arc<dyn ProbeChannel>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Instant>>>,
    next_id: AtomicU64,
    limit: Duration,
}

impl Pinger {
    pub fn new(channel: Arc<dyn ProbeChannel>) -> Self {
        Self::with_timeout(channel, PROBE_TIMEOUT)
    }

    pub fn with_timeout(channel: Arc<dyn ProbeChannel>, limit: Duration) -> Self {
        Self {
            channel,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            limit,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Instant>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends one ping and waits for its pong; milliseconds on success.
    pub async fn ping(&self) -> Result<u64, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);

        let sent_at = Instant::now();
        if let Err(err) = self.channel.send_text(ProbeMessage::Ping { id }.encode()).await {
            self.pending().remove(&id);
            return Err(SessionError::ProbeFailure(format!("ping #{id} not sent: {err}")));
        }

        match timeout(self.limit, rx).await {
            Ok(Ok(answered_at)) => Ok(answered_at.duration_since(sent_at).as_millis() as u64),
            Ok(Err(_)) => Err(SessionError::ProbeFailure(format!("ping #{id} abandoned"))),
            Err(_) => {
                self.pending().remove(&id);
                Err(SessionError::ProbeFailure(format!(
                    "no pong for #{id} within {} ms",
                    self.limit.as_millis()
                )))
            }
        }
    }

    /// Feeds one inbound message; pings are answered, pongs complete a wait.
    pub async fn handle_message(&self, data: &Bytes) -> Result<(), SessionError> {
        match ProbeMessage::decode(data) {
            Some(ProbeMessage::Ping { id }) => {
                self.channel
                    .send_text(ProbeMessage::Pong { id }.encode())
                    .await
            }
            Some(ProbeMessage::Pong { id }) => {
                match self.pending().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(Instant::now());
                    }
                    None => log::debug!("late or unknown pong #{id}"),
                }
                Ok(())
            }
            None => {
                log::debug!("ignoring non-probe message ({} bytes)", data.len());
                Ok(())
            }
        }
    }

    /// Routes a data channel's text messages into this pinger.
    pub fn attach(self: &Arc<Self>, dc: &Arc<RTCDataChannel>) {
        let pinger = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let pinger = pinger.clone();
            Box::pin(async move {
                if !msg.is_string {
                    return;
                }
                if let Some(pinger) = pinger.upgrade() {
                    if let Err(err) = pinger.handle_message(&msg.data).await {
                        log::warn!("probe reply failed: {err}");
                    }
                }
            })
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    /// Delivers everything sent into the other end's pinger after `delay`.
    struct Loopback {
        delay: Duration,
        far: Mutex<Weak<Pinger>>,
    }

    #[async_trait]
    impl ProbeChannel for Loopback {
        async fn send_text(&self, text: String) -> Result<(), SessionError> {
            let far = self.far.lock().unwrap().upgrade();
            let Some(far) = far else {
                return Err(SessionError::ProbeFailure("channel closed".into()));
            };
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = far.handle_message(&Bytes::from(text)).await;
            });
            Ok(())
        }
    }

    fn pair(delay: Duration) -> (Arc<Pinger>, Arc<Pinger>) {
        let a_out = Arc::new(Loopback { delay, far: Mutex::new(Weak::new()) });
        let b_out = Arc::new(Loopback { delay, far: Mutex::new(Weak::new()) });
        let a = Arc::new(Pinger::new(a_out.clone()));
        let b = Arc::new(Pinger::new(b_out.clone()));
        *a_out.far.lock().unwrap() = Arc::downgrade(&b);
        *b_out.far.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    #[test]
    fn wire_format() {
        assert_eq!(ProbeMessage::Ping { id: 7 }.encode(), r#"{"type":"ping","id":7}"#);
        assert_eq!(
            ProbeMessage::decode(&Bytes::from_static(br#"{"type":"pong","id":9}"#)),
            Some(ProbeMessage::Pong { id: 9 })
        );
        assert_eq!(ProbeMessage::decode(&Bytes::from_static(b"hello")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn measures_round_trip() {
        let (a, _b) = pair(Duration::from_millis(20));
        assert_eq!(a.ping().await.unwrap(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_answer() {
        let (a, b) = pair(Duration::from_millis(20));
        drop(b);
        let err = a.ping().await.unwrap_err();
        assert!(matches!(err, SessionError::ProbeFailure(_)));
        assert!(a.pending().is_empty());
    }
}
