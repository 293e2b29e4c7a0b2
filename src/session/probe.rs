use super::SessionEvent;
use crate::signaling::Room;
use crate::types::PeerId;
use crate::utils::short_id;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Periodic round-trip measurement against one peer.
///
/// The first ping goes out one full interval after spawning. Results are
/// tagged with `generation` so the session can drop answers that belong to a
/// timer it has already replaced.
pub(crate) struct ProbeTimer {
    peer: PeerId,
    generation: u64,
    task: JoinHandle<()>,
}

impl ProbeTimer {
    pub(crate) fn spawn(
        room: Arc<dyn Room>,
        peer: PeerId,
        generation: u64,
        every: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let target = peer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = room.ping(&target).await;
                let done = SessionEvent::ProbeCompleted {
                    generation,
                    peer: target.clone(),
                    result,
                };
                if events.send(done).is_err() {
                    break;
                }
            }
        });
        log::debug!(
            "probe #{generation} started for {} every {} ms",
            short_id(&peer),
            every.as_millis()
        );
        Self {
            peer,
            generation,
            task,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub(crate) fn cancel(self) {
        log::debug!("probe #{} cancelled", self.generation);
        // Drop aborts the task
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
