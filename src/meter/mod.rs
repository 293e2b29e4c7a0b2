//! Audio level metering.
//!
//! Each [`AudioMeter`] owns one frame task that pulls spectrum data out of an
//! [`Analyser`] on a fixed cadence and publishes a loudness value in [0,100].

pub mod analyser;

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use analyser::SpectrumAnalyser;

/// Source of byte-scaled frequency magnitudes (0..=255 per bin)
pub trait Analyser: Send {
    fn frequency_bin_count(&self) -> usize;
    fn frequency_data(&mut self, out: &mut [u8]);
}

/// Mean bin magnitude scaled to [0,100]. An empty array is silence.
pub fn level_from_frequency_data(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: u64 = data.iter().map(|&b| b as u64).sum();
    let average = sum as f64 / data.len() as f64;
    (average / 255.0 * 100.0).clamp(0.0, 100.0)
}

pub struct AudioMeter {
    name: &'static str,
    frame: Duration,
    task: Option<JoinHandle<()>>,
    level_tx: watch::Sender<f64>,
    closed: bool,
}

impl AudioMeter {
    pub fn new(name: &'static str, frame: Duration) -> Self {
        let (level_tx, _) = watch::channel(0.0);
        Self {
            name,
            frame,
            task: None,
            level_tx,
            closed: false,
        }
    }

    /// Starts sampling `analyser`, replacing whatever was being sampled.
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self, mut analyser: impl Analyser + 'static) {
        if self.closed {
            log::warn!("{} meter is closed, not starting", self.name);
            return;
        }
        self.cancel();

        let frame = self.frame;
        let tx = self.level_tx.clone();
        let name = self.name;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut bins = vec![0u8; analyser.frequency_bin_count()];
            loop {
                ticker.tick().await;
                analyser.frequency_data(&mut bins);
                tx.send_replace(level_from_frequency_data(&bins));
            }
        }));
        log::debug!("{name} meter started ({} ms frames)", frame.as_millis());
    }

    /// Stops sampling at once and drops the level back to zero.
    pub fn stop(&mut self) {
        if self.cancel() {
            log::debug!("{} meter stopped", self.name);
        }
        self.level_tx.send_replace(0.0);
    }

    /// Stops for good. Closing twice is accepted and reported as `false`.
    pub fn close(&mut self) -> bool {
        if self.closed {
            log::debug!("{} meter already closed", self.name);
            return false;
        }
        self.stop();
        self.closed = true;
        true
    }

    fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn level(&self) -> f64 {
        *self.level_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.level_tx.subscribe()
    }
}

impl Drop for AudioMeter {
    fn drop(&mut self) {
        self.cancel();
    }
}
