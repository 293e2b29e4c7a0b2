use super::{AudioSource, CaptureHandle, MediaConstraints, MediaDevices, MediaTrack, TrackKind};
use crate::error::SessionError;
use async_trait::async_trait;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sine tone generator
pub struct ToneSource {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
    position: AtomicU64,
}

impl ToneSource {
    pub fn new(frequency: f64, amplitude: f32, sample_rate: u32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            sample_rate,
            position: AtomicU64::new(0),
        }
    }

    /// Samples handed out so far; stays put while nobody reads the tone.
    pub fn samples_generated(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }
}

impl AudioSource for ToneSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn fill(&self, out: &mut [f32]) {
        let start = self.position.fetch_add(out.len() as u64, Ordering::Relaxed);
        let step = TAU * self.frequency / self.sample_rate as f64;
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = self.amplitude * ((start + i as u64) as f64 * step).sin() as f32;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Allow,
    Deny,
    NoDevice,
}

/// Camera and microphone stand-ins: a video track and a tone on the mic.
pub struct SyntheticDevices {
    grant: Grant,
    with_audio: bool,
    frequency: f64,
    amplitude: f32,
    acquired: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            grant: Grant::Allow,
            with_audio: true,
            frequency: 440.0,
            amplitude: 0.5,
            acquired: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The user refuses the permission prompt.
    pub fn denied() -> Self {
        Self {
            grant: Grant::Deny,
            ..Self::new()
        }
    }

    /// No camera or microphone present.
    pub fn unavailable() -> Self {
        Self {
            grant: Grant::NoDevice,
            ..Self::new()
        }
    }

    pub fn with_tone(mut self, frequency: f64, amplitude: f32) -> Self {
        self.frequency = frequency;
        self.amplitude = amplitude;
        self
    }

    /// Camera only; the microphone yields no track.
    pub fn without_audio(mut self) -> Self {
        self.with_audio = false;
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Total device tracks stopped so far.
    pub fn stopped_tracks(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    fn device_track(&self, track: MediaTrack) -> MediaTrack {
        let stopped = self.stopped.clone();
        track.with_stop_hook(move |t| {
            log::debug!("device track {} ({}) stopped", t.id(), t.label());
            stopped.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<CaptureHandle, SessionError> {
        match self.grant {
            Grant::Deny => {
                return Err(SessionError::PermissionDenied(
                    "camera and microphone access was refused".into(),
                ))
            }
            Grant::NoDevice => {
                return Err(SessionError::DeviceUnavailable(
                    "no camera or microphone found".into(),
                ))
            }
            Grant::Allow => {}
        }

        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(self.device_track(MediaTrack::new(TrackKind::Video, "Synthetic Camera")));
        }
        if constraints.audio && self.with_audio {
            let tone = Arc::new(ToneSource::new(self.frequency, self.amplitude, 48_000));
            tracks.push(self.device_track(MediaTrack::audio("Synthetic Microphone", tone)));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(CaptureHandle::new(tracks))
    }
}
