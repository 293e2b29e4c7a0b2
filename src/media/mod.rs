//! Local and remote capture handles.
//!
//! A [`CaptureHandle`] owns its tracks. Releasing it stops every track exactly
//! once; dropping it releases it, so a handle acquired on a path that later
//! fails is never leaked.

pub mod synthetic;

use crate::error::SessionError;
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use synthetic::{SyntheticDevices, ToneSource};

/// PCM provider behind an audio track
pub trait AudioSource: Send + Sync {
    fn sample_rate(&self) -> u32;
    /// Fills `out` with the next samples in [-1.0, 1.0].
    fn fill(&self, out: &mut [f32]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

type StopHook = Box<dyn Fn(&MediaTrack) + Send + Sync>;

pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    source: Option<Arc<dyn AudioSource>>,
    stopped: AtomicBool,
    on_stop: Option<StopHook>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: random_id(),
            kind,
            label: label.into(),
            source: None,
            stopped: AtomicBool::new(false),
            on_stop: None,
        }
    }

    pub fn audio(label: impl Into<String>, source: Arc<dyn AudioSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::new(TrackKind::Audio, label)
        }
    }

    /// Runs `hook` when the track is stopped; the device side of a track.
    pub fn with_stop_hook(mut self, hook: impl Fn(&MediaTrack) + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(hook) = &self.on_stop {
            hook(self);
        }
        true
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.source.as_ref().map(|s| s.sample_rate())
    }

    /// Reads the next block of samples. A stopped track, or a track without
    /// a source, reads as silence and the source is left untouched.
    pub fn read_samples(&self, out: &mut [f32]) -> bool {
        match &self.source {
            Some(source) if !self.is_stopped() => {
                source.fill(out);
                true
            }
            _ => {
                out.fill(0.0);
                false
            }
        }
    }

    /// A receiver-side copy: same label and audio, independent lifetime.
    pub fn mirror(&self) -> MediaTrack {
        MediaTrack {
            source: self.source.clone(),
            ..MediaTrack::new(self.kind, self.label.clone())
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
pub struct CaptureHandle {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
    released: AtomicBool,
}

impl CaptureHandle {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: random_id(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stops every track once. Later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        log::debug!("released capture {} ({} tracks stopped)", self.id, stopped);
    }

    /// Copy handed to the receiving side of a room.
    pub fn mirror(&self) -> CaptureHandle {
        CaptureHandle::new(self.tracks.iter().map(|t| t.mirror()).collect())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Host camera/microphone access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Fails with `PermissionDenied` or `DeviceUnavailable`.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<CaptureHandle, SessionError>;
}
