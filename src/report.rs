//! Append-only audit trail of a connection test run.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Running,
}

impl Outcome {
    fn icon(&self) -> &'static str {
        match self {
            Outcome::Success => "✅",
            Outcome::Failed => "❌",
            Outcome::Running => "⏳",
        }
    }
}

/// Named steps of a test run, in the order they normally appear
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    TestStart,
    IcePreflight,
    MediaStream,
    LocalAudioAnalysis,
    Signaling,
    StreamSend,
    PeerConnection,
    IceState,
    StreamReceive,
    RemoteAudioAnalysis,
    AudioTrack,
    Latency,
    TestEnd,
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::TestStart => "test start",
            Step::IcePreflight => "ICE preflight",
            Step::MediaStream => "media stream",
            Step::LocalAudioAnalysis => "local audio analysis",
            Step::Signaling => "signaling",
            Step::StreamSend => "stream send",
            Step::PeerConnection => "peer connection",
            Step::IceState => "ICE state",
            Step::StreamReceive => "stream receive",
            Step::RemoteAudioAnalysis => "remote audio analysis",
            Step::AudioTrack => "audio track",
            Step::Latency => "network latency",
            Step::TestEnd => "test end",
        }
    }

    /// Steps that only happen after media acquisition succeeded
    pub fn is_after_media(&self) -> bool {
        !matches!(
            self,
            Step::TestStart | Step::IcePreflight | Step::MediaStream | Step::TestEnd
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub timestamp: DateTime<Local>,
    pub step: Step,
    pub outcome: Outcome,
    pub message: String,
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.outcome.icon(),
            self.step,
            self.message
        )
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReportLog {
    entries: Vec<ReportEntry>,
}

impl ReportLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    /// Timestamps the entry with the local wall clock and appends it.
    pub fn record(&mut self, step: Step, outcome: Outcome, message: impl Into<String>) {
        let message = message.into();
        match outcome {
            Outcome::Failed => log::warn!("{step}: {message}"),
            _ => log::debug!("{step}: {message}"),
        }
        self.append(ReportEntry {
            timestamp: Local::now(),
            step,
            outcome,
            message,
        });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&ReportEntry> {
        self.entries.last()
    }

    pub fn for_step(&self, step: Step) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(move |e| e.step == step)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries)
    }
}

impl fmt::Display for ReportLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
