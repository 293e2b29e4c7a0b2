use crate::config::LatencyThresholds;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier the signaling collaborator assigns to a peer
pub type PeerId = String;

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Transport-level connectivity label reported by a peer connection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LatencyGrade {
    Good,
    Fair,
    Slow,
}

impl LatencyGrade {
    pub fn classify(ms: u64, thresholds: &LatencyThresholds) -> Self {
        if ms < thresholds.good_below_ms {
            LatencyGrade::Good
        } else if ms < thresholds.fair_below_ms {
            LatencyGrade::Fair
        } else {
            LatencyGrade::Slow
        }
    }
}

impl fmt::Display for LatencyGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LatencyGrade::Good => "good",
            LatencyGrade::Fair => "fair",
            LatencyGrade::Slow => "slow",
        })
    }
}

/// Current loudness of both meters, each in [0,100]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct AudioLevels {
    pub local: f64,
    pub remote: f64,
}
