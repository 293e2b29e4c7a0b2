use thiserror::Error;

/// Everything that can go wrong while running a connection test.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("room id cannot be empty")]
    InvalidRoomId,

    #[error("operation not allowed in phase {0}")]
    InvalidPhase(&'static str),

    #[error("signaling failure: {0}")]
    SignalingFailure(String),

    #[error("probe failure: {0}")]
    ProbeFailure(String),

    #[error("teardown failure: {0}")]
    TeardownFailure(String),

    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
}

impl SessionError {
    /// Media acquisition errors abort a start attempt.
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_) | SessionError::DeviceUnavailable(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
