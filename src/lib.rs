pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod meter;
pub mod report;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod types;
pub mod utils;

pub use config::AppConfig;
pub use error::{ConfigError, SessionError};
pub use media::{CaptureHandle, MediaDevices, SyntheticDevices};
pub use report::{Outcome, ReportEntry, ReportLog, Step};
pub use rtc::room::RtcHub;
pub use session::{Phase, Session, SessionEvent, SessionHandle, SessionSnapshot};
pub use signaling::{MemoryHub, PeerLink, Room, RoomEvent, SignalingProvider};
pub use types::{IceConnectionState, PeerId, ServerConfig};

/// Entry point of the `salang` binary. Everything runs on one thread.
pub fn run(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::dispatch(&args))
}
