use log::LevelFilter;
use std::io::Write;

/// Whether logging is switched on for this build
pub fn enabled() -> bool {
    crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
}

/// Installs the timestamped logger. Safe to call more than once.
///
/// `RUST_LOG` still narrows the filter when set; otherwise everything from
/// this crate at debug and above is printed.
pub fn init() {
    let mut builder = env_logger::Builder::new();
    if enabled() {
        builder
            .filter_level(LevelFilter::Warn)
            .filter_module("salang_lib", LevelFilter::Debug)
            .filter_module("salang", LevelFilter::Debug)
            .parse_default_env();
    } else {
        builder.filter_level(LevelFilter::Off);
    }
    builder.format(|buf, record| {
        let now = chrono::Local::now();
        writeln!(
            buf,
            "SALANG: [{}] {:<5} {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });
    // a second init from tests or the binary is fine
    let _ = builder.try_init();
}
