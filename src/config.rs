// Application configuration.
// Logging can only be switched off in development builds.

use crate::error::ConfigError;
use crate::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // logging is on in debug builds

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // and off in release builds

// Extra switches for development builds
#[cfg(debug_assertions)]
pub mod dev {
    // Set to false to silence logging entirely while developing.
    // Only honoured in debug builds!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // Fixed in release builds
    pub const ENABLE_LOGGING: bool = false;
}

/// Path of an optional JSON config file
pub const CONFIG_PATH_ENV: &str = "SALANG_CONFIG";
pub const SIGNALING_URL_ENV: &str = "SALANG_SIGNALING_URL";
pub const SIGNALING_KEY_ENV: &str = "SALANG_SIGNALING_KEY";

pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:54321";
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;
pub const DEFAULT_FFT_SIZE: usize = 256;

/// Public Google STUN servers used when nothing else is configured
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    (0..5)
        .map(|n| {
            let host = if n == 0 {
                "stun.l.google.com".to_string()
            } else {
                format!("stun{n}.l.google.com")
            };
            ServerConfig {
                id: format!("default-stun-{n}"),
                r#type: "stun".into(),
                url: format!("stun:{host}:19302"),
                username: None,
                credential: None,
            }
        })
        .collect()
});

/// Endpoint and credential of the realtime channel used for signaling
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalingConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIGNALING_URL.into(),
            api_key: String::new(),
        }
    }
}

/// Thresholds used to grade a latency measurement
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LatencyThresholds {
    pub good_below_ms: u64,
    pub fair_below_ms: u64,
}

impl Default for LatencyThresholds {
    fn default() -> Self {
        Self {
            good_below_ms: 100,
            fair_below_ms: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<ServerConfig>,
    pub probe_interval_ms: u64,
    pub frame_interval_ms: u64,
    pub fft_size: usize,
    pub latency: LatencyThresholds,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            fft_size: DEFAULT_FFT_SIZE,
            latency: LatencyThresholds::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the JSON file named by `SALANG_CONFIG`, then env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides taken from the environment; `lookup` is injectable for tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(SIGNALING_URL_ENV).filter(|v| !v.is_empty()) {
            self.signaling.url = url;
        }
        if let Some(key) = lookup(SIGNALING_KEY_ENV) {
            self.signaling.api_key = key;
        }
    }

    /// Same rules the ICE server setter always applied, plus sane timer values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling.url.trim().is_empty() {
            return Err(ConfigError::Invalid("signaling url cannot be empty".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ICE server '{}' has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.probe_interval_ms == 0 || self.frame_interval_ms == 0 {
            return Err(ConfigError::Invalid("timer intervals must be positive".into()));
        }
        if !self.fft_size.is_power_of_two() || self.fft_size < 32 {
            return Err(ConfigError::Invalid(format!(
                "fft size {} must be a power of two >= 32",
                self.fft_size
            )));
        }
        Ok(())
    }

    /// ICE servers with `stun:`/`turn:` prefixes filled in.
    pub fn normalized_ice_servers(&self) -> Vec<ServerConfig> {
        self.ice_servers
            .iter()
            .map(|server| ServerConfig {
                url: add_ice_url_scheme(server),
                ..server.clone()
            })
            .collect()
    }

    /// Never zero, tokio intervals refuse a zero period.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ice_servers.len(), 5);
        assert_eq!(config.ice_servers[0].url, "stun:stun.l.google.com:19302");
        assert_eq!(config.ice_servers[4].url, "stun:stun4.l.google.com:19302");
        assert_eq!(config.probe_interval(), Duration::from_secs(3));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AppConfig::from_json(r#"{"probe_interval_ms": 1000}"#).unwrap();
        assert_eq!(config.probe_interval_ms, 1000);
        assert_eq!(config.frame_interval_ms, DEFAULT_FRAME_INTERVAL_MS);
        assert_eq!(config.signaling.url, DEFAULT_SIGNALING_URL);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"{"ice_servers":[{"id":"t","type":"turn","url":"localhost:3478"}]}"#;
        assert!(matches!(
            AppConfig::from_json(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn env_overrides_signaling() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            SIGNALING_URL_ENV => Some("https://example.supabase.co".into()),
            SIGNALING_KEY_ENV => Some("anon".into()),
            _ => None,
        });
        assert_eq!(config.signaling.url, "https://example.supabase.co");
        assert_eq!(config.signaling.api_key, "anon");
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = AppConfig {
            probe_interval_ms: 0,
            frame_interval_ms: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.probe_interval(), Duration::from_millis(1));
        assert_eq!(config.frame_interval(), Duration::from_millis(1));
    }

    #[test]
    fn normalizes_scheme_less_urls() {
        let mut config = AppConfig::default();
        config.ice_servers = vec![ServerConfig {
            id: "coturn".into(),
            r#type: "turn".into(),
            url: "localhost:3478".into(),
            username: Some("salang".into()),
            credential: Some("salang123".into()),
        }];
        assert_eq!(config.normalized_ice_servers()[0].url, "turn:localhost:3478");
    }
}
