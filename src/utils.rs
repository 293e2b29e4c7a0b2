use crate::types::ServerConfig;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};

const ROOM_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// `test-room-` followed by nine base36 characters
pub fn random_room_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| ROOM_ALPHABET[rng.random_range(0..ROOM_ALPHABET.len())] as char)
        .collect();
    format!("test-room-{suffix}")
}

/// Locks `mutex`, carrying on with the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// First eight characters of a peer id, for log and report messages
pub fn short_id(id: &str) -> String {
    let head: String = id.chars().take(8).collect();
    format!("{head}...")
}

// Prepend the protocol scheme to an ICE server url when it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Already prefixed with "turn:", "turns:" or "stun:" - keep as is
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // Pick the scheme from the server type
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_have_expected_shape() {
        let id = random_room_id();
        assert!(id.starts_with("test-room-"));
        let suffix = &id["test-room-".len()..];
        assert_eq!(suffix.len(), 9);
        assert!(suffix.bytes().all(|b| ROOM_ALPHABET.contains(&b)));
    }

    #[test]
    fn random_ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(hex::decode(&id).is_ok());
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "01234567...");
        assert_eq!(short_id("abc"), "abc...");
    }

    #[test]
    fn scheme_is_added_by_type() {
        let mut cfg = ServerConfig {
            id: "x".into(),
            r#type: "stun".into(),
            url: "localhost:3478".into(),
            username: None,
            credential: None,
        };
        assert_eq!(add_ice_url_scheme(&cfg), "stun:localhost:3478");
        cfg.r#type = "turn".into();
        assert_eq!(add_ice_url_scheme(&cfg), "turn:localhost:3478");
        cfg.url = "stun:example.org".into();
        assert_eq!(add_ice_url_scheme(&cfg), "stun:example.org");
    }
}
