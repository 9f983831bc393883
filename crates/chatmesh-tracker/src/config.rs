//! Tracker configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the tracker can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chatmesh_shared::constants::{
    DEFAULT_TRACKER_PORT, PRESENCE_SWEEP_SECS, ROOM_SWEEP_SECS, ROOM_TIMEOUT_SECS,
    SESSION_TIMEOUT_SECS,
};

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// TCP address peers connect to.
    /// Env: `TRACKER_LISTEN_ADDR`
    /// Default: `0.0.0.0:6000`
    pub listen_addr: SocketAddr,

    /// SQLite file holding the user and room tables.
    /// Env: `TRACKER_DB_PATH`
    /// Default: `./data_storage/tracker.db`
    pub db_path: PathBuf,

    /// A session with no heartbeat for this long is evicted.
    /// Env: `SESSION_TIMEOUT_SECS`
    pub session_timeout: Duration,

    /// How often stale sessions are looked for.
    /// Env: `PRESENCE_SWEEP_SECS`
    pub presence_sweep_interval: Duration,

    /// A room whose moderator has been silent this long is closed.
    /// Env: `ROOM_TIMEOUT_SECS`
    pub room_timeout: Duration,

    /// How often rooms are checked for a vanished moderator.
    /// Env: `ROOM_SWEEP_SECS`
    pub room_sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_TRACKER_PORT).into(),
            db_path: PathBuf::from("./data_storage/tracker.db"),
            session_timeout: Duration::from_secs(SESSION_TIMEOUT_SECS),
            presence_sweep_interval: Duration::from_secs(PRESENCE_SWEEP_SECS),
            room_timeout: Duration::from_secs(ROOM_TIMEOUT_SECS),
            room_sweep_interval: Duration::from_secs(ROOM_SWEEP_SECS),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("TRACKER_LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid TRACKER_LISTEN_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("TRACKER_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        let secs = |key: &str, current: Duration| match lookup(key) {
            None => current,
            Some(raw) => match raw.parse::<u64>() {
                Ok(n) if n > 0 => Duration::from_secs(n),
                _ => {
                    tracing::warn!(key, value = %raw, "Invalid duration, using default");
                    current
                }
            },
        };

        config.session_timeout = secs("SESSION_TIMEOUT_SECS", config.session_timeout);
        config.presence_sweep_interval = secs("PRESENCE_SWEEP_SECS", config.presence_sweep_interval);
        config.room_timeout = secs("ROOM_TIMEOUT_SECS", config.room_timeout);
        config.room_sweep_interval = secs("ROOM_SWEEP_SECS", config.room_sweep_interval);

        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.listen_addr, ([0, 0, 0, 0], 6000).into());
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.presence_sweep_interval, Duration::from_secs(30));
        assert_eq!(config.room_sweep_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("TRACKER_LISTEN_ADDR", "127.0.0.1:7000"),
            ("ROOM_TIMEOUT_SECS", "5"),
            ("TRACKER_DB_PATH", "/tmp/t.db"),
        ]));
        assert_eq!(config.listen_addr, ([127, 0, 0, 1], 7000).into());
        assert_eq!(config.room_timeout, Duration::from_secs(5));
        assert_eq!(config.db_path, PathBuf::from("/tmp/t.db"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("TRACKER_LISTEN_ADDR", "nowhere"),
            ("SESSION_TIMEOUT_SECS", "0"),
            ("PRESENCE_SWEEP_SECS", "soon"),
        ]));
        assert_eq!(config.listen_addr, TrackerConfig::default().listen_addr);
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.presence_sweep_interval, Duration::from_secs(30));
    }
}
