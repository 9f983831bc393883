//! Peer configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use chatmesh_shared::constants::{
    CHAT_REQUEST_TIMEOUT_SECS, DEFAULT_TRACKER_PORT, DIAL_TIMEOUT_SECS, HEARTBEAT_SECS,
    WRITE_TIMEOUT_SECS,
};

/// Peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Env: `TRACKER_ADDR`
    /// Default: `127.0.0.1:6000`
    pub tracker_addr: SocketAddr,

    /// Where other peers dial us. Port 0 picks a free port.
    /// Env: `PEER_LISTEN_ADDR`
    /// Default: `0.0.0.0:0`
    pub listen_addr: SocketAddr,

    /// Env: `HEARTBEAT_SECS`
    pub heartbeat_interval: Duration,

    /// How long an outbound chat request waits for an answer.
    /// Env: `CHAT_REQUEST_TIMEOUT_SECS`
    pub chat_request_timeout: Duration,

    /// How long a room member gets to answer our `group_chat_join`.
    /// Env: `GROUP_JOIN_TIMEOUT_SECS`
    pub group_join_timeout: Duration,

    /// TCP connect limit when dialing another peer.
    /// Env: `DIAL_TIMEOUT_SECS`
    pub dial_timeout: Duration,

    /// Limit on any single write to another peer. A peer that stops
    /// reading is treated as gone once it is hit.
    /// Env: `PEER_WRITE_TIMEOUT_SECS`
    pub write_timeout: Duration,

    /// Env: `TRACKER_REQUEST_TIMEOUT_SECS`
    pub tracker_request_timeout: Duration,

    /// Env: `MAX_PENDING_INVITATIONS`
    pub max_pending_invitations: usize,

    /// Queued invitations older than this are dropped.
    /// Env: `INVITATION_TTL_SECS`
    pub invitation_ttl: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            tracker_addr: ([127, 0, 0, 1], DEFAULT_TRACKER_PORT).into(),
            listen_addr: ([0, 0, 0, 0], 0).into(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_SECS),
            chat_request_timeout: Duration::from_secs(CHAT_REQUEST_TIMEOUT_SECS),
            group_join_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            tracker_request_timeout: Duration::from_secs(10),
            max_pending_invitations: 16,
            invitation_ttl: Duration::from_secs(CHAT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl PeerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let addr = |key: &str, current: SocketAddr| match lookup(key) {
            None => current,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Invalid address, using default");
                current
            }),
        };
        config.tracker_addr = addr("TRACKER_ADDR", config.tracker_addr);
        config.listen_addr = addr("PEER_LISTEN_ADDR", config.listen_addr);

        let positive = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.parse::<u64>() {
                Ok(n) if n > 0 => Some(n),
                _ => {
                    tracing::warn!(key, value = %raw, "Invalid value, using default");
                    None
                }
            }
        };
        let secs = |key: &str, current: Duration| positive(key).map_or(current, Duration::from_secs);

        config.heartbeat_interval = secs("HEARTBEAT_SECS", config.heartbeat_interval);
        config.chat_request_timeout = secs("CHAT_REQUEST_TIMEOUT_SECS", config.chat_request_timeout);
        config.group_join_timeout = secs("GROUP_JOIN_TIMEOUT_SECS", config.group_join_timeout);
        config.dial_timeout = secs("DIAL_TIMEOUT_SECS", config.dial_timeout);
        config.write_timeout = secs("PEER_WRITE_TIMEOUT_SECS", config.write_timeout);
        config.tracker_request_timeout =
            secs("TRACKER_REQUEST_TIMEOUT_SECS", config.tracker_request_timeout);
        config.invitation_ttl = secs("INVITATION_TTL_SECS", config.invitation_ttl);
        if let Some(n) = positive("MAX_PENDING_INVITATIONS") {
            config.max_pending_invitations = n as usize;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = PeerConfig::default();
        assert_eq!(config.tracker_addr, ([127, 0, 0, 1], 6000).into());
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.chat_request_timeout, Duration::from_secs(60));
        assert_eq!(config.max_pending_invitations, 16);
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TRACKER_ADDR", "10.0.0.2:6100"),
            ("PEER_LISTEN_ADDR", "not an address"),
            ("HEARTBEAT_SECS", "5"),
            ("MAX_PENDING_INVITATIONS", "-3"),
            ("INVITATION_TTL_SECS", "20"),
            ("DIAL_TIMEOUT_SECS", "3"),
        ]);
        let config = PeerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.tracker_addr, ([10, 0, 0, 2], 6100).into());
        assert_eq!(config.listen_addr, PeerConfig::default().listen_addr);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.max_pending_invitations, 16);
        assert_eq!(config.invitation_ttl, Duration::from_secs(20));
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
    }
}
