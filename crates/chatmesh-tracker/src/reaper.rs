//! Background liveness sweeps.
//!
//! Two separate timers: user sessions (default every 30s, 60s timeout) and
//! room moderators (default every 10s, 60s timeout). A room lives as long as
//! its moderator keeps heartbeating, whatever the members do.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::server::Tracker;

pub fn spawn_presence_reaper(tracker: Arc<Tracker>) -> JoinHandle<()> {
    let period = tracker.config.presence_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            sweep_presence(&tracker, Utc::now()).await;
        }
    })
}

pub fn spawn_room_reaper(tracker: Arc<Tracker>) -> JoinHandle<()> {
    let period = tracker.config.room_sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            sweep_rooms(&tracker, Utc::now()).await;
        }
    })
}

/// Evict silent sessions and pull each evicted user out of every room.
pub async fn sweep_presence(tracker: &Tracker, now: DateTime<Utc>) -> Vec<String> {
    let evicted = tracker
        .presence
        .evict_stale(now, tracker.config.session_timeout)
        .await;
    for user in &evicted {
        tracker.rooms.remove_user_from_all_rooms(user).await;
        info!(user = %user, "Evicted inactive session");
    }
    evicted
}

pub async fn sweep_rooms(tracker: &Tracker, now: DateTime<Utc>) -> Vec<String> {
    let closed = tracker
        .rooms
        .close_stale(now, tracker.config.room_timeout)
        .await;
    for room in &closed {
        info!(room = %room, "Closed room, moderator inactive");
    }
    closed
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use chatmesh_store::MemoryStore;

    use super::*;
    use crate::config::TrackerConfig;
    use crate::presence::{ConnectionHandle, ConnectionId, LoginRequest};

    async fn tracker_with(users: &[&str]) -> Tracker {
        let tracker = Tracker::new(TrackerConfig::default(), Arc::new(MemoryStore::new()));
        for user in users {
            tracker.presence.register(user, "pw").await.unwrap();
            let (connection, _closed) = ConnectionHandle::new(ConnectionId::new());
            tracker
                .presence
                .login(LoginRequest {
                    username: user.to_string(),
                    password: "pw".into(),
                    address: IpAddr::from([127, 0, 0, 1]),
                    listen_port: 7000,
                    public_key: "pk".into(),
                    connection,
                })
                .await
                .unwrap();
        }
        tracker
    }

    #[tokio::test]
    async fn test_silent_user_leaves_presence_and_rooms() {
        let tracker = tracker_with(&["mod", "bob"]).await;
        tracker.rooms.create_room("x", "mod").await.unwrap();
        tracker.rooms.add_member("x", "bob", "mod").await.unwrap();
        tracker.rooms.join_room("x", "bob").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        tracker.presence.heartbeat_at("mod", later).await;

        let evicted = sweep_presence(&tracker, later).await;
        assert_eq!(evicted, vec!["bob"]);
        assert!(!tracker.presence.is_online("bob").await);
        assert!(tracker.rooms.online_members("x", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silent_moderator_loses_room() {
        let tracker = tracker_with(&["mod"]).await;
        tracker.rooms.create_room("x", "mod").await.unwrap();

        assert!(sweep_rooms(&tracker, Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(sweep_rooms(&tracker, later).await, vec!["x"]);
        assert!(tracker.rooms.list_rooms().await.is_empty());
    }
}
