//! The tracker service object and its TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chatmesh_shared::crypto::KeyPair;
use chatmesh_shared::wire::Link;
use chatmesh_store::DocumentStore;

use crate::config::TrackerConfig;
use crate::gateway::handle_connection;
use crate::presence::PresenceRegistry;
use crate::reaper::{spawn_presence_reaper, spawn_room_reaper};
use crate::rooms::RoomRegistry;

/// Shared state of one tracker process. Connection workers and reapers
/// all hold an `Arc<Tracker>`; the registries serialize access internally.
pub struct Tracker {
    pub keys: KeyPair,
    pub presence: PresenceRegistry,
    pub rooms: RoomRegistry,
    pub config: TrackerConfig,
}

impl Tracker {
    pub fn new(config: TrackerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let keys = KeyPair::generate();
        info!(public_key = %keys.public_key(), "Tracker keypair generated");
        Self {
            keys,
            presence: PresenceRegistry::load(store.clone()),
            rooms: RoomRegistry::load(store),
            config,
        }
    }
}

/// Accept connections forever, one task per connection.
pub async fn serve(tracker: Arc<Tracker>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    handle_connection(tracker, Link::from_tcp(stream), remote).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// A tracker running in the background: accept loop plus both reapers.
pub struct RunningTracker {
    pub local_addr: SocketAddr,
    pub tracker: Arc<Tracker>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningTracker {
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        info!(addr = %self.local_addr, "Tracker stopped");
    }
}

/// Bind `config.listen_addr`, then spawn the accept loop and the reapers.
pub async fn start(
    config: TrackerConfig,
    store: Arc<dyn DocumentStore>,
) -> std::io::Result<RunningTracker> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    let tracker = Arc::new(Tracker::new(config, store));

    let tasks = vec![
        spawn_presence_reaper(tracker.clone()),
        spawn_room_reaper(tracker.clone()),
        tokio::spawn(serve(tracker.clone(), listener)),
    ];
    info!(addr = %local_addr, "Tracker listening");

    Ok(RunningTracker {
        local_addr,
        tracker,
        tasks,
    })
}
