//! [`PeerNode`]: one local user's process, tying the tracker connection,
//! the listening socket and the chat/room sessions together.
//!
//! Private chat lives in [`crate::chat`], rooms in [`crate::group`] and the
//! inbound socket handling in [`crate::acceptor`]; each adds its own
//! `impl PeerNode` block.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatmesh_shared::crypto::KeyPair;

use crate::acceptor::run_acceptor;
use crate::chat::ActiveChat;
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::events::{self, EventReceiver, EventSender};
use crate::group::GroupSession;
use crate::invitations::InvitationQueue;
use crate::session::{LocalSession, SessionState};
use crate::tracker_client::{spawn_heartbeat, TrackerClient};

pub struct PeerNode {
    pub config: PeerConfig,
    pub(crate) keys: Arc<KeyPair>,
    pub(crate) tracker: Arc<TrackerClient>,
    pub(crate) session: LocalSession,
    pub(crate) invitations: Mutex<InvitationQueue>,
    pub(crate) chat: Mutex<Option<ActiveChat>>,
    pub(crate) group: Arc<GroupSession>,
    pub(crate) events: EventSender,
    listen_port: u16,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl PeerNode {
    /// Bind the peer listener, connect to the tracker and start accepting
    /// direct connections.
    pub async fn start(config: PeerConfig) -> Result<(Arc<Self>, EventReceiver), PeerError> {
        let keys = Arc::new(KeyPair::generate());
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_port = listener.local_addr()?.port();

        let tracker =
            TrackerClient::connect(config.tracker_addr, keys.clone(), config.tracker_request_timeout)
                .await?;
        info!(tracker = %config.tracker_addr, listen_port, "Peer started");

        let (node, events) = Self::new(config, keys, Arc::new(tracker), listen_port);
        let acceptor = tokio::spawn(run_acceptor(node.clone(), listener));
        *node.acceptor.lock().await = Some(acceptor);
        Ok((node, events))
    }

    /// Assemble a node from parts without binding anything.
    pub fn new(
        config: PeerConfig,
        keys: Arc<KeyPair>,
        tracker: Arc<TrackerClient>,
        listen_port: u16,
    ) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = events::channel();
        let invitations = InvitationQueue::new(config.max_pending_invitations, config.invitation_ttl);
        let node = Arc::new(Self {
            group: Arc::new(GroupSession::new(
                keys.clone(),
                events.clone(),
                config.write_timeout,
            )),
            invitations: Mutex::new(invitations),
            chat: Mutex::new(None),
            session: LocalSession::new(),
            heartbeat: Mutex::new(None),
            acceptor: Mutex::new(None),
            config,
            keys,
            tracker,
            events,
            listen_port,
        });
        (node, receiver)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn username(&self) -> Option<String> {
        self.session.user()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub(crate) fn require_user(&self) -> Result<String, PeerError> {
        self.session.user().ok_or(PeerError::NotLoggedIn)
    }

    // -----------------------------------------------------------------------
    // Account
    // -----------------------------------------------------------------------

    pub async fn register(&self, username: &str, password: &str) -> Result<String, PeerError> {
        self.tracker.register(username, password).await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, PeerError> {
        if let Some(current) = self.session.user() {
            return Err(PeerError::AlreadyLoggedIn(current));
        }
        let username = self.tracker.login(username, password, self.listen_port).await?;
        self.session.set_user(Some(username.clone()));

        let heartbeat = spawn_heartbeat(
            self.tracker.clone(),
            self.config.heartbeat_interval,
            self.events.clone(),
        );
        if let Some(previous) = self.heartbeat.lock().await.replace(heartbeat) {
            previous.abort();
        }
        info!(user = %username, "Logged in");
        Ok(username)
    }

    /// Hang up everything, then tell the tracker we are gone.
    pub async fn logout(&self) -> Result<(), PeerError> {
        let user = self.require_user()?;
        self.wind_down().await;
        self.session.set_user(None);

        self.tracker.logout().await?;
        info!(user = %user, "Logged out");
        Ok(())
    }

    /// Notify every counterparty before any socket closes: room members
    /// get `group_leave`, the chat partner `exit`, queued requesters
    /// `refuse`.
    async fn wind_down(&self) {
        self.leave_room().await;
        if self.end_chat().await.is_ok() {
            debug!("Chat ended on wind-down");
        }
        self.refuse_all_invitations().await;
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.abort();
        }
    }

    /// Log out if needed and stop accepting connections.
    pub async fn shutdown(&self) {
        if self.session.user().is_some() {
            if let Err(e) = self.logout().await {
                warn!(error = %e, "Logout during shutdown failed");
            }
        } else {
            self.wind_down().await;
        }
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            acceptor.abort();
        }
        self.tracker.close().await;
        info!("Peer stopped");
    }

    // -----------------------------------------------------------------------
    // Tracker queries
    // -----------------------------------------------------------------------

    pub async fn list_peers(&self) -> Result<Vec<String>, PeerError> {
        self.require_user()?;
        self.tracker.list_peers().await
    }

    pub async fn list_rooms(&self) -> Result<Vec<String>, PeerError> {
        self.require_user()?;
        self.tracker.list_rooms().await
    }

    pub async fn create_room(&self, room: &str) -> Result<String, PeerError> {
        self.require_user()?;
        self.tracker.create_room(room).await
    }

    pub async fn list_my_rooms(&self) -> Result<Vec<String>, PeerError> {
        self.require_user()?;
        self.tracker.list_my_rooms().await
    }

    pub async fn list_members(&self, room: &str) -> Result<(String, Vec<String>), PeerError> {
        self.require_user()?;
        self.tracker.list_members(room).await
    }

    pub async fn add_member(&self, room: &str, username: &str) -> Result<String, PeerError> {
        self.require_user()?;
        self.tracker.add_member(room, username).await
    }

    pub async fn remove_member(&self, room: &str, username: &str) -> Result<String, PeerError> {
        self.require_user()?;
        self.tracker.remove_member(room, username).await
    }

    pub async fn close_room(&self, room: &str) -> Result<String, PeerError> {
        self.require_user()?;
        self.tracker.close_room(room).await
    }

    /// Send a line of text to whatever we are currently in.
    pub async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        match self.session.state() {
            SessionState::Chatting { .. } => self.send_chat_message(text).await,
            SessionState::InRoom { .. } => self.send_group_message(text).await.map(|_| ()),
            state => Err(PeerError::InvalidState(format!(
                "Nothing to send to while {state}"
            ))),
        }
    }
}
