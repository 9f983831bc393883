//! Presence registry: registered accounts and who is online right now.
//!
//! Accounts are durable (write-through to the `users` document). Active
//! sessions live only in memory and are keyed by username; each one holds
//! a [`ConnectionHandle`] so the registry can close the owning tracker
//! connection when the session is evicted or replaced.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatmesh_shared::crypto::{hash_password, verify_password, PasswordHash};
use chatmesh_shared::protocol::PeerAddr;
use chatmesh_store::{load_typed, save_typed, DocumentStore};

use crate::error::{RegistryError, RegistryResult};

pub const USERS_DOCUMENT: &str = "users";

/// Identifies one accepted tracker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// The registry's grip on a tracker connection: closing it makes the
/// connection's worker stop reading and run its cleanup.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    close: Option<oneshot::Sender<()>>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, close: Some(tx) }, rx)
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.close.take() {
            // The worker may already be gone.
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub password: PasswordHash,
}

#[derive(Debug)]
pub struct ActiveSession {
    pub address: IpAddr,
    pub listen_port: u16,
    pub public_key: String,
    pub last_seen: DateTime<Utc>,
    pub connection: ConnectionHandle,
}

/// Everything `login` needs besides the credentials.
#[derive(Debug)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub address: IpAddr,
    pub listen_port: u16,
    pub public_key: String,
    pub connection: ConnectionHandle,
}

pub struct PresenceRegistry {
    accounts: Mutex<HashMap<String, UserAccount>>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    store: Arc<dyn DocumentStore>,
}

impl PresenceRegistry {
    /// Build the registry from the persisted account table. A table that
    /// cannot be read is logged and treated as empty.
    pub fn load(store: Arc<dyn DocumentStore>) -> Self {
        let accounts: HashMap<String, UserAccount> =
            match load_typed(store.as_ref(), USERS_DOCUMENT) {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "Failed to load user accounts, starting empty");
                    HashMap::new()
                }
            };
        info!(accounts = accounts.len(), "Presence registry loaded");

        Self {
            accounts: Mutex::new(accounts),
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> RegistryResult<()> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(RegistryError::InvalidInput(
                "Username and password must not be empty".into(),
            ));
        }

        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(username) {
            return Err(RegistryError::Conflict(format!(
                "Username '{username}' already exists"
            )));
        }

        accounts.insert(
            username.to_string(),
            UserAccount {
                password: hash_password(password),
            },
        );
        if let Err(e) = save_typed(self.store.as_ref(), USERS_DOCUMENT, &*accounts) {
            warn!(user = %username, error = %e, "Failed to persist user accounts");
        }
        info!(user = %username, "Registered new account");
        Ok(())
    }

    /// Check credentials and (re)create the active session. A previous
    /// session for the same username is replaced and its connection closed.
    pub async fn login(&self, request: LoginRequest) -> RegistryResult<String> {
        let username = request.username.trim().to_string();
        {
            let accounts = self.accounts.lock().await;
            let valid = accounts
                .get(&username)
                .is_some_and(|account| verify_password(&request.password, &account.password));
            if !valid {
                return Err(RegistryError::Auth("Incorrect username or password".into()));
            }
        }

        let session = ActiveSession {
            address: request.address,
            listen_port: request.listen_port,
            public_key: request.public_key,
            last_seen: Utc::now(),
            connection: request.connection,
        };

        let mut sessions = self.sessions.lock().await;
        if let Some(mut previous) = sessions.insert(username.clone(), session) {
            info!(
                user = %username,
                old_conn = %previous.connection.id,
                "Replacing existing session"
            );
            previous.connection.close();
        }
        info!(user = %username, addr = %request.address, port = request.listen_port, "User logged in");
        Ok(username)
    }

    /// Remove the session if present and close its connection. Returns
    /// whether a session existed.
    pub async fn logout(&self, username: &str) -> bool {
        let removed = self.sessions.lock().await.remove(username);
        match removed {
            Some(mut session) => {
                session.connection.close();
                info!(user = %username, "User logged out");
                true
            }
            None => false,
        }
    }

    /// Disconnect cleanup: drop the session only if it still belongs to
    /// `connection`. Returns whether it did.
    pub async fn release(&self, username: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let owned = sessions
            .get(username)
            .is_some_and(|s| s.connection.id == connection);
        if owned {
            sessions.remove(username);
            debug!(user = %username, conn = %connection, "Session released on disconnect");
        }
        owned
    }

    pub async fn heartbeat(&self, username: &str) -> bool {
        self.heartbeat_at(username, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, username: &str, now: DateTime<Utc>) -> bool {
        match self.sessions.lock().await.get_mut(username) {
            Some(session) => {
                session.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Usernames of every active session except `excluding`, sorted.
    pub async fn list_active_peers(&self, excluding: &str) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut peers: Vec<String> = sessions
            .keys()
            .filter(|name| name.as_str() != excluding)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    pub async fn peer_address(&self, username: &str) -> RegistryResult<PeerAddr> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(username)
            .ok_or_else(|| RegistryError::NotFound(format!("User '{username}' is not online")))?;
        Ok(PeerAddr {
            ip: session.address,
            port: session.listen_port,
            public_key: session.public_key.clone(),
        })
    }

    pub async fn is_registered(&self, username: &str) -> bool {
        self.accounts.lock().await.contains_key(username)
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.sessions.lock().await.contains_key(username)
    }

    /// Force-logout every session not seen since `now - timeout`.
    /// Returns the evicted usernames.
    pub async fn evict_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut sessions = self.sessions.lock().await;

        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| is_expired(s.last_seen, now, timeout))
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            if let Some(mut session) = sessions.remove(name) {
                session.connection.close();
            }
        }
        stale
    }
}

/// True when more than `timeout` has passed between `last_seen` and `now`.
/// A `last_seen` in the future never expires.
pub(crate) fn is_expired(last_seen: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(last_seen)
        .to_std()
        .is_ok_and(|age| age > timeout)
}

#[cfg(test)]
mod tests {
    use chatmesh_store::MemoryStore;

    use super::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::load(Arc::new(MemoryStore::new()))
    }

    fn login_request(username: &str, password: &str) -> (LoginRequest, oneshot::Receiver<()>) {
        let (connection, closed) = ConnectionHandle::new(ConnectionId::new());
        let request = LoginRequest {
            username: username.into(),
            password: password.into(),
            address: "127.0.0.1".parse().unwrap(),
            listen_port: 5565,
            public_key: "pk".into(),
            connection,
        };
        (request, closed)
    }

    #[tokio::test]
    async fn test_register_conflict() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        let err = reg.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_blank() {
        let reg = registry();
        assert!(matches!(
            reg.register("  ", "pw").await,
            Err(RegistryError::InvalidInput(_))
        ));
        assert!(matches!(
            reg.register("bob", "").await,
            Err(RegistryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_login_bad_password() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        let (req, _closed) = login_request("alice", "wrong");
        assert!(matches!(reg.login(req).await, Err(RegistryError::Auth(_))));

        let (req, _closed) = login_request("nobody", "pw");
        assert!(matches!(reg.login(req).await, Err(RegistryError::Auth(_))));
    }

    #[tokio::test]
    async fn test_login_logout_leaves_no_trace() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        let (req, mut closed) = login_request("alice", "pw");
        assert_eq!(reg.login(req).await.unwrap(), "alice");
        assert!(reg.is_online("alice").await);

        assert!(reg.logout("alice").await);
        assert!(!reg.is_online("alice").await);
        assert!(reg.list_active_peers("").await.is_empty());
        assert!(closed.try_recv().is_ok());

        // idempotent
        assert!(!reg.logout("alice").await);
    }

    #[tokio::test]
    async fn test_relogin_replaces_and_closes_previous() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        let (first, mut first_closed) = login_request("alice", "pw");
        let first_id = first.connection.id;
        reg.login(first).await.unwrap();

        let (second, _second_closed) = login_request("alice", "pw");
        reg.login(second).await.unwrap();

        assert!(first_closed.try_recv().is_ok());
        // the old connection's cleanup must not touch the new session
        assert!(!reg.release("alice", first_id).await);
        assert!(reg.is_online("alice").await);
    }

    #[tokio::test]
    async fn test_list_and_address() {
        let reg = registry();
        for name in ["alice", "bob", "carol"] {
            reg.register(name, "pw").await.unwrap();
            let (req, _closed) = login_request(name, "pw");
            reg.login(req).await.unwrap();
        }

        assert_eq!(reg.list_active_peers("bob").await, vec!["alice", "carol"]);

        let addr = reg.peer_address("carol").await.unwrap();
        assert_eq!(addr.port, 5565);
        assert!(matches!(
            reg.peer_address("dave").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_eviction_after_timeout() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        reg.register("bob", "pw").await.unwrap();
        let (alice, mut alice_closed) = login_request("alice", "pw");
        let (bob, _bob_closed) = login_request("bob", "pw");
        reg.login(alice).await.unwrap();
        reg.login(bob).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(61);
        reg.heartbeat_at("bob", later).await;

        let evicted = reg.evict_stale(later, Duration::from_secs(60)).await;
        assert_eq!(evicted, vec!["alice".to_string()]);
        assert!(!reg.is_online("alice").await);
        assert!(reg.is_online("bob").await);
        assert!(alice_closed.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_no_eviction_within_timeout() {
        let reg = registry();
        reg.register("alice", "pw").await.unwrap();
        let (req, _closed) = login_request("alice", "pw");
        reg.login(req).await.unwrap();

        let soon = Utc::now() + chrono::Duration::seconds(59);
        assert!(reg.evict_stale(soon, Duration::from_secs(60)).await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_is_noop() {
        let reg = registry();
        assert!(!reg.heartbeat("ghost").await);
    }

    #[tokio::test]
    async fn test_accounts_persist() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        PresenceRegistry::load(store.clone())
            .register("alice", "pw")
            .await
            .unwrap();

        let reloaded = PresenceRegistry::load(store);
        assert!(reloaded.is_registered("alice").await);
        let (req, _closed) = login_request("alice", "pw");
        assert!(reloaded.login(req).await.is_ok());
    }
}
