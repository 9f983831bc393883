//! The peer's single connection to the tracker.
//!
//! Requests are strictly one at a time: the link lock is held from sending
//! a request until its response arrives. A transport failure closes the
//! link for good and every later request fails with
//! [`PeerError::TrackerUnavailable`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatmesh_shared::crypto::{KeyPair, PublicKey};
use chatmesh_shared::error::WireError;
use chatmesh_shared::protocol::{PeerAddr, ResponseData, TrackerRequest, TrackerResponse};
use chatmesh_shared::wire::{read_json, recv_sealed_timeout, send_sealed, write_json, KeyExchange, Link};

use crate::error::PeerError;
use crate::events::{EventSender, PeerEvent};

pub struct TrackerClient {
    keys: Arc<KeyPair>,
    tracker_key: PublicKey,
    link: Mutex<Option<Link>>,
    timeout: Duration,
}

impl TrackerClient {
    pub async fn connect(
        addr: SocketAddr,
        keys: Arc<KeyPair>,
        timeout: Duration,
    ) -> Result<Self, PeerError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout)??;
        debug!(tracker = %addr, "Connected to tracker");
        Self::handshake(Link::from_tcp(stream), keys, timeout).await
    }

    /// Key exchange on an already open link: the tracker speaks first.
    pub async fn handshake(
        mut link: Link,
        keys: Arc<KeyPair>,
        timeout: Duration,
    ) -> Result<Self, PeerError> {
        let theirs: KeyExchange = tokio::time::timeout(timeout, read_json(&mut link.reader))
            .await
            .map_err(|_| WireError::Timeout)??;
        let tracker_key = PublicKey::from_text(&theirs.public_key)?;

        let ours = KeyExchange {
            public_key: keys.public_key().to_text(),
        };
        write_json(&mut link.writer, &ours).await?;

        Ok(Self {
            keys,
            tracker_key,
            link: Mutex::new(Some(link)),
            timeout,
        })
    }

    /// Send one request and wait for its response, whatever the status.
    pub async fn request(&self, request: &TrackerRequest) -> Result<TrackerResponse, PeerError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(PeerError::TrackerUnavailable)?;

        let result: Result<TrackerResponse, WireError> = async {
            send_sealed(&mut link.writer, &self.tracker_key, request).await?;
            recv_sealed_timeout(&mut link.reader, &self.keys, self.timeout).await
        }
        .await;

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(command = request.name(), error = %e, "Tracker connection failed");
                if let Some(link) = guard.take() {
                    link.close().await;
                }
                Err(e.into())
            }
        }
    }

    /// Like [`request`](Self::request) but an `error` status becomes
    /// [`PeerError::Tracker`].
    async fn call(&self, request: TrackerRequest) -> Result<TrackerResponse, PeerError> {
        let response = self.request(&request).await?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(PeerError::Tracker(response.message))
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Typed commands
    // -----------------------------------------------------------------------

    pub async fn register(&self, username: &str, password: &str) -> Result<String, PeerError> {
        let response = self
            .call(TrackerRequest::Register {
                username: username.into(),
                password: password.into(),
            })
            .await?;
        Ok(response.message)
    }

    /// Returns the canonical username the tracker bound to this connection.
    pub async fn login(&self, username: &str, password: &str, listen_port: u16) -> Result<String, PeerError> {
        let response = self
            .call(TrackerRequest::Login {
                username: username.into(),
                password: password.into(),
                listen_port,
            })
            .await?;
        match response.data {
            Some(ResponseData::LoggedIn { username }) => Ok(username),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn logout(&self) -> Result<String, PeerError> {
        Ok(self.call(TrackerRequest::Logout).await?.message)
    }

    pub async fn heartbeat(&self) -> Result<(), PeerError> {
        self.call(TrackerRequest::Heartbeat).await.map(|_| ())
    }

    pub async fn list_peers(&self) -> Result<Vec<String>, PeerError> {
        match self.call(TrackerRequest::ListPeers).await?.data {
            Some(ResponseData::PeerList { peers }) => Ok(peers),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn peer_addr(&self, username: &str) -> Result<PeerAddr, PeerError> {
        let request = TrackerRequest::GetPeerAddr {
            username: username.into(),
        };
        match self.call(request).await?.data {
            Some(ResponseData::PeerAddr(addr)) => Ok(addr),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn list_rooms(&self) -> Result<Vec<String>, PeerError> {
        match self.call(TrackerRequest::ListRooms).await?.data {
            Some(ResponseData::RoomList { rooms }) => Ok(rooms),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn create_room(&self, room: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::CreateRoom { room: room.into() };
        Ok(self.call(request).await?.message)
    }

    pub async fn join_room(&self, room: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::JoinRoom { room: room.into() };
        Ok(self.call(request).await?.message)
    }

    pub async fn leave_room(&self, room: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::LeaveRoom { room: room.into() };
        Ok(self.call(request).await?.message)
    }

    /// Online members of `room` other than us, with where to dial them.
    pub async fn room_members(&self, room: &str) -> Result<BTreeMap<String, PeerAddr>, PeerError> {
        let request = TrackerRequest::GetRoomMembers { room: room.into() };
        match self.call(request).await?.data {
            Some(ResponseData::OnlineMembers { members }) => Ok(members),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn list_my_rooms(&self) -> Result<Vec<String>, PeerError> {
        match self.call(TrackerRequest::ListMyRooms).await?.data {
            Some(ResponseData::MyRooms { rooms }) => Ok(rooms),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn list_members(&self, room: &str) -> Result<(String, Vec<String>), PeerError> {
        let request = TrackerRequest::ListMembers { room: room.into() };
        match self.call(request).await?.data {
            Some(ResponseData::Members { moderator, members }) => Ok((moderator, members)),
            _ => Err(PeerError::UnexpectedResponse),
        }
    }

    pub async fn add_member(&self, room: &str, username: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::AddMember {
            room: room.into(),
            username: username.into(),
        };
        Ok(self.call(request).await?.message)
    }

    pub async fn remove_member(&self, room: &str, username: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::RemoveMember {
            room: room.into(),
            username: username.into(),
        };
        Ok(self.call(request).await?.message)
    }

    pub async fn close_room(&self, room: &str) -> Result<String, PeerError> {
        let request = TrackerRequest::CloseRoom { room: room.into() };
        Ok(self.call(request).await?.message)
    }
}

/// Heartbeat every `period` until the tracker stops answering.
pub fn spawn_heartbeat(
    client: Arc<TrackerClient>,
    period: Duration,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            match client.heartbeat().await {
                Ok(()) => debug!("Heartbeat sent"),
                Err(PeerError::Tracker(message)) => {
                    warn!(%message, "Tracker rejected heartbeat");
                }
                Err(e) => {
                    events.emit(PeerEvent::TrackerLost {
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
    })
}
