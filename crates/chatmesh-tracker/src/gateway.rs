//! Session gateway: the per-connection worker on the tracker.
//!
//! ```text
//! tracker -> peer   {"public_key": ...}          (plaintext)
//! peer -> tracker   {"public_key": ...}          (plaintext)
//! peer -> tracker   seal(tracker_pk, request)    repeated, one response each
//! tracker -> peer   seal(peer_pk, response)
//! ```
//!
//! Any transport failure ends the connection. Cleanup runs once, after the
//! loop, whatever ended it.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use chatmesh_shared::crypto::PublicKey;
use chatmesh_shared::error::WireError;
use chatmesh_shared::protocol::{ResponseData, TrackerRequest, TrackerResponse};
use chatmesh_shared::wire::{read_frame, read_json, send_sealed, write_json, KeyExchange, Link};

use crate::error::{RegistryError, RegistryResult};
use crate::presence::{ConnectionHandle, ConnectionId, LoginRequest};
use crate::rooms::Removal;
use crate::server::Tracker;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection state. `user` is bound by a successful login.
struct Connection {
    id: ConnectionId,
    address: IpAddr,
    public_key: PublicKey,
    user: Option<String>,
    kicked: Option<oneshot::Receiver<()>>,
}

#[derive(Debug)]
enum Ended {
    Kicked,
}

pub async fn handle_connection(tracker: Arc<Tracker>, link: Link, remote: SocketAddr) {
    let id = ConnectionId::new();
    let (mut reader, mut writer) = link.into_parts();

    let public_key = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        exchange_keys(&tracker, &mut reader, &mut writer),
    )
    .await
    {
        Ok(Ok(key)) => key,
        Ok(Err(e)) => {
            debug!(conn = %id, remote = %remote, error = %e, "Key exchange failed");
            return;
        }
        Err(_) => {
            debug!(conn = %id, remote = %remote, "Key exchange timed out");
            return;
        }
    };
    debug!(conn = %id, remote = %remote, "Connection established");

    let mut conn = Connection {
        id,
        address: remote.ip(),
        public_key,
        user: None,
        kicked: None,
    };

    match command_loop(&tracker, &mut conn, &mut reader, &mut writer).await {
        Ok(Ended::Kicked) => debug!(conn = %id, "Connection closed by registry"),
        Err(e) if e.is_disconnect() => debug!(conn = %id, "Peer disconnected"),
        Err(e) => warn!(conn = %id, remote = %remote, error = %e, "Connection failed"),
    }

    disconnect(&tracker, &mut conn).await;
    Link { reader, writer }.close().await;
}

async fn exchange_keys<R, W>(tracker: &Tracker, reader: &mut R, writer: &mut W) -> Result<PublicKey, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let ours = KeyExchange {
        public_key: tracker.keys.public_key().to_text(),
    };
    write_json(writer, &ours).await?;
    let theirs: KeyExchange = read_json(reader).await?;
    Ok(PublicKey::from_text(&theirs.public_key)?)
}

async fn command_loop<R, W>(
    tracker: &Tracker,
    conn: &mut Connection,
    reader: &mut R,
    writer: &mut W,
) -> Result<Ended, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let frame = tokio::select! {
            frame = read_frame(reader) => frame?,
            _ = wait_kicked(&mut conn.kicked) => return Ok(Ended::Kicked),
        };

        let body = tracker.keys.open(&frame)?;
        let value: serde_json::Value = serde_json::from_slice(&body)?;
        let response = match serde_json::from_value::<TrackerRequest>(value) {
            Ok(request) => dispatch(tracker, conn, request).await,
            Err(e) => {
                debug!(conn = %conn.id, error = %e, "Rejected unknown command");
                TrackerResponse::error("Invalid command")
            }
        };
        send_sealed(writer, &conn.public_key, &response).await?;
    }
}

async fn wait_kicked(kicked: &mut Option<oneshot::Receiver<()>>) {
    match kicked {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

/// Run one command and log it.
async fn dispatch(tracker: &Tracker, conn: &mut Connection, request: TrackerRequest) -> TrackerResponse {
    let command = request.name();
    let response = match execute(tracker, conn, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    debug!(
        conn = %conn.id,
        user = conn.user.as_deref().unwrap_or("-"),
        command,
        status = ?response.status,
        "Handled command"
    );
    response
}

async fn execute(
    tracker: &Tracker,
    conn: &mut Connection,
    request: TrackerRequest,
) -> RegistryResult<TrackerResponse> {
    match request {
        TrackerRequest::Register { username, password } => {
            tracker.presence.register(&username, &password).await?;
            Ok(TrackerResponse::ok("Registration successful"))
        }
        TrackerRequest::Login {
            username,
            password,
            listen_port,
        } => login(tracker, conn, username, password, listen_port).await,
        request => {
            let Some(user) = conn.user.clone() else {
                return Err(RegistryError::Auth(
                    "Invalid command or not logged in".into(),
                ));
            };
            execute_as(tracker, conn, &user, request).await
        }
    }
}

async fn execute_as(
    tracker: &Tracker,
    conn: &mut Connection,
    user: &str,
    request: TrackerRequest,
) -> RegistryResult<TrackerResponse> {
    let presence = &tracker.presence;
    let rooms = &tracker.rooms;

    let response = match request {
        TrackerRequest::Login { .. } | TrackerRequest::Register { .. } => {
            TrackerResponse::error("Invalid command")
        }
        TrackerRequest::Logout => {
            conn.kicked = None;
            conn.user = None;
            presence.logout(user).await;
            rooms.remove_user_from_all_rooms(user).await;
            TrackerResponse::ok("Logged out")
        }
        TrackerRequest::Heartbeat => {
            presence.heartbeat(user).await;
            rooms.update_moderator_heartbeat(user, Utc::now()).await;
            TrackerResponse::ok("Heartbeat received")
        }
        TrackerRequest::ListPeers => TrackerResponse::ok_with(
            "Active peers",
            ResponseData::PeerList {
                peers: presence.list_active_peers(user).await,
            },
        ),
        TrackerRequest::GetPeerAddr { username } => {
            let addr = presence.peer_address(&username).await?;
            TrackerResponse::ok_with("Peer address", ResponseData::PeerAddr(addr))
        }
        TrackerRequest::ListRooms => TrackerResponse::ok_with(
            "Rooms",
            ResponseData::RoomList {
                rooms: rooms.list_rooms().await,
            },
        ),
        TrackerRequest::CreateRoom { room } => {
            rooms.create_room(&room, user).await?;
            TrackerResponse::ok(format!("Room '{}' created", room.trim()))
        }
        TrackerRequest::JoinRoom { room } => {
            rooms.join_room(&room, user).await?;
            TrackerResponse::ok(format!("Joined room '{room}'"))
        }
        TrackerRequest::LeaveRoom { room } => {
            rooms.leave_room(&room, user).await;
            TrackerResponse::ok(format!("Left room '{room}'"))
        }
        TrackerRequest::GetRoomMembers { room } => {
            let online = rooms.online_members(&room, user).await?;
            let mut members = BTreeMap::new();
            for name in online {
                // in-room but no session: the reaper has not caught up yet
                if let Ok(addr) = presence.peer_address(&name).await {
                    members.insert(name, addr);
                }
            }
            TrackerResponse::ok_with("Online members", ResponseData::OnlineMembers { members })
        }
        TrackerRequest::ListMyRooms => TrackerResponse::ok_with(
            "Your rooms",
            ResponseData::MyRooms {
                rooms: rooms.list_my_rooms(user).await,
            },
        ),
        TrackerRequest::ListMembers { room } => {
            let (moderator, members) = rooms.list_members(&room).await?;
            TrackerResponse::ok_with("Room members", ResponseData::Members { moderator, members })
        }
        TrackerRequest::AddMember { room, username } => {
            if !presence.is_registered(&username).await {
                return Err(RegistryError::NotFound(format!(
                    "User '{username}' does not exist"
                )));
            }
            rooms.add_member(&room, &username, user).await?;
            TrackerResponse::ok(format!("Added '{username}' to '{room}'"))
        }
        TrackerRequest::RemoveMember { room, username } => {
            match rooms.remove_member(&room, &username, user).await? {
                Removal::Removed => TrackerResponse::ok(format!("Removed '{username}' from '{room}'")),
                Removal::NotAMember => {
                    TrackerResponse::ok(format!("'{username}' is not a member of '{room}'"))
                }
            }
        }
        TrackerRequest::CloseRoom { room } => {
            rooms.close_room(&room, user).await?;
            TrackerResponse::ok(format!("Room '{room}' closed"))
        }
    };
    Ok(response)
}

async fn login(
    tracker: &Tracker,
    conn: &mut Connection,
    username: String,
    password: String,
    listen_port: u16,
) -> RegistryResult<TrackerResponse> {
    let (handle, kicked) = ConnectionHandle::new(conn.id);
    let username = tracker
        .presence
        .login(LoginRequest {
            username,
            password,
            address: conn.address,
            listen_port,
            public_key: conn.public_key.to_text(),
            connection: handle,
        })
        .await?;

    // A connection carries at most one user. A failed login above leaves
    // the bound one alone; a successful one for someone else releases it.
    conn.kicked = Some(kicked);
    if let Some(previous) = conn.user.replace(username.clone()) {
        if previous != username && tracker.presence.release(&previous, conn.id).await {
            tracker.rooms.remove_user_from_all_rooms(&previous).await;
            info!(user = %previous, conn = %conn.id, "User switched on this connection");
        }
    }
    tracker
        .rooms
        .update_moderator_heartbeat(&username, Utc::now())
        .await;

    Ok(TrackerResponse::ok_with(
        "Login successful",
        ResponseData::LoggedIn { username },
    ))
}

/// Release the bound user, if any. The session and the room cleanup are
/// only touched when the session still belongs to this connection.
async fn disconnect(tracker: &Tracker, conn: &mut Connection) {
    conn.kicked = None;
    let Some(user) = conn.user.take() else {
        return;
    };
    if tracker.presence.release(&user, conn.id).await {
        tracker.rooms.remove_user_from_all_rooms(&user).await;
        info!(user = %user, conn = %conn.id, "User disconnected");
    }
}
