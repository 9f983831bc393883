//! Group chat: a direct connection to every other online member of the
//! room we are in.
//!
//! ```text
//! joiner -> member   Envelope{ group_chat_join{room_name, from_user} }
//! member -> joiner   seal(group_join_accept)
//! either way         seal(group_message{content}) ... seal(group_leave)
//! ```
//!
//! There is no room key. Every message is sealed separately for each member.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatmesh_shared::crypto::{KeyPair, PublicKey};
use chatmesh_shared::error::WireError;
use chatmesh_shared::protocol::{PeerAddr, PeerMessage};
use chatmesh_shared::wire::{
    recv_sealed, recv_sealed_timeout, send_sealed_timeout, write_json, Envelope, FrameReader,
    FrameWriter, Link,
};

use crate::error::PeerError;
use crate::events::{EventSender, PeerEvent};
use crate::node::PeerNode;

struct Member {
    id: u64,
    public_key: PublicKey,
    writer: Arc<Mutex<FrameWriter>>,
    receiver: JoinHandle<()>,
}

/// The connection table of the room we are in, keyed by member name.
///
/// The table lock only covers reading and changing the map. Writes go
/// through each member's own writer lock and receivers block on their
/// sockets without holding anything. Every write is bounded by
/// `write_timeout`; a member that runs into it counts as unreachable.
pub struct GroupSession {
    keys: Arc<KeyPair>,
    events: EventSender,
    write_timeout: Duration,
    members: Mutex<HashMap<String, Member>>,
    next_id: AtomicU64,
}

impl GroupSession {
    pub fn new(keys: Arc<KeyPair>, events: EventSender, write_timeout: Duration) -> Self {
        Self {
            keys,
            events,
            write_timeout,
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an established connection and start its receiver. An older
    /// connection under the same name is dropped.
    pub async fn add_member(self: &Arc<Self>, name: String, public_key: PublicKey, link: Link) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = link.into_parts();

        let mut members = self.members.lock().await;
        let receiver = tokio::spawn(self.clone().receive(name.clone(), id, reader));
        let member = Member {
            id,
            public_key,
            writer: Arc::new(Mutex::new(writer)),
            receiver,
        };
        if let Some(previous) = members.insert(name.clone(), member) {
            previous.receiver.abort();
        }
        drop(members);

        info!(member = %name, "Group member connected");
        self.events.emit(PeerEvent::GroupMemberJoined { user: name });
    }

    async fn receive(self: Arc<Self>, name: String, id: u64, mut reader: FrameReader) {
        loop {
            match recv_sealed::<_, PeerMessage>(&mut reader, &self.keys).await {
                Ok(PeerMessage::GroupMessage { content }) => {
                    self.events.emit(PeerEvent::GroupMessage {
                        from: name.clone(),
                        content,
                    });
                }
                Ok(PeerMessage::GroupLeave) => {
                    debug!(member = %name, "Member left the room");
                    break;
                }
                Ok(other) => debug!(member = %name, ?other, "Ignoring message in group chat"),
                Err(e) => {
                    if !e.is_disconnect() {
                        warn!(member = %name, error = %e, "Group connection failed");
                    }
                    break;
                }
            }
        }

        if self.remove_entry(&name, id).await.is_some() {
            self.events.emit(PeerEvent::GroupMemberLeft { user: name });
        }
    }

    /// Remove `name` only if the entry is still the connection `id`.
    async fn remove_entry(&self, name: &str, id: u64) -> Option<Member> {
        let mut members = self.members.lock().await;
        if members.get(name).is_some_and(|m| m.id == id) {
            members.remove(name)
        } else {
            None
        }
    }

    /// Seal `message` for every member and send it. Members whose write
    /// fails are dropped; the rest still get it. Returns how many did.
    pub async fn broadcast(&self, message: &PeerMessage) -> usize {
        let targets: Vec<(String, u64, PublicKey, Arc<Mutex<FrameWriter>>)> = self
            .members
            .lock()
            .await
            .iter()
            .map(|(name, m)| (name.clone(), m.id, m.public_key, m.writer.clone()))
            .collect();

        let limit = self.write_timeout;
        let sends = targets.iter().map(|(name, id, key, writer)| async move {
            let mut writer = writer.lock().await;
            let result = send_sealed_timeout(&mut *writer, key, message, limit).await;
            (name, *id, result)
        });

        let mut delivered = 0;
        for (name, id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(member = %name, error = %e, "Dropping unreachable group member");
                    if let Some(member) = self.remove_entry(name, id).await {
                        member.receiver.abort();
                        self.events.emit(PeerEvent::GroupMemberLeft { user: name.clone() });
                    }
                }
            }
        }
        delivered
    }

    /// Say goodbye to every member and close every connection.
    pub async fn leave_all(&self) {
        let members: Vec<(String, Member)> = self.members.lock().await.drain().collect();

        let limit = self.write_timeout;
        let farewells = members.into_iter().map(|(name, member)| async move {
            member.receiver.abort();
            let mut writer = member.writer.lock().await;
            let farewell = PeerMessage::GroupLeave;
            if let Err(e) = send_sealed_timeout(&mut *writer, &member.public_key, &farewell, limit).await {
                debug!(member = %name, error = %e, "Could not send group_leave");
            }
            let _ = tokio::time::timeout(limit, writer.shutdown()).await;
        });
        join_all(farewells).await;
    }

    pub async fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }
}

// ---------------------------------------------------------------------------
// Room operations on the node
// ---------------------------------------------------------------------------

impl PeerNode {
    /// Join `room` through the tracker, then connect to everyone already in
    /// it. Returns how many members we reached; unreachable ones are skipped.
    pub async fn join_room(&self, room: &str) -> Result<usize, PeerError> {
        let me = self.require_user()?;
        self.session.begin_join(room)?;

        if let Err(e) = self.tracker.join_room(room).await {
            self.session.abort_join(room);
            return Err(e);
        }
        self.session.complete_join(room)?;

        let members = match self.tracker.room_members(room).await {
            Ok(members) => members,
            Err(e) => {
                warn!(room = %room, error = %e, "Could not fetch room members");
                Default::default()
            }
        };

        let dials = members
            .into_iter()
            .map(|(name, addr)| self.connect_member(room, &me, name, addr));
        let reached = join_all(dials).await.into_iter().filter(|ok| *ok).count();

        info!(room = %room, reached, "Joined room");
        Ok(reached)
    }

    async fn connect_member(&self, room: &str, me: &str, name: String, addr: PeerAddr) -> bool {
        match self.dial_member(room, me, &name, addr).await {
            Ok(()) => true,
            Err(e) => {
                warn!(room = %room, member = %name, error = %e, "Could not reach room member");
                false
            }
        }
    }

    async fn dial_member(&self, room: &str, me: &str, name: &str, addr: PeerAddr) -> Result<(), PeerError> {
        let key = PublicKey::from_text(&addr.public_key)?;
        let stream = tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(SocketAddr::new(addr.ip, addr.port)),
        )
        .await
        .map_err(|_| WireError::Timeout)??;
        let mut link = Link::from_tcp(stream);

        let join = PeerMessage::GroupChatJoin {
            room_name: room.into(),
            from_user: me.into(),
        };
        let envelope = Envelope::seal(&self.keys, &key, &join)?;
        tokio::time::timeout(self.config.write_timeout, write_json(&mut link.writer, &envelope))
            .await
            .map_err(|_| WireError::Timeout)??;

        let answer = recv_sealed_timeout::<_, PeerMessage>(
            &mut link.reader,
            &self.keys,
            self.config.group_join_timeout,
        )
        .await?;
        match answer {
            PeerMessage::GroupJoinAccept => {
                self.group.add_member(name.to_string(), key, link).await;
                Ok(())
            }
            _ => {
                link.close().await;
                Err(PeerError::Refused(name.to_string()))
            }
        }
    }

    /// Inbound `group_chat_join`. Only accepted for the room we are in.
    pub(crate) async fn on_group_join(&self, room: String, from_user: String, key: PublicKey, mut link: Link) {
        if self.session.current_room().as_deref() != Some(room.as_str()) {
            debug!(room = %room, from = %from_user, "Rejecting join for a room we are not in");
            link.close().await;
            return;
        }

        let accept = PeerMessage::GroupJoinAccept;
        if let Err(e) = send_sealed_timeout(&mut link.writer, &key, &accept, self.config.write_timeout).await {
            debug!(from = %from_user, error = %e, "Joiner went away");
            return;
        }
        self.group.add_member(from_user, key, link).await;
    }

    pub async fn send_group_message(&self, content: &str) -> Result<usize, PeerError> {
        if self.session.current_room().is_none() {
            return Err(PeerError::InvalidState("You are not in a room".into()));
        }
        let message = PeerMessage::GroupMessage {
            content: content.to_string(),
        };
        Ok(self.group.broadcast(&message).await)
    }

    /// Leave the current room. Returns `false` when we were not in one.
    pub async fn leave_room(&self) -> bool {
        let Some(room) = self.session.current_room() else {
            return false;
        };
        // Idle first, so no new member sneaks in while we hang up.
        self.session.leave_room(&room);
        self.group.leave_all().await;

        if let Err(e) = self.tracker.leave_room(&room).await {
            warn!(room = %room, error = %e, "Tracker did not take our leave");
        }
        info!(room = %room, "Left room");
        true
    }

    pub async fn group_members(&self) -> Vec<String> {
        self.group.member_names().await
    }
}
