//! Private chat negotiation and the duplex chat loop.
//!
//! ```text
//! requester -> invitee   Envelope{ chat_request{from_user} }
//! invitee -> requester   seal(busy) | seal(accept) | seal(refuse)
//! both ways              seal(message{content}) ... seal(exit)
//! ```
//!
//! A request that finds us idle is queued until the user answers it. One
//! that finds us busy is answered `busy` on the spot and never queued.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chatmesh_shared::crypto::PublicKey;
use chatmesh_shared::error::WireError;
use chatmesh_shared::protocol::PeerMessage;
use chatmesh_shared::wire::{
    recv_sealed, recv_sealed_timeout, send_sealed_timeout, write_json, Envelope, Link,
};

use crate::error::PeerError;
use crate::events::{ChatEndReason, PeerEvent};
use crate::invitations::Invitation;
use crate::node::PeerNode;

static NEXT_CHAT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum Outgoing {
    Text(String),
    Exit,
}

/// Handle on the running chat task.
pub(crate) struct ActiveChat {
    id: u64,
    peer: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

/// The user's answer to a pending invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Refuse,
}

impl FromStr for Answer {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "a" | "yes" | "y" => Ok(Answer::Accept),
            "refuse" | "r" | "no" | "n" => Ok(Answer::Refuse),
            other => Err(PeerError::InvalidSelection(format!(
                "Expected accept or refuse, got '{other}'"
            ))),
        }
    }
}

async fn reply_and_close(mut link: Link, key: &PublicKey, message: &PeerMessage, limit: Duration) {
    if let Err(e) = send_sealed_timeout(&mut link.writer, key, message, limit).await {
        debug!(error = %e, "Could not deliver reply");
    }
    link.close().await;
}

impl PeerNode {
    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Ask `target` for a private chat and wait for the answer. On `accept`
    /// the chat is running when this returns.
    pub async fn request_chat(self: &Arc<Self>, target: &str) -> Result<(), PeerError> {
        let me = self.require_user()?;
        if me == target {
            return Err(PeerError::InvalidSelection("You cannot chat with yourself".into()));
        }
        if !self.session.is_idle() {
            return Err(PeerError::InvalidState(format!(
                "Cannot start a chat while {}",
                self.session.state()
            )));
        }

        let addr = self.tracker.peer_addr(target).await?;
        let key = PublicKey::from_text(&addr.public_key)?;
        let stream = tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(SocketAddr::new(addr.ip, addr.port)),
        )
        .await
        .map_err(|_| WireError::Timeout)??;

        self.negotiate_chat(&me, target, key, Link::from_tcp(stream)).await
    }

    async fn negotiate_chat(
        self: &Arc<Self>,
        me: &str,
        target: &str,
        key: PublicKey,
        mut link: Link,
    ) -> Result<(), PeerError> {
        let request = PeerMessage::ChatRequest {
            from_user: me.to_string(),
        };
        let envelope = Envelope::seal(&self.keys, &key, &request)?;
        tokio::time::timeout(self.config.write_timeout, write_json(&mut link.writer, &envelope))
            .await
            .map_err(|_| WireError::Timeout)??;
        info!(peer = %target, "Chat request sent, waiting for an answer");

        let answer = recv_sealed_timeout::<_, PeerMessage>(
            &mut link.reader,
            &self.keys,
            self.config.chat_request_timeout,
        )
        .await;

        match answer {
            Ok(PeerMessage::Accept) => {
                if let Err(e) = self.session.begin_chat(target) {
                    reply_and_close(link, &key, &PeerMessage::Exit, self.config.write_timeout).await;
                    return Err(e);
                }
                self.start_chat(target.to_string(), key, link).await;
                Ok(())
            }
            Ok(PeerMessage::Busy) => {
                link.close().await;
                Err(PeerError::Busy(target.to_string()))
            }
            other => {
                if let Err(e) = other {
                    debug!(peer = %target, error = %e, "No usable answer to chat request");
                }
                link.close().await;
                Err(PeerError::Refused(target.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub(crate) async fn on_chat_request(&self, from_user: String, key: PublicKey, link: Link) {
        if !self.session.is_idle() {
            debug!(from = %from_user, state = %self.session.state(), "Busy, turning chat request away");
            reply_and_close(link, &key, &PeerMessage::Busy, self.config.write_timeout).await;
            return;
        }

        self.expire_invitations().await;
        let queued = self
            .invitations
            .lock()
            .await
            .push(Invitation::new(from_user.clone(), key, link));
        if let Err(invitation) = queued {
            warn!(from = %from_user, "Invitation queue full");
            reply_and_close(
                invitation.link,
                &invitation.public_key,
                &PeerMessage::Busy,
                self.config.write_timeout,
            )
            .await;
            return;
        }

        info!(from = %from_user, "Chat invitation received");
        self.events.emit(PeerEvent::InvitationReceived { from: from_user });
    }

    /// Senders of the queued invitations, oldest first.
    pub async fn pending_invitations(&self) -> Vec<String> {
        self.expire_invitations().await;
        self.invitations.lock().await.senders()
    }

    /// Answer the invitation at `index` with a typed-in `answer`. An answer
    /// that is neither accept nor refuse leaves the invitation where it was.
    pub async fn respond_to_invitation(self: &Arc<Self>, index: usize, answer: &str) -> Result<String, PeerError> {
        self.expire_invitations().await;
        let mut queue = self.invitations.lock().await;
        let invitation = queue
            .take(index)
            .ok_or_else(|| PeerError::InvalidSelection(format!("No invitation #{}", index + 1)))?;

        let answer = match answer.parse::<Answer>() {
            Ok(answer) => answer,
            Err(e) => {
                queue.restore(index, invitation);
                return Err(e);
            }
        };
        if answer == Answer::Accept {
            if let Err(e) = self.session.begin_chat(&invitation.from_user) {
                queue.restore(index, invitation);
                return Err(e);
            }
        }
        drop(queue);

        let Invitation {
            from_user,
            public_key,
            mut link,
            ..
        } = invitation;

        match answer {
            Answer::Refuse => {
                reply_and_close(link, &public_key, &PeerMessage::Refuse, self.config.write_timeout).await;
                info!(from = %from_user, "Invitation refused");
                Ok(from_user)
            }
            Answer::Accept => {
                let limit = self.config.write_timeout;
                if let Err(e) = send_sealed_timeout(&mut link.writer, &public_key, &PeerMessage::Accept, limit).await {
                    self.session.end_chat(&from_user);
                    link.close().await;
                    return Err(e.into());
                }
                self.start_chat(from_user.clone(), public_key, link).await;
                Ok(from_user)
            }
        }
    }

    pub async fn accept_invitation(self: &Arc<Self>, index: usize) -> Result<String, PeerError> {
        self.respond_to_invitation(index, "accept").await
    }

    pub async fn refuse_invitation(self: &Arc<Self>, index: usize) -> Result<String, PeerError> {
        self.respond_to_invitation(index, "refuse").await
    }

    async fn expire_invitations(&self) {
        let expired = self.invitations.lock().await.expire(Instant::now());
        for invitation in expired {
            debug!(from = %invitation.from_user, "Invitation expired");
            self.events.emit(PeerEvent::InvitationExpired {
                from: invitation.from_user,
            });
            invitation.link.close().await;
        }
    }

    /// Answer `refuse` to everything still queued.
    pub(crate) async fn refuse_all_invitations(&self) {
        let pending = self.invitations.lock().await.drain();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Refusing queued invitations");
        let limit = self.config.write_timeout;
        join_all(pending.into_iter().map(|inv| async move {
            reply_and_close(inv.link, &inv.public_key, &PeerMessage::Refuse, limit).await
        }))
        .await;
    }

    // -----------------------------------------------------------------------
    // The chat itself
    // -----------------------------------------------------------------------

    /// Spawn the chat task. The session must already be `Chatting{peer}`.
    async fn start_chat(self: &Arc<Self>, peer: String, key: PublicKey, link: Link) {
        let id = NEXT_CHAT_ID.fetch_add(1, Ordering::Relaxed);
        let (outbox, inbox) = mpsc::unbounded_channel();

        info!(peer = %peer, "Chat started");
        self.events.emit(PeerEvent::ChatStarted { peer: peer.clone() });

        // Registered under the lock so the task cannot finish before its
        // handle is stored.
        let mut chat = self.chat.lock().await;
        let task = tokio::spawn(run_chat(self.clone(), id, peer.clone(), key, link, inbox));
        *chat = Some(ActiveChat {
            id,
            peer,
            outbox,
            task,
        });
    }

    pub async fn send_chat_message(&self, content: &str) -> Result<(), PeerError> {
        let chat = self.chat.lock().await;
        let active = chat
            .as_ref()
            .ok_or_else(|| PeerError::InvalidState("You are not in a chat".into()))?;
        active
            .outbox
            .send(Outgoing::Text(content.to_string()))
            .map_err(|_| PeerError::InvalidState(format!("The chat with {} has ended", active.peer)))
    }

    /// Send `exit` and wait until the chat has been torn down.
    pub async fn end_chat(&self) -> Result<(), PeerError> {
        let active = self
            .chat
            .lock()
            .await
            .take()
            .ok_or_else(|| PeerError::InvalidState("You are not in a chat".into()))?;
        let _ = active.outbox.send(Outgoing::Exit);
        if let Err(e) = active.task.await {
            warn!(error = %e, "Chat task failed");
        }
        Ok(())
    }

    async fn finish_chat(&self, id: u64, peer: &str, reason: ChatEndReason) {
        {
            let mut chat = self.chat.lock().await;
            if chat.as_ref().is_some_and(|c| c.id == id) {
                *chat = None;
            }
        }
        self.session.end_chat(peer);
        self.refuse_all_invitations().await;

        info!(peer = %peer, ?reason, "Chat ended");
        self.events.emit(PeerEvent::ChatEnded {
            peer: peer.to_string(),
            reason,
        });
    }
}

async fn run_chat(
    node: Arc<PeerNode>,
    id: u64,
    peer: String,
    key: PublicKey,
    link: Link,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    let (mut reader, mut writer) = link.into_parts();
    let limit = node.config.write_timeout;

    // Socket reads get their own task; they report back over a channel.
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let keys = node.keys.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let received = recv_sealed::<_, PeerMessage>(&mut reader, &keys).await;
            let failed = received.is_err();
            if inbound_tx.send(received).is_err() || failed {
                break;
            }
        }
    });

    let reason = loop {
        tokio::select! {
            outgoing = outbox.recv() => match outgoing {
                Some(Outgoing::Text(content)) => {
                    let message = PeerMessage::Message { content };
                    if let Err(e) = send_sealed_timeout(&mut writer, &key, &message, limit).await {
                        warn!(peer = %peer, error = %e, "Could not send chat message");
                        break ChatEndReason::ConnectionLost;
                    }
                }
                Some(Outgoing::Exit) | None => {
                    if let Err(e) = send_sealed_timeout(&mut writer, &key, &PeerMessage::Exit, limit).await {
                        debug!(peer = %peer, error = %e, "Could not send exit");
                    }
                    break ChatEndReason::LocalExit;
                }
            },
            received = inbound.recv() => match received {
                Some(Ok(PeerMessage::Message { content })) => {
                    node.events.emit(PeerEvent::ChatMessage { from: peer.clone(), content });
                }
                Some(Ok(PeerMessage::Exit)) => break ChatEndReason::RemoteExit,
                Some(Ok(other)) => debug!(peer = %peer, ?other, "Ignoring message in private chat"),
                Some(Err(e)) => {
                    if !e.is_disconnect() {
                        warn!(peer = %peer, error = %e, "Chat connection failed");
                    }
                    break ChatEndReason::ConnectionLost;
                }
                None => break ChatEndReason::ConnectionLost,
            },
        }
    };

    reader_task.abort();
    let _ = tokio::time::timeout(limit, writer.shutdown()).await;
    node.finish_chat(id, &peer, reason).await;
}
