//! Inbound direct connections.
//!
//! The first frame on every accepted socket is a plaintext [`Envelope`]
//! carrying the sender's key and a sealed [`PeerMessage`]. It decides what
//! the socket becomes: a chat invitation or a room member connection.
//! Anything else is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use chatmesh_shared::protocol::PeerMessage;
use chatmesh_shared::wire::{read_json, Envelope, Link};

use crate::node::PeerNode;

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn run_acceptor(node: Arc<PeerNode>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    node.handle_inbound(Link::from_tcp(stream), remote).await;
                });
            }
            Err(e) => warn!(error = %e, "Failed to accept peer connection"),
        }
    }
}

impl PeerNode {
    /// Classify a freshly accepted connection by its first envelope.
    pub async fn handle_inbound(&self, mut link: Link, remote: SocketAddr) {
        let envelope: Envelope =
            match tokio::time::timeout(FIRST_FRAME_TIMEOUT, read_json(&mut link.reader)).await {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(e)) => {
                    debug!(remote = %remote, error = %e, "Unreadable first frame");
                    link.close().await;
                    return;
                }
                Err(_) => {
                    debug!(remote = %remote, "No first frame in time");
                    link.close().await;
                    return;
                }
            };

        let (sender_key, message) = match envelope.open::<PeerMessage>(&self.keys) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(remote = %remote, error = %e, "Could not open envelope");
                link.close().await;
                return;
            }
        };

        match message {
            PeerMessage::ChatRequest { from_user } => {
                self.on_chat_request(from_user, sender_key, link).await;
            }
            PeerMessage::GroupChatJoin {
                room_name,
                from_user,
            } => {
                self.on_group_join(room_name, from_user, sender_key, link).await;
            }
            other => {
                debug!(remote = %remote, ?other, "Unexpected first message");
                link.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chatmesh_shared::crypto::KeyPair;
    use chatmesh_shared::wire::{read_frame, recv_sealed, write_frame, write_json, KeyExchange};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::config::PeerConfig;
    use crate::error::PeerError;
    use crate::events::{EventReceiver, PeerEvent};
    use crate::tracker_client::TrackerClient;

    /// A node whose tracker is a silent fake on a duplex pipe.
    async fn test_node() -> (Arc<PeerNode>, EventReceiver, JoinHandle<()>) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let fake = tokio::spawn(async move {
            let mut link = Link::new(theirs);
            let keys = KeyPair::generate();
            let hello = KeyExchange {
                public_key: keys.public_key().to_text(),
            };
            write_json(&mut link.writer, &hello).await.unwrap();
            let _: KeyExchange = read_json(&mut link.reader).await.unwrap();
            // hold the connection open until the test ends
            let _ = read_frame(&mut link.reader).await;
        });

        let keys = Arc::new(KeyPair::generate());
        let tracker = TrackerClient::handshake(Link::new(ours), keys.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let (node, events) = PeerNode::new(PeerConfig::default(), keys, Arc::new(tracker), 0);
        (node, events, fake)
    }

    /// Connect to `node` with `message` as the first envelope and let the
    /// node classify it.
    async fn dial(node: &Arc<PeerNode>, sender: &KeyPair, message: &PeerMessage) -> Link {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut link = Link::new(ours);
        let envelope = Envelope::seal(sender, &node.keys().public_key(), message).unwrap();
        write_json(&mut link.writer, &envelope).await.unwrap();

        node.handle_inbound(Link::new(theirs), "127.0.0.1:9".parse().unwrap())
            .await;
        link
    }

    fn chat_request(from: &str) -> PeerMessage {
        PeerMessage::ChatRequest {
            from_user: from.into(),
        }
    }

    #[tokio::test]
    async fn test_busy_while_chatting_and_nothing_queued() {
        let (node, _events, _fake) = test_node().await;
        node.session.begin_chat("alice").unwrap();

        let bob = KeyPair::generate();
        let mut link = dial(&node, &bob, &chat_request("bob")).await;

        let reply: PeerMessage = recv_sealed(&mut link.reader, &bob).await.unwrap();
        assert_eq!(reply, PeerMessage::Busy);
        assert!(node.pending_invitations().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_request_is_queued() {
        let (node, mut events, _fake) = test_node().await;
        let _link = dial(&node, &KeyPair::generate(), &chat_request("bob")).await;

        assert_eq!(node.pending_invitations().await, vec!["bob"]);
        assert_eq!(
            events.recv().await,
            Some(PeerEvent::InvitationReceived { from: "bob".into() })
        );
    }

    #[tokio::test]
    async fn test_invalid_answer_requeues() {
        let (node, _events, _fake) = test_node().await;
        let mut links = Vec::new();
        for name in ["bob", "carol"] {
            links.push(dial(&node, &KeyPair::generate(), &chat_request(name)).await);
        }

        let err = node.respond_to_invitation(0, "perhaps").await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidSelection(_)));
        assert_eq!(node.pending_invitations().await, vec!["bob", "carol"]);

        assert!(matches!(
            node.respond_to_invitation(5, "accept").await,
            Err(PeerError::InvalidSelection(_))
        ));
    }

    #[tokio::test]
    async fn test_refuse_answers_requester() {
        let (node, _events, _fake) = test_node().await;
        let bob = KeyPair::generate();
        let mut link = dial(&node, &bob, &chat_request("bob")).await;

        assert_eq!(node.refuse_invitation(0).await.unwrap(), "bob");
        let reply: PeerMessage = recv_sealed(&mut link.reader, &bob).await.unwrap();
        assert_eq!(reply, PeerMessage::Refuse);
        assert!(node.pending_invitations().await.is_empty());
        assert!(node.session.is_idle());
    }

    #[tokio::test]
    async fn test_group_join_for_other_room_is_closed() {
        let (node, _events, _fake) = test_node().await;
        node.session.begin_join("x").unwrap();
        node.session.complete_join("x").unwrap();

        let dave = KeyPair::generate();
        let join = PeerMessage::GroupChatJoin {
            room_name: "y".into(),
            from_user: "dave".into(),
        };
        let mut link = dial(&node, &dave, &join).await;

        assert!(recv_sealed::<_, PeerMessage>(&mut link.reader, &dave).await.is_err());
        assert!(node.group_members().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_join_for_current_room_is_accepted() {
        let (node, _events, _fake) = test_node().await;
        node.session.begin_join("x").unwrap();
        node.session.complete_join("x").unwrap();

        let dave = KeyPair::generate();
        let join = PeerMessage::GroupChatJoin {
            room_name: "x".into(),
            from_user: "dave".into(),
        };
        let mut link = dial(&node, &dave, &join).await;

        let reply: PeerMessage = recv_sealed(&mut link.reader, &dave).await.unwrap();
        assert_eq!(reply, PeerMessage::GroupJoinAccept);
        assert_eq!(node.group_members().await, vec!["dave"]);
    }

    #[tokio::test]
    async fn test_garbage_first_frame_is_closed() {
        let (node, _events, _fake) = test_node().await;
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut link = Link::new(ours);
        write_frame(&mut link.writer, br#"{"hello":1}"#).await.unwrap();

        node.handle_inbound(Link::new(theirs), "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(read_frame(&mut link.reader).await.is_err());
    }
}
