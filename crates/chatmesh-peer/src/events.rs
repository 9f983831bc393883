//! Notifications from peer workers to whoever drives the node.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEndReason {
    LocalExit,
    RemoteExit,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    InvitationReceived { from: String },
    InvitationExpired { from: String },
    ChatStarted { peer: String },
    ChatMessage { from: String, content: String },
    ChatEnded { peer: String, reason: ChatEndReason },
    GroupMemberJoined { user: String },
    GroupMemberLeft { user: String },
    GroupMessage { from: String, content: String },
    TrackerLost { reason: String },
}

pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<PeerEvent>);

impl EventSender {
    pub fn emit(&self, event: PeerEvent) {
        if let Err(e) = self.0.send(event) {
            tracing::debug!(event = ?e.0, "Event dropped, nobody is listening");
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}
