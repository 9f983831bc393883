//! The local user's session: who is logged in and what they are doing.
//!
//! A peer is idle, in a private chat, joining a room or in a room, never
//! two at once. Every transition checks the current state under one lock.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::PeerError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Chatting {
        peer: String,
    },
    JoiningRoom {
        room: String,
    },
    InRoom {
        room: String,
    },
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Chatting { peer } => write!(f, "chatting with {peer}"),
            SessionState::JoiningRoom { room } => write!(f, "joining room {room}"),
            SessionState::InRoom { room } => write!(f, "in room {room}"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    user: Option<String>,
    state: SessionState,
}

#[derive(Debug, Default)]
pub struct LocalSession {
    inner: Mutex<Inner>,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user(&self) -> Option<String> {
        self.lock().user.clone()
    }

    pub fn set_user(&self, user: Option<String>) {
        self.lock().user = user;
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().state == SessionState::Idle
    }

    pub fn chat_peer(&self) -> Option<String> {
        match &self.lock().state {
            SessionState::Chatting { peer } => Some(peer.clone()),
            _ => None,
        }
    }

    /// The room we are fully joined to. `JoiningRoom` does not count.
    pub fn current_room(&self) -> Option<String> {
        match &self.lock().state {
            SessionState::InRoom { room } => Some(room.clone()),
            _ => None,
        }
    }

    fn transition(
        &self,
        action: &str,
        next: SessionState,
        allowed: impl FnOnce(&SessionState) -> bool,
    ) -> Result<(), PeerError> {
        let mut inner = self.lock();
        if !allowed(&inner.state) {
            return Err(PeerError::InvalidState(format!(
                "Cannot {action} while {}",
                inner.state
            )));
        }
        inner.state = next;
        Ok(())
    }

    pub fn begin_chat(&self, peer: &str) -> Result<(), PeerError> {
        self.transition(
            "start a chat",
            SessionState::Chatting { peer: peer.into() },
            |s| *s == SessionState::Idle,
        )
    }

    /// Back to idle if we were chatting with `peer`.
    pub fn end_chat(&self, peer: &str) -> bool {
        self.transition("end the chat", SessionState::Idle, |s| {
            matches!(s, SessionState::Chatting { peer: p } if p == peer)
        })
        .is_ok()
    }

    pub fn begin_join(&self, room: &str) -> Result<(), PeerError> {
        self.transition(
            "join a room",
            SessionState::JoiningRoom { room: room.into() },
            |s| *s == SessionState::Idle,
        )
    }

    pub fn complete_join(&self, room: &str) -> Result<(), PeerError> {
        self.transition(
            "enter the room",
            SessionState::InRoom { room: room.into() },
            |s| matches!(s, SessionState::JoiningRoom { room: r } if r == room),
        )
    }

    pub fn abort_join(&self, room: &str) -> bool {
        self.transition("abort the join", SessionState::Idle, |s| {
            matches!(s, SessionState::JoiningRoom { room: r } if r == room)
        })
        .is_ok()
    }

    pub fn leave_room(&self, room: &str) -> bool {
        self.transition("leave the room", SessionState::Idle, |s| {
            matches!(s, SessionState::InRoom { room: r } if r == room)
        })
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_mode_at_a_time() {
        let session = LocalSession::new();
        session.begin_chat("bob").unwrap();
        assert!(!session.is_idle());
        assert!(session.begin_join("x").is_err());
        assert!(session.begin_chat("carol").is_err());

        assert!(!session.end_chat("carol"));
        assert!(session.end_chat("bob"));
        assert!(session.is_idle());
    }

    #[test]
    fn test_room_lifecycle() {
        let session = LocalSession::new();
        session.begin_join("x").unwrap();
        assert_eq!(session.current_room(), None);
        assert!(session.complete_join("y").is_err());

        session.complete_join("x").unwrap();
        assert_eq!(session.current_room().as_deref(), Some("x"));
        assert!(session.begin_chat("bob").is_err());

        assert!(!session.leave_room("y"));
        assert!(session.leave_room("x"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_abort_join() {
        let session = LocalSession::new();
        session.begin_join("x").unwrap();
        assert!(session.abort_join("x"));
        assert!(session.is_idle());
        assert!(!session.abort_join("x"));
    }

    #[test]
    fn test_error_names_current_state() {
        let session = LocalSession::new();
        session.begin_chat("bob").unwrap();
        let err = session.begin_join("x").unwrap_err();
        assert_eq!(err.to_string(), "Cannot join a room while chatting with bob");
    }
}
