//! Pending private-chat invitations.
//!
//! Each entry keeps the requester's socket open: the requester is blocked
//! waiting for our answer. The queue is bounded and entries expire after
//! the requester's own wait would have run out.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chatmesh_shared::crypto::PublicKey;
use chatmesh_shared::wire::Link;

pub struct Invitation {
    pub from_user: String,
    pub public_key: PublicKey,
    pub link: Link,
    pub received_at: Instant,
}

impl Invitation {
    pub fn new(from_user: String, public_key: PublicKey, link: Link) -> Self {
        Self {
            from_user,
            public_key,
            link,
            received_at: Instant::now(),
        }
    }
}

impl std::fmt::Debug for Invitation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invitation")
            .field("from_user", &self.from_user)
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct InvitationQueue {
    entries: VecDeque<Invitation>,
    capacity: usize,
    ttl: Duration,
}

impl InvitationQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    /// Queue an invitation, or hand it back if the queue is full.
    pub fn push(&mut self, invitation: Invitation) -> Result<(), Invitation> {
        if self.entries.len() >= self.capacity {
            return Err(invitation);
        }
        self.entries.push_back(invitation);
        Ok(())
    }

    /// Remove and return every invitation older than the TTL at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Invitation> {
        let ttl = self.ttl;
        let (expired, live): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|inv| now.saturating_duration_since(inv.received_at) > ttl);
        self.entries = live.into();
        expired
    }

    pub fn senders(&self) -> Vec<String> {
        self.entries.iter().map(|inv| inv.from_user.clone()).collect()
    }

    pub fn take(&mut self, index: usize) -> Option<Invitation> {
        self.entries.remove(index)
    }

    /// Put an invitation back where it was taken from.
    pub fn restore(&mut self, index: usize, invitation: Invitation) {
        let index = index.min(self.entries.len());
        self.entries.insert(index, invitation);
    }

    pub fn drain(&mut self) -> Vec<Invitation> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chatmesh_shared::crypto::KeyPair;

    use super::*;

    fn invitation(from: &str) -> Invitation {
        let (ours, _theirs) = tokio::io::duplex(64);
        Invitation::new(from.into(), KeyPair::generate().public_key(), Link::new(ours))
    }

    #[tokio::test]
    async fn test_bounded() {
        let mut queue = InvitationQueue::new(2, Duration::from_secs(60));
        queue.push(invitation("a")).unwrap();
        queue.push(invitation("b")).unwrap();
        let rejected = queue.push(invitation("c")).unwrap_err();
        assert_eq!(rejected.from_user, "c");
        assert_eq!(queue.senders(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_take_and_restore_keeps_position() {
        let mut queue = InvitationQueue::new(8, Duration::from_secs(60));
        for name in ["a", "b", "c"] {
            queue.push(invitation(name)).unwrap();
        }
        let taken = queue.take(1).unwrap();
        assert_eq!(taken.from_user, "b");
        assert_eq!(queue.senders(), vec!["a", "c"]);

        queue.restore(1, taken);
        assert_eq!(queue.senders(), vec!["a", "b", "c"]);
        assert!(queue.take(7).is_none());
    }

    #[tokio::test]
    async fn test_expire() {
        let mut queue = InvitationQueue::new(8, Duration::from_secs(60));
        queue.push(invitation("old")).unwrap();
        let mut fresh = invitation("fresh");
        fresh.received_at += Duration::from_secs(30);
        queue.push(fresh).unwrap();

        let now = Instant::now() + Duration::from_secs(61);
        let expired = queue.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].from_user, "old");
        assert_eq!(queue.senders(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_drain_empties() {
        let mut queue = InvitationQueue::new(8, Duration::from_secs(60));
        queue.push(invitation("a")).unwrap();
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
