//! # chatmesh-peer
//!
//! One user's side of chatmesh: a tracker client plus a listening socket
//! for direct, end-to-end sealed conversations with other peers.
//!
//! - **Tracker client** ([`tracker_client`]): register, log in, heartbeat,
//!   look up peers and rooms
//! - **Private chat** ([`chat`]): request, queue, accept or refuse, then a
//!   duplex chat over one direct connection
//! - **Rooms** ([`group`]): a full mesh of direct connections to every
//!   online member of one room
//! - **Acceptor** ([`acceptor`]): classifies inbound connections by their
//!   first envelope
//!
//! A peer is in at most one conversation at a time; see [`SessionState`].

pub mod acceptor;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod invitations;
pub mod node;
pub mod session;
pub mod tracker_client;

pub use chat::Answer;
pub use config::PeerConfig;
pub use error::PeerError;
pub use events::{ChatEndReason, EventReceiver, PeerEvent};
pub use node::PeerNode;
pub use session::SessionState;
