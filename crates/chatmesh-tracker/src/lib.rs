//! # chatmesh-tracker
//!
//! Rendezvous and discovery server for chatmesh peers.
//!
//! - **Session gateway** ([`gateway`]): one task per TCP connection, key
//!   exchange then sealed command/response frames
//! - **Presence registry** ([`presence`]): accounts and online sessions
//! - **Room registry** ([`rooms`]): rooms, members, moderators, in-room sets
//! - **Reapers** ([`reaper`]): evict silent users, close rooms whose
//!   moderator went silent
//!
//! The tracker never relays chat traffic; peers dial each other directly.

pub mod config;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod reaper;
pub mod rooms;
pub mod server;

pub use config::TrackerConfig;
pub use error::{RegistryError, RegistryResult};
pub use server::{serve, start, RunningTracker, Tracker};
