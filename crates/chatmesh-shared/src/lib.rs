//! Types and primitives shared by the tracker and the peers: the sealed-box
//! crypto transport, the framed wire format and the typed protocol.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod wire;

pub use crypto::{KeyPair, PublicKey};
pub use error::{CryptoError, WireError};
pub use protocol::{PeerAddr, PeerMessage, ResponseData, Status, TrackerRequest, TrackerResponse};
pub use wire::{Envelope, Link};
