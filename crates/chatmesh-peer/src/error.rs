use chatmesh_shared::error::{CryptoError, WireError};
use thiserror::Error;

/// Everything a peer operation can fail with. The `Display` text is what
/// the user gets to see.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The tracker answered with an `error` status.
    #[error("{0}")]
    Tracker(String),

    #[error("Lost connection to the tracker")]
    TrackerUnavailable,

    #[error("Unexpected response from the tracker")]
    UnexpectedResponse,

    #[error("You are not logged in")]
    NotLoggedIn,

    #[error("Already logged in as '{0}'")]
    AlreadyLoggedIn(String),

    #[error("'{0}' is busy right now")]
    Busy(String),

    #[error("'{0}' did not accept")]
    Refused(String),

    /// The local session is in the wrong state for the operation.
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidSelection(String),

    #[error("Connection error: {0}")]
    Wire(#[from] WireError),

    #[error("Bad peer key: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
}
