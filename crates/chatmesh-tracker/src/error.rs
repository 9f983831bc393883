use chatmesh_shared::protocol::TrackerResponse;
use thiserror::Error;

/// Failures of a registry operation. Each one becomes an `error` response;
/// none of them ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Bad credentials, or a command that needs a logged-in user.
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    /// Moderator-only mutation attempted by someone else, or removal of the
    /// moderator.
    #[error("{0}")]
    Permission(String),

    /// Duplicate registration, room name or membership.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),
}

impl RegistryError {
    pub fn into_response(self) -> TrackerResponse {
        TrackerResponse::error(self.to_string())
    }

    pub fn room_not_found(room: &str) -> Self {
        RegistryError::NotFound(format!("Room '{room}' not found"))
    }
}

impl From<RegistryError> for TrackerResponse {
    fn from(err: RegistryError) -> Self {
        err.into_response()
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
