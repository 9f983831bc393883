use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

/// Failures on a framed socket. Always terminal for the connection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether the error only means the other side went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Closed => true,
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
