/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Random salt size for stored password hashes
pub const PASSWORD_SALT_SIZE: usize = 16;

/// Maximum frame body size in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Default tracker TCP port
pub const DEFAULT_TRACKER_PORT: u16 = 6000;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_SEALED_BOX: &str = "chatmesh-sealed-box-v1";
pub const KDF_CONTEXT_PASSWORD: &str = "chatmesh-password-v1";

/// Liveness defaults, in seconds
pub const SESSION_TIMEOUT_SECS: u64 = 60;
pub const PRESENCE_SWEEP_SECS: u64 = 30;
pub const ROOM_TIMEOUT_SECS: u64 = 60;
pub const ROOM_SWEEP_SECS: u64 = 10;
pub const HEARTBEAT_SECS: u64 = 30;

/// How long a chat requester waits for the invitee to answer
pub const CHAT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Limits on direct peer sockets: connecting, and any single write
pub const DIAL_TIMEOUT_SECS: u64 = 10;
pub const WRITE_TIMEOUT_SECS: u64 = 10;
