//! Length-prefixed framing over any async byte stream.
//!
//! Every socket in the system carries frames of `u32` big-endian length
//! followed by the body. On top of that, [`send_sealed`] / [`recv_sealed`]
//! move JSON payloads encrypted to the recipient's public key, and
//! [`Envelope`] wraps the very first message of a direct peer connection.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::constants::MAX_FRAME_SIZE;
use crate::crypto::{seal, KeyPair, PublicKey};
use crate::error::WireError;

pub type FrameReader = Box<dyn AsyncRead + Send + Unpin>;
pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a connection, split so reads and writes can live on
/// different tasks.
pub struct Link {
    pub reader: FrameReader,
    pub writer: FrameWriter,
}

impl Link {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
        }
    }

    /// Wrap any duplex stream (e.g. `tokio::io::duplex` in tests).
    pub fn new<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Box::new(read_half),
            writer: Box::new(write_half),
        }
    }

    pub fn into_parts(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    /// Flush and shut down the write side. Errors are irrelevant here:
    /// the link is being dropped either way.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), WireError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Write a plaintext JSON frame (key exchange only).
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    write_frame(writer, &body).await
}

pub async fn read_json<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let body = read_frame(reader).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serialize `value` to JSON, seal it to `recipient` and write one frame.
pub async fn send_sealed<W, T>(writer: &mut W, recipient: &PublicKey, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let sealed = seal(recipient, &body)?;
    write_frame(writer, &sealed).await
}

/// Like [`send_sealed`] but gives up after `limit`. A peer that stopped
/// reading fills its socket buffer and would otherwise stall the writer.
pub async fn send_sealed_timeout<W, T>(
    writer: &mut W,
    recipient: &PublicKey,
    value: &T,
    limit: Duration,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    tokio::time::timeout(limit, send_sealed(writer, recipient, value))
        .await
        .map_err(|_| WireError::Timeout)?
}

/// Read one frame, open it with `keys` and decode the JSON inside.
pub async fn recv_sealed<R, T>(reader: &mut R, keys: &KeyPair) -> Result<T, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let frame = read_frame(reader).await?;
    let body = keys.open(&frame)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Like [`recv_sealed`] but gives up after `limit`.
pub async fn recv_sealed_timeout<R, T>(
    reader: &mut R,
    keys: &KeyPair,
    limit: Duration,
) -> Result<T, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    tokio::time::timeout(limit, recv_sealed(reader, keys))
        .await
        .map_err(|_| WireError::Timeout)?
}

/// Public key announcement exchanged when a tracker connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchange {
    pub public_key: String,
}

/// First frame of a direct peer connection: the sender's key travels in
/// clear next to the payload sealed for the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub public_key: String,
    pub encrypted: String,
}

impl Envelope {
    pub fn seal<T: Serialize>(
        sender: &KeyPair,
        recipient: &PublicKey,
        value: &T,
    ) -> Result<Self, WireError> {
        let body = serde_json::to_vec(value)?;
        let sealed = seal(recipient, &body)?;
        Ok(Self {
            public_key: sender.public_key().to_text(),
            encrypted: STANDARD.encode(sealed),
        })
    }

    /// Decrypt with the local keys; returns the sender's key with the payload.
    pub fn open<T: DeserializeOwned>(&self, keys: &KeyPair) -> Result<(PublicKey, T), WireError> {
        let sender = PublicKey::from_text(&self.public_key)?;
        let sealed = STANDARD
            .decode(&self.encrypted)
            .map_err(|e| WireError::Envelope(e.to_string()))?;
        let body = keys.open(&sealed)?;
        Ok((sender, serde_json::from_slice(&body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Link::new(a);
        let mut right = Link::new(b);

        write_frame(&mut left.writer, b"hello").await.unwrap();
        let got = read_frame(&mut right.reader).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut right = Link::new(b);
        let err = read_frame(&mut right.reader).await.unwrap_err();
        assert!(matches!(err, WireError::Closed));
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut right = Link::new(b);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut right.reader).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_sealed_json_between_keypairs() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Link::new(a);
        let mut right = Link::new(b);
        let receiver = KeyPair::generate();

        let value = json!({"type": "message", "content": "olá"});
        send_sealed(&mut left.writer, &receiver.public_key(), &value)
            .await
            .unwrap();
        let got: serde_json::Value = recv_sealed(&mut right.reader, &receiver).await.unwrap();
        assert_eq!(got, value);
    }

    #[tokio::test]
    async fn test_sealed_json_wrong_key_is_crypto_error() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Link::new(a);
        let mut right = Link::new(b);
        let intended = KeyPair::generate();
        let other = KeyPair::generate();

        send_sealed(&mut left.writer, &intended.public_key(), &json!({"x": 1}))
            .await
            .unwrap();
        let err = recv_sealed::<_, serde_json::Value>(&mut right.reader, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Crypto(_)));
    }

    #[tokio::test]
    async fn test_send_timeout_when_nobody_reads() {
        // the other end stays open but never drains the 64-byte buffer
        let (a, _b) = tokio::io::duplex(64);
        let mut left = Link::new(a);
        let receiver = KeyPair::generate();
        let err = send_sealed_timeout(
            &mut left.writer,
            &receiver.public_key(),
            &json!({"content": "x".repeat(256)}),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WireError::Timeout));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_a, b) = tokio::io::duplex(64);
        let mut right = Link::new(b);
        let keys = KeyPair::generate();
        let err = recv_sealed_timeout::<_, serde_json::Value>(
            &mut right.reader,
            &keys,
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WireError::Timeout));
    }

    #[test]
    fn test_envelope_carries_sender_key() {
        let sender = KeyPair::generate();
        let receiver = KeyPair::generate();
        let envelope =
            Envelope::seal(&sender, &receiver.public_key(), &json!({"type": "busy"})).unwrap();

        let (from, payload): (PublicKey, serde_json::Value) = envelope.open(&receiver).unwrap();
        assert_eq!(from, sender.public_key());
        assert_eq!(payload["type"], "busy");
    }
}
