use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, StaticSecret};

use crate::constants::{
    KDF_CONTEXT_PASSWORD, KDF_CONTEXT_SEALED_BOX, NONCE_SIZE, PASSWORD_SALT_SIZE, PUBKEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// An X25519 public key, the only thing a peer ever advertises about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBKEY_SIZE]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_SIZE] {
        self.0.as_bytes()
    }

    /// Base64 text form used on the wire and in the presence table.
    pub fn to_text(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    pub fn from_text(text: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let arr: [u8; PUBKEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_bytes(arr))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

/// Long-lived X25519 keypair of a tracker or peer process.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore a keypair from secret key bytes
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Decrypt a payload produced by [`seal`] for this keypair.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < PUBKEY_SIZE + NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (ephemeral_bytes, rest) = data.split_at(PUBKEY_SIZE);
        let mut ephemeral = [0u8; PUBKEY_SIZE];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral = x25519_dalek::PublicKey::from(ephemeral);

        let shared = self.secret.diffie_hellman(&ephemeral);
        let key = derive_box_key(shared.as_bytes(), ephemeral.as_bytes(), self.public.as_bytes());
        decrypt(&key, rest)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.to_text())
            .finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
///
/// Output layout: ephemeral public key (32) || nonce (24) || ciphertext.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient.0);
    let key = derive_box_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    );

    let body = encrypt(&key, plaintext)?;
    let mut output = Vec::with_capacity(PUBKEY_SIZE + body.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&body);
    Ok(output)
}

// BLAKE3 KDF with domain separation, bound to both public halves
fn derive_box_key(shared: &[u8], ephemeral: &[u8], recipient: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEALED_BOX);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    *hasher.finalize().as_bytes()
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Salted, irreversible password digest as stored in the account table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
    pub salt: String,
    pub hash: String,
}

pub fn hash_password(password: &str) -> PasswordHash {
    let mut salt = [0u8; PASSWORD_SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    PasswordHash {
        salt: hex::encode(salt),
        hash: hex::encode(derive_password_key(&salt, password)),
    }
}

pub fn verify_password(password: &str, stored: &PasswordHash) -> bool {
    let (Ok(salt), Ok(expected)) = (hex::decode(&stored.salt), hex::decode(&stored.hash)) else {
        return false;
    };
    let candidate = derive_password_key(&salt, password);
    candidate.as_slice().ct_eq(expected.as_slice()).into()
}

fn derive_password_key(salt: &[u8], password: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PASSWORD);
    hasher.update(salt);
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let keys = KeyPair::generate();
        let plaintext = br#"{"cmd":"list-peers"}"#;

        let sealed = seal(&keys.public_key(), plaintext).unwrap();
        let opened = keys.open(&sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();

        let sealed = seal(&alice.public_key(), b"for alice only").unwrap();
        assert!(mallory.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keys = KeyPair::generate();
        let mut sealed = seal(&keys.public_key(), b"Important data").unwrap();
        let len = sealed.len();
        sealed[len - 1] ^= 0xFF;

        assert!(keys.open(&sealed).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let keys = KeyPair::generate();
        assert!(keys.open(&[]).is_err());
        assert!(keys.open(&[0u8; PUBKEY_SIZE + 3]).is_err());
    }

    #[test]
    fn test_each_seal_is_fresh() {
        let keys = KeyPair::generate();
        let a = seal(&keys.public_key(), b"same").unwrap();
        let b = seal(&keys.public_key(), b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_public_key_text_roundtrip() {
        let keys = KeyPair::generate();
        let text = keys.public_key().to_text();
        let restored = PublicKey::from_text(&text).unwrap();
        assert_eq!(restored, keys.public_key());
    }

    #[test]
    fn test_public_key_text_rejects_garbage() {
        assert!(PublicKey::from_text("not base64 !!").is_err());
        assert!(PublicKey::from_text(&STANDARD.encode([1u8; 12])).is_err());
    }

    #[test]
    fn test_restored_keypair_opens() {
        let keys = KeyPair::from_secret_bytes([7u8; 32]);
        let same = KeyPair::from_secret_bytes([7u8; 32]);
        assert_eq!(keys.public_key(), same.public_key());

        let sealed = seal(&keys.public_key(), b"hi").unwrap();
        assert_eq!(same.open(&sealed).unwrap(), b"hi");
    }

    #[test]
    fn test_password_hash_verify() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
    }

    #[test]
    fn test_password_hash_is_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_corrupt_stored_hash_never_verifies() {
        let stored = PasswordHash {
            salt: "zz".into(),
            hash: "00".into(),
        };
        assert!(!verify_password("anything", &stored));
    }
}
