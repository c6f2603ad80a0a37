//! Key types and packet sealing.
//!
//! The long-term identity is an X25519 keypair. Packets between peers are
//! sealed with ECDH -> HKDF-SHA256 -> ChaCha20-Poly1305; the sender's public
//! key and a fresh nonce travel in clear ahead of the ciphertext so the
//! receiver can derive the shared key.
//!
//! Secret key material is zeroized on drop and never appears in `Debug`
//! output.

use crate::error::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Clear-text frame overhead: sender public key plus nonce.
pub const FRAME_OVERHEAD: usize = PUBLIC_KEY_SIZE + NONCE_SIZE;

/// Domain separation label for the per-packet key derivation.
const PACKET_KDF_INFO: &[u8] = b"amiko.packet.v1";

/// A peer's long-term public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice; fails if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| Error::InvalidKey)?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> DalekPublic {
        DalekPublic::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the first 8 bytes; enough to correlate logs.
        write!(f, "PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

/// A long-term keypair. The secret half is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    secret: StaticSecret,
    #[zeroize(skip)]
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(*DalekPublic::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(*DalekPublic::from(&secret).as_bytes());
        Self { secret, public }
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// The secret key bytes. Only the persistence snapshot may call this.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub(crate) fn secret_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.secret.to_bytes()
    }

    fn shared_key(&self, peer: &PublicKey) -> Key {
        let shared = self.secret.diffie_hellman(&peer.to_dalek());
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        // Expand cannot fail for a 32-byte output.
        hk.expand(PACKET_KDF_INFO, &mut okm)
            .unwrap_or_else(|_| unreachable!("32-byte HKDF output"));
        let key = Key::from(okm);
        okm.zeroize();
        key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({:?}, [REDACTED])", self.public)
    }
}

/// Fill a fixed-size array with random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Seal a plaintext for `recipient`.
///
/// Frame layout: sender public key (32) || nonce (12) || ciphertext+tag.
pub fn seal(sender: &KeyPair, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = sender.shared_key(recipient);
    let cipher = ChaCha20Poly1305::new(&key);
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::Crypto)?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + ciphertext.len());
    frame.extend_from_slice(sender.public().as_bytes());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Open a sealed frame addressed to `receiver`.
///
/// Returns the sender's public key and the plaintext. Fails with
/// [`Error::Crypto`] on truncation or authentication failure.
pub fn open(receiver: &KeyPair, frame: &[u8]) -> Result<(PublicKey, Vec<u8>)> {
    if frame.len() < FRAME_OVERHEAD + TAG_SIZE {
        return Err(Error::Crypto);
    }

    let sender = PublicKey::from_slice(&frame[..PUBLIC_KEY_SIZE])?;
    let nonce = Nonce::from_slice(&frame[PUBLIC_KEY_SIZE..FRAME_OVERHEAD]);

    let key = receiver.shared_key(&sender);
    let cipher = ChaCha20Poly1305::new(&key);
    let plaintext = cipher
        .decrypt(nonce, &frame[FRAME_OVERHEAD..])
        .map_err(|_| Error::Crypto)?;

    Ok((sender, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let frame = seal(&alice, &bob.public(), b"hello bob").expect("seal");
        let (sender, plaintext) = open(&bob, &frame).expect("open");

        assert_eq!(sender, alice.public());
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let mut frame = seal(&alice, &bob.public(), b"payload").expect("seal");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        assert_eq!(open(&bob, &frame), Err(Error::Crypto));
    }

    #[test]
    fn test_open_rejects_truncation() {
        let bob = KeyPair::generate();
        assert_eq!(open(&bob, &[0u8; 10]), Err(Error::Crypto));
    }

    #[test]
    fn test_keypair_restore() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(original.secret_bytes());
        assert_eq!(original.public(), restored.public());
    }
}
