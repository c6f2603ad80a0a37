//! Identity and friend addresses.
//!
//! An identity is a long-term keypair plus a 4-byte nospam discriminator.
//! The public address handed to other users is the concatenation of public
//! key, nospam and a 2-byte checksum, rendered as hex. Rotating the nospam
//! invalidates the published address without changing the keypair.

use crate::crypto::{random_bytes, KeyPair, PublicKey, PUBLIC_KEY_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Size of the nospam discriminator in bytes.
pub const NOSPAM_SIZE: usize = 4;

/// Size of the address checksum in bytes.
pub const CHECKSUM_SIZE: usize = 2;

/// Size of a binary friend address in bytes.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// A friend address: public key, nospam and checksum.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Address {
    public_key: PublicKey,
    nospam: [u8; NOSPAM_SIZE],
}

impl Address {
    /// Build an address from its parts.
    pub fn new(public_key: PublicKey, nospam: [u8; NOSPAM_SIZE]) -> Self {
        Self { public_key, nospam }
    }

    /// The public key the address maps back to.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The nospam discriminator.
    pub fn nospam(&self) -> [u8; NOSPAM_SIZE] {
        self.nospam
    }

    /// Binary form: public key || nospam || checksum.
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.public_key.as_bytes());
        out[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE].copy_from_slice(&self.nospam);
        let check = checksum(&out[..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        out[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&check);
        out
    }

    /// Parse a binary address, validating length and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(Error::MalformedAddress);
        }

        let expected = checksum(&bytes[..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        if bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] != expected {
            return Err(Error::MalformedAddress);
        }

        let public_key = PublicKey::from_slice(&bytes[..PUBLIC_KEY_SIZE])
            .map_err(|_| Error::MalformedAddress)?;
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);

        Ok(Self { public_key, nospam })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_bytes()))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}...)", hex::encode_upper(&self.to_bytes()[..8]))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::MalformedAddress)?;
        Self::from_bytes(&bytes)
    }
}

/// XOR-fold the address body into a 2-byte checksum.
fn checksum(body: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut check = [0u8; CHECKSUM_SIZE];
    for (i, byte) in body.iter().enumerate() {
        check[i % CHECKSUM_SIZE] ^= byte;
    }
    check
}

/// The local long-term identity: keypair plus nospam.
#[derive(Debug)]
pub struct Identity {
    keypair: KeyPair,
    nospam: [u8; NOSPAM_SIZE],
}

impl Identity {
    /// Generate a fresh identity with a random nospam.
    pub fn generate() -> Self {
        Self {
            keypair: KeyPair::generate(),
            nospam: random_bytes(),
        }
    }

    /// Restore an identity from secret key bytes and a nospam.
    pub fn from_parts(secret_key: [u8; PUBLIC_KEY_SIZE], nospam: [u8; NOSPAM_SIZE]) -> Self {
        Self {
            keypair: KeyPair::from_secret_bytes(secret_key),
            nospam,
        }
    }

    /// Our public key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The current nospam.
    pub fn nospam(&self) -> [u8; NOSPAM_SIZE] {
        self.nospam
    }

    /// Rotate the nospam. The derived address changes; the keypair does not.
    pub fn set_nospam(&mut self, nospam: [u8; NOSPAM_SIZE]) {
        self.nospam = nospam;
    }

    /// The address to hand out to other users.
    pub fn address(&self) -> Address {
        Address::new(self.keypair.public(), self.nospam)
    }

    /// Access to the keypair for packet sealing.
    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// Secret key bytes for the persistence snapshot.
    pub(crate) fn secret_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.keypair.secret_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let identity = Identity::generate();
        let address = identity.address();

        let rendered = address.to_string();
        assert_eq!(rendered.len(), ADDRESS_SIZE * 2);

        let parsed: Address = rendered.parse().expect("parse back");
        assert_eq!(parsed.public_key(), identity.public_key());
        assert_eq!(parsed.nospam(), identity.nospam());
    }

    #[test]
    fn test_address_rejects_bad_checksum() {
        let identity = Identity::generate();
        let mut bytes = identity.address().to_bytes();
        bytes[ADDRESS_SIZE - 1] ^= 0xFF;

        assert_eq!(Address::from_bytes(&bytes), Err(Error::MalformedAddress));
    }

    #[test]
    fn test_address_rejects_wrong_length() {
        assert_eq!(Address::from_bytes(&[0u8; 10]), Err(Error::MalformedAddress));
        assert_eq!(
            "00112233".parse::<Address>().unwrap_err(),
            Error::MalformedAddress
        );
        assert_eq!(
            "not hex at all".parse::<Address>().unwrap_err(),
            Error::MalformedAddress
        );
    }

    #[test]
    fn test_nospam_rotation_changes_address_only() {
        let mut identity = Identity::generate();
        let before = identity.address();

        identity.set_nospam(random_bytes());
        let after = identity.address();

        assert_eq!(before.public_key(), after.public_key());
        assert_ne!(before.to_bytes(), after.to_bytes());
    }

    #[test]
    fn test_identity_restore() {
        let original = Identity::generate();
        let restored = Identity::from_parts(original.secret_key_bytes(), original.nospam());
        assert_eq!(original.address(), restored.address());
    }
}
