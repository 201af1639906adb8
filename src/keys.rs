//! Key material: X25519 identity keypairs and the root obfuscation secret.
//!
//! A [`SessionPublicKey`] doubles as a peer identity; the responder learns
//! the initiator's during the handshake and hands it to the request handler.

use std::fmt;

use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Byte length of keys and secrets handled by this module.
pub const KEY_SIZE: usize = 32;

/// Long-term X25519 private key identifying one endpoint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionPrivateKey([u8; KEY_SIZE]);

impl SessionPrivateKey {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Reconstructs an identity from stored private key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives the public half, which doubles as this endpoint's identity.
    pub fn public_key(&self) -> SessionPublicKey {
        let secret = StaticSecret::from(self.0);
        SessionPublicKey(*PublicKey::from(&secret).as_bytes())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionPrivateKey(..)")
    }
}

/// Public half of a session keypair; also the peer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionPublicKey([u8; KEY_SIZE]);

impl SessionPublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Constant-time equality, for allow-list membership checks.
    pub fn ct_eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Symmetric root secret shared out-of-band between an initiator population
/// and a responder. Only ever used to derive obfuscation keys; plays no part
/// in the handshake's authentication.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootObfuscationSecret([u8; KEY_SIZE]);

impl RootObfuscationSecret {
    /// Generates a fresh random root secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for RootObfuscationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootObfuscationSecret(..)")
    }
}
