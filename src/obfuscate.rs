//! Obfuscation envelope wrapping every wire message.
//!
//! Each packet is sealed with XChaCha20-Poly1305 under a per-direction key
//! derived from the root obfuscation secret, with a random nonce and bucketed
//! random padding. Without the secret, packets are indistinguishable from
//! random bytes, and malformed or foreign traffic is rejected before any
//! asymmetric cryptography runs. Every failure collapses into the single
//! [`ObfuscationError`] so an active prober gains no distinguishing oracle.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::RootObfuscationSecret;
use crate::{MAX_PLAINTEXT_SIZE, PROLOGUE};

/// XChaCha20-Poly1305 nonce length prefixed to every envelope.
pub const ENVELOPE_NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 3;

/// Uniform rejection of an envelope: secret mismatch, corruption, or foreign
/// bytes all look the same.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("obfuscated envelope rejected")]
pub struct ObfuscationError;

/// Which way a packet travels; each direction has its own derived key so a
/// reflected packet never unwraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    fn label(self) -> &'static [u8] {
        match self {
            Direction::InitiatorToResponder => b"obfuscation-initiator",
            Direction::ResponderToInitiator => b"obfuscation-responder",
        }
    }
}

/// Message classification carried inside the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake message 1: initiator ephemeral key.
    HandshakeInit,
    /// Handshake message 2: responder ephemeral key plus pending-handshake tag.
    HandshakeResponse,
    /// Handshake message 3: initiator static key plus the first request.
    HandshakeComplete,
    /// Established-session transport message.
    Transport,
}

impl MessageType {
    fn to_byte(self) -> u8 {
        match self {
            MessageType::HandshakeInit => 1,
            MessageType::HandshakeResponse => 2,
            MessageType::HandshakeComplete => 3,
            MessageType::Transport => 4,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::HandshakeInit),
            2 => Some(MessageType::HandshakeResponse),
            3 => Some(MessageType::HandshakeComplete),
            4 => Some(MessageType::Transport),
            _ => None,
        }
    }
}

fn derive_key(secret: &RootObfuscationSecret, direction: Direction) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(PROLOGUE), secret.as_bytes());
    let mut out = Zeroizing::new([0u8; 32]);
    let res = hk.expand(direction.label(), out.as_mut());
    debug_assert!(res.is_ok(), "HKDF expand cannot fail for 32-byte output");
    out
}

fn bucket_pad_len(b: u8) -> usize {
    match b {
        0..=31 => 0,
        32..=63 => 32,
        64..=127 => 64,
        128..=191 => 128,
        _ => 256,
    }
}

/// Wraps `payload` into an opaque envelope for `direction`.
pub fn seal(
    secret: &RootObfuscationSecret,
    direction: Direction,
    message_type: MessageType,
    payload: &[u8],
) -> Result<Vec<u8>, ObfuscationError> {
    if payload.len() > MAX_PLAINTEXT_SIZE {
        return Err(ObfuscationError);
    }

    let mut pad_len_byte = [0u8; 1];
    OsRng.fill_bytes(&mut pad_len_byte);
    let pad_len = bucket_pad_len(pad_len_byte[0]);
    let mut pad = vec![0u8; pad_len];
    if pad_len > 0 {
        OsRng.fill_bytes(&mut pad);
    }

    let mut plaintext = Zeroizing::new(Vec::with_capacity(HEADER_SIZE + pad_len + payload.len()));
    plaintext.push(message_type.to_byte());
    plaintext.extend_from_slice(&(pad_len as u16).to_le_bytes());
    plaintext.extend_from_slice(&pad);
    plaintext.extend_from_slice(payload);

    let mut nonce = [0u8; ENVELOPE_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(secret, direction);
    let aead = XChaCha20Poly1305::new((&*key).into());
    let ciphertext = aead
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &[],
            },
        )
        .map_err(|_| ObfuscationError)?;

    let mut envelope = Vec::with_capacity(ENVELOPE_NONCE_SIZE + ciphertext.len());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Unwraps an envelope received for `direction`, returning the classification
/// and payload. Fails uniformly.
pub fn open(
    secret: &RootObfuscationSecret,
    direction: Direction,
    envelope: &[u8],
) -> Result<(MessageType, Vec<u8>), ObfuscationError> {
    if envelope.len() < ENVELOPE_NONCE_SIZE + TAG_SIZE + HEADER_SIZE
        || envelope.len() > ENVELOPE_NONCE_SIZE + TAG_SIZE + HEADER_SIZE + 256 + MAX_PLAINTEXT_SIZE
    {
        return Err(ObfuscationError);
    }

    let (nonce, ciphertext) = envelope.split_at(ENVELOPE_NONCE_SIZE);
    let key = derive_key(secret, direction);
    let aead = XChaCha20Poly1305::new((&*key).into());
    let plaintext = Zeroizing::new(
        aead.decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[],
            },
        )
        .map_err(|_| ObfuscationError)?,
    );

    if plaintext.len() < HEADER_SIZE {
        return Err(ObfuscationError);
    }
    let message_type = MessageType::from_byte(plaintext[0]).ok_or(ObfuscationError)?;
    let pad_len = u16::from_le_bytes([plaintext[1], plaintext[2]]) as usize;
    if HEADER_SIZE + pad_len > plaintext.len() {
        return Err(ObfuscationError);
    }
    Ok((message_type, plaintext[HEADER_SIZE + pad_len..].to_vec()))
}
