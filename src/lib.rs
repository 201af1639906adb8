//! Secure session layer for a censorship-resistant relay.
//!
//! Turns an unauthenticated request/response byte exchange into a
//! confidential, mutually-authenticated, replay-protected channel. An
//! initiator dials a responder whose static public key it already knows; a
//! Noise XK handshake (X25519 + ChaCha20-Poly1305 + BLAKE2b) establishes two
//! directional cipher states, and every wire message is wrapped in an
//! obfuscation envelope keyed by a shared root secret so that traffic is
//! indistinguishable to observers without that secret.
//!
//! [`initiator::InitiatorSessions`] and [`responder::ResponderSessions`] are
//! the two entry points; the physical transport is abstracted behind
//! [`transport::RoundTripper`].

use std::sync::Arc;

use thiserror::Error;

/// Session caching with TTL expiry evaluated at lookup time.
pub mod cache;
/// Noise XK handshake state machines for both protocol roles.
pub mod handshake;
/// Initiator-side session orchestration and single-flight handshake sharing.
pub mod initiator;
/// Static identity keypairs and the root obfuscation secret.
pub mod keys;
/// Keyed envelope wrapping that hides protocol structure on the wire.
pub mod obfuscate;
/// Sliding-bitmap replay protection for transport nonces.
pub mod replay;
/// Responder-side packet classification, dispatch, and allow-list policy.
pub mod responder;
/// Established-session cipher state and nonce management.
pub mod session;
/// Transport abstraction and cancellable request contexts.
pub mod transport;

pub use initiator::{InitiatorConfig, InitiatorSessions};
pub use keys::{RootObfuscationSecret, SessionPrivateKey, SessionPublicKey};
pub use obfuscate::ObfuscationError;
pub use responder::{ResponderConfig, ResponderSessions};
pub use transport::{RoundTripper, SessionContext};

/// Noise pattern establishing the channel: responder authenticates first,
/// the initiator's static key travels encrypted in the final message.
pub const NOISE_PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2b";

pub(crate) const PROLOGUE: &[u8] = b"relay-session/1";

/// Upper bound on a single request or response plaintext (1 MiB).
pub const MAX_PLAINTEXT_SIZE: usize = 1 << 20;

/// Errors surfaced by session establishment and transport operations.
///
/// The responder never reveals which of these occurred on the wire; the
/// taxonomy exists for the local caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] snow::Error),
    #[error("invalid noise pattern")]
    BadPattern,
    #[error("malformed session message")]
    Malformed,
    #[error("unexpected initiator public key")]
    UnauthorizedInitiator,
    #[error("no session for identifier")]
    SessionNotFound,
    #[error("nonce rejected by replay window")]
    Replay,
    #[error("transport message decryption failed")]
    Decrypt,
    #[error("send nonce space exhausted")]
    NonceExhausted,
    #[error("too many half-open handshakes")]
    HandshakeLimit,
    #[error("payload exceeds size limit")]
    PayloadTooLarge,
    #[error("request handler failed: {0}")]
    Handler(#[source] anyhow::Error),
    #[error("transport round trip failed: {0}")]
    Transport(#[source] anyhow::Error),
    #[error("shared handshake failed: {0}")]
    SharedHandshake(Arc<SessionError>),
    #[error("shared handshake abandoned")]
    HandshakeAbandoned,
    #[error("operation cancelled")]
    Cancelled,
}

pub(crate) fn lock_mutex<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
