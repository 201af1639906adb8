//! Responder-side session management.
//!
//! A [`ResponderSessions`] owns the responder's static identity, the root
//! obfuscation secret, half-open handshake state, and the cache of
//! established sessions. [`ResponderSessions::handle_packet`] is the single
//! ingress point: it unwraps the envelope, classifies the message, and either
//! advances a handshake or decrypts a transport request and dispatches it to
//! the caller's handler.
//!
//! Classification errors are surfaced to the local caller only; nothing about
//! why a packet was rejected is ever sent back on the wire.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use tracing::{debug, warn};

use crate::cache::SessionCache;
use crate::handshake::{encode_tagged, split_tagged, PendingId, ResponderHandshake, SessionId};
use crate::keys::{RootObfuscationSecret, SessionPrivateKey, SessionPublicKey};
use crate::obfuscate::{open, seal, Direction, MessageType};
use crate::session::{decode_transport_body, encode_transport_body, TransportSession};
use crate::{lock_mutex, SessionError};

/// Tunables for a responder. The defaults suit a long-lived relay endpoint.
#[derive(Clone, Debug)]
pub struct ResponderConfig {
    /// How long an established session stays usable.
    pub session_ttl: Duration,
    /// Maximum number of established sessions kept concurrently.
    pub session_capacity: usize,
    /// Replay window span, in nonces, per session.
    pub replay_window: usize,
    /// Maximum number of half-open handshakes awaiting message 3.
    pub pending_limit: usize,
    /// How long a half-open handshake waits for message 3.
    pub pending_timeout: Duration,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(2 * 60 * 60),
            session_capacity: 65_536,
            replay_window: crate::replay::DEFAULT_WINDOW_SIZE,
            pending_limit: 4096,
            pending_timeout: Duration::from_secs(30),
        }
    }
}

struct PendingHandshake {
    handshake: ResponderHandshake,
    started_at: Instant,
}

/// Accepts handshakes and serves encrypted requests for one responder
/// identity.
pub struct ResponderSessions {
    private_key: SessionPrivateKey,
    obfuscation_secret: RootObfuscationSecret,
    allowed_initiators: Option<Vec<SessionPublicKey>>,
    config: ResponderConfig,
    sessions: SessionCache<SessionId>,
    pending: Mutex<HashMap<PendingId, PendingHandshake>>,
}

impl ResponderSessions {
    /// A responder that accepts any authenticated initiator.
    pub fn new(private_key: SessionPrivateKey, obfuscation_secret: RootObfuscationSecret) -> Self {
        Self::with_config(
            private_key,
            obfuscation_secret,
            None,
            ResponderConfig::default(),
        )
    }

    /// A responder that only accepts initiators on the allow-list. Handshakes
    /// from other identities complete cryptographically but are rejected
    /// before the request handler runs.
    pub fn for_known_initiators(
        private_key: SessionPrivateKey,
        obfuscation_secret: RootObfuscationSecret,
        allowed_initiators: Vec<SessionPublicKey>,
    ) -> Self {
        Self::with_config(
            private_key,
            obfuscation_secret,
            Some(allowed_initiators),
            ResponderConfig::default(),
        )
    }

    pub fn with_config(
        private_key: SessionPrivateKey,
        obfuscation_secret: RootObfuscationSecret,
        allowed_initiators: Option<Vec<SessionPublicKey>>,
        config: ResponderConfig,
    ) -> Self {
        let sessions = SessionCache::new(config.session_ttl, config.session_capacity);
        Self {
            private_key,
            obfuscation_secret,
            allowed_initiators,
            config,
            sessions,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The static identity initiators must know to reach this responder.
    pub fn public_key(&self) -> SessionPublicKey {
        self.private_key.public_key()
    }

    /// Processes one inbound packet and returns the packet to send back.
    ///
    /// `handler` receives the authenticated initiator identity and the
    /// decrypted request; it runs once per delivered request and never for
    /// replays, forgeries, or unauthorized initiators.
    pub fn handle_packet<H>(&self, packet: &[u8], handler: H) -> Result<Vec<u8>, SessionError>
    where
        H: FnOnce(&SessionPublicKey, &[u8]) -> anyhow::Result<Vec<u8>>,
    {
        let (message_type, body) = open(
            &self.obfuscation_secret,
            Direction::InitiatorToResponder,
            packet,
        )?;

        match message_type {
            MessageType::HandshakeInit => self.handle_init(&body),
            MessageType::HandshakeComplete => self.handle_complete(&body, handler),
            MessageType::Transport => self.handle_transport(&body, handler),
            // Message 2 only ever travels responder-to-initiator.
            MessageType::HandshakeResponse => Err(SessionError::Malformed),
        }
    }

    /// Drops all established sessions. Initiators holding them will fail
    /// their next exchange and transparently renegotiate.
    pub fn flush(&self) {
        self.sessions.flush();
        lock_mutex(&self.pending).clear();
    }

    /// Number of established sessions currently cached.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn handle_init(&self, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let (handshake, message2) = ResponderHandshake::respond(&self.private_key, body)?;

        let mut pending = lock_mutex(&self.pending);
        pending.retain(|_, entry| entry.started_at.elapsed() < self.config.pending_timeout);
        if pending.len() >= self.config.pending_limit {
            warn!(
                limit = self.config.pending_limit,
                "half-open handshake limit reached, dropping handshake"
            );
            return Err(SessionError::HandshakeLimit);
        }

        let mut id: PendingId = [0u8; 8];
        loop {
            OsRng.fill_bytes(&mut id);
            if !pending.contains_key(&id) {
                break;
            }
        }
        pending.insert(
            id,
            PendingHandshake {
                handshake,
                started_at: Instant::now(),
            },
        );
        drop(pending);

        Ok(seal(
            &self.obfuscation_secret,
            Direction::ResponderToInitiator,
            MessageType::HandshakeResponse,
            &encode_tagged(&id, &message2),
        )?)
    }

    fn handle_complete<H>(&self, body: &[u8], handler: H) -> Result<Vec<u8>, SessionError>
    where
        H: FnOnce(&SessionPublicKey, &[u8]) -> anyhow::Result<Vec<u8>>,
    {
        let (id, message3) = split_tagged(body)?;
        let entry = lock_mutex(&self.pending)
            .remove(&id)
            .ok_or(SessionError::SessionNotFound)?;
        if entry.started_at.elapsed() >= self.config.pending_timeout {
            return Err(SessionError::SessionNotFound);
        }

        let (request, done) = entry.handshake.complete(message3)?;
        let peer = done.peer;

        if let Some(allowed) = &self.allowed_initiators {
            let mut authorized = false;
            for key in allowed {
                authorized |= key.ct_eq(&peer);
            }
            if !authorized {
                warn!(initiator = %peer, "rejecting initiator not on the allow-list");
                return Err(SessionError::UnauthorizedInitiator);
            }
        }

        let response = handler(&peer, &request).map_err(SessionError::Handler)?;

        let session = TransportSession::new(done, self.config.replay_window);
        let session_id = *session.session_id();
        let (nonce, ciphertext) = session.encrypt(&response)?;
        self.sessions.insert(session_id, std::sync::Arc::new(session));
        debug!(initiator = %peer, "session established");

        Ok(seal(
            &self.obfuscation_secret,
            Direction::ResponderToInitiator,
            MessageType::Transport,
            &encode_transport_body(&session_id, nonce, &ciphertext),
        )?)
    }

    fn handle_transport<H>(&self, body: &[u8], handler: H) -> Result<Vec<u8>, SessionError>
    where
        H: FnOnce(&SessionPublicKey, &[u8]) -> anyhow::Result<Vec<u8>>,
    {
        let (session_id, nonce, ciphertext) = decode_transport_body(body)?;
        let session = self
            .sessions
            .lookup(&session_id)
            .ok_or(SessionError::SessionNotFound)?;

        let request = session.decrypt(nonce, ciphertext)?;
        let response = handler(session.peer(), &request).map_err(SessionError::Handler)?;
        let (nonce, ciphertext) = session.encrypt(&response)?;

        Ok(seal(
            &self.obfuscation_secret,
            Direction::ResponderToInitiator,
            MessageType::Transport,
            &encode_transport_body(&session_id, nonce, &ciphertext),
        )?)
    }
}
