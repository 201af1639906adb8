//! Established-session cipher state.
//!
//! A [`TransportSession`] wraps the stateless Noise transport keys produced
//! by a completed handshake. Send nonces come from an atomic counter so
//! concurrent encrypts never collide; receive nonces pass through a replay
//! window that is only marked after the ciphertext authenticates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use snow::StatelessTransportState;

use crate::handshake::{CompletedHandshake, SessionId, SESSION_ID_SIZE};
use crate::keys::SessionPublicKey;
use crate::replay::ReplayWindow;
use crate::{lock_mutex, SessionError, MAX_PLAINTEXT_SIZE};

const NONCE_SIZE: usize = 8;
const AEAD_TAG_SIZE: usize = 16;

/// One direction-pair of transport cipher state shared by both roles.
pub struct TransportSession {
    transport: StatelessTransportState,
    session_id: SessionId,
    peer: SessionPublicKey,
    created_at: Instant,
    send_nonce: AtomicU64,
    recv_window: Mutex<ReplayWindow>,
}

impl TransportSession {
    pub(crate) fn new(handshake: CompletedHandshake, replay_window: usize) -> Self {
        Self {
            transport: handshake.transport,
            session_id: handshake.session_id,
            peer: handshake.peer,
            created_at: Instant::now(),
            send_nonce: AtomicU64::new(0),
            recv_window: Mutex::new(ReplayWindow::new(replay_window)),
        }
    }

    /// Transcript-derived identifier shared by both ends of this session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Static identity of the remote endpoint.
    pub fn peer(&self) -> &SessionPublicKey {
        &self.peer
    }

    pub(crate) fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Encrypts `plaintext` under the next send nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(u64, Vec<u8>), SessionError> {
        if plaintext.len() > MAX_PLAINTEXT_SIZE {
            return Err(SessionError::PayloadTooLarge);
        }
        let nonce = self.send_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce >= u64::MAX - 1 {
            return Err(SessionError::NonceExhausted);
        }
        let mut ciphertext = vec![0u8; plaintext.len() + AEAD_TAG_SIZE];
        let len = self
            .transport
            .write_message(nonce, plaintext, &mut ciphertext)
            .map_err(|_| SessionError::PayloadTooLarge)?;
        ciphertext.truncate(len);
        Ok((nonce, ciphertext))
    }

    /// Decrypts a received `(nonce, ciphertext)` pair, enforcing the replay
    /// window. The window is held across decryption so a nonce is marked the
    /// moment it authenticates.
    pub fn decrypt(&self, nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if ciphertext.len() < AEAD_TAG_SIZE
            || ciphertext.len() > MAX_PLAINTEXT_SIZE + AEAD_TAG_SIZE
        {
            return Err(SessionError::Malformed);
        }
        let mut window = lock_mutex(&self.recv_window);
        if !window.permits(nonce) {
            return Err(SessionError::Replay);
        }
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(nonce, ciphertext, &mut plaintext)
            .map_err(|_| SessionError::Decrypt)?;
        plaintext.truncate(len);
        window.record(nonce);
        Ok(plaintext)
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("session_id", &hex::encode(self.session_id))
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Encodes an established-session message body: session id, nonce, ciphertext.
pub(crate) fn encode_transport_body(
    session_id: &SessionId,
    nonce: u64,
    ciphertext: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(SESSION_ID_SIZE + NONCE_SIZE + ciphertext.len());
    body.extend_from_slice(session_id);
    body.extend_from_slice(&nonce.to_le_bytes());
    body.extend_from_slice(ciphertext);
    body
}

pub(crate) fn decode_transport_body(body: &[u8]) -> Result<(SessionId, u64, &[u8]), SessionError> {
    if body.len() < SESSION_ID_SIZE + NONCE_SIZE {
        return Err(SessionError::Malformed);
    }
    let mut session_id = [0u8; SESSION_ID_SIZE];
    session_id.copy_from_slice(&body[..SESSION_ID_SIZE]);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&body[SESSION_ID_SIZE..SESSION_ID_SIZE + NONCE_SIZE]);
    let nonce = u64::from_le_bytes(nonce_bytes);
    Ok((session_id, nonce, &body[SESSION_ID_SIZE + NONCE_SIZE..]))
}
