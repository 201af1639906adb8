//! Noise XK handshake state machines.
//!
//! Three messages: the initiator binds its ephemeral key to the responder's
//! known static key, the responder answers with its own ephemeral and proves
//! possession of its static key, and the initiator's final message reveals
//! its static identity encrypted under already-forward-secret keys, carrying
//! the first application payload alongside. Both sides derive the session
//! identifier from the handshake transcript hash, so it never travels in a
//! dedicated wire field.

use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::keys::{SessionPrivateKey, SessionPublicKey};
use crate::{SessionError, NOISE_PATTERN, PROLOGUE};

/// Length of the transcript-derived session identifier.
pub const SESSION_ID_SIZE: usize = 16;

/// Identifier the responder uses to route established-session messages.
pub type SessionId = [u8; SESSION_ID_SIZE];

/// Tag correlating handshake message 3 with the responder's half-open state.
pub(crate) type PendingId = [u8; 8];

const MSG_BUFFER_HEADROOM: usize = 96;

/// Result of a completed handshake, ready to become a transport session.
pub struct CompletedHandshake {
    pub(crate) transport: StatelessTransportState,
    pub(crate) session_id: SessionId,
    pub(crate) peer: SessionPublicKey,
}

fn build_state(
    local: &SessionPrivateKey,
    remote: Option<&SessionPublicKey>,
    initiator: bool,
) -> Result<HandshakeState, SessionError> {
    let params = NOISE_PATTERN.parse().map_err(|_| SessionError::BadPattern)?;
    let mut builder = Builder::new(params)
        .local_private_key(local.as_bytes())
        .prologue(PROLOGUE);
    if let Some(remote) = remote {
        builder = builder.remote_public_key(remote.as_bytes());
    }
    let state = if initiator {
        builder.build_initiator()?
    } else {
        builder.build_responder()?
    };
    Ok(state)
}

fn session_id(state: &HandshakeState) -> Result<SessionId, SessionError> {
    let hash = state.get_handshake_hash();
    if hash.len() < SESSION_ID_SIZE {
        return Err(SessionError::Malformed);
    }
    let mut id = [0u8; SESSION_ID_SIZE];
    id.copy_from_slice(&hash[..SESSION_ID_SIZE]);
    Ok(id)
}

/// Initiator side: holds state between message 1 and message 3.
pub struct InitiatorHandshake {
    state: HandshakeState,
    responder: SessionPublicKey,
}

impl InitiatorHandshake {
    /// Starts a handshake toward `responder`, returning message 1.
    pub fn new(
        local: &SessionPrivateKey,
        responder: &SessionPublicKey,
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let mut state = build_state(local, Some(responder), true)?;
        let mut message = vec![0u8; MSG_BUFFER_HEADROOM];
        let len = state.write_message(&[], &mut message)?;
        message.truncate(len);
        Ok((
            Self {
                state,
                responder: *responder,
            },
            message,
        ))
    }

    /// Consumes message 2 and produces message 3 carrying `payload`, the
    /// first application request of the new session.
    pub fn complete(
        mut self,
        message2: &[u8],
        payload: &[u8],
    ) -> Result<(Vec<u8>, CompletedHandshake), SessionError> {
        let mut ignored = vec![0u8; message2.len()];
        self.state.read_message(message2, &mut ignored)?;

        let mut message3 = vec![0u8; payload.len() + MSG_BUFFER_HEADROOM];
        let len = self.state.write_message(payload, &mut message3)?;
        message3.truncate(len);

        let session_id = session_id(&self.state)?;
        let transport = self.state.into_stateless_transport_mode()?;
        Ok((
            message3,
            CompletedHandshake {
                transport,
                session_id,
                peer: self.responder,
            },
        ))
    }
}

/// Responder side: created on message 1, completed on message 3.
pub struct ResponderHandshake {
    state: HandshakeState,
}

impl ResponderHandshake {
    /// Consumes message 1 and produces message 2.
    pub fn respond(
        local: &SessionPrivateKey,
        message1: &[u8],
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let mut state = build_state(local, None, false)?;
        let mut ignored = vec![0u8; message1.len()];
        state.read_message(message1, &mut ignored)?;

        let mut message2 = vec![0u8; MSG_BUFFER_HEADROOM];
        let len = state.write_message(&[], &mut message2)?;
        message2.truncate(len);
        Ok((Self { state }, message2))
    }

    /// Consumes message 3, learning the initiator's identity and yielding the
    /// first application payload.
    pub fn complete(
        mut self,
        message3: &[u8],
    ) -> Result<(Vec<u8>, CompletedHandshake), SessionError> {
        let mut payload = vec![0u8; message3.len()];
        let len = self.state.read_message(message3, &mut payload)?;
        payload.truncate(len);

        let peer = match self.state.get_remote_static() {
            Some(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                SessionPublicKey::from_bytes(key)
            }
            _ => return Err(SessionError::Malformed),
        };

        let session_id = session_id(&self.state)?;
        let transport = self.state.into_stateless_transport_mode()?;
        Ok((
            payload,
            CompletedHandshake {
                transport,
                session_id,
                peer,
            },
        ))
    }
}

pub(crate) fn encode_tagged(id: &PendingId, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(id.len() + message.len());
    out.extend_from_slice(id);
    out.extend_from_slice(message);
    out
}

pub(crate) fn split_tagged(body: &[u8]) -> Result<(PendingId, &[u8]), SessionError> {
    if body.len() < 8 {
        return Err(SessionError::Malformed);
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&body[..8]);
    Ok((id, &body[8..]))
}
