//! Initiator-side session orchestration.
//!
//! [`InitiatorSessions`] owns the initiator's static identity and a cache of
//! established sessions keyed by responder public key. Each
//! [`InitiatorSessions::round_trip`] call reuses a cached session when one
//! exists, otherwise runs the handshake, piggybacking the first request on
//! handshake message 3 so a cold exchange still costs only two round trips.
//!
//! Concurrent calls to the same responder can opt into sharing a single
//! in-flight handshake: the first caller performs it, the rest wait on its
//! outcome and then exchange over the resulting session. When a cached or
//! shared session turns out to be dead (the responder restarted or flushed),
//! the exchange is retried exactly once over a freshly negotiated session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::cache::SessionCache;
use crate::handshake::{encode_tagged, split_tagged, InitiatorHandshake};
use crate::keys::{RootObfuscationSecret, SessionPrivateKey, SessionPublicKey};
use crate::obfuscate::{open, seal, Direction, MessageType};
use crate::session::{decode_transport_body, encode_transport_body, TransportSession};
use crate::transport::{RoundTripper, SessionContext};
use crate::{lock_mutex, SessionError};

/// Tunables for an initiator.
#[derive(Clone, Debug)]
pub struct InitiatorConfig {
    /// How long an established session is reused before renegotiating.
    pub session_ttl: Duration,
    /// Maximum number of responder sessions kept concurrently.
    pub session_capacity: usize,
    /// Replay window span, in nonces, per session.
    pub replay_window: usize,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(60 * 60),
            session_capacity: 4096,
            replay_window: crate::replay::DEFAULT_WINDOW_SIZE,
        }
    }
}

type SharedOutcome = Option<Result<Arc<TransportSession>, Arc<SessionError>>>;

enum Negotiated {
    /// This caller ran the handshake; its request rode on message 3 and this
    /// is already the response.
    Response(Vec<u8>),
    /// Another caller's handshake produced this session; the request still
    /// needs its own exchange.
    Session(Arc<TransportSession>),
}

/// Dials responders and multiplexes requests over cached sessions.
pub struct InitiatorSessions {
    private_key: SessionPrivateKey,
    config: InitiatorConfig,
    sessions: SessionCache<SessionPublicKey>,
    pending: Mutex<HashMap<SessionPublicKey, watch::Receiver<SharedOutcome>>>,
}

impl InitiatorSessions {
    pub fn new(private_key: SessionPrivateKey) -> Self {
        Self::with_config(private_key, InitiatorConfig::default())
    }

    pub fn with_config(private_key: SessionPrivateKey, config: InitiatorConfig) -> Self {
        let sessions = SessionCache::new(config.session_ttl, config.session_capacity);
        Self {
            private_key,
            config,
            sessions,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The identity this initiator presents in handshake message 3.
    pub fn public_key(&self) -> SessionPublicKey {
        self.private_key.public_key()
    }

    /// Number of established sessions currently cached.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drops all cached sessions; subsequent calls renegotiate.
    pub fn flush(&self) {
        self.sessions.flush();
    }

    /// Sends `request` to `responder` and returns its response.
    ///
    /// Uses a cached session when possible. With `share_handshake` set,
    /// concurrent cold calls to the same responder ride a single handshake.
    /// A dead session is evicted and the exchange retried once over a fresh
    /// one, so responder restarts are invisible to callers.
    pub async fn round_trip(
        &self,
        ctx: &SessionContext,
        transport: &dyn RoundTripper,
        responder: SessionPublicKey,
        obfuscation_secret: &RootObfuscationSecret,
        share_handshake: bool,
        request: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        ctx.check()?;

        if let Some(session) = self.sessions.lookup(&responder) {
            match self
                .exchange(ctx, transport, obfuscation_secret, &session, request)
                .await
            {
                Ok(response) => return Ok(response),
                Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
                Err(err) => {
                    debug!(%responder, error = %err, "cached session failed, renegotiating");
                    self.sessions.remove_if(&responder, &session);
                }
            }
        }

        let negotiated = self
            .negotiate(
                ctx,
                transport,
                responder,
                obfuscation_secret,
                share_handshake,
                request,
            )
            .await?;
        let session = match negotiated {
            Negotiated::Response(response) => return Ok(response),
            Negotiated::Session(session) => session,
        };

        match self
            .exchange(ctx, transport, obfuscation_secret, &session, request)
            .await
        {
            Ok(response) => Ok(response),
            Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
            Err(err) => {
                // The shared session died between its handshake and our
                // exchange. Negotiate our own and try once more.
                debug!(%responder, error = %err, "shared session failed, renegotiating");
                self.sessions.remove_if(&responder, &session);
                let (session, response) = self
                    .handshake(ctx, transport, responder, obfuscation_secret, request)
                    .await?;
                self.sessions.insert(responder, session);
                Ok(response)
            }
        }
    }

    async fn negotiate(
        &self,
        ctx: &SessionContext,
        transport: &dyn RoundTripper,
        responder: SessionPublicKey,
        obfuscation_secret: &RootObfuscationSecret,
        share_handshake: bool,
        request: &[u8],
    ) -> Result<Negotiated, SessionError> {
        if !share_handshake {
            let (session, response) = self
                .handshake(ctx, transport, responder, obfuscation_secret, request)
                .await?;
            self.sessions.insert(responder, session);
            return Ok(Negotiated::Response(response));
        }

        enum Role {
            Owner(watch::Sender<SharedOutcome>),
            Waiter(watch::Receiver<SharedOutcome>),
        }

        let role = {
            let mut pending = lock_mutex(&self.pending);
            match pending.get(&responder) {
                Some(receiver) => Role::Waiter(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    pending.insert(responder, receiver);
                    Role::Owner(sender)
                }
            }
        };

        match role {
            Role::Owner(sender) => {
                let outcome = self
                    .handshake(ctx, transport, responder, obfuscation_secret, request)
                    .await;
                match outcome {
                    Ok((session, response)) => {
                        // Cache before unregistering so late arrivals find
                        // either the pending handshake or the session.
                        self.sessions.insert(responder, Arc::clone(&session));
                        lock_mutex(&self.pending).remove(&responder);
                        let _ = sender.send(Some(Ok(session)));
                        Ok(Negotiated::Response(response))
                    }
                    Err(SessionError::Cancelled) => {
                        // Dropping the sender tells waiters the handshake was
                        // abandoned rather than blaming our cancellation on it.
                        lock_mutex(&self.pending).remove(&responder);
                        Err(SessionError::Cancelled)
                    }
                    Err(err) => {
                        lock_mutex(&self.pending).remove(&responder);
                        let err = Arc::new(err);
                        let _ = sender.send(Some(Err(Arc::clone(&err))));
                        Err(SessionError::SharedHandshake(err))
                    }
                }
            }
            Role::Waiter(mut receiver) => loop {
                let outcome = receiver.borrow_and_update().clone();
                match outcome {
                    Some(Ok(session)) => return Ok(Negotiated::Session(session)),
                    Some(Err(err)) => return Err(SessionError::SharedHandshake(err)),
                    None => {}
                }
                tokio::select! {
                    _ = ctx.done() => return Err(SessionError::Cancelled),
                    changed = receiver.changed() => {
                        changed.map_err(|_| SessionError::HandshakeAbandoned)?;
                    }
                }
            },
        }
    }

    async fn handshake(
        &self,
        ctx: &SessionContext,
        transport: &dyn RoundTripper,
        responder: SessionPublicKey,
        obfuscation_secret: &RootObfuscationSecret,
        request: &[u8],
    ) -> Result<(Arc<TransportSession>, Vec<u8>), SessionError> {
        let (state, message1) = InitiatorHandshake::new(&self.private_key, &responder)?;
        let packet = seal(
            obfuscation_secret,
            Direction::InitiatorToResponder,
            MessageType::HandshakeInit,
            &message1,
        )?;
        let reply = deliver(ctx, transport, &packet).await?;
        let (message_type, body) = open(
            obfuscation_secret,
            Direction::ResponderToInitiator,
            &reply,
        )?;
        if message_type != MessageType::HandshakeResponse {
            return Err(SessionError::Malformed);
        }
        let (pending_id, message2) = split_tagged(&body)?;

        let (message3, done) = state.complete(message2, request)?;
        let packet = seal(
            obfuscation_secret,
            Direction::InitiatorToResponder,
            MessageType::HandshakeComplete,
            &encode_tagged(&pending_id, &message3),
        )?;
        let reply = deliver(ctx, transport, &packet).await?;
        let (message_type, body) = open(
            obfuscation_secret,
            Direction::ResponderToInitiator,
            &reply,
        )?;
        if message_type != MessageType::Transport {
            return Err(SessionError::Malformed);
        }

        let session = Arc::new(TransportSession::new(done, self.config.replay_window));
        let (session_id, nonce, ciphertext) = decode_transport_body(&body)?;
        if &session_id != session.session_id() {
            return Err(SessionError::Malformed);
        }
        let response = session.decrypt(nonce, ciphertext)?;
        debug!(%responder, "session established");
        Ok((session, response))
    }

    async fn exchange(
        &self,
        ctx: &SessionContext,
        transport: &dyn RoundTripper,
        obfuscation_secret: &RootObfuscationSecret,
        session: &Arc<TransportSession>,
        request: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let (nonce, ciphertext) = session.encrypt(request)?;
        let packet = seal(
            obfuscation_secret,
            Direction::InitiatorToResponder,
            MessageType::Transport,
            &encode_transport_body(session.session_id(), nonce, &ciphertext),
        )?;
        let reply = deliver(ctx, transport, &packet).await?;
        let (message_type, body) = open(
            obfuscation_secret,
            Direction::ResponderToInitiator,
            &reply,
        )?;
        if message_type != MessageType::Transport {
            return Err(SessionError::Malformed);
        }
        let (session_id, nonce, ciphertext) = decode_transport_body(&body)?;
        if &session_id != session.session_id() {
            return Err(SessionError::Malformed);
        }
        session.decrypt(nonce, ciphertext)
    }
}

async fn deliver(
    ctx: &SessionContext,
    transport: &dyn RoundTripper,
    packet: &[u8],
) -> Result<Vec<u8>, SessionError> {
    tokio::select! {
        _ = ctx.done() => Err(SessionError::Cancelled),
        result = transport.round_trip(ctx, packet) => result.map_err(SessionError::Transport),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::responder::ResponderSessions;

    // In-memory transport that feeds packets straight into a responder whose
    // handler reverses the request bytes.
    struct TestTransport {
        responder: Arc<ResponderSessions>,
        secret: RootObfuscationSecret,
        transport_calls: AtomicUsize,
        handshake_inits: AtomicUsize,
        handler_calls: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    impl TestTransport {
        fn new(responder: Arc<ResponderSessions>, secret: RootObfuscationSecret) -> Self {
            Self {
                responder,
                secret,
                transport_calls: AtomicUsize::new(0),
                handshake_inits: AtomicUsize::new(0),
                handler_calls: Arc::new(AtomicUsize::new(0)),
                delay: None,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl RoundTripper for TestTransport {
        async fn round_trip(
            &self,
            _ctx: &SessionContext,
            request: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            self.transport_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok((MessageType::HandshakeInit, _)) =
                open(&self.secret, Direction::InitiatorToResponder, request)
            {
                self.handshake_inits.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let handler_calls = Arc::clone(&self.handler_calls);
            self.responder
                .handle_packet(request, move |_, request| {
                    handler_calls.fetch_add(1, Ordering::SeqCst);
                    let mut response = request.to_vec();
                    response.reverse();
                    Ok(response)
                })
                .map_err(anyhow::Error::new)
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<InitiatorSessions>, Arc<TestTransport>, SessionPublicKey, RootObfuscationSecret)
    {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(TestTransport::new(responder, secret.clone()));
        let initiator = Arc::new(InitiatorSessions::new(SessionPrivateKey::generate()));
        (initiator, transport, responder_key, secret)
    }

    #[tokio::test]
    async fn establishes_and_reuses_a_session() {
        let (initiator, transport, responder_key, secret) = setup();
        let ctx = SessionContext::background();

        for text in ["alpha", "beta", "gamma"] {
            let response = initiator
                .round_trip(
                    &ctx,
                    transport.as_ref(),
                    responder_key,
                    &secret,
                    true,
                    text.as_bytes(),
                )
                .await
                .expect("round trip");
            let mut expected = text.as_bytes().to_vec();
            expected.reverse();
            assert_eq!(response, expected);
        }

        assert_eq!(transport.handshake_inits.load(Ordering::SeqCst), 1);
        assert_eq!(initiator.session_count(), 1);
        assert_eq!(transport.handler_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn renegotiates_transparently_after_responder_flush() {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(TestTransport::new(Arc::clone(&responder), secret.clone()));
        let initiator = InitiatorSessions::new(SessionPrivateKey::generate());
        let ctx = SessionContext::background();

        initiator
            .round_trip(&ctx, transport.as_ref(), responder_key, &secret, true, b"one")
            .await
            .expect("first round trip");

        // Simulates a responder restart: all session state is gone.
        responder.flush();

        let response = initiator
            .round_trip(&ctx, transport.as_ref(), responder_key, &secret, true, b"two")
            .await
            .expect("round trip after flush");
        assert_eq!(response, b"owt");
        assert_eq!(transport.handshake_inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allow_list_rejection_surfaces_and_skips_the_handler() {
        let secret = RootObfuscationSecret::generate();
        let permitted = SessionPrivateKey::generate();
        let responder = Arc::new(ResponderSessions::for_known_initiators(
            SessionPrivateKey::generate(),
            secret.clone(),
            vec![permitted.public_key()],
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(TestTransport::new(responder, secret.clone()));
        let ctx = SessionContext::background();

        let stranger = InitiatorSessions::new(SessionPrivateKey::generate());
        let err = stranger
            .round_trip(&ctx, transport.as_ref(), responder_key, &secret, false, b"hi")
            .await
            .expect_err("stranger accepted");
        assert!(err.to_string().contains("unexpected initiator public key"));
        assert_eq!(transport.handler_calls.load(Ordering::SeqCst), 0);

        let known = InitiatorSessions::new(permitted);
        let response = known
            .round_trip(&ctx, transport.as_ref(), responder_key, &secret, false, b"hi")
            .await
            .expect("permitted initiator");
        assert_eq!(response, b"ih");
    }

    #[tokio::test]
    async fn expired_context_never_touches_the_transport() {
        let (initiator, transport, responder_key, secret) = setup();
        let ctx = SessionContext::with_deadline(Instant::now() - Duration::from_millis(1));

        let err = initiator
            .round_trip(&ctx, transport.as_ref(), responder_key, &secret, true, b"late")
            .await
            .expect_err("expired context accepted");
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(transport.transport_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_interrupts_an_in_flight_round_trip() {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(
            TestTransport::new(responder, secret.clone()).with_delay(Duration::from_secs(5)),
        );
        let initiator = Arc::new(InitiatorSessions::new(SessionPrivateKey::generate()));
        let ctx = SessionContext::background();

        let task = {
            let initiator = Arc::clone(&initiator);
            let transport = Arc::clone(&transport);
            let ctx = ctx.clone();
            let secret = secret.clone();
            tokio::spawn(async move {
                initiator
                    .round_trip(&ctx, transport.as_ref(), responder_key, &secret, true, b"x")
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel did not interrupt")
            .expect("task");
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_cold_calls_share_one_handshake() {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(
            TestTransport::new(responder, secret.clone()).with_delay(Duration::from_millis(25)),
        );
        let initiator = Arc::new(InitiatorSessions::new(SessionPrivateKey::generate()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let initiator = Arc::clone(&initiator);
            let transport = Arc::clone(&transport);
            let secret = secret.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = SessionContext::background();
                let request = format!("request {i}");
                let response = initiator
                    .round_trip(
                        &ctx,
                        transport.as_ref(),
                        responder_key,
                        &secret,
                        true,
                        request.as_bytes(),
                    )
                    .await
                    .expect("shared round trip");
                let mut expected = request.into_bytes();
                expected.reverse();
                assert_eq!(response, expected);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        assert_eq!(transport.handshake_inits.load(Ordering::SeqCst), 1);
        assert_eq!(initiator.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unshared_cold_calls_handshake_independently() {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(
            TestTransport::new(responder, secret.clone()).with_delay(Duration::from_millis(25)),
        );
        let initiator = Arc::new(InitiatorSessions::new(SessionPrivateKey::generate()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let initiator = Arc::clone(&initiator);
            let transport = Arc::clone(&transport);
            let secret = secret.clone();
            tasks.push(tokio::spawn(async move {
                let ctx = SessionContext::background();
                initiator
                    .round_trip(&ctx, transport.as_ref(), responder_key, &secret, false, b"solo")
                    .await
                    .expect("round trip")
            }));
        }
        for task in tasks {
            assert_eq!(task.await.expect("task"), b"olos");
        }

        assert_eq!(transport.handshake_inits.load(Ordering::SeqCst), 4);
        // The cache converges on one session per responder.
        assert_eq!(initiator.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn many_initiators_under_load() {
        let secret = RootObfuscationSecret::generate();
        let responder = Arc::new(ResponderSessions::new(
            SessionPrivateKey::generate(),
            secret.clone(),
        ));
        let responder_key = responder.public_key();
        let transport = Arc::new(TestTransport::new(Arc::clone(&responder), secret.clone()));

        let mut clients = Vec::new();
        for i in 0..8 {
            let transport = Arc::clone(&transport);
            let secret = secret.clone();
            clients.push(tokio::spawn(async move {
                let initiator = Arc::new(InitiatorSessions::new(SessionPrivateKey::generate()));
                let share = i % 2 == 0;
                for burst in 0..2 {
                    let mut requests = Vec::new();
                    for j in 0..5 {
                        let initiator = Arc::clone(&initiator);
                        let transport = Arc::clone(&transport);
                        let secret = secret.clone();
                        requests.push(tokio::spawn(async move {
                            let ctx = SessionContext::with_timeout(Duration::from_secs(30));
                            let request = format!("client {i} burst {burst} request {j}");
                            let response = initiator
                                .round_trip(
                                    &ctx,
                                    transport.as_ref(),
                                    responder_key,
                                    &secret,
                                    share,
                                    request.as_bytes(),
                                )
                                .await
                                .expect("round trip");
                            let mut expected = request.into_bytes();
                            expected.reverse();
                            assert_eq!(response, expected);
                        }));
                    }
                    for request in requests {
                        request.await.expect("request task");
                    }
                }
            }));
        }
        for client in clients {
            client.await.expect("client task");
        }

        // Every client established at least one session with the responder.
        assert!(responder.session_count() >= 8);
    }
}
