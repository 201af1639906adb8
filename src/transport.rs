//! Transport abstraction and cancellable request contexts.
//!
//! The session layer never touches sockets. An initiator hands each request
//! to a [`RoundTripper`], which delivers opaque envelope bytes to the peer
//! responder by whatever means the application chose and returns the peer's
//! envelope reply. A [`SessionContext`] carries the deadline and cancellation
//! state for one logical operation across its retries and handshakes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::SessionError;

/// Delivers one opaque request envelope and returns the peer's reply envelope.
///
/// Implementations carry no session semantics; they move bytes. The same
/// round tripper may be reused across handshake and transport messages of
/// many sessions.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    /// Sends `request` and awaits the corresponding response envelope.
    async fn round_trip(
        &self,
        ctx: &SessionContext,
        request: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    /// Releases any underlying connection state.
    async fn close(&self) -> anyhow::Result<()>;
}

struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// Deadline and cancellation scope for one logical operation.
#[derive(Clone)]
pub struct SessionContext {
    deadline: Option<Instant>,
    state: Arc<CancelState>,
}

impl SessionContext {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self {
            deadline: None,
            state: Arc::new(CancelState {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            state: Arc::new(CancelState {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancels the operation; all clones observe it.
    pub fn cancel(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.state.flag.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Fails fast when the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the context is cancelled or its deadline passes. Never
    /// resolves for a background context that is never cancelled.
    pub async fn done(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Arm before re-checking the flag so a cancel between the check and
        // the await is not lost.
        notified.as_mut().enable();
        if self.state.flag.load(Ordering::SeqCst) {
            return;
        }
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => notified.await,
        }
    }
}
