//! Per-peer session state
//!
//! One manager per peer owns the single current session, the handshake
//! inboxes, and the wakeup plumbing shared by the peer's worker loops. All
//! session transitions funnel through [`SessionManager::install`], which
//! enforces the ordering that matters for routing: the superseded session's
//! index is freed before the replacement becomes visible, so a stale index
//! never resolves to fresh keys.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tai64::Tai64N;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};

use crate::device::SessionIndexTable;
use crate::protocol::handshake::ResponderHandshake;
use crate::protocol::messages::HandshakeResponse;
use crate::protocol::session::EstablishedSession;

/// Single-slot mailbox. A full inbox drops the offered message; handshake
/// traffic is retried by the protocol, never queued.
struct Inbox<T> {
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> Inbox<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn offer(&self, item: T) -> bool {
        self.tx.try_send(item).is_ok()
    }

    async fn take(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

#[derive(Default)]
struct State {
    current: Option<Arc<EstablishedSession>>,
    current_index: Option<u32>,
    greatest_timestamp: Option<Tai64N>,
}

pub struct SessionManager {
    state: Mutex<State>,
    changed: Notify,
    keepalive_kick: Notify,
    responses: Inbox<(HandshakeResponse, SocketAddr)>,
    initiations: Inbox<(ResponderHandshake, SocketAddr)>,
    handshakes: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            keepalive_kick: Notify::new(),
            responses: Inbox::new(),
            initiations: Inbox::new(),
            handshakes: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<EstablishedSession>> {
        self.state.lock().expect("session state poisoned").current.clone()
    }

    /// A live (installed and unexpired) session, if any
    pub fn live(&self) -> Option<Arc<EstablishedSession>> {
        self.current().filter(|s| !s.is_expired())
    }

    /// Future that resolves on the next session change. Callers must
    /// `enable()` it before re-checking state to avoid a lost wakeup.
    pub fn on_change(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Ask the keepalive loop to send immediately
    pub fn request_keepalive(&self) {
        self.keepalive_kick.notify_one();
    }

    pub fn on_keepalive_request(&self) -> Notified<'_> {
        self.keepalive_kick.notified()
    }

    /// Completed handshakes over the peer's lifetime
    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    /// Hand a handshake response to the waiting initiator. Dropped if no
    /// attempt is listening.
    pub fn deliver_response(&self, response: HandshakeResponse, src: SocketAddr) {
        if !self.responses.offer((response, src)) {
            tracing::debug!("dropping handshake response: no attempt waiting");
        }
    }

    pub async fn next_response(&self) -> Option<(HandshakeResponse, SocketAddr)> {
        self.responses.take().await
    }

    /// Hand a decrypted initiation to the responder loop. Dropped if one is
    /// already being processed.
    pub fn deliver_initiation(&self, pending: ResponderHandshake, src: SocketAddr) {
        if !self.initiations.offer((pending, src)) {
            tracing::debug!("dropping handshake initiation: responder busy");
        }
    }

    pub async fn next_initiation(&self) -> Option<(ResponderHandshake, SocketAddr)> {
        self.initiations.take().await
    }

    /// Accept an initiation timestamp only if it is strictly newer than any
    /// previously accepted one. Rejects replayed initiations.
    pub fn accept_timestamp(&self, timestamp: Tai64N) -> bool {
        let mut state = self.state.lock().expect("session state poisoned");
        match state.greatest_timestamp {
            Some(greatest) if timestamp <= greatest => false,
            _ => {
                state.greatest_timestamp = Some(timestamp);
                true
            }
        }
    }

    /// Install a freshly negotiated session, retiring the previous one.
    ///
    /// The old session's index is freed before the new session is published.
    pub fn install(
        &self,
        table: &SessionIndexTable,
        local_index: u32,
        session: EstablishedSession,
    ) -> Arc<EstablishedSession> {
        let session = Arc::new(session);
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if let Some(old_index) = state.current_index.take() {
                table.free(old_index);
            }
            state.current = Some(Arc::clone(&session));
            state.current_index = Some(local_index);
        }
        self.handshakes.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_waiters();
        session
    }

    /// Drop the current session and free its index (peer teardown)
    pub fn clear(&self, table: &SessionIndexTable) {
        let mut state = self.state.lock().expect("session state poisoned");
        if let Some(index) = state.current_index.take() {
            table.free(index);
        }
        state.current = None;
        drop(state);
        self.changed.notify_waiters();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
