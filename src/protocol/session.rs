//! An established transport session
//!
//! Immutable once installed except for the roamable endpoint and send
//! bookkeeping. Sessions are never rekeyed in place: expiry or counter
//! exhaustion retires the whole session and the session manager installs a
//! replacement.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::keypair::SymmetricKeypair;

/// Hard session lifetime; a session past this age is unusable in both
/// directions
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(120);

/// Default persistent-keepalive interval
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

pub struct EstablishedSession {
    keypair: SymmetricKeypair,
    remote_index: u32,
    endpoint: Mutex<SocketAddr>,
    expires_at: Instant,
    keepalive_interval: Duration,
    last_send: Mutex<Instant>,
}

impl EstablishedSession {
    pub fn new(
        keypair: SymmetricKeypair,
        remote_index: u32,
        endpoint: SocketAddr,
        keepalive_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            keypair,
            remote_index,
            endpoint: Mutex::new(endpoint),
            expires_at: now + REJECT_AFTER_TIME,
            keepalive_interval,
            last_send: Mutex::new(now),
        }
    }

    pub fn keypair(&self) -> &SymmetricKeypair {
        &self.keypair
    }

    /// The index the remote chose; goes into every outgoing transport header
    pub fn remote_index(&self) -> u32 {
        self.remote_index
    }

    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.lock().expect("endpoint poisoned")
    }

    /// Roaming: adopt the source address of the latest authenticated packet
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock().expect("endpoint poisoned") = endpoint;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Zero once expired; the rekey loop sleeps on this
    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Record outbound traffic, deferring the next keepalive
    pub fn mark_send(&self) {
        *self.last_send.lock().expect("last_send poisoned") = Instant::now();
    }

    /// True when nothing has been sent for a full keepalive interval
    pub fn needs_keepalive(&self) -> bool {
        self.last_send
            .lock()
            .expect("last_send poisoned")
            .elapsed()
            >= self.keepalive_interval
    }

    /// Time until the next keepalive would be due, given the last send
    pub fn keepalive_due_in(&self) -> Duration {
        let since_send = self
            .last_send
            .lock()
            .expect("last_send poisoned")
            .elapsed();
        self.keepalive_interval.saturating_sub(since_send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn session(keepalive: Duration) -> EstablishedSession {
        EstablishedSession::new(
            SymmetricKeypair::new([1u8; 32], [2u8; 32]),
            42,
            "127.0.0.1:51820".parse().unwrap(),
            keepalive,
        )
    }

    #[test]
    fn test_fresh_session_is_live() {
        let s = session(DEFAULT_KEEPALIVE);
        assert!(!s.is_expired());
        assert!(s.time_until_expiry() > Duration::from_secs(100));
        assert_eq!(s.remote_index(), 42);
    }

    #[test]
    fn test_endpoint_roaming() {
        let s = session(DEFAULT_KEEPALIVE);
        let roamed: SocketAddr = "10.0.0.9:7777".parse().unwrap();

        s.set_endpoint(roamed);
        assert_eq!(s.endpoint(), roamed);
    }

    #[test]
    fn test_keepalive_due_after_idle_interval() {
        let s = session(Duration::from_millis(20));
        assert!(!s.needs_keepalive());

        thread::sleep(Duration::from_millis(30));
        assert!(s.needs_keepalive());

        s.mark_send();
        assert!(!s.needs_keepalive());
        assert!(s.keepalive_due_in() > Duration::ZERO);
    }
}
