//! A configured remote peer and its worker loops
//!
//! Each peer runs three maintenance loops under `try_join!` (initiator,
//! responder, keepalive) plus the per-packet data path driven by the device's
//! I/O loops. A loop error tears down this peer's worker group only; other
//! peers are unaffected.
//!
//! Data-path ordering: both directions register an [`OrderTicket`] at packet
//! arrival, run the AEAD on a spawned task, and emit through the ticket, so
//! decrypted packets hit the tun in UDP receive order and encrypted packets
//! hit the socket in tun read order. Outbound counters are reserved at
//! registration time, making the counter sequence match emission order.

mod session_manager;

pub use session_manager::SessionManager;

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::time;

use crate::device::SessionIndexTable;
use crate::error::{NetworkError, ProtocolError, Result};
use crate::keys::{NoisePresharedKey, NoisePrivateKey, NoisePublicKey};
use crate::net::PacketTransport;
use crate::pipeline::OrderedDelivery;
use crate::pool::{PacketBuf, PacketPool, RcPacket};
use crate::protocol::handshake::HandshakeInitiator;
use crate::protocol::messages::{encode_transport, TRANSPORT_HEADER};
use crate::protocol::session::EstablishedSession;
use crate::tun::TunInterface;

/// How long one handshake attempt waits for a response
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fresh-handshake attempts before declaring the peer unreachable
pub const HANDSHAKE_ATTEMPTS: u32 = 5;

/// Pause after exhausting attempts before trying again
const ATTEMPT_COOLDOWN: Duration = Duration::from_secs(10);

/// Static configuration for one peer
#[derive(Clone)]
pub struct PeerConnectionInfo {
    pub remote_static: NoisePublicKey,
    pub preshared_key: NoisePresharedKey,
    /// Where to send to; `None` means wait for the remote to initiate
    pub endpoint: Option<SocketAddr>,
    /// Zero disables persistent keepalive
    pub keepalive_interval: Duration,
    /// Destination networks routed to this peer
    pub allowed_ips: Vec<IpNet>,
}

pub struct Peer {
    info: PeerConnectionInfo,
    local: NoisePrivateKey,
    session: SessionManager,
    inbound: OrderedDelivery,
    outbound: OrderedDelivery,
    transport: Arc<dyn PacketTransport>,
    tun: Arc<dyn TunInterface>,
    pool: PacketPool,
    table: Arc<SessionIndexTable>,
}

impl Peer {
    pub fn new(
        info: PeerConnectionInfo,
        local: NoisePrivateKey,
        transport: Arc<dyn PacketTransport>,
        tun: Arc<dyn TunInterface>,
        pool: PacketPool,
        table: Arc<SessionIndexTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            local,
            session: SessionManager::new(),
            inbound: OrderedDelivery::new(),
            outbound: OrderedDelivery::new(),
            transport,
            tun,
            pool,
            table,
        })
    }

    pub fn info(&self) -> &PeerConnectionInfo {
        &self.info
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session
    }

    pub fn handshake_count(&self) -> u64 {
        self.session.handshake_count()
    }

    pub fn is_established(&self) -> bool {
        self.session.live().is_some()
    }

    /// Does this peer route `dst`?
    pub fn routes(&self, dst: std::net::IpAddr) -> bool {
        self.info.allowed_ips.iter().any(|net| net.contains(&dst))
    }

    /// Drop the session and free its routing index
    pub fn shutdown(&self) {
        self.session.clear(&self.table);
    }

    /// Run the maintenance loops until one of them fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let result = tokio::try_join!(
            Arc::clone(&self).initiator_loop(),
            Arc::clone(&self).responder_loop(),
            Arc::clone(&self).keepalive_loop(),
        );
        self.shutdown();
        result.map(|_| ())
    }

    /// Establish and re-establish sessions while we know an endpoint
    async fn initiator_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let mut changed = pin!(self.session.on_change());
            changed.as_mut().enable();

            if let Some(current) = self.session.current() {
                let remaining = current.time_until_expiry();
                if !remaining.is_zero() {
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = time::sleep(remaining) => {}
                    }
                    continue;
                }
            }

            // Only a configured endpoint is dialed; a roamed session endpoint
            // serves replies and keepalives, never re-initiation.
            let Some(endpoint) = self.info.endpoint else {
                changed.await;
                continue;
            };

            let mut installed = false;
            for attempt in 1..=HANDSHAKE_ATTEMPTS {
                if Arc::clone(&self).handshake_attempt(endpoint).await? {
                    installed = true;
                    break;
                }
                tracing::debug!(
                    peer = %self.info.remote_static.fingerprint(),
                    attempt,
                    "handshake attempt failed"
                );
                // A concurrent remote-initiated handshake also counts
                if self.session.live().is_some() {
                    installed = true;
                    break;
                }
            }

            if !installed {
                tracing::warn!(
                    attempts = HANDSHAKE_ATTEMPTS,
                    "{}",
                    ProtocolError::PeerUnreachable {
                        fingerprint: self.info.remote_static.fingerprint()
                    }
                );
                time::sleep(ATTEMPT_COOLDOWN).await;
            }
        }
    }

    /// One initiation round-trip: allocate an index, send, await the
    /// response. Returns whether a session was installed.
    async fn handshake_attempt(self: Arc<Self>, endpoint: SocketAddr) -> Result<bool> {
        let local_index = self.table.allocate(&self);
        let (message, initiator) = match HandshakeInitiator::initiate(
            &self.local,
            &self.info.remote_static,
            &self.info.preshared_key,
            local_index,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                self.table.free(local_index);
                return Err(e);
            }
        };

        // A send failure counts against the attempt budget like a timeout;
        // it must not tear down the worker group.
        if let Err(e) = self.transport.send(&message.to_bytes(), endpoint).await {
            self.table.free(local_index);
            tracing::debug!(
                peer = %self.info.remote_static.fingerprint(),
                "initiation send failed: {}",
                e
            );
            return Ok(false);
        }

        let response = time::timeout(HANDSHAKE_TIMEOUT, self.session.next_response()).await;
        let (response, src) = match response {
            Err(_) => {
                self.table.free(local_index);
                return Ok(false);
            }
            Ok(None) => {
                self.table.free(local_index);
                return Err(NetworkError::ChannelClosed.into());
            }
            Ok(Some(pair)) => pair,
        };

        if response.receiver_index != local_index {
            // Response to a superseded attempt
            self.table.free(local_index);
            return Ok(false);
        }

        match initiator.consume_response(&response) {
            Ok(keypair) => {
                let session = EstablishedSession::new(
                    keypair,
                    response.sender_index,
                    src,
                    self.info.keepalive_interval,
                );
                self.session.install(&self.table, local_index, session);
                tracing::info!(
                    peer = %self.info.remote_static.fingerprint(),
                    endpoint = %src,
                    "session established (initiator)"
                );
                Ok(true)
            }
            Err(e) => {
                // Authentication failure; this ciphertext is never retried
                self.table.free(local_index);
                tracing::warn!(
                    peer = %self.info.remote_static.fingerprint(),
                    "handshake response rejected: {}",
                    e
                );
                Ok(false)
            }
        }
    }

    /// Answer initiations routed to us by the device
    async fn responder_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let Some((pending, src)) = self.session.next_initiation().await else {
                return Err(NetworkError::ChannelClosed.into());
            };

            if self.session.live().is_some() {
                // Duplicate-initiation burst while a session is healthy
                tracing::debug!(
                    peer = %self.info.remote_static.fingerprint(),
                    "ignoring initiation: session live"
                );
                continue;
            }

            if !self.session.accept_timestamp(pending.timestamp()) {
                tracing::debug!(
                    peer = %self.info.remote_static.fingerprint(),
                    "ignoring initiation: stale timestamp"
                );
                continue;
            }

            let remote_index = pending.initiator_index();
            let local_index = self.table.allocate(&self);
            match pending.finish(&self.info.preshared_key, local_index) {
                Ok((response, keypair)) => {
                    if let Err(e) = self.transport.send(&response.to_bytes(), src).await {
                        self.table.free(local_index);
                        tracing::warn!(
                            peer = %self.info.remote_static.fingerprint(),
                            "handshake response send failed: {}",
                            e
                        );
                        continue;
                    }
                    let session = EstablishedSession::new(
                        keypair,
                        remote_index,
                        src,
                        self.info.keepalive_interval,
                    );
                    self.session.install(&self.table, local_index, session);
                    tracing::info!(
                        peer = %self.info.remote_static.fingerprint(),
                        endpoint = %src,
                        "session established (responder)"
                    );
                }
                Err(e) => {
                    self.table.free(local_index);
                    tracing::warn!(
                        peer = %self.info.remote_static.fingerprint(),
                        "failed to complete handshake: {}",
                        e
                    );
                }
            }
        }
    }

    /// Keep NAT mappings warm when the link is idle
    async fn keepalive_loop(self: Arc<Self>) -> Result<()> {
        if self.info.keepalive_interval.is_zero() {
            return Ok(());
        }

        loop {
            let mut changed = pin!(self.session.on_change());
            changed.as_mut().enable();

            let Some(session) = self.session.live() else {
                changed.await;
                continue;
            };

            if session.needs_keepalive() {
                if let Err(e) = self.send_keepalive(&session).await {
                    tracing::warn!(
                        peer = %self.info.remote_static.fingerprint(),
                        "keepalive failed: {}",
                        e
                    );
                    // Back off a full interval before retrying the send
                    tokio::select! {
                        _ = &mut changed => {}
                        _ = time::sleep(self.info.keepalive_interval) => {}
                    }
                }
                continue;
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = self.session.on_keepalive_request() => {
                    if let Err(e) = self.send_keepalive(&session).await {
                        tracing::warn!(
                            peer = %self.info.remote_static.fingerprint(),
                            "keepalive failed: {}",
                            e
                        );
                    }
                }
                _ = time::sleep(session.keepalive_due_in()) => {}
            }
        }
    }

    async fn send_keepalive(&self, session: &EstablishedSession) -> Result<()> {
        let (counter, ciphertext) = session.keypair().seal(&[])?;
        let mut buf = self.pool.acquire();
        encode_transport(&mut buf, session.remote_index(), counter, &ciphertext)?;
        self.transport.send(&buf, session.endpoint()).await?;
        session.mark_send();
        tracing::trace!(
            peer = %self.info.remote_static.fingerprint(),
            "sent keepalive"
        );
        Ok(())
    }

    /// Inbound data path. Called by the device loop in UDP receive order with
    /// the pooled receive buffer (header included); registers the ordering
    /// ticket synchronously, then decrypts off-task.
    pub fn handle_transport(self: Arc<Self>, counter: u64, packet: PacketBuf, src: SocketAddr) {
        let Some(session) = self.session.live() else {
            tracing::debug!(
                peer = %self.info.remote_static.fingerprint(),
                "dropping transport packet: no session"
            );
            return;
        };

        let ticket = self.inbound.register();
        let peer = self;
        tokio::spawn(async move {
            let plaintext = session.keypair().open(counter, &packet[TRANSPORT_HEADER..]);
            // Recycle the receive buffer before queueing behind predecessors
            drop(packet);
            ticket
                .run_ordered(|| async {
                    let plaintext = match plaintext {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!(
                                peer = %peer.info.remote_static.fingerprint(),
                                counter,
                                "dropping transport packet: {}",
                                e
                            );
                            return;
                        }
                    };
                    if let Err(e) = session.keypair().check_replay(counter) {
                        tracing::debug!(
                            peer = %peer.info.remote_static.fingerprint(),
                            "{}",
                            e
                        );
                        return;
                    }
                    // Authenticated traffic updates the roamable endpoint
                    session.set_endpoint(src);
                    if plaintext.is_empty() {
                        tracing::trace!(
                            peer = %peer.info.remote_static.fingerprint(),
                            "received keepalive"
                        );
                        return;
                    }
                    if let Err(e) = peer.tun.write(&plaintext).await {
                        tracing::warn!(
                            peer = %peer.info.remote_static.fingerprint(),
                            "tun write failed: {}",
                            e
                        );
                    }
                })
                .await;
        });
    }

    /// Outbound data path. Called by the device loop in tun read order; the
    /// counter and ordering ticket are both taken synchronously so the wire
    /// counter sequence matches emission order.
    pub fn send_payload(self: Arc<Self>, packet: RcPacket) {
        let Some(session) = self.session.live() else {
            // The initiator loop is already dialing if we have an endpoint
            tracing::debug!(
                peer = %self.info.remote_static.fingerprint(),
                "dropping outbound packet: no session"
            );
            return;
        };

        let counter = match session.keypair().reserve() {
            Ok(counter) => counter,
            Err(e) => {
                tracing::warn!(
                    peer = %self.info.remote_static.fingerprint(),
                    "dropping outbound packet: {}",
                    e
                );
                return;
            }
        };

        let ticket = self.outbound.register();
        let peer = self;
        tokio::spawn(async move {
            let mut packet = packet;
            let sealed = session.keypair().seal_at(counter, packet.data());
            let _ = packet.close();

            ticket
                .run_ordered(|| async {
                    let ciphertext = match sealed {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(
                                peer = %peer.info.remote_static.fingerprint(),
                                "encryption failed: {}",
                                e
                            );
                            return;
                        }
                    };
                    let mut buf = peer.pool.acquire();
                    if encode_transport(&mut buf, session.remote_index(), counter, &ciphertext)
                        .is_err()
                    {
                        tracing::warn!(
                            peer = %peer.info.remote_static.fingerprint(),
                            "outbound packet exceeds buffer capacity"
                        );
                        return;
                    }
                    match peer.transport.send(&buf, session.endpoint()).await {
                        Ok(()) => session.mark_send(),
                        Err(e) => {
                            tracing::warn!(
                                peer = %peer.info.remote_static.fingerprint(),
                                "send failed: {}",
                                e
                            );
                        }
                    }
                })
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::protocol::keypair::SymmetricKeypair;
    use crate::protocol::session::DEFAULT_KEEPALIVE;
    use crate::tun::channel_tun;

    /// Transport whose sends always fail, as on an unreachable network
    #[derive(Default)]
    struct FailingTransport {
        sends: AtomicU32,
    }

    #[async_trait]
    impl PacketTransport for FailingTransport {
        async fn send(
            &self,
            _data: &[u8],
            _to: SocketAddr,
        ) -> std::result::Result<(), NetworkError> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Err(NetworkError::SendFailed {
                reason: "network unreachable".to_string(),
            })
        }

        async fn recv(
            &self,
            _buf: &mut [u8],
        ) -> std::result::Result<(usize, SocketAddr), NetworkError> {
            std::future::pending().await
        }

        fn local_addr(&self) -> std::result::Result<SocketAddr, NetworkError> {
            Ok("10.99.0.1:51820".parse().expect("fixed test address"))
        }
    }

    /// Transport that delivers nowhere but records every send
    #[derive(Default)]
    struct CountingTransport {
        sends: AtomicU32,
    }

    #[async_trait]
    impl PacketTransport for CountingTransport {
        async fn send(
            &self,
            _data: &[u8],
            _to: SocketAddr,
        ) -> std::result::Result<(), NetworkError> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn recv(
            &self,
            _buf: &mut [u8],
        ) -> std::result::Result<(usize, SocketAddr), NetworkError> {
            std::future::pending().await
        }

        fn local_addr(&self) -> std::result::Result<SocketAddr, NetworkError> {
            Ok("10.99.0.1:51820".parse().expect("fixed test address"))
        }
    }

    fn peer_with(
        transport: Arc<dyn PacketTransport>,
        endpoint: Option<SocketAddr>,
        keepalive: Duration,
    ) -> Arc<Peer> {
        let remote = NoisePrivateKey::generate();
        let (tun, _handle) = channel_tun(1420);
        Peer::new(
            PeerConnectionInfo {
                remote_static: *remote.public_key(),
                preshared_key: NoisePresharedKey::zero(),
                endpoint,
                keepalive_interval: keepalive,
                allowed_ips: vec![],
            },
            NoisePrivateKey::generate(),
            transport,
            Arc::new(tun),
            PacketPool::new(4),
            Arc::new(SessionIndexTable::new()),
        )
    }

    fn install_session(peer: &Arc<Peer>) -> Arc<EstablishedSession> {
        let index = peer.table.allocate(peer);
        let session = EstablishedSession::new(
            SymmetricKeypair::new([1u8; 32], [2u8; 32]),
            9,
            "10.99.0.2:51820".parse().unwrap(),
            peer.info.keepalive_interval,
        );
        peer.session.install(&peer.table, index, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_consumes_attempt_budget_and_peer_survives() {
        let transport = Arc::new(FailingTransport::default());
        let peer = peer_with(
            Arc::clone(&transport) as Arc<dyn PacketTransport>,
            Some("10.99.0.2:51820".parse().unwrap()),
            Duration::ZERO,
        );

        let worker = tokio::spawn(Arc::clone(&peer).run());
        time::sleep(Duration::from_secs(60)).await;

        assert!(
            !worker.is_finished(),
            "worker group must outlive send failures"
        );
        assert!(transport.sends.load(Ordering::Relaxed) >= HANDSHAKE_ATTEMPTS);
        assert_eq!(peer.handshake_count(), 0);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_keepalive_backs_off() {
        let transport = Arc::new(FailingTransport::default());
        let peer = peer_with(
            Arc::clone(&transport) as Arc<dyn PacketTransport>,
            None,
            DEFAULT_KEEPALIVE,
        );
        let session = install_session(&peer);

        let worker = tokio::spawn(Arc::clone(&peer).run());
        time::sleep(Duration::from_secs(100)).await;

        // One attempt per interval; a failing transport must not burn a
        // counter per loop iteration
        let attempts = session.keypair().send_counter();
        assert!(attempts >= 2, "keepalives were never attempted");
        assert!(attempts <= 8, "keepalive retries did not back off: {attempts}");
        assert!(!worker.is_finished());
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_endpoint_never_dialed() {
        let transport = Arc::new(CountingTransport::default());
        let peer = peer_with(
            Arc::clone(&transport) as Arc<dyn PacketTransport>,
            None,
            Duration::ZERO,
        );
        install_session(&peer);

        let worker = tokio::spawn(Arc::clone(&peer).run());
        // Run well past session expiry
        time::sleep(Duration::from_secs(300)).await;

        assert_eq!(
            transport.sends.load(Ordering::Relaxed),
            0,
            "a roamed session endpoint must never be dialed for re-initiation"
        );
        assert!(!worker.is_finished());
        worker.abort();
    }
}
