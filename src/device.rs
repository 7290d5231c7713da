//! The device: peer registry, session-index routing, and the two I/O loops
//!
//! Routing is two-tiered. Handshake initiations identify the sender
//! cryptographically and are routed through the public-key map; everything
//! else carries a receiver index that resolves through the
//! [`SessionIndexTable`]. Unknown indices and malformed datagrams are logged
//! and dropped without ever answering the remote.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::Instrument;

use crate::error::{ProtocolError, Result};
use crate::keys::{NoisePrivateKey, NoisePublicKey};
use crate::net::PacketTransport;
use crate::peer::{Peer, PeerConnectionInfo};
use crate::pool::{PacketBuf, PacketPool, RcPacket};
use crate::protocol::handshake;
use crate::protocol::messages::{self, Message};
use crate::tun::TunInterface;

/// Pooled buffers kept around for the data path
const POOL_SIZE: usize = 256;

/// Maps small local session indices to the peers that own them.
///
/// A slot holds a weak reference so a removed peer cannot be revived through
/// a stale index. Slots are reused only after an explicit [`free`]; at most
/// one live mapping exists per index.
///
/// [`free`]: SessionIndexTable::free
pub struct SessionIndexTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    slots: Vec<Option<Weak<Peer>>>,
    free: VecDeque<u32>,
}

impl SessionIndexTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: Vec::new(),
                free: VecDeque::new(),
            }),
        }
    }

    /// Claim an index for `peer`
    pub fn allocate(&self, peer: &Arc<Peer>) -> u32 {
        self.allocate_slot(Arc::downgrade(peer))
    }

    fn allocate_slot(&self, peer: Weak<Peer>) -> u32 {
        let mut inner = self.inner.lock().expect("index table poisoned");
        match inner.free.pop_front() {
            Some(index) => {
                inner.slots[index as usize] = Some(peer);
                index
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Some(peer));
                index
            }
        }
    }

    /// Release an index for reuse. Freeing an already-free index is a no-op.
    pub fn free(&self, index: u32) {
        let mut inner = self.inner.lock().expect("index table poisoned");
        if let Some(slot) = inner.slots.get_mut(index as usize) {
            if slot.take().is_some() {
                inner.free.push_back(index);
            }
        }
    }

    pub fn lookup(&self, index: u32) -> Option<Arc<Peer>> {
        self.inner
            .lock()
            .expect("index table poisoned")
            .slots
            .get(index as usize)?
            .as_ref()?
            .upgrade()
    }

    #[cfg(test)]
    pub(crate) fn test_allocate(&self) -> u32 {
        self.allocate_slot(Weak::new())
    }
}

impl Default for SessionIndexTable {
    fn default() -> Self {
        Self::new()
    }
}

struct PeerEntry {
    peer: Arc<Peer>,
    worker: tokio::task::JoinHandle<()>,
}

pub struct Device {
    local: NoisePrivateKey,
    transport: Arc<dyn PacketTransport>,
    tun: Arc<dyn TunInterface>,
    pool: PacketPool,
    peers: RwLock<HashMap<NoisePublicKey, PeerEntry>>,
    table: Arc<SessionIndexTable>,
}

impl Device {
    pub fn new(
        local: NoisePrivateKey,
        transport: Arc<dyn PacketTransport>,
        tun: Arc<dyn TunInterface>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            transport,
            tun,
            pool: PacketPool::new(POOL_SIZE),
            peers: RwLock::new(HashMap::new()),
            table: Arc::new(SessionIndexTable::new()),
        })
    }

    pub fn public_key(&self) -> &NoisePublicKey {
        self.local.public_key()
    }

    /// Register a peer and start its worker group
    pub fn add_peer(&self, info: PeerConnectionInfo) -> Result<Arc<Peer>> {
        let mut peers = self.peers.write().expect("peer map poisoned");
        if peers.contains_key(&info.remote_static) {
            return Err(ProtocolError::DuplicatePeer {
                fingerprint: info.remote_static.fingerprint(),
            }
            .into());
        }

        let fingerprint = info.remote_static.fingerprint();
        let remote_static = info.remote_static;
        let peer = Peer::new(
            info,
            self.local.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.tun),
            self.pool.clone(),
            Arc::clone(&self.table),
        );

        let worker = {
            let peer = Arc::clone(&peer);
            let span = tracing::info_span!("peer", id = %fingerprint);
            tokio::spawn(
                async move {
                    if let Err(e) = peer.run().await {
                        tracing::error!("peer worker group failed: {}", e);
                    }
                }
                .instrument(span),
            )
        };

        peers.insert(remote_static, PeerEntry { peer: Arc::clone(&peer), worker });
        tracing::info!(peer = %fingerprint, "peer registered");
        Ok(peer)
    }

    /// Unregister a peer, stopping its workers and freeing its indices
    pub fn remove_peer(&self, key: &NoisePublicKey) -> Result<()> {
        let entry = self
            .peers
            .write()
            .expect("peer map poisoned")
            .remove(key)
            .ok_or_else(|| ProtocolError::UnknownPeer {
                fingerprint: key.fingerprint(),
            })?;

        entry.worker.abort();
        entry.peer.shutdown();
        tracing::info!(peer = %key.fingerprint(), "peer removed");
        Ok(())
    }

    pub fn peer(&self, key: &NoisePublicKey) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peer map poisoned")
            .get(key)
            .map(|entry| Arc::clone(&entry.peer))
    }

    /// Run the UDP and tun loops until either fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tokio::try_join!(self.udp_loop(), self.tun_loop())?;
        Ok(())
    }

    async fn udp_loop(&self) -> Result<()> {
        loop {
            let mut buf = self.pool.acquire();
            let (len, src) = self.transport.recv(buf.space()).await?;
            buf.set_len(len);
            self.route_datagram(buf, src);
        }
    }

    fn route_datagram(&self, datagram: PacketBuf, src: SocketAddr) {
        match messages::parse(&datagram) {
            Ok(Message::Initiation(initiation)) => {
                if initiation.verify_mac1(self.local.public_key()).is_err() {
                    tracing::debug!(%src, "dropping initiation: bad mac1");
                    return;
                }
                match handshake::respond(&self.local, &initiation) {
                    Ok((who, pending)) => match self.peer(&who) {
                        Some(peer) => peer.session_manager().deliver_initiation(pending, src),
                        None => {
                            tracing::debug!(
                                peer = %who.fingerprint(),
                                "dropping initiation: unknown peer"
                            );
                        }
                    },
                    Err(e) => {
                        tracing::debug!(%src, "dropping initiation: {}", e);
                    }
                }
            }
            Ok(Message::Response(response)) => {
                if response.verify_mac1(self.local.public_key()).is_err() {
                    tracing::debug!(%src, "dropping response: bad mac1");
                    return;
                }
                match self.table.lookup(response.receiver_index) {
                    Some(peer) => peer.session_manager().deliver_response(response, src),
                    None => {
                        tracing::debug!(
                            index = response.receiver_index,
                            "dropping response: unknown index"
                        );
                    }
                }
            }
            Ok(Message::Transport(view)) => {
                let (index, counter) = (view.receiver_index, view.counter);
                match self.table.lookup(index) {
                    // The pooled buffer rides along; no per-packet copy
                    Some(peer) => peer.handle_transport(counter, datagram, src),
                    None => {
                        tracing::debug!(index, "dropping transport packet: unknown index");
                    }
                }
            }
            Ok(Message::CookieReply) => {
                tracing::debug!(%src, "dropping cookie reply: not supported");
            }
            Err(e) => {
                tracing::debug!(%src, "dropping datagram: {}", e);
            }
        }
    }

    async fn tun_loop(&self) -> Result<()> {
        loop {
            let mut buf = self.pool.acquire();
            let len = self.tun.read(buf.space()).await?;
            buf.set_len(len);

            let Some(dst) = dst_address(&buf) else {
                tracing::trace!("dropping tun packet: not IPv4/IPv6");
                continue;
            };

            let targets: Vec<Arc<Peer>> = {
                let peers = self.peers.read().expect("peer map poisoned");
                peers
                    .values()
                    .filter(|entry| entry.peer.routes(dst))
                    .map(|entry| Arc::clone(&entry.peer))
                    .collect()
            };
            if targets.is_empty() {
                tracing::trace!(%dst, "dropping tun packet: no matching peer");
                continue;
            }

            let packet = RcPacket::new(buf);
            for peer in &targets {
                match packet.retain() {
                    Ok(handle) => Arc::clone(peer).send_payload(handle),
                    Err(_) => break,
                }
            }
        }
    }
}

/// Extract the destination address from the IP version nibble onward
fn dst_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NoisePresharedKey;
    use crate::net::{memory_link, MemoryTransport};
    use crate::protocol::session::DEFAULT_KEEPALIVE;
    use crate::tun::{channel_tun, TunHandle};
    use std::time::Duration;
    use tokio::time;

    #[test]
    fn test_index_table_allocates_unique_indices() {
        let table = SessionIndexTable::new();

        let a = table.test_allocate();
        let b = table.test_allocate();
        let c = table.test_allocate();
        assert_eq!((a, b, c), (0, 1, 2));

        // Freed slots are reused before the table grows
        table.free(b);
        assert_eq!(table.test_allocate(), b);
        assert_eq!(table.test_allocate(), 3);

        // Double free does not duplicate the slot
        table.free(a);
        table.free(a);
        assert_eq!(table.test_allocate(), a);
        assert_eq!(table.test_allocate(), 4);
    }

    #[test]
    fn test_freed_index_resolves_to_nothing() {
        let table = SessionIndexTable::new();
        let index = table.test_allocate();

        table.free(index);
        assert!(table.lookup(index).is_none());
        assert!(table.lookup(999).is_none());
    }

    #[test]
    fn test_dst_address_extraction() {
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[16..20].copy_from_slice(&[10, 0, 0, 2]);
        assert_eq!(dst_address(&v4), Some("10.0.0.2".parse().unwrap()));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[24..40].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(dst_address(&v6), Some("::1".parse().unwrap()));

        assert_eq!(dst_address(&[0x45; 4]), None);
        assert_eq!(dst_address(&[]), None);
        assert_eq!(dst_address(&[0x25; 20]), None);
    }

    struct TestNode {
        device: Arc<Device>,
        tun: TunHandle,
        key: NoisePrivateKey,
    }

    fn node(transport: MemoryTransport) -> TestNode {
        let key = NoisePrivateKey::generate();
        let (tun, handle) = channel_tun(1420);
        let device = Device::new(key.clone(), Arc::new(transport), Arc::new(tun));
        TestNode {
            device,
            tun: handle,
            key,
        }
    }

    fn link_peers(a: &TestNode, b: &TestNode, a_knows_endpoint: Option<SocketAddr>) {
        a.device
            .add_peer(PeerConnectionInfo {
                remote_static: *b.key.public_key(),
                preshared_key: NoisePresharedKey::zero(),
                endpoint: a_knows_endpoint,
                keepalive_interval: DEFAULT_KEEPALIVE,
                allowed_ips: vec!["10.0.0.2/32".parse().unwrap()],
            })
            .unwrap();
        b.device
            .add_peer(PeerConnectionInfo {
                remote_static: *a.key.public_key(),
                preshared_key: NoisePresharedKey::zero(),
                endpoint: None,
                keepalive_interval: DEFAULT_KEEPALIVE,
                allowed_ips: vec!["10.0.0.1/32".parse().unwrap()],
            })
            .unwrap();
    }

    fn ipv4_packet(dst: [u8; 4], total_len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; total_len];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    async fn wait_established(device: &Arc<Device>, key: &NoisePublicKey) {
        let peer = device.peer(key).unwrap();
        time::timeout(Duration::from_secs(120), async {
            while !peer.is_established() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session not established");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_tunnel() {
        let a_addr: SocketAddr = "10.99.0.1:51820".parse().unwrap();
        let b_addr: SocketAddr = "10.99.0.2:51820".parse().unwrap();
        let (a_tr, b_tr) = memory_link(a_addr, b_addr);

        let a = node(a_tr);
        let b = node(b_tr);
        link_peers(&a, &b, Some(b_addr));

        tokio::spawn(Arc::clone(&a.device).run());
        tokio::spawn(Arc::clone(&b.device).run());

        wait_established(&a.device, b.key.public_key()).await;

        let packet = ipv4_packet([10, 0, 0, 2], 113);
        a.tun.inject(packet.clone());

        let delivered = time::timeout(Duration::from_secs(30), b.tun.delivered())
            .await
            .expect("no packet delivered")
            .unwrap();
        assert_eq!(delivered, packet);

        // One handshake carried the whole exchange
        let a_peer = a.device.peer(b.key.public_key()).unwrap();
        let b_peer = b.device.peer(a.key.public_key()).unwrap();
        assert_eq!(a_peer.handshake_count(), 1);
        assert_eq!(b_peer.handshake_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_retries_after_initiation_loss() {
        let a_addr: SocketAddr = "10.99.0.1:51820".parse().unwrap();
        let b_addr: SocketAddr = "10.99.0.2:51820".parse().unwrap();
        let (a_tr, b_tr) = memory_link(a_addr, b_addr);

        // First initiation vanishes; the second attempt must succeed
        a_tr.drop_next(1);

        let a = node(a_tr);
        let b = node(b_tr);
        link_peers(&a, &b, Some(b_addr));

        tokio::spawn(Arc::clone(&a.device).run());
        tokio::spawn(Arc::clone(&b.device).run());

        wait_established(&a.device, b.key.public_key()).await;

        let packet = ipv4_packet([10, 0, 0, 2], 64);
        a.tun.inject(packet.clone());
        let delivered = time::timeout(Duration::from_secs(60), b.tun.delivered())
            .await
            .expect("no packet delivered")
            .unwrap();
        assert_eq!(delivered, packet);

        let a_peer = a.device.peer(b.key.public_key()).unwrap();
        assert_eq!(a_peer.handshake_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_packets_arrive_in_order() {
        let a_addr: SocketAddr = "10.99.0.1:51820".parse().unwrap();
        let b_addr: SocketAddr = "10.99.0.2:51820".parse().unwrap();
        let (a_tr, b_tr) = memory_link(a_addr, b_addr);

        let a = node(a_tr);
        let b = node(b_tr);
        link_peers(&a, &b, Some(b_addr));

        tokio::spawn(Arc::clone(&a.device).run());
        tokio::spawn(Arc::clone(&b.device).run());

        wait_established(&a.device, b.key.public_key()).await;

        let packets: Vec<Vec<u8>> = (0..32u8)
            .map(|i| {
                let mut p = ipv4_packet([10, 0, 0, 2], 40 + i as usize);
                p[20] = i;
                p
            })
            .collect();
        for packet in &packets {
            a.tun.inject(packet.clone());
        }

        for expected in &packets {
            let delivered = time::timeout(Duration::from_secs(30), b.tun.delivered())
                .await
                .expect("missing packet")
                .unwrap();
            assert_eq!(&delivered, expected);
        }
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let (a_tr, _b_tr) = memory_link(
            "10.99.0.1:1".parse().unwrap(),
            "10.99.0.2:1".parse().unwrap(),
        );
        let a = node(a_tr);
        let other = NoisePrivateKey::generate();

        let info = PeerConnectionInfo {
            remote_static: *other.public_key(),
            preshared_key: NoisePresharedKey::zero(),
            endpoint: None,
            keepalive_interval: DEFAULT_KEEPALIVE,
            allowed_ips: vec![],
        };
        a.device.add_peer(info.clone()).unwrap();
        assert!(a.device.add_peer(info).is_err());

        a.device.remove_peer(other.public_key()).unwrap();
        assert!(a.device.peer(other.public_key()).is_none());
    }
}
