//! Datagram transport abstraction
//!
//! The device and peers speak [`PacketTransport`] rather than a socket type
//! directly, so the whole engine runs unchanged over real UDP or over an
//! in-memory link in tests. Datagram semantics only: unreliable, unordered,
//! message-boundary preserving.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::error::NetworkError;

#[async_trait]
pub trait PacketTransport: Send + Sync + 'static {
    /// Send one datagram to `to`
    async fn send(&self, data: &[u8], to: SocketAddr) -> Result<(), NetworkError>;

    /// Receive one datagram into `buf`, returning its length and source
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetworkError>;

    fn local_addr(&self) -> Result<SocketAddr, NetworkError>;
}

/// Production transport over a tokio UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl PacketTransport for UdpTransport {
    async fn send(&self, data: &[u8], to: SocketAddr) -> Result<(), NetworkError> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetworkError> {
        self.socket
            .recv_from(buf)
            .await
            .map_err(|e| NetworkError::ReceiveFailed {
                reason: e.to_string(),
            })
    }

    fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.socket.local_addr()?)
    }
}

type Datagram = (Vec<u8>, SocketAddr);

/// One end of an in-memory datagram link.
///
/// Delivery is lossless and ordered by default; [`MemoryTransport::
/// drop_next`] arms silent loss of the next N sends to exercise retry paths.
pub struct MemoryTransport {
    local: SocketAddr,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    drop_remaining: Arc<AtomicU32>,
}

/// A connected pair of in-memory transports
pub fn memory_link(a_addr: SocketAddr, b_addr: SocketAddr) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    (
        MemoryTransport {
            local: a_addr,
            tx: a_tx,
            rx: Mutex::new(a_rx),
            drop_remaining: Arc::new(AtomicU32::new(0)),
        },
        MemoryTransport {
            local: b_addr,
            tx: b_tx,
            rx: Mutex::new(b_rx),
            drop_remaining: Arc::new(AtomicU32::new(0)),
        },
    )
}

impl MemoryTransport {
    /// Silently discard the next `n` outgoing datagrams
    pub fn drop_next(&self, n: u32) {
        self.drop_remaining.store(n, Ordering::Relaxed);
    }

    fn should_drop(&self) -> bool {
        self.drop_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PacketTransport for MemoryTransport {
    async fn send(&self, data: &[u8], _to: SocketAddr) -> Result<(), NetworkError> {
        if self.should_drop() {
            return Ok(());
        }
        self.tx
            .send((data.to_vec(), self.local))
            .map_err(|_| NetworkError::ChannelClosed)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NetworkError> {
        let (data, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetworkError::ChannelClosed)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.local)
    }
}
