//! TUN device abstraction
//!
//! The engine reads and writes IP packets through [`TunInterface`]; the
//! production implementation wraps a tun-rs `AsyncDevice` (utun on macOS,
//! /dev/net/tun on Linux), and tests use a channel-backed stand-in so the
//! full data path runs without privileges.

use std::net::Ipv4Addr;
use std::ops::Deref;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::error::TunnelError;

#[async_trait]
pub trait TunInterface: Send + Sync + 'static {
    /// Read one IP packet
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Write one IP packet
    async fn write(&self, packet: &[u8]) -> Result<usize, TunnelError>;

    fn mtu(&self) -> u16;
}

/// A real TUN device
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
    mtu: u16,
}

impl TunDevice {
    pub async fn create(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self, TunnelError> {
        check_privileges()?;

        let device = DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        tracing::info!(
            "Created TUN device: {} with address {}/{}",
            name,
            address,
            prefix_len
        );

        Ok(Self { device, name, mtu })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl TunInterface for TunDevice {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.device
            .recv(buf)
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, TunnelError> {
        self.device
            .send(packet)
            .await
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

fn check_privileges() -> Result<(), TunnelError> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; let creation decide
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./driftvpn");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Channel-backed tun for tests.
///
/// [`TunHandle`] plays the host network stack: it injects packets the engine
/// will read and collects packets the engine writes.
pub struct ChannelTun {
    to_engine: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    from_engine: mpsc::UnboundedSender<Vec<u8>>,
    mtu: u16,
}

pub struct TunHandle {
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    delivered_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

pub fn channel_tun(mtu: u16) -> (ChannelTun, TunHandle) {
    let (inject_tx, to_engine) = mpsc::unbounded_channel();
    let (from_engine, delivered_rx) = mpsc::unbounded_channel();

    (
        ChannelTun {
            to_engine: Mutex::new(to_engine),
            from_engine,
            mtu,
        },
        TunHandle {
            inject_tx,
            delivered_rx: Mutex::new(delivered_rx),
        },
    )
}

impl TunHandle {
    /// Queue a packet for the engine to read from the tun
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inject_tx.send(packet);
    }

    /// Next packet the engine wrote to the tun
    pub async fn delivered(&self) -> Option<Vec<u8>> {
        self.delivered_rx.lock().await.recv().await
    }
}

#[async_trait]
impl TunInterface for ChannelTun {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let packet = self
            .to_engine
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TunnelError::ReadFailed {
                reason: "tun channel closed".to_string(),
            })?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, TunnelError> {
        self.from_engine
            .send(packet.to_vec())
            .map_err(|_| TunnelError::WriteFailed {
                reason: "tun channel closed".to_string(),
            })?;
        Ok(packet.len())
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_both_directions() {
        let (tun, handle) = channel_tun(1420);
        assert_eq!(tun.mtu(), 1420);

        handle.inject(vec![0x45, 0, 0, 20]);
        let mut buf = [0u8; 64];
        let len = tun.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x45, 0, 0, 20]);

        tun.write(b"decrypted payload").await.unwrap();
        assert_eq!(handle.delivered().await.unwrap(), b"decrypted payload");
    }
}
