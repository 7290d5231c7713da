//! DriftVPN - Userspace WireGuard engine
//!
//! A WireGuard implementation built around a concurrent transport pipeline:
//! AEAD work runs on many tasks at once while packets are still emitted in
//! arrival order.
//!
//! # Features
//!
//! - Full Noise_IKpsk2 handshake with preshared-key support
//! - Per-peer session management (initiate, respond, rekey, keepalive)
//! - Ordered concurrent encrypt/decrypt pipeline
//! - Pooled, reference-counted packet buffers
//! - TUN device support (macOS, Linux) behind a trait
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use driftvpn::{config::DeviceConfig, Device};
//! use driftvpn::net::UdpTransport;
//! use driftvpn::protocol::DEFAULT_KEEPALIVE;
//! use driftvpn::tun::TunDevice;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeviceConfig::from_file("wg0.conf")?;
//!     let address = config.interface.address[0];
//!     let tun = TunDevice::create(address.addr(), address.prefix_len(), 1420).await?;
//!     let transport = UdpTransport::bind("0.0.0.0:51820".parse()?).await?;
//!
//!     let device = Device::new(
//!         config.interface.private_key.clone(),
//!         Arc::new(transport),
//!         Arc::new(tun),
//!     );
//!     for peer in &config.peers {
//!         device.add_peer(peer.connection_info(DEFAULT_KEEPALIVE))?;
//!     }
//!     device.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod keys;
pub mod net;
pub mod peer;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod tun;

pub use config::DeviceConfig;
pub use device::Device;
pub use error::DriftVpnError;
pub use keys::{NoisePresharedKey, NoisePrivateKey, NoisePublicKey};
pub use peer::{Peer, PeerConnectionInfo};
