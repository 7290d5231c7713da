//! Configuration parsing
//!
//! This module handles parsing of standard WireGuard `.conf` configuration
//! files.

mod parser;

pub use parser::{DeviceConfig, InterfaceConfig, PeerConfig, DEFAULT_MTU};
