//! WireGuard configuration file parser
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer]
//! sections. Keys decode straight into the crate's typed key wrappers, so a
//! parsed config never carries raw byte arrays around.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};

use crate::error::ConfigError;
use crate::keys::{NoisePresharedKey, NoisePrivateKey, NoisePublicKey};
use crate::peer::PeerConnectionInfo;

/// Default interface MTU when the config does not set one
pub const DEFAULT_MTU: u16 = 1420;

/// Complete device configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

/// `[Interface]` section
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: NoisePrivateKey,
    /// Local VPN addresses with prefix
    pub address: Vec<Ipv4Net>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
}

/// `[Peer]` section
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: NoisePublicKey,
    pub preshared_key: Option<NoisePresharedKey>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    /// Seconds; absent means the engine default, zero disables
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Lower into the runtime peer description
    pub fn connection_info(&self, default_keepalive: Duration) -> PeerConnectionInfo {
        PeerConnectionInfo {
            remote_static: self.public_key,
            preshared_key: self
                .preshared_key
                .clone()
                .unwrap_or_else(NoisePresharedKey::zero),
            endpoint: self.endpoint,
            keepalive_interval: self
                .persistent_keepalive
                .map(|secs| Duration::from_secs(secs.into()))
                .unwrap_or(default_keepalive),
            allowed_ips: self.allowed_ips.clone(),
        }
    }
}

impl DeviceConfig {
    /// Parse a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut private_key: Option<NoisePrivateKey> = None;
        let mut address: Vec<Ipv4Net> = Vec::new();
        let mut listen_port: Option<u16> = None;
        let mut mtu: Option<u16> = None;
        let mut peers: Vec<PeerConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_peer: Option<PeerBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[peer]") {
                if let Some(peer) = current_peer.take() {
                    peers.push(peer.build()?);
                }
                current_section = Some(Section::Peer);
                current_peer = Some(PeerBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "privatekey" => {
                        private_key =
                            Some(value.parse().map_err(|_| ConfigError::InvalidKey {
                                field: "PrivateKey".to_string(),
                            })?);
                    }
                    "address" => {
                        for addr_str in split_list(value) {
                            let net: IpNet =
                                addr_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                    value: addr_str.to_string(),
                                })?;
                            if let IpNet::V4(v4net) = net {
                                address.push(v4net);
                            }
                        }
                    }
                    "listenport" => {
                        listen_port = Some(value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid ListenPort: {}", value),
                        })?);
                    }
                    "mtu" => {
                        mtu = Some(value.parse().map_err(|_| ConfigError::ParseError {
                            line: line_num,
                            message: format!("Invalid MTU: {}", value),
                        })?);
                    }
                    _ => {
                        // Unknown key, ignore (forward compatibility)
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Peer) => {
                    let peer = current_peer.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Peer value outside of [Peer] section".to_string(),
                    })?;

                    match key.as_str() {
                        "publickey" => {
                            peer.public_key =
                                Some(value.parse().map_err(|_| ConfigError::InvalidKey {
                                    field: "PublicKey".to_string(),
                                })?);
                        }
                        "presharedkey" => {
                            peer.preshared_key =
                                Some(value.parse().map_err(|_| ConfigError::InvalidKey {
                                    field: "PresharedKey".to_string(),
                                })?);
                        }
                        "endpoint" => {
                            peer.endpoint = Some(value.parse::<SocketAddr>().map_err(|_| {
                                ConfigError::InvalidAddress {
                                    value: value.to_string(),
                                }
                            })?);
                        }
                        "allowedips" => {
                            for ip_str in split_list(value) {
                                let net: IpNet =
                                    ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
                                        value: ip_str.to_string(),
                                    })?;
                                peer.allowed_ips.push(net);
                            }
                        }
                        "persistentkeepalive" => {
                            peer.persistent_keepalive =
                                Some(value.parse().map_err(|_| ConfigError::ParseError {
                                    line: line_num,
                                    message: format!("Invalid PersistentKeepalive: {}", value),
                                })?);
                        }
                        _ => {
                            tracing::debug!("Unknown peer key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(peer) = current_peer.take() {
            peers.push(peer.build()?);
        }

        let private_key = private_key.ok_or(ConfigError::MissingField {
            field: "PrivateKey".to_string(),
        })?;

        Ok(DeviceConfig {
            interface: InterfaceConfig {
                private_key,
                address,
                listen_port,
                mtu,
            },
            peers,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Clone, Copy)]
enum Section {
    Interface,
    Peer,
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<NoisePublicKey>,
    preshared_key: Option<NoisePresharedKey>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;

        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::session::DEFAULT_KEEPALIVE;

    const TEST_CONFIG: &str = r#"
[Interface]
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Address = 10.0.0.2/24
ListenPort = 51820
MTU = 1380

[Peer]
PublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=
AllowedIPs = 10.0.0.0/24, 0.0.0.0/0
Endpoint = 13.239.46.151:51820
PersistentKeepalive = 25
"#;

    #[test]
    fn test_parse_full_config() {
        let config = DeviceConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.interface.address.len(), 1);
        assert_eq!(config.interface.address[0].to_string(), "10.0.0.2/24");
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.mtu, Some(1380));

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.endpoint.unwrap().to_string(), "13.239.46.151:51820");
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(
            peer.public_key.to_string(),
            "YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4="
        );
    }

    #[test]
    fn test_connection_info_defaults() {
        let config = DeviceConfig::parse(TEST_CONFIG).unwrap();
        let info = config.peers[0].connection_info(DEFAULT_KEEPALIVE);
        assert_eq!(info.keepalive_interval, Duration::from_secs(25));
        assert_eq!(info.allowed_ips.len(), 2);

        // No PersistentKeepalive falls back to the engine default
        let minimal = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                       [Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\n";
        let config = DeviceConfig::parse(minimal).unwrap();
        let info = config.peers[0].connection_info(DEFAULT_KEEPALIVE);
        assert_eq!(info.keepalive_interval, DEFAULT_KEEPALIVE);
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let config = DeviceConfig::parse(
            "# leading comment\n\n[Interface]\n# inner comment\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n",
        )
        .unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_missing_private_key() {
        assert!(matches!(
            DeviceConfig::parse("[Interface]\nAddress = 10.0.0.2/24\n"),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_peer_without_public_key() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                      [Peer]\nEndpoint = 1.2.3.4:51820\n";
        assert!(matches!(
            DeviceConfig::parse(config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let config = "[Interface]\nPrivateKey = not-base64!\n";
        assert!(matches!(
            DeviceConfig::parse(config),
            Err(ConfigError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let config = "[Interface]\nPrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=\n\
                      [Peer]\nPublicKey = YgkBjKXER5YarD8STsvMFURw/5nhCLIFOJ5uKWrrMW4=\nAllowedIPs = banana\n";
        assert!(matches!(
            DeviceConfig::parse(config),
            Err(ConfigError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_value_outside_section() {
        assert!(matches!(
            DeviceConfig::parse("PrivateKey = x\n"),
            Err(ConfigError::ParseError { line: 1, .. })
        ));
    }
}
