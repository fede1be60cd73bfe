// ============================================
// File: crates/wrapguard-server/src/config.rs
// ============================================
//! # WireGuard Configuration
//!
//! ## Creation Reason
//! Parses standard WireGuard INI configuration files so existing peer
//! configs work unmodified, and layers the supervisor's routing
//! extensions on top.
//!
//! ## Main Functionality
//! - `WireGuardConfig`: `[Interface]` plus repeatable `[Peer]` sections
//! - Key decoding (base64, exactly 32 bytes), endpoint resolution
//!   (hostnames resolved at load time, IPv4 preferred)
//! - `Route =` policy lines and `--exit-node` / `--route` CLI overrides
//! - Semantic re-emission for diagnostics (`to_ini_string`)
//!
//! ## Example Configuration
//! ```ini
//! [Interface]
//! PrivateKey = <base64>
//! Address = 10.150.0.2/24
//! MTU = 1420
//!
//! [Peer]
//! PublicKey = <base64>
//! Endpoint = vpn.example.com:51820
//! AllowedIPs = 0.0.0.0/0
//! PersistentKeepalive = 25
//! Route = 192.168.1.0/24:tcp:80-443
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Keys are case-insensitive; unrecognized keys are ignored so configs
//!   written for wg-quick (Table, PostUp, ...) still load
//! - Bare addresses in AllowedIPs are promoted to /32 or /128
//! - Endpoint hostnames are resolved once, at startup
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use tracing::{debug, info};

use wrapguard_core::routing::{PeerRouting, RoutingPolicy};
use wrapguard_tunnel::x25519::StaticSecret;
use wrapguard_tunnel::{EngineConfig, PeerConfig as EnginePeerConfig};

use crate::error::{Result, ServerError};

/// Default interface MTU when the config does not set one.
pub const DEFAULT_MTU: u16 = 1420;

// ============================================
// Configuration Model
// ============================================

/// The `[Interface]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Decoded private key.
    pub private_key: [u8; 32],
    /// Tunnel-side addresses with their prefixes.
    pub addresses: Vec<IpNet>,
    /// UDP listen port; random when absent.
    pub listen_port: Option<u16>,
    /// Interface MTU.
    pub mtu: u16,
    /// DNS servers declared for the tunnel interface.
    pub dns: Vec<IpAddr>,
}

/// One `[Peer]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSection {
    /// Decoded public key.
    pub public_key: [u8; 32],
    /// Decoded preshared key.
    pub preshared_key: Option<[u8; 32]>,
    /// Resolved endpoint.
    pub endpoint: Option<SocketAddr>,
    /// Allowed prefixes.
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive in seconds.
    pub persistent_keepalive: Option<u16>,
    /// Routing policies declared with `Route =`, in file order.
    pub policies: Vec<RoutingPolicy>,
}

/// A parsed WireGuard configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardConfig {
    /// The `[Interface]` section.
    pub interface: InterfaceConfig,
    /// The `[Peer]` sections, in file order.
    pub peers: Vec<PeerSection>,
}

impl WireGuardConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!(path = %path_str, "loading WireGuard configuration");
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;
        Self::from_str(&content)
    }

    /// Parses a configuration from a string (useful for testing).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let mut parser = Parser::default();
        for (number, raw_line) in content.lines().enumerate() {
            parser.line(number + 1, raw_line)?;
        }
        let config = parser.finish()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        if self.interface.addresses.is_empty() {
            return Err(ServerError::config_missing("interface.address"));
        }
        if self.peers.is_empty() {
            return Err(ServerError::config_missing("peer"));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.allowed_ips.is_empty() {
                return Err(ServerError::config_missing(format!(
                    "peer[{i}].allowedips"
                )));
            }
        }
        Ok(())
    }

    /// The first tunnel-side address, used by the port forwarder.
    #[must_use]
    pub fn interface_ip(&self) -> Option<IpAddr> {
        self.addresses().next()
    }

    /// All tunnel-side addresses, without their prefixes.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.interface.addresses.iter().map(IpNet::addr)
    }

    /// The routing view of every peer, in declaration order.
    #[must_use]
    pub fn peer_routing(&self) -> Vec<PeerRouting> {
        self.peers
            .iter()
            .map(|peer| PeerRouting {
                allowed_prefixes: peer.allowed_ips.clone(),
                policies: peer.policies.clone(),
            })
            .collect()
    }

    /// Translates into the engine's declarative configuration.
    #[must_use]
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            private_key: StaticSecret::from(self.interface.private_key),
            listen_port: self.interface.listen_port,
            peers: self
                .peers
                .iter()
                .map(|peer| EnginePeerConfig {
                    public_key: peer.public_key.into(),
                    preshared_key: peer.preshared_key,
                    endpoint: peer.endpoint,
                    allowed_ips: peer.allowed_ips.clone(),
                    persistent_keepalive: peer.persistent_keepalive,
                })
                .collect(),
        }
    }

    /// Applies `--exit-node` and `--route` overrides. The exit node is a
    /// `0.0.0.0/0` policy bound to the peer whose allowed prefixes
    /// contain the given address; routes are added in the order supplied.
    pub fn apply_cli_routes(&mut self, exit_node: Option<&str>, routes: &[String]) -> Result<()> {
        let mut pending: Vec<(String, String)> = Vec::new();
        if let Some(exit_ip) = exit_node {
            pending.push(("0.0.0.0/0".to_string(), exit_ip.trim().to_string()));
        }
        for route in routes {
            let (cidr, peer_ip) = route.rsplit_once(':').ok_or_else(|| {
                ServerError::config_invalid(
                    "route",
                    format!("'{route}' is not CIDR:peer_ip"),
                )
            })?;
            pending.push((cidr.trim().to_string(), peer_ip.trim().to_string()));
        }

        for (cidr, peer_ip) in pending {
            let addr: IpAddr = peer_ip.parse().map_err(|_| {
                ServerError::config_invalid("route", format!("'{peer_ip}' is not an IP address"))
            })?;
            let peer = self
                .peers
                .iter_mut()
                .find(|peer| peer.allowed_ips.iter().any(|net| net.contains(&addr)))
                .ok_or(ServerError::UnknownRoutePeer { peer_ip })?;

            let priority = peer.policies.len() as u32;
            let policy = RoutingPolicy::parse(&cidr, priority)?;
            info!(route = %policy, via = %addr, "route added");
            peer.policies.push(policy);
        }
        Ok(())
    }

    /// Re-emits the configuration. Key order and whitespace may differ
    /// from the source; the semantic fields round-trip.
    #[must_use]
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        out.push_str("[Interface]\n");
        let _ = writeln!(out, "PrivateKey = {}", BASE64.encode(self.interface.private_key));
        let _ = writeln!(out, "Address = {}", join(&self.interface.addresses));
        if let Some(port) = self.interface.listen_port {
            let _ = writeln!(out, "ListenPort = {port}");
        }
        let _ = writeln!(out, "MTU = {}", self.interface.mtu);
        if !self.interface.dns.is_empty() {
            let _ = writeln!(out, "DNS = {}", join(&self.interface.dns));
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", BASE64.encode(peer.public_key));
            if let Some(psk) = peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", BASE64.encode(psk));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {endpoint}");
            }
            let _ = writeln!(out, "AllowedIPs = {}", join(&peer.allowed_ips));
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
            }
            for policy in &peer.policies {
                let _ = writeln!(out, "Route = {policy}");
            }
        }
        out
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================
// Parser
// ============================================

#[derive(Default)]
enum Section {
    #[default]
    None,
    Interface,
    Peer,
}

#[derive(Default)]
struct Parser {
    section: Section,
    private_key: Option<[u8; 32]>,
    addresses: Vec<IpNet>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
    dns: Vec<IpAddr>,
    peers: Vec<PeerBuilder>,
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
    policies: Vec<RoutingPolicy>,
}

impl Parser {
    fn line(&mut self, number: usize, raw_line: &str) -> Result<()> {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            return Ok(());
        }

        if line.starts_with('[') && line.ends_with(']') {
            self.section = match line[1..line.len() - 1].to_ascii_lowercase().as_str() {
                "interface" => Section::Interface,
                "peer" => {
                    self.peers.push(PeerBuilder::default());
                    Section::Peer
                }
                other => {
                    return Err(ServerError::config_invalid(
                        format!("line {number}"),
                        format!("unknown section '[{other}]'"),
                    ))
                }
            };
            return Ok(());
        }

        let Some((key, value)) = line.split_once('=') else {
            debug!(line = number, "skipping line without '='");
            return Ok(());
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match self.section {
            Section::None => Err(ServerError::config_invalid(
                format!("line {number}"),
                "key outside any section",
            )),
            Section::Interface => self.interface_field(&key, value),
            Section::Peer => self.peer_field(&key, value),
        }
    }

    fn interface_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "privatekey" => self.private_key = Some(decode_key("interface.privatekey", value)?),
            "address" => self.addresses = parse_net_list("interface.address", value)?,
            "listenport" => {
                self.listen_port = Some(parse_number("interface.listenport", value)?);
            }
            "mtu" => self.mtu = Some(parse_number("interface.mtu", value)?),
            "dns" => {
                for part in split_list(value) {
                    let addr = part.parse().map_err(|_| {
                        ServerError::config_invalid(
                            "interface.dns",
                            format!("'{part}' is not an IP address"),
                        )
                    })?;
                    self.dns.push(addr);
                }
            }
            // wg-quick keys (Table, PostUp, ...) are not ours to reject.
            _ => {}
        }
        Ok(())
    }

    fn peer_field(&mut self, key: &str, value: &str) -> Result<()> {
        let peer = self
            .peers
            .last_mut()
            .expect("peer section pushes a builder");
        match key {
            "publickey" => peer.public_key = Some(decode_key("peer.publickey", value)?),
            "presharedkey" => {
                peer.preshared_key = Some(decode_key("peer.presharedkey", value)?);
            }
            "endpoint" => peer.endpoint = Some(resolve_endpoint(value)?),
            "allowedips" => peer.allowed_ips = parse_allowed_ips(value)?,
            "persistentkeepalive" => {
                peer.persistent_keepalive =
                    Some(parse_number("peer.persistentkeepalive", value)?);
            }
            "route" => {
                let priority = peer.policies.len() as u32;
                peer.policies.push(RoutingPolicy::parse(value, priority)?);
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Result<WireGuardConfig> {
        let private_key = self
            .private_key
            .ok_or_else(|| ServerError::config_missing("interface.privatekey"))?;

        let mut peers = Vec::with_capacity(self.peers.len());
        for (i, builder) in self.peers.into_iter().enumerate() {
            let public_key = builder
                .public_key
                .ok_or_else(|| ServerError::config_missing(format!("peer[{i}].publickey")))?;
            peers.push(PeerSection {
                public_key,
                preshared_key: builder.preshared_key,
                endpoint: builder.endpoint,
                allowed_ips: builder.allowed_ips,
                persistent_keepalive: builder.persistent_keepalive,
                policies: builder.policies,
            });
        }

        Ok(WireGuardConfig {
            interface: InterfaceConfig {
                private_key,
                addresses: self.addresses,
                listen_port: self.listen_port,
                mtu: self.mtu.unwrap_or(DEFAULT_MTU),
                dns: self.dns,
            },
            peers,
        })
    }
}

// ============================================
// Field Parsers
// ============================================

/// Decodes a base64 WireGuard key; keys are exactly 32 bytes.
fn decode_key(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| ServerError::config_invalid(field, format!("not base64: {e}")))?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        ServerError::config_invalid(field, format!("key must be 32 bytes, got {len}"))
    })
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ServerError::config_invalid(field, format!("'{value}' is not a number")))
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_net_list(field: &str, value: &str) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for part in split_list(value) {
        let net = part.parse().map_err(|_| {
            ServerError::config_invalid(field, format!("'{part}' is not a CIDR"))
        })?;
        nets.push(net);
    }
    Ok(nets)
}

/// AllowedIPs accepts bare addresses and promotes them to /32 or /128.
fn parse_allowed_ips(value: &str) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();
    for part in split_list(value) {
        let net = match part.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => {
                let addr: IpAddr = part.parse().map_err(|_| {
                    ServerError::config_invalid(
                        "peer.allowedips",
                        format!("'{part}' is neither a CIDR nor an address"),
                    )
                })?;
                IpNet::from(addr)
            }
        };
        nets.push(net);
    }
    Ok(nets)
}

/// Resolves `host:port` or `[v6]:port`, preferring IPv4 answers for
/// hostnames.
fn resolve_endpoint(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        ServerError::config_invalid("peer.endpoint", format!("'{value}' is not host:port"))
    })?;
    let port: u16 = parse_number("peer.endpoint", port)?;

    let mut addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            ServerError::config_invalid(
                "peer.endpoint",
                format!("cannot resolve '{host}': {e}"),
            )
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ServerError::config_invalid(
            "peer.endpoint",
            format!("no addresses for '{host}'"),
        ));
    }
    addrs.sort_by_key(|addr| !addr.is_ipv4());
    Ok(addrs[0])
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE="; // 32 x 'A'
    const KEY_B: &str = "QkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkJCQkI="; // 32 x 'B'
    const KEY_C: &str = "Q0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0NDQ0M="; // 32 x 'C'

    fn basic_config() -> String {
        format!(
            "# comment line\n\
             [Interface]\n\
             PrivateKey = {KEY_A}\n\
             Address = 10.150.0.2/24\n\
             ListenPort = 51820\n\
             DNS = 1.1.1.1, 8.8.8.8\n\
             \n\
             [Peer]\n\
             PublicKey = {KEY_B}\n\
             Endpoint = 192.0.2.1:51820\n\
             AllowedIPs = 0.0.0.0/0, 10.150.0.1\n\
             PersistentKeepalive = 25\n"
        )
    }

    #[test]
    fn test_parse_basic_config() {
        let config = WireGuardConfig::from_str(&basic_config()).unwrap();

        assert_eq!(config.interface.private_key, [b'A'; 32]);
        assert_eq!(config.interface.addresses, vec!["10.150.0.2/24".parse().unwrap()]);
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.mtu, DEFAULT_MTU);
        assert_eq!(config.interface.dns.len(), 2);
        assert_eq!(
            config.interface_ip(),
            Some("10.150.0.2".parse::<IpAddr>().unwrap())
        );

        let peer = &config.peers[0];
        assert_eq!(peer.public_key, [b'B'; 32]);
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
        // Bare address promoted to /32.
        assert_eq!(peer.allowed_ips[1], "10.150.0.1/32".parse::<IpNet>().unwrap());
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let config = WireGuardConfig::from_str(&format!(
            "[interface]\nPRIVATEKEY = {KEY_A}\naddress = 10.0.0.2/32\n\
             [PEER]\npublickey = {KEY_B}\nALLOWEDIPS = 0.0.0.0/0\n"
        ))
        .unwrap();
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn test_v6_endpoint_literal() {
        let config = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = fd00::2/64\n\
             [Peer]\nPublicKey = {KEY_B}\nEndpoint = [2001:db8::2]:51820\nAllowedIPs = ::/0\n"
        ))
        .unwrap();

        let endpoint = config.peers[0].endpoint.unwrap();
        assert_eq!(endpoint.ip(), "2001:db8::2".parse::<IpAddr>().unwrap());
        assert_eq!(endpoint.port(), 51820);
    }

    #[test]
    fn test_route_policies_auto_priority() {
        let config = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.0.0.2/24\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 0.0.0.0/0\n\
             Route = 192.168.1.0/24:tcp:80-443\nRoute = 10.0.0.0/8\n"
        ))
        .unwrap();

        let policies = &config.peers[0].policies;
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].priority, 0);
        assert_eq!(policies[1].priority, 1);
    }

    #[test]
    fn test_missing_fields_rejected() {
        // No private key
        let err = WireGuardConfig::from_str(
            "[Interface]\nAddress = 10.0.0.2/24\n[Peer]\nPublicKey = x\n",
        )
        .unwrap_err();
        assert!(err.is_config_error());

        // No peers
        let err = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.0.0.2/24\n"
        ))
        .unwrap_err();
        assert!(err.is_config_error());

        // Peer without AllowedIPs
        let err = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.0.0.2/24\n\
             [Peer]\nPublicKey = {KEY_B}\n"
        ))
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_bad_key_material_rejected() {
        let err = WireGuardConfig::from_str(
            "[Interface]\nPrivateKey = dG9vLXNob3J0\nAddress = 10.0.0.2/24\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("32 bytes"));

        let err = WireGuardConfig::from_str(
            "[Interface]\nPrivateKey = !!!notbase64!!!\nAddress = 10.0.0.2/24\n",
        )
        .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_cli_routes() {
        let mut config = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.150.0.2/24\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.150.0.0/24\n\
             [Peer]\nPublicKey = {KEY_C}\nAllowedIPs = 10.160.0.0/24\n"
        ))
        .unwrap();

        config
            .apply_cli_routes(
                Some("10.150.0.1"),
                &["192.168.0.0/16:10.160.0.1".to_string()],
            )
            .unwrap();

        // Exit node became a default route on the first peer.
        assert_eq!(
            config.peers[0].policies[0].destination,
            "0.0.0.0/0".parse::<IpNet>().unwrap()
        );
        // The --route landed on the second peer.
        assert_eq!(
            config.peers[1].policies[0].destination,
            "192.168.0.0/16".parse::<IpNet>().unwrap()
        );
    }

    #[test]
    fn test_cli_route_unknown_peer_fails() {
        let mut config = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.150.0.2/24\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.150.0.0/24\n"
        ))
        .unwrap();

        let err = config.apply_cli_routes(Some("172.16.0.1"), &[]).unwrap_err();
        assert!(matches!(err, ServerError::UnknownRoutePeer { .. }));
    }

    #[test]
    fn test_semantic_roundtrip() {
        let source = format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.150.0.2/24, fd00::2/64\n\
             ListenPort = 51820\nMTU = 1380\nDNS = 1.1.1.1\n\
             [Peer]\nPublicKey = {KEY_B}\nPresharedKey = {KEY_C}\n\
             Endpoint = 192.0.2.1:51820\nAllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = 25\nRoute = 10.0.0.0/8:udp:53\n"
        );
        let config = WireGuardConfig::from_str(&source).unwrap();
        let reparsed = WireGuardConfig::from_str(&config.to_ini_string()).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_engine_translation() {
        let config = WireGuardConfig::from_str(&basic_config()).unwrap();
        let engine = config.to_engine_config();
        assert_eq!(engine.listen_port, Some(51820));
        assert_eq!(engine.peers.len(), 1);
        assert_eq!(engine.peers[0].persistent_keepalive, Some(25));
    }

    #[test]
    fn test_peer_routing_order() {
        let config = WireGuardConfig::from_str(&format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.0.0.2/24\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 0.0.0.0/0\n\
             [Peer]\nPublicKey = {KEY_C}\nAllowedIPs = 10.0.0.0/8\n"
        ))
        .unwrap();

        let routing = config.peer_routing();
        assert_eq!(routing.len(), 2);
        assert_eq!(
            routing[0].allowed_prefixes[0],
            "0.0.0.0/0".parse::<IpNet>().unwrap()
        );
    }
}
