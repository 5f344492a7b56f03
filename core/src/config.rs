// Endpoint configuration
//
// Everything the endpoint bootstrapper consumes at construction time lives
// here: the transport mode, the capability flags, and the static relay /
// bootstrap peer lists. Relay identities are explicit configuration values
// rather than process-wide constants so tests can substitute their own.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::str::FromStr;
use thiserror::Error;

/// Default static relay used by the reference deployment.
pub const DEFAULT_RELAY_PEER_ID: &str = "12D3KooWR7ubdas2nrgK3Y2mE9A27i5WubjhkzgrMKkEeEvzB6Cw";

/// Default addresses for the reference relay, one per transport.
pub const DEFAULT_RELAY_ADDRS: [&str; 2] = [
    "/ip4/54.255.62.136/udp/12345/quic-v1",
    "/ip4/54.255.62.136/tcp/12345",
];

/// Public Kademlia bootstrap peers (the libp2p defaults).
pub const DEFAULT_BOOTSTRAP_PEERS: [&str; 4] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("transport mode must be \"tcp\" or \"quic\", got {0:?}")]
    InvalidTransportMode(String),
    #[error("invalid relay peer id {0:?}: {1}")]
    InvalidRelayPeerId(String, String),
    #[error("invalid multiaddr {0:?}: {1}")]
    InvalidAddress(String, String),
    #[error("bootstrap address {0:?} is missing a /p2p/<peer-id> component")]
    MissingPeerId(String),
}

/// Which transport the endpoint runs. The two modes are mutually exclusive;
/// hole punching is probed over exactly one of them per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Quic,
}

impl TransportMode {
    /// The wildcard listen address for this mode on the given port.
    pub fn listen_addr(&self, port: u16) -> Multiaddr {
        let mut addr = Multiaddr::empty();
        addr.push(Protocol::Ip4(std::net::Ipv4Addr::UNSPECIFIED));
        match self {
            TransportMode::Tcp => addr.push(Protocol::Tcp(port)),
            TransportMode::Quic => {
                addr.push(Protocol::Udp(port));
                addr.push(Protocol::QuicV1);
            }
        }
        addr
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Tcp => "tcp",
            TransportMode::Quic => "quic",
        }
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportMode::Tcp),
            "quic" => Ok(TransportMode::Quic),
            other => Err(ConfigError::InvalidTransportMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A static relay the endpoint may reserve a circuit slot on.
#[derive(Debug, Clone)]
pub struct RelayPeer {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl RelayPeer {
    /// Parse a relay identity and address list from their string forms.
    pub fn from_strs(peer_id: &str, addresses: &[String]) -> Result<Self, ConfigError> {
        let peer_id = PeerId::from_str(peer_id)
            .map_err(|e| ConfigError::InvalidRelayPeerId(peer_id.to_string(), e.to_string()))?;
        let addresses = addresses
            .iter()
            .map(|a| {
                a.parse::<Multiaddr>()
                    .map_err(|e| ConfigError::InvalidAddress(a.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { peer_id, addresses })
    }
}

/// Split a `/.../p2p/<peer-id>` multiaddr into the peer id and the bare
/// dial address, the form Kademlia wants bootstrap entries in.
pub fn parse_peer_addr(s: &str) -> Result<(PeerId, Multiaddr), ConfigError> {
    let mut addr = s
        .parse::<Multiaddr>()
        .map_err(|e| ConfigError::InvalidAddress(s.to_string(), e.to_string()))?;
    match addr.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, addr)),
        _ => Err(ConfigError::MissingPeerId(s.to_string())),
    }
}

/// Everything the endpoint bootstrapper needs at construction time.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Transport the probe runs over.
    pub transport: TransportMode,
    /// Listen port (both modes bind the wildcard v4 address).
    pub listen_port: u16,
    /// Enable DCUtR hole punching.
    pub hole_punching: bool,
    /// Reserve circuit slots on the static relays so the endpoint stays
    /// dialable while NATed.
    pub auto_relay: bool,
    /// Treat the endpoint as privately reachable without probing: AutoNAT
    /// is skipped and relay reservations are taken unconditionally.
    pub force_private: bool,
    /// Relays to hold reservations on when `auto_relay` is set.
    pub static_relays: Vec<RelayPeer>,
    /// Kademlia bootstrap peers.
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
}

impl EndpointConfig {
    /// The reference configuration for a given transport mode: hole
    /// punching on, relay fallback on, reachability forced private, the
    /// default static relay and the public bootstrap set.
    pub fn for_mode(transport: TransportMode) -> Result<Self, ConfigError> {
        let relay_addrs: Vec<String> =
            DEFAULT_RELAY_ADDRS.iter().map(|a| a.to_string()).collect();
        Ok(Self {
            transport,
            listen_port: 22345,
            hole_punching: true,
            auto_relay: true,
            force_private: true,
            static_relays: vec![RelayPeer::from_strs(DEFAULT_RELAY_PEER_ID, &relay_addrs)?],
            bootstrap_peers: default_bootstrap_peers()?,
        })
    }
}

/// The libp2p public bootstrap peers, parsed.
pub fn default_bootstrap_peers() -> Result<Vec<(PeerId, Multiaddr)>, ConfigError> {
    DEFAULT_BOOTSTRAP_PEERS
        .iter()
        .map(|s| parse_peer_addr(s))
        .collect()
}
