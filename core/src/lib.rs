// natprobe — hole-punch readiness probe
//
// A NATed peer boots a libp2p endpoint with DCUtR hole punching and
// circuit-relay fallback, waits (bounded) until a public non-relayed
// address appears in its address set, force-refreshes the Kademlia DHT so
// the address propagates, then serves inbound connections indefinitely.
//
// The original decision logic lives in `discovery` and `classify`;
// `endpoint` and `announce` wire those to the libp2p collaborators.

pub mod announce;
pub mod classify;
pub mod config;
pub mod discovery;
pub mod endpoint;

pub use announce::{announce, announce_and_serve, AnnounceError, RoutingService};
pub use classify::qualifies;
pub use config::{ConfigError, EndpointConfig, RelayPeer, TransportMode};
pub use discovery::{
    discover_public_address, discover_public_address_with_cancel, discover_with_retry,
    AddressChangeEvent, DiscoveryConfig, DiscoveryError,
};
pub use endpoint::{Endpoint, EndpointError, RoutingHandle};
