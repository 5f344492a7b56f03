// Address classification
//
// Decides whether a multiaddr is a candidate for direct hole punching:
// it must be publicly routable and must not be routed through a relay
// circuit. Pure functions over the address value, no state.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Does this address qualify as a direct hole-punch target?
///
/// Public-looking addresses that carry a `p2p-circuit` component are
/// rejected: traffic to them goes through a relay, not to us.
pub fn qualifies(addr: &Multiaddr) -> bool {
    is_public(addr) && !is_relayed(addr)
}

/// True if the address routes through a relay circuit.
pub fn is_relayed(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// True if the address starts with a publicly routable IP component.
/// Name-based addresses (dns/dnsaddr) are not classified as public; they
/// resolve to whatever they resolve to and cannot be handed to a remote
/// peer as a punch target.
pub fn is_public(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => ipv4_is_public(ip),
        Some(Protocol::Ip6(ip)) => ipv6_is_public(ip),
        _ => false,
    }
}

// Private range table matching go-multiaddr's manet.Private4: RFC 1918,
// CGNAT (100.64/10) and link-local, plus loopback/unspecified/broadcast.
// Documentation ranges (e.g. 203.0.113.0/24) deliberately count as public.
fn ipv4_is_public(ip: Ipv4Addr) -> bool {
    let cgnat = ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 0x40;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || cgnat)
}

fn ipv6_is_public(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    let seg0 = ip.segments()[0];
    let unique_local = (seg0 & 0xfe00) == 0xfc00; // fc00::/7
    let link_local = (seg0 & 0xffc0) == 0xfe80; // fe80::/10
    !(unique_local || link_local)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_private_addresses_never_qualify() {
        for s in [
            "/ip4/10.0.0.2/udp/1/quic-v1",
            "/ip4/172.16.4.1/tcp/22345",
            "/ip4/192.168.1.10/tcp/22345",
            "/ip4/100.64.0.9/udp/4001/quic-v1", // CGNAT
            "/ip4/169.254.1.1/tcp/1",
            "/ip4/127.0.0.1/tcp/8080",
            "/ip4/0.0.0.0/tcp/22345",
            "/ip6/::1/tcp/4001",
            "/ip6/fe80::1/udp/4001/quic-v1",
            "/ip6/fd00::2/tcp/4001",
        ] {
            assert!(!qualifies(&addr(s)), "{s} must not qualify");
        }
    }

    #[test]
    fn test_private_rejected_regardless_of_relay_marker() {
        let relayed_private = addr(
            "/ip4/10.0.0.2/tcp/22345/p2p/12D3KooWR7ubdas2nrgK3Y2mE9A27i5WubjhkzgrMKkEeEvzB6Cw/p2p-circuit",
        );
        assert!(!qualifies(&relayed_private));
    }

    #[test]
    fn test_public_relayed_does_not_qualify() {
        let relayed = addr(
            "/ip4/54.255.62.136/udp/12345/quic-v1/p2p/12D3KooWR7ubdas2nrgK3Y2mE9A27i5WubjhkzgrMKkEeEvzB6Cw/p2p-circuit",
        );
        assert!(is_public(&relayed));
        assert!(is_relayed(&relayed));
        assert!(!qualifies(&relayed));
    }

    #[test]
    fn test_public_direct_qualifies() {
        // Documentation range counts as public, matching the original
        // classifier semantics.
        assert!(qualifies(&addr("/ip4/203.0.113.5/udp/22345/quic-v1")));
        assert!(qualifies(&addr("/ip4/54.255.62.136/tcp/12345")));
        assert!(qualifies(&addr("/ip6/2001:db8::1/tcp/4001")));
    }

    #[test]
    fn test_name_based_addresses_do_not_qualify() {
        assert!(!qualifies(&addr("/dns4/example.com/tcp/4001")));
        assert!(!qualifies(&addr(
            "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN"
        )));
    }

    #[test]
    fn test_classification_is_idempotent() {
        let a = addr("/ip4/203.0.113.5/udp/22345/quic-v1");
        let b = addr("/ip4/10.0.0.2/tcp/1");
        assert_eq!(qualifies(&a), qualifies(&a));
        assert_eq!(qualifies(&b), qualifies(&b));
    }
}
