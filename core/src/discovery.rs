// Address discovery state machine
//
// Waits for the endpoint to learn a public, non-relayed address. The
// endpoint task pushes address-set snapshots over an mpsc channel; this
// consumer races each receive against a fixed deadline. Within a snapshot
// the first qualifying address wins, in the order the endpoint presented
// them. The wait always terminates: found, timed out, source closed, or
// cancelled, each a distinct outcome.

use crate::classify;
use libp2p::Multiaddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// Snapshot of the endpoint's currently-known address set, emitted
/// whenever the set changes. Order is the endpoint's presentation order.
#[derive(Debug, Clone)]
pub struct AddressChangeEvent {
    pub current: Vec<Multiaddr>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no public address observed within the allotted time")]
    TimedOut,
    #[error("address event source closed before a public address appeared")]
    SourceClosed,
    #[error("discovery cancelled")]
    Cancelled,
}

/// Discovery knobs. `attempts` is the optional retry wrapper over the
/// fatal-by-default timeout; 1 reproduces the reference behavior.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryConfig {
    pub timeout: Duration,
    pub attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            attempts: 1,
        }
    }
}

/// Block until a public, non-relayed address shows up in an address-change
/// event, or the timeout elapses, whichever comes first.
///
/// Events are consumed in delivery order, one at a time. The first
/// qualifying address within an event resolves the wait immediately;
/// later addresses in the same event are not inspected. Closure of the
/// event source is surfaced as `SourceClosed`, distinct from `TimedOut`.
pub async fn discover_public_address(
    events: &mut mpsc::Receiver<AddressChangeEvent>,
    timeout: Duration,
) -> Result<Multiaddr, DiscoveryError> {
    let deadline = Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(DiscoveryError::SourceClosed),
            Err(_) => return Err(DiscoveryError::TimedOut),
        };
        debug!(addresses = event.current.len(), "address set changed");
        if let Some(addr) = event.current.iter().find(|a| classify::qualifies(a)) {
            return Ok(addr.clone());
        }
    }
}

/// Same wait, but also resolvable early by a supervising task through the
/// `cancel` channel (fires on send or on drop of the sender's task scope).
pub async fn discover_public_address_with_cancel(
    events: &mut mpsc::Receiver<AddressChangeEvent>,
    timeout: Duration,
    cancel: oneshot::Receiver<()>,
) -> Result<Multiaddr, DiscoveryError> {
    tokio::select! {
        result = discover_public_address(events, timeout) => result,
        _ = cancel => Err(DiscoveryError::Cancelled),
    }
}

/// Retry wrapper: re-arms the deadline up to `attempts` times, but only on
/// timeout. Source closure is never retried, there is nothing left to
/// listen to.
pub async fn discover_with_retry(
    events: &mut mpsc::Receiver<AddressChangeEvent>,
    config: DiscoveryConfig,
) -> Result<Multiaddr, DiscoveryError> {
    let attempts = config.attempts.max(1);
    for attempt in 1..=attempts {
        match discover_public_address(events, config.timeout).await {
            Err(DiscoveryError::TimedOut) if attempt < attempts => {
                debug!(attempt, "discovery attempt timed out, retrying");
            }
            other => return other,
        }
    }
    Err(DiscoveryError::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn event(addrs: &[&str]) -> AddressChangeEvent {
        AddressChangeEvent {
            current: addrs.iter().map(|s| addr(s)).collect(),
        }
    }

    #[tokio::test]
    async fn test_first_match_wins_within_event() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(event(&[
            "/ip4/10.0.0.2/tcp/22345",
            "/ip4/54.255.62.136/tcp/12345/p2p/12D3KooWR7ubdas2nrgK3Y2mE9A27i5WubjhkzgrMKkEeEvzB6Cw/p2p-circuit",
            "/ip4/203.0.113.5/udp/22345/quic-v1",
            "/ip4/198.51.100.7/udp/22345/quic-v1",
        ]))
        .await
        .unwrap();

        let found = discover_public_address(&mut rx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, addr("/ip4/203.0.113.5/udp/22345/quic-v1"));
    }

    #[tokio::test]
    async fn test_non_qualifying_event_does_not_resolve() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(event(&["/ip4/192.168.1.4/tcp/22345"]))
            .await
            .unwrap();
        tx.send(event(&[
            "/ip4/192.168.1.4/tcp/22345",
            "/ip4/198.51.100.7/tcp/22345",
        ]))
        .await
        .unwrap();

        let found = discover_public_address(&mut rx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found, addr("/ip4/198.51.100.7/tcp/22345"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses_at_or_after_deadline() {
        // Sender kept alive so the channel never reads as closed.
        let (_tx, mut rx) = mpsc::channel::<AddressChangeEvent>(8);

        let started = Instant::now();
        let result = discover_public_address(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(result, Err(DiscoveryError::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_closure_is_not_a_timeout() {
        let (tx, mut rx) = mpsc::channel::<AddressChangeEvent>(8);
        drop(tx);

        let started = Instant::now();
        let result = discover_public_address(&mut rx, Duration::from_secs(300)).await;
        assert_eq!(result, Err(DiscoveryError::SourceClosed));
        assert!(started.elapsed() < Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_distinct() {
        let (_tx, mut rx) = mpsc::channel::<AddressChangeEvent>(8);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let wait = discover_public_address_with_cancel(
            &mut rx,
            Duration::from_secs(300),
            cancel_rx,
        );
        cancel_tx.send(()).unwrap();
        assert_eq!(wait.await, Err(DiscoveryError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_rearms_deadline_on_timeout_only() {
        let (_tx, mut rx) = mpsc::channel::<AddressChangeEvent>(8);
        let config = DiscoveryConfig {
            timeout: Duration::from_secs(10),
            attempts: 3,
        };

        let started = Instant::now();
        let result = discover_with_retry(&mut rx, config).await;
        assert_eq!(result, Err(DiscoveryError::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_does_not_mask_source_closure() {
        let (tx, mut rx) = mpsc::channel::<AddressChangeEvent>(8);
        drop(tx);
        let config = DiscoveryConfig {
            timeout: Duration::from_secs(10),
            attempts: 3,
        };

        let started = Instant::now();
        let result = discover_with_retry(&mut rx, config).await;
        assert_eq!(result, Err(DiscoveryError::SourceClosed));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_second_call_is_independent() {
        // Stateless across calls: a fresh call over a fresh source behaves
        // identically to the first.
        for _ in 0..2 {
            let (tx, mut rx) = mpsc::channel(8);
            tx.send(event(&["/ip4/198.51.100.7/tcp/1"])).await.unwrap();
            let found = discover_public_address(&mut rx, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(found, addr("/ip4/198.51.100.7/tcp/1"));
        }
    }
}
