// Announcement trigger
//
// Once discovery has produced a public address, one forced routing
// refresh pushes the endpoint's current address set out to the network,
// after which the process simply serves inbound connections until it is
// terminated.

use anyhow::Result;
use async_trait::async_trait;
use libp2p::Multiaddr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("routing refresh failed: {0}")]
    Refresh(String),
}

/// The one routing-service operation the probe needs: a blocking
/// re-publication of the local peer's current addresses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn force_refresh(&self) -> Result<()>;
}

/// Run exactly one routing refresh so the discovered address propagates.
///
/// The address is reported for observability only; the routing service
/// publishes the endpoint's current state. Failure is surfaced as-is with
/// no retry here — retry policy, if any, belongs to the routing service.
pub async fn announce<R>(routing: &R, discovered: &Multiaddr) -> Result<(), AnnounceError>
where
    R: RoutingService + ?Sized,
{
    info!("announcing discovered address {} to the network", discovered);
    routing
        .force_refresh()
        .await
        .map_err(|e| AnnounceError::Refresh(e.to_string()))?;
    info!("addresses advertised, peer is ready for hole punching");
    Ok(())
}

/// Announce, then park until the process is told to stop. The wait yields
/// the scheduler; nothing spins.
pub async fn announce_and_serve<R>(routing: &R, discovered: &Multiaddr) -> Result<(), AnnounceError>
where
    R: RoutingService + ?Sized,
{
    announce(routing, discovered).await?;
    wait_for_shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // No signal handler means no external stop condition; parking
        // forever would hide the problem, so surface it and return.
        tracing::error!("cannot wait for shutdown signal: {}", e);
    }
    info!("shutdown signal received");
}
