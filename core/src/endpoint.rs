// Endpoint bootstrapper — the actual running libp2p node
//
// Builds the swarm for the selected transport with:
// - circuit-relay v2 client (relay fallback while NATed)
// - DCUtR hole punching (toggled by config)
// - identify (observed-address exchange, feeds Kademlia)
// - AutoNAT (skipped under forced-private reachability)
// - Kademlia in client mode for address propagation
//
// The spawned event loop folds listener/external-address events into one
// known-address set and emits a snapshot on every change. Commands arrive
// over an mpsc channel with reply channels, and the routing handle drives
// a Kademlia bootstrap query to completion for force-refresh.

use crate::announce::RoutingService;
use crate::config::{EndpointConfig, TransportMode};
use crate::discovery::AddressChangeEvent;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{autonat, dcutr, identify, kad, noise, relay, tcp, yamux, Multiaddr, PeerId, Swarm};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to construct endpoint: {0}")]
    Construction(String),
    #[error("failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
}

/// Commands that can be sent to the endpoint task
#[derive(Debug)]
enum EndpointCommand {
    /// Re-run a Kademlia bootstrap round so the current address set
    /// propagates to the network
    ForceRefresh {
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Get the currently-known address set
    KnownAddresses {
        reply: mpsc::Sender<Vec<Multiaddr>>,
    },
    /// Shut down the endpoint task
    Shutdown,
}

/// The probe's network behaviour combining all protocols.
#[derive(NetworkBehaviour)]
pub struct ProbeBehaviour {
    /// Circuit-relay v2 client, for reservations on the static relays
    pub relay_client: relay::client::Behaviour,
    /// DCUtR hole punching (off when the capability flag is cleared)
    pub dcutr: Toggle<dcutr::Behaviour>,
    /// Peer identification, exchanges observed addresses
    pub identify: identify::Behaviour,
    /// Reachability probing (off under forced-private reachability)
    pub autonat: Toggle<autonat::Behaviour>,
    /// DHT for address propagation
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
}

impl ProbeBehaviour {
    fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        config: &EndpointConfig,
    ) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let dcutr = Toggle::from(config.hole_punching.then(|| dcutr::Behaviour::new(peer_id)));

        let identify = identify::Behaviour::new(
            identify::Config::new("/natprobe/id/1.0.0".to_string(), keypair.public())
                .with_push_listen_addr_updates(true),
        );

        // Forced-private reachability: skip probing entirely and let the
        // relay reservations stand in for the NATed-host answer.
        let autonat = Toggle::from(
            (!config.force_private)
                .then(|| autonat::Behaviour::new(peer_id, autonat::Config::default())),
        );

        let kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));

        Self {
            relay_client,
            dcutr,
            identify,
            autonat,
            kademlia,
        }
    }
}

/// Handle to communicate with the running endpoint task
pub struct Endpoint {
    peer_id: PeerId,
    command_tx: mpsc::Sender<EndpointCommand>,
}

impl Endpoint {
    /// Build the swarm per the configuration and spawn its event loop.
    ///
    /// Address-set snapshots are pushed to `event_tx` whenever the set
    /// changes. Emission never blocks: a consumer that stops draining
    /// (or drops the receiver) only loses snapshots, the loop keeps
    /// polling the swarm.
    pub async fn spawn(
        config: EndpointConfig,
        event_tx: mpsc::Sender<AddressChangeEvent>,
    ) -> Result<Self, EndpointError> {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();

        let mut swarm = build_swarm(&config, keypair)
            .map_err(|e| EndpointError::Construction(e.to_string()))?;

        let listen_addr = config.transport.listen_addr(config.listen_port);
        swarm
            .listen_on(listen_addr.clone())
            .map_err(|e| EndpointError::Listen {
                addr: listen_addr,
                reason: e.to_string(),
            })?;

        // Reserve a circuit slot on each static relay so we stay dialable
        // while behind the NAT.
        if config.auto_relay || config.force_private {
            for relay_peer in &config.static_relays {
                for addr in &relay_peer.addresses {
                    let circuit = addr
                        .clone()
                        .with(Protocol::P2p(relay_peer.peer_id))
                        .with(Protocol::P2pCircuit);
                    if let Err(e) = swarm.listen_on(circuit.clone()) {
                        warn!("cannot request reservation on {}: {}", circuit, e);
                    }
                }
            }
        }

        // Seed the routing table and kick off an initial bootstrap so we
        // get connections, observed addresses, and a presence in the DHT.
        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Client));
        for (peer, addr) in &config.bootstrap_peers {
            swarm.behaviour_mut().kademlia.add_address(peer, addr.clone());
        }
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!("initial DHT bootstrap not started: {}", e);
        }

        let (command_tx, command_rx) = mpsc::channel::<EndpointCommand>(64);
        tokio::spawn(run_event_loop(swarm, command_rx, event_tx));

        Ok(Self {
            peer_id,
            command_tx,
        })
    }

    /// The endpoint's peer id
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Handle for routing-service operations (force refresh)
    pub fn routing(&self) -> RoutingHandle {
        RoutingHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    /// The addresses the endpoint currently believes it is reachable at
    pub async fn known_addresses(&self) -> Result<Vec<Multiaddr>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EndpointCommand::KnownAddresses { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("endpoint task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("no reply from endpoint"))
    }

    /// Shut down the endpoint task
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(EndpointCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("endpoint task not running"))
    }
}

/// Routing-service handle backed by the endpoint's Kademlia behaviour.
#[derive(Clone)]
pub struct RoutingHandle {
    command_tx: mpsc::Sender<EndpointCommand>,
}

#[async_trait]
impl RoutingService for RoutingHandle {
    async fn force_refresh(&self) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(EndpointCommand::ForceRefresh { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("endpoint task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("no reply from endpoint"))?
            .map_err(|e| anyhow::anyhow!(e))
    }
}

fn build_swarm(config: &EndpointConfig, keypair: Keypair) -> Result<Swarm<ProbeBehaviour>> {
    // The branches are mutually exclusive transport stacks; QUIC carries
    // its own encryption and multiplexing, TCP gets noise + yamux. The
    // relay client transport is upgraded with noise + yamux either way.
    let swarm = match config.transport {
        TransportMode::Tcp => libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_dns()?
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key, relay_client| ProbeBehaviour::new(key, relay_client, config))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(300)))
            .build(),
        TransportMode::Quic => libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_quic()
            .with_dns()?
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key, relay_client| ProbeBehaviour::new(key, relay_client, config))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(300)))
            .build(),
    };
    Ok(swarm)
}

async fn run_event_loop(
    mut swarm: Swarm<ProbeBehaviour>,
    mut command_rx: mpsc::Receiver<EndpointCommand>,
    event_tx: mpsc::Sender<AddressChangeEvent>,
) {
    // Listener addresses, external candidates, and confirmed external
    // addresses all enter the known set; the classifier on the consumer
    // side decides what qualifies. Insertion order is preserved so the
    // consumer sees addresses in the order they were learned.
    let mut known: Vec<Multiaddr> = Vec::new();

    // Bootstrap queries driven by ForceRefresh, keyed by query id
    let mut pending_refreshes: HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>> =
        HashMap::new();

    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                let changed = match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!("listening on {}", address);
                        push_addr(&mut known, &address)
                    }
                    SwarmEvent::ExpiredListenAddr { address, .. } => {
                        debug!("listen address expired: {}", address);
                        remove_addr(&mut known, &address)
                    }
                    SwarmEvent::NewExternalAddrCandidate { address } => {
                        info!("observed external address candidate: {}", address);
                        push_addr(&mut known, &address)
                    }
                    SwarmEvent::ExternalAddrConfirmed { address } => {
                        info!("external address confirmed: {}", address);
                        push_addr(&mut known, &address)
                    }
                    SwarmEvent::ExternalAddrExpired { address } => {
                        debug!("external address expired: {}", address);
                        remove_addr(&mut known, &address)
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        debug!("connected to {} via {}", peer_id, endpoint.get_remote_address());
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. }
                    )) => {
                        debug!("identified {} with {} addresses", peer_id, info.listen_addrs.len());
                        for addr in info.listen_addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                        }
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::RelayClient(
                        relay::client::Event::ReservationReqAccepted { relay_peer_id, .. }
                    )) => {
                        info!("relay reservation accepted by {}", relay_peer_id);
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::RelayClient(event)) => {
                        debug!(?event, "relay client event");
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Dcutr(event)) => {
                        debug!(?event, "dcutr event");
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Autonat(
                        autonat::Event::StatusChanged { old, new }
                    )) => {
                        info!(?old, ?new, "NAT status changed");
                        false
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Kademlia(
                        kad::Event::OutboundQueryProgressed {
                            id,
                            result: kad::QueryResult::Bootstrap(result),
                            step,
                            ..
                        }
                    )) => {
                        if step.last {
                            let outcome = match &result {
                                Ok(_) => Ok(()),
                                Err(e) => Err(format!("bootstrap query failed: {e:?}")),
                            };
                            if let Some(reply) = pending_refreshes.remove(&id) {
                                let _ = reply.send(outcome).await;
                            } else {
                                debug!(query = ?id, "bootstrap round finished");
                            }
                        }
                        false
                    }
                    _ => false,
                };

                if changed {
                    emit_snapshot(&event_tx, &known);
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(EndpointCommand::ForceRefresh { reply }) => {
                        match swarm.behaviour_mut().kademlia.bootstrap() {
                            Ok(query_id) => {
                                pending_refreshes.insert(query_id, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e.to_string())).await;
                            }
                        }
                    }
                    Some(EndpointCommand::KnownAddresses { reply }) => {
                        let _ = reply.send(known.clone()).await;
                    }
                    Some(EndpointCommand::Shutdown) | None => {
                        info!("endpoint shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Push the current address set to the consumer without ever blocking
/// the event loop. Once discovery is done the consumer stops draining
/// (or drops the receiver entirely); a full or closed channel must not
/// stall swarm polling, so the snapshot is dropped instead.
fn emit_snapshot(event_tx: &mpsc::Sender<AddressChangeEvent>, known: &[Multiaddr]) {
    match event_tx.try_send(AddressChangeEvent {
        current: known.to_vec(),
    }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("consumer lagging, address snapshot dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn push_addr(known: &mut Vec<Multiaddr>, addr: &Multiaddr) -> bool {
    if known.contains(addr) {
        return false;
    }
    known.push(addr.clone());
    true
}

fn remove_addr(known: &mut Vec<Multiaddr>, addr: &Multiaddr) -> bool {
    let before = known.len();
    known.retain(|a| a != addr);
    known.len() != before
}
