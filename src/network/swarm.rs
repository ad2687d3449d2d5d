//! libp2p swarm: gossipsub-backed bus for calls across hosts
//!
//! Runs a tokio-based event loop that:
//! - Discovers peers via mDNS
//! - Maps bus readers to gossipsub topic subscriptions
//! - Maps bus writers to a presence topic (`<topic>#w`) so readers can count them
//! - Turns remote subscribe/unsubscribe events into match changes
//!
//! Endpoints inside the process are matched by an embedded [`LocalBus`], so
//! a router and its backends can share one host.

use super::bus::{BusError, Endpoint, EndpointHandle, LocalBus, PubSub, Role};
use crate::config::NetworkSettings;
use libp2p::{
    gossipsub, mdns, noise,
    swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId,
};
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Suffix of the topic writers subscribe to so remote readers see them
const WRITER_PRESENCE: &str = "#w";

/// Combined behaviour: gossipsub for messaging + mDNS for discovery
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct DteeBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

/// Commands sent to the swarm task
#[derive(Debug)]
enum SwarmCommand {
    /// A local endpoint opened; subscribe and report known remote counterparts
    Open(EndpointHandle),
    /// The last local endpoint of a role on a topic closed
    Release { topic: String, role: Role },
    Publish { topic: String, data: Vec<u8> },
    Shutdown,
}

/// Gossipsub topic a local endpoint of `role` subscribes to
fn gossip_topic(topic: &str, role: Role) -> String {
    match role {
        Role::Reader => topic.to_string(),
        Role::Writer => format!("{}{}", topic, WRITER_PRESENCE),
    }
}

/// Inverse of [`gossip_topic`]: the bus topic and the role of the remote peer
fn bus_topic(gossip: &str) -> (&str, Role) {
    match gossip.strip_suffix(WRITER_PRESENCE) {
        Some(topic) => (topic, Role::Writer),
        None => (gossip, Role::Reader),
    }
}

/// Bus spanning every peer reachable through the swarm
pub struct GossipBus {
    local: Arc<LocalBus>,
    cmd_tx: mpsc::UnboundedSender<SwarmCommand>,
    peer_id: PeerId,
}

impl GossipBus {
    /// Build the swarm and spawn its event loop
    pub fn start(config: &NetworkSettings) -> Result<(Arc<Self>, JoinHandle<()>), BusError> {
        let transport = |e: &dyn std::fmt::Display| BusError::Transport(e.to_string());

        let heartbeat = Duration::from_secs(config.heartbeat_secs.max(1));
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| transport(&e))?
            .with_behaviour(|key| {
                // Sequence numbers keep identical replies from being deduplicated
                let message_id_fn = |message: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    message.source.hash(&mut s);
                    message.sequence_number.hash(&mut s);
                    message.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(heartbeat)
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .max_transmit_size(super::MAX_TRANSFER_SIZE * 2)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| Box::new(std::io::Error::new(std::io::ErrorKind::Other, e)) as Box<dyn std::error::Error + Send + Sync>)?;

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;

                Ok(DteeBehaviour { gossipsub, mdns })
            })
            .map_err(|e| transport(&e))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let peer_id = *swarm.local_peer_id();
        info!("Local peer ID: {}", peer_id);

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e| transport(&e))?;
        swarm.listen_on(listen_addr).map_err(|e| transport(&e))?;

        let local = Arc::new(LocalBus::new());
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SwarmCommand>();
        let bus = Arc::new(Self {
            local: local.clone(),
            cmd_tx,
            peer_id,
        });

        let task = tokio::spawn(async move {
            use futures::StreamExt;
            // Gossip topics each remote peer is subscribed to
            let mut peer_topics: HashMap<PeerId, HashSet<String>> = HashMap::new();

            let remote_change = |local: &LocalBus, gossip: &str, delta: i32| {
                let (topic, remote_role) = bus_topic(gossip);
                local.inject_remote_match(topic, remote_role.counterpart(), delta);
            };

            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            SwarmCommand::Open(handle) => {
                                let own = gossipsub::IdentTopic::new(gossip_topic(&handle.topic, handle.role));
                                if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&own) {
                                    warn!("Failed to subscribe {}: {}", own, e);
                                }
                                let counterpart = gossip_topic(&handle.topic, handle.role.counterpart());
                                let known = peer_topics
                                    .values()
                                    .filter(|topics| topics.contains(&counterpart))
                                    .count() as i32;
                                if known > 0 {
                                    local.inject_match(&handle, known);
                                }
                            }
                            SwarmCommand::Release { topic, role } => {
                                let own = gossipsub::IdentTopic::new(gossip_topic(&topic, role));
                                if let Err(e) = swarm.behaviour_mut().gossipsub.unsubscribe(&own) {
                                    warn!("Failed to unsubscribe {}: {}", own, e);
                                }
                            }
                            SwarmCommand::Publish { topic, data } => {
                                let target = gossipsub::IdentTopic::new(topic);
                                match swarm.behaviour_mut().gossipsub.publish(target, data) {
                                    Ok(_) => {}
                                    Err(gossipsub::PublishError::InsufficientPeers) => {
                                        debug!("No remote peers for publish");
                                    }
                                    Err(e) => warn!("Failed to publish: {}", e),
                                }
                            }
                            SwarmCommand::Shutdown => {
                                info!("Swarm shutting down");
                                break;
                            }
                        }
                    }
                    event = swarm.select_next_some() => {
                        match event {
                            SwarmEvent::Behaviour(DteeBehaviourEvent::Gossipsub(
                                gossipsub::Event::Message { message, .. },
                            )) => {
                                local.inject_remote_data(message.topic.as_str(), &message.data);
                            }
                            SwarmEvent::Behaviour(DteeBehaviourEvent::Gossipsub(
                                gossipsub::Event::Subscribed { peer_id, topic },
                            )) => {
                                let gossip = topic.as_str().to_string();
                                if peer_topics.entry(peer_id).or_default().insert(gossip.clone()) {
                                    debug!("Peer {} subscribed to {}", peer_id, gossip);
                                    remote_change(&local, &gossip, 1);
                                }
                            }
                            SwarmEvent::Behaviour(DteeBehaviourEvent::Gossipsub(
                                gossipsub::Event::Unsubscribed { peer_id, topic },
                            )) => {
                                let gossip = topic.as_str().to_string();
                                let removed = peer_topics
                                    .get_mut(&peer_id)
                                    .map(|topics| topics.remove(&gossip))
                                    .unwrap_or(false);
                                if removed {
                                    debug!("Peer {} unsubscribed from {}", peer_id, gossip);
                                    remote_change(&local, &gossip, -1);
                                }
                            }
                            SwarmEvent::Behaviour(DteeBehaviourEvent::Mdns(
                                mdns::Event::Discovered(peers),
                            )) => {
                                for (peer_id, _addr) in peers {
                                    info!("mDNS discovered peer: {}", peer_id);
                                    swarm
                                        .behaviour_mut()
                                        .gossipsub
                                        .add_explicit_peer(&peer_id);
                                }
                            }
                            SwarmEvent::Behaviour(DteeBehaviourEvent::Mdns(
                                mdns::Event::Expired(peers),
                            )) => {
                                for (peer_id, _addr) in peers {
                                    info!("mDNS peer expired: {}", peer_id);
                                    swarm
                                        .behaviour_mut()
                                        .gossipsub
                                        .remove_explicit_peer(&peer_id);
                                }
                            }
                            SwarmEvent::ConnectionClosed { peer_id, num_established: 0, .. } => {
                                if let Some(topics) = peer_topics.remove(&peer_id) {
                                    info!("Peer {} gone, unmatching {} topics", peer_id, topics.len());
                                    for gossip in topics {
                                        remote_change(&local, &gossip, -1);
                                    }
                                }
                            }
                            SwarmEvent::NewListenAddr { address, .. } => {
                                info!("Listening on {}", address);
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok((bus, task))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(SwarmCommand::Shutdown);
    }

    fn send(&self, cmd: SwarmCommand) -> Result<(), BusError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| BusError::Transport("swarm task stopped".to_string()))
    }

    fn open(&self, endpoint: Endpoint) -> Result<Endpoint, BusError> {
        self.send(SwarmCommand::Open(endpoint.handle.clone()))?;
        Ok(endpoint)
    }
}

impl PubSub for GossipBus {
    fn advertise(&self, topic: &str) -> Result<Endpoint, BusError> {
        let endpoint = self.local.advertise(topic)?;
        self.open(endpoint)
    }

    fn subscribe(&self, topic: &str) -> Result<Endpoint, BusError> {
        let endpoint = self.local.subscribe(topic)?;
        self.open(endpoint)
    }

    fn publish(&self, writer: &EndpointHandle, data: Vec<u8>) -> Result<(), BusError> {
        self.local.publish(writer, data.clone())?;
        self.send(SwarmCommand::Publish {
            topic: writer.topic.clone(),
            data,
        })
    }

    fn close(&self, endpoint: &EndpointHandle) -> Result<(), BusError> {
        self.local.close(endpoint)?;
        if self.local.count(&endpoint.topic, endpoint.role) == 0 {
            self.send(SwarmCommand::Release {
                topic: endpoint.topic.clone(),
                role: endpoint.role,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_mapping() {
        assert_eq!(gossip_topic("dtee/echo/operation", Role::Reader), "dtee/echo/operation");
        assert_eq!(gossip_topic("dtee/echo/operation", Role::Writer), "dtee/echo/operation#w");
        assert_eq!(bus_topic("dtee/echo/operation#w"), ("dtee/echo/operation", Role::Writer));
        assert_eq!(bus_topic("dtee/echo/result"), ("dtee/echo/result", Role::Reader));
    }

    #[tokio::test]
    #[ignore = "binds TCP and starts mDNS, which needs a multicast-capable interface"]
    async fn test_local_endpoints_match_through_gossip_bus() {
        let (bus, task) = GossipBus::start(&NetworkSettings::default()).unwrap();
        let writer = bus.advertise("dtee/t/operation").unwrap();
        let mut reader = bus.subscribe("dtee/t/operation").unwrap();

        bus.publish(&writer.handle, b"ping".to_vec()).unwrap();
        let mut saw_data = false;
        while let Ok(event) = reader.events.try_recv() {
            if event == crate::network::BusEvent::Data(b"ping".to_vec()) {
                saw_data = true;
            }
        }
        assert!(saw_data);

        bus.shutdown();
        let _ = task.await;
    }
}
