//! The composed swarm behaviour, the driver task that owns it, and the
//! cloneable [`SwarmHandle`] every other component talks through.
//!
//! The driver is the only task that touches the [`Swarm`]; commands arrive
//! over an mpsc channel, swarm events fan out over a broadcast channel,
//! and inbound envelopes are delivered to the message handler's queue.

use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify,
    identity::Keypair,
    mdns,
    multiaddr::Protocol,
    noise, relay,
    request_response::{
        self, OutboundFailure, OutboundRequestId, ProtocolSupport,
        ResponseChannel,
    },
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use satchel_tokio::notify_once::NotifyOnce;
use satchel_wire::proto;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    codec::{EnvelopeCodec, PingCodec},
    error::NetError,
};

/// The agent-visible version string exchanged over identify.
const IDENTIFY_PROTOCOL_VERSION: &str = "/satchel/1.0.0";

/// How long an idle connection is kept before the swarm closes it.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

const COMMAND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    messaging: request_response::Behaviour<EnvelopeCodec>,
    ping: request_response::Behaviour<PingCodec>,
    identify: identify::Behaviour,
    gossipsub: gossipsub::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    relay_client: relay::client::Behaviour,
}

/// Parameters for assembling the swarm.
pub struct SwarmParams {
    pub keypair: Keypair,
    pub port: u16,
    /// Explicit self-advertised addresses, bypassing auto-detect.
    pub announce_addrs: Vec<Multiaddr>,
    pub enable_mdns: bool,
    pub max_message_bytes: usize,
    pub request_timeout: Duration,
}

/// One inbound envelope plus the stream's reply slot.
pub struct InboundEnvelope {
    pub peer: PeerId,
    pub bytes: Vec<u8>,
    pub channel: ResponseChannel<Option<Vec<u8>>>,
}

/// Connection-level events fanned out to interested components.
#[derive(Clone, Debug)]
pub enum NetEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// The relay accepted our reservation request.
    ReservationAccepted { relay: PeerId },
    GossipMessage {
        topic: String,
        source: Option<PeerId>,
        data: Vec<u8>,
    },
    /// A peer discovered on the local network.
    Discovered { peer: PeerId, addr: Multiaddr },
}

enum SwarmCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    ListenOnCircuit {
        relay_addr: Multiaddr,
        reply: oneshot::Sender<Result<(), NetError>>,
    },
    SendEnvelope {
        peer: PeerId,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, NetError>>,
    },
    Respond {
        channel: ResponseChannel<Option<Vec<u8>>>,
        bytes: Option<Vec<u8>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    SelfAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// A cloneable handle to the swarm driver.
#[derive(Clone)]
pub struct SwarmHandle {
    local_peer_id: PeerId,
    commands_tx: mpsc::Sender<SwarmCommand>,
    events_tx: broadcast::Sender<NetEvent>,
}

/// Owns the [`Swarm`] and runs the event loop.
pub struct SwarmDriver {
    swarm: Swarm<NodeBehaviour>,
    commands_rx: mpsc::Receiver<SwarmCommand>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    events_tx: broadcast::Sender<NetEvent>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), NetError>>>>,
    pending_requests: HashMap<
        OutboundRequestId,
        oneshot::Sender<Result<Option<Vec<u8>>, NetError>>,
    >,
    shutdown: NotifyOnce,
}

/// Assemble the transport stack (TCP + noise + yamux, composed with the
/// circuit relay client), the behaviours, and the command plumbing.
pub fn build(
    params: SwarmParams,
    shutdown: NotifyOnce,
) -> anyhow::Result<(SwarmDriver, SwarmHandle, mpsc::Receiver<InboundEnvelope>)>
{
    let local_peer_id = PeerId::from(params.keypair.public());

    let mut swarm = SwarmBuilder::with_existing_identity(params.keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("Failed to set up the TCP transport")?
        .with_dns()
        .context("Failed to set up DNS resolution")?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .context("Failed to set up the relay client transport")?
        .with_behaviour(|key, relay_client| {
            make_behaviour(key, relay_client, &params)
        })
        .map_err(|e| anyhow::anyhow!("Failed to construct behaviour: {e}"))?
        .with_swarm_config(|cfg| {
            cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT)
        })
        .build();

    let listen_addr = Multiaddr::empty()
        .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
        .with(Protocol::Tcp(params.port));
    swarm
        .listen_on(listen_addr)
        .context("Failed to listen on the p2p port")?;

    for addr in &params.announce_addrs {
        swarm.add_external_address(addr.clone());
    }

    for topic in [proto::ANNOUNCE_TOPIC, proto::NODE_STATUS_TOPIC] {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic))
            .with_context(|| format!("Failed to subscribe to {topic}"))?;
    }

    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

    let handle = SwarmHandle {
        local_peer_id,
        commands_tx,
        events_tx: events_tx.clone(),
    };
    let driver = SwarmDriver {
        swarm,
        commands_rx,
        inbound_tx,
        events_tx,
        pending_dials: HashMap::new(),
        pending_requests: HashMap::new(),
        shutdown,
    };

    Ok((driver, handle, inbound_rx))
}

fn make_behaviour(
    key: &Keypair,
    relay_client: relay::client::Behaviour,
    params: &SwarmParams,
) -> Result<NodeBehaviour, Box<dyn std::error::Error + Send + Sync>> {
    let messaging = request_response::Behaviour::with_codec(
        EnvelopeCodec {
            max_message_bytes: params.max_message_bytes,
        },
        [
            (
                StreamProtocol::new(proto::MESSAGE_PROTOCOL),
                ProtocolSupport::Full,
            ),
            (
                StreamProtocol::new(proto::CHANNEL_PROTOCOL),
                ProtocolSupport::Full,
            ),
        ],
        request_response::Config::default()
            .with_request_timeout(params.request_timeout),
    );

    let ping = request_response::Behaviour::with_codec(
        PingCodec,
        [(
            StreamProtocol::new(proto::PING_PROTOCOL),
            ProtocolSupport::Full,
        )],
        request_response::Config::default(),
    );

    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL_VERSION.to_owned(),
        key.public(),
    ));

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossipsub::Config::default(),
    )?;

    let mdns = if params.enable_mdns {
        let behaviour = mdns::tokio::Behaviour::new(
            mdns::Config::default(),
            PeerId::from(key.public()),
        )?;
        Toggle::from(Some(behaviour))
    } else {
        Toggle::from(None)
    };

    Ok(NodeBehaviour {
        messaging,
        ping,
        identify,
        gossipsub,
        mdns,
        relay_client,
    })
}

/// The peer id embedded in a multiaddr's `/p2p/` component, if any.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

// --- impl SwarmHandle --- //

impl SwarmHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dial a peer by full multi-address. If the address includes a relay
    /// hop, the circuit transport negotiates the hop transparently.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::Dial { addr, reply: tx }).await?;
        rx.await.map_err(|_| NetError::Shutdown)?
    }

    /// Request a reservation from `relay_addr` by listening on its circuit
    /// address.
    pub async fn listen_on_circuit(
        &self,
        relay_addr: Multiaddr,
    ) -> Result<(), NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::ListenOnCircuit {
            relay_addr,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| NetError::Shutdown)?
    }

    /// Send one framed envelope to `peer` on a fresh stream and return the
    /// framed reply, if the responder sent one.
    pub async fn send_envelope(
        &self,
        peer: PeerId,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::SendEnvelope {
            peer,
            bytes,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| NetError::Shutdown)?
    }

    /// Send the reply on an inbound stream's response slot.
    pub async fn respond(
        &self,
        channel: ResponseChannel<Option<Vec<u8>>>,
        bytes: Option<Vec<u8>>,
    ) -> Result<(), NetError> {
        self.command(SwarmCommand::Respond { channel, bytes }).await
    }

    /// Publish to a gossipsub topic. Best-effort; publish failures are
    /// logged by the driver.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<(), NetError> {
        self.command(SwarmCommand::Publish {
            topic: topic.into(),
            data,
        })
        .await
    }

    pub async fn is_connected(&self, peer: PeerId) -> Result<bool, NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::IsConnected { peer, reply: tx })
            .await?;
        rx.await.map_err(|_| NetError::Shutdown)
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::ConnectedPeers { reply: tx })
            .await?;
        rx.await.map_err(|_| NetError::Shutdown)
    }

    /// Every address this node is currently reachable at: listen addresses
    /// (including circuit addresses backed by a live reservation) plus
    /// confirmed external addresses.
    pub async fn self_addrs(&self) -> Result<Vec<Multiaddr>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.command(SwarmCommand::SelfAddrs { reply: tx }).await?;
        rx.await.map_err(|_| NetError::Shutdown)
    }

    /// Subscribe to connection-level events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NetEvent> {
        self.events_tx.subscribe()
    }

    async fn command(&self, command: SwarmCommand) -> Result<(), NetError> {
        self.commands_tx
            .send(command)
            .await
            .map_err(|_| NetError::Shutdown)
    }
}

// --- impl SwarmDriver --- //

impl SwarmDriver {
    /// Run until shutdown. The driver owns the swarm exclusively; all
    /// other components interact via the handle.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                Some(command) = self.commands_rx.recv() =>
                    self.handle_command(command),
                event = self.swarm.select_next_some() =>
                    self.handle_event(event),
            }
        }

        // Fail any callers still waiting on the swarm.
        for (_, waiters) in self.pending_dials.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(NetError::Shutdown));
            }
        }
        for (_, waiter) in self.pending_requests.drain() {
            let _ = waiter.send(Err(NetError::Shutdown));
        }
        info!("Swarm driver stopped");
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Dial { addr, reply } => {
                let peer = match peer_id_of(&addr) {
                    Some(peer) => peer,
                    None => {
                        let _ = reply.send(Err(NetError::MissingPeerId));
                        return;
                    }
                };
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                match self.swarm.dial(addr) {
                    Ok(()) =>
                        self.pending_dials.entry(peer).or_default().push(reply),
                    Err(e) => {
                        let _ = reply
                            .send(Err(NetError::DialFailed(e.to_string())));
                    }
                }
            }
            SwarmCommand::ListenOnCircuit { relay_addr, reply } => {
                let circuit = relay_addr.with(Protocol::P2pCircuit);
                let result = self
                    .swarm
                    .listen_on(circuit)
                    .map(|_listener| ())
                    .map_err(|e| NetError::DialFailed(e.to_string()));
                let _ = reply.send(result);
            }
            SwarmCommand::SendEnvelope { peer, bytes, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_request(&peer, bytes);
                self.pending_requests.insert(request_id, reply);
            }
            SwarmCommand::Respond { channel, bytes } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_response(channel, bytes)
                    .is_err()
                {
                    debug!("Reply stream was already closed");
                }
            }
            SwarmCommand::Publish { topic, data } => {
                let topic = gossipsub::IdentTopic::new(topic);
                if let Err(e) =
                    self.swarm.behaviour_mut().gossipsub.publish(topic, data)
                {
                    // Expected when no peers are subscribed yet.
                    debug!("Gossip publish failed: {e}");
                }
            }
            SwarmCommand::IsConnected { peer, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer));
            }
            SwarmCommand::ConnectedPeers { reply } => {
                let peers = self.swarm.connected_peers().copied().collect();
                let _ = reply.send(peers);
            }
            SwarmCommand::SelfAddrs { reply } => {
                let mut addrs: Vec<Multiaddr> =
                    self.swarm.listeners().cloned().collect();
                addrs.extend(self.swarm.external_addresses().cloned());
                addrs.dedup();
                let _ = reply.send(addrs);
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
                if num_established.get() == 1 {
                    debug!(%peer_id, "Peer connected");
                    self.publish_event(NetEvent::PeerConnected(peer_id));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } =>
                if num_established == 0 {
                    debug!(%peer_id, "Peer disconnected");
                    self.publish_event(NetEvent::PeerDisconnected(peer_id));
                },
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    if let Some(waiters) = self.pending_dials.remove(&peer) {
                        for waiter in waiters {
                            let _ = waiter.send(Err(NetError::DialFailed(
                                error.to_string(),
                            )));
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => (),
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Messaging(event) =>
                self.handle_messaging_event(event),
            NodeBehaviourEvent::Ping(event) => self.handle_ping_event(event),
            NodeBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            }) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }
            NodeBehaviourEvent::Identify(_) => (),
            NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message,
                ..
            }) => {
                self.publish_event(NetEvent::GossipMessage {
                    topic: message.topic.as_str().to_owned(),
                    source: message.source,
                    data: message.data,
                });
            }
            NodeBehaviourEvent::Gossipsub(_) => (),
            NodeBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer, addr) in peers {
                    debug!(%peer, %addr, "Discovered local peer");
                    self.swarm.add_peer_address(peer, addr.clone());
                    self.publish_event(NetEvent::Discovered { peer, addr });
                }
            }
            NodeBehaviourEvent::Mdns(mdns::Event::Expired(_)) => (),
            NodeBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted {
                    relay_peer_id,
                    ..
                },
            ) => {
                info!(%relay_peer_id, "Relay reservation accepted");
                self.publish_event(NetEvent::ReservationAccepted {
                    relay: relay_peer_id,
                });
            }
            NodeBehaviourEvent::RelayClient(event) => {
                debug!("Relay client event: {event:?}");
            }
        }
    }

    fn handle_messaging_event(
        &mut self,
        event: request_response::Event<Vec<u8>, Option<Vec<u8>>>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } =>
                match message {
                    request_response::Message::Request {
                        request, channel, ..
                    } => {
                        let inbound = InboundEnvelope {
                            peer,
                            bytes: request,
                            channel,
                        };
                        if self.inbound_tx.try_send(inbound).is_err() {
                            warn!(
                                %peer,
                                "Inbound queue full; dropping message"
                            );
                        }
                    }
                    request_response::Message::Response {
                        request_id,
                        response,
                    } => {
                        if let Some(waiter) =
                            self.pending_requests.remove(&request_id)
                        {
                            let _ = waiter.send(Ok(response));
                        }
                    }
                },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                if let Some(waiter) = self.pending_requests.remove(&request_id)
                {
                    let _ = waiter.send(Err(map_outbound_failure(peer, error)));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                // Includes oversize frames rejected by the codec.
                warn!(%peer, "Inbound stream failure: {error}");
            }
            request_response::Event::ResponseSent { .. } => (),
        }
    }

    fn handle_ping_event(
        &mut self,
        event: request_response::Event<[u8; 32], [u8; 32]>,
    ) {
        if let request_response::Event::Message { peer, message, .. } = event {
            match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    if self
                        .swarm
                        .behaviour_mut()
                        .ping
                        .send_response(channel, request)
                        .is_err()
                    {
                        debug!(%peer, "Ping reply stream closed");
                    }
                }
                request_response::Message::Response { .. } => {
                    debug!(%peer, "Ping reply");
                }
            }
        }
    }

    fn publish_event(&self, event: NetEvent) {
        // Errors only mean nobody is subscribed right now.
        let _ = self.events_tx.send(event);
    }
}

fn map_outbound_failure(peer: PeerId, error: OutboundFailure) -> NetError {
    match error {
        OutboundFailure::DialFailure => NetError::NotConnected(peer),
        OutboundFailure::Timeout => NetError::SendTimeout,
        OutboundFailure::ConnectionClosed => NetError::StreamReset,
        OutboundFailure::UnsupportedProtocols =>
            NetError::DialFailed("protocol not supported".to_owned()),
        OutboundFailure::Io(e) => NetError::DialFailed(e.to_string()),
    }
}
