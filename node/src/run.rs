//! Bootstrap: assemble the transport, wire the components one-way, spawn
//! the supervisors, and join them until shutdown.
//!
//! Failure policy: once the transport is up, nothing here exits the
//! process. A broken channel store runs ephemeral, unavailable chain
//! services report per-operation, a bad relay address disables the relay,
//! and a taken control-plane port disables the control plane; each is
//! logged loudly and the node keeps serving what it can.

use std::sync::Arc;

use anyhow::Context;
use common::{config::NodeConfig, constants, time::TimestampMs};
use libp2p::Multiaddr;
use satchel_channel::{
    persister::NoopPersister, ChannelManager, ChannelManagerConfig,
    ChannelPersister,
};
use satchel_net::{
    directory::{Announcement, PeerDirectory},
    handler::spawn_inbound_loop,
    swarm::{self, SwarmParams},
    MessageHandler, NetEvent, RelayManager, SwarmHandle,
};
use satchel_tokio::{
    notify_once::NotifyOnce,
    task::{SatTask, TaskGroups},
};
use satchel_wire::proto;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    announcer, chain::ChainServices, notifier, persister,
    persister::FilePersister, server, service::NodeService,
};

/// Run the node until shutdown. Only a transport bring-up failure
/// propagates as an error (and a nonzero exit); everything else degrades
/// and logs.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .context("Failed to create the data dir")?;

    let identity =
        persister::load_or_create_identity(&config.data_dir).await?;
    let payment_keypair =
        persister::load_or_create_payment_key(&config.data_dir).await?;

    // Supervisors stop on `shutdown`; the joiner stops the transport via
    // `transport_shutdown` only after they have drained.
    let shutdown = NotifyOnce::new();
    let transport_shutdown = NotifyOnce::new();

    let announce_addrs = parse_addrs(&config.announce_addrs);
    let (driver, swarm_handle, inbound_rx) = swarm::build(
        SwarmParams {
            keypair: identity,
            port: config.port,
            announce_addrs,
            enable_mdns: config.enable_mdns,
            max_message_bytes: config.max_message_bytes,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
        },
        transport_shutdown.clone(),
    )
    .context("Transport failed to come up")?;
    info!(peer_id = %swarm_handle.local_peer_id(), "Node identity ready");

    // A broken channel store is loud but not fatal: the node degrades to
    // ephemeral channels rather than refusing to serve messaging.
    let channel_persister: Arc<dyn ChannelPersister> =
        match FilePersister::new(&config.data_dir).await {
            Ok(file_persister) => Arc::new(file_persister),
            Err(e) => {
                error!(
                    "Channel store unavailable; running ephemeral: {e:#}"
                );
                Arc::new(NoopPersister)
            }
        };
    let manager = Arc::new(ChannelManager::new(
        ChannelManagerConfig {
            min_capacity: config.min_capacity,
            max_capacity: config.max_capacity,
            commitment_fee_sats: config.commitment_fee_sats,
        },
        swarm_handle.local_peer_id().to_string(),
        payment_keypair.clone(),
        channel_persister,
    ));
    match manager.load().await {
        Ok(restored) if restored > 0 =>
            info!("Restored {restored} channels from disk"),
        Ok(_) => (),
        Err(e) => error!("Failed to restore persisted channels: {e:#}"),
    }

    let chain = ChainServices::from_config(&config);
    let agent_notifier = notifier::from_config(&config);
    let handler = MessageHandler::new(
        Arc::new(swarm_handle.clone()),
        agent_notifier,
        config.max_message_bytes,
    );
    let service = NodeService::new(
        manager.clone(),
        chain.broadcaster.clone(),
        config.auto_accept_channels,
    );
    handler.register_subscriber(service);

    let directory = Arc::new(PeerDirectory::default());

    let transport_tasks = vec![SatTask::spawn("swarm-driver", driver.run())];

    let mut supervisors = Vec::new();
    supervisors.push(spawn_inbound_loop(
        handler.clone(),
        swarm_handle.clone(),
        inbound_rx,
        shutdown.clone(),
    ));
    supervisors.push(spawn_directory_sync(
        swarm_handle.clone(),
        directory.clone(),
        shutdown.clone(),
    ));
    supervisors.push(announcer::spawn_announcer(
        swarm_handle.clone(),
        manager.clone(),
        config.announce_interval(),
        shutdown.clone(),
    ));

    let relay =
        start_relay(&config, &swarm_handle, &shutdown, &mut supervisors)
            .await;

    // Best-effort bootstrap dials.
    for addr in parse_addrs(&config.bootstrap_peers) {
        if let Err(e) = swarm_handle.dial(addr.clone()).await {
            warn!(%addr, "Bootstrap dial failed: {e}");
        }
    }

    // The loopback control plane. A taken port disables the operator
    // surface, not the node.
    let state = Arc::new(server::NodeState {
        config: config.clone(),
        started_at: TimestampMs::now(),
        swarm: swarm_handle.clone(),
        handler: handler.clone(),
        manager: manager.clone(),
        relay,
        directory: directory.clone(),
        chain,
        payment_keypair,
    });
    match tokio::net::TcpListener::bind((
        std::net::Ipv4Addr::LOCALHOST,
        config.http_port,
    ))
    .await
    {
        Ok(listener) => {
            info!("Control plane listening on 127.0.0.1:{}", config.http_port);
            let router = server::router(state);
            let http_shutdown = shutdown.clone();
            supervisors.push(SatTask::spawn("http-server", async move {
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(http_shutdown.recv_owned())
                    .await;
                if let Err(e) = result {
                    error!("Control plane server error: {e}");
                }
            }));
        }
        Err(e) => error!(
            "Control plane disabled; failed to bind 127.0.0.1:{}: {e}",
            config.http_port
        ),
    }

    // Cooperative shutdown on ctrl-c.
    {
        let shutdown = shutdown.clone();
        supervisors.push(SatTask::spawn("signal-listener", async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received ctrl-c; shutting down"),
                Err(e) => error!("Signal listener failed: {e}"),
            }
            shutdown.send();
        }));
    }

    // Hold the ephemeral channel open for the lifetime of the join.
    let (_eph_tx, eph_rx) = mpsc::channel(16);
    satchel_tokio::task::join_tasks_and_shutdown(
        "node",
        TaskGroups {
            supervisors,
            transport: transport_tasks,
        },
        eph_rx,
        shutdown,
        transport_shutdown,
        constants::SHUTDOWN_TIMEOUT,
    )
    .await;

    Ok(())
}

/// Set up the relay manager and its supervisors, or disable the relay on
/// any configuration problem. The node is merely direct-dial-only
/// without it.
async fn start_relay(
    config: &NodeConfig,
    swarm_handle: &SwarmHandle,
    shutdown: &NotifyOnce,
    supervisors: &mut Vec<SatTask<()>>,
) -> Option<Arc<RelayManager>> {
    let addr_str = config.relay_addr.as_ref()?;

    let relay_addr: Multiaddr = match addr_str.parse() {
        Ok(relay_addr) => relay_addr,
        Err(e) => {
            error!("Relay disabled; relay_addr is not a multiaddr: {e}");
            return None;
        }
    };
    let relay = match RelayManager::new(
        Arc::new(swarm_handle.clone()),
        relay_addr,
    ) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!("Relay disabled: {e}");
            return None;
        }
    };

    supervisors.push(
        relay.spawn_maintenance(
            config.health_check_interval(),
            shutdown.clone(),
        ),
    );

    // Establish the reservation at startup if we can; fall back to the
    // background retry if we can't.
    let reserved = match relay.dial_relay().await {
        Ok(()) =>
            relay
                .wait_for_reservation(config.relay_reservation_timeout())
                .await,
        Err(e) => {
            warn!("Relay dial failed: {e}");
            false
        }
    };
    if reserved {
        info!("Relay reservation established");
    } else {
        warn!("No relay reservation at startup; retrying in background");
        supervisors.push(relay.spawn_reservation_retry(shutdown.clone()));
    }

    Some(relay)
}

fn parse_addrs(addrs: &[String]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Ignoring unparseable multiaddr {s}: {e}");
                None
            }
        })
        .collect()
}

/// Keep the peer directory in sync with connection events and inbound
/// announcements.
fn spawn_directory_sync(
    swarm: SwarmHandle,
    directory: Arc<PeerDirectory>,
    shutdown: NotifyOnce,
) -> SatTask<()> {
    SatTask::spawn("directory-sync", async move {
        let mut shutdown = shutdown;
        let mut events = swarm.subscribe_events();
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(NetEvent::PeerConnected(peer)) =>
                        directory.record_seen(peer, None),
                    Ok(NetEvent::Discovered { peer, addr }) =>
                        directory.record_seen(peer, Some(addr.to_string())),
                    Ok(NetEvent::GossipMessage { topic, source, data })
                        if topic == proto::ANNOUNCE_TOPIC =>
                    {
                        match serde_json::from_slice::<Announcement>(&data) {
                            Ok(announcement) => {
                                let peer = source.or_else(|| {
                                    announcement.peer_id.parse().ok()
                                });
                                if let Some(peer) = peer {
                                    directory.record_announcement(
                                        peer,
                                        &announcement,
                                    );
                                }
                            }
                            Err(e) =>
                                debug!("Undecodable announcement: {e}"),
                        }
                    }
                    Ok(_) => (),
                    Err(broadcast::error::RecvError::Lagged(n)) =>
                        debug!("Directory sync lagged {n} events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
