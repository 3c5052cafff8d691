//! Periodic service announcements and node-status heartbeats on the
//! pub-sub topics.

use std::{sync::Arc, time::Duration};

use common::time::TimestampMs;
use satchel_channel::ChannelManager;
use satchel_net::{directory::Announcement, SwarmHandle};
use satchel_tokio::{notify_once::NotifyOnce, task::SatTask};
use satchel_wire::proto;
use tracing::debug;

pub fn spawn_announcer(
    swarm: SwarmHandle,
    manager: Arc<ChannelManager>,
    interval: Duration,
    shutdown: NotifyOnce,
) -> SatTask<()> {
    SatTask::spawn("announcer", async move {
        let mut shutdown = shutdown;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );

        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                _ = ticker.tick() => announce(&swarm, &manager).await,
            }
        }
    })
}

async fn announce(swarm: &SwarmHandle, manager: &ChannelManager) {
    let addrs = swarm
        .self_addrs()
        .await
        .unwrap_or_default()
        .iter()
        .map(|addr| addr.to_string())
        .collect();

    let announcement = Announcement {
        peer_id: swarm.local_peer_id().to_string(),
        services: Vec::new(),
        addrs,
        timestamp: TimestampMs::now(),
    };
    match serde_json::to_vec(&announcement) {
        Ok(data) => {
            let _ = swarm.publish(proto::ANNOUNCE_TOPIC, data).await;
        }
        Err(e) => debug!("Failed to encode announcement: {e}"),
    }

    let status = serde_json::json!({
        "peerId": swarm.local_peer_id().to_string(),
        "channelCount": manager.list().await.len(),
        "timestamp": TimestampMs::now(),
    });
    match serde_json::to_vec(&status) {
        Ok(data) => {
            let _ = swarm.publish(proto::NODE_STATUS_TOPIC, data).await;
        }
        Err(e) => debug!("Failed to encode node status: {e}"),
    }
}
