//! The relay reservation lifecycle manager.
//!
//! A circuit reservation is only valid while the connection to the relay
//! is continuously maintained, so the manager watches the *connection*,
//! never the reservation symbol alone. The supervisor must never close a
//! live relay connection to "refresh" a reservation; dropping the
//! connection is exactly what invalidates it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{backoff, constants};
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use satchel_tokio::{notify_once::NotifyOnce, task::SatTask};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    error::NetError,
    swarm::{peer_id_of, NetEvent, SwarmHandle},
};

/// Relay health problems, reported alongside the boolean health flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum RelayError {
    #[error("Not connected to the relay")]
    NotConnected,
    #[error("Connected to the relay but no reservation is visible")]
    NoReservation,
    #[error("Relay connection lost; reconnecting with backoff")]
    DisconnectedRetrying,
}

impl RelayError {
    /// The stable kind string reported on the control plane.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not-connected",
            Self::NoReservation => "no-reservation",
            Self::DisconnectedRetrying => "disconnected-and-retrying",
        }
    }
}

/// A point-in-time relay health report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RelayHealth {
    pub reachable: bool,
    pub error: Option<RelayError>,
}

/// The slice of the transport the relay manager needs. Production uses
/// [`SwarmHandle`]; tests inject a fake.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn dial(&self, addr: Multiaddr) -> Result<(), NetError>;
    async fn listen_on_circuit(
        &self,
        relay_addr: Multiaddr,
    ) -> Result<(), NetError>;
    async fn is_connected(&self, peer: PeerId) -> bool;
    async fn self_addrs(&self) -> Vec<Multiaddr>;
    fn subscribe_events(&self) -> broadcast::Receiver<NetEvent>;
}

#[async_trait]
impl RelayTransport for SwarmHandle {
    async fn dial(&self, addr: Multiaddr) -> Result<(), NetError> {
        SwarmHandle::dial(self, addr).await
    }

    async fn listen_on_circuit(
        &self,
        relay_addr: Multiaddr,
    ) -> Result<(), NetError> {
        SwarmHandle::listen_on_circuit(self, relay_addr).await
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        SwarmHandle::is_connected(self, peer).await.unwrap_or(false)
    }

    async fn self_addrs(&self) -> Vec<Multiaddr> {
        SwarmHandle::self_addrs(self).await.unwrap_or_default()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<NetEvent> {
        SwarmHandle::subscribe_events(self)
    }
}

/// Keeps the node reachable through one configured relay peer.
pub struct RelayManager {
    transport: Arc<dyn RelayTransport>,
    relay_addr: Multiaddr,
    relay_peer_id: PeerId,
    /// Whether the background reservation retry is currently running.
    retrying: AtomicBool,
}

impl RelayManager {
    /// `relay_addr` must carry the relay's `/p2p/<peer>` component.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        relay_addr: Multiaddr,
    ) -> Result<Self, NetError> {
        let relay_peer_id =
            peer_id_of(&relay_addr).ok_or(NetError::MissingPeerId)?;
        Ok(Self {
            transport,
            relay_addr,
            relay_peer_id,
            retrying: AtomicBool::new(false),
        })
    }

    pub fn relay_peer_id(&self) -> PeerId {
        self.relay_peer_id
    }

    /// Dial the relay and request a reservation categorized as configured.
    ///
    /// Success means the dial and the reservation *request* went through;
    /// it does not imply the reservation is already visible in our
    /// self-advertised addresses. Use [`wait_for_reservation`] for that.
    ///
    /// [`wait_for_reservation`]: Self::wait_for_reservation
    pub async fn dial_relay(&self) -> Result<(), NetError> {
        self.transport.dial(self.relay_addr.clone()).await?;
        self.transport
            .listen_on_circuit(self.relay_addr.clone())
            .await
    }

    /// Poll self-advertised addresses until one carries a `p2p-circuit`
    /// segment through our configured relay, or the timeout elapses.
    pub async fn wait_for_reservation(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_reservation().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(constants::RESERVATION_POLL_INTERVAL).await;
        }
    }

    /// Whether a circuit address through the configured relay is currently
    /// advertised.
    pub async fn has_reservation(&self) -> bool {
        self.transport
            .self_addrs()
            .await
            .iter()
            .any(|addr| is_circuit_through(addr, &self.relay_peer_id))
    }

    pub async fn is_connected_to_relay(&self) -> bool {
        self.transport.is_connected(self.relay_peer_id).await
    }

    /// Health as a boolean plus an enumerated error.
    pub async fn health(&self) -> RelayHealth {
        let connected = self.is_connected_to_relay().await;
        let reserved = self.has_reservation().await;
        let error = if !connected {
            if self.retrying.load(Ordering::Relaxed) {
                Some(RelayError::DisconnectedRetrying)
            } else {
                Some(RelayError::NotConnected)
            }
        } else if !reserved {
            Some(RelayError::NoReservation)
        } else {
            None
        };
        RelayHealth {
            reachable: connected && reserved,
            error,
        }
    }

    /// The maintenance supervisor: every `interval`, check whether the
    /// transport still holds a live connection to the relay and re-dial if
    /// not. Relay disconnect events trigger an immediate reconnect,
    /// independent of the periodic tick. A live connection is never
    /// closed.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: NotifyOnce,
    ) -> SatTask<()> {
        let manager = self.clone();
        SatTask::spawn("relay-maintenance", async move {
            let mut shutdown = shutdown;
            let mut events = manager.transport.subscribe_events();
            let mut ticker = tokio::time::interval(interval);
            ticker
                .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(NetEvent::PeerDisconnected(peer))
                            if peer == manager.relay_peer_id =>
                        {
                            warn!("Relay connection lost; reconnecting now");
                            manager.reconnect_and_wait().await;
                        }
                        Ok(_) => (),
                        Err(broadcast::error::RecvError::Lagged(_)) => (),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        if !manager.is_connected_to_relay().await {
                            debug!("Relay health check: not connected");
                            manager.reconnect_and_wait().await;
                        }
                    }
                }
            }
        })
    }

    /// The background retry supervisor: if the startup reservation attempt
    /// fell through, keep retrying with exponential backoff (30s doubling,
    /// capped at 5min) until a reservation is observed.
    pub fn spawn_reservation_retry(
        self: &Arc<Self>,
        shutdown: NotifyOnce,
    ) -> SatTask<()> {
        let manager = self.clone();
        SatTask::spawn("relay-reservation-retry", async move {
            let mut shutdown = shutdown;
            manager.retrying.store(true, Ordering::Relaxed);

            let mut backoff_durations = backoff::iter_with_bounds(
                constants::RELAY_RETRY_INITIAL_WAIT.as_millis() as u64,
                constants::RELAY_RETRY_MAX_WAIT.as_millis() as u64,
            );

            loop {
                if manager.has_reservation().await {
                    info!("Relay reservation acquired");
                    break;
                }

                if let Err(e) = manager.dial_relay().await {
                    debug!("Relay retry dial failed: {e}");
                }
                if manager
                    .wait_for_reservation(
                        constants::RESERVATION_RESTORE_TIMEOUT,
                    )
                    .await
                {
                    info!("Relay reservation acquired");
                    break;
                }

                let wait = backoff_durations
                    .next()
                    .expect("Backoff iterator is infinite");
                debug!("Relay reservation retry in {wait:?}");
                tokio::select! {
                    () = shutdown.recv() => break,
                    () = tokio::time::sleep(wait) => (),
                }
            }

            manager.retrying.store(false, Ordering::Relaxed);
        })
    }

    async fn reconnect_and_wait(&self) {
        if let Err(e) = self.dial_relay().await {
            warn!("Relay reconnect failed: {e}");
            return;
        }
        if !self
            .wait_for_reservation(constants::RESERVATION_RESTORE_TIMEOUT)
            .await
        {
            warn!("Relay reservation did not restore in time");
        }
    }
}

/// Whether `addr` is a circuit address relayed through `relay`: it must
/// contain a `p2p-circuit` segment preceded by the relay's peer id.
fn is_circuit_through(addr: &Multiaddr, relay: &PeerId) -> bool {
    let mut saw_relay = false;
    for protocol in addr.iter() {
        match protocol {
            Protocol::P2p(peer_id) if peer_id == *relay => saw_relay = true,
            Protocol::P2pCircuit if saw_relay => return true,
            Protocol::P2pCircuit => return false,
            _ => (),
        }
    }
    false
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;

    struct FakeState {
        connected: bool,
        addrs: Vec<Multiaddr>,
        dials: usize,
        circuit_listens: usize,
        /// When true, a successful dial immediately grants a reservation.
        grant_on_dial: bool,
    }

    struct FakeTransport {
        relay: PeerId,
        state: Mutex<FakeState>,
        events: broadcast::Sender<NetEvent>,
    }

    impl FakeTransport {
        fn new(relay: PeerId, grant_on_dial: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                relay,
                state: Mutex::new(FakeState {
                    connected: false,
                    addrs: Vec::new(),
                    dials: 0,
                    circuit_listens: 0,
                    grant_on_dial,
                }),
                events,
            })
        }

        fn circuit_addr(&self) -> Multiaddr {
            format!("/ip4/10.0.0.9/tcp/4001/p2p/{}/p2p-circuit", self.relay)
                .parse()
                .unwrap()
        }

        fn drop_connection(&self) {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.addrs.clear();
            let _ = self.events.send(NetEvent::PeerDisconnected(self.relay));
        }

        fn dial_count(&self) -> usize {
            self.state.lock().unwrap().dials
        }
    }

    #[async_trait]
    impl RelayTransport for FakeTransport {
        async fn dial(&self, _addr: Multiaddr) -> Result<(), NetError> {
            let mut state = self.state.lock().unwrap();
            state.dials += 1;
            state.connected = true;
            Ok(())
        }

        async fn listen_on_circuit(
            &self,
            _relay_addr: Multiaddr,
        ) -> Result<(), NetError> {
            let grant = {
                let mut state = self.state.lock().unwrap();
                state.circuit_listens += 1;
                state.grant_on_dial && state.connected
            };
            if grant {
                let addr = self.circuit_addr();
                self.state.lock().unwrap().addrs.push(addr);
            }
            Ok(())
        }

        async fn is_connected(&self, peer: PeerId) -> bool {
            peer == self.relay && self.state.lock().unwrap().connected
        }

        async fn self_addrs(&self) -> Vec<Multiaddr> {
            self.state.lock().unwrap().addrs.clone()
        }

        fn subscribe_events(&self) -> broadcast::Receiver<NetEvent> {
            self.events.subscribe()
        }
    }

    fn relay_addr(relay: PeerId) -> Multiaddr {
        format!("/ip4/10.0.0.9/tcp/4001/p2p/{relay}").parse().unwrap()
    }

    fn manager(transport: Arc<FakeTransport>) -> Arc<RelayManager> {
        let addr = relay_addr(transport.relay);
        Arc::new(RelayManager::new(transport, addr).unwrap())
    }

    #[test]
    fn circuit_addr_detection() {
        let relay = PeerId::random();
        let other = PeerId::random();

        let through: Multiaddr =
            format!("/ip4/1.2.3.4/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{other}")
                .parse()
                .unwrap();
        assert!(is_circuit_through(&through, &relay));
        assert!(!is_circuit_through(&through, &other));

        let direct: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        assert!(!is_circuit_through(&direct, &relay));
    }

    #[test]
    fn missing_relay_peer_id_rejected() {
        let transport = FakeTransport::new(PeerId::random(), true);
        let bare: Multiaddr = "/ip4/10.0.0.9/tcp/4001".parse().unwrap();
        assert!(matches!(
            RelayManager::new(transport, bare),
            Err(NetError::MissingPeerId)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_then_wait_observes_reservation() {
        let relay = PeerId::random();
        let transport = FakeTransport::new(relay, true);
        let manager = manager(transport.clone());

        assert!(!manager.has_reservation().await);
        manager.dial_relay().await.unwrap();
        assert!(manager.wait_for_reservation(Duration::from_secs(5)).await);

        let health = manager.health().await;
        assert!(health.reachable);
        assert_eq!(health.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reservation_times_out() {
        let relay = PeerId::random();
        // Relay never grants.
        let transport = FakeTransport::new(relay, false);
        let manager = manager(transport.clone());

        manager.dial_relay().await.unwrap();
        assert!(!manager.wait_for_reservation(Duration::from_secs(3)).await);

        let health = manager.health().await;
        assert!(!health.reachable);
        assert_eq!(health.error, Some(RelayError::NoReservation));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_reconnects_after_disconnect_event() {
        let relay = PeerId::random();
        let transport = FakeTransport::new(relay, true);
        let manager = manager(transport.clone());

        manager.dial_relay().await.unwrap();
        assert!(manager.wait_for_reservation(Duration::from_secs(5)).await);
        let dials_before = transport.dial_count();

        let shutdown = NotifyOnce::new();
        let task = manager
            .spawn_maintenance(Duration::from_secs(10), shutdown.clone());

        // Let the supervisor task start and subscribe to events.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Forcibly drop the relay connection. The disconnect event should
        // trigger an immediate reconnect, well within one maintenance
        // interval plus the reservation wait.
        transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(manager.is_connected_to_relay().await);
        assert!(manager.has_reservation().await);
        assert!(transport.dial_count() > dials_before);

        shutdown.send();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_tick_redials_when_not_connected() {
        let relay = PeerId::random();
        let transport = FakeTransport::new(relay, true);
        let manager = manager(transport.clone());

        let shutdown = NotifyOnce::new();
        let task = manager
            .spawn_maintenance(Duration::from_secs(10), shutdown.clone());

        // Never dialed initially; the first ticks should bring it up.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(manager.is_connected_to_relay().await);
        assert!(transport.dial_count() >= 1);

        shutdown.send();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_supervisor_stops_once_reserved() {
        let relay = PeerId::random();
        let transport = FakeTransport::new(relay, true);
        let manager = manager(transport.clone());

        let shutdown = NotifyOnce::new();
        let task = manager.spawn_reservation_retry(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        // First attempt dials and immediately observes the reservation.
        task.await.unwrap();
        assert!(manager.has_reservation().await);
        assert!(!manager.retrying.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_supervisor_backs_off_and_reports_health() {
        let relay = PeerId::random();
        let transport = FakeTransport::new(relay, false);
        let manager = manager(transport.clone());

        let shutdown = NotifyOnce::new();
        let task = manager.spawn_reservation_retry(shutdown.clone());

        // Give it time for the first attempt plus the 10s wait to fail.
        tokio::time::sleep(Duration::from_secs(15)).await;
        let health = manager.health().await;
        assert!(!health.reachable);

        // Flip the relay to granting; the next retry should succeed
        // within the 30s initial backoff plus another attempt.
        transport.state.lock().unwrap().grant_on_dial = true;
        transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(manager.has_reservation().await);
        task.await.unwrap();

        shutdown.send();
    }
}
