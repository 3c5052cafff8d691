//! Node configuration.
//!
//! Every recognized option, its wire name, and its default. The binary
//! layers argh flags and env vars on top of these defaults; the core only
//! ever sees a fully resolved [`NodeConfig`].

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::ensure;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::constants;

/// A fully resolved node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP listen port for the p2p transport.
    pub port: u16,
    /// Loopback port for the HTTP control plane.
    pub http_port: u16,
    /// Seed list of multi-addresses dialed at startup.
    pub bootstrap_peers: Vec<String>,
    /// Explicit self-advertised addresses (bypasses auto-detect).
    pub announce_addrs: Vec<String>,
    /// The circuit relay this node keeps a reservation with.
    pub relay_addr: Option<String>,
    /// Enables local-network peer discovery.
    pub enable_mdns: bool,
    /// Startup wait for the first relay reservation before falling back to
    /// the background retry.
    pub relay_reservation_timeout_ms: u64,
    /// Relay supervisor cadence.
    pub health_check_interval_ms: u64,
    /// Service-announcement cadence.
    pub announce_interval_ms: u64,
    /// Threshold for automatic channel acceptance.
    pub auto_accept_channels: AutoAcceptPolicy,
    /// Default `nLockTime` offset for new channels.
    pub default_channel_lifetime_ms: u64,
    /// Minimum accepted channel capacity, in satoshis.
    pub min_capacity: u64,
    /// Maximum accepted channel capacity, in satoshis.
    pub max_capacity: u64,
    /// Total fee reserved by commitment and settlement transactions.
    pub commitment_fee_sats: u64,
    /// Funding transaction fee rate, in satoshis per byte.
    pub fee_rate_sat_per_byte: u64,
    /// Maximum framed message size accepted on any stream.
    pub max_message_bytes: usize,
    /// Directory holding the identity key, payment key and channel store.
    pub data_dir: PathBuf,
    /// Base url of the on-chain services (broadcast, utxos, proofs). When
    /// unset, chain operations report unavailable instead of failing hard.
    pub chain_api_url: Option<String>,
    /// Base url of the agent notification sink, e.g. `http://127.0.0.1:4040`.
    pub agent_hooks_url: Option<String>,
    /// Bearer token presented to the agent notification sink.
    pub agent_hooks_token: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9011,
            http_port: 9080,
            bootstrap_peers: Vec::new(),
            announce_addrs: Vec::new(),
            relay_addr: None,
            enable_mdns: false,
            relay_reservation_timeout_ms: 15_000,
            health_check_interval_ms: constants::DEFAULT_HEALTH_CHECK_INTERVAL
                .as_millis() as u64,
            announce_interval_ms: constants::DEFAULT_ANNOUNCE_INTERVAL
                .as_millis() as u64,
            auto_accept_channels: AutoAcceptPolicy::Manual,
            default_channel_lifetime_ms: 24 * 60 * 60 * 1000,
            min_capacity: 1_000,
            max_capacity: 10_000_000,
            commitment_fee_sats: constants::DEFAULT_COMMITMENT_FEE_SATS,
            fee_rate_sat_per_byte: constants::DEFAULT_FEE_RATE_SAT_PER_BYTE,
            max_message_bytes: constants::MAX_MESSAGE_BYTES,
            data_dir: PathBuf::from(".satchel"),
            chain_api_url: None,
            agent_hooks_url: None,
            agent_hooks_token: None,
        }
    }
}

impl NodeConfig {
    /// Validate cross-field invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.min_capacity > 0, "min_capacity must be positive");
        ensure!(
            self.min_capacity <= self.max_capacity,
            "min_capacity must not exceed max_capacity"
        );
        ensure!(
            self.max_message_bytes > 0,
            "max_message_bytes must be positive"
        );
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn relay_reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_reservation_timeout_ms)
    }

    pub fn default_channel_lifetime(&self) -> Duration {
        Duration::from_millis(self.default_channel_lifetime_ms)
    }
}

/// When to accept an inbound channel open without operator involvement.
///
/// Serialized as the string `"manual"`, the string `"all"`, or a satoshi
/// threshold. The number `0` also means manual, matching the documented
/// "0 = always manual" semantics of the config table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AutoAcceptPolicy {
    /// Every open proposal requires an operator decision.
    Manual,
    /// Accept proposals with capacity strictly below this many satoshis.
    Below(u64),
    /// Accept every proposal.
    All,
}

impl AutoAcceptPolicy {
    /// Whether a channel of `capacity_sats` should be accepted
    /// automatically.
    pub fn accepts(&self, capacity_sats: u64) -> bool {
        match self {
            Self::Manual => false,
            Self::Below(threshold) => capacity_sats < *threshold,
            Self::All => true,
        }
    }
}

impl fmt::Display for AutoAcceptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Below(threshold) => write!(f, "{threshold}"),
            Self::All => write!(f, "all"),
        }
    }
}

impl Serialize for AutoAcceptPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Manual => serializer.serialize_str("manual"),
            Self::All => serializer.serialize_str("all"),
            Self::Below(threshold) => serializer.serialize_u64(*threshold),
        }
    }
}

impl<'de> Deserialize<'de> for AutoAcceptPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Threshold(u64),
            Named(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Threshold(0) => Ok(Self::Manual),
            Repr::Threshold(sats) => Ok(Self::Below(sats)),
            Repr::Named(s) if s == "manual" => Ok(Self::Manual),
            Repr::Named(s) if s == "all" => Ok(Self::All),
            Repr::Named(other) => Err(de::Error::unknown_variant(
                &other,
                &["manual", "all", "<satoshis>"],
            )),
        }
    }
}
