//! Protocol-wide constants.

use std::time::Duration;

/// The minimum output value the chain's relay policy will propagate, in
/// satoshis. Balances at or below this are omitted from commitment outputs.
pub const DUST_LIMIT_SATS: u64 = 546;

/// Default funding transaction fee rate, in satoshis per byte.
pub const DEFAULT_FEE_RATE_SAT_PER_BYTE: u64 = 1;

/// Default total fee reserved by a commitment or settlement transaction,
/// split between the two parties proportional to their balances.
pub const DEFAULT_COMMITMENT_FEE_SATS: u64 = 500;

/// The maximum framed message size accepted on any stream. Frames with a
/// length prefix above this are rejected before the body is allocated.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Capacity of the peer directory cache.
pub const PEER_DIRECTORY_CAPACITY: usize = 1000;

/// How long a peer directory entry stays fresh.
pub const PEER_DIRECTORY_TTL: Duration = Duration::from_secs(60 * 60);

/// Default cadence of the relay connection health check.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How long the relay manager waits for a reservation to (re)materialize
/// after dialing the relay.
pub const RESERVATION_RESTORE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence at which `wait_for_reservation` polls self-advertised addresses.
pub const RESERVATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Initial wait of the background relay reservation retry.
pub const RELAY_RETRY_INITIAL_WAIT: Duration = Duration::from_secs(30);

/// Maximum wait of the background relay reservation retry.
pub const RELAY_RETRY_MAX_WAIT: Duration = Duration::from_secs(5 * 60);

/// Default cadence of service announcements on the announce topic.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Default timeout for a request awaiting its correlated response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the node waits for tasks to finish after a shutdown signal.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
