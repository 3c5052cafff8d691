//! Logger configuration for the satchel node and its tools.
//!
//! The default filter runs satchel code at INFO but quiets the transport
//! internals: gossipsub heartbeats, yamux frames and mdns probes would
//! otherwise drown the node's own logs on every tick.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Consulted before `RUST_LOG`, so operators can tune node logging
/// without disturbing a machine-wide `RUST_LOG`.
const SATCHEL_LOG: &str = "SATCHEL_LOG";

/// Initialize a global `tracing` logger.
///
/// + The logger will print enabled `tracing` events and spans to stdout.
/// + The default filter is INFO, with the chattier libp2p internals
///   capped at WARN; see [`default_targets`].
/// + Override with `SATCHEL_LOG` (or `RUST_LOG`) using the usual targets
///   syntax, e.g. `SATCHEL_LOG=info,satchel_net=debug`.
///
/// Panics if a logger is already initialized. This will fail if used in
/// tests, since multiple test threads will compete to set the global
/// logger.
pub fn init() {
    try_init().expect("Failed to setup logger");
}

/// Use this to initialize the global logger in tests.
pub fn init_for_testing() {
    // Quickly skip logger setup if no env var set.
    if std::env::var_os(SATCHEL_LOG).is_none()
        && std::env::var_os("RUST_LOG").is_none()
    {
        return;
    }

    // Don't panic if there's already a logger setup. Multiple tests might
    // try setting the global logger.
    let _ = try_init();
}

/// Try to initialize a global logger. Will return an `Err` if there is
/// another global logger already set.
pub fn try_init() -> Result<(), TryInitError> {
    let env_filter = std::env::var(SATCHEL_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| Targets::from_str(&directives).ok());
    let filter = env_filter.unwrap_or_else(default_targets);

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}

/// INFO for the node's own crates; WARN for transport dependencies that
/// log routine housekeeping at INFO/DEBUG.
fn default_targets() -> Targets {
    Targets::new()
        .with_default(Level::INFO)
        .with_target("libp2p_gossipsub", Level::WARN)
        .with_target("libp2p_mdns", Level::WARN)
        .with_target("libp2p_swarm", Level::WARN)
        .with_target("libp2p_tcp", Level::WARN)
        .with_target("multistream_select", Level::WARN)
        .with_target("yamux", Level::WARN)
        .with_target("hickory_resolver", Level::WARN)
}
