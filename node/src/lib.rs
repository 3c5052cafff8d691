//! The satchel node: wires the transport fabric, relay manager, message
//! handler, channel manager and control plane into one long-running
//! process.

/// Periodic service announcements and node-status heartbeats.
pub mod announcer;
/// On-chain service implementations.
pub mod chain;
/// Command line arguments and config resolution.
pub mod cli;
/// The agent-notification sink.
pub mod notifier;
/// The file-backed channel store and key persistence.
pub mod persister;
/// Bootstrap, component wiring, and the task joiner.
pub mod run;
/// The loopback HTTP control plane.
pub mod server;
/// The inbound message subscriber gluing handler and channel manager.
pub mod service;
