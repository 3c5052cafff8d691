//! The satchel transport fabric: the libp2p swarm and its driver task,
//! the relay reservation lifecycle manager, the length-framed message
//! handler, and the peer directory.

/// One-envelope-per-stream codecs for the messaging and ping protocols.
pub mod codec;
/// The peer directory cache and announcement types.
pub mod directory;
/// Network error kinds.
pub mod error;
/// The message handler: correlation, timeouts, dispatch, fan-out.
pub mod handler;
/// The relay reservation lifecycle manager.
pub mod relay;
/// The swarm behaviour, driver task, and cloneable handle.
pub mod swarm;

pub use error::NetError;
pub use handler::{AgentNotifier, MessageHandler, NotifyKind, SubscriberAction};
pub use relay::{RelayError, RelayHealth, RelayManager};
pub use swarm::{NetEvent, SwarmHandle};
