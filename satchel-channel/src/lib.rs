//! The payment channel control plane: the per-channel entity, its
//! lifecycle and balance invariants, and the manager that serializes all
//! state transitions.

/// The channel entity and payment records.
pub mod channel;
/// Channel-state errors.
pub mod error;
/// The channel manager.
pub mod manager;
/// The persistence seam.
pub mod persister;

pub use channel::{Channel, ChannelState, PaymentDirection, PaymentRecord};
pub use error::ChannelError;
pub use manager::{ChannelManager, ChannelManagerConfig, OutboundPayment};
pub use persister::ChannelPersister;
