//! The satchel wire model: typed message envelopes, the varint
//! length-prefix framing used on every stream, and the protocol id
//! constants shared by every implementation.

/// Message envelopes and typed payloads.
pub mod envelope;
/// Length-prefix framing.
pub mod frame;
/// Protocol ids and pub-sub topics.
pub mod proto;

pub use envelope::{ChannelId, Envelope, MsgBody, MsgId};
