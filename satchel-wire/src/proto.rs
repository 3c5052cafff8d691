//! On-the-wire protocol identifiers. Opaque strings which must match
//! bit-exactly across implementations wishing to interoperate.

/// The fixed namespace prefix shared by every protocol id and topic.
pub const PROTOCOL_NS: &str = "satchel";

/// The messaging protocol: one varint-framed envelope per stream.
pub const MESSAGE_PROTOCOL: &str = "/satchel/message/1.0.0";

/// The legacy channel protocol id. Channel envelopes now travel over
/// [`MESSAGE_PROTOCOL`]; this id is still registered so older peers can
/// reach us.
pub const CHANNEL_PROTOCOL: &str = "/satchel/channel/1.0.0";

/// Liveness probe: 32 random bytes echoed back.
pub const PING_PROTOCOL: &str = "/satchel/ping/1.0.0";

/// Pub-sub topic for service announcements.
pub const ANNOUNCE_TOPIC: &str = "/satchel/announce/1.0.0";

/// Pub-sub topic for node status heartbeats.
pub const NODE_STATUS_TOPIC: &str = "/satchel/node-status/1.0.0";
