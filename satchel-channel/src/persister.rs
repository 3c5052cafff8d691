//! The persistence seam. The manager persists every accepted state
//! transition through this trait; the node injects a file-backed
//! implementation, tests inject a no-op.

use async_trait::async_trait;

use crate::channel::{Channel, PaymentRecord};

/// Durable storage for channel records and their payment logs.
///
/// Implementations must make `persist_channel` atomic: a crash mid-write
/// must leave either the old or the new record, never a torn one.
#[async_trait]
pub trait ChannelPersister: Send + Sync {
    /// Write the full channel record, replacing any previous version.
    async fn persist_channel(&self, channel: &Channel) -> anyhow::Result<()>;

    /// Append one payment to the channel's append-only log.
    async fn append_payment(&self, record: &PaymentRecord)
        -> anyhow::Result<()>;

    /// Load every persisted channel at startup.
    async fn load_channels(&self) -> anyhow::Result<Vec<Channel>>;
}

/// Persists nothing. For tests and ephemeral nodes.
pub struct NoopPersister;

#[async_trait]
impl ChannelPersister for NoopPersister {
    async fn persist_channel(&self, _channel: &Channel) -> anyhow::Result<()> {
        Ok(())
    }

    async fn append_payment(
        &self,
        _record: &PaymentRecord,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_channels(&self) -> anyhow::Result<Vec<Channel>> {
        Ok(Vec::new())
    }
}
