//! The file-backed channel store, plus identity and payment key
//! persistence.
//!
//! Layout under the data dir:
//!
//! ```text
//! identity.key                    libp2p keypair, protobuf encoding
//! payment.key                     secp256k1 secret, hex
//! channels/<id>.json              full channel record
//! channels/<id>.payments.jsonl    append-only payment log
//! ```
//!
//! Channel records are written to a temp file in the same directory and
//! renamed into place, so a crash leaves either the old or the new
//! record, never a torn one.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use libp2p::identity::Keypair;
use satchel_chain::PaymentKeypair;
use satchel_channel::{Channel, ChannelPersister, PaymentRecord};
use satchel_wire::ChannelId;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub struct FilePersister {
    channels_dir: PathBuf,
}

impl FilePersister {
    pub async fn new(data_dir: &Path) -> anyhow::Result<Self> {
        let channels_dir = data_dir.join("channels");
        tokio::fs::create_dir_all(&channels_dir)
            .await
            .context("Failed to create the channels directory")?;
        Ok(Self { channels_dir })
    }

    fn channel_path(&self, id: ChannelId) -> PathBuf {
        self.channels_dir.join(format!("{id}.json"))
    }

    fn log_path(&self, id: ChannelId) -> PathBuf {
        self.channels_dir.join(format!("{id}.payments.jsonl"))
    }
}

#[async_trait]
impl ChannelPersister for FilePersister {
    async fn persist_channel(&self, channel: &Channel) -> anyhow::Result<()> {
        let path = self.channel_path(channel.id);
        let tmp = self.channels_dir.join(format!("{}.json.tmp", channel.id));

        let json = serde_json::to_vec_pretty(channel)
            .context("Failed to serialize channel")?;
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to rename into {}", path.display()))
    }

    async fn append_payment(
        &self,
        record: &PaymentRecord,
    ) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)
            .context("Failed to serialize payment record")?;
        line.push(b'\n');

        let path = self.log_path(record.channel_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.channels_dir)
            .await
            .context("Failed to read the channels directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Channel>(&contents) {
                Ok(channel) => channels.push(channel),
                // Don't let one corrupt record brick the node.
                Err(e) => warn!(
                    "Skipping unreadable channel record {}: {e}",
                    path.display()
                ),
            }
        }
        Ok(channels)
    }
}

/// Load the node's transport identity, generating and persisting one at
/// first run.
pub async fn load_or_create_identity(
    data_dir: &Path,
) -> anyhow::Result<Keypair> {
    let path = data_dir.join("identity.key");
    match tokio::fs::read(&path).await {
        Ok(bytes) => Keypair::from_protobuf_encoding(&bytes)
            .context("Corrupt identity key file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate_ed25519();
            let bytes = keypair
                .to_protobuf_encoding()
                .context("Failed to encode identity key")?;
            write_secret(&path, &bytes).await?;
            info!("Generated new node identity at {}", path.display());
            Ok(keypair)
        }
        Err(e) =>
            Err(e).context(format!("Failed to read {}", path.display())),
    }
}

/// Load the payment-system secret key, generating and persisting one at
/// first run.
pub async fn load_or_create_payment_key(
    data_dir: &Path,
) -> anyhow::Result<PaymentKeypair> {
    let path = data_dir.join("payment.key");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let bytes = hex::decode(contents.trim())
                .context("Payment key file is not hex")?;
            PaymentKeypair::from_secret_bytes(&bytes)
                .context("Corrupt payment key file")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = PaymentKeypair::generate();
            let encoded = hex::encode(keypair.secret_bytes());
            write_secret(&path, encoded.as_bytes()).await?;
            info!("Generated new payment key at {}", path.display());
            Ok(keypair)
        }
        Err(e) =>
            Err(e).context(format!("Failed to read {}", path.display())),
    }
}

async fn write_secret(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(0o600),
        )
        .await
        .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    Ok(())
}
