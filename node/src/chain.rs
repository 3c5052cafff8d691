//! On-chain service implementations.
//!
//! The core only consumes the abstract traits; these are the two concrete
//! backends the binary can inject: a JSON-over-HTTP client for an
//! external chain service, and a stub that reports unavailability when no
//! chain service is configured.

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bitcoin::Txid;
use common::config::NodeConfig;
use satchel_chain::{ProofSource, TxBroadcaster, Utxo, UtxoSource};
use serde::Deserialize;
use tracing::error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The bundle of on-chain services injected into the node.
#[derive(Clone)]
pub struct ChainServices {
    pub broadcaster: Arc<dyn TxBroadcaster>,
    pub utxos: Arc<dyn UtxoSource>,
    pub proofs: Arc<dyn ProofSource>,
}

impl ChainServices {
    /// Infallible: a misconfigured or unbuildable chain client degrades
    /// to the unavailable stub rather than taking the node down. Chain
    /// errors are reported per-operation, not recovered.
    pub fn from_config(config: &NodeConfig) -> Self {
        match &config.chain_api_url {
            Some(base_url) => match HttpChainService::new(base_url.clone()) {
                Ok(service) => {
                    let service = Arc::new(service);
                    Self {
                        broadcaster: service.clone(),
                        utxos: service.clone(),
                        proofs: service,
                    }
                }
                Err(e) => {
                    error!("Chain services degraded to unavailable: {e:#}");
                    Self::unavailable()
                }
            },
            None => Self::unavailable(),
        }
    }

    pub fn unavailable() -> Self {
        let service = Arc::new(UnavailableChainService);
        Self {
            broadcaster: service.clone(),
            utxos: service.clone(),
            proofs: service,
        }
    }
}

/// JSON-over-HTTP client for an external chain service.
pub struct HttpChainService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    txid: String,
}

#[derive(Deserialize)]
struct ProofResponse {
    proof: String,
}

impl HttpChainService {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build chain http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl TxBroadcaster for HttpChainService {
    async fn broadcast(&self, raw_tx: &[u8]) -> anyhow::Result<Txid> {
        let url = format!("{}/tx/broadcast", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "rawTx": hex::encode(raw_tx) }))
            .send()
            .await
            .context("broadcast-failed: request error")?;
        if !response.status().is_success() {
            bail!("broadcast-failed: http {}", response.status());
        }
        let body: BroadcastResponse = response
            .json()
            .await
            .context("broadcast-failed: malformed response")?;
        Txid::from_str(&body.txid).context("broadcast-failed: bad txid")
    }
}

#[async_trait]
impl UtxoSource for HttpChainService {
    async fn get_utxos(&self) -> anyhow::Result<Vec<Utxo>> {
        let url = format!("{}/utxos", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("utxo-service-unavailable: request error")?;
        if !response.status().is_success() {
            bail!("utxo-service-unavailable: http {}", response.status());
        }
        response
            .json()
            .await
            .context("utxo-service-unavailable: malformed response")
    }
}

#[async_trait]
impl ProofSource for HttpChainService {
    async fn get_proof(&self, txid: Txid) -> anyhow::Result<Option<Vec<u8>>> {
        let url = format!("{}/proof/{txid}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("proof-unavailable: request error")?;
        if response.status() == http::StatusCode::NOT_FOUND {
            // Not yet confirmed.
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("proof-unavailable: http {}", response.status());
        }
        let body: ProofResponse = response
            .json()
            .await
            .context("proof-unavailable: malformed response")?;
        let bytes = hex::decode(body.proof)
            .context("proof-unavailable: proof is not hex")?;
        Ok(Some(bytes))
    }
}

/// Reports unavailability for every operation. Injected when no chain
/// service is configured, so channel negotiation still works while
/// funding and settlement broadcast do not.
pub struct UnavailableChainService;

#[async_trait]
impl TxBroadcaster for UnavailableChainService {
    async fn broadcast(&self, _raw_tx: &[u8]) -> anyhow::Result<Txid> {
        Err(anyhow!("broadcast-failed: no chain service configured"))
    }
}

#[async_trait]
impl UtxoSource for UnavailableChainService {
    async fn get_utxos(&self) -> anyhow::Result<Vec<Utxo>> {
        Err(anyhow!("utxo-service-unavailable: no chain service configured"))
    }
}

#[async_trait]
impl ProofSource for UnavailableChainService {
    async fn get_proof(&self, _txid: Txid) -> anyhow::Result<Option<Vec<u8>>> {
        Err(anyhow!("proof-unavailable: no chain service configured"))
    }
}
