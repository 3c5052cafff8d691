//! The loopback HTTP control plane: a minimal JSON API for operators.
//!
//! Caller mistakes return 4xx, internal invariant violations 5xx, and
//! remote-party rejections 200 with a structured error body.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use common::{config::NodeConfig, time::TimestampMs};
use satchel_chain::PaymentKeypair;
use satchel_channel::ChannelManager;
use satchel_net::{directory::PeerDirectory, MessageHandler, RelayManager, SwarmHandle};

use crate::chain::ChainServices;

/// Typed errors and their HTTP status mapping.
mod error;
/// The route handlers.
mod routes;

pub use error::ApiError;

pub struct NodeState {
    pub config: NodeConfig,
    pub started_at: TimestampMs,
    pub swarm: SwarmHandle,
    pub handler: Arc<MessageHandler>,
    pub manager: Arc<ChannelManager>,
    pub relay: Option<Arc<RelayManager>>,
    pub directory: Arc<PeerDirectory>,
    pub chain: ChainServices,
    pub payment_keypair: PaymentKeypair,
}

pub fn router(state: Arc<NodeState>) -> Router<()> {
    #[rustfmt::skip]
    let router = Router::new()
        .route("/status", get(routes::status))
        .route("/peers", get(routes::peers))
        .route("/channels", get(routes::channels))
        .route("/send", post(routes::send))
        .route("/channel/open", post(routes::channel_open))
        .route("/channel/fund", post(routes::channel_fund))
        .route("/channel/pay", post(routes::channel_pay))
        .route("/channel/close", post(routes::channel_close))
        .route("/wallet/send", post(routes::wallet_send))
        .route("/discover", get(routes::discover))
        .with_state(state);
    router
}
