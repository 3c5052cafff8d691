use std::{str::FromStr, sync::Arc, time::Duration};

use axum::{extract::State, Json};
use bitcoin::consensus::encode::serialize;
use libp2p::{Multiaddr, PeerId};
use satchel_chain::{keys, tx};
use satchel_net::directory::PeerInfo;
use satchel_wire::{
    envelope::{
        ChannelClosePayload, ChannelOpenPayload, PaymentPayload, TextPayload,
    },
    ChannelId, MsgBody,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{ApiError, NodeState};

type ApiResult = Result<Json<Value>, ApiError>;

// --- GET /status --- //

pub(super) async fn status(State(state): State<Arc<NodeState>>) -> ApiResult {
    let peers = state.swarm.connected_peers().await.map_err(ApiError::from)?;
    let addrs = state.swarm.self_addrs().await.map_err(ApiError::from)?;
    let channels = state.manager.list().await;

    let relay = match &state.relay {
        Some(relay) => {
            let health = relay.health().await;
            json!({
                "relayPeerId": relay.relay_peer_id().to_string(),
                "reachable": health.reachable,
                "error": health.error.map(|e| e.kind()),
            })
        }
        None => Value::Null,
    };

    let uptime_ms =
        common::time::TimestampMs::now().as_i64() - state.started_at.as_i64();

    Ok(Json(json!({
        "peerId": state.swarm.local_peer_id().to_string(),
        "addrs": addrs.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        "relay": relay,
        "peerCount": peers.len(),
        "channelCount": channels.len(),
        "uptimeMs": uptime_ms,
    })))
}

// --- GET /peers --- //

pub(super) async fn peers(State(state): State<Arc<NodeState>>) -> ApiResult {
    let connected = state.swarm.connected_peers().await.map_err(ApiError::from)?;
    let known: Vec<PeerInfo> = state.directory.list();
    Ok(Json(json!({
        "connected": connected.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        "known": known,
    })))
}

// --- GET /channels --- //

pub(super) async fn channels(
    State(state): State<Arc<NodeState>>,
) -> ApiResult {
    let channels = state.manager.list().await;
    Ok(Json(json!({ "channels": channels })))
}

// --- POST /send --- //

#[derive(Deserialize)]
pub(super) struct SendRequest {
    to: String,
    content: String,
}

pub(super) async fn send(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<SendRequest>,
) -> ApiResult {
    let peer = resolve_peer(&state, &req.to).await?;
    let id = state
        .handler
        .send(
            peer,
            MsgBody::Text(TextPayload {
                content: req.content,
            }),
        )
        .await
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "ok": true, "id": id.to_string() })))
}

// --- POST /channel/open --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChannelOpenRequest {
    /// Peer id, or a full multiaddr to dial first.
    peer: String,
    /// The counterparty's payment public key, compressed hex.
    pub_key: String,
    capacity: u64,
    lifetime_ms: Option<u64>,
}

pub(super) async fn channel_open(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ChannelOpenRequest>,
) -> ApiResult {
    let peer = resolve_peer(&state, &req.peer).await?;
    let remote_pubkey = keys::parse_pubkey_hex(&req.pub_key).map_err(|_| {
        ApiError::bad_request("bad-public-key", "pubKey is not a public key")
    })?;
    let lifetime = Duration::from_millis(
        req.lifetime_ms
            .unwrap_or(state.config.default_channel_lifetime_ms),
    );

    let channel = state
        .manager
        .create(&peer.to_string(), remote_pubkey, req.capacity, lifetime)
        .await?;

    let reply = state
        .handler
        .send_expect_reply(
            peer,
            MsgBody::ChannelOpen(ChannelOpenPayload {
                channel_id: channel.id,
                pub_key: hex::encode(state.manager.local_pubkey().serialize()),
                capacity: channel.capacity,
                n_lock_time: channel.n_lock_time,
            }),
        )
        .await
        .map_err(ApiError::from)?;

    match reply.map(|envelope| envelope.body) {
        Some(MsgBody::ChannelAccept(accept)) => {
            let responder_pubkey = keys::parse_pubkey_hex(&accept.pub_key)
                .map_err(|_| {
                    ApiError::unavailable(
                        "bad-public-key",
                        "peer accept carried a bad public key",
                    )
                })?;
            let channel = state
                .manager
                .confirm_accept(channel.id, responder_pubkey)
                .await?;
            Ok(Json(json!({ "ok": true, "channel": channel })))
        }
        Some(MsgBody::ChannelReject(reject)) => Ok(Json(json!({
            "ok": false,
            "channel": channel,
            "remoteError": { "kind": "channel-rejected", "reason": reject.reason },
        }))),
        // No reply: the peer may accept later with an independent
        // channel_accept message; the channel stays pending until then.
        _ => Ok(Json(json!({
            "ok": true,
            "channel": channel,
            "pending": true,
        }))),
    }
}

// --- POST /channel/fund --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChannelIdRequest {
    channel_id: String,
}

pub(super) async fn channel_fund(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ChannelIdRequest>,
) -> ApiResult {
    let id = parse_channel_id(&req.channel_id)?;
    let channel = state.manager.get(id).await.ok_or_else(|| {
        ApiError::not_found("unknown-channel", "no such channel")
    })?;

    let utxos = state.chain.utxos.get_utxos().await?;
    let mut funding = tx::build_funding_tx(
        utxos,
        &channel.local_pub_key,
        &channel.remote_pub_key,
        channel.capacity,
        state.config.fee_rate_sat_per_byte,
        &state.payment_keypair.public_key(),
    )?;
    tx::sign_funding_tx(&mut funding, &state.payment_keypair)?;

    let raw = serialize(&funding.tx);
    let txid = state.chain.broadcaster.broadcast(&raw).await?;
    state
        .manager
        .set_funding(id, txid, funding.funding_vout)
        .await?;

    // Best-effort funding notification so the peer can index the outpoint.
    let remote = remote_peer(&channel.remote_peer_id)?;
    let notify = MsgBody::Payment(PaymentPayload {
        txid: txid.to_string(),
        vout: funding.funding_vout,
        satoshis: channel.capacity,
        address: hex::encode(funding.funding_script.as_bytes()),
        raw_tx: Some(hex::encode(&raw)),
        proof: None,
        memo: Some(format!("channel:{id}")),
    });
    if let Err(e) = state.handler.send(remote, notify).await {
        warn!(channel_id = %id, "Funding notification failed: {e}");
    }

    Ok(Json(json!({
        "ok": true,
        "txid": txid.to_string(),
        "vout": funding.funding_vout,
    })))
}

// --- POST /channel/pay --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChannelPayRequest {
    channel_id: String,
    amount: u64,
}

pub(super) async fn channel_pay(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ChannelPayRequest>,
) -> ApiResult {
    let id = parse_channel_id(&req.channel_id)?;
    let channel = state.manager.get(id).await.ok_or_else(|| {
        ApiError::not_found("unknown-channel", "no such channel")
    })?;
    let remote = remote_peer(&channel.remote_peer_id)?;

    let outbound = state.manager.create_payment(id, req.amount).await?;

    let reply = state
        .handler
        .send_expect_reply(
            remote,
            MsgBody::ChannelUpdate(outbound.payload.clone()),
        )
        .await;

    let reply = match reply {
        Ok(reply) => reply,
        Err(e) => {
            // Transport failure: roll back so a retry reuses the same
            // sequence number instead of re-incrementing past a payment
            // the peer never saw.
            if let Err(rollback) = state.manager.rollback_payment(&outbound).await
            {
                warn!(channel_id = %id, "Rollback failed: {rollback}");
            }
            return Err(e.into());
        }
    };

    match reply.map(|envelope| envelope.body) {
        Some(MsgBody::PaymentAck(_)) => Ok(Json(json!({
            "ok": true,
            "acked": true,
            "sequence": outbound.payload.new_sequence_number,
            "localBalance": outbound.payload.new_local_balance,
            "remoteBalance": outbound.payload.new_remote_balance,
        }))),
        Some(MsgBody::ChannelReject(reject)) => {
            state.manager.rollback_payment(&outbound).await?;
            Ok(Json(json!({
                "ok": false,
                "remoteError": {
                    "kind": "payment-rejected",
                    "reason": reject.reason,
                },
            })))
        }
        // No ack: keep the optimistic state per the send-side contract.
        _ => Ok(Json(json!({
            "ok": true,
            "acked": false,
            "sequence": outbound.payload.new_sequence_number,
        }))),
    }
}

// --- POST /channel/close --- //

pub(super) async fn channel_close(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ChannelIdRequest>,
) -> ApiResult {
    let id = parse_channel_id(&req.channel_id)?;

    let initiation = state.manager.close(id).await?;
    let remote = remote_peer(&initiation.channel.remote_peer_id)?;

    let reply = state
        .handler
        .send_expect_reply(
            remote,
            MsgBody::ChannelClose(ChannelClosePayload {
                channel_id: id,
                cooperative: true,
                settlement_tx: tx::tx_to_hex(&initiation.settlement),
                signature: hex::encode(initiation.signature.serialize_der()),
                close_tx_id: None,
            }),
        )
        .await
        .map_err(ApiError::from)?;

    match reply.map(|envelope| envelope.body) {
        Some(MsgBody::ChannelClose(echo)) => {
            let close_txid = echo
                .close_tx_id
                .as_deref()
                .and_then(|txid| txid.parse().ok())
                .ok_or_else(|| {
                    ApiError::unavailable(
                        "bad-close-echo",
                        "peer close echo carried no txid",
                    )
                })?;
            let channel = state.manager.finalize_close(id, close_txid).await?;
            Ok(Json(json!({
                "ok": true,
                "closeTxId": close_txid.to_string(),
                "channel": channel,
            })))
        }
        Some(MsgBody::ChannelReject(reject)) => Ok(Json(json!({
            "ok": false,
            "remoteError": {
                "kind": "close-rejected",
                "reason": reject.reason,
            },
        }))),
        // The channel stays closing until the peer's echo arrives.
        _ => Ok(Json(json!({ "ok": true, "finalized": false }))),
    }
}

// --- POST /wallet/send --- //

#[derive(Deserialize)]
pub(super) struct WalletSendRequest {
    address: String,
    satoshis: u64,
}

pub(super) async fn wallet_send(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<WalletSendRequest>,
) -> ApiResult {
    let address = bitcoin::Address::from_str(&req.address)
        .map_err(|_| {
            ApiError::bad_request("bad-address", "address did not parse")
        })?
        .assume_checked();

    let utxos = state.chain.utxos.get_utxos().await?;
    let mut spend = tx::build_spend_tx(
        utxos,
        address.script_pubkey(),
        req.satoshis,
        state.config.fee_rate_sat_per_byte,
        &state.payment_keypair.public_key(),
    )?;
    tx::sign_p2pkh_inputs(&mut spend.tx, &spend.selected, &state.payment_keypair)?;

    let raw = serialize(&spend.tx);
    let txid = state.chain.broadcaster.broadcast(&raw).await?;
    Ok(Json(json!({ "ok": true, "txid": txid.to_string() })))
}

// --- GET /discover --- //

pub(super) async fn discover(
    State(state): State<Arc<NodeState>>,
) -> ApiResult {
    Ok(Json(json!({ "peers": state.directory.list() })))
}

// --- Helpers --- //

/// Resolve a peer argument: a bare peer id, or a multiaddr to dial first.
async fn resolve_peer(
    state: &NodeState,
    peer_or_addr: &str,
) -> Result<PeerId, ApiError> {
    if peer_or_addr.starts_with('/') {
        let addr: Multiaddr = peer_or_addr.parse().map_err(|_| {
            ApiError::bad_request("bad-multiaddr", "address did not parse")
        })?;
        let peer =
            satchel_net::swarm::peer_id_of(&addr).ok_or_else(|| {
                ApiError::bad_request(
                    "bad-multiaddr",
                    "address is missing a /p2p/<peer> component",
                )
            })?;
        state.swarm.dial(addr).await.map_err(ApiError::from)?;
        Ok(peer)
    } else {
        peer_or_addr.parse().map_err(|_| {
            ApiError::bad_request("bad-peer-id", "peer id did not parse")
        })
    }
}

fn parse_channel_id(s: &str) -> Result<ChannelId, ApiError> {
    ChannelId::from_str(s).map_err(|_| {
        ApiError::bad_request("bad-channel-id", "channel id did not parse")
    })
}

fn remote_peer(peer_id: &str) -> Result<PeerId, ApiError> {
    peer_id.parse().map_err(|_| {
        ApiError::internal(
            "corrupt-channel",
            "stored remote peer id did not parse",
        )
    })
}
