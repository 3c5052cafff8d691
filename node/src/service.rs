//! The inbound message subscriber: routes channel control messages into
//! the channel manager and answers them on the same stream.
//!
//! Wiring is strictly one-way. The handler dispatches inbound messages
//! here through the subscriber registration; everything this service
//! sends back travels as the stream's reply, so it never needs a handle
//! to the message handler itself.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bitcoin::{consensus::encode::serialize, Txid};
use common::config::AutoAcceptPolicy;
use libp2p::PeerId;
use satchel_chain::{keys, tx, TxBroadcaster};
use satchel_channel::{ChannelError, ChannelManager};
use satchel_net::handler::{InboundSubscriber, SubscriberAction};
use satchel_wire::{
    envelope::{
        ChannelAcceptPayload, ChannelClosePayload, ChannelOpenPayload,
        ChannelRejectPayload, ChannelUpdatePayload, PaidRequestPayload,
        PaymentAckPayload, PaymentPayload, RequestPayload, ResponsePayload,
    },
    ChannelId, Envelope, MsgBody, MsgId,
};
use tracing::{debug, info, warn};

pub struct NodeService {
    manager: Arc<ChannelManager>,
    broadcaster: Arc<dyn TxBroadcaster>,
    auto_accept: AutoAcceptPolicy,
}

impl NodeService {
    pub fn new(
        manager: Arc<ChannelManager>,
        broadcaster: Arc<dyn TxBroadcaster>,
        auto_accept: AutoAcceptPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            broadcaster,
            auto_accept,
        })
    }

    async fn on_channel_open(
        &self,
        from: PeerId,
        open: &ChannelOpenPayload,
    ) -> SubscriberAction {
        if !self.auto_accept.accepts(open.capacity) {
            info!(
                channel_id = %open.channel_id,
                capacity = open.capacity,
                "Rejecting channel open: requires manual acceptance"
            );
            return reject(open.channel_id, "manual-accept-required");
        }

        let initiator_pubkey = match keys::parse_pubkey_hex(&open.pub_key) {
            Ok(pubkey) => pubkey,
            Err(_) => return reject(open.channel_id, "bad-public-key"),
        };

        let accepted = self
            .manager
            .accept(
                open.channel_id,
                &from.to_string(),
                initiator_pubkey,
                open.capacity,
                open.n_lock_time,
            )
            .await;
        match accepted {
            Ok(_) => (),
            Err(e) => return reject_err(open.channel_id, &e),
        }
        // Simplified flow: the responder opens right after accepting.
        if let Err(e) = self.manager.open(open.channel_id).await {
            return reject_err(open.channel_id, &e);
        }

        SubscriberAction::Reply(MsgBody::ChannelAccept(ChannelAcceptPayload {
            channel_id: open.channel_id,
            pub_key: hex::encode(self.manager.local_pubkey().serialize()),
            n_lock_time: open.n_lock_time,
        }))
    }

    async fn on_channel_accept(
        &self,
        from: PeerId,
        accept: &ChannelAcceptPayload,
    ) -> SubscriberAction {
        let responder_pubkey = match keys::parse_pubkey_hex(&accept.pub_key) {
            Ok(pubkey) => pubkey,
            Err(_) => {
                warn!(channel_id = %accept.channel_id, "Accept carried a bad public key");
                return SubscriberAction::Consumed;
            }
        };
        match self
            .manager
            .confirm_accept(accept.channel_id, responder_pubkey)
            .await
        {
            Ok(channel) => {
                info!(channel_id = %channel.id, %from, "Channel accepted by peer");
            }
            Err(e) => {
                warn!(channel_id = %accept.channel_id, "Ignoring accept: {e}");
            }
        }
        SubscriberAction::Consumed
    }

    async fn on_channel_update(
        &self,
        from: PeerId,
        message_id: MsgId,
        update: &ChannelUpdatePayload,
    ) -> SubscriberAction {
        match self
            .manager
            .process_payment(&from.to_string(), update)
            .await
        {
            Ok(record) => {
                info!(
                    channel_id = %update.channel_id,
                    amount = record.amount,
                    sequence = record.new_sequence_number,
                    "Payment received"
                );
                SubscriberAction::Reply(MsgBody::PaymentAck(
                    PaymentAckPayload {
                        payment_id: message_id,
                    },
                ))
            }
            Err(e) => {
                warn!(channel_id = %update.channel_id, "Rejecting payment: {e}");
                reject_err(update.channel_id, &e)
            }
        }
    }

    async fn on_channel_close(
        &self,
        from: PeerId,
        close: &ChannelClosePayload,
    ) -> SubscriberAction {
        if !close.cooperative {
            // No unilateral close protocol exists; park the channel.
            warn!(channel_id = %close.channel_id, "Non-cooperative close requested");
            let _ = self.manager.mark_disputed(close.channel_id).await;
            return SubscriberAction::Consumed;
        }

        let counter = match self
            .manager
            .counter_sign_close(
                &from.to_string(),
                close.channel_id,
                &close.settlement_tx,
                &close.signature,
            )
            .await
        {
            Ok(counter) => counter,
            Err(e) => return reject_err(close.channel_id, &e),
        };

        let raw = serialize(&counter.settlement);
        let close_txid = match self.broadcaster.broadcast(&raw).await {
            Ok(txid) => txid,
            Err(e) => {
                warn!(channel_id = %close.channel_id, "Settlement broadcast failed: {e:#}");
                return reject(close.channel_id, "broadcast-failed");
            }
        };

        if let Err(e) = self
            .manager
            .finalize_close(close.channel_id, close_txid)
            .await
        {
            return reject_err(close.channel_id, &e);
        }

        SubscriberAction::Reply(MsgBody::ChannelClose(ChannelClosePayload {
            channel_id: close.channel_id,
            cooperative: true,
            settlement_tx: tx::tx_to_hex(&counter.settlement),
            signature: hex::encode(counter.signature.serialize_der()),
            close_tx_id: Some(close_txid.to_string()),
        }))
    }

    async fn on_payment(
        &self,
        from: PeerId,
        message_id: MsgId,
        payment: &PaymentPayload,
    ) -> SubscriberAction {
        debug!(
            %from,
            txid = %payment.txid,
            satoshis = payment.satoshis,
            "On-chain payment notification"
        );

        // A funding notification carries the channel id in its memo.
        if let Some(channel_id) = payment
            .memo
            .as_deref()
            .and_then(|memo| memo.strip_prefix("channel:"))
            .and_then(|id| ChannelId::from_str(id).ok())
        {
            match Txid::from_str(&payment.txid) {
                Ok(txid) => {
                    // In the simplified flow the channel may already be
                    // open, in which case the outpoint is not recorded.
                    if let Err(e) = self
                        .manager
                        .set_funding(channel_id, txid, payment.vout)
                        .await
                    {
                        debug!(%channel_id, "Funding notification not recorded: {e}");
                    }
                }
                Err(_) => {
                    warn!(%from, "Funding notification carried a bad txid");
                }
            }
        }

        SubscriberAction::Reply(MsgBody::PaymentAck(PaymentAckPayload {
            payment_id: message_id,
        }))
    }

    async fn on_paid_request(
        &self,
        from: PeerId,
        message_id: MsgId,
        request: &PaidRequestPayload,
    ) -> SubscriberAction {
        let payment_result = self
            .manager
            .process_payment(&from.to_string(), &request.payment)
            .await;

        let reply = match payment_result {
            Ok(record) => {
                info!(
                    channel_id = %request.payment.channel_id,
                    amount = record.amount,
                    service = %request.service,
                    "Paid request"
                );
                // Payment accepted; no service registry is wired up, so
                // the application result is an error either way.
                satchel_wire::envelope::PaidResultPayload {
                    request_id: message_id,
                    payment_accepted: true,
                    result: serde_json::Value::Null,
                    error: Some("unknown-service".to_owned()),
                }
            }
            Err(e) => {
                warn!(
                    channel_id = %request.payment.channel_id,
                    "Rejecting paid request: {e}"
                );
                satchel_wire::envelope::PaidResultPayload {
                    request_id: message_id,
                    payment_accepted: false,
                    result: serde_json::Value::Null,
                    error: Some(e.kind().to_owned()),
                }
            }
        };
        SubscriberAction::Reply(MsgBody::PaidResult(reply))
    }

    fn on_request(
        &self,
        message_id: MsgId,
        request: &RequestPayload,
    ) -> SubscriberAction {
        debug!(service = %request.service, "Unhandled service request");
        SubscriberAction::Reply(MsgBody::Response(ResponsePayload {
            request_id: message_id,
            result: serde_json::Value::Null,
            error: Some("unknown-service".to_owned()),
        }))
    }
}

#[async_trait]
impl InboundSubscriber for NodeService {
    async fn on_message(
        &self,
        from: PeerId,
        envelope: &Envelope,
    ) -> SubscriberAction {
        match &envelope.body {
            MsgBody::ChannelOpen(open) =>
                self.on_channel_open(from, open).await,
            MsgBody::ChannelAccept(accept) =>
                self.on_channel_accept(from, accept).await,
            MsgBody::ChannelReject(reject) => {
                warn!(
                    channel_id = %reject.channel_id,
                    reason = %reject.reason,
                    "Peer rejected channel operation"
                );
                SubscriberAction::Consumed
            }
            MsgBody::ChannelUpdate(update) =>
                self.on_channel_update(from, envelope.id, update).await,
            MsgBody::ChannelClose(close) =>
                self.on_channel_close(from, close).await,
            MsgBody::Payment(payment) =>
                self.on_payment(from, envelope.id, payment).await,
            MsgBody::PaidRequest(request) =>
                self.on_paid_request(from, envelope.id, request).await,
            MsgBody::Request(request) =>
                self.on_request(envelope.id, request),
            MsgBody::Text(text) => {
                info!(%from, "Message: {}", text.content);
                SubscriberAction::Consumed
            }
            // Correlated replies are resolved by the handler before
            // dispatch reaches us.
            MsgBody::Response(_)
            | MsgBody::PaidResult(_)
            | MsgBody::PaymentAck(_) => SubscriberAction::Ignored,
        }
    }
}

fn reject(channel_id: ChannelId, reason: &str) -> SubscriberAction {
    SubscriberAction::Reply(MsgBody::ChannelReject(ChannelRejectPayload {
        channel_id,
        reason: reason.to_owned(),
    }))
}

fn reject_err(channel_id: ChannelId, error: &ChannelError) -> SubscriberAction {
    reject(channel_id, error.kind())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use satchel_chain::PaymentKeypair;
    use satchel_channel::{
        persister::NoopPersister, ChannelManagerConfig, ChannelState,
    };

    use super::*;

    struct FakeBroadcaster;

    #[async_trait]
    impl TxBroadcaster for FakeBroadcaster {
        async fn broadcast(&self, raw_tx: &[u8]) -> anyhow::Result<Txid> {
            let tx: bitcoin::Transaction =
                bitcoin::consensus::encode::deserialize(raw_tx)?;
            Ok(tx.compute_txid())
        }
    }

    fn manager(peer: &str, secret_byte: u8) -> Arc<ChannelManager> {
        Arc::new(ChannelManager::new(
            ChannelManagerConfig {
                min_capacity: 1_000,
                max_capacity: 1_000_000,
                commitment_fee_sats: 500,
            },
            peer.to_owned(),
            PaymentKeypair::from_secret_bytes(&[secret_byte; 32]).unwrap(),
            Arc::new(NoopPersister),
        ))
    }

    fn envelope(from: &PeerId, body: MsgBody) -> Envelope {
        Envelope::new(from.to_string(), "local".to_owned(), body)
    }

    #[tokio::test]
    async fn open_auto_accepted_below_threshold() {
        let initiator = PeerId::random();
        let initiator_key =
            PaymentKeypair::from_secret_bytes(&[9; 32]).unwrap();
        let manager = manager("responder", 2);
        let service = NodeService::new(
            manager.clone(),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::Below(50_000),
        );

        let channel_id = ChannelId::generate();
        let open = envelope(
            &initiator,
            MsgBody::ChannelOpen(ChannelOpenPayload {
                channel_id,
                pub_key: initiator_key.public_key_hex(),
                capacity: 10_000,
                n_lock_time: 1_800_000_000,
            }),
        );

        let action = service.on_message(initiator, &open).await;
        match action {
            SubscriberAction::Reply(MsgBody::ChannelAccept(accept)) => {
                assert_eq!(accept.channel_id, channel_id);
                assert_eq!(accept.n_lock_time, 1_800_000_000);
            }
            _ => panic!("expected a channel_accept reply"),
        }

        let channel = manager.get(channel_id).await.unwrap();
        assert_eq!(channel.state, ChannelState::Open);
        assert_eq!(channel.remote_balance, 10_000);
        assert_eq!(channel.local_balance, 0);
    }

    #[tokio::test]
    async fn open_rejected_above_threshold() {
        let initiator = PeerId::random();
        let initiator_key =
            PaymentKeypair::from_secret_bytes(&[9; 32]).unwrap();
        let service = NodeService::new(
            manager("responder", 2),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::Below(5_000),
        );

        let open = envelope(
            &initiator,
            MsgBody::ChannelOpen(ChannelOpenPayload {
                channel_id: ChannelId::generate(),
                pub_key: initiator_key.public_key_hex(),
                capacity: 10_000,
                n_lock_time: 1_800_000_000,
            }),
        );

        match service.on_message(initiator, &open).await {
            SubscriberAction::Reply(MsgBody::ChannelReject(reject)) => {
                assert_eq!(reject.reason, "manual-accept-required");
            }
            _ => panic!("expected a channel_reject reply"),
        }
    }

    /// Drive a full open + pay + close exchange through two services, the
    /// way the wire would.
    #[tokio::test]
    async fn end_to_end_exchange_through_services() {
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();

        let manager_a = manager(&peer_a.to_string(), 1);
        let manager_b = manager(&peer_b.to_string(), 2);

        let service_a = NodeService::new(
            manager_a.clone(),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::All,
        );
        let service_b = NodeService::new(
            manager_b.clone(),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::All,
        );

        // A creates and proposes; B accepts on-stream; A confirms.
        let channel = manager_a
            .create(
                &peer_b.to_string(),
                manager_b.local_pubkey(),
                10_000,
                Duration::from_secs(86_400),
            )
            .await
            .unwrap();

        let open = envelope(
            &peer_a,
            MsgBody::ChannelOpen(ChannelOpenPayload {
                channel_id: channel.id,
                pub_key: hex::encode(manager_a.local_pubkey().serialize()),
                capacity: channel.capacity,
                n_lock_time: channel.n_lock_time,
            }),
        );
        let accept_body = match service_b.on_message(peer_a, &open).await {
            SubscriberAction::Reply(body) => body,
            _ => panic!("expected accept"),
        };
        let accept = envelope(&peer_b, accept_body);
        service_a.on_message(peer_b, &accept).await;

        assert_eq!(
            manager_a.get(channel.id).await.unwrap().state,
            ChannelState::Open
        );

        // A pays B 300.
        let payment = manager_a.create_payment(channel.id, 300).await.unwrap();
        let update = envelope(
            &peer_a,
            MsgBody::ChannelUpdate(payment.payload.clone()),
        );
        match service_b.on_message(peer_a, &update).await {
            SubscriberAction::Reply(MsgBody::PaymentAck(ack)) => {
                assert_eq!(ack.payment_id, update.id);
            }
            _ => panic!("expected payment_ack"),
        }
        assert_eq!(
            manager_b.get(channel.id).await.unwrap().local_balance,
            300
        );

        // A closes; B counter-signs, broadcasts, and echoes the txid.
        let initiation = manager_a.close(channel.id).await.unwrap();
        let close = envelope(
            &peer_a,
            MsgBody::ChannelClose(ChannelClosePayload {
                channel_id: channel.id,
                cooperative: true,
                settlement_tx: tx::tx_to_hex(&initiation.settlement),
                signature: hex::encode(
                    initiation.signature.serialize_der(),
                ),
                close_tx_id: None,
            }),
        );
        let close_txid = match service_b.on_message(peer_a, &close).await {
            SubscriberAction::Reply(MsgBody::ChannelClose(echo)) => {
                assert!(echo.cooperative);
                echo.close_tx_id.unwrap()
            }
            _ => panic!("expected close echo"),
        };

        manager_a
            .finalize_close(channel.id, close_txid.parse().unwrap())
            .await
            .unwrap();

        assert_eq!(
            manager_a.get(channel.id).await.unwrap().state,
            ChannelState::Closed
        );
        assert_eq!(
            manager_b.get(channel.id).await.unwrap().state,
            ChannelState::Closed
        );
    }

    #[tokio::test]
    async fn stale_update_gets_reject_reply() {
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();
        let manager_a = manager(&peer_a.to_string(), 1);
        let manager_b = manager(&peer_b.to_string(), 2);
        let service_b = NodeService::new(
            manager_b.clone(),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::All,
        );

        let channel = manager_a
            .create(
                &peer_b.to_string(),
                manager_b.local_pubkey(),
                10_000,
                Duration::from_secs(86_400),
            )
            .await
            .unwrap();
        manager_b
            .accept(
                channel.id,
                &peer_a.to_string(),
                manager_a.local_pubkey(),
                10_000,
                channel.n_lock_time,
            )
            .await
            .unwrap();
        manager_b.open(channel.id).await.unwrap();
        manager_a.confirm_accept(channel.id, manager_b.local_pubkey())
            .await
            .unwrap();

        let mut payment =
            manager_a.create_payment(channel.id, 300).await.unwrap();
        payment.payload.new_sequence_number = 0;
        let update =
            envelope(&peer_a, MsgBody::ChannelUpdate(payment.payload));

        match service_b.on_message(peer_a, &update).await {
            SubscriberAction::Reply(MsgBody::ChannelReject(reject)) => {
                assert_eq!(reject.reason, "stale-sequence");
            }
            _ => panic!("expected reject"),
        }
    }

    #[tokio::test]
    async fn unknown_request_gets_error_response() {
        let peer = PeerId::random();
        let service = NodeService::new(
            manager("responder", 2),
            Arc::new(FakeBroadcaster),
            AutoAcceptPolicy::Manual,
        );

        let request = envelope(
            &peer,
            MsgBody::Request(RequestPayload {
                service: "weather".to_owned(),
                params: serde_json::json!({}),
            }),
        );
        match service.on_message(peer, &request).await {
            SubscriberAction::Reply(MsgBody::Response(response)) => {
                assert_eq!(response.request_id, request.id);
                assert_eq!(response.error.as_deref(), Some("unknown-service"));
            }
            _ => panic!("expected response"),
        }
    }
}
