//! The message handler: encodes, frames, transports and correlates typed
//! messages over the messaging protocol.
//!
//! Correlation state is transient: an entry exists only while a request
//! is in flight, and is removed on completion, cancellation, or timeout.
//! A response arriving after its entry is gone is discarded silently.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use libp2p::PeerId;
use satchel_tokio::{notify_once::NotifyOnce, task::SatTask};
use satchel_wire::{
    envelope::{RequestPayload, ResponsePayload},
    Envelope, MsgBody, MsgId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::NetError,
    swarm::{InboundEnvelope, SwarmHandle},
};

/// The slice of the transport the handler needs. Production uses
/// [`SwarmHandle`]; tests inject a fake.
#[async_trait]
pub trait EnvelopeTransport: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Send one framed envelope on a fresh stream; returns the framed
    /// same-stream reply if the responder wrote one.
    async fn send_envelope(
        &self,
        to: PeerId,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, NetError>;
}

#[async_trait]
impl EnvelopeTransport for SwarmHandle {
    fn local_peer_id(&self) -> PeerId {
        SwarmHandle::local_peer_id(self)
    }

    async fn send_envelope(
        &self,
        to: PeerId,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, NetError> {
        SwarmHandle::send_envelope(self, to, bytes).await
    }
}

/// Which of the sink's two endpoints a notification targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NotifyKind {
    /// A one-shot advisory.
    Wake,
    /// Starts a dedicated agent conversation turn.
    Agent,
}

/// The out-of-band notification sink. One notification per accepted
/// inbound message; best-effort, failures logged and ignored.
#[async_trait]
pub trait AgentNotifier: Send + Sync {
    async fn notify(&self, kind: NotifyKind, summary: String);
}

/// Discards all notifications.
pub struct NoopNotifier;

#[async_trait]
impl AgentNotifier for NoopNotifier {
    async fn notify(&self, _kind: NotifyKind, _summary: String) {}
}

/// What a subscriber did with an inbound message.
pub enum SubscriberAction {
    /// Not interested; offer the message to the next subscriber.
    Ignored,
    /// Handled; no same-stream reply.
    Consumed,
    /// Handled; write this reply back on the stream.
    Reply(MsgBody),
}

/// A registered consumer of inbound messages, dispatched by type in
/// registration order until one consumes the message.
#[async_trait]
pub trait InboundSubscriber: Send + Sync {
    async fn on_message(
        &self,
        from: PeerId,
        envelope: &Envelope,
    ) -> SubscriberAction;
}

type PendingMap = HashMap<MsgId, oneshot::Sender<Envelope>>;

pub struct MessageHandler {
    transport: Arc<dyn EnvelopeTransport>,
    notifier: Arc<dyn AgentNotifier>,
    subscribers: std::sync::Mutex<Vec<Arc<dyn InboundSubscriber>>>,
    pending: Arc<std::sync::Mutex<PendingMap>>,
    max_message_bytes: usize,
}

/// Removes the correlation entry when the request future goes away for
/// any reason, including caller-side cancellation.
struct PendingGuard {
    pending: Arc<std::sync::Mutex<PendingMap>>,
    id: MsgId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.id);
    }
}

impl MessageHandler {
    pub fn new(
        transport: Arc<dyn EnvelopeTransport>,
        notifier: Arc<dyn AgentNotifier>,
        max_message_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            notifier,
            subscribers: std::sync::Mutex::new(Vec::new()),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            max_message_bytes,
        })
    }

    /// Register an inbound subscriber. Call during wiring, before any
    /// messages flow.
    pub fn register_subscriber(&self, subscriber: Arc<dyn InboundSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    /// The number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Fire-and-forget send. Fails with not-connected / dial-failed /
    /// send-timeout from the transport.
    pub async fn send(
        &self,
        to: PeerId,
        body: MsgBody,
    ) -> Result<MsgId, NetError> {
        let envelope = Envelope::new(
            self.local_peer_id().to_string(),
            to.to_string(),
            body,
        );
        let bytes = self.encode(&envelope)?;
        debug!(%to, r#type = envelope.type_str(), "Sending message");

        let reply = self.transport.send_envelope(to, bytes).await?;
        if let Some(reply_bytes) = reply {
            self.handle_same_stream_reply(to, reply_bytes);
        }
        Ok(envelope.id)
    }

    /// Send a `request` and await its correlated `response`. The
    /// correlation entry is keyed by the generated envelope id and removed
    /// on completion, cancellation, or timeout.
    pub async fn request(
        &self,
        to: PeerId,
        service: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<ResponsePayload, NetError> {
        let body = MsgBody::Request(RequestPayload {
            service: service.to_owned(),
            params,
        });
        let envelope = self.await_correlated(to, body, timeout).await?;
        match envelope.body {
            MsgBody::Response(response) => Ok(response),
            other => Err(NetError::MalformedEnvelope(format!(
                "expected a response, got {}",
                other.type_str()
            ))),
        }
    }

    /// Send any correlatable message (`request`, `paid_request`,
    /// `payment`) and await the envelope that references its id.
    pub async fn await_correlated(
        &self,
        to: PeerId,
        body: MsgBody,
        timeout: Duration,
    ) -> Result<Envelope, NetError> {
        let envelope = Envelope::new(
            self.local_peer_id().to_string(),
            to.to_string(),
            body,
        );
        let id = envelope.id;
        let bytes = self.encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        debug!(%to, r#type = envelope.type_str(), %id, "Sending correlated message");

        let result = tokio::time::timeout(timeout, async {
            let reply = self.transport.send_envelope(to, bytes).await?;
            if let Some(reply_bytes) = reply {
                self.handle_same_stream_reply(to, reply_bytes);
            }
            rx.await.map_err(|_| NetError::Cancelled)
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => Err(NetError::Timeout),
        }
    }

    /// Send one envelope and hand back the decoded, authenticated
    /// same-stream reply instead of dispatching it. Used by flows where
    /// the caller interprets the reply itself (channel negotiation,
    /// payment acks, cooperative close).
    pub async fn send_expect_reply(
        &self,
        to: PeerId,
        body: MsgBody,
    ) -> Result<Option<Envelope>, NetError> {
        let envelope = Envelope::new(
            self.local_peer_id().to_string(),
            to.to_string(),
            body,
        );
        let bytes = self.encode(&envelope)?;
        debug!(%to, r#type = envelope.type_str(), "Sending message, expecting reply");

        let reply = self.transport.send_envelope(to, bytes).await?;
        let Some(reply_bytes) = reply else {
            return Ok(None);
        };
        match self.decode_authenticated(to, &reply_bytes) {
            Some(reply_envelope) => Ok(Some(reply_envelope)),
            None => Ok(None),
        }
    }

    /// Cancel a pending request. The entry is removed synchronously and a
    /// late response will be dropped without error.
    pub fn cancel(&self, id: MsgId) {
        if self.pending.lock().unwrap().remove(&id).is_some() {
            debug!(%id, "Cancelled pending request");
        }
    }

    /// Handle one inbound framed envelope. Returns the framed reply to
    /// write back on the stream, if any.
    pub async fn process_inbound(
        &self,
        remote: PeerId,
        bytes: Vec<u8>,
    ) -> Option<Vec<u8>> {
        let envelope = match serde_json::from_slice::<Envelope>(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%remote, "Dropping undecodable message: {e}");
                return None;
            }
        };

        // The `from` field must match the transport-authenticated remote
        // identity; anything else is a spoof attempt.
        match envelope.from.parse::<PeerId>() {
            Ok(claimed) if claimed == remote => (),
            _ => {
                warn!(
                    %remote,
                    claimed = %envelope.from,
                    "Rejected message: from-field-spoofed"
                );
                return None;
            }
        }

        debug!(%remote, r#type = envelope.type_str(), id = %envelope.id, "Inbound message");

        // One best-effort notification per accepted inbound message.
        // Conversational and service messages start an agent turn; the
        // rest are one-shot advisories.
        let kind = match &envelope.body {
            MsgBody::Text(_) | MsgBody::Request(_) | MsgBody::PaidRequest(_) =>
                NotifyKind::Agent,
            _ => NotifyKind::Wake,
        };
        let summary = format!(
            "{} message {} from peer {remote}",
            envelope.type_str(),
            envelope.id,
        );
        let notifier = self.notifier.clone();
        SatTask::spawn_unnamed(
            async move { notifier.notify(kind, summary).await },
        )
        .detach();

        // Correlated replies resolve the pending map and go no further.
        if self.try_resolve(&envelope) {
            return None;
        }

        let subscribers = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            match subscriber.on_message(remote, &envelope).await {
                SubscriberAction::Ignored => continue,
                SubscriberAction::Consumed => return None,
                SubscriberAction::Reply(body) => {
                    let reply = Envelope::new(
                        self.local_peer_id().to_string(),
                        envelope.from.clone(),
                        body,
                    );
                    return match self.encode(&reply) {
                        Ok(reply_bytes) => Some(reply_bytes),
                        Err(e) => {
                            warn!("Failed to encode reply: {e}");
                            None
                        }
                    };
                }
            }
        }

        warn!(
            %remote,
            r#type = envelope.type_str(),
            "No subscriber consumed message; dropping"
        );
        None
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, NetError> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| NetError::MalformedEnvelope(e.to_string()))?;
        if bytes.len() > self.max_message_bytes {
            return Err(NetError::OversizeMessage {
                len: bytes.len(),
                max: self.max_message_bytes,
            });
        }
        Ok(bytes)
    }

    /// If this envelope correlates to a pending request, resolve (or
    /// silently discard, if the requester already gave up) and report it
    /// as handled.
    fn try_resolve(&self, envelope: &Envelope) -> bool {
        let correlation_id = match &envelope.body {
            MsgBody::Response(response) => response.request_id,
            MsgBody::PaidResult(result) => result.request_id,
            MsgBody::PaymentAck(ack) => ack.payment_id,
            _ => return false,
        };

        match self.pending.lock().unwrap().remove(&correlation_id) {
            Some(waiter) => {
                let _ = waiter.send(envelope.clone());
            }
            // Late response after timeout or cancellation.
            None => debug!(
                id = %correlation_id,
                "Discarding uncorrelated reply"
            ),
        }
        true
    }

    /// Decode a same-stream reply and authenticate its `from` field.
    fn decode_authenticated(
        &self,
        from: PeerId,
        bytes: &[u8],
    ) -> Option<Envelope> {
        match serde_json::from_slice::<Envelope>(bytes) {
            Ok(envelope) => match envelope.from.parse::<PeerId>() {
                Ok(claimed) if claimed == from => Some(envelope),
                _ => {
                    warn!(%from, "Rejected reply: from-field-spoofed");
                    None
                }
            },
            Err(e) => {
                warn!(%from, "Dropping undecodable reply: {e}");
                None
            }
        }
    }

    fn handle_same_stream_reply(&self, from: PeerId, bytes: Vec<u8>) {
        let Some(envelope) = self.decode_authenticated(from, &bytes) else {
            return;
        };
        if !self.try_resolve(&envelope) {
            debug!(
                %from,
                r#type = envelope.type_str(),
                "Ignoring non-reply on response stream"
            );
        }
    }
}

/// Pump inbound envelopes from the swarm into the handler, spawning an
/// independent task per stream.
pub fn spawn_inbound_loop(
    handler: Arc<MessageHandler>,
    swarm: SwarmHandle,
    mut inbound_rx: mpsc::Receiver<InboundEnvelope>,
    shutdown: NotifyOnce,
) -> SatTask<()> {
    SatTask::spawn("message-inbound", async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                inbound = inbound_rx.recv() => match inbound {
                    Some(InboundEnvelope { peer, bytes, channel }) => {
                        let handler = handler.clone();
                        let swarm = swarm.clone();
                        SatTask::spawn_unnamed(async move {
                            let reply =
                                handler.process_inbound(peer, bytes).await;
                            let _ = swarm.respond(channel, reply).await;
                        })
                        .detach();
                    }
                    None => break,
                },
            }
        }
    })
}
