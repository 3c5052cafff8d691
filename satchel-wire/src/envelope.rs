//! Typed message envelopes.
//!
//! Every message shares a header (`id`, `type`, `from`, `to`, `timestamp`)
//! and carries a type-specific `payload`. The serialized field names are
//! part of the wire contract and must not change.

use std::{fmt, str::FromStr};

use common::{id, time::TimestampMs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A unique message identifier, assigned by the sender: 16 bytes of
/// entropy, hex-encoded on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MsgId([u8; 16]);

/// A channel identifier, unique per creating node. Same representation as
/// [`MsgId`] but the two are never interchangeable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId([u8; 16]);

#[derive(Debug, Error)]
#[error("Invalid id: expected 32 hex chars")]
pub struct InvalidId;

macro_rules! hex_id_impls {
    ($name:ident) => {
        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(id::random_array())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidId)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                // Owned: also decodable from non-borrowing formats like
                // `serde_json::Value`.
                let s = String::deserialize(deserializer)?;
                Self::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id_impls!(MsgId);
hex_id_impls!(ChannelId);

/// A complete wire message: the shared header plus a typed body.
///
/// `from` and `to` are text-encoded peer ids; the message handler verifies
/// `from` against the transport-authenticated remote identity on receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MsgId,
    pub from: String,
    pub to: String,
    pub timestamp: TimestampMs,
    #[serde(flatten)]
    pub body: MsgBody,
}

impl Envelope {
    /// Construct an envelope with a fresh id and the current timestamp.
    pub fn new(from: String, to: String, body: MsgBody) -> Self {
        Self {
            id: MsgId::generate(),
            from,
            to,
            timestamp: TimestampMs::now(),
            body,
        }
    }

    /// The discriminator string of this envelope's body, e.g. `"payment"`.
    pub fn type_str(&self) -> &'static str {
        self.body.type_str()
    }
}

/// The typed body of an envelope. Serializes as the `type` discriminator
/// plus the `payload` content of the header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MsgBody {
    Text(TextPayload),
    Request(RequestPayload),
    Response(ResponsePayload),
    Payment(PaymentPayload),
    PaymentAck(PaymentAckPayload),
    ChannelOpen(ChannelOpenPayload),
    ChannelAccept(ChannelAcceptPayload),
    ChannelReject(ChannelRejectPayload),
    ChannelUpdate(ChannelUpdatePayload),
    ChannelClose(ChannelClosePayload),
    PaidRequest(PaidRequestPayload),
    PaidResult(PaidResultPayload),
}

impl MsgBody {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Payment(_) => "payment",
            Self::PaymentAck(_) => "payment_ack",
            Self::ChannelOpen(_) => "channel_open",
            Self::ChannelAccept(_) => "channel_accept",
            Self::ChannelReject(_) => "channel_reject",
            Self::ChannelUpdate(_) => "channel_update",
            Self::ChannelClose(_) => "channel_close",
            Self::PaidRequest(_) => "paid_request",
            Self::PaidResult(_) => "paid_result",
        }
    }

    /// Whether this message participates in the channel control plane.
    pub fn is_channel_message(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpen(_)
                | Self::ChannelAccept(_)
                | Self::ChannelReject(_)
                | Self::ChannelUpdate(_)
                | Self::ChannelClose(_)
        )
    }
}

/// Fire-and-forget content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub content: String,
}

/// A service request awaiting a correlated [`ResponsePayload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub service: String,
    pub params: serde_json::Value,
}

/// The response to a [`RequestPayload`], correlated by the original
/// message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: MsgId,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notification of an on-chain payment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    pub address: String,
    /// Raw transaction hex, when the recipient should be able to verify
    /// and index the payment without a chain lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_tx: Option<String>,
    /// Merkle proof bytes for the transaction, hex-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Acknowledgement referencing the original payment message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAckPayload {
    pub payment_id: MsgId,
}

/// Channel negotiation: the initiator's open proposal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOpenPayload {
    pub channel_id: ChannelId,
    /// The initiator's payment-system public key, compressed hex.
    pub pub_key: String,
    pub capacity: u64,
    /// Absolute chain-level time in seconds after which the funding output
    /// becomes unilaterally spendable by the latest commitment.
    #[serde(rename = "nLockTime")]
    pub n_lock_time: u64,
}

/// Channel negotiation: the responder's acceptance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAcceptPayload {
    pub channel_id: ChannelId,
    /// The responder's payment-system public key, compressed hex.
    pub pub_key: String,
    #[serde(rename = "nLockTime")]
    pub n_lock_time: u64,
}

/// Channel negotiation or payment update rejection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRejectPayload {
    pub channel_id: ChannelId,
    pub reason: String,
}

/// An off-chain commitment update. Balances are expressed from the
/// *sender's* perspective; the receiver swaps them when applying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdatePayload {
    pub channel_id: ChannelId,
    pub amount: u64,
    pub new_sequence_number: u64,
    pub new_local_balance: u64,
    pub new_remote_balance: u64,
    /// DER-encoded ECDSA signature over the new commitment transaction,
    /// hex-encoded. Mandatory.
    pub signature: String,
    pub timestamp: TimestampMs,
}

/// Cooperative settlement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelClosePayload {
    pub channel_id: ChannelId,
    pub cooperative: bool,
    /// The settlement transaction, raw hex. Partially signed when sent by
    /// the close initiator; fully signed when echoed back.
    pub settlement_tx: String,
    /// DER-encoded ECDSA signature of the sender over the settlement
    /// transaction, hex-encoded.
    pub signature: String,
    /// Set once the settlement transaction has been broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_tx_id: Option<String>,
}

/// A service request bundled with an in-channel payment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidRequestPayload {
    pub service: String,
    pub params: serde_json::Value,
    pub payment: ChannelUpdatePayload,
}

/// The response to a [`PaidRequestPayload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidResultPayload {
    pub request_id: MsgId,
    pub payment_accepted: bool,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(any(test, feature = "test-utils"))]
pub mod strategies {
    //! Proptest strategies for wire types.

    use proptest::{
        arbitrary::any,
        prop_oneof,
        strategy::{Just, Strategy},
    };

    use super::*;

    pub fn any_msg_id() -> impl Strategy<Value = MsgId> {
        any::<[u8; 16]>().prop_map(MsgId::from_bytes)
    }

    pub fn any_channel_id() -> impl Strategy<Value = ChannelId> {
        any::<[u8; 16]>().prop_map(ChannelId::from_bytes)
    }

    fn any_timestamp() -> impl Strategy<Value = TimestampMs> {
        // Serde roundtrips through i64 millis; any non-negative value works.
        (0..i64::MAX).prop_map(|ms| {
            serde_json::from_value(serde_json::json!(ms)).unwrap()
        })
    }

    fn any_update() -> impl Strategy<Value = ChannelUpdatePayload> {
        (
            any_channel_id(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            any::<u64>(),
            "[0-9a-f]{140}",
            any_timestamp(),
        )
            .prop_map(
                |(
                    channel_id,
                    amount,
                    new_sequence_number,
                    new_local_balance,
                    new_remote_balance,
                    signature,
                    timestamp,
                )| ChannelUpdatePayload {
                    channel_id,
                    amount,
                    new_sequence_number,
                    new_local_balance,
                    new_remote_balance,
                    signature,
                    timestamp,
                },
            )
    }

    pub fn any_body() -> impl Strategy<Value = MsgBody> {
        prop_oneof![
            ".*".prop_map(|content| MsgBody::Text(TextPayload { content })),
            (".*", Just(serde_json::json!({ "n": 1 }))).prop_map(
                |(service, params)| MsgBody::Request(RequestPayload {
                    service,
                    params
                })
            ),
            (any_msg_id(), proptest::option::of(".*")).prop_map(
                |(request_id, error)| MsgBody::Response(ResponsePayload {
                    request_id,
                    result: serde_json::json!("ok"),
                    error,
                })
            ),
            any_msg_id().prop_map(|payment_id| MsgBody::PaymentAck(
                PaymentAckPayload { payment_id }
            )),
            (any_channel_id(), "[0-9a-f]{66}", any::<u64>(), any::<u64>())
                .prop_map(|(channel_id, pub_key, capacity, n_lock_time)| {
                    MsgBody::ChannelOpen(ChannelOpenPayload {
                        channel_id,
                        pub_key,
                        capacity,
                        n_lock_time,
                    })
                }),
            any_update().prop_map(MsgBody::ChannelUpdate),
        ]
    }

    pub fn any_envelope() -> impl Strategy<Value = Envelope> {
        (any_msg_id(), ".*", ".*", any_timestamp(), any_body()).prop_map(
            |(id, from, to, timestamp, body)| Envelope {
                id,
                from,
                to,
                timestamp,
                body,
            },
        )
    }
}

#[cfg(test)]
mod test {
    use common::test_utils::roundtrip;
    use proptest::test_runner::Config;

    use super::*;

    #[test]
    fn envelope_json_roundtrip() {
        roundtrip::json_value_custom(
            strategies::any_envelope(),
            Config::default(),
        );
    }

    #[test]
    fn discriminators_match_wire_contract() {
        let update = MsgBody::ChannelUpdate(ChannelUpdatePayload {
            channel_id: ChannelId::from_bytes([7; 16]),
            amount: 300,
            new_sequence_number: 1,
            new_local_balance: 9_700,
            new_remote_balance: 300,
            signature: "aa".to_owned(),
            timestamp: TimestampMs::now(),
        });
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["type"], "channel_update");
        // Wire field names are camelCase per the envelope contract.
        assert_eq!(value["payload"]["newSequenceNumber"], 1);
        assert_eq!(value["payload"]["newLocalBalance"], 9_700);
        assert_eq!(value["payload"]["newRemoteBalance"], 300);
        assert_eq!(value["payload"]["channelId"], "07".repeat(16));
    }

    #[test]
    fn open_payload_uses_nlocktime_name() {
        let open = MsgBody::ChannelOpen(ChannelOpenPayload {
            channel_id: ChannelId::from_bytes([1; 16]),
            pub_key: "02aa".to_owned(),
            capacity: 10_000,
            n_lock_time: 1_700_000_000,
        });
        let value = serde_json::to_value(&open).unwrap();
        assert_eq!(value["payload"]["nLockTime"], 1_700_000_000u64);
    }

    #[test]
    fn msg_id_display_fromstr() {
        let id = MsgId::generate();
        let parsed = id.to_string().parse::<MsgId>().unwrap();
        assert_eq!(id, parsed);
        assert!("nothex".parse::<MsgId>().is_err());
        assert!("aabb".parse::<MsgId>().is_err());
    }
}
