use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use satchel_channel::ChannelError;
use satchel_net::NetError;
use serde_json::json;
use tracing::{error, warn};

/// A control-plane error: an HTTP status, a stable kind string, and a
/// human-readable message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: String,
    pub msg: String,
}

impl ApiError {
    pub fn bad_request(kind: &str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: kind.to_owned(),
            msg: msg.into(),
        }
    }

    pub fn not_found(kind: &str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: kind.to_owned(),
            msg: msg.into(),
        }
    }

    pub fn internal(kind: &str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: kind.to_owned(),
            msg: msg.into(),
        }
    }

    pub fn unavailable(kind: &str, msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind: kind.to_owned(),
            msg: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{}: {}", self.kind, self.msg);
        } else {
            warn!("{}: {}", self.kind, self.msg);
        }
        let body = Json(json!({
            "error": { "kind": self.kind, "msg": self.msg }
        }));
        (self.status, body).into_response()
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        let status = match &e {
            ChannelError::UnknownChannel(_) => StatusCode::NOT_FOUND,
            ChannelError::IdReused(_) => StatusCode::CONFLICT,
            ChannelError::Tx(_) | ChannelError::Persist(_) =>
                StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            kind: e.kind().to_owned(),
            msg: format!("{e}"),
        }
    }
}

impl From<NetError> for ApiError {
    fn from(e: NetError) -> Self {
        let status = match &e {
            NetError::MissingPeerId | NetError::OversizeMessage { .. } =>
                StatusCode::BAD_REQUEST,
            NetError::Timeout | NetError::SendTimeout =>
                StatusCode::GATEWAY_TIMEOUT,
            NetError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            kind: e.kind().to_owned(),
            msg: format!("{e}"),
        }
    }
}

impl From<satchel_chain::tx::TxError> for ApiError {
    fn from(e: satchel_chain::tx::TxError) -> Self {
        use satchel_chain::tx::TxError;
        let (status, kind) = match &e {
            TxError::InsufficientFunds { .. } =>
                (StatusCode::BAD_REQUEST, "insufficient-funds"),
            TxError::MalformedTx =>
                (StatusCode::BAD_REQUEST, "malformed-tx"),
            TxError::NothingAboveDust =>
                (StatusCode::BAD_REQUEST, "nothing-above-dust"),
            TxError::SequenceExhausted { .. }
            | TxError::LockTimeOutOfRange { .. } =>
                (StatusCode::INTERNAL_SERVER_ERROR, "tx-construction"),
        };
        Self {
            status,
            kind: kind.to_owned(),
            msg: format!("{e}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        // Chain collaborators prefix their error strings with a stable
        // kind; surface it when present.
        let msg = format!("{e:#}");
        let kind = msg
            .split(':')
            .next()
            .filter(|prefix| prefix.contains('-'))
            .unwrap_or("internal")
            .to_owned();
        Self {
            status: StatusCode::BAD_GATEWAY,
            kind,
            msg,
        }
    }
}
