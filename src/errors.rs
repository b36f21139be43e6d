//! Error surfaces for the relay.
//!
//! Mirrors the split the teacher keeps between an internal error enum and a
//! response-facing `IntoResponse` impl: [`RelayError`] covers everything that
//! can go wrong inside the relay; its `into_response_with_id` renders the
//! JSON-RPC error envelope a client actually sees.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use derive_more::{Display, Error, From};
use serde_json::Value;
use tracing::warn;

use crate::jsonrpc::{JsonRpcError, JsonRpcResponse};

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Display, Error, From)]
pub enum RelayError {
    #[display(fmt = "config invalid: {}", _0)]
    #[from(ignore)]
    ConfigInvalid(String),

    #[display(fmt = "no upstream endpoint available")]
    NoEndpointAvailable,

    #[display(fmt = "upstream transport error: {}", _0)]
    #[from(ignore)]
    UpstreamTransport(String),

    #[display(fmt = "upstream request timed out")]
    UpstreamTimeout,

    #[display(fmt = "upstream returned a json-rpc error")]
    #[from(ignore)]
    UpstreamRpcError(JsonRpcError),

    #[display(fmt = "malformed request: {}", _0)]
    #[from(ignore)]
    MalformedRequest(String),

    #[display(fmt = "io error: {}", _0)]
    Io(std::io::Error),

    #[display(fmt = "json error: {}", _0)]
    Json(serde_json::Error),
}

impl RelayError {
    /// Render the JSON-RPC error envelope spec'd for each failure mode,
    /// carrying the client's original `id` through (even on malformed input,
    /// where we fall back to `Value::Null` since we never parsed an id).
    pub fn into_response_with_id(self, id: Value) -> Response {
        let (status, err) = match self {
            RelayError::MalformedRequest(msg) => (
                StatusCode::BAD_REQUEST,
                JsonRpcError {
                    code: -32600,
                    message: msg,
                    data: None,
                },
            ),
            RelayError::NoEndpointAvailable => (
                StatusCode::OK,
                JsonRpcError {
                    code: -32603,
                    message: "no upstream available".to_string(),
                    data: None,
                },
            ),
            RelayError::UpstreamTransport(_) | RelayError::UpstreamTimeout => (
                StatusCode::OK,
                JsonRpcError {
                    code: -32603,
                    message: "upstream error".to_string(),
                    data: None,
                },
            ),
            RelayError::UpstreamRpcError(err) => (StatusCode::OK, err),
            other => {
                warn!(error = %other, "internal relay error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcError {
                        code: -32603,
                        message: "internal error".to_string(),
                        data: None,
                    },
                )
            }
        };

        (status, Json(JsonRpcResponse::error(id, err))).into_response()
    }
}

/// Outcome of a single dispatch attempt against one upstream endpoint.
/// Kept distinct from [`RelayError`] (and `Clone`, unlike it) because it is
/// the `E` type in the cache's `moka::future::Cache::try_get_with`, whose
/// concurrent waiters all observe the same `Arc<E>`.
#[derive(Debug, Clone)]
pub enum DispatchError {
    NoEndpointAvailable,
    UpstreamTransport(String),
    UpstreamTimeout,
    UpstreamRpcError(JsonRpcError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NoEndpointAvailable => write!(f, "no upstream endpoint available"),
            DispatchError::UpstreamTransport(msg) => write!(f, "upstream transport error: {msg}"),
            DispatchError::UpstreamTimeout => write!(f, "upstream request timed out"),
            DispatchError::UpstreamRpcError(err) => {
                write!(f, "upstream json-rpc error {}: {}", err.code, err.message)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for RelayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoEndpointAvailable => RelayError::NoEndpointAvailable,
            DispatchError::UpstreamTransport(msg) => RelayError::UpstreamTransport(msg),
            DispatchError::UpstreamTimeout => RelayError::UpstreamTimeout,
            DispatchError::UpstreamRpcError(err) => RelayError::UpstreamRpcError(err),
        }
    }
}
