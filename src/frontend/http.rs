//! axum handlers: the JSON-RPC relay endpoint itself, a liveness probe, and
//! the metrics read surface.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tracing::warn;

use crate::app::App;
use crate::dispatcher;
use crate::errors::RelayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// `POST /`. The body is parsed manually (rather than via axum's `Json`
/// extractor) so a malformed body can still be answered with a JSON-RPC
/// `{code: -32600}` envelope instead of axum's default rejection body.
pub async fn rpc_handler(Extension(app): Extension<Arc<App>>, body: String) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(err) => {
            warn!(%err, "malformed json-rpc request");
            return RelayError::MalformedRequest(err.to_string()).into_response_with_id(Value::Null);
        }
    };

    let id = request.id.clone();

    match dispatcher::dispatch(app, request).await {
        Ok(result) => (StatusCode::OK, Json(JsonRpcResponse::success(id, result))).into_response(),
        Err(err) => err.into_response_with_id(id),
    }
}

/// `GET /`: a liveness probe. Plain 200, no body — the relay has nothing
/// meaningful to say about liveness beyond "the listener is up".
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// `GET /status`: the metrics snapshot spec'd as an in-process read, exposed
/// as JSON for convenience.
pub async fn status_handler(Extension(app): Extension<Arc<App>>) -> Response {
    Json(app.metrics_snapshot()).into_response()
}
