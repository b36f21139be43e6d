//! Shared outbound HTTP transport, reused by the dispatcher and the health
//! monitor so both draw from the same connection pool instead of each
//! opening its own.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::trace;

use crate::errors::RelayError;
use crate::jsonrpc::{JsonRpcError, JsonRpcRequest};

#[derive(Debug, serde::Deserialize)]
pub struct UpstreamEnvelope {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Clone)]
pub struct OutboundClient {
    client: Client,
}

impl OutboundClient {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(100)
            .user_agent(APP_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    pub async fn send(
        &self,
        url: &str,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<UpstreamEnvelope, RelayError> {
        let outbound_body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": request.method,
            "params": request.params,
        });

        trace!(url, method = %request.method, "sending outbound request");

        let response = tokio::time::timeout(timeout, self.client.post(url).json(&outbound_body).send())
            .await
            .map_err(|_| RelayError::UpstreamTimeout)?
            .map_err(|err| RelayError::UpstreamTransport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::UpstreamTransport(format!(
                "http {}",
                response.status()
            )));
        }

        response
            .json::<UpstreamEnvelope>()
            .await
            .map_err(|err| RelayError::UpstreamTransport(err.to_string()))
    }
}

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
