//! Request dispatch: nonce rewrite, cache/single-flight lookup, bounded
//! endpoint wait, outbound call with a single retry on transport failure,
//! and metrics recording. The one orchestration point that ties every
//! other subsystem together, mirroring the role the teacher's
//! `proxy_web3_rpc_request` plays in `app.rs`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::instrument;

use crate::app::App;
use crate::balancer::Selection;
use crate::cache::CacheKey;
use crate::errors::{DispatchError, RelayResult};
use crate::jsonrpc::{canonicalize_params, JsonRpcRequest};

const DEFAULT_ENDPOINT_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_OUTBOUND_TIMEOUT: Duration = Duration::from_secs(15);
const ENDPOINT_POLL_GRANULARITY: Duration = Duration::from_millis(10);

/// `eth_getTransactionCount` is rewritten to always query the pending nonce:
/// clients that pass `"latest"` (or anything else) here reliably hit nonce
/// reuse once a prior transaction is still pending.
pub fn rewrite_nonce(method: &str, params: &mut Value) {
    if method != "eth_getTransactionCount" {
        return;
    }
    if let Value::Array(items) = params {
        if items.len() >= 2 {
            items[1] = Value::String("pending".to_string());
        }
    }
}

#[instrument(skip(app, request), fields(method = %request.method))]
pub async fn dispatch(app: Arc<App>, mut request: JsonRpcRequest) -> RelayResult<Value> {
    rewrite_nonce(&request.method, &mut request.params);

    let ttl_seconds = {
        let state = app.registry.current();
        state.snapshot.cache_ttl.get(&request.method).copied()
    };

    app.metrics.record_call();

    let outcome: Result<Value, DispatchError> = if let Some(ttl_seconds) = ttl_seconds {
        let key = CacheKey {
            method: request.method.clone(),
            params: canonicalize_params(&request.params),
        };

        let already_cached = app.cache.contains(&key).await;

        let method = request.method.clone();
        let params = request.params.clone();
        let app_for_fill = app.clone();

        let result = app
            .cache
            .get_or_try_insert_with(key, Duration::from_secs(ttl_seconds), move || async move {
                send_with_retry(&app_for_fill, &method, &params).await
            })
            .await;

        if already_cached {
            app.metrics.record_cache_hit();
        }

        result.map_err(|arc_err| (*arc_err).clone())
    } else {
        send_with_retry(&app, &request.method, &request.params).await
    };

    match &outcome {
        Ok(_) => app.metrics.record_outcome(true),
        Err(_) => app.metrics.record_outcome(false),
    }

    outcome.map_err(Into::into)
}

async fn send_with_retry(app: &App, method: &str, params: &Value) -> Result<Value, DispatchError> {
    let (first, used_url) = send_once(app, method, params, None).await;
    match first {
        Ok(value) => Ok(value),
        Err(err @ DispatchError::UpstreamRpcError(_)) => Err(err),
        Err(err @ DispatchError::NoEndpointAvailable) => Err(err),
        Err(first_err) => {
            let (second, _) = send_once(app, method, params, used_url.as_deref()).await;
            second.map_err(|_| first_err)
        }
    }
}

async fn send_once(
    app: &App,
    method: &str,
    params: &Value,
    exclude: Option<&str>,
) -> (Result<Value, DispatchError>, Option<String>) {
    let endpoint = match wait_for_endpoint(app, exclude).await {
        Ok(endpoint) => endpoint,
        Err(err) => return (Err(err), None),
    };

    let url = endpoint.url.clone();
    endpoint.rate.record(Instant::now());

    let request = JsonRpcRequest::new_internal(method, params.clone());
    let started = Instant::now();

    let result = match app.client.send(&endpoint.url, &request, DEFAULT_OUTBOUND_TIMEOUT).await {
        Ok(envelope) => {
            if let Some(err) = envelope.error {
                // Application-level error, not a transport failure: the
                // endpoint answered correctly, so its health state is left
                // untouched entirely.
                Err(DispatchError::UpstreamRpcError(err))
            } else {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                endpoint.record_probe_success(elapsed_ms, endpoint.max_latency_ms());
                endpoint.mark_call_outcome(true);
                Ok(envelope.result.unwrap_or(Value::Null))
            }
        }
        Err(crate::errors::RelayError::UpstreamTimeout) => {
            endpoint.mark_call_outcome(false);
            Err(DispatchError::UpstreamTimeout)
        }
        Err(crate::errors::RelayError::UpstreamTransport(msg)) => {
            endpoint.mark_call_outcome(false);
            Err(DispatchError::UpstreamTransport(msg))
        }
        Err(other) => {
            endpoint.mark_call_outcome(false);
            Err(DispatchError::UpstreamTransport(other.to_string()))
        }
    };

    (result, Some(url))
}

async fn wait_for_endpoint(
    app: &App,
    exclude: Option<&str>,
) -> Result<Arc<crate::registry::Endpoint>, DispatchError> {
    let deadline = Instant::now() + DEFAULT_ENDPOINT_WAIT;

    loop {
        let state = app.registry.current();
        let now = Instant::now();

        match app.balancer.select(&state, now, exclude) {
            Selection::Endpoint(endpoint) => return Ok(endpoint),
            Selection::NoneAvailable { retry_at } => {
                if now >= deadline {
                    return Err(DispatchError::NoEndpointAvailable);
                }
                let wait_until = retry_at.unwrap_or(now + ENDPOINT_POLL_GRANULARITY).min(deadline);
                let sleep_for = wait_until
                    .saturating_duration_since(now)
                    .min(ENDPOINT_POLL_GRANULARITY)
                    .max(Duration::from_millis(1));
                tokio::time::sleep(sleep_for).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_nonce_to_pending() {
        let mut params = json!(["0xabc", "latest"]);
        rewrite_nonce("eth_getTransactionCount", &mut params);
        assert_eq!(params, json!(["0xabc", "pending"]));
    }

    #[test]
    fn leaves_other_methods_untouched() {
        let mut params = json!(["0xabc", "latest"]);
        rewrite_nonce("eth_getBalance", &mut params);
        assert_eq!(params, json!(["0xabc", "latest"]));
    }

    #[test]
    fn leaves_short_params_untouched() {
        let mut params = json!(["0xabc"]);
        rewrite_nonce("eth_getTransactionCount", &mut params);
        assert_eq!(params, json!(["0xabc"]));
    }
}
