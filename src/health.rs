//! Background health monitor: periodically probes every non-draining
//! endpoint with `eth_blockNumber`, updates EWMA latency and block-lag
//! state, and flips the throttled/healthy flag based on observed tps
//! against each endpoint's own cap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::http_client::OutboundClient;
use crate::jsonrpc::JsonRpcRequest;
use crate::registry::{Endpoint, EndpointRegistry, Status};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HealthMonitor {
    registry: Arc<EndpointRegistry>,
    client: OutboundClient,
}

impl HealthMonitor {
    pub fn new(registry: Arc<EndpointRegistry>, client: OutboundClient) -> Self {
        Self { registry, client }
    }

    pub async fn run(self, mut stop: watch::Receiver<()>) {
        loop {
            self.tick().await;

            let state = self.registry.current();
            let interval = Duration::from_secs(state.snapshot.monitor_interval_s.max(1));

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
        }
    }

    async fn tick(&self) {
        let state = self.registry.current();
        let max_blocks_behind = state.snapshot.max_blocks_behind;

        let mut heights: Vec<(Arc<Endpoint>, u64)> = Vec::new();

        for endpoint in state.endpoints.iter() {
            if endpoint.is_draining() {
                continue;
            }

            let now = Instant::now();
            if !endpoint.rate.can_send(now, endpoint.max_tps(), endpoint.max_tpm()) {
                debug!(url = %endpoint.url, "skipping health probe, endpoint at tps cap");
                continue;
            }
            endpoint.rate.record(now);

            let request = JsonRpcRequest::new_internal("eth_blockNumber", serde_json::json!([]));
            let started = Instant::now();
            match self.client.send(&endpoint.url, &request, PROBE_TIMEOUT).await {
                Ok(envelope) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    endpoint.record_probe_success(elapsed_ms, endpoint.max_latency_ms());
                    if let Some(result) = envelope.result.as_ref() {
                        if let Some(height) = parse_block_height(result) {
                            heights.push((endpoint.clone(), height));
                        }
                    }
                }
                Err(err) => {
                    warn!(url = %endpoint.url, %err, "health probe failed");
                    endpoint.record_probe_failure();
                }
            }
        }

        if let Some(&head) = heights.iter().map(|(_, h)| h).collect::<Vec<_>>().iter().max() {
            for (endpoint, height) in &heights {
                endpoint.record_block_height(*height, head, max_blocks_behind);
            }
        }

        for endpoint in state.endpoints.iter() {
            if endpoint.status() == Status::Unhealthy {
                continue;
            }
            let observed_tps = endpoint
                .rate
                .count_within(Instant::now(), Duration::from_secs(1));
            endpoint.set_throttled(observed_tps as u32 >= endpoint.max_tps());
        }
    }
}

fn parse_block_height(value: &serde_json::Value) -> Option<u64> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_hex_block_height() {
        assert_eq!(parse_block_height(&json!("0x10")), Some(16));
        assert_eq!(parse_block_height(&json!("not hex")), None);
        assert_eq!(parse_block_height(&json!(10)), None);
    }
}
