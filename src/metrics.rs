//! In-process counters backing the relay's `/status` read surface. No
//! external metrics sink: spec'd data points only, exposed as JSON for a
//! dashboard process to poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::registry::{Endpoint, RegistryState};

#[derive(Default)]
pub struct Metrics {
    total_calls: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct GlobalMetrics {
    pub total_calls: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct EndpointMetrics {
    pub url: String,
    pub tier: &'static str,
    pub status: &'static str,
    pub total_calls: u64,
    pub consecutive_errors: u32,
    pub ewma_latency_ms: Option<f64>,
    pub blocks_behind: Option<i64>,
    pub observed_tps: usize,
    pub observed_tpm: usize,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalMetrics,
    pub endpoints: Vec<EndpointMetrics>,
}

impl Metrics {
    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, ok: bool) {
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn global_snapshot(&self) -> GlobalMetrics {
        let total = self.total_calls.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        GlobalMetrics {
            total_calls: total,
            cache_hits: hits,
            failures: self.failures.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

pub fn endpoint_snapshot(endpoint: &Endpoint) -> EndpointMetrics {
    let now = Instant::now();
    EndpointMetrics {
        url: endpoint.url.clone(),
        tier: endpoint.tier().as_str(),
        status: endpoint.status().as_str(),
        total_calls: endpoint.total_calls.load(Ordering::Relaxed),
        consecutive_errors: endpoint.consecutive_errors.load(Ordering::Relaxed),
        ewma_latency_ms: endpoint.ewma_latency_ms(),
        blocks_behind: endpoint.blocks_behind(),
        observed_tps: endpoint.rate.count_within(now, Duration::from_secs(1)),
        observed_tpm: endpoint.rate.count_within(now, Duration::from_secs(60)),
    }
}

pub fn snapshot(metrics: &Metrics, state: &RegistryState) -> MetricsSnapshot {
    MetricsSnapshot {
        global: metrics.global_snapshot(),
        endpoints: state.endpoints.iter().map(|e| endpoint_snapshot(e)).collect(),
    }
}
