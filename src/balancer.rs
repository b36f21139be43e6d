//! Weighted, health- and rate-aware endpoint selection.
//!
//! Selection narrows the live endpoint set through four filters in order —
//! health, tier preference, latency, rate — then walks the registry's
//! pre-built weighted slot table from a monotonic cursor, skipping slots
//! that landed on a filtered-out endpoint. The table encodes weight; the
//! cursor provides fairness across calls without rebuilding anything per
//! request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::EndpointTier;
use crate::registry::{Endpoint, RegistryState, Status};

pub enum Selection {
    Endpoint(Arc<Endpoint>),
    NoneAvailable { retry_at: Option<Instant> },
}

#[derive(Default)]
pub struct LoadBalancer {
    cursor: AtomicU64,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next endpoint to use, optionally excluding one url (used by
    /// the dispatcher's single retry to avoid hitting the same endpoint
    /// twice for one request).
    pub fn select(&self, state: &RegistryState, now: Instant, exclude: Option<&str>) -> Selection {
        let n = state.endpoints.len();
        if n == 0 {
            return Selection::NoneAvailable { retry_at: None };
        }

        let healthy: Vec<usize> = (0..n)
            .filter(|&i| {
                let e = &state.endpoints[i];
                e.status() == Status::Healthy
                    && !e.is_draining()
                    && exclude.map_or(true, |url| e.url != url)
            })
            .collect();

        if healthy.is_empty() {
            return Selection::NoneAvailable { retry_at: None };
        }

        let has_primary = healthy
            .iter()
            .any(|&i| state.endpoints[i].tier() == EndpointTier::Primary);
        let tier_set: Vec<usize> = if has_primary {
            healthy
                .into_iter()
                .filter(|&i| state.endpoints[i].tier() == EndpointTier::Primary)
                .collect()
        } else {
            healthy
        };

        let latency_set = self.latency_filter(state, &tier_set);

        let rate_set: Vec<usize> = latency_set
            .iter()
            .copied()
            .filter(|&i| {
                let e = &state.endpoints[i];
                e.rate.can_send(now, e.max_tps(), e.max_tpm())
            })
            .collect();

        if rate_set.is_empty() {
            let retry_at = latency_set
                .iter()
                .map(|&i| {
                    let e = &state.endpoints[i];
                    e.rate.earliest_available(now, e.max_tps(), e.max_tpm())
                })
                .min();
            return Selection::NoneAvailable { retry_at };
        }

        let eligible: HashSet<usize> = rate_set.into_iter().collect();
        self.weighted_pick(state, &eligible)
    }

    fn latency_filter(&self, state: &RegistryState, candidates: &[usize]) -> Vec<usize> {
        let Some(threshold) = state.snapshot.latency_threshold_ms else {
            return candidates.to_vec();
        };

        let filtered: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| {
                state.endpoints[i]
                    .ewma_latency_ms()
                    .map_or(true, |l| l <= threshold as f64)
            })
            .collect();

        if !filtered.is_empty() {
            return filtered;
        }

        // Every candidate is over threshold: fall back to the single
        // lowest-latency endpoint rather than rejecting the request outright.
        candidates
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let la = state.endpoints[a].ewma_latency_ms().unwrap_or(f64::MAX);
                let lb = state.endpoints[b].ewma_latency_ms().unwrap_or(f64::MAX);
                la.partial_cmp(&lb).unwrap()
            })
            .map(|i| vec![i])
            .unwrap_or_default()
    }

    fn weighted_pick(&self, state: &RegistryState, eligible: &HashSet<usize>) -> Selection {
        let table = &state.slot_table.slots;
        if table.is_empty() {
            return Selection::NoneAvailable { retry_at: None };
        }

        for _ in 0..table.len() {
            let slot = (self.cursor.fetch_add(1, Ordering::Relaxed) as usize) % table.len();
            let idx = table[slot];
            if eligible.contains(&idx) {
                return Selection::Endpoint(state.endpoints[idx].clone());
            }
        }

        // Every eligible endpoint has weight >= 1 so it must occupy at
        // least one slot; reaching here would mean eligible and the table
        // disagree, which build_registry_state's invariants rule out.
        let idx = *eligible.iter().min().expect("eligible set is non-empty");
        Selection::Endpoint(state.endpoints[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::registry::EndpointRegistry;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn registry(yaml: &str) -> EndpointRegistry {
        let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
        let snapshot = crate::config::ConfigSnapshot::validate(raw).unwrap();
        EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot)
    }

    #[test]
    fn prefers_primary_tier_when_available() {
        let reg = registry(
            r#"
rpc_endpoints:
  primary:
    - url: "https://p.example"
      max_tps: 100
  secondary:
    - url: "https://s.example"
      max_tps: 100
"#,
        );
        let state = reg.current();
        let balancer = LoadBalancer::new();
        for _ in 0..10 {
            match balancer.select(&state, Instant::now(), None) {
                Selection::Endpoint(e) => assert_eq!(e.url, "https://p.example"),
                Selection::NoneAvailable { .. } => panic!("expected a selection"),
            }
        }
    }

    #[test]
    fn falls_back_to_secondary_when_primary_unhealthy() {
        let reg = registry(
            r#"
rpc_endpoints:
  primary:
    - url: "https://p.example"
      max_tps: 100
  secondary:
    - url: "https://s.example"
      max_tps: 100
"#,
        );
        let state = reg.current();
        let primary = state.by_url.get("https://p.example").unwrap();
        primary.record_probe_failure();
        primary.record_probe_failure();
        primary.record_probe_failure();

        let balancer = LoadBalancer::new();
        match balancer.select(&state, Instant::now(), None) {
            Selection::Endpoint(e) => assert_eq!(e.url, "https://s.example"),
            Selection::NoneAvailable { .. } => panic!("expected a selection"),
        }
    }

    #[test]
    fn weighted_fairness_within_tolerance() {
        let reg = registry(
            r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 100000
      weight: 3
    - url: "https://b.example"
      max_tps: 100000
      weight: 1
"#,
        );
        let state = reg.current();
        let balancer = LoadBalancer::new();
        let mut counts: HashMap<String, u32> = HashMap::new();
        let total_selections = 10 * (3 + 1);
        for _ in 0..total_selections {
            if let Selection::Endpoint(e) = balancer.select(&state, Instant::now(), None) {
                *counts.entry(e.url.clone()).or_default() += 1;
            }
        }
        let a = counts["https://a.example"] as f64;
        let b = counts["https://b.example"] as f64;
        let ratio = a / b;
        assert!((ratio - 3.0).abs() < 0.15, "ratio was {ratio}");
    }

    #[test]
    fn no_endpoint_available_when_all_at_rate_cap() {
        let reg = registry(
            r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 1
"#,
        );
        let state = reg.current();
        let endpoint = state.by_url.get("https://a.example").unwrap();
        let now = Instant::now();
        endpoint.rate.record(now);

        let balancer = LoadBalancer::new();
        match balancer.select(&state, now, None) {
            Selection::NoneAvailable { retry_at } => assert!(retry_at.is_some()),
            Selection::Endpoint(_) => panic!("endpoint should be at its tps cap"),
        }
    }

    #[test]
    fn exclude_prevents_reselecting_same_endpoint() {
        let reg = registry(
            r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 100
    - url: "https://b.example"
      max_tps: 100
"#,
        );
        let state = reg.current();
        let balancer = LoadBalancer::new();
        for _ in 0..10 {
            match balancer.select(&state, Instant::now(), Some("https://a.example")) {
                Selection::Endpoint(e) => assert_eq!(e.url, "https://b.example"),
                Selection::NoneAvailable { .. } => panic!("expected a selection"),
            }
        }
    }
}
