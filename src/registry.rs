//! Endpoint registry: the live, hot-reloadable table of upstream endpoints.
//!
//! [`EndpointRegistry`] publishes an immutable [`RegistryState`] behind an
//! `ArcSwap`, the same copy-on-publish pattern the config layer uses for
//! [`ConfigSnapshot`]. A request resolves the current state once at the
//! start of dispatch and holds its own `Arc` clones for the rest of the
//! operation, so a reload that drops an endpoint never yanks it out from
//! under an in-flight call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{self, ConfigSnapshot, EndpointSpec, EndpointTier};
use crate::errors::RelayResult;
use crate::rate::RateAccountant;

const RELOAD_THROTTLE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Healthy,
    Throttled,
    Unhealthy,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Healthy => "healthy",
            Status::Throttled => "throttled",
            Status::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Identity {
    tier: EndpointTier,
    weight: u32,
    max_tps: u32,
    max_tpm: Option<u32>,
    max_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    status: Status,
    last_latency_ms: Option<u64>,
    ewma_latency_ms: Option<f64>,
    last_block_height: Option<u64>,
    blocks_behind: Option<i64>,
    consecutive_good_probes: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: Status::Healthy,
            last_latency_ms: None,
            ewma_latency_ms: None,
            last_block_height: None,
            blocks_behind: None,
            consecutive_good_probes: 0,
        }
    }
}

/// One upstream RPC endpoint: identity (from config), mutable health state,
/// and a rate accountant. Identity is refreshed in place on reload for
/// endpoints that survive; health and rate state are preserved across
/// reload for the same reason — they represent what the relay has learned
/// about the endpoint, not what the config file says about it.
pub struct Endpoint {
    pub url: String,
    identity: Mutex<Identity>,
    health: Mutex<HealthState>,
    pub consecutive_errors: AtomicU32,
    pub total_calls: AtomicU64,
    pub draining: AtomicBool,
    pub rate: RateAccountant,
}

impl Endpoint {
    fn new(spec: &EndpointSpec) -> Arc<Self> {
        Arc::new(Self {
            url: spec.url.clone(),
            identity: Mutex::new(Identity {
                tier: spec.tier,
                weight: spec.weight,
                max_tps: spec.max_tps,
                max_tpm: spec.max_tpm,
                max_latency_ms: spec.max_latency_ms,
            }),
            health: Mutex::new(HealthState::default()),
            consecutive_errors: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            rate: RateAccountant::new(),
        })
    }

    fn update_identity(&self, spec: &EndpointSpec) {
        let mut id = self.identity.lock();
        id.tier = spec.tier;
        id.weight = spec.weight;
        id.max_tps = spec.max_tps;
        id.max_tpm = spec.max_tpm;
        id.max_latency_ms = spec.max_latency_ms;
    }

    pub fn tier(&self) -> EndpointTier {
        self.identity.lock().tier
    }

    pub fn weight(&self) -> u32 {
        self.identity.lock().weight
    }

    pub fn max_tps(&self) -> u32 {
        self.identity.lock().max_tps
    }

    pub fn max_tpm(&self) -> Option<u32> {
        self.identity.lock().max_tpm
    }

    pub fn max_latency_ms(&self) -> Option<u64> {
        self.identity.lock().max_latency_ms
    }

    pub fn status(&self) -> Status {
        self.health.lock().status
    }

    pub fn ewma_latency_ms(&self) -> Option<f64> {
        self.health.lock().ewma_latency_ms
    }

    pub fn last_latency_ms(&self) -> Option<u64> {
        self.health.lock().last_latency_ms
    }

    pub fn blocks_behind(&self) -> Option<i64> {
        self.health.lock().blocks_behind
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// A probe or dispatched call completed successfully in `elapsed_ms`.
    /// Updates the EWMA latency and, if the endpoint was unhealthy, tracks
    /// the two consecutive under-threshold probes needed to recover.
    pub fn record_probe_success(&self, elapsed_ms: f64, max_latency_ms: Option<u64>) {
        self.consecutive_errors.store(0, Ordering::Relaxed);

        let mut st = self.health.lock();
        st.last_latency_ms = Some(elapsed_ms.round() as u64);
        let new_ewma = match st.ewma_latency_ms {
            Some(prev) => 0.3 * elapsed_ms + 0.7 * prev,
            None => elapsed_ms,
        };
        st.ewma_latency_ms = Some(new_ewma);

        let within_latency = max_latency_ms.map_or(true, |cap| new_ewma <= cap as f64);

        match st.status {
            Status::Unhealthy => {
                if within_latency {
                    st.consecutive_good_probes += 1;
                    if st.consecutive_good_probes >= 2 {
                        st.status = Status::Healthy;
                        st.consecutive_good_probes = 0;
                    }
                } else {
                    st.consecutive_good_probes = 0;
                }
            }
            Status::Healthy | Status::Throttled => {
                if !within_latency {
                    st.status = Status::Unhealthy;
                    st.consecutive_good_probes = 0;
                }
            }
        }
    }

    /// A probe failed outright (transport error/timeout). Three consecutive
    /// failures mark the endpoint unhealthy.
    pub fn record_probe_failure(&self) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        let mut st = self.health.lock();
        st.consecutive_good_probes = 0;
        if errors >= 3 {
            st.status = Status::Unhealthy;
        }
    }

    /// Record an observed block height and, given the pool's current head,
    /// how far behind this endpoint is. Exceeding `max_blocks_behind` marks
    /// the endpoint unhealthy regardless of its latency standing.
    pub fn record_block_height(&self, height: u64, head: u64, max_blocks_behind: Option<i64>) {
        let mut st = self.health.lock();
        st.last_block_height = Some(height);
        let behind = (head as i64 - height as i64).max(0);
        st.blocks_behind = Some(behind);
        if let Some(cap) = max_blocks_behind {
            if behind > cap {
                st.status = Status::Unhealthy;
            }
        }
    }

    /// Flip healthy <-> throttled based on whether the endpoint is
    /// currently saturating its own tps cap. Never overrides `Unhealthy`.
    pub fn set_throttled(&self, throttled: bool) {
        let mut st = self.health.lock();
        if st.status == Status::Unhealthy {
            return;
        }
        st.status = if throttled {
            Status::Throttled
        } else {
            Status::Healthy
        };
    }

    /// A dispatched call completed (successfully forwarded, regardless of
    /// whether the upstream's own JSON-RPC response was an error envelope).
    /// `ok` reflects transport success, not application-level success.
    pub fn mark_call_outcome(&self, ok: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.consecutive_errors.store(0, Ordering::Relaxed);
        } else {
            let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if errors >= 3 {
                self.health.lock().status = Status::Unhealthy;
            }
        }
    }
}

/// Each endpoint index repeated `weight` times, in snapshot order. Built
/// once per reload; the balancer walks it with a monotonic cursor instead
/// of recomputing a weighted distribution on every request.
pub struct SlotTable {
    pub slots: Vec<usize>,
}

fn build_slot_table(endpoints: &[Arc<Endpoint>]) -> SlotTable {
    let mut slots = Vec::new();
    for (idx, endpoint) in endpoints.iter().enumerate() {
        for _ in 0..endpoint.weight() {
            slots.push(idx);
        }
    }
    SlotTable { slots }
}

pub struct RegistryState {
    pub snapshot: Arc<ConfigSnapshot>,
    pub endpoints: Vec<Arc<Endpoint>>,
    pub by_url: HashMap<String, Arc<Endpoint>>,
    pub slot_table: SlotTable,
}

fn build_registry_state(old_by_url: &HashMap<String, Arc<Endpoint>>, new_snapshot: ConfigSnapshot) -> RegistryState {
    let new_snapshot = Arc::new(new_snapshot);
    let new_urls: std::collections::HashSet<&str> =
        new_snapshot.endpoints.iter().map(|e| e.url.as_str()).collect();

    for (url, endpoint) in old_by_url.iter() {
        if !new_urls.contains(url.as_str()) {
            endpoint.draining.store(true, Ordering::Relaxed);
        }
    }

    let mut by_url = HashMap::with_capacity(new_snapshot.endpoints.len());
    let mut endpoints = Vec::with_capacity(new_snapshot.endpoints.len());

    for spec in &new_snapshot.endpoints {
        let endpoint = match old_by_url.get(&spec.url) {
            Some(existing) => {
                existing.update_identity(spec);
                existing.clone()
            }
            None => Endpoint::new(spec),
        };
        by_url.insert(spec.url.clone(), endpoint.clone());
        endpoints.push(endpoint);
    }

    let slot_table = build_slot_table(&endpoints);

    RegistryState {
        snapshot: new_snapshot,
        endpoints,
        by_url,
        slot_table,
    }
}

pub struct EndpointRegistry {
    config_path: PathBuf,
    state: ArcSwap<RegistryState>,
    last_applied_mtime: Mutex<Option<SystemTime>>,
    last_reload_attempt: Mutex<Option<SystemTime>>,
}

impl EndpointRegistry {
    pub fn new(config_path: PathBuf, initial: ConfigSnapshot) -> Self {
        let mtime = config::mtime(&config_path);
        let state = build_registry_state(&HashMap::new(), initial);
        Self {
            config_path,
            state: ArcSwap::from_pointee(state),
            last_applied_mtime: Mutex::new(mtime),
            last_reload_attempt: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Arc<RegistryState> {
        self.state.load_full()
    }

    /// Apply `new_snapshot` immediately, preserving health/rate state for
    /// retained endpoints. Exposed directly for tests and for any caller
    /// that already has a validated snapshot in hand.
    pub fn publish(&self, new_snapshot: ConfigSnapshot) {
        let old = self.state.load();
        let new_state = build_registry_state(&old.by_url, new_snapshot);
        self.state.store(Arc::new(new_state));
    }

    /// Check the config file's mtime and, if it changed, reload and
    /// validate it, publishing the result. Throttled to once per
    /// [`RELOAD_THROTTLE`] wall-clock seconds — a caller firing this more
    /// often (e.g. from an eager ticker) is a silent no-op until the
    /// throttle window elapses. Missed ticks do not accumulate: there is no
    /// catch-up burst once the throttle window reopens.
    pub async fn reload_if_changed(&self) {
        let now = SystemTime::now();
        {
            let mut last_attempt = self.last_reload_attempt.lock();
            if let Some(prev) = *last_attempt {
                if now.duration_since(prev).unwrap_or_default() < RELOAD_THROTTLE {
                    return;
                }
            }
            *last_attempt = Some(now);
        }

        let mtime = match config::mtime(&self.config_path) {
            Some(m) => m,
            None => {
                warn!(path = ?self.config_path, "could not stat config file, keeping current snapshot");
                return;
            }
        };

        {
            let last_applied = self.last_applied_mtime.lock();
            if let Some(prev) = *last_applied {
                if mtime <= prev {
                    return;
                }
            }
        }

        match self.load_and_validate() {
            Ok(new_snapshot) => {
                self.publish(new_snapshot);
                *self.last_applied_mtime.lock() = Some(mtime);
            }
            Err(err) => {
                warn!(?err, "config reload rejected, keeping previous snapshot");
            }
        }
    }

    fn load_and_validate(&self) -> RelayResult<ConfigSnapshot> {
        config::load_snapshot(&self.config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    fn snapshot(yaml: &str) -> ConfigSnapshot {
        let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
        ConfigSnapshot::validate(raw).unwrap()
    }

    const BASE: &str = r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 10
      weight: 3
    - url: "https://b.example"
      max_tps: 10
      weight: 1
"#;

    #[test]
    fn slot_table_reflects_weights() {
        let registry = EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot(BASE));
        let state = registry.current();
        assert_eq!(state.slot_table.slots.len(), 4);
        assert_eq!(state.slot_table.slots.iter().filter(|&&i| i == 0).count(), 3);
        assert_eq!(state.slot_table.slots.iter().filter(|&&i| i == 1).count(), 1);
    }

    #[test]
    fn reload_preserves_state_for_retained_endpoint_and_drains_removed() {
        let registry = EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot(BASE));
        let old_state = registry.current();
        let endpoint_a = old_state.by_url.get("https://a.example").unwrap().clone();
        endpoint_a.record_probe_failure();
        endpoint_a.record_probe_failure();
        assert_eq!(endpoint_a.consecutive_errors.load(Ordering::Relaxed), 2);

        let next = snapshot(
            r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 20
      weight: 5
"#,
        );
        registry.publish(next);

        let new_state = registry.current();
        let retained = new_state.by_url.get("https://a.example").unwrap();
        assert!(Arc::ptr_eq(retained, &endpoint_a));
        assert_eq!(retained.consecutive_errors.load(Ordering::Relaxed), 2);
        assert_eq!(retained.max_tps(), 20);
        assert_eq!(retained.weight(), 5);

        assert!(!new_state.by_url.contains_key("https://b.example"));
        let removed = old_state.by_url.get("https://b.example").unwrap();
        assert!(removed.is_draining());
    }

    #[test]
    fn three_consecutive_failures_mark_unhealthy() {
        let registry = EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot(BASE));
        let endpoint = registry.current().by_url.get("https://a.example").unwrap().clone();
        assert_eq!(endpoint.status(), Status::Healthy);
        endpoint.record_probe_failure();
        endpoint.record_probe_failure();
        assert_eq!(endpoint.status(), Status::Healthy);
        endpoint.record_probe_failure();
        assert_eq!(endpoint.status(), Status::Unhealthy);
    }

    #[test]
    fn recovers_after_two_good_probes_under_latency_cap() {
        let registry = EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot(BASE));
        let endpoint = registry.current().by_url.get("https://a.example").unwrap().clone();
        endpoint.record_probe_failure();
        endpoint.record_probe_failure();
        endpoint.record_probe_failure();
        assert_eq!(endpoint.status(), Status::Unhealthy);

        endpoint.record_probe_success(50.0, Some(200));
        assert_eq!(endpoint.status(), Status::Unhealthy);
        endpoint.record_probe_success(50.0, Some(200));
        assert_eq!(endpoint.status(), Status::Healthy);
    }

    #[test]
    fn excessive_lag_marks_unhealthy_even_when_latency_is_fine() {
        let registry = EndpointRegistry::new(PathBuf::from("unused.yaml"), snapshot(BASE));
        let endpoint = registry.current().by_url.get("https://a.example").unwrap().clone();
        endpoint.record_probe_success(10.0, None);
        assert_eq!(endpoint.status(), Status::Healthy);
        endpoint.record_block_height(100, 150, Some(20));
        assert_eq!(endpoint.status(), Status::Unhealthy);
    }
}
