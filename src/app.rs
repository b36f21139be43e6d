//! Top-level wiring: constructs the registry, balancer, cache, client and
//! metrics, and spawns the background health-monitor and reload-ticker
//! tasks. Mirrors the teacher's `Web3ProxyApp::spawn` / `flatten_handles`
//! shape, trimmed to this relay's subsystems.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::balancer::LoadBalancer;
use crate::cache::TtlCache;
use crate::config;
use crate::health::HealthMonitor;
use crate::http_client::OutboundClient;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::EndpointRegistry;

const CACHE_MAX_CAPACITY: u64 = 100_000;
const OUTBOUND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RELOAD_TICK: Duration = Duration::from_secs(5);

pub type AnyhowJoinHandle = JoinHandle<anyhow::Result<()>>;

/// Await every handle in `handles`, returning the first error encountered
/// (panic or task-level failure) and `Ok(())` once all have finished.
pub async fn flatten_handles(mut handles: FuturesUnordered<AnyhowJoinHandle>) -> anyhow::Result<()> {
    while let Some(result) = handles.next().await {
        match result {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(join_err.into()),
        }
    }
    Ok(())
}

pub struct App {
    pub registry: Arc<EndpointRegistry>,
    pub balancer: LoadBalancer,
    pub cache: TtlCache,
    pub client: OutboundClient,
    pub metrics: Metrics,
}

impl App {
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        crate::metrics::snapshot(&self.metrics, &self.registry.current())
    }

    /// Build the app and spawn its background tasks. Returns the app handle,
    /// a `watch::Sender` whose drop signals every background task to stop,
    /// and the set of task handles for the caller to join on shutdown.
    pub async fn spawn(
        config_path: PathBuf,
    ) -> anyhow::Result<(Arc<Self>, watch::Sender<()>, FuturesUnordered<AnyhowJoinHandle>)> {
        let initial_snapshot =
            config::load_snapshot(&config_path).context("loading initial configuration")?;

        let registry = Arc::new(EndpointRegistry::new(config_path.clone(), initial_snapshot));
        let client = OutboundClient::new(OUTBOUND_CONNECT_TIMEOUT).context("building outbound http client")?;

        let app = Arc::new(Self {
            registry: registry.clone(),
            balancer: LoadBalancer::new(),
            cache: TtlCache::new(CACHE_MAX_CAPACITY),
            client: client.clone(),
            metrics: Metrics::default(),
        });

        let (stop_tx, stop_rx) = watch::channel(());
        let handles = FuturesUnordered::new();

        let monitor = HealthMonitor::new(registry.clone(), client);
        let monitor_stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            monitor.run(monitor_stop).await;
            Ok(())
        }));

        let reload_registry = registry;
        let mut reload_stop = stop_rx;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RELOAD_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reload_registry.reload_if_changed().await;
                    }
                    _ = reload_stop.changed() => {
                        info!("reload ticker stopping");
                        break;
                    }
                }
            }
            Ok(())
        }));

        Ok((app, stop_tx, handles))
    }
}
