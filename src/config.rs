//! `relay.yaml` parsing and validation.
//!
//! `RawConfig` is the literal on-disk shape; `ConfigSnapshot` is the
//! validated, immutable value the rest of the relay consumes. The two are
//! kept separate so a malformed reload never corrupts the live snapshot: a
//! `RawConfig` that fails validation is simply discarded and
//! [`RelayError::ConfigInvalid`] is returned, leaving whatever snapshot is
//! currently published untouched.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use serde::Deserialize;

use crate::errors::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EndpointTier {
    Primary,
    Secondary,
}

impl EndpointTier {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointTier::Primary => "primary",
            EndpointTier::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEndpoint {
    pub url: String,
    pub max_tps: u32,
    #[serde(default)]
    pub max_tpm: Option<u32>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRpcEndpoints {
    #[serde(default)]
    pub primary: Vec<RawEndpoint>,
    #[serde(default)]
    pub secondary: Vec<RawEndpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawHealthMonitor {
    #[serde(default)]
    pub max_blocks_behind: Option<i64>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_monitor_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRelay {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub latency_threshold_ms: Option<u64>,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_s: u64,
}

impl Default for RawRelay {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            latency_threshold_ms: None,
            monitor_interval_s: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub cache_ttl: HashMap<String, u64>,
    #[serde(default)]
    pub rpc_endpoints: RawRpcEndpoints,
    #[serde(default)]
    pub health_monitor: RawHealthMonitor,
    #[serde(default)]
    pub relay: RawRelay,
}

#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub url: String,
    pub tier: EndpointTier,
    pub max_tps: u32,
    pub max_tpm: Option<u32>,
    pub max_latency_ms: Option<u64>,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub endpoints: Vec<EndpointSpec>,
    pub cache_ttl: HashMap<String, u64>,
    pub latency_threshold_ms: Option<u64>,
    pub monitor_interval_s: u64,
    pub max_blocks_behind: Option<i64>,
    pub host: String,
    pub port: u16,
}

impl ConfigSnapshot {
    pub fn validate(raw: RawConfig) -> RelayResult<Self> {
        let mut endpoints = Vec::new();
        let mut seen = HashSet::new();

        for (tier, list) in [
            (EndpointTier::Primary, &raw.rpc_endpoints.primary),
            (EndpointTier::Secondary, &raw.rpc_endpoints.secondary),
        ] {
            for ep in list {
                if ep.url.trim().is_empty() {
                    return Err(RelayError::ConfigInvalid(
                        "endpoint url must not be empty".to_string(),
                    ));
                }
                if !seen.insert(ep.url.clone()) {
                    return Err(RelayError::ConfigInvalid(format!(
                        "duplicate endpoint url: {}",
                        ep.url
                    )));
                }
                if ep.max_tps < 1 {
                    return Err(RelayError::ConfigInvalid(format!(
                        "{}: max_tps must be >= 1",
                        ep.url
                    )));
                }
                let weight = ep.weight.unwrap_or(1);
                if weight < 1 {
                    return Err(RelayError::ConfigInvalid(format!(
                        "{}: weight must be >= 1",
                        ep.url
                    )));
                }
                if let Some(tpm) = ep.max_tpm {
                    if tpm < 1 {
                        return Err(RelayError::ConfigInvalid(format!(
                            "{}: max_tpm must be >= 1 when set",
                            ep.url
                        )));
                    }
                }

                endpoints.push(EndpointSpec {
                    url: ep.url.clone(),
                    tier,
                    max_tps: ep.max_tps,
                    max_tpm: ep.max_tpm,
                    max_latency_ms: ep.max_latency_ms,
                    weight,
                });
            }
        }

        if endpoints.is_empty() {
            return Err(RelayError::ConfigInvalid(
                "no rpc endpoints configured".to_string(),
            ));
        }

        for (method, ttl) in &raw.cache_ttl {
            if *ttl < 1 {
                return Err(RelayError::ConfigInvalid(format!(
                    "cache_ttl.{method}: ttl must be >= 1 second"
                )));
            }
        }

        if raw.relay.monitor_interval_s < 1 {
            return Err(RelayError::ConfigInvalid(
                "relay.monitor_interval_s must be >= 1".to_string(),
            ));
        }

        Ok(Self {
            endpoints,
            cache_ttl: raw.cache_ttl,
            latency_threshold_ms: raw.relay.latency_threshold_ms,
            monitor_interval_s: raw.relay.monitor_interval_s,
            max_blocks_behind: raw.health_monitor.max_blocks_behind,
            host: raw.relay.host,
            port: raw.relay.port,
        })
    }
}

pub fn load_snapshot(path: &Path) -> RelayResult<ConfigSnapshot> {
    let contents = fs::read_to_string(path)?;
    let raw: RawConfig = serde_yaml::from_str(&contents)
        .map_err(|err| RelayError::ConfigInvalid(format!("{}: {err}", path.display())))?;
    ConfigSnapshot::validate(raw)
}

pub fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_raw() -> RawConfig {
        serde_yaml::from_str(
            r#"
rpc_endpoints:
  primary:
    - url: "https://a.example"
      max_tps: 10
      weight: 2
    - url: "https://b.example"
      max_tps: 5
cache_ttl:
  eth_blockNumber: 2
relay:
  monitor_interval_s: 30
"#,
        )
        .unwrap()
    }

    #[test]
    fn accepts_valid_config() {
        let snapshot = ConfigSnapshot::validate(valid_raw()).unwrap();
        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(snapshot.endpoints[0].weight, 2);
        assert_eq!(snapshot.endpoints[1].weight, 1);
    }

    #[test]
    fn rejects_duplicate_urls() {
        let mut raw = valid_raw();
        raw.rpc_endpoints.secondary.push(RawEndpoint {
            url: "https://a.example".to_string(),
            max_tps: 1,
            max_tpm: None,
            weight: None,
            max_latency_ms: None,
        });
        assert!(ConfigSnapshot::validate(raw).is_err());
    }

    #[test]
    fn rejects_zero_weight() {
        let mut raw = valid_raw();
        raw.rpc_endpoints.primary[0].weight = Some(0);
        assert!(ConfigSnapshot::validate(raw).is_err());
    }

    #[test]
    fn rejects_zero_max_tps() {
        let mut raw = valid_raw();
        raw.rpc_endpoints.primary[0].max_tps = 0;
        assert!(ConfigSnapshot::validate(raw).is_err());
    }

    #[test]
    fn rejects_empty_endpoint_pool() {
        let raw = RawConfig::default();
        assert!(ConfigSnapshot::validate(raw).is_err());
    }

    #[test]
    fn rejects_zero_cache_ttl() {
        let mut raw = valid_raw();
        raw.cache_ttl.insert("eth_call".to_string(), 0);
        assert!(ConfigSnapshot::validate(raw).is_err());
    }
}
