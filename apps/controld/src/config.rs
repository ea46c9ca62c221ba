//! Daemon configuration.
//!
//! Defaults match the documented operational contract; a JSON config
//! file (`FLUX_CONFIG`) overrides them, and a handful of environment
//! variables override the file for container deployments.

use std::net::SocketAddr;
use std::time::Duration;

use flux_core::{FluxError, FluxResult};
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControldConfig {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Replica identity used in leases and metrics. Defaults to a
    /// generated `controld-<uuid>` name.
    pub node_id: String,
    /// Leader lease TTL.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Worker pool size.
    pub max_concurrency: usize,
    /// Scheduler queue capacity.
    pub queue_capacity: usize,
    /// Hard budget for one reconciliation pass.
    #[serde(with = "humantime_serde")]
    pub max_task_runtime: Duration,
    /// Shadow mode: detect drift but never apply.
    pub shadow_mode: bool,
    /// Agent liveness scan period.
    #[serde(with = "humantime_serde")]
    pub liveness_period: Duration,
    /// Heartbeat staleness threshold.
    #[serde(with = "humantime_serde")]
    pub liveness_threshold: Duration,
    /// Heartbeat rate limit: sustained requests per second.
    pub heartbeat_rps: f64,
    /// Heartbeat rate limit burst.
    pub heartbeat_burst: usize,
    /// Manual reconcile rate limit: sustained requests per second.
    pub reconcile_rps: f64,
    /// Manual reconcile rate limit burst.
    pub reconcile_burst: usize,
    /// Shard this replica scans during rehydration.
    pub shard_index: u32,
    /// Total scan shards.
    pub shard_count: u32,
}

impl Default for ControldConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7400".parse().expect("static addr"),
            node_id: format!("controld-{}", uuid::Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
            max_concurrency: 8,
            queue_capacity: 1000,
            max_task_runtime: Duration::from_secs(300),
            shadow_mode: false,
            liveness_period: Duration::from_secs(5),
            liveness_threshold: Duration::from_secs(10),
            heartbeat_rps: 100.0,
            heartbeat_burst: 200,
            reconcile_rps: 10.0,
            reconcile_burst: 20,
            shard_index: 0,
            shard_count: 1,
        }
    }
}

impl ControldConfig {
    /// Load configuration: defaults, then the `FLUX_CONFIG` JSON file if
    /// set, then environment overrides.
    pub fn load() -> FluxResult<Self> {
        let mut config = match std::env::var("FLUX_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|err| {
                    FluxError::InvalidInput(format!("cannot read config {path}: {err}"))
                })?;
                serde_json::from_str(&raw)
                    .map_err(|err| FluxError::InvalidInput(format!("bad config {path}: {err}")))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("FLUX_LISTEN_ADDR")
            && let Ok(parsed) = addr.parse()
        {
            self.listen_addr = parsed;
        }
        if let Ok(node_id) = std::env::var("FLUX_NODE_ID")
            && !node_id.is_empty()
        {
            self.node_id = node_id;
        }
        if let Ok(secs) = std::env::var("FLUX_LEASE_TTL_SECS")
            && let Ok(parsed) = secs.parse::<u64>()
        {
            self.lease_ttl = Duration::from_secs(parsed);
        }
        if let Ok(value) = std::env::var("FLUX_SHADOW_MODE") {
            self.shadow_mode = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> FluxResult<()> {
        if self.node_id.is_empty() {
            return Err(FluxError::InvalidInput("node_id must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(FluxError::InvalidInput(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if self.shard_count == 0 || self.shard_index >= self.shard_count {
            return Err(FluxError::InvalidInput(
                "shard_index must be below shard_count".into(),
            ));
        }
        Ok(())
    }
}
