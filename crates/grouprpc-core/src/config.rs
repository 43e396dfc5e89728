//! Centralized configuration for grouprpc.
//!
//! Constants for agent naming and transport limits, the per-agent
//! [`AgentOptions`], and the JSON [`ClusterConfig`] that describes a TCP group.

use crate::{Result, RpcError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static WORKER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-:.]+$").unwrap());

/// Agent-level configuration.
pub struct AgentConfig;

impl AgentConfig {
    pub const MAX_NAME_LEN: usize = 128;
    pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
}

/// Group transport configuration.
pub struct GroupConfig;

impl GroupConfig {
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);
}

/// Check that a worker name is non-empty, short enough, and uses only
/// `[A-Za-z0-9_\-:.]`.
pub fn validate_worker_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > AgentConfig::MAX_NAME_LEN {
        return Err(RpcError::invalid_config(format!(
            "worker name '{}' must be 1..={} bytes",
            name,
            AgentConfig::MAX_NAME_LEN
        )));
    }
    if !WORKER_NAME.is_match(name) {
        return Err(RpcError::invalid_config(format!(
            "worker name '{}' contains characters outside [A-Za-z0-9_-:.]",
            name
        )));
    }
    Ok(())
}

/// Per-agent runtime options.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Fail requests that see no reply within this long. `None` waits forever.
    pub rpc_timeout: Option<Duration>,
    /// How often the delivery loop looks for expired requests.
    pub timeout_sweep_interval: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: None,
            timeout_sweep_interval: AgentConfig::TIMEOUT_SWEEP_INTERVAL,
        }
    }
}

impl AgentOptions {
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }
}

/// One member of a TCP process group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub name: String,
    pub addr: SocketAddr,
}

/// Membership of a TCP process group, loaded from JSON.
///
/// A worker's rank is its position in `workers`.
///
/// ```json
/// {
///   "workers": [
///     { "name": "worker0", "addr": "127.0.0.1:29500" },
///     { "name": "worker1", "addr": "127.0.0.1:29501" }
///   ],
///   "rpc_timeout_ms": 5000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub workers: Vec<WorkerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_timeout_ms: Option<u64>,
}

impl ClusterConfig {
    /// Read and validate a cluster file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RpcError::Io {
            message: format!("failed to read {}: {}", path.display(), e),
            source: Some(e),
        })?;
        let config: ClusterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers.is_empty() {
            return Err(RpcError::invalid_config("cluster has no workers"));
        }
        let mut names = HashSet::new();
        let mut addrs = HashSet::new();
        for worker in &self.workers {
            validate_worker_name(&worker.name)?;
            if !names.insert(worker.name.as_str()) {
                return Err(RpcError::invalid_config(format!(
                    "duplicate worker name '{}'",
                    worker.name
                )));
            }
            if !addrs.insert(worker.addr) {
                return Err(RpcError::invalid_config(format!(
                    "duplicate worker address {}",
                    worker.addr
                )));
            }
        }
        Ok(())
    }

    /// Rank of the named worker.
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.workers.iter().position(|w| w.name == name)
    }

    /// Name → rank map in the shape `ProcessGroupAgent::new` takes.
    pub fn name_to_rank(&self) -> std::collections::HashMap<String, usize> {
        self.workers
            .iter()
            .enumerate()
            .map(|(rank, w)| (w.name.clone(), rank))
            .collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.workers.iter().map(|w| w.addr).collect()
    }

    pub fn agent_options(&self) -> AgentOptions {
        match self.rpc_timeout_ms {
            Some(ms) => AgentOptions::default().with_rpc_timeout(Duration::from_millis(ms)),
            None => AgentOptions::default(),
        }
    }
}
