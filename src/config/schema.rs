//! Configuration schema for layerkeep
//!
//! Configuration is stored at `~/.config/layerkeep/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Storage root; the worker lives in `<root>/oci-<snapshotter>`
    pub root: PathBuf,

    /// Snapshot driver name
    pub snapshotter: String,

    /// Executor settings
    pub executor: ExecutorConfig,

    /// Extra worker labels, overriding the built-in ones
    pub labels: BTreeMap<String, String>,

    /// Garbage collection settings
    pub gc: GcConfig,

    /// Lease defaults
    pub lease: LeaseConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("layerkeep"),
            snapshotter: "native".to_string(),
            executor: ExecutorConfig::default(),
            labels: BTreeMap::new(),
            gc: GcConfig::default(),
            lease: LeaseConfig::default(),
        }
    }
}

/// How build processes are isolated from each other
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessMode {
    /// Each process gets its own PID namespace
    #[default]
    Sandbox,
    /// Processes share the host PID namespace
    NoSandbox,
}

/// One contiguous id range mapped into the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// User namespace mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityMapping {
    pub uids: Vec<IdRange>,
    pub gids: Vec<IdRange>,
}

impl IdentityMapping {
    /// Host uid/gid that container root maps to
    pub fn root_pair(&self) -> Option<(u32, u32)> {
        let host = |ranges: &[IdRange]| {
            ranges
                .iter()
                .find(|r| r.container_id == 0 && r.size > 0)
                .map(|r| r.host_id)
        };
        Some((host(&self.uids)?, host(&self.gids)?))
    }
}

/// DNS settings written into build sandboxes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub nameservers: Vec<String>,
    pub options: Vec<String>,
    pub search_domains: Vec<String>,
}

/// Network provider selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// CNI when configured, host networking otherwise
    #[default]
    Auto,
    Host,
    None,
    Cni,
}

/// Network options for build sandboxes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub cni_config_path: Option<PathBuf>,
    pub cni_binary_dir: Option<PathBuf>,
}

/// Executor configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Run without root privileges
    pub rootless: bool,
    pub process_mode: ProcessMode,
    pub identity_mapping: Option<IdentityMapping>,
    pub dns: Option<DnsConfig>,
    pub network: NetworkConfig,
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Minimum time between collection cycles
    pub interval_ms: u64,

    /// Deadline for a single cycle (0 = none)
    pub max_cycle_secs: u64,

    /// Append cycle results to gc.log
    pub journal: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_cycle_secs: 0,
            journal: true,
        }
    }
}

/// Lease defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Expiry applied to new leases (none = leases live until released)
    pub default_expiry_secs: Option<u64>,
}
