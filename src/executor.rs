//! Executor capability
//!
//! The process runner is an external collaborator. The worker only builds
//! its options, resolves the network provider, and hands the resulting
//! handle to the scheduler.

use crate::config::{
    DnsConfig, ExecutorConfig, IdentityMapping, NetworkConfig, NetworkMode, ProcessMode,
};
use crate::error::{LayerkeepError, LayerkeepResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A build step to run
#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    /// Root filesystem, usually a snapshot mount path
    pub rootfs: PathBuf,
}

/// Runs build steps inside sandboxes
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor kind, recorded in worker labels
    fn name(&self) -> &str;

    /// Run a process to completion and return its exit code
    async fn run(&self, request: &ProcessRequest) -> LayerkeepResult<i32>;
}

/// Resolved network provider for sandboxes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkProvider {
    Host,
    None,
    Cni {
        config_path: PathBuf,
        binary_dir: Option<PathBuf>,
    },
}

impl NetworkProvider {
    /// Resolve the configured mode
    ///
    /// `auto` selects CNI when a config file is present, host otherwise.
    pub fn from_config(config: &NetworkConfig) -> LayerkeepResult<Self> {
        let cni = |path: &PathBuf| Self::Cni {
            config_path: path.clone(),
            binary_dir: config.cni_binary_dir.clone(),
        };

        match config.mode {
            NetworkMode::Host => Ok(Self::Host),
            NetworkMode::None => Ok(Self::None),
            NetworkMode::Cni => match &config.cni_config_path {
                Some(path) if path.exists() => Ok(cni(path)),
                Some(path) => Err(LayerkeepError::NetworkOptions(format!(
                    "CNI config {} does not exist",
                    path.display()
                ))),
                None => Err(LayerkeepError::NetworkOptions(
                    "network mode cni requires cni_config_path".to_string(),
                )),
            },
            NetworkMode::Auto => match &config.cni_config_path {
                Some(path) if path.exists() => Ok(cni(path)),
                _ => {
                    debug!("No CNI config found, using host networking");
                    Ok(Self::Host)
                }
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::None => "none",
            Self::Cni { .. } => "cni",
        }
    }
}

/// Options handed to an executor factory
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Executor state directory
    pub root: PathBuf,
    pub rootless: bool,
    pub process_mode: ProcessMode,
    pub identity_mapping: Option<IdentityMapping>,
    pub dns: Option<DnsConfig>,
    pub network: NetworkProvider,
}

impl ExecutorOptions {
    pub fn from_config(
        root: PathBuf,
        config: &ExecutorConfig,
        network: NetworkProvider,
    ) -> Self {
        Self {
            root,
            rootless: config.rootless,
            process_mode: config.process_mode,
            identity_mapping: config.identity_mapping.clone(),
            dns: config.dns.clone(),
            network,
        }
    }
}

/// Constructs the executor for a worker
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, options: ExecutorOptions) -> LayerkeepResult<Arc<dyn Executor>>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(ExecutorOptions) -> LayerkeepResult<Arc<dyn Executor>> + Send + Sync,
{
    fn create(&self, options: ExecutorOptions) -> LayerkeepResult<Arc<dyn Executor>> {
        self(options)
    }
}

/// Executor for maintenance tooling that never runs build steps
pub struct StorageOnlyExecutor {
    options: ExecutorOptions,
}

impl StorageOnlyExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self { options }
    }

    /// Factory creating the executor state directory and nothing else
    pub fn factory() -> impl ExecutorFactory {
        |options: ExecutorOptions| -> LayerkeepResult<Arc<dyn Executor>> {
            std::fs::create_dir_all(&options.root).map_err(|e| {
                LayerkeepError::io(format!("creating {}", options.root.display()), e)
            })?;
            Ok(Arc::new(StorageOnlyExecutor::new(options)) as Arc<dyn Executor>)
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }
}

#[async_trait]
impl Executor for StorageOnlyExecutor {
    fn name(&self) -> &str {
        "oci"
    }

    async fn run(&self, request: &ProcessRequest) -> LayerkeepResult<i32> {
        Err(LayerkeepError::Executor(format!(
            "storage-only worker cannot run {:?}",
            request.args
        )))
    }
}
