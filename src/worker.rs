//! Worker assembly
//!
//! A worker is the unit of schedulable capacity: one storage root with its
//! metadata store, content store, snapshot tree, lease registry, executor
//! and background garbage collector. Construction either yields a complete
//! worker or fails as a whole.

use crate::config::WorkerConfig;
use crate::content::ContentStore;
use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::executor::{Executor, ExecutorFactory, ExecutorOptions, NetworkProvider};
use crate::gc::{GarbageCollector, GcJournal, GcStats, GcTrigger, Throttle};
use crate::index::Index;
use crate::lease::{expiry_from_secs, LeaseRegistry};
use crate::metadata::MetadataStore;
use crate::snapshot::{SnapshotTree, SnapshotterFactory};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

pub const LABEL_EXECUTOR: &str = "io.layerkeep.worker.executor";
pub const LABEL_SNAPSHOTTER: &str = "io.layerkeep.worker.snapshotter";
pub const LABEL_HOSTNAME: &str = "io.layerkeep.worker.hostname";

const WORKER_ID_FILE: &str = "workerid";

/// A fully assembled worker
pub struct Worker {
    id: String,
    labels: BTreeMap<String, String>,
    root: PathBuf,
    metadata: Arc<MetadataStore>,
    executor: Arc<dyn Executor>,
    snapshots: SnapshotTree,
    content: ContentStore,
    leases: LeaseRegistry,
    collector: Arc<GarbageCollector>,
    trigger: GcTrigger,
    _throttle: Throttle,
}

impl Worker {
    /// Assemble the worker rooted at `<config.root>/oci-<snapshotter>`
    pub async fn open(
        config: &WorkerConfig,
        snapshotters: &SnapshotterFactory,
        executors: &dyn ExecutorFactory,
    ) -> LayerkeepResult<Self> {
        let root = config.root.join(format!("oci-{}", snapshotters.name()));

        create_root(&root)
            .await
            .map_err(|e| LayerkeepError::construction("creating worker root", e))?;

        let metadata = MetadataStore::open(&root.join("metadata.json"))
            .await
            .map(Arc::new)
            .map_err(|e| LayerkeepError::construction("opening metadata store", e))?;

        let network = NetworkProvider::from_config(&config.executor.network)
            .map_err(|e| LayerkeepError::construction("resolving network provider", e))?;
        debug!("Using {} network provider", network.name());

        let executor = executors
            .create(ExecutorOptions::from_config(
                root.join("executor"),
                &config.executor,
                network,
            ))
            .map_err(|e| LayerkeepError::construction("creating executor", e))?;

        let driver = snapshotters
            .create(&root.join("snapshots"))
            .map_err(|e| LayerkeepError::construction("initializing snapshotter", e))?;

        let index = Index::open(&root.join("index.json"))
            .await
            .map(Arc::new)
            .map_err(|e| LayerkeepError::construction("opening index", e))?;

        let content = ContentStore::open(&root.join("content"), index.clone(), metadata.clone())
            .await
            .map_err(|e| LayerkeepError::construction("opening content store", e))?;

        let default_expiry = config
            .lease
            .default_expiry_secs
            .map(expiry_from_secs)
            .transpose()
            .map_err(|e| LayerkeepError::construction("reading lease defaults", e))?;

        let trigger = GcTrigger::new();
        let snapshots = SnapshotTree::new(driver, index.clone(), metadata.clone(), trigger.clone());
        let leases = LeaseRegistry::new(index.clone(), default_expiry, trigger.clone());

        let collector = Arc::new(
            GarbageCollector::new(
                index,
                metadata.clone(),
                content.clone(),
                snapshots.clone(),
                leases.clone(),
                GcJournal::new(root.join("gc.log"), config.gc.journal),
            )
            .with_deadline(
                (config.gc.max_cycle_secs > 0)
                    .then(|| Duration::from_secs(config.gc.max_cycle_secs)),
            ),
        );

        let throttle = {
            let collector = collector.clone();
            Throttle::spawn(
                &trigger,
                Duration::from_millis(config.gc.interval_ms),
                move || {
                    let collector = collector.clone();
                    async move { collector.collect_logged().await }
                },
            )
        };

        let id = worker_id(&root)
            .await
            .map_err(|e| LayerkeepError::construction("reading worker id", e))?;
        let labels = merge_labels(
            base_labels(executor.name(), snapshotters.name()),
            &config.labels,
        );

        info!("Worker {} ready at {}", id, root.display());

        Ok(Self {
            id,
            labels,
            root,
            metadata,
            executor,
            snapshots,
            content,
            leases,
            collector,
            trigger,
            _throttle: throttle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Worker storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn snapshots(&self) -> &SnapshotTree {
        &self.snapshots
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    /// Handle for requesting a throttled collection
    pub fn gc_trigger(&self) -> &GcTrigger {
        &self.trigger
    }

    /// Run a collection cycle immediately, bypassing the throttle
    pub async fn collect_now(&self) -> LayerkeepResult<GcStats> {
        self.collector.collect().await
    }
}

async fn create_root(root: &Path) -> LayerkeepResult<()> {
    fs::create_dir_all(root)
        .await
        .map_err(|e| LayerkeepError::io(format!("creating {}", root.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        fs::set_permissions(root, perms).await.map_err(|e| {
            LayerkeepError::io(format!("setting permissions on {}", root.display()), e)
        })?;
    }

    Ok(())
}

/// Stable worker id for `root`
///
/// Derived from the canonical root path on first use and persisted, so a
/// worker keeps its id across restarts even if the path is later reached
/// through a different symlink.
pub async fn worker_id(root: &Path) -> LayerkeepResult<String> {
    let path = root.join(WORKER_ID_FILE);
    match fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(LayerkeepError::io(format!("reading {}", path.display()), e)),
    }

    let canonical = fs::canonicalize(root)
        .await
        .map_err(|e| LayerkeepError::io(format!("resolving {}", root.display()), e))?;
    let digest = Digest::from_bytes(canonical.to_string_lossy().as_bytes());
    let id = digest.hex()[..32].to_string();

    crate::persist::write_atomic(&path, id.as_bytes()).await?;
    debug!("Assigned worker id {} to {}", id, root.display());
    Ok(id)
}

/// Labels every worker carries
pub fn base_labels(executor: &str, snapshotter: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_EXECUTOR.to_string(), executor.to_string()),
        (LABEL_SNAPSHOTTER.to_string(), snapshotter.to_string()),
    ]);
    if let Some(host) = hostname() {
        labels.insert(LABEL_HOSTNAME.to_string(), host);
    }
    labels
}

/// Merge caller labels over `base`; caller keys win
pub fn merge_labels(
    mut base: BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    base.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    base
}

fn hostname() -> Option<String> {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}
