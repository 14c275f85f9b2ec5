//! Error types for layerkeep
//!
//! All modules use `LayerkeepResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for layerkeep operations
pub type LayerkeepResult<T> = Result<T, LayerkeepError>;

/// Kind of resource named in an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Blob,
    Snapshot,
    Lease,
    Record,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Lease => write!(f, "lease"),
            Self::Record => write!(f, "record"),
        }
    }
}

/// All errors that can occur in layerkeep
#[derive(Error, Debug)]
pub enum LayerkeepError {
    // Construction errors
    #[error("Worker construction failed at {stage}: {source}")]
    Construction {
        stage: String,
        #[source]
        source: Box<LayerkeepError>,
    },

    #[error("Unknown snapshotter: {0}")]
    UnknownSnapshotter(String),

    #[error("Invalid network options: {0}")]
    NetworkOptions(String),

    // Lookup errors
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(String),

    #[error("Metadata record not found: {0}")]
    RecordNotFound(String),

    // Consistency errors
    #[error("{kind} {id} is in use: {reason}")]
    InUse {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    #[error("Snapshot {snapshot} references missing parent {parent}")]
    BrokenChain { snapshot: String, parent: String },

    #[error("Snapshot already exists: {0}")]
    SnapshotExists(String),

    #[error("Snapshot {0} is not committed")]
    SnapshotNotCommitted(String),

    #[error("Snapshot {0} is not active")]
    SnapshotNotActive(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Lease expiry out of range: {0}")]
    InvalidExpiry(String),

    // Garbage collection
    #[error("GC cycle failed: {0}")]
    GcCycle(String),

    // Executor
    #[error("Executor error: {0}")]
    Executor(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LayerkeepError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an error raised while assembling a worker
    pub fn construction(stage: impl Into<String>, source: LayerkeepError) -> Self {
        Self::Construction {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// Create an in-use error
    pub fn in_use(kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InUse {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error reports an absent resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlobNotFound(_)
                | Self::SnapshotNotFound(_)
                | Self::LeaseNotFound(_)
                | Self::RecordNotFound(_)
        )
    }

    /// Check if the error reports a referenced or non-leaf resource
    pub fn is_in_use(&self) -> bool {
        matches!(self, Self::InUse { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownSnapshotter(_) => Some("Supported snapshotters: native"),
            Self::BrokenChain { .. } => {
                Some("The index is inconsistent; inspect index.json before running gc again")
            }
            Self::InUse { .. } => Some("Release the covering leases first: layerkeep lease list"),
            Self::ConfigInvalid { .. } => Some("Check the config file with: layerkeep info"),
            Self::InvalidExpiry(_) => Some("Lower lease.default_expiry_secs in the config file"),
            _ => None,
        }
    }
}
