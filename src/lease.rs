//! Lease registry
//!
//! A lease is the only thing that keeps a blob, snapshot or metadata
//! record alive. Each registry call is a single index transaction, so a
//! reachability scan sees a lease either entirely before or entirely after
//! a change, never half released.

use crate::digest::Digest;
use crate::error::{LayerkeepError, LayerkeepResult};
use crate::gc::GcTrigger;
use crate::index::{Index, IndexState, Lease, RefKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Options for a new lease
#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    /// Lease lifetime; `None` uses the registry default
    pub expires_in: Option<Duration>,
    pub labels: BTreeMap<String, String>,
}

impl LeaseOptions {
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_in = Some(ttl);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Tracks leases and their references
#[derive(Clone)]
pub struct LeaseRegistry {
    index: Arc<Index>,
    default_expiry: Option<Duration>,
    gc: GcTrigger,
}

impl LeaseRegistry {
    pub fn new(index: Arc<Index>, default_expiry: Option<Duration>, gc: GcTrigger) -> Self {
        Self {
            index,
            default_expiry,
            gc,
        }
    }

    /// Create a lease in `namespace`
    pub async fn create(&self, namespace: &str) -> LayerkeepResult<String> {
        self.create_with(namespace, LeaseOptions::default()).await
    }

    /// Create a lease with explicit options
    pub async fn create_with(
        &self,
        namespace: &str,
        options: LeaseOptions,
    ) -> LayerkeepResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = match options.expires_in.or(self.default_expiry) {
            Some(ttl) => Some(now.checked_add_signed(ttl).ok_or_else(|| {
                LayerkeepError::InvalidExpiry(format!("{}s", ttl.num_seconds()))
            })?),
            None => None,
        };

        let lease = Lease {
            id: id.clone(),
            namespace: namespace.to_string(),
            created_at: now,
            expires_at,
            labels: options.labels,
            resources: BTreeMap::new(),
        };

        self.index
            .update(|state| {
                state.leases.insert(lease.id.clone(), lease);
                Ok(())
            })
            .await?;

        debug!("Created lease {} in namespace {}", id, namespace);
        Ok(id)
    }

    /// Add a reference to `resource` under `lease`
    ///
    /// Blobs and snapshots must exist. Record keys are not checked since a
    /// build may lease a cache key before writing its record.
    pub async fn add_reference(
        &self,
        lease: &str,
        kind: RefKind,
        resource: &str,
    ) -> LayerkeepResult<()> {
        self.index
            .update(|state| {
                live_lease(state, lease)?;
                match kind {
                    RefKind::Blob => {
                        let digest: Digest = resource.parse()?;
                        if !state.blobs.contains_key(&digest) {
                            return Err(LayerkeepError::BlobNotFound(resource.to_string()));
                        }
                    }
                    RefKind::Snapshot => {
                        if !state.snapshots.contains_key(resource) {
                            return Err(LayerkeepError::SnapshotNotFound(resource.to_string()));
                        }
                    }
                    RefKind::Record => {}
                }

                state.touch(kind, resource);
                if let Some(l) = state.leases.get_mut(lease) {
                    l.resources
                        .entry(kind)
                        .or_default()
                        .insert(resource.to_string());
                }
                Ok(())
            })
            .await?;

        debug!("Lease {} now references {} {}", lease, kind, resource);
        Ok(())
    }

    /// Drop one reference; returns whether the lease held it
    pub async fn remove_reference(
        &self,
        lease: &str,
        kind: RefKind,
        resource: &str,
    ) -> LayerkeepResult<bool> {
        let removed = self
            .index
            .update_if_changed(|state| {
                let l = state
                    .leases
                    .get_mut(lease)
                    .ok_or_else(|| LayerkeepError::LeaseNotFound(lease.to_string()))?;
                let removed = l
                    .resources
                    .get_mut(&kind)
                    .is_some_and(|ids| ids.remove(resource));
                l.resources.retain(|_, ids| !ids.is_empty());
                Ok((removed, removed))
            })
            .await?;

        if removed {
            debug!("Lease {} released {} {}", lease, kind, resource);
            self.gc.trigger();
        }
        Ok(removed)
    }

    /// Release a lease and every reference it holds
    pub async fn release(&self, lease: &str) -> LayerkeepResult<()> {
        let released = self
            .index
            .update(|state| {
                state
                    .leases
                    .remove(lease)
                    .ok_or_else(|| LayerkeepError::LeaseNotFound(lease.to_string()))
            })
            .await?;

        info!(
            "Released lease {} ({} references)",
            lease,
            released.reference_count()
        );
        self.gc.trigger();
        Ok(())
    }

    /// Look up a lease
    pub async fn get(&self, lease: &str) -> LayerkeepResult<Lease> {
        self.index
            .read()
            .await
            .leases
            .get(lease)
            .cloned()
            .ok_or_else(|| LayerkeepError::LeaseNotFound(lease.to_string()))
    }

    /// Ids of all leases
    pub async fn list_leases(&self) -> BTreeSet<String> {
        self.index.read().await.leases.keys().cloned().collect()
    }

    /// All leases, oldest first
    pub async fn list(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.index.read().await.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        leases
    }

    /// Leases in one namespace, oldest first
    pub async fn list_in(&self, namespace: &str) -> Vec<Lease> {
        let mut leases = self.list().await;
        leases.retain(|l| l.namespace == namespace);
        leases
    }

    /// Drop leases whose expiry has passed, returning how many were removed
    pub async fn expire(&self, now: DateTime<Utc>) -> LayerkeepResult<usize> {
        if !self
            .index
            .read()
            .await
            .leases
            .values()
            .any(|l| l.is_expired(now))
        {
            return Ok(0);
        }

        let expired = self
            .index
            .update(|state| {
                let before = state.leases.len();
                state.leases.retain(|_, l| !l.is_expired(now));
                Ok(before - state.leases.len())
            })
            .await?;

        if expired > 0 {
            info!("Expired {} lease(s)", expired);
        }
        Ok(expired)
    }
}

/// Lease lifetime of `secs` seconds
///
/// Fails when a lease created now would expire past the representable
/// date range.
pub fn expiry_from_secs(secs: u64) -> LayerkeepResult<Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
        .ok_or_else(|| LayerkeepError::InvalidExpiry(format!("{}s", secs)))
}

fn live_lease<'a>(state: &'a IndexState, lease: &str) -> LayerkeepResult<&'a Lease> {
    state
        .leases
        .get(lease)
        .filter(|l| !l.is_expired(Utc::now()))
        .ok_or_else(|| LayerkeepError::LeaseNotFound(lease.to_string()))
}
