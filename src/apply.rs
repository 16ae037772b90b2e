//! Idempotent create/delete
//!
//! "Already exists" on create and "not found" on delete are the steady
//! states a fixture expects after a previous run crashed or a teardown was
//! repeated, so neither is reported as an error.

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use tracing::{debug, info};

use crate::cluster::{ClusterApi, ClusterError};
use crate::resource::{resource_id, ObjectError, ResourceId};
use crate::retry::Backoff;

/// Bound on one create or delete, retries included
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Error from [`Applier::apply`]
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("cannot create {id}: {source}")]
    Cluster {
        id: ResourceId,
        #[source]
        source: ClusterError,
    },

    #[error("creating {id} timed out after {timeout:?}")]
    Timeout { id: ResourceId, timeout: Duration },

    #[error(transparent)]
    InvalidObject(#[from] ObjectError),
}

/// Error from [`Applier::remove`]
#[derive(Debug, thiserror::Error)]
pub enum RemoveError {
    #[error("cannot delete {id}: {source}")]
    Cluster {
        id: ResourceId,
        #[source]
        source: ClusterError,
    },

    #[error("deleting {id} timed out after {timeout:?}")]
    Timeout { id: ResourceId, timeout: Duration },

    #[error(transparent)]
    InvalidObject(#[from] ObjectError),
}

/// What `apply` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyExisted,
}

/// What `remove` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    Deleted,
    AlreadyAbsent,
}

/// Creates and deletes objects, tolerating leftover or missing state
#[derive(Clone)]
pub struct Applier {
    cluster: Arc<dyn ClusterApi>,
    timeout: Duration,
    backoff: Backoff,
}

impl Applier {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            timeout: DEFAULT_OPERATION_TIMEOUT,
            backoff: Backoff::default(),
        }
    }

    /// Set the per-operation timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy for transient errors
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Create `obj`; an existing object with the same identity is success
    pub async fn apply(&self, obj: &DynamicObject) -> Result<Applied, ApplyError> {
        let id = resource_id(obj)?;
        let attempt = self.backoff.retry(|| self.cluster.create(obj));

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(_)) => {
                info!(resource = %id, "Created");
                Ok(Applied::Created)
            }
            Ok(Err(e)) if e.is_already_exists() => {
                debug!(resource = %id, "Already exists");
                Ok(Applied::AlreadyExisted)
            }
            Ok(Err(source)) => Err(ApplyError::Cluster { id, source }),
            Err(_) => Err(ApplyError::Timeout {
                id,
                timeout: self.timeout,
            }),
        }
    }

    /// Delete `obj`; an absent object is success
    pub async fn remove(&self, obj: &DynamicObject) -> Result<Removed, RemoveError> {
        let id = resource_id(obj)?;
        let attempt = self.backoff.retry(|| self.cluster.delete(&id));

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => {
                info!(resource = %id, "Deleted");
                Ok(Removed::Deleted)
            }
            Ok(Err(e)) if e.is_not_found() => {
                debug!(resource = %id, "Already absent");
                Ok(Removed::AlreadyAbsent)
            }
            Ok(Err(source)) => Err(RemoveError::Cluster { id, source }),
            Err(_) => Err(RemoveError::Timeout {
                id,
                timeout: self.timeout,
            }),
        }
    }
}
