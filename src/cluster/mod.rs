//! Cluster API boundary
//!
//! Everything that talks to a cluster goes through [`ClusterApi`]:
//! - [`KubeCluster`]: a live cluster reached through `kube::Client`
//! - [`MemoryCluster`]: an in-memory store for exercising scenarios without one
//!
//! Both report missing and duplicate objects as typed errors so callers can
//! treat them as steady states rather than failures.

use async_trait::async_trait;
use kube::api::DynamicObject;

use crate::resource::{ObjectError, ResourceId};

mod live;
mod memory;

pub use live::KubeCluster;
pub use memory::{Call, MemoryCluster, Operation};

/// Error type for cluster operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(ResourceId),

    #[error("{0} already exists")]
    AlreadyExists(ResourceId),

    #[error("{0} was modified concurrently")]
    Conflict(ResourceId),

    #[error("{id}: {message}")]
    Rejected { id: ResourceId, message: String },

    #[error("{id}: transient failure: {message}")]
    Transient { id: ResourceId, message: String },

    #[error("cannot resolve API for {api_version} {kind}: {message}")]
    Discovery {
        api_version: String,
        kind: String,
        message: String,
    },

    #[error("Failed to create Kubernetes client: {0}")]
    Client(String),

    #[error(transparent)]
    InvalidObject(#[from] ObjectError),
}

impl ClusterError {
    /// The object does not exist (yet)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The object was already present
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Trait for cluster API access
///
/// Each call is one round trip. Implementations must return
/// [`ClusterError::NotFound`] and [`ClusterError::AlreadyExists`] for those
/// conditions rather than a generic rejection.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create an object; fails with `AlreadyExists` if its identity is taken
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Fetch the current state of an object
    async fn get(&self, id: &ResourceId) -> Result<DynamicObject, ClusterError>;

    /// Replace an existing object
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    /// Delete an object; fails with `NotFound` if it is absent
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;

    /// Implementation name for logs
    fn name(&self) -> &'static str;
}
